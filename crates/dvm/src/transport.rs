//! Publish/subscribe transport seam and an in-process relay.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, Filter};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{DvmError, Result};

/// Per-subscription delivery queue used by [`MemoryRelay`].
const SUBSCRIPTION_QUEUE: usize = 1024;

/// Signed-event pub/sub network as seen by the job client.
///
/// Connection pooling and relay selection live behind this trait. Delivery is
/// at-least-once with no ordering guarantee across relays.
#[async_trait]
pub trait DvmTransport: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;

    /// Open a live subscription. Stored matching events are delivered first.
    async fn subscribe(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
        relay_hints: &[String],
    ) -> Result<mpsc::Receiver<Event>>;

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()>;

    /// One-shot query for stored events.
    async fn query(&self, filters: Vec<Filter>, timeout: Duration) -> Result<Vec<Event>>;

    fn relays(&self) -> Vec<String>;
}

struct LiveSubscription {
    filters: Vec<Filter>,
    relay_hints: Vec<String>,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct RelayState {
    events: Vec<Event>,
    subscriptions: HashMap<String, LiveSubscription>,
    published: usize,
    unsubscribes: usize,
    fail_publish: Option<String>,
    fail_query: Option<String>,
}

/// A single relay held in memory.
///
/// Stores every published event (deduplicated by id), replays matches to new
/// subscriptions, and fans new events out to live subscriptions in publish
/// order. Failures can be injected to exercise error paths.
pub struct MemoryRelay {
    url: String,
    state: Mutex<RelayState>,
}

impl MemoryRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Mutex::new(RelayState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store and deliver several events under one lock, the way a relay
    /// flushes a batch to a socket.
    pub fn publish_batch(&self, events: Vec<Event>) {
        let mut state = self.state();
        for event in events {
            Self::accept(&mut state, event);
        }
    }

    /// Deliver an event to live subscriptions again without storing it,
    /// as a second relay would.
    pub fn redeliver(&self, event: &Event) {
        let state = self.state();
        Self::fan_out(&state, event);
    }

    /// Make every subsequent publish fail with `reason` (`None` clears it).
    pub fn fail_publishes(&self, reason: Option<&str>) {
        self.state().fail_publish = reason.map(str::to_string);
    }

    pub fn fail_queries(&self, reason: Option<&str>) {
        self.state().fail_query = reason.map(str::to_string);
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn published_count(&self) -> usize {
        self.state().published
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.state().unsubscribes
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state().subscriptions.len()
    }

    pub fn relay_hints(&self, subscription_id: &str) -> Option<Vec<String>> {
        self.state()
            .subscriptions
            .get(subscription_id)
            .map(|s| s.relay_hints.clone())
    }

    fn accept(state: &mut RelayState, event: Event) {
        state.published += 1;
        if state.events.iter().any(|e| e.id == event.id) {
            debug!(event_id = %event.id, "duplicate event ignored by relay");
            return;
        }
        Self::fan_out(state, &event);
        state.events.push(event);
    }

    fn fan_out(state: &RelayState, event: &Event) {
        for (id, sub) in &state.subscriptions {
            if sub.filters.iter().any(|f| f.matches(event)) {
                if let Err(err) = sub.tx.try_send(event.clone()) {
                    warn!(subscription = %id, error = %err, "dropping event for subscriber");
                }
            }
        }
    }
}

#[async_trait]
impl DvmTransport for MemoryRelay {
    async fn publish(&self, event: Event) -> Result<()> {
        let mut state = self.state();
        if let Some(reason) = &state.fail_publish {
            return Err(DvmError::Network(format!("{}: {}", self.url, reason)));
        }
        Self::accept(&mut state, event);
        Ok(())
    }

    async fn subscribe(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
        relay_hints: &[String],
    ) -> Result<mpsc::Receiver<Event>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE);
        let mut state = self.state();

        let mut stored: Vec<&Event> = state
            .events
            .iter()
            .filter(|e| filters.iter().any(|f| f.matches(e)))
            .collect();
        stored.sort_by_key(|e| e.created_at);
        for event in stored {
            if tx.try_send(event.clone()).is_err() {
                break;
            }
        }

        state.subscriptions.insert(
            subscription_id.to_string(),
            LiveSubscription {
                filters,
                relay_hints: relay_hints.to_vec(),
                tx,
            },
        );
        debug!(subscription = %subscription_id, "subscription opened");
        Ok(rx)
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let mut state = self.state();
        if state.subscriptions.remove(subscription_id).is_some() {
            state.unsubscribes += 1;
        }
        Ok(())
    }

    async fn query(&self, filters: Vec<Filter>, _timeout: Duration) -> Result<Vec<Event>> {
        let state = self.state();
        if let Some(reason) = &state.fail_query {
            return Err(DvmError::Network(format!("{}: {}", self.url, reason)));
        }
        let limit = filters
            .iter()
            .filter_map(|f| f.limit)
            .max()
            .map(|l| l as usize)
            .unwrap_or(usize::MAX);
        Ok(state
            .events
            .iter()
            .filter(|e| filters.iter().any(|f| f.matches(e)))
            .take(limit)
            .cloned()
            .collect())
    }

    fn relays(&self) -> Vec<String> {
        vec![self.url.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventTemplate, Keypair};

    fn note(keys: &Keypair, kind: u16, created_at: u64, tags: Vec<Vec<String>>) -> Event {
        keys.sign(&EventTemplate {
            created_at,
            kind,
            tags,
            content: format!("{}-{}", kind, created_at),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_stored_events_replayed_on_subscribe() {
        let relay = MemoryRelay::new("memory://relay");
        let keys = Keypair::generate();
        relay.publish(note(&keys, 7000, 20, vec![])).await.unwrap();
        relay.publish(note(&keys, 7000, 10, vec![])).await.unwrap();
        relay.publish(note(&keys, 1, 30, vec![])).await.unwrap();

        let mut rx = relay
            .subscribe("s1", vec![Filter::new().kinds([7000])], &[])
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().created_at, 10);
        assert_eq!(rx.recv().await.unwrap().created_at, 20);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_live_delivery_and_unsubscribe() {
        let relay = MemoryRelay::new("memory://relay");
        let keys = Keypair::generate();
        let mut rx = relay
            .subscribe("s1", vec![Filter::new().kinds([7000])], &["wss://hint".to_string()])
            .await
            .unwrap();
        assert_eq!(relay.relay_hints("s1").unwrap(), vec!["wss://hint".to_string()]);

        relay.publish(note(&keys, 7000, 1, vec![])).await.unwrap();
        assert!(rx.recv().await.is_some());

        relay.unsubscribe("s1").await.unwrap();
        relay.unsubscribe("s1").await.unwrap();
        assert_eq!(relay.unsubscribe_count(), 1);
        assert_eq!(relay.active_subscriptions(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_publish_stored_once() {
        let relay = MemoryRelay::new("memory://relay");
        let event = note(&Keypair::generate(), 1, 1, vec![]);
        relay.publish(event.clone()).await.unwrap();
        relay.publish(event).await.unwrap();
        assert_eq!(relay.events().len(), 1);
        assert_eq!(relay.published_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let relay = MemoryRelay::new("memory://relay");
        relay.fail_publishes(Some("offline"));
        let err = relay
            .publish(note(&Keypair::generate(), 1, 1, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, DvmError::Network(msg) if msg.contains("offline")));

        relay.fail_queries(Some("timeout"));
        assert!(relay.query(vec![Filter::new()], Duration::from_secs(1)).await.is_err());
    }
}
