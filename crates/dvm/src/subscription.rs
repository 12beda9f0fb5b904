//! Subscription multiplexer: one transport subscription per job, with
//! dedup, decryption and classification in front of a single handler.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use nostr::{
    Event, Filter, JOB_RESULT_KIND_MAX, JOB_RESULT_KIND_MIN, JobFeedback, JobResult,
    KIND_JOB_FEEDBACK, is_hex_key, is_job_feedback_kind, is_job_result_kind,
};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};

use crate::correlation::{Received, decrypt_from};
use crate::error::{DvmError, Result};
use crate::metrics::{MetricEvent, MetricsSink, NoopMetrics};
use crate::transport::DvmTransport;

/// A classified, decrypted message about one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobUpdate {
    Result(Received<JobResult>),
    Feedback(Received<JobFeedback>),
}

impl JobUpdate {
    pub fn event_id(&self) -> &str {
        match self {
            JobUpdate::Result(r) => &r.event_id,
            JobUpdate::Feedback(f) => &f.event_id,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            JobUpdate::Result(r) => &r.payload.request_id,
            JobUpdate::Feedback(f) => &f.payload.request_id,
        }
    }
}

/// Receives the updates of one subscription, in arrival order.
#[async_trait]
pub trait JobUpdateHandler: Send + Sync {
    async fn on_update(&self, update: JobUpdate);
}

#[async_trait]
impl JobUpdateHandler for mpsc::Sender<JobUpdate> {
    async fn on_update(&self, update: JobUpdate) {
        if self.send(update).await.is_err() {
            trace!("job update receiver dropped");
        }
    }
}

/// Wraps a closure as a handler.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> JobUpdateHandler for FnHandler<F>
where
    F: Fn(JobUpdate) + Send + Sync,
{
    async fn on_update(&self, update: JobUpdate) {
        (self.0)(update)
    }
}

struct CancelState {
    job_id: String,
    cancelled: AtomicBool,
    closed: AtomicBool,
    cancel_notify: Notify,
    closed_notify: Notify,
}

/// Cancels one job subscription.
///
/// `cancel` is synchronous and idempotent; the first call wins and later
/// calls (including ones racing with natural completion) are no-ops. After
/// it returns the pump starts no new delivery, though an `on_update` call
/// already in progress runs to completion. Consumers that must not observe
/// that last update check cancellation on their side, as
/// [`crate::TextStream`] does. The transport unsubscribe happens exactly
/// once, shortly after, on the pump task.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub(crate) fn new(job_id: impl Into<String>) -> Self {
        Self {
            state: Arc::new(CancelState {
                job_id: job_id.into(),
                cancelled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                cancel_notify: Notify::new(),
                closed_notify: Notify::new(),
            }),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.state.job_id
    }

    /// Returns `true` for the call that actually cancelled.
    pub fn cancel(&self) -> bool {
        if self.state.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state.cancel_notify.notify_waiters();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.cancel_notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once the underlying subscription has been torn down.
    pub async fn closed(&self) {
        loop {
            let notified = self.state.closed_notify.notified();
            if self.state.closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    fn mark_closed(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.closed_notify.notify_waiters();
    }

    fn same(&self, other: &CancelHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("job_id", &self.state.job_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// What to watch for one job.
#[derive(Debug, Clone, Default)]
pub struct JobWatch {
    pub job_id: String,
    /// Only accept events from this provider.
    pub provider_pubkey: Option<String>,
    /// Secret used to decrypt `encrypted` results and feedback.
    pub decryption_key: Option<[u8; 32]>,
    pub relay_hints: Vec<String>,
}

impl JobWatch {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Default::default()
        }
    }

    pub fn from_provider(mut self, pubkey: impl Into<String>) -> Self {
        self.provider_pubkey = Some(pubkey.into());
        self
    }

    pub fn decrypt_with(mut self, secret: [u8; 32]) -> Self {
        self.decryption_key = Some(secret);
        self
    }

    pub fn with_relay_hints(mut self, relays: Vec<String>) -> Self {
        self.relay_hints = relays;
        self
    }

    fn filters(&self) -> Vec<Filter> {
        let mut results = Filter::new()
            .kinds(JOB_RESULT_KIND_MIN..=JOB_RESULT_KIND_MAX)
            .references_events([self.job_id.clone()]);
        let mut feedback = Filter::new()
            .kinds([KIND_JOB_FEEDBACK])
            .references_events([self.job_id.clone()]);
        if let Some(provider) = &self.provider_pubkey {
            results = results.authors([provider.clone()]);
            feedback = feedback.authors([provider.clone()]);
        }
        vec![results, feedback]
    }
}

type ActiveJobs = Arc<Mutex<HashMap<String, CancelHandle>>>;

/// Owns the `job id -> CancelHandle` map and one pump task per job.
pub struct SubscriptionMultiplexer {
    transport: Arc<dyn DvmTransport>,
    metrics: Arc<dyn MetricsSink>,
    active: ActiveJobs,
}

impl SubscriptionMultiplexer {
    pub fn new(transport: Arc<dyn DvmTransport>) -> Self {
        Self {
            transport,
            metrics: Arc::new(NoopMetrics),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Subscribe to results and feedback for one job.
    ///
    /// Subscribing again to the same job replaces (and cancels) the earlier
    /// subscription.
    pub async fn subscribe_to_job_updates(
        &self,
        watch: JobWatch,
        handler: Arc<dyn JobUpdateHandler>,
    ) -> Result<CancelHandle> {
        if !is_hex_key(&watch.job_id) {
            return Err(DvmError::Validation(format!(
                "job id {:?} is not a 64 character hex event id",
                watch.job_id
            )));
        }

        let subscription_id = format!(
            "dvm-job-{}-{}",
            &watch.job_id[..12],
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let rx = self
            .transport
            .subscribe(&subscription_id, watch.filters(), &watch.relay_hints)
            .await?;

        let handle = CancelHandle::new(watch.job_id.clone());
        let replaced = lock(&self.active).insert(watch.job_id.clone(), handle.clone());
        if let Some(previous) = replaced {
            debug!(job_id = %watch.job_id, "replacing existing job subscription");
            previous.cancel();
        }
        debug!(job_id = %watch.job_id, subscription = %subscription_id, "subscribed to job updates");

        let pump = Pump {
            watch,
            subscription_id,
            transport: self.transport.clone(),
            metrics: self.metrics.clone(),
            active: self.active.clone(),
            handle: handle.clone(),
            handler,
        };
        tokio::spawn(pump.run(rx));

        Ok(handle)
    }

    /// Cancel the subscription for `job_id`, if any.
    pub fn cancel(&self, job_id: &str) -> bool {
        let handle = lock(&self.active).get(job_id).cloned();
        handle.is_some_and(|h| h.cancel())
    }

    pub fn cancel_all(&self) {
        let handles: Vec<CancelHandle> = lock(&self.active).values().cloned().collect();
        for handle in handles {
            handle.cancel();
        }
    }

    pub fn active_jobs(&self) -> Vec<String> {
        lock(&self.active).keys().cloned().collect()
    }
}

fn lock(active: &ActiveJobs) -> std::sync::MutexGuard<'_, HashMap<String, CancelHandle>> {
    active.lock().unwrap_or_else(|e| e.into_inner())
}

struct Pump {
    watch: JobWatch,
    subscription_id: String,
    transport: Arc<dyn DvmTransport>,
    metrics: Arc<dyn MetricsSink>,
    active: ActiveJobs,
    handle: CancelHandle,
    handler: Arc<dyn JobUpdateHandler>,
}

impl Pump {
    async fn run(self, mut rx: mpsc::Receiver<Event>) {
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = self.handle.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => {
                        debug!(job_id = %self.watch.job_id, "transport closed job subscription");
                        break;
                    }
                },
            };

            if !seen.insert(event.id.clone()) {
                trace!(event_id = %event.id, "duplicate delivery dropped");
                continue;
            }

            let Some(update) = self.classify(&event) else {
                continue;
            };
            if self.handle.is_cancelled() {
                break;
            }
            self.handler.on_update(update).await;
        }

        self.teardown().await;
    }

    fn classify(&self, event: &Event) -> Option<JobUpdate> {
        // relays may deliver events for other jobs on a shared connection
        if !event.references_event(&self.watch.job_id) {
            debug!(event_id = %event.id, job_id = %self.watch.job_id, "event for another job dropped");
            return None;
        }
        if let Some(provider) = &self.watch.provider_pubkey {
            if &event.pubkey != provider {
                debug!(event_id = %event.id, author = %event.pubkey, "event from unexpected author dropped");
                return None;
            }
        }

        let content = |encrypted: bool| {
            if encrypted {
                self.decrypt(event)
            } else {
                Some(event.content.clone())
            }
        };

        if is_job_result_kind(event.kind) {
            let mut result = JobResult::from_event(event)
                .map_err(|err| warn!(event_id = %event.id, error = %err, "malformed job result dropped"))
                .ok()?;
            result.content = content(result.encrypted)?;
            Some(JobUpdate::Result(Received::wrap(event, result)))
        } else if is_job_feedback_kind(event.kind) {
            let mut feedback = JobFeedback::from_event(event)
                .map_err(|err| warn!(event_id = %event.id, error = %err, "malformed job feedback dropped"))
                .ok()?;
            feedback.content = content(feedback.encrypted)?;
            Some(JobUpdate::Feedback(Received::wrap(event, feedback)))
        } else {
            None
        }
    }

    fn decrypt(&self, event: &Event) -> Option<String> {
        match decrypt_from(self.watch.decryption_key.as_ref(), &event.pubkey, &event.content) {
            Ok(content) => Some(content),
            Err(err) => {
                warn!(event_id = %event.id, job_id = %self.watch.job_id, error = %err, "could not decrypt job event");
                self.metrics.record(MetricEvent::DecryptionFailed {
                    job_id: self.watch.job_id.clone(),
                    event_id: event.id.clone(),
                    timestamp: Utc::now(),
                });
                None
            }
        }
    }

    async fn teardown(self) {
        self.handle.cancel();
        if let Err(err) = self.transport.unsubscribe(&self.subscription_id).await {
            warn!(subscription = %self.subscription_id, error = %err, "unsubscribe failed");
        }
        {
            let mut active = lock(&self.active);
            if active
                .get(&self.watch.job_id)
                .is_some_and(|h| h.same(&self.handle))
            {
                active.remove(&self.watch.job_id);
            }
        }
        self.handle.mark_closed();
        debug!(job_id = %self.watch.job_id, "job subscription closed");
    }
}
