//! Event correlation: building signed job requests and finding their results.
//!
//! A job is identified by the id of its signed request event. Results and
//! feedback point back at it with an `e` tag; since relays neither order nor
//! deduplicate across each other, "the" result is always chosen by
//! `created_at` rather than by arrival.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use nostr::nip04;
use nostr::{
    Event, EventTemplate, Filter, InputType, JOB_RESULT_KIND_MAX, JOB_RESULT_KIND_MIN, JobInput,
    JobParam, JobRequest, JobResult, Keypair, is_hex_key, is_job_request_kind, sort_events,
};
use tracing::{debug, info, warn};

use crate::error::{DvmError, Result};
use crate::metrics::{MetricEvent, MetricsSink, NoopMetrics};
use crate::transport::DvmTransport;

/// Caller-supplied description of a job, validated by [`create_job_request`].
///
/// `inputs` are `(value, type, relay?, marker?)` arrays and `params` are
/// `("param", name, value)` arrays, matching their wire tags minus the
/// leading `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRequestDraft {
    pub kind: u16,
    pub inputs: Vec<Vec<String>>,
    pub params: Vec<Vec<String>>,
    pub target_provider: Option<String>,
    /// Maximum bid in millisats
    pub bid_msats: Option<u64>,
    pub encrypted: bool,
    /// Relays the provider should answer on
    pub relays: Vec<String>,
    /// Expected output MIME type
    pub output: Option<String>,
}

impl JobRequestDraft {
    /// Single text input job.
    pub fn text(kind: u16, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            inputs: vec![vec![prompt.into(), InputType::Text.as_str().to_string()]],
            ..Default::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params
            .push(vec!["param".to_string(), name.into(), value.into()]);
        self
    }

    pub fn for_provider(mut self, pubkey: impl Into<String>) -> Self {
        self.target_provider = Some(pubkey.into());
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }
}

/// A signed, not necessarily published, job request.
///
/// Owns the keypair that signed it; the same secret decrypts anything the
/// provider encrypts back. Republishing yields the same event id.
#[derive(Debug, Clone)]
pub struct SignedJobRequest {
    pub event: Event,
    pub request: JobRequest,
    pub correlation_id: String,
    keys: Keypair,
}

impl SignedJobRequest {
    /// The job id (request event id).
    pub fn id(&self) -> &str {
        &self.event.id
    }

    pub fn keys(&self) -> &Keypair {
        &self.keys
    }

    pub fn target_provider(&self) -> Option<&str> {
        self.request.service_providers.first().map(String::as_str)
    }

    pub fn is_encrypted(&self) -> bool {
        self.request.encrypted
    }
}

/// Validate `draft`, encrypt its payload when asked, and sign it with
/// `requester`. Performs no I/O.
pub fn create_job_request(draft: JobRequestDraft, requester: Keypair) -> Result<SignedJobRequest> {
    if !is_job_request_kind(draft.kind) {
        return Err(DvmError::Validation(format!(
            "job kind {} is outside 5000-5999",
            draft.kind
        )));
    }
    if draft.inputs.is_empty() {
        return Err(DvmError::Validation("at least one input is required".to_string()));
    }

    let mut request = JobRequest::new(draft.kind)
        .map_err(|e| DvmError::Validation(e.to_string()))?;

    for raw in &draft.inputs {
        let mut tag = Vec::with_capacity(raw.len() + 1);
        tag.push("i".to_string());
        tag.extend(raw.iter().cloned());
        let input = JobInput::from_tag(&tag)
            .map_err(|e| DvmError::Validation(format!("input {:?}: {}", raw, e)))?;
        request = request.add_input(input);
    }
    for raw in &draft.params {
        let param = JobParam::from_tag(raw)
            .map_err(|e| DvmError::Validation(format!("param {:?}: {}", raw, e)))?;
        request.params.push(param);
    }

    if let Some(provider) = &draft.target_provider {
        if !is_hex_key(provider) {
            return Err(DvmError::Validation(
                "target provider must be a 64 character hex pubkey".to_string(),
            ));
        }
        request = request.add_service_provider(provider.clone());
    }
    if draft.encrypted && draft.target_provider.is_none() {
        return Err(DvmError::Validation(
            "encrypted requests need a target provider".to_string(),
        ));
    }

    if let Some(bid) = draft.bid_msats {
        request = request.with_bid(bid);
    }
    for relay in draft.relays {
        request = request.add_relay(relay);
    }
    if let Some(output) = draft.output {
        request = request.with_output(output);
    }

    let correlation_id = uuid::Uuid::new_v4().to_string();
    request = request.with_correlation(correlation_id.clone());

    let content = match (&draft.target_provider, draft.encrypted) {
        (Some(provider), true) => {
            request = request.encrypted();
            let plaintext = serde_json::to_string(&request.payload_tags())
                .map_err(|e| DvmError::Encryption(e.to_string()))?;
            nip04::encrypt(requester.secret_key(), provider, &plaintext)
                .map_err(|e| DvmError::Encryption(e.to_string()))?
        }
        _ => String::new(),
    };

    let event = requester
        .sign(&EventTemplate::now(request.kind, request.to_tags(), content))
        .map_err(|e| DvmError::Validation(e.to_string()))?;

    debug!(job_id = %event.id, kind = request.kind, encrypted = request.encrypted, "signed job request");

    Ok(SignedJobRequest {
        event,
        request,
        correlation_id,
        keys: requester,
    })
}

/// Decrypt `content` written by `author` to the holder of `secret`.
pub(crate) fn decrypt_from(secret: Option<&[u8; 32]>, author: &str, content: &str) -> Result<String> {
    let secret = secret.ok_or_else(|| {
        DvmError::Decryption("payload is encrypted but no decryption key was supplied".to_string())
    })?;
    nip04::decrypt(secret, author, content).map_err(|e| DvmError::Decryption(e.to_string()))
}

/// A parsed protocol message together with the envelope it arrived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received<T> {
    pub event_id: String,
    /// Provider pubkey
    pub author: String,
    pub created_at: u64,
    pub payload: T,
}

impl<T> Received<T> {
    pub(crate) fn wrap(event: &Event, payload: T) -> Self {
        Self {
            event_id: event.id.clone(),
            author: event.pubkey.clone(),
            created_at: event.created_at,
            payload,
        }
    }
}

/// Where an optimistically shown request stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingState {
    /// Shown locally, publish not yet confirmed.
    Pending { job_id: String },
    Confirmed { job_id: String },
    Failed { job_id: String, error: String },
}

/// Placeholder registry keyed by the request's correlation tag.
///
/// UIs render a request before the relay acknowledges it; the correlation id
/// ties the placeholder to the echoed event even when the id is not yet known
/// to the view.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingState>>,
}

impl PendingRequests {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingState>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, request: &SignedJobRequest) {
        self.entries().insert(
            request.correlation_id.clone(),
            PendingState::Pending {
                job_id: request.id().to_string(),
            },
        );
    }

    pub fn confirm(&self, correlation_id: &str) {
        if let Some(state) = self.entries().get_mut(correlation_id) {
            let job_id = match state {
                PendingState::Pending { job_id }
                | PendingState::Confirmed { job_id }
                | PendingState::Failed { job_id, .. } => job_id.clone(),
            };
            *state = PendingState::Confirmed { job_id };
        }
    }

    pub fn fail(&self, correlation_id: &str, error: &DvmError) {
        if let Some(state) = self.entries().get_mut(correlation_id) {
            if let PendingState::Pending { job_id } = state {
                *state = PendingState::Failed {
                    job_id: job_id.clone(),
                    error: error.to_string(),
                };
            }
        }
    }

    /// Match an event seen on the network against a placeholder, by
    /// correlation tag when visible or by id for encrypted requests.
    pub fn reconcile(&self, event: &Event) -> Option<String> {
        let mut entries = self.entries();
        let correlation = event
            .tag_value(nostr::TAG_CORRELATION)
            .map(str::to_string)
            .or_else(|| {
                entries.iter().find_map(|(corr, state)| match state {
                    PendingState::Pending { job_id } | PendingState::Failed { job_id, .. }
                        if *job_id == event.id =>
                    {
                        Some(corr.clone())
                    }
                    _ => None,
                })
            })?;
        let state = entries.get_mut(&correlation)?;
        *state = PendingState::Confirmed {
            job_id: event.id.clone(),
        };
        Some(correlation)
    }

    pub fn state(&self, correlation_id: &str) -> Option<PendingState> {
        self.entries().get(correlation_id).cloned()
    }

    /// Drop a placeholder once its job no longer needs one.
    pub fn remove(&self, correlation_id: &str) -> Option<PendingState> {
        self.entries().remove(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Publishes requests and looks up results over a [`DvmTransport`].
#[derive(Clone)]
pub struct JobClient {
    transport: Arc<dyn DvmTransport>,
    metrics: Arc<dyn MetricsSink>,
    pending: Arc<PendingRequests>,
    query_timeout: Duration,
}

impl JobClient {
    pub fn new(transport: Arc<dyn DvmTransport>, query_timeout: Duration) -> Self {
        Self {
            transport,
            metrics: Arc::new(NoopMetrics),
            pending: Arc::new(PendingRequests::default()),
            query_timeout,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Publish a signed request. On failure the request stays valid and can
    /// be published again under the same id.
    pub async fn publish_job_request(&self, request: &SignedJobRequest) -> Result<()> {
        self.pending.register(request);
        self.metrics.record(MetricEvent::JobRequested {
            job_id: request.id().to_string(),
            kind: request.request.kind,
            encrypted: request.is_encrypted(),
            timestamp: Utc::now(),
        });

        match self.transport.publish(request.event.clone()).await {
            Ok(()) => {
                self.pending.confirm(&request.correlation_id);
                self.metrics.record(MetricEvent::JobPublished {
                    job_id: request.id().to_string(),
                    timestamp: Utc::now(),
                });
                info!(job_id = %request.id(), kind = request.request.kind, "published job request");
                Ok(())
            }
            Err(err) => {
                let err = match err {
                    DvmError::Network(_) => err,
                    other => DvmError::Network(other.to_string()),
                };
                self.pending.fail(&request.correlation_id, &err);
                warn!(job_id = %request.id(), error = %err, "failed to publish job request");
                Err(err)
            }
        }
    }

    /// The authoritative (newest) result for a job, if any has been stored.
    ///
    /// Encrypted results are decrypted with `decryption_key` and the result
    /// author's pubkey. A result that cannot be decrypted is an error, not
    /// `Ok(None)`.
    pub async fn get_job_result(
        &self,
        job_request_id: &str,
        provider_pubkey: Option<&str>,
        decryption_key: Option<&[u8; 32]>,
    ) -> Result<Option<Received<JobResult>>> {
        if !is_hex_key(job_request_id) {
            return Err(DvmError::Validation(format!(
                "job id {:?} is not a 64 character hex event id",
                job_request_id
            )));
        }

        let mut filter = Filter::new()
            .kinds(JOB_RESULT_KIND_MIN..=JOB_RESULT_KIND_MAX)
            .references_events([job_request_id]);
        if let Some(provider) = provider_pubkey {
            filter = filter.authors([provider]);
        }

        let events = self
            .transport
            .query(vec![filter], self.query_timeout)
            .await
            .map_err(|e| match e {
                DvmError::Network(_) => e,
                other => DvmError::Network(other.to_string()),
            })?;

        let mut candidates: Vec<Event> = events
            .into_iter()
            .filter(|e| e.references_event(job_request_id))
            .filter(|e| provider_pubkey.is_none_or(|p| e.pubkey == p))
            .collect();
        // newest first, ties to the lowest id
        sort_events(&mut candidates);
        let newest = candidates.iter().find_map(|e| match JobResult::from_event(e) {
            Ok(result) => Some((e, result)),
            Err(err) => {
                debug!(event_id = %e.id, error = %err, "skipping malformed job result");
                None
            }
        });

        let Some((event, mut result)) = newest else {
            return Ok(None);
        };
        if result.encrypted {
            result.content = decrypt_from(decryption_key, &event.pubkey, &event.content)?;
        }
        Ok(Some(Received::wrap(event, result)))
    }
}
