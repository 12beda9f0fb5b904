use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use nostr::nip04;
use nostr::{
    Event, EventTemplate, Filter, InputType, JobFeedback, JobRequest, JobResult, JobStatus,
    KIND_JOB_FEEDBACK, Keypair, unix_now, verify_event,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, CompletionRequest, InferenceBackend};
use crate::config::ProviderConfig;
use crate::error::{DvmError, Result};
use crate::metrics::{MetricEvent, MetricsSink, TracingMetrics};
use crate::payment::msats_to_sats;
use crate::transport::DvmTransport;
use crate::wallet::WalletService;

/// Serves NIP-90 jobs addressed to one pubkey.
///
/// Every job is invoice-first: the price is quoted from the request alone,
/// the invoice is published as `payment-required`, and the backend only runs
/// once the wallet reports the invoice as paid.
#[derive(Clone)]
pub struct DvmProviderService {
    keys: Keypair,
    config: ProviderConfig,
    transport: Arc<dyn DvmTransport>,
    backend: Arc<dyn InferenceBackend>,
    wallet: Option<Arc<dyn WalletService>>,
    metrics: Arc<dyn MetricsSink>,
    /// Request id to its `created_at`, pruned by `max_request_age_secs`.
    seen_requests: Arc<Mutex<HashMap<String, u64>>>,
}

/// Running request loop started by [`DvmProviderService::start`].
pub struct ProviderHandle {
    subscription_id: String,
    transport: Arc<dyn DvmTransport>,
    task: JoinHandle<()>,
}

impl ProviderHandle {
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Close the request subscription. Jobs already running finish on their
    /// own tasks.
    pub async fn stop(self) -> Result<()> {
        self.transport.unsubscribe(&self.subscription_id).await?;
        self.task.abort();
        Ok(())
    }
}

impl DvmProviderService {
    pub fn new(
        keys: Keypair,
        config: ProviderConfig,
        transport: Arc<dyn DvmTransport>,
        backend: Arc<dyn InferenceBackend>,
        wallet: Option<Arc<dyn WalletService>>,
    ) -> Self {
        Self {
            keys,
            config,
            transport,
            backend,
            wallet,
            metrics: Arc::new(TracingMetrics),
            seen_requests: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn pubkey(&self) -> &str {
        self.keys.public_key()
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> &Arc<dyn DvmTransport> {
        &self.transport
    }

    /// Subscribe to requests addressed to this provider and serve each on
    /// its own task.
    pub async fn start(&self) -> Result<ProviderHandle> {
        let filter = Filter::new()
            .kinds(self.config.supported_kinds.iter().copied())
            .references_pubkeys([self.pubkey().to_string()]);
        let subscription_id = format!("dvm-provider-{}", &self.pubkey()[..12]);
        let mut rx = self
            .transport
            .subscribe(&subscription_id, vec![filter], &[])
            .await?;
        info!(
            pubkey = %self.pubkey(),
            kinds = ?self.config.supported_kinds,
            "DVM provider started"
        );

        let service = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(err) = service.process_request(event).await {
                        debug!(error = %err, "job request not served");
                    }
                });
            }
            debug!("provider request subscription closed");
        });

        Ok(ProviderHandle {
            subscription_id,
            transport: self.transport.clone(),
            task,
        })
    }

    /// Serve one request event end to end.
    ///
    /// Requests that are not for us, already seen, or not validly signed are
    /// dropped without feedback. Any later failure is reported to the
    /// customer as `error` feedback and returned.
    pub async fn process_request(&self, event: Event) -> Result<()> {
        if !self.should_handle(&event) {
            return Ok(());
        }
        let now = unix_now();
        if event.created_at < now.saturating_sub(self.config.max_request_age_secs) {
            debug!(job_id = %event.id, created_at = event.created_at, "stale job request ignored");
            return Ok(());
        }
        if !self.remember_request(&event.id, event.created_at, now) {
            debug!(job_id = %event.id, "duplicate job request ignored");
            return Ok(());
        }
        if !verify_event(&event).unwrap_or(false) {
            warn!(job_id = %event.id, "job request with invalid signature dropped");
            return Err(DvmError::Validation("invalid request signature".to_string()));
        }

        info!(job_id = %event.id, kind = event.kind, customer = %event.pubkey, "received job request");
        self.metrics.record(MetricEvent::RequestReceived {
            job_id: event.id.clone(),
            kind: event.kind,
            customer_pubkey: event.pubkey.clone(),
            timestamp: Utc::now(),
        });

        match self.serve(&event).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(job_id = %event.id, error = %err, "job failed");
                let feedback = JobFeedback::new(JobStatus::Error, &event.id, &event.pubkey)
                    .with_status_extra(err.to_string());
                if let Err(publish_err) = self.publish_feedback(feedback).await {
                    warn!(job_id = %event.id, error = %publish_err, "could not report job error");
                }
                Err(err)
            }
        }
    }

    /// Record a request id and forget ids that have aged past the request
    /// cutoff. Returns false for an id already seen.
    fn remember_request(&self, id: &str, created_at: u64, now: u64) -> bool {
        let cutoff = now.saturating_sub(self.config.max_request_age_secs);
        let mut seen = self.seen_requests.lock().unwrap_or_else(|e| e.into_inner());
        seen.retain(|_, seen_at| *seen_at >= cutoff);
        if seen.contains_key(id) {
            return false;
        }
        seen.insert(id.to_string(), created_at);
        true
    }

    /// Request ids currently remembered for deduplication.
    pub fn tracked_requests(&self) -> usize {
        self.seen_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn should_handle(&self, event: &Event) -> bool {
        if !self.config.supported_kinds.contains(&event.kind) {
            return false;
        }

        event.tags.iter().any(|tag| {
            tag.first().map(String::as_str) == Some("p")
                && tag.get(1).map(String::as_str) == Some(self.pubkey())
        })
    }

    async fn serve(&self, event: &Event) -> Result<()> {
        let request = self.parse_request(event)?;
        let prompt = request
            .inputs
            .iter()
            .filter(|i| i.input_type == InputType::Text)
            .map(|i| i.data.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if prompt.trim().is_empty() {
            return Err(DvmError::Validation("request has no text input".to_string()));
        }
        // before quoting: no invoice for a backend that cannot run
        if !self.backend.is_ready().await {
            return Err(BackendError::Unavailable(self.backend.id().to_string()).into());
        }

        let price_msats = self.config.pricing.quote(&prompt);
        if let Some(bid) = request.bid {
            if price_msats > bid {
                return Err(DvmError::Protocol(format!(
                    "price {} msats exceeds bid {} msats",
                    price_msats, bid
                )));
            }
        }

        if price_msats > 0 {
            self.collect_payment(event, price_msats).await?;
        }

        self.publish_feedback(JobFeedback::new(
            JobStatus::Processing,
            &event.id,
            &event.pubkey,
        ))
        .await?;

        let mut completion = CompletionRequest::new(self.config.default_model.clone(), prompt)
            .streaming();
        for param in &request.params {
            completion.apply_param(&param.key, &param.value);
        }

        let mut chunks = self.backend.complete_stream(completion).await?;
        let mut output = String::new();
        while let Some(chunk) = chunks.recv().await {
            let chunk = chunk?;
            if chunk.delta.is_empty() {
                continue;
            }
            output.push_str(&chunk.delta);
            let (content, encrypted) = self.seal(&event.pubkey, &chunk.delta, request.encrypted)?;
            let mut partial =
                JobFeedback::new(JobStatus::Partial, &event.id, &event.pubkey).with_content(content);
            partial.encrypted = encrypted;
            self.publish_feedback(partial).await?;
        }

        let (content, encrypted) = self.seal(&event.pubkey, &output, request.encrypted)?;
        let request_json =
            serde_json::to_string(event).map_err(|e| DvmError::Protocol(e.to_string()))?;
        let mut result = JobResult::new(event.kind, &event.id, &event.pubkey, content)?
            .with_request(request_json);
        if !request.encrypted {
            for input in &request.inputs {
                result = result.add_input(input.clone());
            }
        }
        if price_msats > 0 {
            result = result.with_amount(price_msats, None);
        }
        result.encrypted = encrypted;
        self.publish_result(result).await?;

        info!(job_id = %event.id, chars = output.len(), price_msats, "job completed");
        Ok(())
    }

    /// Read the request, decrypting its tags when they travel as ciphertext.
    fn parse_request(&self, event: &Event) -> Result<JobRequest> {
        if !event.has_tag("encrypted") {
            return Ok(JobRequest::from_event(event)?);
        }

        let plaintext = nip04::decrypt(self.keys.secret_key(), &event.pubkey, &event.content)?;
        let tags: Vec<Vec<String>> = serde_json::from_str(&plaintext)
            .map_err(|e| DvmError::Decryption(format!("encrypted tags: {}", e)))?;
        let mut request = JobRequest::from_tags(event.kind, &tags)?;
        request.encrypted = true;
        Ok(request)
    }

    /// Issue an invoice, announce it, and wait until it is paid.
    async fn collect_payment(&self, event: &Event, price_msats: u64) -> Result<()> {
        let wallet = self
            .wallet
            .as_ref()
            .ok_or_else(|| DvmError::Payment("provider has no wallet configured".to_string()))?;

        let amount_sats = msats_to_sats(price_msats);
        let memo = format!("NIP-90 job {}", &event.id[..16.min(event.id.len())]);
        let invoice = wallet.create_invoice(amount_sats, &memo).await?;
        self.metrics.record(MetricEvent::InvoiceIssued {
            job_id: event.id.clone(),
            amount_msats: price_msats,
            timestamp: Utc::now(),
        });

        self.publish_feedback(
            JobFeedback::new(JobStatus::PaymentRequired, &event.id, &event.pubkey)
                .with_amount(price_msats, Some(invoice.payment_request.clone())),
        )
        .await?;
        debug!(job_id = %event.id, amount_sats, "waiting for invoice payment");

        let deadline = Instant::now() + self.config.payment_timeout();
        loop {
            if wallet.invoice_paid(&invoice.payment_request).await? {
                info!(job_id = %event.id, amount_sats, "job invoice paid");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DvmError::Payment(format!(
                    "invoice not paid within {}s",
                    self.config.payment_timeout_secs
                )));
            }
            tokio::time::sleep(self.config.invoice_poll_interval()).await;
        }
    }

    /// Encrypt `content` for the customer when the job is encrypted. Empty
    /// content stays plaintext.
    fn seal(&self, customer: &str, content: &str, encrypted: bool) -> Result<(String, bool)> {
        if !encrypted || content.is_empty() {
            return Ok((content.to_string(), false));
        }
        let ciphertext = nip04::encrypt(self.keys.secret_key(), customer, content)
            .map_err(|e| DvmError::Encryption(e.to_string()))?;
        Ok((ciphertext, true))
    }

    async fn publish_feedback(&self, feedback: JobFeedback) -> Result<()> {
        let template = EventTemplate::now(KIND_JOB_FEEDBACK, feedback.to_tags(), &feedback.content);
        let event = self.keys.sign(&template)?;
        debug!(job_id = %feedback.request_id, status = %feedback.status, "publishing feedback");
        self.transport.publish(event).await
    }

    async fn publish_result(&self, result: JobResult) -> Result<()> {
        let template = EventTemplate::now(result.kind, result.to_tags(), &result.content);
        let event = self.keys.sign(&template)?;
        self.transport.publish(event).await
    }
}
