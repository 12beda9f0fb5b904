//! [`LanguageModel`] backed by a remote NIP-90 service provider.
//!
//! Each `stream_text` call is one job: a request signed with its own
//! ephemeral key, one multiplexed subscription, and a lifecycle driven
//! through [`crate::lifecycle::reduce`].

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use nostr::{JobStatus, Keypair};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{DvmConfig, PaymentContinuation};
use crate::correlation::{JobClient, JobRequestDraft, create_job_request};
use crate::error::{DvmError, Result};
use crate::lifecycle::{Effect, JobLifecycleState, JobProgress, LifecycleEvent, reduce};
use crate::metrics::{MetricEvent, MetricsSink, TracingMetrics};
use crate::payment::{PaymentHandler, PaymentOutcome};
use crate::stream::{
    ChunkSender, LanguageModel, Prompt, StreamCanceller, StreamChunk, StreamOptions, TextStream,
    validate_prompt,
};
use crate::subscription::{CancelHandle, JobUpdate, JobWatch, SubscriptionMultiplexer};
use crate::transport::DvmTransport;
use crate::wallet::WalletService;

pub struct DvmLanguageModel {
    config: DvmConfig,
    transport: Arc<dyn DvmTransport>,
    wallet: Option<Arc<dyn WalletService>>,
    metrics: Arc<dyn MetricsSink>,
    multiplexer: Arc<SubscriptionMultiplexer>,
    client: JobClient,
    payments: Arc<PaymentHandler>,
    identity: Option<Keypair>,
}

impl DvmLanguageModel {
    pub fn new(
        config: DvmConfig,
        transport: Arc<dyn DvmTransport>,
        wallet: Option<Arc<dyn WalletService>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(config, transport, wallet, Arc::new(TracingMetrics), None))
    }

    fn assemble(
        config: DvmConfig,
        transport: Arc<dyn DvmTransport>,
        wallet: Option<Arc<dyn WalletService>>,
        metrics: Arc<dyn MetricsSink>,
        identity: Option<Keypair>,
    ) -> Self {
        let multiplexer =
            Arc::new(SubscriptionMultiplexer::new(transport.clone()).with_metrics(metrics.clone()));
        let client =
            JobClient::new(transport.clone(), config.query_timeout()).with_metrics(metrics.clone());
        let payments = Arc::new(
            PaymentHandler::new(wallet.clone(), config.payment.clone())
                .with_metrics(metrics.clone()),
        );
        Self {
            config,
            transport,
            wallet,
            metrics,
            multiplexer,
            client,
            payments,
            identity,
        }
    }

    /// Long-lived identity, used when `use_ephemeral_keys` is off.
    pub fn with_identity(mut self, keys: Keypair) -> Self {
        self.identity = Some(keys);
        self
    }

    pub fn with_metrics(self, metrics: Arc<dyn MetricsSink>) -> Self {
        Self::assemble(
            self.config,
            self.transport,
            self.wallet,
            metrics,
            self.identity,
        )
    }

    pub fn config(&self) -> &DvmConfig {
        &self.config
    }

    /// For result lookups outside a stream.
    pub fn job_client(&self) -> &JobClient {
        &self.client
    }

    pub fn multiplexer(&self) -> &SubscriptionMultiplexer {
        &self.multiplexer
    }

    fn draft(&self, prompt: &Prompt, options: StreamOptions) -> JobRequestDraft {
        let kind = options.kind.unwrap_or(self.config.job_kind);
        let mut draft = JobRequestDraft::text(kind, prompt.to_text());
        if let Some(model) = options.model.or_else(|| self.config.model.clone()) {
            draft = draft.with_param("model", model);
        }
        for (name, value) in options.params {
            draft = draft.with_param(name, value);
        }
        if let Some(max_tokens) = options.max_tokens {
            draft = draft.with_param("max_tokens", max_tokens.to_string());
        }
        if let Some(temperature) = options.temperature {
            draft = draft.with_param("temperature", temperature.to_string());
        }
        if let Some(provider) = &self.config.provider_pubkey {
            draft = draft.for_provider(provider.clone());
        }
        if self.config.encrypt_requests {
            draft = draft.encrypted();
        }
        draft.bid_msats = self.config.bid_msats;
        draft.relays = self.config.relays.clone();
        draft
    }
}

impl LanguageModel for DvmLanguageModel {
    fn id(&self) -> &str {
        "nip90-dvm"
    }

    fn stream_text(&self, prompt: Prompt, options: StreamOptions) -> Result<TextStream> {
        validate_prompt(&prompt)?;
        let identity = if self.config.use_ephemeral_keys {
            None
        } else {
            Some(self.identity.clone().ok_or_else(|| {
                DvmError::Config("use_ephemeral_keys is off but no identity was set".to_string())
            })?)
        };

        let run = JobRun {
            draft: self.draft(&prompt, options),
            identity,
            client: self.client.clone(),
            multiplexer: self.multiplexer.clone(),
            payments: self.payments.clone(),
            metrics: self.metrics.clone(),
            relays: self.config.relays.clone(),
            buffer: self.config.stream_buffer,
        };
        Ok(TextStream::lazy(self.config.stream_buffer, move |tx, canceller| {
            run.drive(tx, canceller)
        }))
    }
}

/// One job, from signing the request to tearing down its subscription.
struct JobRun {
    draft: JobRequestDraft,
    identity: Option<Keypair>,
    client: JobClient,
    multiplexer: Arc<SubscriptionMultiplexer>,
    payments: Arc<PaymentHandler>,
    metrics: Arc<dyn MetricsSink>,
    relays: Vec<String>,
    buffer: usize,
}

impl JobRun {
    async fn drive(mut self, tx: ChunkSender, canceller: StreamCanceller) {
        let started = Instant::now();
        // fresh key per job unless a long-lived identity was configured
        let keys = self.identity.take().unwrap_or_else(Keypair::generate);

        let request = match create_job_request(std::mem::take(&mut self.draft), keys) {
            Ok(request) => request,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };
        let job_id = request.id().to_string();
        if canceller.is_cancelled() {
            return;
        }

        let published = self.client.publish_job_request(&request).await;
        // the stream tracks the job from here on
        self.client.pending().remove(&request.correlation_id);
        if let Err(err) = published {
            self.record_failure(&job_id, &err);
            let _ = tx.send(Err(err)).await;
            return;
        }

        let mut watch = JobWatch::new(job_id.clone())
            .decrypt_with(*request.keys().secret_key())
            .with_relay_hints(std::mem::take(&mut self.relays));
        if let Some(provider) = request.target_provider() {
            watch = watch.from_provider(provider);
        }

        let (updates_tx, mut updates) = mpsc::channel::<JobUpdate>(self.buffer.max(1));
        let handle = match self
            .multiplexer
            .subscribe_to_job_updates(watch, Arc::new(updates_tx))
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                self.record_failure(&job_id, &err);
                let _ = tx.send(Err(err)).await;
                return;
            }
        };
        let hook = handle.clone();
        canceller.on_cancel(move || {
            hook.cancel();
        });

        let state = self
            .run_lifecycle(&job_id, &tx, &canceller, &handle, &mut updates)
            .await;

        handle.cancel();
        drop(updates);
        handle.closed().await;

        match state {
            JobLifecycleState::Success => {
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(job_id = %job_id, duration_ms, "job completed");
                self.metrics.record(MetricEvent::JobCompleted {
                    job_id,
                    duration_ms,
                    timestamp: Utc::now(),
                });
            }
            JobLifecycleState::Cancelled => {
                debug!(job_id = %job_id, "job cancelled");
                self.metrics.record(MetricEvent::JobCancelled {
                    job_id,
                    timestamp: Utc::now(),
                });
            }
            _ => {}
        }
    }

    async fn run_lifecycle(
        &self,
        job_id: &str,
        tx: &ChunkSender,
        canceller: &StreamCanceller,
        handle: &CancelHandle,
        updates: &mut mpsc::Receiver<JobUpdate>,
    ) -> JobLifecycleState {
        let resume_timeout = self.payments.config().resume_timeout();
        let hold = self.payments.config().continuation == PaymentContinuation::AwaitResumption;

        let mut progress = JobProgress::default();
        let mut queued: VecDeque<LifecycleEvent> = VecDeque::new();
        let mut resume_deadline: Option<Instant> = None;

        loop {
            let event = match queued.pop_front() {
                Some(event) => event,
                None => tokio::select! {
                    biased;
                    _ = canceller.cancelled() => LifecycleEvent::Cancelled,
                    _ = sleep_until(resume_deadline) => LifecycleEvent::ResumeTimeout,
                    update = updates.recv() => match update {
                        Some(update) => lifecycle_event(update),
                        None => LifecycleEvent::Failed {
                            error: DvmError::Network(
                                "job subscription closed before the job finished".to_string(),
                            ),
                        },
                    },
                },
            };

            let transition = reduce(&progress, event);
            progress = transition.next;

            for effect in transition.effects {
                match effect {
                    Effect::Emit(chunk) => {
                        if !emit(tx, canceller, Ok(chunk)).await {
                            queued.clear();
                            queued.push_back(LifecycleEvent::Cancelled);
                            break;
                        }
                    }
                    Effect::HandlePayment {
                        amount_msats,
                        invoice,
                        content,
                    } => {
                        let next = tokio::select! {
                            biased;
                            _ = canceller.cancelled() => LifecycleEvent::Cancelled,
                            outcome = self.payments.handle(job_id, amount_msats, invoice.as_deref(), &content) => {
                                match outcome {
                                    Ok(PaymentOutcome::Paid { amount_sats, .. }) => {
                                        LifecycleEvent::PaymentSettled { amount_sats, hold }
                                    }
                                    Ok(PaymentOutcome::Deferred { invoice, amount_sats }) => {
                                        LifecycleEvent::PaymentDeferred { invoice, amount_sats }
                                    }
                                    Err(error) => LifecycleEvent::Failed { error },
                                }
                            }
                        };
                        queued.push_back(next);
                    }
                    Effect::AwaitResumption => {
                        resume_deadline = Some(Instant::now() + resume_timeout);
                    }
                    Effect::Fail(err) => {
                        warn!(job_id, error = %err, "job failed");
                        self.record_failure(job_id, &err);
                        let _ = emit(tx, canceller, Err(err)).await;
                    }
                    Effect::Teardown => {
                        handle.cancel();
                    }
                }
            }

            if progress.held_notice.is_none() {
                resume_deadline = None;
            }
            if progress.state.is_terminal() {
                return progress.state;
            }
        }
    }

    fn record_failure(&self, job_id: &str, err: &DvmError) {
        self.metrics.record(MetricEvent::JobFailed {
            job_id: job_id.to_string(),
            error: err.to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Send to the consumer unless the stream is cancelled first.
async fn emit(tx: &ChunkSender, canceller: &StreamCanceller, item: Result<StreamChunk>) -> bool {
    tokio::select! {
        biased;
        _ = canceller.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn lifecycle_event(update: JobUpdate) -> LifecycleEvent {
    match update {
        JobUpdate::Result(result) => LifecycleEvent::Result {
            content: result.payload.content,
        },
        JobUpdate::Feedback(feedback) => {
            let feedback = feedback.payload;
            match feedback.status {
                JobStatus::PaymentRequired => LifecycleEvent::PaymentRequired {
                    amount_msats: feedback.amount,
                    invoice: feedback.bolt11,
                    content: feedback.content,
                },
                JobStatus::Processing => LifecycleEvent::Processing,
                JobStatus::Partial => LifecycleEvent::Partial {
                    content: feedback.content,
                },
                JobStatus::Success => LifecycleEvent::Success {
                    content: feedback.content,
                },
                JobStatus::Error => {
                    let message = feedback
                        .status_extra
                        .filter(|s| !s.trim().is_empty())
                        .or_else(|| Some(feedback.content).filter(|s| !s.trim().is_empty()))
                        .unwrap_or_else(|| "provider error".to_string());
                    LifecycleEvent::ProviderError { message }
                }
            }
        }
    }
}
