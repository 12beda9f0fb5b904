//! Shared fixtures for dvm integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use dvm::{
    BackendChunk, BackendError, CompletionRequest, DvmTransport, InferenceBackend, MemoryRelay,
};
use nostr::nip04;
use nostr::{
    Event, EventTemplate, Filter, JOB_REQUEST_KIND_MAX, JOB_REQUEST_KIND_MIN, JobFeedback,
    JobRequest, JobResult, JobStatus, KIND_JOB_FEEDBACK, Keypair,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// One scripted provider action.
#[derive(Debug, Clone)]
pub enum Step {
    Feedback {
        status: JobStatus,
        content: String,
        extra: Option<String>,
        amount: Option<(u64, String)>,
    },
    Result(String),
    Delay(Duration),
}

impl Step {
    pub fn processing() -> Self {
        Self::feedback(JobStatus::Processing, "")
    }

    pub fn partial(content: &str) -> Self {
        Self::feedback(JobStatus::Partial, content)
    }

    pub fn success(content: &str) -> Self {
        Self::feedback(JobStatus::Success, content)
    }

    pub fn error(message: &str) -> Self {
        Step::Feedback {
            status: JobStatus::Error,
            content: String::new(),
            extra: Some(message.to_string()),
            amount: None,
        }
    }

    pub fn payment_required(msats: u64, invoice: &str) -> Self {
        Step::Feedback {
            status: JobStatus::PaymentRequired,
            content: String::new(),
            extra: None,
            amount: Some((msats, invoice.to_string())),
        }
    }

    pub fn result(content: &str) -> Self {
        Step::Result(content.to_string())
    }

    fn feedback(status: JobStatus, content: &str) -> Self {
        Step::Feedback {
            status,
            content: content.to_string(),
            extra: None,
            amount: None,
        }
    }
}

/// Answers every job request addressed to it with the same script,
/// encrypting replies when the request was encrypted.
pub struct MockProvider {
    pub keys: Keypair,
    requests: Arc<Mutex<Vec<JobRequest>>>,
    task: JoinHandle<()>,
}

impl MockProvider {
    pub async fn spawn(relay: Arc<MemoryRelay>, script: Vec<Step>) -> Self {
        let keys = Keypair::generate();
        let filter = Filter::new()
            .kinds(JOB_REQUEST_KIND_MIN..=JOB_REQUEST_KIND_MAX)
            .references_pubkeys([keys.public_key().to_string()]);
        let mut rx = relay
            .subscribe("mock-provider", vec![filter], &[])
            .await
            .unwrap();

        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let provider_keys = keys.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let request = decode_request(&provider_keys, &event);
                seen.lock().unwrap().push(request);
                respond(&relay, &provider_keys, &event, &script).await;
            }
        });

        Self {
            keys,
            requests,
            task,
        }
    }

    pub fn pubkey(&self) -> String {
        self.keys.public_key().to_string()
    }

    /// Requests seen so far, with encrypted tags already decrypted.
    pub fn requests(&self) -> Vec<JobRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockProvider {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn decode_request(keys: &Keypair, event: &Event) -> JobRequest {
    if event.has_tag("encrypted") {
        let plaintext = nip04::decrypt(keys.secret_key(), &event.pubkey, &event.content).unwrap();
        let tags: Vec<Vec<String>> = serde_json::from_str(&plaintext).unwrap();
        let mut request = JobRequest::from_tags(event.kind, &tags).unwrap();
        request.encrypted = true;
        request
    } else {
        JobRequest::from_event(event).unwrap()
    }
}

async fn respond(relay: &MemoryRelay, keys: &Keypair, request: &Event, script: &[Step]) {
    let encrypted = request.has_tag("encrypted");
    let seal = |content: &str| -> (String, bool) {
        if encrypted && !content.is_empty() {
            (
                nip04::encrypt(keys.secret_key(), &request.pubkey, content).unwrap(),
                true,
            )
        } else {
            (content.to_string(), false)
        }
    };

    for step in script {
        let event = match step {
            Step::Feedback {
                status,
                content,
                extra,
                amount,
            } => {
                let (content, sealed) = seal(content);
                let mut feedback =
                    JobFeedback::new(*status, &request.id, &request.pubkey).with_content(content);
                feedback.encrypted = sealed;
                if let Some(extra) = extra {
                    feedback = feedback.with_status_extra(extra.clone());
                }
                if let Some((msats, invoice)) = amount {
                    feedback = feedback.with_amount(*msats, Some(invoice.clone()));
                }
                sign(keys, KIND_JOB_FEEDBACK, feedback.to_tags(), &feedback.content)
            }
            Step::Result(content) => {
                let (content, sealed) = seal(content);
                let mut result =
                    JobResult::new(request.kind, &request.id, &request.pubkey, content).unwrap();
                result.encrypted = sealed;
                sign(keys, result.kind, result.to_tags(), &result.content)
            }
            Step::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                continue;
            }
        };
        relay.publish(event).await.unwrap();
    }
}

pub fn sign(keys: &Keypair, kind: u16, tags: Vec<Vec<String>>, content: &str) -> Event {
    keys.sign(&EventTemplate::now(kind, tags, content)).unwrap()
}

/// Signed event with an explicit timestamp.
pub fn sign_at(
    keys: &Keypair,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: &str,
    created_at: u64,
) -> Event {
    keys.sign(&EventTemplate {
        created_at,
        kind,
        tags,
        content: content.to_string(),
    })
    .unwrap()
}

/// Backend that streams a fixed list of deltas and records what it was asked.
pub struct MockBackend {
    deltas: Vec<String>,
    fail_with: Option<String>,
    ready: bool,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockBackend {
    pub fn new(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            fail_with: None,
            ready: true,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn not_ready() -> Self {
        Self {
            ready: false,
            ..Self::new(&["never"])
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::new(&[])
        }
    }

    pub fn output(&self) -> String {
        self.deltas.concat()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    fn id(&self) -> &str {
        "mock"
    }

    async fn is_ready(&self) -> bool {
        self.ready
    }

    async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<Result<BackendChunk, BackendError>>, BackendError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(message) = &self.fail_with {
            return Err(BackendError::Unavailable(message.clone()));
        }

        let (tx, rx) = mpsc::channel(16);
        let deltas = self.deltas.clone();
        tokio::spawn(async move {
            let last = deltas.len().saturating_sub(1);
            for (i, delta) in deltas.into_iter().enumerate() {
                let chunk = BackendChunk {
                    id: format!("mock-{}", i),
                    model: request.model.clone(),
                    delta,
                    finish_reason: (i == last).then(|| "stop".to_string()),
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}
