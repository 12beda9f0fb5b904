//! NIP-90 job orchestration.
//!
//! The requester side turns a prompt into a signed job request, follows the
//! provider's feedback and results over one multiplexed subscription, pays
//! small invoices to keep the job going, and exposes the whole exchange as a
//! pull-based [`TextStream`]. The provider side mirrors it: quote, invoice,
//! run the backend, stream partials, publish the result.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dvm::{DvmConfig, DvmLanguageModel, LanguageModel, MemoryRelay, StreamOptions};
//!
//! # async fn run() -> dvm::Result<()> {
//! let relay = Arc::new(MemoryRelay::new("wss://relay.example"));
//! let model = DvmLanguageModel::new(DvmConfig::default(), relay, None)?;
//! let text = model
//!     .stream_text("Summarize: hello world".into(), StreamOptions::default())?
//!     .collect_text()
//!     .await?;
//! println!("{}", text);
//! # Ok(())
//! # }
//! ```

pub mod backend;
mod config;
mod correlation;
mod dvm_model;
mod error;
pub mod lifecycle;
mod local;
pub mod metrics;
mod payment;
pub mod provider;
mod stream;
mod subscription;
mod transport;
mod wallet;

pub use backend::{BackendChunk, BackendError, CompletionRequest, InferenceBackend};
pub use config::{DvmConfig, PaymentConfig, PaymentContinuation, ProviderConfig};
pub use correlation::{
    JobClient, JobRequestDraft, PendingRequests, PendingState, Received, SignedJobRequest,
    create_job_request,
};
pub use dvm_model::DvmLanguageModel;
pub use error::{DvmError, Result};
pub use lifecycle::{JobLifecycleState, JobProgress, LifecycleEvent};
pub use local::LocalLanguageModel;
pub use metrics::{MetricEvent, MetricsSink, NoopMetrics, RecordingMetrics, TracingMetrics};
pub use payment::{PaymentHandler, PaymentOutcome, msats_to_sats, resolve_invoice};
pub use provider::{
    DvmProviderService, JobHistoryPage, JobRecord, JobStatistics, PricingConfig, ProviderHandle,
};
pub use stream::{
    ChatMessage, ChunkKind, ChunkSender, LanguageModel, Prompt, StreamCanceller, StreamChunk,
    StreamOptions, TextStream,
};
pub use subscription::{
    CancelHandle, FnHandler, JobUpdate, JobUpdateHandler, JobWatch, SubscriptionMultiplexer,
};
pub use transport::{DvmTransport, MemoryRelay};
pub use wallet::{MemoryWallet, WalletError, WalletInvoice, WalletPayment, WalletService};
