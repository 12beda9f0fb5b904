//! Provider side of the job protocol: serve requests addressed to us, get
//! paid first, stream progress back, and report on past jobs.

mod history;
mod pricing;
mod service;

pub use history::{JobHistoryPage, JobRecord, JobStatistics};
pub use pricing::{Msats, PricingConfig, estimate_tokens};
pub use service::{DvmProviderService, ProviderHandle};
