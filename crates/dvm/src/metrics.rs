//! Fire-and-forget job telemetry.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Things worth counting about a job. Recording never affects the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricEvent {
    JobRequested {
        job_id: String,
        kind: u16,
        encrypted: bool,
        timestamp: DateTime<Utc>,
    },
    JobPublished {
        job_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Event dropped because it could not be decrypted.
    DecryptionFailed {
        job_id: String,
        event_id: String,
        timestamp: DateTime<Utc>,
    },
    PaymentSent {
        job_id: String,
        amount_sats: u64,
        timestamp: DateTime<Utc>,
    },
    /// Invoice handed to the user instead of being paid.
    InvoiceSurfaced {
        job_id: String,
        amount_sats: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    JobCompleted {
        job_id: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    JobFailed {
        job_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    JobCancelled {
        job_id: String,
        timestamp: DateTime<Utc>,
    },
    // Provider side
    RequestReceived {
        job_id: String,
        kind: u16,
        customer_pubkey: String,
        timestamp: DateTime<Utc>,
    },
    InvoiceIssued {
        job_id: String,
        amount_msats: u64,
        timestamp: DateTime<Utc>,
    },
}

impl MetricEvent {
    pub fn job_id(&self) -> &str {
        match self {
            MetricEvent::JobRequested { job_id, .. }
            | MetricEvent::JobPublished { job_id, .. }
            | MetricEvent::DecryptionFailed { job_id, .. }
            | MetricEvent::PaymentSent { job_id, .. }
            | MetricEvent::InvoiceSurfaced { job_id, .. }
            | MetricEvent::JobCompleted { job_id, .. }
            | MetricEvent::JobFailed { job_id, .. }
            | MetricEvent::JobCancelled { job_id, .. }
            | MetricEvent::RequestReceived { job_id, .. }
            | MetricEvent::InvoiceIssued { job_id, .. } => job_id,
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

/// Writes metrics as `tracing` events under the `dvm::metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, event: MetricEvent) {
        tracing::debug!(target: "dvm::metrics", job_id = %event.job_id(), ?event, "metric");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: MetricEvent) {}
}

/// Keeps every event in memory; handy for tests and diagnostics panes.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl MetricsSink for RecordingMetrics {
    fn record(&self, event: MetricEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
