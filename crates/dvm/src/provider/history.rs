//! Job history and statistics, read back from the provider's own events.

use std::collections::HashMap;

use nostr::{Event, Filter, JobFeedback, JobResult, JobStatus, KIND_JOB_FEEDBACK, get_result_kind};
use serde::{Deserialize, Serialize};

use super::DvmProviderService;
use crate::error::{DvmError, Result};

/// What the provider has published about one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub customer_pubkey: String,
    /// Status of the latest event; a result counts as `success`.
    pub status: JobStatus,
    /// Price quoted or charged, in millisats
    pub amount_msats: Option<u64>,
    pub first_seen: u64,
    pub last_updated: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHistoryPage {
    pub jobs: Vec<JobRecord>,
    /// Zero-based page index
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

impl JobHistoryPage {
    pub fn has_more(&self) -> bool {
        self.page.saturating_add(1).saturating_mul(self.page_size) < self.total
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub total_jobs: usize,
    pub by_status: HashMap<JobStatus, usize>,
    /// Sum of amounts on completed jobs
    pub revenue_msats: u64,
    /// Jobs still waiting for their invoice to be paid
    pub pending_payment: usize,
}

impl JobStatistics {
    pub fn count(&self, status: JobStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

impl DvmProviderService {
    /// Jobs newest first, `page_size` per page.
    pub async fn job_history(&self, page: usize, page_size: usize) -> Result<JobHistoryPage> {
        if page_size == 0 {
            return Err(DvmError::Validation("page_size must be at least 1".to_string()));
        }

        let records = self.job_records().await?;
        let total = records.len();
        let jobs = records
            .into_iter()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .collect();

        Ok(JobHistoryPage {
            jobs,
            page,
            page_size,
            total,
        })
    }

    pub async fn job_statistics(&self) -> Result<JobStatistics> {
        let records = self.job_records().await?;
        let mut stats = JobStatistics {
            total_jobs: records.len(),
            ..Default::default()
        };
        for record in &records {
            *stats.by_status.entry(record.status).or_insert(0) += 1;
            match record.status {
                JobStatus::Success => stats.revenue_msats += record.amount_msats.unwrap_or(0),
                JobStatus::PaymentRequired => stats.pending_payment += 1,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn job_records(&self) -> Result<Vec<JobRecord>> {
        let mut kinds: Vec<u16> = self
            .config()
            .supported_kinds
            .iter()
            .filter_map(|k| get_result_kind(*k))
            .collect();
        kinds.push(KIND_JOB_FEEDBACK);

        let filter = Filter::new()
            .kinds(kinds)
            .authors([self.pubkey().to_string()]);
        let events = self
            .transport()
            .query(vec![filter], self.config().query_timeout())
            .await?;

        Ok(project(self.pubkey(), events))
    }
}

/// Fold a provider's result and feedback events into one record per job,
/// newest first.
fn project(provider: &str, mut events: Vec<Event>) -> Vec<JobRecord> {
    events.retain(|e| e.pubkey == provider);
    // replay in publish order so the latest event wins
    events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut records: HashMap<String, JobRecord> = HashMap::new();
    for event in &events {
        let (job_id, customer, status, amount) = if event.kind == KIND_JOB_FEEDBACK {
            match JobFeedback::from_event(event) {
                Ok(f) => (f.request_id, f.customer_pubkey, f.status, f.amount),
                Err(_) => continue,
            }
        } else {
            match JobResult::from_event(event) {
                Ok(r) => (r.request_id, r.customer_pubkey, JobStatus::Success, r.amount),
                Err(_) => continue,
            }
        };

        let record = records.entry(job_id.clone()).or_insert_with(|| JobRecord {
            job_id,
            customer_pubkey: customer,
            status,
            amount_msats: None,
            first_seen: event.created_at,
            last_updated: event.created_at,
        });
        // a result is final even if stray feedback lands after it
        if record.status != JobStatus::Success || status == JobStatus::Success {
            record.status = status;
        }
        record.last_updated = event.created_at;
        if amount.is_some() {
            record.amount_msats = amount;
        }
    }

    let mut records: Vec<JobRecord> = records.into_values().collect();
    records.sort_by(|a, b| {
        b.last_updated
            .cmp(&a.last_updated)
            .then_with(|| a.job_id.cmp(&b.job_id))
    });
    records
}
