//! Job lifecycle as a pure reducer over a closed set of events.
//!
//! `Created -> [PaymentRequired] -> Processing -> [Partial]* -> Success | Error`,
//! plus `Cancelled`. Once terminal, every further event is ignored, which is
//! what makes duplicate terminal deliveries harmless.

use crate::error::DvmError;
use crate::stream::StreamChunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobLifecycleState {
    #[default]
    Created,
    PaymentRequired,
    Processing,
    Partial,
    Success,
    Error,
    Cancelled,
}

impl JobLifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobLifecycleState::Success | JobLifecycleState::Error | JobLifecycleState::Cancelled
        )
    }
}

/// Everything that can happen to a job, from the provider or locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    PaymentRequired {
        amount_msats: Option<u64>,
        invoice: Option<String>,
        content: String,
    },
    /// Our wallet paid. `hold` keeps the notice until the provider resumes.
    PaymentSettled { amount_sats: u64, hold: bool },
    /// Invoice left for the user to pay.
    PaymentDeferred {
        invoice: String,
        amount_sats: Option<u64>,
    },
    Processing,
    Partial { content: String },
    /// Feedback with status `success`.
    Success { content: String },
    /// A result event.
    Result { content: String },
    ProviderError { message: String },
    /// Local failure: payment, decryption, transport.
    Failed { error: DvmError },
    /// No provider event arrived within the resumption window.
    ResumeTimeout,
    Cancelled,
}

/// Side effects the driver must perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Emit(StreamChunk),
    HandlePayment {
        amount_msats: Option<u64>,
        invoice: Option<String>,
        content: String,
    },
    /// Start the resumption timer.
    AwaitResumption,
    Fail(DvmError),
    /// Tear down the subscription. Emitted exactly once per job.
    Teardown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobProgress {
    pub state: JobLifecycleState,
    /// Concatenated partial output.
    pub accumulated: String,
    pub paid: bool,
    /// "paid" notice waiting for the provider to resume.
    pub held_notice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: JobProgress,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn ignore(progress: &JobProgress) -> Self {
        Self {
            next: progress.clone(),
            effects: Vec::new(),
        }
    }
}

pub fn reduce(progress: &JobProgress, event: LifecycleEvent) -> Transition {
    if progress.state.is_terminal() {
        return Transition::ignore(progress);
    }

    let mut next = progress.clone();
    let mut effects = Vec::new();

    // any real provider progress releases a held payment notice
    if matches!(
        event,
        LifecycleEvent::Processing
            | LifecycleEvent::Partial { .. }
            | LifecycleEvent::Success { .. }
            | LifecycleEvent::Result { .. }
            | LifecycleEvent::ProviderError { .. }
    ) {
        if let Some(notice) = next.held_notice.take() {
            effects.push(Effect::Emit(StreamChunk::info(notice)));
        }
    }

    match event {
        LifecycleEvent::PaymentRequired {
            amount_msats,
            invoice,
            content,
        } => {
            if next.paid || next.state == JobLifecycleState::PaymentRequired {
                return Transition::ignore(progress);
            }
            next.state = JobLifecycleState::PaymentRequired;
            effects.push(Effect::HandlePayment {
                amount_msats,
                invoice,
                content,
            });
        }
        LifecycleEvent::PaymentSettled { amount_sats, hold } => {
            if next.paid {
                return Transition::ignore(progress);
            }
            next.paid = true;
            let notice = format!("Paid {} sats to continue the job", amount_sats);
            if hold {
                next.held_notice = Some(notice);
                effects.push(Effect::AwaitResumption);
            } else {
                effects.push(Effect::Emit(StreamChunk::info(notice)));
            }
        }
        LifecycleEvent::PaymentDeferred {
            invoice,
            amount_sats,
        } => {
            let notice = match amount_sats {
                Some(sats) => format!("Payment of {} sats required to continue: {}", sats, invoice),
                None => format!("Payment required to continue: {}", invoice),
            };
            effects.push(Effect::Emit(StreamChunk::info(notice)));
        }
        LifecycleEvent::Processing => {
            if next.state != JobLifecycleState::Partial {
                next.state = JobLifecycleState::Processing;
            }
        }
        LifecycleEvent::Partial { content } => {
            if !content.is_empty() {
                next.state = JobLifecycleState::Partial;
                next.accumulated.push_str(&content);
                effects.push(Effect::Emit(StreamChunk::text(content)));
            }
        }
        LifecycleEvent::Success { content } | LifecycleEvent::Result { content } => {
            next.state = JobLifecycleState::Success;
            if !content.is_empty() && content != next.accumulated {
                effects.push(Effect::Emit(StreamChunk::text(content)));
            }
            effects.push(Effect::Teardown);
        }
        LifecycleEvent::ProviderError { message } => {
            next.state = JobLifecycleState::Error;
            effects.push(Effect::Fail(DvmError::Protocol(message)));
            effects.push(Effect::Teardown);
        }
        LifecycleEvent::Failed { error } => {
            next.state = JobLifecycleState::Error;
            next.held_notice = None;
            effects.push(Effect::Fail(error));
            effects.push(Effect::Teardown);
        }
        LifecycleEvent::ResumeTimeout => {
            if next.held_notice.take().is_none() {
                return Transition::ignore(progress);
            }
            next.state = JobLifecycleState::Error;
            effects.push(Effect::Fail(DvmError::Protocol(
                "provider did not resume after payment".to_string(),
            )));
            effects.push(Effect::Teardown);
        }
        LifecycleEvent::Cancelled => {
            next.state = JobLifecycleState::Cancelled;
            next.held_notice = None;
            effects.push(Effect::Teardown);
        }
    }

    Transition { next, effects }
}
