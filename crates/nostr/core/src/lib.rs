//! Nostr protocol primitives used by the DVM job client.
//!
//! This crate provides:
//! - NIP-01: events, canonical serialization, signing, verification, filters
//! - NIP-04: encrypted payloads (ECDH + AES-256-CBC)
//! - NIP-90: Data Vending Machine job requests, results and feedback

mod filter;
mod nip01;
pub mod nip04;
mod nip90;

// NIP-01: Basic protocol
pub use nip01::{
    Event, EventTemplate, Keypair, Nip01Error, UnsignedEvent, finalize_event,
    generate_secret_key, get_event_hash, get_public_key, get_public_key_hex, is_hex_key,
    serialize_event, sort_events, unix_now, validate_event, validate_unsigned_event,
    verify_event,
};

// NIP-01: Filters
pub use filter::Filter;

// NIP-04: Encrypted payloads
pub use nip04::Nip04Error;

// NIP-90: Data Vending Machine
pub use nip90::{
    InputType, JOB_REQUEST_KIND_MAX, JOB_REQUEST_KIND_MIN, JOB_RESULT_KIND_MAX,
    JOB_RESULT_KIND_MIN, JobFeedback, JobInput, JobParam, JobRequest, JobResult, JobStatus,
    KIND_JOB_FEEDBACK, KIND_JOB_TEXT_GENERATION, Nip90Error, TAG_CORRELATION, get_result_kind,
    is_job_feedback_kind, is_job_request_kind, is_job_result_kind,
};
