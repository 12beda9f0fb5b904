//! NIP-90: Data Vending Machine job requests, results and feedback.
//!
//! - 5000-5999: job requests
//! - 6000-6999: job results (request kind + 1000)
//! - 7000: job feedback
//!
//! Builders produce tag arrays for signing; `from_event` parsers read them
//! back. Parsing is strict about the tags that identify a message (`e`,
//! `status`) and lenient about side-channel tags such as `amount`, which are
//! dropped when malformed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::nip01::Event;

pub const JOB_REQUEST_KIND_MIN: u16 = 5000;
pub const JOB_REQUEST_KIND_MAX: u16 = 5999;
pub const JOB_RESULT_KIND_MIN: u16 = 6000;
pub const JOB_RESULT_KIND_MAX: u16 = 6999;
pub const KIND_JOB_FEEDBACK: u16 = 7000;

/// Text generation / chat
pub const KIND_JOB_TEXT_GENERATION: u16 = 5050;

/// Client-generated request correlation tag.
pub const TAG_CORRELATION: &str = "correlation";

#[derive(Debug, Error)]
pub enum Nip90Error {
    #[error("invalid kind: {0} (expected {1})")]
    InvalidKind(u16, String),

    #[error("missing required tag: {0}")]
    MissingTag(String),

    #[error("malformed tag: {0}")]
    MalformedTag(String),

    #[error("invalid input type: {0}")]
    InvalidInputType(String),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// How the data of an `i` tag should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Url,
    Event,
    Job,
    Text,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::Url => "url",
            InputType::Event => "event",
            InputType::Job => "job",
            InputType::Text => "text",
        }
    }
}

impl FromStr for InputType {
    type Err = Nip90Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "url" => Ok(InputType::Url),
            "event" => Ok(InputType::Event),
            "job" => Ok(InputType::Job),
            "text" => Ok(InputType::Text),
            _ => Err(Nip90Error::InvalidInputType(s.to_string())),
        }
    }
}

/// Status carried by a feedback event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    PaymentRequired,
    Processing,
    Error,
    Success,
    Partial,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::PaymentRequired => "payment-required",
            JobStatus::Processing => "processing",
            JobStatus::Error => "error",
            JobStatus::Success => "success",
            JobStatus::Partial => "partial",
        }
    }

    /// `success` and `error` end a job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }
}

impl FromStr for JobStatus {
    type Err = Nip90Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payment-required" => Ok(JobStatus::PaymentRequired),
            "processing" => Ok(JobStatus::Processing),
            "error" => Ok(JobStatus::Error),
            "success" => Ok(JobStatus::Success),
            "partial" => Ok(JobStatus::Partial),
            _ => Err(Nip90Error::InvalidStatus(s.to_string())),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `["i", data, type, relay?, marker?]` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInput {
    pub data: String,
    pub input_type: InputType,
    pub relay: Option<String>,
    pub marker: Option<String>,
}

impl JobInput {
    pub fn text(data: impl Into<String>) -> Self {
        Self::new(data, InputType::Text)
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::new(url, InputType::Url)
    }

    /// Output of a previous job, for chaining.
    pub fn job(job_id: impl Into<String>, relay: Option<String>) -> Self {
        Self {
            relay,
            ..Self::new(job_id, InputType::Job)
        }
    }

    fn new(data: impl Into<String>, input_type: InputType) -> Self {
        Self {
            data: data.into(),
            input_type,
            relay: None,
            marker: None,
        }
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    pub fn to_tag(&self) -> Vec<String> {
        let mut tag = vec![
            "i".to_string(),
            self.data.clone(),
            self.input_type.as_str().to_string(),
        ];
        // relay slot is positional, keep it when only a marker is set
        if self.relay.is_some() || self.marker.is_some() {
            tag.push(self.relay.clone().unwrap_or_default());
        }
        if let Some(marker) = &self.marker {
            tag.push(marker.clone());
        }
        tag
    }

    pub fn from_tag(tag: &[String]) -> Result<Self, Nip90Error> {
        match tag {
            [name, data, kind, rest @ ..] if name == "i" => Ok(Self {
                data: data.clone(),
                input_type: kind.parse()?,
                relay: rest.first().filter(|s| !s.is_empty()).cloned(),
                marker: rest.get(1).filter(|s| !s.is_empty()).cloned(),
            }),
            _ => Err(Nip90Error::MalformedTag(
                "i tag requires data and type".to_string(),
            )),
        }
    }
}

/// One `["param", name, value]` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobParam {
    pub key: String,
    pub value: String,
}

impl JobParam {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn to_tag(&self) -> Vec<String> {
        vec!["param".to_string(), self.key.clone(), self.value.clone()]
    }

    pub fn from_tag(tag: &[String]) -> Result<Self, Nip90Error> {
        match tag {
            [name, key, value] if name == "param" => Ok(Self::new(key.clone(), value.clone())),
            _ => Err(Nip90Error::MalformedTag(
                "param tag requires exactly a name and a value".to_string(),
            )),
        }
    }
}

/// A job request (kind 5000-5999).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub kind: u16,
    pub inputs: Vec<JobInput>,
    /// Expected output MIME type
    pub output: Option<String>,
    pub params: Vec<JobParam>,
    /// Maximum bid in millisats
    pub bid: Option<u64>,
    /// Relays where providers should publish responses
    pub relays: Vec<String>,
    /// Targeted provider pubkeys
    pub service_providers: Vec<String>,
    pub correlation: Option<String>,
    pub encrypted: bool,
}

impl JobRequest {
    pub fn new(kind: u16) -> Result<Self, Nip90Error> {
        if !is_job_request_kind(kind) {
            return Err(Nip90Error::InvalidKind(kind, "5000-5999".to_string()));
        }

        Ok(Self {
            kind,
            inputs: Vec::new(),
            output: None,
            params: Vec::new(),
            bid: None,
            relays: Vec::new(),
            service_providers: Vec::new(),
            correlation: None,
            encrypted: false,
        })
    }

    pub fn add_input(mut self, input: JobInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, mime_type: impl Into<String>) -> Self {
        self.output = Some(mime_type.into());
        self
    }

    pub fn add_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push(JobParam::new(key, value));
        self
    }

    pub fn with_bid(mut self, millisats: u64) -> Self {
        self.bid = Some(millisats);
        self
    }

    pub fn add_relay(mut self, relay: impl Into<String>) -> Self {
        self.relays.push(relay.into());
        self
    }

    pub fn add_service_provider(mut self, pubkey: impl Into<String>) -> Self {
        self.service_providers.push(pubkey.into());
        self
    }

    pub fn with_correlation(mut self, correlation: impl Into<String>) -> Self {
        self.correlation = Some(correlation.into());
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    /// Tags describing the job itself: inputs, output, params, bid, relays
    /// and correlation. For encrypted requests these form the ciphertext.
    pub fn payload_tags(&self) -> Vec<Vec<String>> {
        let mut tags: Vec<Vec<String>> = self.inputs.iter().map(JobInput::to_tag).collect();

        if let Some(output) = &self.output {
            tags.push(vec!["output".to_string(), output.clone()]);
        }
        tags.extend(self.params.iter().map(JobParam::to_tag));
        if let Some(bid) = self.bid {
            tags.push(vec!["bid".to_string(), bid.to_string()]);
        }
        if !self.relays.is_empty() {
            let mut relay_tag = vec!["relays".to_string()];
            relay_tag.extend(self.relays.iter().cloned());
            tags.push(relay_tag);
        }
        if let Some(correlation) = &self.correlation {
            tags.push(vec![TAG_CORRELATION.to_string(), correlation.clone()]);
        }
        tags
    }

    /// Tags visible on the wire. Encrypted requests only expose the
    /// provider and the `encrypted` marker.
    pub fn to_tags(&self) -> Vec<Vec<String>> {
        let mut tags = if self.encrypted {
            Vec::new()
        } else {
            self.payload_tags()
        };
        for sp in &self.service_providers {
            tags.push(vec!["p".to_string(), sp.clone()]);
        }
        if self.encrypted {
            tags.push(vec!["encrypted".to_string()]);
        }
        tags
    }

    /// Parse a request from its kind and (already decrypted) tags.
    pub fn from_tags(kind: u16, tags: &[Vec<String>]) -> Result<Self, Nip90Error> {
        let mut request = Self::new(kind)?;
        for tag in tags {
            match tag.first().map(String::as_str) {
                Some("i") => request.inputs.push(JobInput::from_tag(tag)?),
                Some("param") => request.params.push(JobParam::from_tag(tag)?),
                Some("output") => request.output = tag.get(1).cloned(),
                Some("bid") => request.bid = tag.get(1).and_then(|v| v.parse().ok()),
                Some("relays") => request.relays.extend(tag.iter().skip(1).cloned()),
                Some("p") => {
                    if let Some(pk) = tag.get(1) {
                        request.service_providers.push(pk.clone());
                    }
                }
                Some(TAG_CORRELATION) => request.correlation = tag.get(1).cloned(),
                Some("encrypted") => request.encrypted = true,
                _ => {}
            }
        }
        Ok(request)
    }

    /// Parse the plaintext tags of a request event.
    pub fn from_event(event: &Event) -> Result<Self, Nip90Error> {
        Self::from_tags(event.kind, &event.tags)
    }

    pub fn result_kind(&self) -> u16 {
        self.kind + 1000
    }
}

/// A job result (kind 6000-6999).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub kind: u16,
    pub content: String,
    /// Stringified original request event
    pub request: Option<String>,
    pub request_id: String,
    pub request_relay: Option<String>,
    pub inputs: Vec<JobInput>,
    pub customer_pubkey: String,
    /// Amount requested in millisats
    pub amount: Option<u64>,
    pub bolt11: Option<String>,
    pub encrypted: bool,
}

impl JobResult {
    pub fn new(
        request_kind: u16,
        request_id: impl Into<String>,
        customer_pubkey: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Self, Nip90Error> {
        let kind = get_result_kind(request_kind)
            .ok_or_else(|| Nip90Error::InvalidKind(request_kind, "5000-5999".to_string()))?;

        Ok(Self {
            kind,
            content: content.into(),
            request: None,
            request_id: request_id.into(),
            request_relay: None,
            inputs: Vec::new(),
            customer_pubkey: customer_pubkey.into(),
            amount: None,
            bolt11: None,
            encrypted: false,
        })
    }

    pub fn with_request(mut self, request_json: impl Into<String>) -> Self {
        self.request = Some(request_json.into());
        self
    }

    pub fn add_input(mut self, input: JobInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_amount(mut self, millisats: u64, bolt11: Option<String>) -> Self {
        self.amount = Some(millisats);
        self.bolt11 = bolt11;
        self
    }

    pub fn to_tags(&self) -> Vec<Vec<String>> {
        let mut tags = Vec::new();

        if let Some(request) = &self.request {
            tags.push(vec!["request".to_string(), request.clone()]);
        }
        tags.push(e_tag(&self.request_id, self.request_relay.as_deref()));
        tags.extend(self.inputs.iter().map(JobInput::to_tag));
        tags.push(vec!["p".to_string(), self.customer_pubkey.clone()]);
        if let Some(amount) = self.amount {
            tags.push(amount_tag(amount, self.bolt11.as_deref()));
        }
        if self.encrypted {
            tags.push(vec!["encrypted".to_string()]);
        }
        tags
    }

    /// Parse a result event. Content is left as-is, callers decrypt when
    /// `encrypted` is set.
    pub fn from_event(event: &Event) -> Result<Self, Nip90Error> {
        if !is_job_result_kind(event.kind) {
            return Err(Nip90Error::InvalidKind(event.kind, "6000-6999".to_string()));
        }

        let (request_id, request_relay) = parse_e_tag(&event.tags)?;
        let (amount, bolt11) = parse_amount(&event.tags);
        let inputs = event
            .tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some("i"))
            .filter_map(|t| JobInput::from_tag(t).ok())
            .collect();

        Ok(Self {
            kind: event.kind,
            content: event.content.clone(),
            request: event.tag_value("request").map(str::to_string),
            request_id,
            request_relay,
            inputs,
            customer_pubkey: event.tag_value("p").unwrap_or_default().to_string(),
            amount,
            bolt11,
            encrypted: event.has_tag("encrypted"),
        })
    }
}

/// A job feedback message (kind 7000).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFeedback {
    pub status: JobStatus,
    /// Human readable detail in the third slot of the status tag
    pub status_extra: Option<String>,
    pub request_id: String,
    pub request_relay: Option<String>,
    pub customer_pubkey: String,
    /// Partial output, or an invoice for some providers
    pub content: String,
    /// Amount requested in millisats
    pub amount: Option<u64>,
    pub bolt11: Option<String>,
    pub encrypted: bool,
}

impl JobFeedback {
    pub fn new(
        status: JobStatus,
        request_id: impl Into<String>,
        customer_pubkey: impl Into<String>,
    ) -> Self {
        Self {
            status,
            status_extra: None,
            request_id: request_id.into(),
            request_relay: None,
            customer_pubkey: customer_pubkey.into(),
            content: String::new(),
            amount: None,
            bolt11: None,
            encrypted: false,
        }
    }

    pub fn with_status_extra(mut self, extra: impl Into<String>) -> Self {
        self.status_extra = Some(extra.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_amount(mut self, millisats: u64, bolt11: Option<String>) -> Self {
        self.amount = Some(millisats);
        self.bolt11 = bolt11;
        self
    }

    pub fn to_tags(&self) -> Vec<Vec<String>> {
        let mut status_tag = vec!["status".to_string(), self.status.as_str().to_string()];
        if let Some(extra) = &self.status_extra {
            status_tag.push(extra.clone());
        }

        let mut tags = vec![
            status_tag,
            e_tag(&self.request_id, self.request_relay.as_deref()),
            vec!["p".to_string(), self.customer_pubkey.clone()],
        ];
        if let Some(amount) = self.amount {
            tags.push(amount_tag(amount, self.bolt11.as_deref()));
        }
        if self.encrypted {
            tags.push(vec!["encrypted".to_string()]);
        }
        tags
    }

    pub fn from_event(event: &Event) -> Result<Self, Nip90Error> {
        if !is_job_feedback_kind(event.kind) {
            return Err(Nip90Error::InvalidKind(event.kind, "7000".to_string()));
        }

        let status_tag = event
            .tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("status"))
            .ok_or_else(|| Nip90Error::MissingTag("status".to_string()))?;
        let status: JobStatus = status_tag
            .get(1)
            .ok_or_else(|| Nip90Error::MalformedTag("status tag without value".to_string()))?
            .parse()?;
        let status_extra = status_tag.get(2).filter(|s| !s.is_empty()).cloned();

        let (request_id, request_relay) = parse_e_tag(&event.tags)?;
        let (amount, bolt11) = parse_amount(&event.tags);

        Ok(Self {
            status,
            status_extra,
            request_id,
            request_relay,
            customer_pubkey: event.tag_value("p").unwrap_or_default().to_string(),
            content: event.content.clone(),
            amount,
            bolt11,
            encrypted: event.has_tag("encrypted"),
        })
    }
}

fn e_tag(request_id: &str, relay: Option<&str>) -> Vec<String> {
    let mut tag = vec!["e".to_string(), request_id.to_string()];
    if let Some(relay) = relay {
        tag.push(relay.to_string());
    }
    tag
}

fn amount_tag(millisats: u64, bolt11: Option<&str>) -> Vec<String> {
    let mut tag = vec!["amount".to_string(), millisats.to_string()];
    if let Some(bolt11) = bolt11 {
        tag.push(bolt11.to_string());
    }
    tag
}

fn parse_e_tag(tags: &[Vec<String>]) -> Result<(String, Option<String>), Nip90Error> {
    let tag = tags
        .iter()
        .find(|t| t.first().map(String::as_str) == Some("e") && t.len() >= 2)
        .ok_or_else(|| Nip90Error::MissingTag("e".to_string()))?;
    Ok((
        tag[1].clone(),
        tag.get(2).filter(|s| !s.is_empty()).cloned(),
    ))
}

/// Best-effort `["amount", msats, bolt11?]`. A non-numeric amount drops both.
fn parse_amount(tags: &[Vec<String>]) -> (Option<u64>, Option<String>) {
    let Some(tag) = tags
        .iter()
        .find(|t| t.first().map(String::as_str) == Some("amount"))
    else {
        return (None, None);
    };
    match tag.get(1).and_then(|v| v.parse::<u64>().ok()) {
        Some(amount) => (
            Some(amount),
            tag.get(2).filter(|s| !s.is_empty()).cloned(),
        ),
        None => (None, None),
    }
}

pub fn is_job_request_kind(kind: u16) -> bool {
    (JOB_REQUEST_KIND_MIN..=JOB_REQUEST_KIND_MAX).contains(&kind)
}

pub fn is_job_result_kind(kind: u16) -> bool {
    (JOB_RESULT_KIND_MIN..=JOB_RESULT_KIND_MAX).contains(&kind)
}

pub fn is_job_feedback_kind(kind: u16) -> bool {
    kind == KIND_JOB_FEEDBACK
}

/// Result kind for a request kind, `None` outside 5000-5999.
pub fn get_result_kind(request_kind: u16) -> Option<u16> {
    is_job_request_kind(request_kind).then(|| request_kind + 1000)
}
