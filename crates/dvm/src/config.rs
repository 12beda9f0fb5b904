//! Client and provider configuration, loaded from TOML.

use std::path::Path;
use std::time::Duration;

use nostr::{KIND_JOB_TEXT_GENERATION, is_hex_key, is_job_request_kind};
use serde::{Deserialize, Serialize};

use crate::error::{DvmError, Result};
use crate::provider::PricingConfig;

/// When the "paid" notice is released after an automatic payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentContinuation {
    /// Emit the notice as soon as the wallet confirms.
    #[default]
    Optimistic,
    /// Hold the notice until the provider sends its next non-payment event.
    AwaitResumption,
}

/// Pay-to-continue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Invoices at or below this amount are paid without asking.
    #[serde(default = "default_auto_pay_threshold_sats")]
    pub auto_pay_threshold_sats: u64,
    #[serde(default = "default_max_fee_sats")]
    pub max_fee_sats: u64,
    #[serde(default = "default_payment_timeout_secs")]
    pub payment_timeout_secs: u64,
    #[serde(default)]
    pub continuation: PaymentContinuation,
    /// Only used with `await-resumption`.
    #[serde(default = "default_resume_timeout_secs")]
    pub resume_timeout_secs: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            auto_pay_threshold_sats: default_auto_pay_threshold_sats(),
            max_fee_sats: default_max_fee_sats(),
            payment_timeout_secs: default_payment_timeout_secs(),
            continuation: PaymentContinuation::default(),
            resume_timeout_secs: default_resume_timeout_secs(),
        }
    }
}

impl PaymentConfig {
    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_secs)
    }

    pub fn resume_timeout(&self) -> Duration {
        Duration::from_secs(self.resume_timeout_secs)
    }
}

/// Requester-side settings for [`crate::DvmLanguageModel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DvmConfig {
    /// Relays asked to carry responses (`relays` tag).
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default = "default_job_kind")]
    pub job_kind: u16,
    /// Target provider. Required when `encrypt_requests` is set.
    pub provider_pubkey: Option<String>,
    #[serde(default)]
    pub encrypt_requests: bool,
    /// Fresh keypair for every request instead of a long-lived identity.
    #[serde(default = "default_true")]
    pub use_ephemeral_keys: bool,
    /// Maximum bid in millisats.
    pub bid_msats: Option<u64>,
    /// Model name passed as a `param` tag.
    pub model: Option<String>,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Capacity of the queue between the subscription and the consumer.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    #[serde(default)]
    pub payment: PaymentConfig,
}

impl Default for DvmConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            job_kind: default_job_kind(),
            provider_pubkey: None,
            encrypt_requests: false,
            use_ephemeral_keys: true,
            bid_msats: None,
            model: None,
            query_timeout_ms: default_query_timeout_ms(),
            stream_buffer: default_stream_buffer(),
            payment: PaymentConfig::default(),
        }
    }
}

impl DvmConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DvmError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_job_request_kind(self.job_kind) {
            return Err(DvmError::Config(format!(
                "job_kind {} is outside 5000-5999",
                self.job_kind
            )));
        }
        if let Some(pk) = &self.provider_pubkey {
            if !is_hex_key(pk) {
                return Err(DvmError::Config(
                    "provider_pubkey must be 64 lowercase hex characters".to_string(),
                ));
            }
        }
        if self.encrypt_requests && self.provider_pubkey.is_none() {
            return Err(DvmError::Config(
                "encrypt_requests requires provider_pubkey".to_string(),
            ));
        }
        if self.stream_buffer == 0 {
            return Err(DvmError::Config("stream_buffer must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Settings for [`crate::provider::DvmProviderService`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Request kinds this provider serves.
    #[serde(default = "default_supported_kinds")]
    pub supported_kinds: Vec<u16>,
    /// Model used when the request has no `model` param.
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default = "default_invoice_poll_ms")]
    pub invoice_poll_interval_ms: u64,
    /// How long to wait for the customer to pay before giving up.
    #[serde(default = "default_payment_timeout_secs")]
    pub payment_timeout_secs: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Requests older than this are ignored, and remembered request ids are
    /// forgotten once they pass it.
    #[serde(default = "default_max_request_age_secs")]
    pub max_request_age_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            supported_kinds: default_supported_kinds(),
            default_model: default_model(),
            pricing: PricingConfig::default(),
            invoice_poll_interval_ms: default_invoice_poll_ms(),
            payment_timeout_secs: default_payment_timeout_secs(),
            query_timeout_ms: default_query_timeout_ms(),
            max_request_age_secs: default_max_request_age_secs(),
        }
    }
}

impl ProviderConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        if let Some(kind) = config
            .supported_kinds
            .iter()
            .find(|k| !is_job_request_kind(**k))
        {
            return Err(DvmError::Config(format!(
                "supported kind {} is outside 5000-5999",
                kind
            )));
        }
        if config.pricing.min_price_msats > config.pricing.max_price_msats {
            return Err(DvmError::Config(
                "pricing.min_price_msats exceeds pricing.max_price_msats".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn invoice_poll_interval(&self) -> Duration {
        Duration::from_millis(self.invoice_poll_interval_ms.max(1))
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

fn default_job_kind() -> u16 {
    KIND_JOB_TEXT_GENERATION
}

fn default_true() -> bool {
    true
}

fn default_query_timeout_ms() -> u64 {
    5_000
}

fn default_stream_buffer() -> usize {
    64
}

fn default_auto_pay_threshold_sats() -> u64 {
    100
}

fn default_max_fee_sats() -> u64 {
    10
}

fn default_payment_timeout_secs() -> u64 {
    60
}

fn default_resume_timeout_secs() -> u64 {
    30
}

fn default_supported_kinds() -> Vec<u16> {
    vec![KIND_JOB_TEXT_GENERATION]
}

fn default_model() -> String {
    "llama3.2".to_string()
}

fn default_invoice_poll_ms() -> u64 {
    500
}

fn default_max_request_age_secs() -> u64 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DvmConfig::default();
        assert_eq!(config.job_kind, 5050);
        assert!(config.use_ephemeral_keys);
        assert_eq!(config.payment.continuation, PaymentContinuation::Optimistic);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = DvmConfig::from_toml_str("").unwrap();
        assert_eq!(config, DvmConfig::default());
    }

    #[test]
    fn test_parse_full_toml() {
        let raw = r#"
            relays = ["wss://relay.damus.io", "wss://nos.lol"]
            job_kind = 5100
            provider_pubkey = "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d"
            encrypt_requests = true
            bid_msats = 50000

            [payment]
            auto_pay_threshold_sats = 3
            continuation = "await-resumption"
            resume_timeout_secs = 5
        "#;

        let config = DvmConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.relays.len(), 2);
        assert_eq!(config.job_kind, 5100);
        assert!(config.encrypt_requests);
        assert_eq!(config.payment.auto_pay_threshold_sats, 3);
        assert_eq!(
            config.payment.continuation,
            PaymentContinuation::AwaitResumption
        );
        assert_eq!(config.payment.max_fee_sats, 10);
        assert_eq!(config.payment.resume_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_encryption_requires_provider() {
        let err = DvmConfig::from_toml_str("encrypt_requests = true").unwrap_err();
        assert!(matches!(err, DvmError::Config(_)));
    }

    #[test]
    fn test_rejects_result_kind() {
        assert!(DvmConfig::from_toml_str("job_kind = 6050").is_err());
    }

    #[test]
    fn test_rejects_unknown_continuation() {
        let raw = "[payment]\ncontinuation = \"eventually\"";
        assert!(matches!(
            DvmConfig::from_toml_str(raw),
            Err(DvmError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "stream_buffer = 8").unwrap();
        writeln!(file, "model = \"mistral\"").unwrap();

        let config = DvmConfig::load(file.path()).unwrap();
        assert_eq!(config.stream_buffer, 8);
        assert_eq!(config.model.as_deref(), Some("mistral"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = DvmConfig::load("/nonexistent/dvm.toml").unwrap_err();
        assert!(matches!(err, DvmError::Config(_)));
    }

    #[test]
    fn test_provider_config() {
        let raw = r#"
            supported_kinds = [5050, 5001]
            default_model = "mistral"

            [pricing]
            msats_per_token = 20
        "#;
        let config = ProviderConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.supported_kinds, vec![5050, 5001]);
        assert_eq!(config.pricing.msats_per_token, 20);
        assert_eq!(config.invoice_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.max_request_age_secs, 600);

        assert!(ProviderConfig::from_toml_str("supported_kinds = [7000]").is_err());
    }
}
