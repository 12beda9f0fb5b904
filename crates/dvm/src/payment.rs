//! Pay-to-continue: decide whether a `payment-required` invoice is paid
//! automatically or handed to the user.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::PaymentConfig;
use crate::error::{DvmError, Result};
use crate::metrics::{MetricEvent, MetricsSink, TracingMetrics};
use crate::wallet::WalletService;

/// Millisats rounded up to whole sats.
pub fn msats_to_sats(msats: u64) -> u64 {
    msats.div_ceil(1000)
}

/// Pick the invoice from the `amount` tag, falling back to a bolt11 string in
/// the feedback content.
pub fn resolve_invoice(bolt11: Option<&str>, content: &str) -> Result<String> {
    if let Some(invoice) = bolt11.map(str::trim).filter(|s| !s.is_empty()) {
        return Ok(invoice.to_string());
    }
    let content = content.trim();
    if content.to_ascii_lowercase().starts_with("ln") {
        return Ok(content.to_string());
    }
    Err(DvmError::Protocol(
        "payment required but no invoice was provided".to_string(),
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// The wallet settled the invoice.
    Paid { amount_sats: u64, fee_sats: u64 },
    /// Left for the user: over threshold, unknown amount, or no wallet.
    Deferred {
        invoice: String,
        amount_sats: Option<u64>,
    },
}

pub struct PaymentHandler {
    wallet: Option<Arc<dyn WalletService>>,
    config: PaymentConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl PaymentHandler {
    pub fn new(wallet: Option<Arc<dyn WalletService>>, config: PaymentConfig) -> Self {
        Self {
            wallet,
            config,
            metrics: Arc::new(TracingMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &PaymentConfig {
        &self.config
    }

    /// Handle one `payment-required` feedback for `job_id`.
    ///
    /// Auto-pays when a wallet is configured and the amount is known and at or
    /// below the threshold. Wallet failures and timeouts are `Payment` errors.
    pub async fn handle(
        &self,
        job_id: &str,
        amount_msats: Option<u64>,
        bolt11: Option<&str>,
        content: &str,
    ) -> Result<PaymentOutcome> {
        let invoice = resolve_invoice(bolt11, content)?;
        let amount_sats = amount_msats.map(msats_to_sats);

        let wallet = match (&self.wallet, amount_sats) {
            (Some(wallet), Some(sats)) if sats <= self.config.auto_pay_threshold_sats => wallet,
            _ => {
                debug!(job_id, ?amount_sats, "surfacing invoice to the user");
                self.metrics.record(MetricEvent::InvoiceSurfaced {
                    job_id: job_id.to_string(),
                    amount_sats,
                    timestamp: chrono::Utc::now(),
                });
                return Ok(PaymentOutcome::Deferred {
                    invoice,
                    amount_sats,
                });
            }
        };

        let timeout = self.config.payment_timeout();
        let payment = match tokio::time::timeout(
            timeout,
            wallet.pay_invoice(&invoice, self.config.max_fee_sats),
        )
        .await
        {
            Ok(Ok(payment)) => payment,
            Ok(Err(err)) => {
                warn!(job_id, error = %err, "invoice payment failed");
                return Err(DvmError::Payment(err.to_string()));
            }
            Err(_) => {
                warn!(job_id, ?timeout, "invoice payment timed out");
                return Err(DvmError::Payment(format!(
                    "payment timed out after {}s",
                    timeout.as_secs()
                )));
            }
        };

        // the quoted amount is what the user agreed to; the wallet may not know it
        let paid_sats = amount_sats.unwrap_or(payment.amount_sats);
        info!(job_id, amount_sats = paid_sats, fee_sats = payment.fee_sats, "paid job invoice");
        self.metrics.record(MetricEvent::PaymentSent {
            job_id: job_id.to_string(),
            amount_sats: paid_sats,
            timestamp: chrono::Utc::now(),
        });

        Ok(PaymentOutcome::Paid {
            amount_sats: paid_sats,
            fee_sats: payment.fee_sats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RecordingMetrics;
    use crate::wallet::MemoryWallet;
    use std::time::Duration;

    fn handler(wallet: Option<Arc<MemoryWallet>>, threshold: u64) -> PaymentHandler {
        let config = PaymentConfig {
            auto_pay_threshold_sats: threshold,
            payment_timeout_secs: 1,
            ..Default::default()
        };
        PaymentHandler::new(wallet.map(|w| w as Arc<dyn WalletService>), config)
    }

    #[test]
    fn test_msats_round_up() {
        assert_eq!(msats_to_sats(0), 0);
        assert_eq!(msats_to_sats(1), 1);
        assert_eq!(msats_to_sats(1000), 1);
        assert_eq!(msats_to_sats(1001), 2);
    }

    #[test]
    fn test_resolve_invoice() {
        assert_eq!(resolve_invoice(Some("lnbc1tag"), "lnbc1content").unwrap(), "lnbc1tag");
        assert_eq!(resolve_invoice(None, " lnbc1content ").unwrap(), "lnbc1content");
        assert_eq!(resolve_invoice(Some(""), "LNBC1UPPER").unwrap(), "LNBC1UPPER");
        assert!(matches!(
            resolve_invoice(None, "please pay"),
            Err(DvmError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_pays_under_threshold() {
        let wallet = Arc::new(MemoryWallet::with_balance(100));
        let invoice = wallet.create_invoice(3, "job").await.unwrap();
        let metrics = Arc::new(RecordingMetrics::default());
        let handler = handler(Some(wallet.clone()), 10).with_metrics(metrics.clone());

        let outcome = handler
            .handle("job", Some(3000), Some(&invoice.payment_request), "")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PaymentOutcome::Paid {
                amount_sats: 3,
                fee_sats: 0
            }
        );
        assert_eq!(wallet.balance_sats(), 97);
        assert!(matches!(
            metrics.events().as_slice(),
            [MetricEvent::PaymentSent { amount_sats: 3, .. }]
        ));
    }

    #[tokio::test]
    async fn test_surfaces_over_threshold() {
        let wallet = Arc::new(MemoryWallet::with_balance(1_000));
        let handler = handler(Some(wallet.clone()), 10);

        let outcome = handler
            .handle("job", Some(500_000), Some("lnbc5000n1big"), "")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PaymentOutcome::Deferred {
                invoice: "lnbc5000n1big".to_string(),
                amount_sats: Some(500)
            }
        );
        assert!(wallet.payments().is_empty());
    }

    #[tokio::test]
    async fn test_surfaces_without_wallet_or_amount() {
        let none = handler(None, 10);
        assert!(matches!(
            none.handle("job", Some(1000), Some("lnbc1x"), "").await.unwrap(),
            PaymentOutcome::Deferred { .. }
        ));

        let wallet = Arc::new(MemoryWallet::with_balance(1_000));
        let unknown_amount = handler(Some(wallet), 10);
        assert!(matches!(
            unknown_amount.handle("job", None, None, "lnbc1x").await.unwrap(),
            PaymentOutcome::Deferred {
                amount_sats: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_wallet_failure_is_payment_error() {
        let wallet = Arc::new(MemoryWallet::with_balance(1_000));
        wallet.fail_payments(Some("no route"));
        let handler = handler(Some(wallet), 10);

        let err = handler
            .handle("job", Some(1000), Some("lnbc1x"), "")
            .await
            .unwrap_err();
        assert_eq!(err, DvmError::Payment("payment failed: no route".to_string()));
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_payment_timeout() {
        let wallet = Arc::new(MemoryWallet::with_balance(1_000));
        wallet.delay_payments(Some(Duration::from_secs(5)));
        let handler = handler(Some(wallet), 10);

        let err = handler
            .handle("job", Some(1000), Some("lnbc1x"), "")
            .await
            .unwrap_err();
        assert!(matches!(err, DvmError::Payment(msg) if msg.contains("timed out")));
    }
}
