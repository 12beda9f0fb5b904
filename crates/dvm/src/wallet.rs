//! Lightning wallet seam used by both requester and provider.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::DvmError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    #[error("wallet unavailable: {0}")]
    Unavailable(String),
    #[error("payment failed: {0}")]
    PaymentFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<WalletError> for DvmError {
    fn from(err: WalletError) -> Self {
        DvmError::Payment(err.to_string())
    }
}

/// A settled outgoing payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletPayment {
    pub payment_id: String,
    pub amount_sats: u64,
    pub fee_sats: u64,
}

/// An invoice issued for incoming funds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletInvoice {
    /// bolt11 payment request
    pub payment_request: String,
    pub amount_sats: u64,
}

#[async_trait]
pub trait WalletService: Send + Sync {
    /// Pay a bolt11 invoice, spending at most `max_fee_sats` on routing.
    async fn pay_invoice(
        &self,
        invoice: &str,
        max_fee_sats: u64,
    ) -> Result<WalletPayment, WalletError>;

    async fn create_invoice(
        &self,
        _amount_sats: u64,
        _memo: &str,
    ) -> Result<WalletInvoice, WalletError> {
        Err(WalletError::InvalidRequest(
            "invoice creation not supported".to_string(),
        ))
    }

    /// Whether an invoice this wallet issued has been paid.
    async fn invoice_paid(&self, _payment_request: &str) -> Result<bool, WalletError> {
        Err(WalletError::InvalidRequest(
            "invoice lookup not supported".to_string(),
        ))
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    balance_sats: u64,
    invoices: HashMap<String, InvoiceRecord>,
    payments: Vec<WalletPayment>,
    fail_payments: Option<String>,
    pay_delay: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
struct InvoiceRecord {
    amount_sats: u64,
    paid: bool,
}

/// In-process ledger wallet.
///
/// Invoices it issues are settled when any holder of the same ledger pays
/// them, so one instance can stand in for both sides of a job. Invoices it
/// did not issue are paid at face value zero.
#[derive(Debug, Default)]
pub struct MemoryWallet {
    state: Mutex<LedgerState>,
}

impl MemoryWallet {
    pub fn with_balance(balance_sats: u64) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                balance_sats,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_payments(&self, reason: Option<&str>) {
        self.state().fail_payments = reason.map(str::to_string);
    }

    /// Delay every payment, for exercising timeouts.
    pub fn delay_payments(&self, delay: Option<Duration>) {
        self.state().pay_delay = delay;
    }

    pub fn balance_sats(&self) -> u64 {
        self.state().balance_sats
    }

    pub fn payments(&self) -> Vec<WalletPayment> {
        self.state().payments.clone()
    }
}

#[async_trait]
impl WalletService for MemoryWallet {
    async fn pay_invoice(
        &self,
        invoice: &str,
        _max_fee_sats: u64,
    ) -> Result<WalletPayment, WalletError> {
        let delay = self.state().pay_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(reason) = &state.fail_payments {
            return Err(WalletError::PaymentFailed(reason.clone()));
        }

        let amount_sats = match state.invoices.get(invoice).copied() {
            Some(record) if record.paid => {
                return Err(WalletError::PaymentFailed("invoice already paid".to_string()));
            }
            Some(record) => record.amount_sats,
            None => 0,
        };
        if amount_sats > state.balance_sats {
            return Err(WalletError::PaymentFailed(format!(
                "insufficient balance: need {} sats, have {}",
                amount_sats, state.balance_sats
            )));
        }

        state.balance_sats -= amount_sats;
        if let Some(record) = state.invoices.get_mut(invoice) {
            record.paid = true;
        }
        let payment = WalletPayment {
            payment_id: uuid::Uuid::new_v4().to_string(),
            amount_sats,
            fee_sats: 0,
        };
        state.payments.push(payment.clone());
        Ok(payment)
    }

    async fn create_invoice(
        &self,
        amount_sats: u64,
        _memo: &str,
    ) -> Result<WalletInvoice, WalletError> {
        // 1 sat = 10 nano-bitcoin in the bolt11 amount field
        let payment_request = format!(
            "lnbcrt{}n1{}",
            amount_sats * 10,
            uuid::Uuid::new_v4().simple()
        );
        self.state().invoices.insert(
            payment_request.clone(),
            InvoiceRecord {
                amount_sats,
                paid: false,
            },
        );
        Ok(WalletInvoice {
            payment_request,
            amount_sats,
        })
    }

    async fn invoice_paid(&self, payment_request: &str) -> Result<bool, WalletError> {
        self.state()
            .invoices
            .get(payment_request)
            .map(|r| r.paid)
            .ok_or_else(|| WalletError::InvalidRequest("unknown invoice".to_string()))
    }
}
