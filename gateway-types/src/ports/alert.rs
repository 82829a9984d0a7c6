//! Operator alerting port.

use crate::domain::TransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// Settlement retry budget exhausted or settlement declined.
    SettlementFailed,
    /// A write was halted because its ledger entries did not balance.
    LedgerImbalance,
    /// Reconciliation found a discrepancy.
    ReconciliationMismatch,
    /// A broker message could not be processed at all.
    PoisonMessage,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::SettlementFailed => "settlement_failed",
            AlertKind::LedgerImbalance => "ledger_imbalance",
            AlertKind::ReconciliationMismatch => "reconciliation_mismatch",
            AlertKind::PoisonMessage => "poison_message",
        }
    }
}

/// An operator-visible alert. `detail` holds error kinds, never payment data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub kind: AlertKind,
    pub transaction_id: Option<TransactionId>,
    pub detail: String,
}

impl Alert {
    pub fn new(kind: AlertKind, transaction_id: Option<TransactionId>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            transaction_id,
            detail: detail.into(),
        }
    }
}

/// Port trait for alert delivery.
pub trait AlertSink: Send + Sync + 'static {
    fn raise(&self, alert: Alert);
}
