//! External settlement processor ports.
//!
//! The processor is a capability the engine calls; card-network protocols
//! live behind it.

use crate::domain::SettlementInstruction;
use crate::dto::ProcessorReport;

/// Receipt returned by the processor for a successful call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReceipt {
    pub processor_reference: String,
}

/// Error type for settlement calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettlementError {
    /// Worth retrying: timeouts, throttling, processor outages.
    #[error("Transient settlement failure: {0}")]
    Transient(String),

    /// Permanent refusal by the processor.
    #[error("Settlement declined: {0}")]
    Declined(String),
}

/// Port trait for the external settlement processor.
///
/// Implementations must treat `external_reference` as an idempotency token:
/// repeating a call with the same reference must not move money twice.
#[async_trait::async_trait]
pub trait SettlementProcessor: Send + Sync + 'static {
    async fn settle(
        &self,
        instruction: &SettlementInstruction,
    ) -> Result<SettlementReceipt, SettlementError>;

    async fn refund(
        &self,
        instruction: &SettlementInstruction,
    ) -> Result<SettlementReceipt, SettlementError>;
}

/// Error type for report retrieval.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Report source unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed report: {0}")]
    Malformed(String),
}

/// Port trait for the processor's settled-balance report.
#[async_trait::async_trait]
pub trait ProcessorReportSource: Send + Sync + 'static {
    async fn fetch_report(&self) -> Result<ProcessorReport, ReportError>;
}
