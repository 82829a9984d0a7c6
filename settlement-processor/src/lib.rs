//! # Settlement Processor Adapters
//!
//! Implementations of the settlement ports from `gateway-types`:
//!
//! - [`HttpSettlementProcessor`] / [`HttpReportSource`] - the processor's HTTP API
//! - [`FileReportSource`] - a settled-balance report exported to a JSON file
//! - [`SimulatedProcessor`] / [`StaticReportSource`] - in-process stand-ins for
//!   development and tests
//!
//! Every processor adapter honours the external reference as an idempotency
//! token, so a redelivered instruction never moves money twice.

mod file;
mod http;
mod simulated;

pub use file::FileReportSource;
pub use http::{HttpReportSource, HttpSettlementProcessor};
pub use simulated::{SimulatedProcessor, StaticReportSource};

use gateway_types::SettlementInstruction;

/// Idempotency token sent with every processor call.
pub(crate) fn reference_for(instruction: &SettlementInstruction) -> String {
    instruction
        .external_reference
        .clone()
        .unwrap_or_else(|| format!("tx_{}", instruction.transaction_id.as_uuid().simple()))
}
