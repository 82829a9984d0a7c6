//! In-process processor for local runs and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use rand::Rng;

use gateway_types::{
    ProcessorReport, ProcessorReportSource, ReportError, SettlementError, SettlementInstruction,
    SettlementProcessor, SettlementReceipt,
};

use crate::reference_for;

#[derive(Default)]
struct Inner {
    /// Scripted outcomes consumed before any random behaviour applies.
    script: VecDeque<Result<(), SettlementError>>,
    /// Receipts already issued, keyed by external reference.
    settled: HashMap<String, SettlementReceipt>,
    refunded: HashMap<String, SettlementReceipt>,
    calls: usize,
}

/// Simulated processor honouring external references as idempotency tokens.
///
/// A repeated call with a reference it has already accepted returns the
/// original receipt and does not count as a new settlement.
pub struct SimulatedProcessor {
    failure_rate: f64,
    inner: Mutex<Inner>,
}

impl Default for SimulatedProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProcessor {
    /// Processor that accepts everything.
    pub fn new() -> Self {
        Self::with_failure_rate(0.0)
    }

    /// Processor that fails transiently with the given probability.
    pub fn with_failure_rate(rate: f64) -> Self {
        Self {
            failure_rate: rate.clamp(0.0, 1.0),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Queues outcomes returned by the next calls, in order.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Result<(), SettlementError>>) {
        self.lock().script.extend(outcomes);
    }

    /// Number of distinct references settled.
    pub fn settled_count(&self) -> usize {
        self.lock().settled.len()
    }

    /// Number of distinct references refunded.
    pub fn refunded_count(&self) -> usize {
        self.lock().refunded.len()
    }

    /// Total calls received, including repeats and failures.
    pub fn call_count(&self) -> usize {
        self.lock().calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn execute(
        &self,
        instruction: &SettlementInstruction,
        refund: bool,
    ) -> Result<SettlementReceipt, SettlementError> {
        let reference = reference_for(instruction);
        let mut inner = self.lock();
        inner.calls += 1;

        let issued = if refund { &inner.refunded } else { &inner.settled };
        if let Some(receipt) = issued.get(&reference) {
            return Ok(receipt.clone());
        }

        let scripted = inner.script.pop_front();
        match scripted {
            Some(Err(err)) => return Err(err),
            Some(Ok(())) => {}
            None => {
                if self.failure_rate > 0.0 && rand::rng().random_bool(self.failure_rate) {
                    return Err(SettlementError::Transient("simulated outage".into()));
                }
            }
        }

        let receipt = SettlementReceipt {
            processor_reference: format!("sim_{}", uuid::Uuid::new_v4().simple()),
        };
        let issued = if refund { &mut inner.refunded } else { &mut inner.settled };
        issued.insert(reference, receipt.clone());
        tracing::debug!(
            transaction_id = %instruction.transaction_id,
            refund,
            "Simulated processor accepted call"
        );
        Ok(receipt)
    }
}

#[async_trait::async_trait]
impl SettlementProcessor for SimulatedProcessor {
    async fn settle(
        &self,
        instruction: &SettlementInstruction,
    ) -> Result<SettlementReceipt, SettlementError> {
        self.execute(instruction, false)
    }

    async fn refund(
        &self,
        instruction: &SettlementInstruction,
    ) -> Result<SettlementReceipt, SettlementError> {
        self.execute(instruction, true)
    }
}

/// Report source returning a fixed report.
#[derive(Debug, Clone, Default)]
pub struct StaticReportSource {
    report: ProcessorReport,
}

impl StaticReportSource {
    pub fn new(report: ProcessorReport) -> Self {
        Self { report }
    }
}

#[async_trait::async_trait]
impl ProcessorReportSource for StaticReportSource {
    async fn fetch_report(&self) -> Result<ProcessorReport, ReportError> {
        Ok(self.report.clone())
    }
}
