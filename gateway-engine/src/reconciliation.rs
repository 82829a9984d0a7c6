//! Reconciliation job.
//!
//! Compares the ledger with the processor's settled-balance report, looks
//! for transactions stuck in flight, and replays every running balance.
//! The job only reads: every finding goes into the report and onto the
//! alert sink, and nothing is ever corrected automatically.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use gateway_types::domain::fold_balance;
use gateway_types::{
    Alert, AlertKind, AlertSink, AppError, LedgerReader, Mismatch, MismatchKind,
    ProcessorReportSource, ReconciliationReport, TransactionReader,
};

use crate::config::ReconciliationConfig;
use crate::retry::{bounded, chrono_duration};

/// Stale transactions examined per run.
const STALE_SCAN_LIMIT: i64 = 500;

pub struct ReconciliationJob<S> {
    store: Arc<S>,
    reports: Arc<dyn ProcessorReportSource>,
    alerts: Arc<dyn AlertSink>,
    config: ReconciliationConfig,
    db_timeout: Duration,
}

impl<S> ReconciliationJob<S>
where
    S: LedgerReader + TransactionReader,
{
    pub fn new(
        store: Arc<S>,
        reports: Arc<dyn ProcessorReportSource>,
        alerts: Arc<dyn AlertSink>,
        config: ReconciliationConfig,
        db_timeout: Duration,
    ) -> Self {
        Self {
            store,
            reports,
            alerts,
            config,
            db_timeout,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReconciliationReport, AppError> {
        let mut mismatches = self.compare_reported_balances().await?;
        mismatches.extend(self.find_stale_transactions(now).await?);
        mismatches.extend(self.find_balance_drift().await?);

        for mismatch in &mismatches {
            self.alerts.raise(Alert::new(
                AlertKind::ReconciliationMismatch,
                mismatch.transaction_id,
                kind_str(mismatch.kind),
            ));
        }

        let report = ReconciliationReport {
            generated_at: now,
            mismatches,
        };
        tracing::info!(
            mismatches = report.mismatches.len(),
            balance_mismatch = report.count(MismatchKind::BalanceMismatch),
            stale_transaction = report.count(MismatchKind::StaleTransaction),
            balance_drift = report.count(MismatchKind::BalanceDrift),
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn compare_reported_balances(&self) -> Result<Vec<Mismatch>, AppError> {
        let report = self.reports.fetch_report().await.map_err(|err| {
            tracing::warn!(error = %err, "Processor report unavailable");
            AppError::TransientDependency("processor report unavailable".into())
        })?;

        let mut mismatches = Vec::new();
        for reported in &report.balances {
            let ledger = bounded(
                self.db_timeout,
                "account_balance",
                self.store.account_balance(&reported.account, reported.currency),
            )
            .await?;
            if ledger != reported.settled_amount {
                mismatches.push(Mismatch {
                    transaction_id: None,
                    account: Some(reported.account.masked()),
                    currency: Some(reported.currency),
                    expected: reported.settled_amount,
                    actual: ledger,
                    kind: MismatchKind::BalanceMismatch,
                });
            }
        }
        Ok(mismatches)
    }

    async fn find_stale_transactions(&self, now: DateTime<Utc>) -> Result<Vec<Mismatch>, AppError> {
        let threshold = chrono_duration(self.config.stale_after);
        let stale = bounded(
            self.db_timeout,
            "list_stale_transactions",
            self.store
                .list_stale_transactions(now - threshold, STALE_SCAN_LIMIT),
        )
        .await?;

        Ok(stale
            .into_iter()
            .map(|tx| Mismatch {
                transaction_id: Some(tx.id),
                account: None,
                currency: None,
                expected: threshold.num_seconds(),
                actual: (now - tx.updated_at).num_seconds(),
                kind: MismatchKind::StaleTransaction,
            })
            .collect())
    }

    async fn find_balance_drift(&self) -> Result<Vec<Mismatch>, AppError> {
        let balances = bounded(
            self.db_timeout,
            "list_account_balances",
            self.store.list_account_balances(),
        )
        .await?;

        let mut mismatches = Vec::new();
        for row in balances {
            let entries = bounded(
                self.db_timeout,
                "entries_for_account",
                self.store.entries_for_account(&row.account_id, row.currency),
            )
            .await?;
            let replayed = fold_balance(&entries, &row.account_id, row.currency);
            if replayed != row.balance {
                mismatches.push(Mismatch {
                    transaction_id: None,
                    account: Some(row.account_id.masked()),
                    currency: Some(row.currency),
                    expected: replayed,
                    actual: row.balance,
                    kind: MismatchKind::BalanceDrift,
                });
            }
        }
        Ok(mismatches)
    }

    /// Runs at the configured interval until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; wait a full interval instead.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once(Utc::now()).await {
                        tracing::warn!(kind = err.kind(), "Reconciliation run failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Reconciliation loop stopped");
    }
}

fn kind_str(kind: MismatchKind) -> &'static str {
    match kind {
        MismatchKind::BalanceMismatch => "balance_mismatch",
        MismatchKind::StaleTransaction => "stale_transaction",
        MismatchKind::BalanceDrift => "balance_drift",
    }
}
