//! Settled-balance report read from a JSON export.

use std::path::PathBuf;

use gateway_types::{ProcessorReport, ProcessorReportSource, ReportError};

/// Reads `{"balances": [...]}` from disk on every fetch.
#[derive(Debug, Clone)]
pub struct FileReportSource {
    path: PathBuf,
}

impl FileReportSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl ProcessorReportSource for FileReportSource {
    async fn fetch_report(&self) -> Result<ProcessorReport, ReportError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ReportError::Unavailable(format!("{}: {}", self.path.display(), e))
        })?;
        let report: ProcessorReport =
            serde_json::from_str(&raw).map_err(|e| ReportError::Malformed(e.to_string()))?;
        tracing::debug!(
            path = %self.path.display(),
            accounts = report.balances.len(),
            "Loaded processor report"
        );
        Ok(report)
    }
}
