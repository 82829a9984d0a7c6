//! HTTP adapters for the settlement processor API.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use gateway_types::{
    ProcessorReport, ProcessorReportSource, ReportError, SettlementError, SettlementInstruction,
    SettlementProcessor, SettlementReceipt,
};

use crate::reference_for;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Body of a settlement or refund call. Accounts go to the processor in full.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstructionBody<'a> {
    transaction_id: String,
    reference: &'a str,
    amount: i64,
    currency: &'a str,
    source_account: &'a str,
    destination_account: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptBody {
    processor_reference: Option<String>,
}

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

fn base(url: impl Into<String>) -> String {
    url.into().trim_end_matches('/').to_string()
}

/// Processor client for `POST {base}/settlements` and `POST {base}/refunds`.
#[derive(Clone)]
pub struct HttpSettlementProcessor {
    base_url: String,
    http: Client,
}

impl HttpSettlementProcessor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base(base_url),
            http: build_client(timeout),
        }
    }

    async fn send(
        &self,
        path: &str,
        instruction: &SettlementInstruction,
    ) -> Result<SettlementReceipt, SettlementError> {
        let reference = reference_for(instruction);
        let currency = instruction.amount.currency();
        let body = InstructionBody {
            transaction_id: instruction.transaction_id.to_string(),
            reference: &reference,
            amount: instruction.amount.amount(),
            currency: currency.as_str(),
            source_account: instruction.source_account.expose(),
            destination_account: instruction.destination_account.expose(),
        };

        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header(IDEMPOTENCY_HEADER, &reference)
            .json(&body)
            .send()
            .await
            .map_err(|e| SettlementError::Transient(transport_kind(&e).into()))?;

        let status = resp.status();
        if status.is_success() {
            // An empty or unexpected body still means the processor accepted it.
            let receipt: ReceiptBody = resp.json().await.unwrap_or_default();
            return Ok(SettlementReceipt {
                processor_reference: receipt.processor_reference.unwrap_or(reference),
            });
        }

        tracing::warn!(
            transaction_id = %instruction.transaction_id,
            status = status.as_u16(),
            "Processor rejected call"
        );
        Err(classify(status))
    }
}

/// 408, 429 and 5xx are worth retrying; any other 4xx is a refusal.
fn classify(status: StatusCode) -> SettlementError {
    let detail = format!("status {}", status.as_u16());
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        SettlementError::Transient(detail)
    } else if status.is_client_error() {
        SettlementError::Declined(detail)
    } else {
        SettlementError::Transient(detail)
    }
}

fn transport_kind(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else {
        "transport"
    }
}

#[async_trait::async_trait]
impl SettlementProcessor for HttpSettlementProcessor {
    async fn settle(
        &self,
        instruction: &SettlementInstruction,
    ) -> Result<SettlementReceipt, SettlementError> {
        self.send("/settlements", instruction).await
    }

    async fn refund(
        &self,
        instruction: &SettlementInstruction,
    ) -> Result<SettlementReceipt, SettlementError> {
        self.send("/refunds", instruction).await
    }
}

/// Report client for `GET {base}/reports/settled`.
#[derive(Clone)]
pub struct HttpReportSource {
    base_url: String,
    http: Client,
}

impl HttpReportSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base(base_url),
            http: build_client(timeout),
        }
    }
}

#[async_trait::async_trait]
impl ProcessorReportSource for HttpReportSource {
    async fn fetch_report(&self) -> Result<ProcessorReport, ReportError> {
        let resp = self
            .http
            .get(format!("{}/reports/settled", self.base_url))
            .send()
            .await
            .map_err(|e| ReportError::Unavailable(transport_kind(&e).into()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ReportError::Unavailable(format!("status {}", status.as_u16())));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| ReportError::Unavailable(transport_kind(&e).into()))?;
        serde_json::from_str(&body).map_err(|e| ReportError::Malformed(e.to_string()))
    }
}
