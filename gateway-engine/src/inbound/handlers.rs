//! HTTP request handlers.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use gateway_types::{
    AppError, GatewayStore, PaymentRequest, PaymentResponse, TransactionId, TransactionSummary,
};

use crate::PaymentEngine;

/// Application state shared across handlers.
pub struct AppState<S: GatewayStore> {
    pub engine: PaymentEngine<S>,
}

/// Wrapper to implement IntoResponse for AppError (orphan rule workaround).
pub struct ApiError(pub AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::IdempotencyConflict
            | AppError::VersionConflict { .. }
            | AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AppError::LedgerImbalance { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::TransientDependency(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::SettlementFailed { .. } => StatusCode::BAD_GATEWAY,
        };

        // Dependency failures may carry driver text; only the kind goes out.
        let message = match &self.0 {
            AppError::TransientDependency(_) => "Service temporarily unavailable".to_string(),
            AppError::LedgerImbalance { .. } => "Internal error".to_string(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(kind = self.0.kind(), code = status.as_u16(), "Request failed");
        }

        let body = serde_json::json!({
            "error": message,
            "kind": self.0.kind(),
            "code": status.as_u16()
        });

        (status, Json(body)).into_response()
    }
}

fn parse_id(id: &str) -> Result<TransactionId, ApiError> {
    id.parse()
        .map_err(|_| AppError::Validation("Invalid transaction ID".into()).into())
}

/// Health check endpoint.
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Submit a payment. 201 for a new transaction, 200 for a retry of a known key.
#[tracing::instrument(skip(state, payload))]
pub async fn submit_payment<S: GatewayStore>(
    State(state): State<Arc<AppState<S>>>,
    payload: Result<Json<PaymentRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload.map_err(|rejection| AppError::Validation(rejection.body_text()))?;
    let submitted = state.engine.submit(req).await?;
    let status = if submitted.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(PaymentResponse::from(&submitted.transaction))))
}

/// Get a payment by ID. Account identifiers are masked.
#[tracing::instrument(skip(state), fields(transaction_id = %id))]
pub async fn get_payment<S: GatewayStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tx = state.engine.get(parse_id(&id)?).await?;
    Ok(Json(TransactionSummary::from(&tx)))
}

#[tracing::instrument(skip(state), fields(transaction_id = %id))]
pub async fn capture_payment<S: GatewayStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tx = state.engine.capture(parse_id(&id)?).await?;
    Ok(Json(PaymentResponse::from(&tx)))
}

#[tracing::instrument(skip(state), fields(transaction_id = %id))]
pub async fn void_payment<S: GatewayStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tx = state.engine.void(parse_id(&id)?).await?;
    Ok(Json(PaymentResponse::from(&tx)))
}

/// Queue a refund. Answers 202; the payment reads `settled` until the
/// processor confirms.
#[tracing::instrument(skip(state), fields(transaction_id = %id))]
pub async fn refund_payment<S: GatewayStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tx = state.engine.refund(parse_id(&id)?).await?;
    Ok((StatusCode::ACCEPTED, Json(PaymentResponse::from(&tx))))
}
