//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use companion_types::error::{LedgerError, PersonaError, TurnError};

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Turn-handling errors from the turn service.
    Turn(TurnError),
    /// Malformed request input.
    Validation(String),
    /// Generic internal error.
    Internal(String),
}

impl From<TurnError> for AppError {
    fn from(e: TurnError) -> Self {
        AppError::Turn(e)
    }
}

impl AppError {
    /// Status, machine-readable code and message for the envelope.
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Turn(TurnError::Validation(msg)) | AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Turn(TurnError::InsufficientBalance { balance }) => (
                StatusCode::PAYMENT_REQUIRED,
                "INSUFFICIENT_BALANCE",
                format!("Insufficient token balance ({balance})"),
            ),
            AppError::Turn(TurnError::NotFound(what)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", format!("{what} not found"))
            }
            AppError::Turn(TurnError::Persona(PersonaError::NotFound)) => {
                (StatusCode::NOT_FOUND, "PERSONA_NOT_FOUND", "Persona not found".to_string())
            }
            AppError::Turn(TurnError::Ledger(LedgerError::UserNotFound)) => {
                (StatusCode::NOT_FOUND, "USER_NOT_FOUND", "User not found".to_string())
            }
            AppError::Turn(TurnError::Llm(e)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "LLM_ERROR", e.to_string())
            }
            AppError::Turn(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "TURN_ERROR", e.to_string())
            }
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        }

        let body = json!({
            "data": null,
            "meta": {
                "request_id": "",
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "response_time_ms": 0
            },
            "errors": [{
                "code": code,
                "message": message,
            }]
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
