// Admission error taxonomy mapped onto the HTTP surface

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::{
    concurrency::ConcurrencyError,
    key_store::KeyStoreError,
    queue::QueueError,
    rate_limit::{RateLimitDenial, RateLimitError, RateLimitKind},
};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("API key is required")]
    MissingKey,

    #[error("API key is malformed")]
    MalformedKey,

    #[error("Invalid API key")]
    InvalidKey,

    #[error("Client not allowed for this API key")]
    ClientDenied { user_agent: String },

    #[error("{message}")]
    EndpointGated { message: String },

    #[error("Model not enabled for this API key")]
    ModelDenied { model: String },

    #[error("Request payload too large")]
    PayloadTooLarge { limit_bytes: usize },

    #[error("Concurrency limit exceeded")]
    ConcurrencyLimitExceeded { limit: u32, current: u64 },

    #[error("Request queue is full")]
    QueueFull { retry_after_secs: u64 },

    #[error("Timed out waiting for a concurrency slot")]
    QueueTimeout { retry_after_secs: u64 },

    #[error("Request queue is overloaded")]
    Overloaded { retry_after_secs: u64 },

    #[error("{}", .0.message)]
    RateLimited(RateLimitDenial),

    #[error("Shared store unavailable")]
    StoreUnavailable,

    #[error("Client disconnected before a response could be written")]
    ClientDisconnected,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable error code carried in the response body.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MissingKey => "missing_api_key",
            GatewayError::MalformedKey => "malformed_api_key",
            GatewayError::InvalidKey => "invalid_api_key",
            GatewayError::ClientDenied { .. } => "client_not_allowed",
            GatewayError::EndpointGated { .. } => "endpoint_restricted",
            GatewayError::ModelDenied { .. } => "model_not_enabled",
            GatewayError::PayloadTooLarge { .. } => "payload_too_large",
            GatewayError::ConcurrencyLimitExceeded { .. } => "concurrency_limit_exceeded",
            GatewayError::QueueFull { .. } => "queue_full",
            GatewayError::QueueTimeout { .. } => "queue_timeout",
            GatewayError::Overloaded { .. } => "queue_overloaded",
            GatewayError::RateLimited(denial) => denial.kind.code(),
            GatewayError::StoreUnavailable => "store_unavailable",
            GatewayError::ClientDisconnected => "client_disconnected",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingKey
            | GatewayError::MalformedKey
            | GatewayError::InvalidKey => StatusCode::UNAUTHORIZED,
            GatewayError::ClientDenied { .. }
            | GatewayError::EndpointGated { .. }
            | GatewayError::ModelDenied { .. } => StatusCode::FORBIDDEN,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::ConcurrencyLimitExceeded { .. }
            | GatewayError::QueueFull { .. }
            | GatewayError::QueueTimeout { .. }
            | GatewayError::Overloaded { .. }
            | GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            // The transport is already gone; this status never reaches the wire.
            GatewayError::ClientDisconnected => StatusCode::REQUEST_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::ConcurrencyLimitExceeded { .. } => Some(1),
            GatewayError::QueueFull { retry_after_secs }
            | GatewayError::QueueTimeout { retry_after_secs }
            | GatewayError::Overloaded { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        // A disconnected client gets nothing: the slot is already released
        // and any body written here would be discarded by the transport.
        if matches!(self, GatewayError::ClientDisconnected) {
            return self.status().into_response();
        }

        let mut body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });

        match &self {
            GatewayError::ClientDenied { user_agent } => {
                body["userAgent"] = json!(user_agent);
            },
            GatewayError::ModelDenied { model } => {
                body["model"] = json!(model);
            },
            GatewayError::PayloadTooLarge { limit_bytes } => {
                body["limitBytes"] = json!(limit_bytes);
            },
            GatewayError::ConcurrencyLimitExceeded { limit, current } => {
                body["concurrencyLimit"] = json!(limit);
                body["currentConcurrency"] = json!(current);
            },
            GatewayError::RateLimited(denial) => {
                body["resetAt"] = json!(denial.reset_at.to_rfc3339());
                match denial.kind {
                    RateLimitKind::Requests
                    | RateLimitKind::Tokens
                    | RateLimitKind::WindowCost => {
                        body["remainingMinutes"] = json!(denial.remaining_minutes);
                    },
                    RateLimitKind::DailyCost
                    | RateLimitKind::TotalCost
                    | RateLimitKind::WeeklyOpusCost => {
                        body["costLimit"] = json!(denial.cost_limit);
                        body["currentCost"] = json!(denial.current_cost);
                    },
                }
            },
            _ => {},
        }

        let retry_after = self.retry_after_secs();
        let mut response = (self.status(), Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

// Conversion from service-level error types

impl From<KeyStoreError> for GatewayError {
    fn from(error: KeyStoreError) -> Self {
        match error {
            KeyStoreError::Malformed => GatewayError::MalformedKey,
            KeyStoreError::NotFound | KeyStoreError::Disabled | KeyStoreError::Expired => {
                GatewayError::InvalidKey
            },
            KeyStoreError::Store(_) => GatewayError::StoreUnavailable,
        }
    }
}

impl From<ConcurrencyError> for GatewayError {
    fn from(_: ConcurrencyError) -> Self {
        GatewayError::StoreUnavailable
    }
}

impl From<RateLimitError> for GatewayError {
    fn from(_: RateLimitError) -> Self {
        GatewayError::StoreUnavailable
    }
}

impl From<QueueError> for GatewayError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::Full { retry_after_secs } => GatewayError::QueueFull { retry_after_secs },
            QueueError::Timeout { retry_after_secs } => {
                GatewayError::QueueTimeout { retry_after_secs }
            },
            QueueError::Overloaded { retry_after_secs } => {
                GatewayError::Overloaded { retry_after_secs }
            },
            QueueError::ClientDisconnected => GatewayError::ClientDisconnected,
            QueueError::StoreUnavailable | QueueError::Redis(_) => GatewayError::StoreUnavailable,
        }
    }
}
