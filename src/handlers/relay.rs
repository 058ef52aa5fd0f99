// Relay hand-off handlers
// Admission has already validated, rationed and buffered the request by the
// time these run; they only shape the hand-off to the configured relay.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::app::AppState;
use crate::models::PrincipalContext;
use crate::relay::RelayRequest;

async fn into_relay_request(request: Request) -> (Option<PrincipalContext>, RelayRequest) {
    let principal = request.extensions().get::<PrincipalContext>().cloned();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let headers = request.headers().clone();

    // The body was buffered at admission; reading it back cannot exceed
    // any limit
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();
    let model = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(String::from));

    (
        principal,
        RelayRequest {
            method,
            path,
            headers,
            body,
            model,
        },
    )
}

fn missing_principal() -> Response {
    error!("relay handler reached without a principal in extensions");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "internal_error",
            "message": "Request was not admitted correctly",
        })),
    )
        .into_response()
}

/// POST /api/v1/messages and /claude/v1/messages
pub async fn relay_messages(State(state): State<AppState>, request: Request) -> Response {
    let (principal, relay_request) = into_relay_request(request).await;
    match principal {
        Some(principal) => state.relay.forward(&principal, relay_request).await,
        None => missing_principal(),
    }
}

/// POST token-count endpoints; bypasses quota but still authenticated
pub async fn relay_count_tokens(State(state): State<AppState>, request: Request) -> Response {
    let (principal, relay_request) = into_relay_request(request).await;
    match principal {
        Some(principal) => state.relay.count_tokens(&principal, relay_request).await,
        None => missing_principal(),
    }
}
