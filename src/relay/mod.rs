// Upstream relay contract
// Admission validates and rations; a relay implementation picks an upstream
// account from the principal's bindings and streams the provider response.
// Provider adapters live outside this crate.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::models::PrincipalContext;

/// The validated request handed across the admission boundary.
///
/// The body is fully buffered by admission; a relay that wants to stream
/// upstream re-frames it itself.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub model: Option<String>,
}

/// Seam between the admission plane and provider adapters.
///
/// Implementations are responsible for recording token/cost usage against
/// the principal's key after the upstream response finishes.
#[async_trait]
pub trait UpstreamRelay: Send + Sync {
    /// Relay a messages request upstream and stream the response back.
    async fn forward(&self, principal: &PrincipalContext, request: RelayRequest) -> Response;

    /// Relay a token-counting request; same contract, no quota effects.
    async fn count_tokens(&self, principal: &PrincipalContext, request: RelayRequest) -> Response {
        self.forward(principal, request).await
    }
}

/// Placeholder relay for deployments that wire adapters in separately.
pub struct NullRelay;

#[async_trait]
impl UpstreamRelay for NullRelay {
    async fn forward(&self, principal: &PrincipalContext, _request: RelayRequest) -> Response {
        (
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "error": "upstream_not_configured",
                "message": "No upstream relay is configured for this deployment",
                "keyId": principal.key_id,
            })),
        )
            .into_response()
    }
}
