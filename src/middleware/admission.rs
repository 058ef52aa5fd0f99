// Request admission pipeline
// Orchestrates key lookup, policy, concurrency (fast path or queue wait),
// and rate limiting in front of the relay, and owns the concurrency slot's
// lifetime: the slot rides the response body and is released exactly once
// when the body ends, errors, or is dropped.

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body::Frame;
use serde::Deserialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::models::PrincipalContext;
use crate::services::concurrency::{AcquireOutcome, ConcurrencySlot};
use crate::services::key_store::normalize_api_key;
use crate::services::policy;
use crate::services::queue::{QueueError, QueueOutcome};
use crate::services::rate_limit::RateDecision;
use crate::utils::gateway_error::GatewayError;

use super::connection::{socket_identity_intact, ClientConn, QueueIdentity};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Credential headers in precedence order; the query string is last resort
const API_KEY_HEADERS: [&str; 4] = ["x-api-key", "x-goog-api-key", "authorization", "api-key"];

/// First credential candidate present on the request, unvalidated
fn extract_api_key_candidate(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    for name in API_KEY_HEADERS {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.trim().is_empty() {
                return Some(value.to_string());
            }
        }
    }

    query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(name, value)| name == "key" && !value.trim().is_empty())
            .map(|(_, value)| value.into_owned())
    })
}

#[derive(Deserialize)]
struct ModelPeek {
    model: Option<String>,
}

/// What admission hands to the inner handler
struct Admitted {
    request: Request,
    slot: Option<ConcurrencySlot>,
    queued: bool,
}

/// The admission layer applied in front of every relay route.
pub async fn admission_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4();

    let mut response = match admit(&state, request, request_id).await {
        Ok(Admitted {
            request,
            slot,
            queued,
        }) => {
            let mut response = next.run(request).await;
            if queued {
                // Long waits can outlive keep-alive reuse windows; force
                // this connection shut once the response is done
                response
                    .headers_mut()
                    .insert(header::CONNECTION, HeaderValue::from_static("close"));
            }
            match slot {
                Some(slot) => attach_slot_release(response, slot),
                None => response,
            }
        },
        Err(err) => {
            if !matches!(err, GatewayError::ClientDisconnected) {
                debug!(%request_id, code = err.code(), "request refused at admission");
            }
            err.into_response()
        },
    };

    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[instrument(skip_all, fields(%request_id))]
async fn admit(
    state: &AppState,
    request: Request,
    request_id: Uuid,
) -> Result<Admitted, GatewayError> {
    // 1-2. Credential extraction and key lookup
    let candidate =
        extract_api_key_candidate(request.headers(), request.uri().query())
            .ok_or(GatewayError::MissingKey)?;
    let api_key = normalize_api_key(&candidate)?;
    let record = state.key_store.lookup(&api_key).await?;

    let path = request.uri().path().to_string();
    let bypass = policy::is_token_count_path(&path);

    // Buffer the body: the size cap applies here and the model field feeds
    // the policy and rate checks. The relay receives the buffered bytes.
    let max_body = state.config.limits.max_body_bytes;
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, max_body)
        .await
        .map_err(|_| GatewayError::PayloadTooLarge {
            limit_bytes: max_body,
        })?;
    let model = serde_json::from_slice::<ModelPeek>(&bytes)
        .ok()
        .and_then(|peek| peek.model);
    let mut request = Request::from_parts(parts, Body::from(bytes));

    // 3. Token-count endpoints skip policy, concurrency and rate checks
    if bypass {
        request
            .extensions_mut()
            .insert(PrincipalContext::new(&record, request_id.to_string()));
        return Ok(Admitted {
            request,
            slot: None,
            queued: false,
        });
    }

    let settings = state.settings.get().await;
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let ua = user_agent.as_deref();

    // 4. Policy gates
    policy::evaluate_client(&record, ua)?;
    policy::evaluate_claude_code_only(&path, ua, &settings, &record)?;
    policy::evaluate_model(&record, model.as_deref())?;

    // 5. Concurrency: fast path, else queue
    let lease = Duration::from_secs(state.config.concurrency.lease_seconds);
    let mut slot = None;
    let mut queued = false;

    if record.concurrency_limit > 0 {
        match state
            .concurrency
            .try_acquire(&record.id, record.concurrency_limit, lease)
            .await?
        {
            AcquireOutcome::Acquired(acquired) => {
                slot = Some(acquired);
            },
            AcquireOutcome::ExceedsLimit { current } => {
                if !settings.concurrent_request_queue_enabled {
                    return Err(GatewayError::ConcurrencyLimitExceeded {
                        limit: record.concurrency_limit,
                        current,
                    });
                }

                let ticket = state
                    .queue
                    .enter(&record.id, record.concurrency_limit, &settings)
                    .await?;
                queued = true;

                // Socket identity recorded at entry: the (token, connection)
                // pair plus the connection's live closed flag. The waiter
                // checks the flag before every poll; both identity halves
                // are re-verified before the slot may be used.
                let client_conn = request
                    .extensions()
                    .get::<ConnectInfo<ClientConn>>()
                    .map(|info| info.0.clone());
                let identity = QueueIdentity {
                    queue_token: ticket.queue_token(),
                    conn_id: client_conn.as_ref().map(|conn| conn.conn_id),
                };
                request.extensions_mut().insert(identity);
                let liveness = client_conn.as_ref().map(|conn| conn.liveness());

                match state
                    .queue
                    .wait_for_slot(
                        &ticket,
                        &state.concurrency,
                        record.concurrency_limit,
                        lease,
                        settings.concurrent_request_queue_max_redis_fail_count,
                        liveness.as_ref(),
                    )
                    .await
                {
                    Ok(acquired) => {
                        // Liveness re-check: disconnect detection can lag by
                        // one poll interval
                        if client_conn.as_ref().map(|c| c.is_closed()).unwrap_or(false) {
                            acquired.release().await;
                            ticket.finish(QueueOutcome::Cancelled).await;
                            return Err(GatewayError::ClientDisconnected);
                        }

                        let stored = request.extensions().get::<QueueIdentity>().copied();
                        let current_conn_id = request
                            .extensions()
                            .get::<ConnectInfo<ClientConn>>()
                            .map(|info| info.0.conn_id);

                        if !socket_identity_intact(identity, stored, current_conn_id) {
                            // Foreign request on a reused connection: give
                            // the slot back and write nothing
                            acquired.release().await;
                            ticket.finish(QueueOutcome::SocketChanged).await;
                            return Err(GatewayError::ClientDisconnected);
                        }

                        ticket.finish(QueueOutcome::Success).await;
                        slot = Some(acquired);
                    },
                    Err(err) => {
                        let outcome = match &err {
                            QueueError::Timeout { .. } => QueueOutcome::Timeout,
                            QueueError::ClientDisconnected => QueueOutcome::Cancelled,
                            QueueError::StoreUnavailable | QueueError::Redis(_) => {
                                QueueOutcome::RedisError
                            },
                            // Entry-stage errors cannot surface from a wait
                            _ => QueueOutcome::Cancelled,
                        };
                        ticket.finish(outcome).await;
                        return Err(err.into());
                    },
                }
            },
        }
    }

    // 6. Rate limits, checked while the slot (if any) is held
    match state.rate_limiter.check(&record, model.as_deref()).await {
        Ok(RateDecision::Allowed) => {
            if let Err(e) = state
                .rate_limiter
                .record_request(&record.id, record.rate_limit_window_sec)
                .await
            {
                // Counter loss is tolerable; refusal here would charge the
                // client for our store trouble
                warn!(key_id = %record.id, "request counter write lost: {}", e);
            }
        },
        Ok(RateDecision::Denied(denial)) => {
            if let Some(slot) = &slot {
                slot.release().await;
            }
            return Err(GatewayError::RateLimited(*denial));
        },
        Err(e) => {
            if let Some(slot) = &slot {
                slot.release().await;
            }
            return Err(e.into());
        },
    }

    // 7. Bind the principal and start lease renewal
    request
        .extensions_mut()
        .insert(PrincipalContext::new(&record, request_id.to_string()));

    if let Some(slot) = &slot {
        let renew_secs = state.config.concurrency.renew_interval_seconds;
        if renew_secs > 0 {
            slot.start_renewal(
                Duration::from_secs(renew_secs),
                Duration::from_secs(state.config.concurrency.max_lifetime_minutes * 60),
            );
        }
    }

    Ok(Admitted {
        request,
        slot,
        queued,
    })
}

/// Wrap the response body so the slot releases exactly once at end-of-body,
/// on a body error, or when the body is dropped mid-stream.
fn attach_slot_release(response: Response, slot: ConcurrencySlot) -> Response {
    let (parts, body) = response.into_parts();
    let wrapped = Body::new(SlotReleaseBody {
        inner: body,
        slot: Some(slot),
    });
    Response::from_parts(parts, wrapped)
}

struct SlotReleaseBody {
    inner: Body,
    slot: Option<ConcurrencySlot>,
}

impl SlotReleaseBody {
    fn finish(&mut self) {
        if let Some(slot) = self.slot.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    slot.release().await;
                });
            }
            // Without a runtime the slot's Drop backstop applies
        }
    }
}

impl http_body::Body for SlotReleaseBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            },
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            },
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        http_body::Body::size_hint(&self.inner)
    }
}

impl Drop for SlotReleaseBody {
    fn drop(&mut self) {
        // Client abort drops the body before the final frame
        self.finish();
    }
}
