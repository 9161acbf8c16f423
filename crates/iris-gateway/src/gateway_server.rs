//! Webhook ingress for the Iris helpdesk.
//!
//! One route per concern: `POST /webhook/{channel_id}` authenticates and
//! normalizes a provider event, then enqueues it and returns immediately;
//! `GET /webhook/{channel_id}` answers the Meta-style subscription handshake;
//! `GET /healthz` is the liveness probe. Ticket creation happens in the
//! inbound worker, never on the request path.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use iris_connectors::{validate_parsed_message, ConnectorRegistry, SignatureEnforcement};
use iris_pipeline::{InboundJob, INBOUND_JOB_KIND, INBOUND_QUEUE};
use iris_queue::JobQueue;
use iris_store::{ChannelRecord, HelpdeskStore};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;

pub const WEBHOOK_ROUTE: &str = "/webhook/{channel_id}";
pub const HEALTHZ_ROUTE: &str = "/healthz";

/// Public struct `GatewayState` used across Iris components.
pub struct GatewayState {
    pub store: Arc<HelpdeskStore>,
    pub queue: Arc<JobQueue>,
    pub registry: Arc<ConnectorRegistry>,
    pub enforcement: SignatureEnforcement,
}

impl GatewayState {
    pub fn new(
        store: Arc<HelpdeskStore>,
        queue: Arc<JobQueue>,
        registry: Arc<ConnectorRegistry>,
        enforcement: SignatureEnforcement,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            enforcement,
        }
    }
}

pub fn build_gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route(
            WEBHOOK_ROUTE,
            post(handle_webhook_event).get(handle_webhook_handshake),
        )
        .route(HEALTHZ_ROUTE, get(handle_healthz))
        .with_state(state)
}

/// Serves the gateway until the shutdown flag flips to `true`.
pub async fn run_gateway_server(
    bind: &str,
    state: Arc<GatewayState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let bind_addr = bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid gateway bind address '{bind}'"))?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind webhook gateway on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gateway address")?;
    tracing::info!(addr = %local_addr, "webhook gateway listening");

    let app = build_gateway_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("webhook gateway exited unexpectedly")?;
    Ok(())
}

async fn handle_healthz() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

#[derive(Debug, Deserialize)]
struct HandshakeQuery {
    #[serde(rename = "hub.mode")]
    hub_mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    hub_verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    hub_challenge: Option<String>,
}

/// Meta-style subscription handshake. Echoes the raw challenge when the
/// presented token matches the channel's configured `webhook_verify_token`.
/// No side effects in any outcome.
async fn handle_webhook_handshake(
    State(state): State<Arc<GatewayState>>,
    Path(channel_id): Path<i64>,
    Query(query): Query<HandshakeQuery>,
) -> Response {
    if query.hub_mode.as_deref() != Some("subscribe") {
        return error_response(StatusCode::BAD_REQUEST, "unsupported hub.mode");
    }
    let channel = match load_channel(&state, channel_id) {
        Ok(channel) => channel,
        Err(response) => return response,
    };
    let Some(challenge) = query.hub_challenge else {
        return error_response(StatusCode::BAD_REQUEST, "hub.challenge is required");
    };
    let expected = channel
        .config
        .get("webhook_verify_token")
        .and_then(Value::as_str);
    match (expected, query.hub_verify_token.as_deref()) {
        (Some(expected), Some(presented)) if expected == presented => {
            tracing::info!(channel_id, "webhook handshake verified");
            (StatusCode::OK, challenge).into_response()
        }
        _ => {
            tracing::warn!(channel_id, "webhook handshake token mismatch");
            error_response(StatusCode::FORBIDDEN, "verify token mismatch")
        }
    }
}

/// Event delivery. Authenticates against the channel's current config,
/// normalizes the payload, and enqueues the inbound job. Malformed payloads
/// are rejected here with a 400 and never retried; everything after the 200
/// is the inbound worker's problem.
async fn handle_webhook_event(
    State(state): State<Arc<GatewayState>>,
    Path(channel_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let channel = match load_channel(&state, channel_id) {
        Ok(channel) => channel,
        Err(response) => return response,
    };
    let connector = match state.registry.resolve(channel.provider) {
        Ok(connector) => connector,
        Err(error) => {
            tracing::warn!(channel_id, "connector resolution failed: {error}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "connector unavailable");
        }
    };
    // Re-applying the stored config here means credential rotation through
    // update_channel takes effect on the next delivery.
    if let Err(error) = connector.init(&channel.config) {
        tracing::warn!(channel_id, "channel config rejected: {error}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "channel misconfigured");
    }

    let header_map = lowercased_headers(&headers);
    if !connector.verify_signature(&header_map, &body, state.enforcement) {
        tracing::warn!(
            channel_id,
            provider = channel.provider.as_str(),
            "webhook signature verification failed"
        );
        return error_response(StatusCode::UNAUTHORIZED, "signature verification failed");
    }

    let parsed = match connector.parse_webhook(&body) {
        Ok(parsed) => parsed,
        Err(error) => {
            tracing::warn!(channel_id, "webhook payload rejected: {error}");
            return error_response(StatusCode::BAD_REQUEST, &error.to_string());
        }
    };
    if let Err(error) = validate_parsed_message(&parsed) {
        tracing::warn!(channel_id, "parsed message rejected: {error:#}");
        return error_response(StatusCode::BAD_REQUEST, &format!("{error:#}"));
    }

    let job = InboundJob::new(channel.id, channel.org_id.clone(), parsed);
    let payload = match job.to_payload() {
        Ok(payload) => payload,
        Err(error) => {
            tracing::error!(channel_id, "failed to encode inbound job: {error:#}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to enqueue event");
        }
    };
    if let Err(error) = state.queue.enqueue(INBOUND_QUEUE, INBOUND_JOB_KIND, &payload) {
        tracing::error!(channel_id, "failed to enqueue inbound job: {error:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to enqueue event");
    }
    tracing::info!(
        channel_id,
        provider = channel.provider.as_str(),
        "webhook event accepted"
    );
    (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
}

fn load_channel(state: &GatewayState, channel_id: i64) -> Result<ChannelRecord, Response> {
    match state.store.get_channel(channel_id) {
        Ok(channel) => Ok(channel),
        Err(error) if error.is_missing() => Err(error_response(
            StatusCode::NOT_FOUND,
            &format!("channel {channel_id} not found"),
        )),
        Err(error) => {
            tracing::error!(channel_id, "channel lookup failed: {error}");
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "channel lookup failed",
            ))
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Connectors expect lowercase header keys; non-UTF8 values are dropped.
fn lowercased_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}
