//! The network-facing front end of the gateway.
//!
//! Terminates client connections and drives the other components: protocol
//! validation, session resolution, traffic recording, and routing. All
//! shared state lives in an explicit [`GatewayState`] handed to handlers via
//! axum's `State` extractor, so tests construct isolated gateways without
//! process-wide globals.
//!
//! # Endpoints
//!
//! - `POST /mcp` - submit one call/notification (client to backend)
//! - `GET /mcp` - long-lived SSE channel with keep-alive frames
//! - `GET /health` - gateway liveness, cheap enough to poll
//! - `GET /status` - full diagnostic snapshot (also sweeps idle sessions)
//! - `POST /admin/register` - set the active challenge backend
//! - `POST /admin/unregister` - drop a challenge backend

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::protocol::{
    self, GatewayMessage, JsonRpcResponse, PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER,
};
use crate::router::{BackendTransport, HttpBackendTransport, RequestRouter};
use crate::session::SessionManager;
use crate::traffic::{Direction, TrafficLogger};

/// Shared gateway state: the only mutable state in the process, passed
/// explicitly to every handler.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub sessions: SessionManager,
    pub router: RequestRouter,
    pub traffic: TrafficLogger,
}

/// The gateway HTTP server.
pub struct GatewayServer {
    state: Arc<GatewayState>,
}

impl GatewayServer {
    /// Create a gateway with the production HTTP backend transport.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let transport = HttpBackendTransport::new(
            config.backend_timeout,
            config.connect_timeout,
            config.health_timeout,
        )?;
        Self::with_transport(config, Box::new(transport))
    }

    /// Create a gateway over a custom backend transport.
    ///
    /// This is how tests inject mock backends.
    pub fn with_transport(
        config: GatewayConfig,
        transport: Box<dyn BackendTransport>,
    ) -> Result<Self, GatewayError> {
        let traffic =
            TrafficLogger::new(config.traffic_capacity).map_err(|e| GatewayError::Internal {
                details: format!("failed to compile detection rules: {}", e),
            })?;
        let state = Arc::new(GatewayState {
            sessions: SessionManager::new(config.session_timeout),
            router: RequestRouter::new(transport),
            traffic,
            config,
        });
        Ok(Self { state })
    }

    /// Shared state handle, for embedding and tests.
    pub fn state(&self) -> Arc<GatewayState> {
        Arc::clone(&self.state)
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/mcp", post(handle_message).get(handle_stream))
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/admin/register", post(handle_register))
            .route("/admin/unregister", post(handle_unregister))
            .layer(DefaultBodyLimit::max(self.state.config.max_body_size))
            .with_state(Arc::clone(&self.state))
    }

    /// Bind and serve until the shutdown token is cancelled.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listen_addr = self.state.config.listen_addr.clone();
        let listener = TcpListener::bind(&listen_addr).await?;

        info!(addr = %listen_addr, "Arena gateway listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Arena gateway shutting down");
            })
            .await?;

        Ok(())
    }
}

/// Read a trimmed, non-empty header value.
fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Serialize a response envelope, falling back to a static internal-error
/// envelope if serialization itself fails.
fn envelope_value(response: &JsonRpcResponse) -> Value {
    serde_json::to_value(response).unwrap_or_else(|_| {
        json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32603, "message": "Internal error"}
        })
    })
}

/// Attach the session header to a response.
fn with_session_header(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_ID_HEADER), value);
    }
    response
}

/// `POST /mcp` - one call or notification from the client.
///
/// Flow: validate headers, resolve or create the session, parse, log
/// inbound, route (initialize included - the gateway fabricates nothing
/// locally), log outbound, touch the session, answer. Calls get the routed
/// body; notifications get an empty 202. Routing failures come back as
/// well-formed error envelopes with HTTP 200; only out-of-protocol problems
/// (bad version header, malformed body) use 400.
async fn handle_message(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Transport-level version check, answered before any parsing
    if let Err(e) = protocol::validate_protocol_version(header_str(&headers, PROTOCOL_VERSION_HEADER))
    {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    // First contact without a token creates the session
    let session_id = match header_str(&headers, SESSION_ID_HEADER) {
        Some(id) => id.to_string(),
        None => {
            let id = state.sessions.create();
            info!(session_id = %id, "Created new session");
            id
        }
    };

    // Parse failures never reach the router, but the rejected body is still
    // recorded with a protocol_violation finding
    let message = match protocol::parse_message(&body) {
        Ok(message) => message,
        Err(e) => {
            let raw = String::from_utf8_lossy(&body);
            state
                .traffic
                .record_rejected(&raw, Some(&session_id), &e.to_string());
            let response =
                JsonRpcResponse::error(protocol::recover_id(&body), e.to_jsonrpc_error());
            let response =
                (StatusCode::BAD_REQUEST, axum::Json(envelope_value(&response))).into_response();
            return with_session_header(response, &session_id);
        }
    };

    state.traffic.record(
        Direction::Inbound,
        message.raw(),
        Some(&session_id),
        Some(message.correlation_id),
    );

    let reply = route_message(&state, &message, &session_id).await;

    state.traffic.record(
        Direction::Outbound,
        &reply,
        Some(&session_id),
        Some(message.correlation_id),
    );

    state.sessions.touch(&session_id);

    let response = if message.id().is_some() {
        (StatusCode::OK, axum::Json(reply)).into_response()
    } else {
        // Notification: acknowledged, no body
        StatusCode::ACCEPTED.into_response()
    };
    with_session_header(response, &session_id)
}

/// Route one validated message, translating failures into error envelopes.
async fn route_message(state: &GatewayState, message: &GatewayMessage, session_id: &str) -> Value {
    match state.router.route(message, Some(session_id)).await {
        Ok(routed) => {
            if let Some(challenge_id) = state.router.active_challenge() {
                state.sessions.set_challenge(session_id, &challenge_id);
            }
            routed.body
        }
        Err(e) => {
            warn!(
                correlation_id = %message.correlation_id,
                error = %e,
                error_type = e.error_type_name(),
                "Routing failed"
            );
            envelope_value(&JsonRpcResponse::error(
                message.id().cloned(),
                e.to_jsonrpc_error(),
            ))
        }
    }
}

/// `GET /mcp` - long-lived SSE channel.
///
/// Carries no application payload; its purpose is to hold a
/// standards-compliant bidirectional channel open. Emits a comment frame
/// every heartbeat interval and refreshes the session's liveness. The loop
/// is dropped (and nothing leaks) when the client disconnects or the server
/// shuts down.
async fn handle_stream(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_str(&headers, SESSION_ID_HEADER).map(str::to_string) else {
        return (StatusCode::BAD_REQUEST, "MCP-Session-Id header required").into_response();
    };

    if state.sessions.get(&session_id).is_none() {
        return (StatusCode::NOT_FOUND, "Session not found or expired").into_response();
    }

    debug!(session_id = %session_id, "Opened SSE stream");

    let interval = state.config.heartbeat_interval;
    let stream = futures_util::stream::unfold(
        (state, session_id.clone()),
        move |(state, session_id)| async move {
            tokio::time::sleep(interval).await;
            state.sessions.keep_alive(&session_id);
            let frame = Ok::<Event, Infallible>(Event::default().comment("heartbeat"));
            Some((frame, (state, session_id)))
        },
    );

    with_session_header(Sse::new(stream).into_response(), &session_id)
}

/// `GET /health` - gateway liveness. Never contacts the backend, so it is
/// safe to poll frequently.
async fn handle_health(State(state): State<Arc<GatewayState>>) -> Response {
    axum::Json(json!({
        "status": "healthy",
        "service": "arena-gateway",
        "listen_addr": state.config.listen_addr,
        "active_sessions": state.sessions.active_count(),
        "active_backend": state.router.active_backend(),
    }))
    .into_response()
}

/// `GET /status` - full diagnostic snapshot.
///
/// Doubles as the opportunistic trigger for the idle-session sweep.
async fn handle_status(State(state): State<Arc<GatewayState>>) -> Response {
    let swept = state.sessions.sweep(Utc::now());
    if swept > 0 {
        debug!(swept, "Swept idle sessions");
    }

    let sessions: serde_json::Map<String, Value> = state
        .sessions
        .snapshot()
        .into_iter()
        .map(|s| {
            (
                s.session_id.clone(),
                json!({
                    "challenge_id": s.challenge_id,
                    "message_count": s.message_count,
                    "created_at": s.created_at,
                    "last_active": s.last_active,
                }),
            )
        })
        .collect();

    axum::Json(json!({
        "gateway": {
            "listen_addr": state.config.listen_addr,
            "status": "running",
        },
        "sessions": {
            "active_count": sessions.len(),
            "all_sessions": sessions,
        },
        "routing": state.router.routing_info(),
        "traffic": state.traffic.stats(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    challenge_id: Option<String>,
    backend_url: Option<String>,
}

/// `POST /admin/register` - operator call that sets the active backend.
///
/// Registration always succeeds when the fields are present; the response
/// additionally carries a best-effort health probe of the new backend so the
/// operator learns immediately whether it is up.
async fn handle_register(State(state): State<Arc<GatewayState>>, body: Bytes) -> Response {
    let request: RegisterRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(json!({"success": false, "error": "Invalid JSON body"})),
            )
                .into_response();
        }
    };

    let (Some(challenge_id), Some(backend_url)) = (
        request.challenge_id.filter(|s| !s.is_empty()),
        request.backend_url.filter(|s| !s.is_empty()),
    ) else {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({
                "success": false,
                "error": "Missing required fields: challenge_id, backend_url",
            })),
        )
            .into_response();
    };

    state.router.register(&challenge_id, &backend_url);
    info!(challenge_id = %challenge_id, backend_url = %backend_url, "Registered backend");

    let health = state.router.health_check(&backend_url).await;

    axum::Json(json!({
        "success": true,
        "challenge_id": challenge_id,
        "backend_url": backend_url,
        "message": "Backend registered successfully",
        "backend_health": health,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct UnregisterRequest {
    challenge_id: Option<String>,
}

/// `POST /admin/unregister` - drop a backend registration.
async fn handle_unregister(State(state): State<Arc<GatewayState>>, body: Bytes) -> Response {
    let request: UnregisterRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(json!({"success": false, "error": "Invalid JSON body"})),
            )
                .into_response();
        }
    };

    let Some(challenge_id) = request.challenge_id.filter(|s| !s.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({
                "success": false,
                "error": "Missing required field: challenge_id",
            })),
        )
            .into_response();
    };

    if state.router.unregister(&challenge_id) {
        info!(challenge_id = %challenge_id, "Unregistered backend");
        axum::Json(json!({"success": true, "challenge_id": challenge_id})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            axum::Json(json!({
                "success": false,
                "error": format!("Challenge not registered: {}", challenge_id),
            })),
        )
            .into_response()
    }
}
