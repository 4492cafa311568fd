//! Backend registry and request forwarding.
//!
//! The router is the only component that knows how to reach a challenge
//! backend, and the only place transport failures are translated into
//! protocol errors. Exactly one backend is "active" at a time: this gateway
//! serves a single-challenge-at-a-time platform, so the active slot is the
//! indirection point — the client never discloses which challenge it is
//! talking to.
//!
//! Client sessions are mapped to backend sessions here. The `initialize`
//! handshake is always forwarded session-less so the backend can mint its
//! own session id; that id is captured from the response header and attached
//! to every subsequent call on the same client session.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::protocol::{GatewayMessage, MethodDispatch, PROTOCOL_VERSION, SESSION_ID_HEADER};

/// Default timeout for forwarded requests.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for health probes.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// What a backend sent back for one forwarded message.
#[derive(Debug, Clone)]
pub struct BackendReply {
    /// Response body as returned by the backend
    pub body: Value,
    /// Backend's own session id, when it emitted one
    pub session_id: Option<String>,
}

/// Outcome of a health probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Distinguishes unreachable, timed out, and responded-but-unhealthy
    pub detail: String,
}

/// Outbound transport to a backend. Trait seam so tests can inject a spy.
#[async_trait]
pub trait BackendTransport: Send + Sync {
    /// POST a message body to the backend's message endpoint.
    async fn send_message(
        &self,
        base_url: &str,
        body: &Value,
        backend_session: Option<&str>,
    ) -> Result<BackendReply, GatewayError>;

    /// Short-timeout probe of the backend's health endpoint.
    async fn check_health(&self, base_url: &str) -> HealthStatus;
}

/// Production transport backed by a pooled reqwest client.
pub struct HttpBackendTransport {
    client: reqwest::Client,
    health_timeout: Duration,
}

impl HttpBackendTransport {
    /// Build a transport with the given request timeouts.
    pub fn new(
        request_timeout: Duration,
        connect_timeout: Duration,
        health_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| GatewayError::Internal {
                details: format!("failed to build backend client: {}", e),
            })?;
        Ok(Self {
            client,
            health_timeout,
        })
    }

    /// Classify a reqwest failure into the fixed error taxonomy.
    fn classify_error(error: reqwest::Error, url: &str) -> GatewayError {
        if error.is_timeout() {
            warn!(url = %url, "Backend request timed out");
            GatewayError::BackendTimeout
        } else if error.is_connect() {
            warn!(url = %url, "Failed to connect to backend");
            GatewayError::BackendUnreachable {
                url: url.to_string(),
            }
        } else {
            GatewayError::Internal {
                details: error.to_string(),
            }
        }
    }
}

#[async_trait]
impl BackendTransport for HttpBackendTransport {
    async fn send_message(
        &self,
        base_url: &str,
        body: &Value,
        backend_session: Option<&str>,
    ) -> Result<BackendReply, GatewayError> {
        let url = format!("{}/mcp", base_url.trim_end_matches('/'));

        let mut request = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION)
            .json(body);
        if let Some(session) = backend_session {
            request = request.header("MCP-Session-Id", session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Self::classify_error(e, base_url))?;

        // Capture the backend's session id before consuming the body
        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(url = %url, status = %status, "Backend returned error status");
            return Err(GatewayError::backend_status(status.as_u16(), &text));
        }

        let body: Value = response.json().await.map_err(|e| GatewayError::Internal {
            details: format!("failed to parse backend response: {}", e),
        })?;

        Ok(BackendReply { body, session_id })
    }

    async fn check_health(&self, base_url: &str) -> HealthStatus {
        let url = format!("{}/health", base_url.trim_end_matches('/'));

        match self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => HealthStatus {
                healthy: true,
                detail: "Backend server is healthy".to_string(),
            },
            Ok(response) => HealthStatus {
                healthy: false,
                detail: format!("Backend returned HTTP {}", response.status().as_u16()),
            },
            Err(e) if e.is_timeout() => HealthStatus {
                healthy: false,
                detail: "Backend health check timed out".to_string(),
            },
            Err(e) if e.is_connect() => HealthStatus {
                healthy: false,
                detail: format!("Cannot connect to {}", base_url),
            },
            Err(e) => HealthStatus {
                healthy: false,
                detail: format!("Health check error: {}", e),
            },
        }
    }
}

/// Result of routing one message.
#[derive(Debug, Clone)]
pub struct Routed {
    /// The backend's response body (forwarded to the client unchanged)
    pub body: Value,
    /// The backend session now mapped for the client session, if any
    pub backend_session_id: Option<String>,
}

/// Current routing configuration, surfaced by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingInfo {
    pub active_challenge: Option<String>,
    pub active_backend: Option<String>,
    pub registered_backends: HashMap<String, String>,
    pub backend_count: usize,
    pub mapped_sessions: usize,
}

/// Routes validated messages to the active challenge backend.
pub struct RequestRouter {
    transport: Box<dyn BackendTransport>,
    /// challenge_id -> backend base URL
    backends: RwLock<HashMap<String, String>>,
    active_challenge: RwLock<Option<String>>,
    /// client session id -> backend session id.
    ///
    /// Never cleared when the active backend changes: a stale mapping is
    /// simply unused until overwritten or the client session expires.
    session_map: DashMap<String, String>,
}

impl RequestRouter {
    /// Create a router over the given transport.
    pub fn new(transport: Box<dyn BackendTransport>) -> Self {
        Self {
            transport,
            backends: RwLock::new(HashMap::new()),
            active_challenge: RwLock::new(None),
            session_map: DashMap::new(),
        }
    }

    /// Register a backend and make it the active one.
    ///
    /// Existing session-to-backend-session mappings are left untouched.
    pub fn register(&self, challenge_id: &str, backend_url: &str) {
        self.backends
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(challenge_id.to_string(), backend_url.to_string());
        *self
            .active_challenge
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(challenge_id.to_string());
        debug!(challenge_id, backend_url, "Registered active backend");
    }

    /// Remove a backend registration.
    ///
    /// Clears the active slot only when the given challenge is the active
    /// one. Returns false when the challenge was not registered.
    pub fn unregister(&self, challenge_id: &str) -> bool {
        let removed = self
            .backends
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(challenge_id)
            .is_some();
        if removed {
            let mut active = self
                .active_challenge
                .write()
                .unwrap_or_else(|e| e.into_inner());
            if active.as_deref() == Some(challenge_id) {
                *active = None;
            }
        }
        removed
    }

    /// The active challenge id, if a backend is registered.
    pub fn active_challenge(&self) -> Option<String> {
        self.active_challenge
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The active backend's address, if one is registered.
    pub fn active_backend(&self) -> Option<String> {
        let active = self
            .active_challenge
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let challenge = active.as_deref()?;
        self.backends
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(challenge)
            .cloned()
    }

    /// The backend session currently mapped for a client session.
    pub fn backend_session_for(&self, client_session: &str) -> Option<String> {
        self.session_map
            .get(client_session)
            .map(|e| e.value().clone())
    }

    /// Forward a message to the active backend.
    ///
    /// Fails without touching the network when no backend is active. The
    /// body is forwarded unchanged; `initialize` is sent session-less, every
    /// other method carries the mapped backend session id when one exists. A
    /// backend-supplied session id (over)writes the mapping before returning.
    pub async fn route(
        &self,
        message: &GatewayMessage,
        client_session: Option<&str>,
    ) -> Result<Routed, GatewayError> {
        let backend_url = self.active_backend().ok_or(GatewayError::NoActiveBackend)?;

        let backend_session = match message.dispatch() {
            MethodDispatch::Initialize => None,
            MethodDispatch::Forward => {
                client_session.and_then(|sid| self.backend_session_for(sid))
            }
        };

        debug!(
            correlation_id = %message.correlation_id,
            method = message.method().unwrap_or("<response>"),
            backend = %backend_url,
            has_backend_session = backend_session.is_some(),
            "Forwarding message to backend"
        );

        let reply = self
            .transport
            .send_message(&backend_url, message.raw(), backend_session.as_deref())
            .await?;

        if let (Some(client_sid), Some(backend_sid)) = (client_session, &reply.session_id) {
            self.session_map
                .insert(client_sid.to_string(), backend_sid.clone());
        }

        Ok(Routed {
            body: reply.body,
            backend_session_id: reply.session_id,
        })
    }

    /// Best-effort health probe of a backend address.
    pub async fn health_check(&self, backend_url: &str) -> HealthStatus {
        self.transport.check_health(backend_url).await
    }

    /// Snapshot of the routing configuration.
    pub fn routing_info(&self) -> RoutingInfo {
        let backends = self
            .backends
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        RoutingInfo {
            active_challenge: self.active_challenge(),
            active_backend: self.active_backend(),
            backend_count: backends.len(),
            registered_backends: backends,
            mapped_sessions: self.session_map.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_message;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Call log shared between a spy transport and the test assertions.
    #[derive(Default)]
    struct SpyState {
        calls: AtomicUsize,
        /// (base_url, backend_session) per send_message call
        seen: Mutex<Vec<(String, Option<String>)>>,
    }

    /// Spy transport that records every call and serves canned replies.
    struct SpyTransport {
        state: std::sync::Arc<SpyState>,
        reply_session: Option<String>,
        reply: Value,
    }

    impl SpyTransport {
        fn new(reply: Value, reply_session: Option<String>) -> (Self, std::sync::Arc<SpyState>) {
            let state = std::sync::Arc::new(SpyState::default());
            (
                Self {
                    state: std::sync::Arc::clone(&state),
                    reply_session,
                    reply,
                },
                state,
            )
        }
    }

    #[async_trait]
    impl BackendTransport for SpyTransport {
        async fn send_message(
            &self,
            base_url: &str,
            _body: &Value,
            backend_session: Option<&str>,
        ) -> Result<BackendReply, GatewayError> {
            self.state.calls.fetch_add(1, Ordering::SeqCst);
            self.state
                .seen
                .lock()
                .expect("spy lock")
                .push((base_url.to_string(), backend_session.map(str::to_string)));
            Ok(BackendReply {
                body: self.reply.clone(),
                session_id: self.reply_session.clone(),
            })
        }

        async fn check_health(&self, _base_url: &str) -> HealthStatus {
            HealthStatus {
                healthy: true,
                detail: "Backend server is healthy".to_string(),
            }
        }
    }

    fn message(body: &str) -> GatewayMessage {
        parse_message(body.as_bytes()).expect("test message should parse")
    }

    #[tokio::test]
    async fn test_route_without_backend_never_touches_network() {
        let (spy, state) = SpyTransport::new(serde_json::json!({}), None);
        let router = RequestRouter::new(Box::new(spy));

        let msg = message(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        let result = router.route(&msg, Some("s1")).await;

        assert!(matches!(result, Err(GatewayError::NoActiveBackend)));
        assert_eq!(state.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_register_replaces_active_backend() {
        let (spy, _state) = SpyTransport::new(serde_json::json!({}), None);
        let router = RequestRouter::new(Box::new(spy));

        router.register("c1", "http://localhost:9001");
        assert_eq!(
            router.active_backend().as_deref(),
            Some("http://localhost:9001")
        );

        router.register("c2", "http://localhost:9002");
        assert_eq!(
            router.active_backend().as_deref(),
            Some("http://localhost:9002")
        );
        assert_eq!(router.active_challenge().as_deref(), Some("c2"));
        // Both stay registered; only the active slot moved
        assert_eq!(router.routing_info().backend_count, 2);
    }

    #[tokio::test]
    async fn test_unregister_only_clears_active_when_matching() {
        let (spy, _state) = SpyTransport::new(serde_json::json!({}), None);
        let router = RequestRouter::new(Box::new(spy));

        router.register("c1", "http://localhost:9001");
        router.register("c2", "http://localhost:9002");

        // c1 is registered but not active: removal keeps c2 active
        assert!(router.unregister("c1"));
        assert_eq!(router.active_challenge().as_deref(), Some("c2"));

        assert!(router.unregister("c2"));
        assert!(router.active_challenge().is_none());
        assert!(router.active_backend().is_none());

        assert!(!router.unregister("c2"));
    }

    #[tokio::test]
    async fn test_initialize_sent_session_less_then_mapping_attached() {
        let (spy, state) = SpyTransport::new(
            serde_json::json!({"jsonrpc":"2.0","id":1,"result":{}}),
            Some("b-1".to_string()),
        );
        let router = RequestRouter::new(Box::new(spy));
        router.register("c1", "http://localhost:9001");

        // Pre-existing stale mapping must not ride along on initialize
        router
            .session_map
            .insert("client-1".to_string(), "stale".to_string());

        let init = message(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#);
        let routed = router
            .route(&init, Some("client-1"))
            .await
            .expect("route should succeed");
        assert_eq!(routed.backend_session_id.as_deref(), Some("b-1"));

        let call = message(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#);
        router
            .route(&call, Some("client-1"))
            .await
            .expect("route should succeed");

        let seen = state.seen.lock().expect("spy lock");
        assert_eq!(seen.len(), 2);
        // initialize went out without a backend session
        assert_eq!(seen[0].1, None);
        // the follow-up call carried the freshly minted one
        assert_eq!(seen[1].1.as_deref(), Some("b-1"));
    }

    #[tokio::test]
    async fn test_stale_mapping_not_consulted_for_new_session() {
        let (spy, state) = SpyTransport::new(
            serde_json::json!({"jsonrpc":"2.0","id":1,"result":{}}),
            None,
        );
        let router = RequestRouter::new(Box::new(spy));

        router.register("c1", "http://localhost:9001");
        router
            .session_map
            .insert("old-client".to_string(), "b-old".to_string());

        // Swapping the backend does not clear the old mapping
        router.register("c2", "http://localhost:9002");
        assert_eq!(
            router.backend_session_for("old-client").as_deref(),
            Some("b-old")
        );

        // A new client session has no mapping, so nothing is attached
        let call = message(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#);
        router
            .route(&call, Some("new-client"))
            .await
            .expect("route should succeed");

        let seen = state.seen.lock().expect("spy lock");
        assert_eq!(seen[0].0, "http://localhost:9002");
        assert_eq!(seen[0].1, None);
    }

    #[tokio::test]
    async fn test_backend_session_overwrites_mapping() {
        let (spy, _state) = SpyTransport::new(
            serde_json::json!({"jsonrpc":"2.0","id":1,"result":{}}),
            Some("b-2".to_string()),
        );
        let router = RequestRouter::new(Box::new(spy));
        router.register("c1", "http://localhost:9001");
        router
            .session_map
            .insert("client-1".to_string(), "b-1".to_string());

        let call = message(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#);
        router
            .route(&call, Some("client-1"))
            .await
            .expect("route should succeed");

        assert_eq!(
            router.backend_session_for("client-1").as_deref(),
            Some("b-2")
        );
    }

    #[tokio::test]
    async fn test_routing_info_snapshot() {
        let (spy, _state) = SpyTransport::new(serde_json::json!({}), None);
        let router = RequestRouter::new(Box::new(spy));
        router.register("c1", "http://localhost:9001");
        router
            .session_map
            .insert("client-1".to_string(), "b-1".to_string());

        let info = router.routing_info();
        assert_eq!(info.active_challenge.as_deref(), Some("c1"));
        assert_eq!(info.active_backend.as_deref(), Some("http://localhost:9001"));
        assert_eq!(info.backend_count, 1);
        assert_eq!(info.mapped_sessions, 1);
        assert_eq!(
            info.registered_backends.get("c1").map(String::as_str),
            Some("http://localhost:9001")
        );
    }

    /// Failing transport for error-translation coverage.
    struct FailingTransport(GatewayError);

    #[async_trait]
    impl BackendTransport for FailingTransport {
        async fn send_message(
            &self,
            _base_url: &str,
            _body: &Value,
            _backend_session: Option<&str>,
        ) -> Result<BackendReply, GatewayError> {
            Err(self.0.clone())
        }

        async fn check_health(&self, base_url: &str) -> HealthStatus {
            HealthStatus {
                healthy: false,
                detail: format!("Cannot connect to {}", base_url),
            }
        }
    }

    #[tokio::test]
    async fn test_transport_errors_propagate_with_fixed_codes() {
        for (error, code) in [
            (GatewayError::BackendTimeout, -32004),
            (
                GatewayError::BackendUnreachable {
                    url: "http://localhost:9001".to_string(),
                },
                -32003,
            ),
            (GatewayError::backend_status(500, "boom"), -32002),
        ] {
            let router = RequestRouter::new(Box::new(FailingTransport(error)));
            router.register("c1", "http://localhost:9001");
            let msg = message(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
            let err = router
                .route(&msg, Some("s1"))
                .await
                .expect_err("route should fail");
            assert_eq!(err.to_jsonrpc_code(), code);
        }
    }

    #[tokio::test]
    async fn test_health_check_delegates_to_transport() {
        let router = RequestRouter::new(Box::new(FailingTransport(GatewayError::BackendTimeout)));
        let status = router.health_check("http://localhost:9001").await;
        assert!(!status.healthy);
        assert!(status.detail.contains("http://localhost:9001"));
    }
}
