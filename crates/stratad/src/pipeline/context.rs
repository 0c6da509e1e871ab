//! Request-scoped state threaded through the interceptor chain.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::http::HeaderMap;
use tokio_util::sync::CancellationToken;

use crate::auth::Caller;

#[derive(Clone, Debug)]
pub struct CallContext {
    /// Fully-qualified method, `/pkg.Service/Method`
    pub method: String,
    pub metadata: HeaderMap,
    pub peer: Option<SocketAddr>,
    /// Client address after trusted-proxy resolution
    pub client_ip: Option<IpAddr>,
    pub request_id: String,
    /// Attached by the authorization stage
    pub caller: Option<Caller>,
    /// User a public call authenticated itself (a login). Shared between
    /// the handler's copy of the context and the one the stages see.
    principal: Arc<OnceLock<String>>,
    pub started_at: Instant,
    pub cancel: CancellationToken,
    pub streaming: bool,
    /// Set once the handler has been entered
    pub handler_invoked: bool,
    /// Panic message, when the recovery stage caught one
    pub panic: Option<String>,
}

impl CallContext {
    pub fn new(method: impl Into<String>, metadata: HeaderMap) -> Self {
        Self {
            method: method.into(),
            metadata,
            peer: None,
            client_ip: None,
            request_id: String::new(),
            caller: None,
            principal: Arc::new(OnceLock::new()),
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
            streaming: false,
            handler_invoked: false,
            panic: None,
        }
    }

    pub fn with_peer(mut self, peer: Option<SocketAddr>, client_ip: Option<IpAddr>) -> Self {
        self.peer = peer;
        self.client_ip = client_ip.or_else(|| peer.map(|p| p.ip()));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.caller.as_ref().map(|c| c.user.id.as_str())
    }

    /// Record the user this call logged in. Only the first value sticks.
    pub fn set_principal(&self, user_id: impl Into<String>) {
        let _ = self.principal.set(user_id.into());
    }

    /// The attached caller, else the user the call itself authenticated.
    pub fn actor_id(&self) -> Option<&str> {
        self.user_id().or_else(|| self.principal.get().map(String::as_str))
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.metadata
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}
