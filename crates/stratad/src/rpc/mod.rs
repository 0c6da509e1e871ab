//! RPC method registry and the handlers served by this gateway.
//!
//! Handlers are plain functions over [`Services`]; the pipeline owns
//! everything cross-cutting, so a handler only validates its request and
//! calls into the owning subsystem.

pub mod admin;
pub mod auth;
pub mod health;
pub mod users;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Notify;

use crate::audit::AuditLog;
use crate::auth::{AuthService, Caller};
use crate::config::Config;
use crate::error::Status;
use crate::log_buffer::LogBuffer;
use crate::methods;
use crate::pipeline::{CallContext, CallResult, CallStream};

/// Everything a handler may touch.
pub struct Services {
    pub config: Arc<Config>,
    pub auth: Arc<AuthService>,
    pub audit: Arc<AuditLog>,
    pub log_buffer: Arc<LogBuffer>,
    pub shutdown: Arc<Notify>,
    pub started_at: Instant,
}

pub type UnaryFn = fn(Arc<Services>, CallContext, Value) -> BoxFuture<'static, CallResult>;
pub type StreamFn =
    fn(Arc<Services>, CallContext, Value) -> BoxFuture<'static, Result<CallStream, Status>>;

#[derive(Clone, Copy)]
pub enum Handler {
    Unary(UnaryFn),
    Streaming(StreamFn),
}

impl Handler {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Handler::Streaming(_))
    }
}

/// Method name → handler.
pub struct Registry {
    services: Arc<Services>,
    handlers: BTreeMap<&'static str, Handler>,
}

impl Registry {
    /// Registry with every method this gateway serves.
    pub fn new(services: Arc<Services>) -> Self {
        let mut registry = Self {
            services,
            handlers: BTreeMap::new(),
        };

        registry.register(
            methods::CHALLENGE,
            Handler::Unary(|s, c, r| auth::challenge(s, c, r).boxed()),
        );
        registry.register(
            methods::VERIFY_CHALLENGE,
            Handler::Unary(|s, c, r| auth::verify_challenge(s, c, r).boxed()),
        );
        registry.register(methods::LOGOUT, Handler::Unary(|s, c, r| auth::logout(s, c, r).boxed()));
        registry.register(
            methods::REFRESH_SESSION,
            Handler::Unary(|s, c, r| auth::refresh_session(s, c, r).boxed()),
        );
        registry.register(
            methods::VALIDATE_SESSION,
            Handler::Unary(|s, c, r| auth::validate_session(s, c, r).boxed()),
        );
        registry.register(
            methods::LIST_MY_SESSIONS,
            Handler::Unary(|s, c, r| auth::list_my_sessions(s, c, r).boxed()),
        );
        registry.register(
            methods::REVOKE_SESSION,
            Handler::Unary(|s, c, r| auth::revoke_session(s, c, r).boxed()),
        );
        registry.register(
            methods::REVOKE_ALL_SESSIONS,
            Handler::Unary(|s, c, r| auth::revoke_all_sessions(s, c, r).boxed()),
        );

        registry.register(
            methods::GET_USER,
            Handler::Unary(|s, c, r| users::get_user(s, c, r).boxed()),
        );
        registry.register(
            methods::LIST_USERS,
            Handler::Unary(|s, c, r| users::list_users(s, c, r).boxed()),
        );
        registry.register(
            methods::UPDATE_USER_ROLE,
            Handler::Unary(|s, c, r| users::update_user_role(s, c, r).boxed()),
        );
        registry.register(
            methods::UPDATE_USER_STATUS,
            Handler::Unary(|s, c, r| users::update_user_status(s, c, r).boxed()),
        );

        registry.register(
            methods::GET_CONFIG,
            Handler::Unary(|s, c, r| admin::get_config(s, c, r).boxed()),
        );
        registry.register(
            methods::SHUTDOWN,
            Handler::Unary(|s, c, r| admin::shutdown(s, c, r).boxed()),
        );
        registry.register(
            methods::TAIL_LOGS,
            Handler::Streaming(|s, c, r| admin::tail_logs(s, c, r).boxed()),
        );
        registry.register(
            methods::LIST_AUDIT_ENTRIES,
            Handler::Unary(|s, c, r| admin::list_audit_entries(s, c, r).boxed()),
        );
        registry.register(
            methods::VERIFY_AUDIT_CHAIN,
            Handler::Unary(|s, c, r| admin::verify_audit_chain(s, c, r).boxed()),
        );

        registry.register(
            methods::HEALTH_CHECK,
            Handler::Unary(|s, c, r| health::check(s, c, r).boxed()),
        );

        registry
    }

    pub fn register(&mut self, method: &'static str, handler: Handler) {
        self.handlers.insert(method, handler);
    }

    pub fn get(&self, method: &str) -> Option<Handler> {
        self.handlers.get(method).copied()
    }

    pub fn registered_methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().copied()
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }
}

/// Stand-in for methods whose implementation lives outside the gateway.
pub async fn not_served(_services: Arc<Services>, ctx: CallContext, _request: Value) -> CallResult {
    Err(Status::unavailable(format!(
        "method {} is not served by this gateway",
        ctx.method
    )))
}

/// Decode a JSON request body; a missing body is an empty object.
pub(crate) fn decode<T: DeserializeOwned>(request: Value) -> Result<T, Status> {
    let request = if request.is_null() {
        Value::Object(Default::default())
    } else {
        request
    };
    serde_json::from_value(request)
        .map_err(|err| Status::invalid_argument(format!("malformed request: {err}")))
}

pub(crate) fn to_value<T: serde::Serialize>(response: &T) -> CallResult {
    serde_json::to_value(response).map_err(Status::internal)
}

/// The caller attached by authorization; methods that reach a handler
/// without one were only allowed through bootstrap mode.
pub(crate) fn require_caller(ctx: &CallContext) -> Result<&Caller, Status> {
    ctx.caller
        .as_ref()
        .ok_or_else(|| Status::unauthenticated("missing session token"))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::audit::InMemoryAuditStore;
    use crate::auth::{ClientInfo, Profile};
    use crate::challenge::ChallengeStore;
    use crate::config::AuthConfig;
    use crate::session::InMemorySessionStore;
    use crate::users::InMemoryUserStore;
    use strata_core::Keypair;

    pub fn services() -> Arc<Services> {
        services_with(AuthConfig::default())
    }

    pub fn services_with(auth: AuthConfig) -> Arc<Services> {
        let config = Config {
            auth: auth.clone(),
            ..Config::default()
        };
        Arc::new(Services {
            auth: Arc::new(AuthService::new(
                Arc::new(ChallengeStore::new(auth.challenge_ttl())),
                Arc::new(InMemoryUserStore::new()),
                Arc::new(InMemorySessionStore::new()),
                auth,
                "node-a",
            )),
            config: Arc::new(config),
            audit: Arc::new(AuditLog::new(Arc::new(InMemoryAuditStore::new()), "node-a")),
            log_buffer: Arc::new(LogBuffer::new(16, 8)),
            shutdown: Arc::new(Notify::new()),
            started_at: Instant::now(),
        })
    }

    /// Log a fresh key in and return the caller-bearing context.
    pub fn login(services: &Services, method: &str) -> (Keypair, CallContext) {
        let key = Keypair::generate();
        let challenge = services
            .auth
            .challenge(key.public_key_ssh().as_bytes())
            .unwrap();
        let outcome = services
            .auth
            .verify_challenge(
                &challenge.id,
                &key.sign(&challenge.nonce),
                Profile::default(),
                ClientInfo::default(),
            )
            .unwrap();
        let caller = services.auth.resolve_token(&outcome.session.id).unwrap();
        let mut ctx = CallContext::new(method, Default::default());
        ctx.caller = Some(caller);
        (key, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::{default_mutation_table, default_policy_table};

    #[test]
    fn every_served_method_has_a_policy() {
        let registry = Registry::new(testing::services());
        default_policy_table()
            .check_complete(registry.registered_methods(), &default_mutation_table())
            .unwrap();
    }

    #[test]
    fn tail_logs_is_the_streaming_method() {
        let registry = Registry::new(testing::services());
        let streaming: Vec<_> = registry
            .registered_methods()
            .filter(|m| registry.get(m).is_some_and(|h| h.is_streaming()))
            .collect();
        assert_eq!(streaming, vec![methods::TAIL_LOGS]);
    }

    #[tokio::test]
    async fn unserved_method_is_unavailable() {
        let ctx = CallContext::new(methods::CREATE_TOPIC, Default::default());
        let err = not_served(testing::services(), ctx, Value::Null).await.unwrap_err();
        assert_eq!(err.code, crate::error::Code::Unavailable);
    }

    #[test]
    fn decode_rejects_wrong_shapes() {
        #[derive(serde::Deserialize)]
        struct Req {
            #[allow(dead_code)]
            n: u32,
        }
        let err = decode::<Req>(serde_json::json!({"n": "x"})).err().unwrap();
        assert_eq!(err.code, crate::error::Code::InvalidArgument);
    }
}
