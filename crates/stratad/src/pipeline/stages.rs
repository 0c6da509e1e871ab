//! The concrete interceptor stages, in pipeline order.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{CallContext, Interceptor};
use crate::audit::{AuditDraft, AuditLog, ANONYMOUS_ACTOR};
use crate::auth::{extract_token, AuthService};
use crate::error::{Code, Status};
use crate::methods;
use crate::metrics::{Metrics, UNKNOWN_METHOD};
use crate::rate_limit::{bucket_key, RateLimiter};
use crate::rbac::{MutationTable, RbacEnforcer};

/// Inbound request id header; echoed into logs and audit metadata.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_REQUEST_ID_LEN: usize = 128;

fn outcome_code(outcome: &Result<(), Status>) -> Option<Code> {
    outcome.as_ref().err().map(|s| s.code)
}

/// Counts calls by method and outcome. Methods outside `known` share one
/// label, so arbitrary paths cannot mint new series.
pub struct MetricsInterceptor {
    metrics: Arc<Metrics>,
    known: HashSet<String>,
}

impl MetricsInterceptor {
    pub fn new<I, S>(metrics: Arc<Metrics>, known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            metrics,
            known: known.into_iter().map(Into::into).collect(),
        }
    }

    fn label<'a>(&self, method: &'a str) -> &'a str {
        if self.known.contains(method) {
            method
        } else {
            UNKNOWN_METHOD
        }
    }
}

#[async_trait]
impl Interceptor for MetricsInterceptor {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn before(&self, _ctx: &mut CallContext, _request: &Value) -> Result<(), Status> {
        self.metrics.call_started();
        Ok(())
    }

    async fn after(&self, ctx: &CallContext, outcome: &Result<(), Status>) {
        self.metrics.call_finished(
            self.label(&ctx.method),
            outcome_code(outcome),
            ctx.started_at.elapsed(),
        );
    }
}

/// Marks the panic boundary; everything after it runs guarded.
pub struct RecoveryInterceptor {
    metrics: Arc<Metrics>,
}

impl RecoveryInterceptor {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Interceptor for RecoveryInterceptor {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn recovers_panics(&self) -> bool {
        true
    }

    async fn after(&self, ctx: &CallContext, _outcome: &Result<(), Status>) {
        if let Some(panic) = &ctx.panic {
            self.metrics.inc_panic_recovered();
            tracing::error!(
                method = %ctx.method,
                request_id = %ctx.request_id,
                panic = %panic,
                "Recovered from panic in call"
            );
        }
    }
}

/// Adopts a sane client-supplied request id or mints one.
pub struct RequestIdInterceptor;

fn acceptable_request_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value.bytes().all(|b| b.is_ascii_graphic())
}

#[async_trait]
impl Interceptor for RequestIdInterceptor {
    fn name(&self) -> &'static str {
        "request_id"
    }

    async fn before(&self, ctx: &mut CallContext, _request: &Value) -> Result<(), Status> {
        ctx.request_id = ctx
            .metadata
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| acceptable_request_id(v))
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(())
    }
}

pub struct LoggingInterceptor;

#[async_trait]
impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn before(&self, ctx: &mut CallContext, _request: &Value) -> Result<(), Status> {
        tracing::debug!(
            method = %ctx.method,
            request_id = %ctx.request_id,
            client_ip = ?ctx.client_ip,
            streaming = ctx.streaming,
            "Call started"
        );
        Ok(())
    }

    async fn after(&self, ctx: &CallContext, outcome: &Result<(), Status>) {
        let duration_ms = ctx.elapsed_ms();
        let user_id = ctx.user_id().unwrap_or(ANONYMOUS_ACTOR);
        match outcome {
            Ok(()) => tracing::info!(
                method = %ctx.method,
                request_id = %ctx.request_id,
                user_id = %user_id,
                duration_ms,
                "Call completed"
            ),
            Err(status) if status.code == Code::Internal => tracing::error!(
                method = %ctx.method,
                request_id = %ctx.request_id,
                user_id = %user_id,
                duration_ms,
                "Call failed internally"
            ),
            Err(status) => tracing::warn!(
                method = %ctx.method,
                request_id = %ctx.request_id,
                user_id = %user_id,
                code = %status.code,
                message = %status.message,
                duration_ms,
                "Call failed"
            ),
        }
    }
}

/// Token bucket per caller identity, falling back to the client address.
///
/// Runs ahead of authorization, so the identity is looked up here without
/// failing the call; an unresolvable token simply counts against the address.
pub struct RateLimitInterceptor {
    limiter: Arc<RateLimiter>,
    auth: Arc<AuthService>,
    metrics: Arc<Metrics>,
}

impl RateLimitInterceptor {
    pub fn new(limiter: Arc<RateLimiter>, auth: Arc<AuthService>, metrics: Arc<Metrics>) -> Self {
        Self {
            limiter,
            auth,
            metrics,
        }
    }
}

#[async_trait]
impl Interceptor for RateLimitInterceptor {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn before(&self, ctx: &mut CallContext, _request: &Value) -> Result<(), Status> {
        if !self.limiter.is_enabled() {
            return Ok(());
        }

        let user_id = extract_token(&ctx.metadata)
            .and_then(|token| self.auth.resolve_token(&token).ok())
            .map(|caller| caller.user.id);
        let key = bucket_key(user_id.as_deref(), ctx.client_ip);

        if self.limiter.check(&key) {
            return Ok(());
        }

        self.metrics.inc_rate_limited();
        tracing::warn!(method = %ctx.method, key = %key, "Rate limit exceeded");
        Err(Status::resource_exhausted("rate limit exceeded"))
    }
}

/// Enforces the method policy table and attaches the caller.
pub struct AuthzInterceptor {
    enforcer: Arc<RbacEnforcer>,
}

impl AuthzInterceptor {
    pub fn new(enforcer: Arc<RbacEnforcer>) -> Self {
        Self { enforcer }
    }
}

#[async_trait]
impl Interceptor for AuthzInterceptor {
    fn name(&self) -> &'static str {
        "authz"
    }

    async fn before(&self, ctx: &mut CallContext, request: &Value) -> Result<(), Status> {
        ctx.caller = self
            .enforcer
            .authorize(&ctx.method, &ctx.metadata, request)?;
        Ok(())
    }
}

/// Appends a chain entry for every call of a mutating method.
///
/// Failures to append are logged and counted; they never change the
/// outcome of the call.
pub struct AuditInterceptor {
    log: Arc<AuditLog>,
    mutations: Arc<MutationTable>,
    metrics: Arc<Metrics>,
}

impl AuditInterceptor {
    pub fn new(log: Arc<AuditLog>, mutations: Arc<MutationTable>, metrics: Arc<Metrics>) -> Self {
        Self {
            log,
            mutations,
            metrics,
        }
    }

    fn draft(&self, ctx: &CallContext, outcome: &Result<(), Status>) -> Option<AuditDraft> {
        let action = self.mutations.get(&ctx.method)?;

        let mut draft =
            AuditDraft::new(action, methods::resource_of(&ctx.method), ctx.method.clone());
        draft.duration_ms = ctx.elapsed_ms();
        draft.rows_affected = u64::from(outcome.is_ok());
        let actor = match &ctx.caller {
            Some(caller) => Some(caller.user.id.as_str()),
            None if outcome.is_ok() => ctx.actor_id(),
            None => None,
        };
        if let Some(actor) = actor {
            draft.actor = actor.to_string();
        }

        let mut metadata = json!({
            "request_id": ctx.request_id,
            "client_ip": ctx.client_ip.map(|ip| ip.to_string()),
            "user_agent": ctx.user_agent(),
        });
        if let Some(caller) = &ctx.caller {
            // never the token itself
            let session_ref = strata_core::sha256_hex(caller.session.id.as_bytes());
            metadata["session_ref"] = Value::from(&session_ref[..16]);
            metadata["user_role"] = Value::from(caller.user.role.as_str());
        }
        if let Err(status) = outcome {
            metadata["error_code"] = Value::from(status.code.as_str());
            metadata["error"] = Value::from(status.message.as_str());
            draft.suspicious = status.is_auth_failure();
        }
        draft.metadata = metadata;
        Some(draft)
    }
}

#[async_trait]
impl Interceptor for AuditInterceptor {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn after(&self, ctx: &CallContext, outcome: &Result<(), Status>) {
        // nothing happened, nothing to record
        if !ctx.handler_invoked && matches!(outcome, Err(s) if s.code == Code::Cancelled) {
            return;
        }
        let Some(draft) = self.draft(ctx, outcome) else {
            return;
        };

        match self.log.log(draft) {
            Ok(entry) => {
                self.metrics.inc_audit_entry();
                tracing::debug!(
                    seq = entry.seq,
                    action = %entry.action.as_str(),
                    resource = %entry.resource,
                    "Audit entry appended"
                );
            }
            Err(err) => {
                self.metrics.inc_audit_failure();
                tracing::warn!(
                    method = %ctx.method,
                    request_id = %ctx.request_id,
                    error = %err,
                    "Failed to append audit entry"
                );
            }
        }
    }
}
