//! AuthService handlers

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{decode, require_caller, to_value, Services};
use crate::auth::{extract_token, ClientInfo, Profile, SessionInfo};
use crate::error::{Status, Violations};
use crate::pipeline::{CallContext, CallResult};
use crate::session::SessionType;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ChallengeRequest {
    pub public_key: String,
}

#[derive(Debug, Serialize)]
pub struct ChallengeResponse {
    pub challenge_id: String,
    /// base64
    pub nonce: String,
    pub algorithm: String,
    pub key_type: String,
    pub expires_at: DateTime<Utc>,
}

pub async fn challenge(services: Arc<Services>, _ctx: CallContext, request: Value) -> CallResult {
    let req: ChallengeRequest = decode(request)?;
    let mut violations = Violations::new();
    violations.require("public_key", !req.public_key.trim().is_empty(), "public key is required");
    violations.into_result()?;

    let challenge = services.auth.challenge(req.public_key.trim().as_bytes())?;
    to_value(&ChallengeResponse {
        challenge_id: challenge.id,
        nonce: STANDARD.encode(&challenge.nonce),
        algorithm: challenge.algorithm,
        key_type: challenge.key_type.as_str().to_string(),
        expires_at: challenge.expires_at,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct VerifyChallengeRequest {
    pub challenge_id: String,
    /// base64 or hex
    pub signature: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub session_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyChallengeResponse {
    pub session_token: String,
    pub user_id: String,
    pub role: String,
    pub is_new_user: bool,
    pub expires_at: DateTime<Utc>,
}

pub async fn verify_challenge(
    services: Arc<Services>,
    ctx: CallContext,
    request: Value,
) -> CallResult {
    let req: VerifyChallengeRequest = decode(request)?;

    let mut violations = Violations::new();
    violations.require("challenge_id", !req.challenge_id.is_empty(), "challenge id is required");
    violations.require("signature", !req.signature.trim().is_empty(), "signature is required");
    let session_type = match req.session_type.as_deref() {
        None => SessionType::default(),
        Some(raw) => raw.parse::<SessionType>().unwrap_or_else(|err: String| {
            violations.push("session_type", err);
            SessionType::default()
        }),
    };
    if let Some(email) = &req.email {
        violations.require("email", email.contains('@'), "email must contain '@'");
    }
    violations.into_result()?;

    let signature = strata_core::decode_signature(&req.signature)
        .map_err(|err| {
            Status::invalid_argument(err.to_string())
                .with_violation("signature", "expected hex or base64")
        })?;

    let profile = Profile {
        display_name: req.display_name.filter(|n| !n.trim().is_empty()),
        email: req.email,
    };
    let client = ClientInfo {
        ip: ctx.client_ip.map(|ip| ip.to_string()),
        user_agent: ctx.user_agent().map(str::to_string),
        session_type,
    };

    let outcome = services
        .auth
        .verify_challenge(&req.challenge_id, &signature, profile, client)?;
    ctx.set_principal(outcome.user.id.as_str());

    to_value(&VerifyChallengeResponse {
        session_token: outcome.session.id,
        user_id: outcome.user.id,
        role: outcome.user.role.as_str().to_string(),
        is_new_user: outcome.is_new_user,
        expires_at: outcome.expires_at,
    })
}

pub async fn logout(services: Arc<Services>, ctx: CallContext, _request: Value) -> CallResult {
    let caller = require_caller(&ctx)?;
    let ended = services.auth.logout(caller.session_id())?;
    Ok(json!({ "ended": ended }))
}

pub async fn refresh_session(
    services: Arc<Services>,
    ctx: CallContext,
    _request: Value,
) -> CallResult {
    let caller = require_caller(&ctx)?;
    let info: SessionInfo = services.auth.refresh_session(caller.session_id())?;
    to_value(&info)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ValidateSessionRequest {
    /// Defaults to the token the call was made with
    pub token: Option<String>,
}

pub async fn validate_session(
    services: Arc<Services>,
    ctx: CallContext,
    request: Value,
) -> CallResult {
    let req: ValidateSessionRequest = decode(request)?;
    let token = req
        .token
        .filter(|t| !t.trim().is_empty())
        .or_else(|| extract_token(&ctx.metadata))
        .ok_or_else(|| {
            Status::invalid_argument("token is required")
                .with_violation("token", "token is required")
        })?;

    let validation = services.auth.validate_session(token.trim())?;
    to_value(&validation)
}

pub async fn list_my_sessions(
    services: Arc<Services>,
    ctx: CallContext,
    _request: Value,
) -> CallResult {
    let caller = require_caller(&ctx)?;
    let sessions = services.auth.list_my_sessions(caller)?;
    Ok(json!({ "sessions": sessions }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RevokeSessionRequest {
    pub session_id: String,
}

pub async fn revoke_session(
    services: Arc<Services>,
    ctx: CallContext,
    request: Value,
) -> CallResult {
    let req: RevokeSessionRequest = decode(request)?;
    let mut violations = Violations::new();
    violations.require("session_id", !req.session_id.is_empty(), "session id is required");
    violations.into_result()?;

    let caller = require_caller(&ctx)?;
    let revoked = services.auth.revoke_session(caller, &req.session_id)?;
    Ok(json!({ "revoked": revoked }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RevokeAllSessionsRequest {
    pub include_current: bool,
}

pub async fn revoke_all_sessions(
    services: Arc<Services>,
    ctx: CallContext,
    request: Value,
) -> CallResult {
    let req: RevokeAllSessionsRequest = decode(request)?;
    let caller = require_caller(&ctx)?;
    let revoked = services.auth.revoke_all_sessions(caller, req.include_current)?;
    Ok(json!({ "revoked": revoked }))
}
