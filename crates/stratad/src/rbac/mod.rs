//! Role-based access control for the RPC surface.
//!
//! Policy is data: one [`MethodPermission`] per fully-qualified method.
//! Anything not in the table is denied.

mod table;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use serde::Serialize;

use crate::audit::AuditAction;
use crate::auth::{extract_token, AuthService, Caller};
use crate::error::Status;
use crate::users::Role;

pub use table::{default_mutation_table, default_policy_table};

/// Access rule for one method
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MethodPermission {
    pub requires_auth: bool,
    pub min_role: Option<Role>,
    /// Callers below `min_role` may still act on their own user record
    pub allow_self: bool,
    /// Reachable without a token while no users exist
    pub allow_bootstrap: bool,
}

impl MethodPermission {
    pub const fn public() -> Self {
        Self {
            requires_auth: false,
            min_role: None,
            allow_self: false,
            allow_bootstrap: false,
        }
    }

    pub const fn authenticated() -> Self {
        Self {
            requires_auth: true,
            min_role: None,
            allow_self: false,
            allow_bootstrap: false,
        }
    }

    pub const fn role(role: Role) -> Self {
        Self {
            requires_auth: true,
            min_role: Some(role),
            allow_self: false,
            allow_bootstrap: false,
        }
    }

    pub const fn with_self(mut self) -> Self {
        self.allow_self = true;
        self
    }

    pub const fn with_bootstrap(mut self) -> Self {
        self.allow_bootstrap = true;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct PolicyTable {
    entries: BTreeMap<String, MethodPermission>,
}

impl PolicyTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, method: &str, permission: MethodPermission) {
        self.entries.insert(method.to_string(), permission);
    }

    pub fn get(&self, method: &str) -> Option<&MethodPermission> {
        self.entries.get(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Every registered method and every audited mutation must have a
    /// policy entry.
    pub fn check_complete<'a>(
        &self,
        registered: impl IntoIterator<Item = &'a str>,
        mutations: &MutationTable,
    ) -> Result<(), IncompletePolicy> {
        let mut missing: Vec<String> = registered
            .into_iter()
            .filter(|m| self.get(m).is_none())
            .map(str::to_string)
            .collect();
        missing.extend(
            mutations
                .methods()
                .filter(|m| self.get(m).is_none())
                .map(str::to_string),
        );
        missing.sort();
        missing.dedup();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(IncompletePolicy { missing })
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("methods without a policy entry: {}", missing.join(", "))]
pub struct IncompletePolicy {
    pub missing: Vec<String>,
}

/// Methods whose calls are recorded in the audit chain
#[derive(Clone, Debug, Default)]
pub struct MutationTable {
    entries: BTreeMap<String, AuditAction>,
}

impl MutationTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, method: &str, action: AuditAction) {
        self.entries.insert(method.to_string(), action);
    }

    pub fn get(&self, method: &str) -> Option<AuditAction> {
        self.entries.get(method).copied()
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Per-call policy decision.
pub struct RbacEnforcer {
    table: Arc<PolicyTable>,
    auth: Arc<AuthService>,
}

impl RbacEnforcer {
    pub fn new(table: Arc<PolicyTable>, auth: Arc<AuthService>) -> Self {
        Self { table, auth }
    }

    /// Decide whether a call may proceed. Returns the caller to attach to
    /// the call context, if the method needed one.
    pub fn authorize(
        &self,
        method: &str,
        metadata: &HeaderMap,
        request: &serde_json::Value,
    ) -> Result<Option<Caller>, Status> {
        let Some(permission) = self.table.get(method) else {
            tracing::warn!(method = %method, "Denied call to method without a policy entry");
            return Err(Status::permission_denied(format!(
                "method {method} is not permitted"
            )));
        };

        if !permission.requires_auth {
            return Ok(None);
        }

        if permission.allow_bootstrap && self.auth.is_bootstrap_mode().map_err(Status::from)? {
            tracing::debug!(method = %method, "Allowed in bootstrap mode");
            return Ok(None);
        }

        let token = extract_token(metadata)
            .ok_or_else(|| Status::unauthenticated("missing session token"))?;
        let caller = self.auth.resolve_token(&token).map_err(Status::from)?;

        if let Some(required) = permission.min_role {
            let is_self = permission.allow_self
                && request
                    .get("user_id")
                    .and_then(|v| v.as_str())
                    .is_some_and(|target| target == caller.user.id);

            if !caller.user.role.satisfies(required) && !is_self {
                tracing::info!(
                    method = %method,
                    user_id = %caller.user.id,
                    role = %caller.user.role,
                    required = %required,
                    "Denied call below required role"
                );
                return Err(Status::permission_denied(format!(
                    "method {method} requires role {required}"
                )));
            }
        }

        Ok(Some(caller))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ClientInfo, Profile, SESSION_TOKEN_HEADER};
    use crate::challenge::ChallengeStore;
    use crate::config::AuthConfig;
    use crate::error::Code;
    use crate::methods;
    use crate::session::InMemorySessionStore;
    use crate::users::InMemoryUserStore;
    use strata_core::Keypair;

    fn auth() -> Arc<AuthService> {
        Arc::new(AuthService::new(
            Arc::new(ChallengeStore::new(std::time::Duration::from_secs(30))),
            Arc::new(InMemoryUserStore::new()),
            Arc::new(InMemorySessionStore::new()),
            AuthConfig::default(),
            "node-a",
        ))
    }

    fn login(auth: &AuthService) -> (String, String) {
        let key = Keypair::generate();
        let challenge = auth.challenge(key.public_key_ssh().as_bytes()).unwrap();
        let outcome = auth
            .verify_challenge(
                &challenge.id,
                &key.sign(&challenge.nonce),
                Profile::default(),
                ClientInfo::default(),
            )
            .unwrap();
        (outcome.session.id, outcome.user.id)
    }

    fn with_token(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_TOKEN_HEADER, token.parse().unwrap());
        headers
    }

    fn enforcer(auth: Arc<AuthService>) -> RbacEnforcer {
        RbacEnforcer::new(Arc::new(default_policy_table()), auth)
    }

    #[test]
    fn unmapped_method_is_denied() {
        let enforcer = enforcer(auth());
        let err = enforcer
            .authorize("/strata.v1.Nope/Nothing", &HeaderMap::new(), &serde_json::Value::Null)
            .unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);
    }

    #[test]
    fn public_method_needs_no_token() {
        let enforcer = enforcer(auth());
        let caller = enforcer
            .authorize(methods::CHALLENGE, &HeaderMap::new(), &serde_json::Value::Null)
            .unwrap();
        assert!(caller.is_none());
    }

    #[test]
    fn bootstrap_methods_open_until_first_user() {
        let auth = auth();
        let enforcer = enforcer(auth.clone());
        let req = serde_json::json!({});

        assert!(enforcer
            .authorize(methods::LIST_USERS, &HeaderMap::new(), &req)
            .is_ok());
        assert_eq!(
            enforcer
                .authorize(methods::SHUTDOWN, &HeaderMap::new(), &req)
                .unwrap_err()
                .code,
            Code::Unauthenticated
        );

        login(&auth);
        assert_eq!(
            enforcer
                .authorize(methods::LIST_USERS, &HeaderMap::new(), &req)
                .unwrap_err()
                .code,
            Code::Unauthenticated
        );
    }

    #[test]
    fn role_below_minimum_names_required_role() {
        let auth = auth();
        let enforcer = enforcer(auth.clone());
        let (admin_token, _) = login(&auth);
        let (user_token, _) = login(&auth);
        let req = serde_json::json!({});

        let caller = enforcer
            .authorize(methods::SHUTDOWN, &with_token(&admin_token), &req)
            .unwrap()
            .unwrap();
        assert_eq!(caller.user.role, Role::Admin);

        let err = enforcer
            .authorize(methods::SHUTDOWN, &with_token(&user_token), &req)
            .unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);
        assert!(err.message.contains("admin"));
    }

    #[test]
    fn allow_self_lets_user_read_own_record() {
        let auth = auth();
        let enforcer = enforcer(auth.clone());
        let (_, admin_id) = login(&auth);
        let (user_token, user_id) = login(&auth);

        let own = serde_json::json!({ "user_id": user_id });
        assert!(enforcer
            .authorize(methods::GET_USER, &with_token(&user_token), &own)
            .is_ok());

        let other = serde_json::json!({ "user_id": admin_id });
        assert_eq!(
            enforcer
                .authorize(methods::GET_USER, &with_token(&user_token), &other)
                .unwrap_err()
                .code,
            Code::PermissionDenied
        );
    }

    #[test]
    fn invalid_token_is_unauthenticated() {
        let enforcer = enforcer(auth());
        let err = enforcer
            .authorize(methods::LOGOUT, &with_token("bogus"), &serde_json::Value::Null)
            .unwrap_err();
        assert_eq!(err.code, Code::Unauthenticated);
        assert!(err.message.contains("session not found"));
    }

    #[test]
    fn completeness_lists_missing_methods() {
        let table = default_policy_table();
        let mutations = default_mutation_table();
        assert!(table
            .check_complete([methods::CHALLENGE, methods::TAIL_LOGS], &mutations)
            .is_ok());

        let mut mutations = MutationTable::empty();
        mutations.insert("/strata.v1.Ghost/Haunt", AuditAction::Execute);
        let err = table
            .check_complete(["/strata.v1.Ghost/Boo", methods::CHALLENGE], &mutations)
            .unwrap_err();
        assert_eq!(
            err.missing,
            vec!["/strata.v1.Ghost/Boo".to_string(), "/strata.v1.Ghost/Haunt".to_string()]
        );
    }

    #[test]
    fn every_mutation_has_a_policy() {
        let table = default_policy_table();
        for method in default_mutation_table().methods() {
            assert!(table.get(method).is_some(), "{method}");
        }
    }
}
