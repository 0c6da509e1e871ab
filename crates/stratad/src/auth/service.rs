//! Challenge issue/verify, registration and session management.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use strata_core::{verify_signature, PublicKey};

use crate::challenge::{Challenge, ChallengeError, ChallengeStore};
use crate::config::AuthConfig;
use crate::error::Status;
use crate::session::{new_session_token, Session, SessionError, SessionStore, SessionType};
use crate::users::{Role, User, UserStatus, UserStore, UserStoreError};

use super::Caller;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid public key: {0}")]
    InvalidKey(String),
    #[error("challenge not found or expired")]
    ChallengeNotFound,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("unknown public key and auto-registration is disabled")]
    RegistrationDisabled,
    #[error("user status: {0}")]
    UserStatus(UserStatus),
    #[error("{0}")]
    Unauthenticated(InvalidSessionReason),
    #[error("session not found")]
    SessionNotFound,
    #[error("cannot revoke another user's session")]
    NotSessionOwner,
    #[error("user {0} not found")]
    UserNotFound(String),
    #[error("cannot remove the last active administrator")]
    LastAdmin,
    #[error("challenge error: {0}")]
    Challenge(#[from] ChallengeError),
    #[error("user store error: {0}")]
    Users(#[from] UserStoreError),
    #[error("session store error: {0}")]
    Sessions(#[from] SessionError),
    #[error("stored key unusable: {0}")]
    StoredKey(#[from] strata_core::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;

impl From<AuthError> for Status {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidKey(_) => Status::invalid_argument(err.to_string()),
            AuthError::ChallengeNotFound
            | AuthError::SessionNotFound
            | AuthError::UserNotFound(_) => Status::not_found(err.to_string()),
            AuthError::LastAdmin => Status::failed_precondition(err.to_string()),
            AuthError::InvalidSignature | AuthError::Unauthenticated(_) => {
                Status::unauthenticated(err.to_string())
            }
            AuthError::RegistrationDisabled
            | AuthError::UserStatus(_)
            | AuthError::NotSessionOwner => Status::permission_denied(err.to_string()),
            AuthError::Challenge(_)
            | AuthError::Users(_)
            | AuthError::Sessions(_)
            | AuthError::StoredKey(_) => Status::internal(err),
        }
    }
}

/// Why a token does not map to a usable session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidSessionReason {
    NotFound,
    Expired,
    UserNotFound,
    UserStatus(UserStatus),
}

impl std::fmt::Display for InvalidSessionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => f.write_str("session not found"),
            Self::Expired => f.write_str("session expired"),
            Self::UserNotFound => f.write_str("user not found"),
            Self::UserStatus(status) => write!(f, "user status: {status}"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionValidation {
    fn invalid(reason: InvalidSessionReason) -> Self {
        Self {
            valid: false,
            reason: Some(reason.to_string()),
            user_id: None,
            expires_at: None,
        }
    }
}

/// Optional self-description supplied at first login
#[derive(Clone, Debug, Default)]
pub struct Profile {
    pub display_name: Option<String>,
    pub email: Option<String>,
}

/// Where a login came from
#[derive(Clone, Debug, Default)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub session_type: SessionType,
}

#[derive(Clone, Debug)]
pub struct VerifyOutcome {
    pub session: Session,
    pub user: User,
    pub is_new_user: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    #[serde(flatten)]
    pub session: Session,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub current: bool,
}

pub struct AuthService {
    challenges: Arc<ChallengeStore>,
    users: Arc<dyn UserStore>,
    sessions: Arc<dyn SessionStore>,
    config: AuthConfig,
    node_id: String,
    // serializes the lookup-then-create of first logins
    registration: Mutex<()>,
    // serializes the last-admin check with the role/status write
    access_changes: Mutex<()>,
}

/// Result of an administrative role or status change
#[derive(Clone, Debug)]
pub struct AccessChange {
    pub previous_role: Role,
    pub previous_status: UserStatus,
    pub user: User,
}

impl AuthService {
    pub fn new(
        challenges: Arc<ChallengeStore>,
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
        config: AuthConfig,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            challenges,
            users,
            sessions,
            config,
            node_id: node_id.into(),
            registration: Mutex::new(()),
            access_changes: Mutex::new(()),
        }
    }

    pub fn users(&self) -> &Arc<dyn UserStore> {
        &self.users
    }

    pub fn challenges(&self) -> &Arc<ChallengeStore> {
        &self.challenges
    }

    fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.session_timeout())
            .unwrap_or_else(|_| chrono::Duration::hours(24))
    }

    /// No users exist yet and bootstrap access is enabled.
    pub fn is_bootstrap_mode(&self) -> Result<bool> {
        Ok(self.config.bootstrap && self.users.count()? == 0)
    }

    /// Issue a challenge for a client-supplied public key.
    pub fn challenge(&self, public_key: &[u8]) -> Result<Challenge> {
        let key = PublicKey::parse(public_key).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        Ok(self.challenges.create(&key)?)
    }

    /// Redeem a challenge: check the signature over its nonce, resolve or
    /// register the key's owner and open a session.
    pub fn verify_challenge(
        &self,
        challenge_id: &str,
        signature: &[u8],
        profile: Profile,
        client: ClientInfo,
    ) -> Result<VerifyOutcome> {
        let challenge = self
            .challenges
            .get(challenge_id)
            .ok_or(AuthError::ChallengeNotFound)?;

        if !verify_signature(
            &challenge.public_key,
            challenge.key_type,
            &challenge.nonce,
            signature,
        )? {
            tracing::info!(challenge_id = %challenge_id, "Challenge signature rejected");
            return Err(AuthError::InvalidSignature);
        }

        let fingerprint = PublicKey::parse(challenge.public_key.as_bytes())?.fingerprint();
        let (user, is_new_user) = self.resolve_or_register(&challenge, &fingerprint, profile)?;

        if user.status != UserStatus::Active {
            tracing::info!(
                user_id = %user.id,
                status = %user.status,
                "Login refused for inactive user"
            );
            return Err(AuthError::UserStatus(user.status));
        }

        // the stamp only lands while the user is still active, so a suspension
        // racing this login wins
        let now = Utc::now();
        if !self.users.record_login(&user.id, now)? {
            let status = self
                .users
                .get(&user.id)?
                .map_or(UserStatus::Deleted, |current| current.status);
            tracing::info!(
                user_id = %user.id,
                status = %status,
                "Login refused, user changed during verification"
            );
            return Err(AuthError::UserStatus(status));
        }
        let user = self
            .users
            .get(&user.id)?
            .ok_or_else(|| AuthError::UserNotFound(user.id.clone()))?;

        let session = Session {
            id: new_session_token(),
            user_id: user.id.clone(),
            session_type: client.session_type,
            client_ip: client.ip,
            client_agent: client.user_agent,
            node_id: self.node_id.clone(),
            started_at: now,
            last_activity_at: now,
            ended_at: None,
        };
        self.sessions.create(&session)?;

        tracing::info!(
            user_id = %user.id,
            role = %user.role,
            is_new_user,
            "Session opened"
        );

        Ok(VerifyOutcome {
            expires_at: session.expires_at(self.session_timeout()),
            session,
            user,
            is_new_user,
        })
    }

    fn resolve_or_register(
        &self,
        challenge: &Challenge,
        fingerprint: &str,
        profile: Profile,
    ) -> Result<(User, bool)> {
        if let Some(user) = self.users.get_by_fingerprint(fingerprint)? {
            return Ok((user, false));
        }
        if !self.config.auto_register {
            return Err(AuthError::RegistrationDisabled);
        }

        let _registration = self
            .registration
            .lock()
            .unwrap_or_else(|err| err.into_inner());

        // another login for the same key may have won the race
        if let Some(user) = self.users.get_by_fingerprint(fingerprint)? {
            return Ok((user, false));
        }

        let bootstrap = self.config.bootstrap && self.users.count()? == 0;
        let (role, status) = if bootstrap {
            (Role::Admin, UserStatus::Active)
        } else if self.config.require_approval {
            (Role::User, UserStatus::Pending)
        } else {
            (Role::User, UserStatus::Active)
        };

        let now = Utc::now();
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            public_key: challenge.public_key.clone(),
            key_type: challenge.key_type,
            fingerprint: fingerprint.to_string(),
            display_name: profile.display_name,
            email: profile.email,
            role,
            status,
            created_at: now,
            updated_at: now,
            last_login_at: None,
        };
        self.users.create(&user)?;

        if bootstrap {
            tracing::warn!(
                user_id = %user.id,
                fingerprint = %fingerprint,
                "Registered bootstrap administrator"
            );
        } else {
            tracing::info!(user_id = %user.id, status = %status, "Registered new user");
        }
        Ok((user, true))
    }

    /// End a session. Returns false if it had already ended.
    pub fn logout(&self, session_id: &str) -> Result<bool> {
        let ended = self.sessions.end(session_id, Utc::now())?;
        if ended {
            tracing::info!("Session ended by logout");
        }
        Ok(ended)
    }

    /// Bump last activity; the token itself does not change.
    pub fn refresh_session(&self, session_id: &str) -> Result<SessionInfo> {
        let now = Utc::now();
        if !self.sessions.touch(session_id, now, self.session_timeout())? {
            return Err(AuthError::SessionNotFound);
        }
        let session = self
            .sessions
            .get(session_id)?
            .ok_or(AuthError::SessionNotFound)?;
        Ok(self.describe(session, Some(session_id), now))
    }

    /// Check a token without side effects.
    pub fn validate_session(&self, token: &str) -> Result<SessionValidation> {
        match self.lookup(token)? {
            Ok(caller) => Ok(SessionValidation {
                valid: true,
                reason: None,
                user_id: Some(caller.user.id.clone()),
                expires_at: Some(caller.session.expires_at(self.session_timeout())),
            }),
            Err(reason) => Ok(SessionValidation::invalid(reason)),
        }
    }

    /// Resolve a token to its caller, failing closed.
    pub fn resolve_token(&self, token: &str) -> Result<Caller> {
        match self.lookup(token)? {
            Ok(caller) => Ok(caller),
            Err(InvalidSessionReason::UserStatus(status)) => Err(AuthError::UserStatus(status)),
            Err(reason) => Err(AuthError::Unauthenticated(reason)),
        }
    }

    fn lookup(&self, token: &str) -> Result<std::result::Result<Caller, InvalidSessionReason>> {
        let Some(session) = self.sessions.get(token)? else {
            return Ok(Err(InvalidSessionReason::NotFound));
        };
        // an ended session is as dead as an idle one
        if !session.is_live(Utc::now(), self.session_timeout()) {
            return Ok(Err(InvalidSessionReason::Expired));
        }
        let Some(user) = self.users.get(&session.user_id)? else {
            return Ok(Err(InvalidSessionReason::UserNotFound));
        };
        if user.status != UserStatus::Active {
            return Ok(Err(InvalidSessionReason::UserStatus(user.status)));
        }
        Ok(Ok(Caller { user, session }))
    }

    fn describe(&self, session: Session, current: Option<&str>, now: DateTime<Utc>) -> SessionInfo {
        let timeout = self.session_timeout();
        SessionInfo {
            expires_at: session.expires_at(timeout),
            active: session.is_live(now, timeout),
            current: current == Some(session.id.as_str()),
            session,
        }
    }

    /// The caller's sessions, newest first, with current/active markers.
    pub fn list_my_sessions(&self, caller: &Caller) -> Result<Vec<SessionInfo>> {
        let now = Utc::now();
        Ok(self
            .sessions
            .list_by_user(caller.user_id())?
            .into_iter()
            .map(|s| self.describe(s, Some(caller.session_id()), now))
            .collect())
    }

    /// End one of the caller's own sessions.
    pub fn revoke_session(&self, caller: &Caller, target_id: &str) -> Result<bool> {
        let target = self
            .sessions
            .get(target_id)?
            .ok_or(AuthError::SessionNotFound)?;
        if target.user_id != caller.user_id() {
            tracing::warn!(
                user_id = %caller.user_id(),
                owner_id = %target.user_id,
                "Refused to revoke another user's session"
            );
            return Err(AuthError::NotSessionOwner);
        }
        Ok(self.sessions.end(target_id, Utc::now())?)
    }

    /// End every not-yet-ended session of the caller; the current one only
    /// when `include_current`. Returns how many were actually ended.
    pub fn revoke_all_sessions(&self, caller: &Caller, include_current: bool) -> Result<u64> {
        let now = Utc::now();
        let mut revoked = 0u64;
        for session in self.sessions.list_by_user(caller.user_id())? {
            if session.ended_at.is_some() {
                continue;
            }
            if session.id == caller.session_id() && !include_current {
                continue;
            }
            if self.sessions.end(&session.id, now)? {
                revoked = revoked.saturating_add(1);
            }
        }
        tracing::info!(user_id = %caller.user_id(), revoked, "Revoked sessions");
        Ok(revoked)
    }

    /// Change a user's role and/or status. Refuses changes that would leave
    /// no active administrator behind.
    pub fn change_access(
        &self,
        user_id: &str,
        role: Option<Role>,
        status: Option<UserStatus>,
    ) -> Result<AccessChange> {
        let _guard = self
            .access_changes
            .lock()
            .unwrap_or_else(|err| err.into_inner());

        let user = self
            .users
            .get(user_id)?
            .ok_or_else(|| AuthError::UserNotFound(user_id.to_string()))?;
        let new_role = role.unwrap_or(user.role);
        let new_status = status.unwrap_or(user.status);

        let was_admin = user.role == Role::Admin && user.is_active();
        let stays_admin = new_role == Role::Admin && new_status == UserStatus::Active;
        if was_admin && !stays_admin {
            let active_admins = self
                .users
                .list()?
                .into_iter()
                .filter(|u| u.role == Role::Admin && u.is_active())
                .count();
            if active_admins <= 1 {
                return Err(AuthError::LastAdmin);
            }
        }

        if (new_role, new_status) != (user.role, user.status)
            && !self
                .users
                .set_access(user_id, new_role, new_status, Utc::now())?
        {
            return Err(AuthError::UserNotFound(user_id.to_string()));
        }
        let updated = self
            .users
            .get(user_id)?
            .ok_or_else(|| AuthError::UserNotFound(user_id.to_string()))?;

        Ok(AccessChange {
            previous_role: user.role,
            previous_status: user.status,
            user: updated,
        })
    }

    /// End all sessions of a user, e.g. on suspension.
    pub fn end_user_sessions(&self, user_id: &str) -> Result<u64> {
        let now = Utc::now();
        let mut ended = 0u64;
        for session in self.sessions.list_by_user(user_id)? {
            if self.sessions.end(&session.id, now)? {
                ended = ended.saturating_add(1);
            }
        }
        Ok(ended)
    }

    /// Drop expired challenges and dead sessions.
    pub fn sweep(&self) -> Result<(usize, u64)> {
        let challenges = self.challenges.purge_expired();
        let sessions = self.sessions.cleanup(Utc::now() - self.session_timeout())?;
        Ok((challenges, sessions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionStore;
    use crate::users::InMemoryUserStore;
    use strata_core::Keypair;

    /// Suspends a user right after handing out its record, the way an
    /// administrator acting mid-login would.
    struct SuspendAfterLookup {
        inner: InMemoryUserStore,
    }

    impl UserStore for SuspendAfterLookup {
        fn create(&self, user: &User) -> crate::users::Result<()> {
            self.inner.create(user)
        }

        fn get(&self, id: &str) -> crate::users::Result<Option<User>> {
            self.inner.get(id)
        }

        fn get_by_fingerprint(&self, fingerprint: &str) -> crate::users::Result<Option<User>> {
            let found = self.inner.get_by_fingerprint(fingerprint)?;
            if let Some(user) = &found {
                self.inner
                    .set_access(&user.id, user.role, UserStatus::Suspended, Utc::now())?;
            }
            Ok(found)
        }

        fn set_access(
            &self,
            id: &str,
            role: Role,
            status: UserStatus,
            at: DateTime<Utc>,
        ) -> crate::users::Result<bool> {
            self.inner.set_access(id, role, status, at)
        }

        fn record_login(&self, id: &str, at: DateTime<Utc>) -> crate::users::Result<bool> {
            self.inner.record_login(id, at)
        }

        fn list(&self) -> crate::users::Result<Vec<User>> {
            self.inner.list()
        }

        fn count(&self) -> crate::users::Result<u64> {
            self.inner.count()
        }
    }

    fn service(config: AuthConfig) -> AuthService {
        AuthService::new(
            Arc::new(ChallengeStore::new(config.challenge_ttl())),
            Arc::new(InMemoryUserStore::new()),
            Arc::new(InMemorySessionStore::new()),
            config,
            "node-a",
        )
    }

    fn login(svc: &AuthService, key: &Keypair) -> Result<VerifyOutcome> {
        let challenge = svc.challenge(key.public_key_ssh().as_bytes())?;
        let signature = key.sign(&challenge.nonce);
        svc.verify_challenge(&challenge.id, &signature, Profile::default(), ClientInfo::default())
    }

    #[test]
    fn first_login_bootstraps_admin() {
        let svc = service(AuthConfig::default());
        assert!(svc.is_bootstrap_mode().unwrap());

        let outcome = login(&svc, &Keypair::generate()).unwrap();
        assert!(outcome.is_new_user);
        assert_eq!(outcome.user.role, Role::Admin);
        assert!(!svc.is_bootstrap_mode().unwrap());

        let second = login(&svc, &Keypair::generate()).unwrap();
        assert!(second.is_new_user);
        assert_eq!(second.user.role, Role::User);
    }

    #[test]
    fn returning_user_is_not_new() {
        let svc = service(AuthConfig::default());
        let key = Keypair::generate();
        let first = login(&svc, &key).unwrap();
        let again = login(&svc, &key).unwrap();
        assert!(!again.is_new_user);
        assert_eq!(first.user.id, again.user.id);
        assert_ne!(first.session.id, again.session.id);
    }

    #[test]
    fn replayed_challenge_is_not_found() {
        let svc = service(AuthConfig::default());
        let key = Keypair::generate();
        let challenge = svc.challenge(key.public_key_ssh().as_bytes()).unwrap();
        let signature = key.sign(&challenge.nonce);

        svc.verify_challenge(&challenge.id, &signature, Profile::default(), ClientInfo::default())
            .unwrap();
        let err = svc
            .verify_challenge(&challenge.id, &signature, Profile::default(), ClientInfo::default())
            .unwrap_err();
        assert!(matches!(err, AuthError::ChallengeNotFound));
    }

    #[test]
    fn bit_flipped_signature_is_unauthenticated() {
        let svc = service(AuthConfig::default());
        let key = Keypair::generate();
        let challenge = svc.challenge(key.public_key_ssh().as_bytes()).unwrap();
        let mut signature = key.sign(&challenge.nonce);
        signature[10] ^= 0x01;

        let err = svc
            .verify_challenge(&challenge.id, &signature, Profile::default(), ClientInfo::default())
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidSignature));
        assert_eq!(Status::from(err).code, crate::error::Code::Unauthenticated);
        assert_eq!(svc.users().count().unwrap(), 0);
    }

    #[test]
    fn signature_over_other_bytes_is_rejected() {
        let svc = service(AuthConfig::default());
        let key = Keypair::generate();
        let challenge = svc.challenge(key.public_key_ssh().as_bytes()).unwrap();
        let signature = key.sign(b"not the nonce");
        assert!(matches!(
            svc.verify_challenge(
                &challenge.id,
                &signature,
                Profile::default(),
                ClientInfo::default(),
            ),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn malformed_key_is_invalid_argument() {
        let svc = service(AuthConfig::default());
        let err = svc.challenge(b"definitely not a key").unwrap_err();
        assert_eq!(Status::from(err).code, crate::error::Code::InvalidArgument);
    }

    #[test]
    fn auto_registration_disabled_denies_unknown_keys() {
        let svc = service(AuthConfig {
            auto_register: false,
            ..Default::default()
        });
        let err = login(&svc, &Keypair::generate()).unwrap_err();
        assert!(matches!(err, AuthError::RegistrationDisabled));
        assert_eq!(Status::from(err).code, crate::error::Code::PermissionDenied);
    }

    #[test]
    fn approval_workflow_leaves_user_pending() {
        let svc = service(AuthConfig {
            require_approval: true,
            ..Default::default()
        });
        // the bootstrap admin is exempt
        login(&svc, &Keypair::generate()).unwrap();

        let err = login(&svc, &Keypair::generate()).unwrap_err();
        assert_eq!(err.to_string(), "user status: pending");
        assert_eq!(svc.users().count().unwrap(), 2);
    }

    #[test]
    fn validate_reports_reasons() {
        let svc = service(AuthConfig::default());
        let outcome = login(&svc, &Keypair::generate()).unwrap();

        let ok = svc.validate_session(&outcome.session.id).unwrap();
        assert!(ok.valid);
        assert_eq!(ok.user_id.as_deref(), Some(outcome.user.id.as_str()));

        let missing = svc.validate_session("nope").unwrap();
        assert_eq!(missing.reason.as_deref(), Some("session not found"));

        assert!(svc.logout(&outcome.session.id).unwrap());
        let ended = svc.validate_session(&outcome.session.id).unwrap();
        assert!(!ended.valid);
        assert_eq!(ended.reason.as_deref(), Some("session expired"));
    }

    #[test]
    fn suspended_user_fails_validation() {
        let svc = service(AuthConfig::default());
        let outcome = login(&svc, &Keypair::generate()).unwrap();
        svc.users()
            .set_access(&outcome.user.id, Role::Admin, UserStatus::Suspended, Utc::now())
            .unwrap();

        let v = svc.validate_session(&outcome.session.id).unwrap();
        assert_eq!(v.reason.as_deref(), Some("user status: suspended"));
        assert!(matches!(
            svc.resolve_token(&outcome.session.id),
            Err(AuthError::UserStatus(UserStatus::Suspended))
        ));
    }

    #[test]
    fn revoke_other_users_session_is_denied() {
        let svc = service(AuthConfig::default());
        let alice = login(&svc, &Keypair::generate()).unwrap();
        let bob = login(&svc, &Keypair::generate()).unwrap();

        let alice_caller = svc.resolve_token(&alice.session.id).unwrap();
        let err = svc
            .revoke_session(&alice_caller, &bob.session.id)
            .unwrap_err();
        assert!(matches!(err, AuthError::NotSessionOwner));
        assert!(svc.validate_session(&bob.session.id).unwrap().valid);
    }

    #[test]
    fn revoke_all_skips_current_unless_asked() {
        let svc = service(AuthConfig::default());
        let key = Keypair::generate();
        let current = login(&svc, &key).unwrap();
        login(&svc, &key).unwrap();
        let third = login(&svc, &key).unwrap();
        svc.logout(&third.session.id).unwrap();

        let caller = svc.resolve_token(&current.session.id).unwrap();
        assert_eq!(svc.revoke_all_sessions(&caller, false).unwrap(), 1);
        assert!(svc.validate_session(&current.session.id).unwrap().valid);
        assert_eq!(svc.revoke_all_sessions(&caller, true).unwrap(), 1);
        assert!(!svc.validate_session(&current.session.id).unwrap().valid);
    }

    #[test]
    fn list_marks_current_session() {
        let svc = service(AuthConfig::default());
        let key = Keypair::generate();
        let first = login(&svc, &key).unwrap();
        let second = login(&svc, &key).unwrap();
        svc.logout(&first.session.id).unwrap();

        let caller = svc.resolve_token(&second.session.id).unwrap();
        let sessions = svc.list_my_sessions(&caller).unwrap();
        assert_eq!(sessions.len(), 2);
        let current = sessions.iter().find(|s| s.current).unwrap();
        assert_eq!(current.session.id, second.session.id);
        assert!(current.active);
        assert!(sessions.iter().any(|s| !s.active));
    }

    #[test]
    fn refresh_keeps_token() {
        let svc = service(AuthConfig::default());
        let outcome = login(&svc, &Keypair::generate()).unwrap();
        let refreshed = svc.refresh_session(&outcome.session.id).unwrap();
        assert_eq!(refreshed.session.id, outcome.session.id);
        assert!(refreshed.session.last_activity_at >= outcome.session.last_activity_at);

        svc.logout(&outcome.session.id).unwrap();
        assert!(matches!(
            svc.refresh_session(&outcome.session.id),
            Err(AuthError::SessionNotFound)
        ));
    }

    #[test]
    fn suspension_during_login_is_not_reverted() {
        let users = InMemoryUserStore::new();
        let sessions = Arc::new(InMemorySessionStore::new());
        let config = AuthConfig::default();
        let svc = AuthService::new(
            Arc::new(ChallengeStore::new(config.challenge_ttl())),
            Arc::new(SuspendAfterLookup {
                inner: users.clone(),
            }),
            sessions.clone(),
            config,
            "node-a",
        );

        let key = Keypair::generate();
        let first = login(&svc, &key).unwrap();
        assert!(first.is_new_user);
        users
            .set_access(&first.user.id, Role::Admin, UserStatus::Active, Utc::now())
            .unwrap();

        // the second login reads an active record, then the user is suspended
        let err = login(&svc, &key).unwrap_err();
        assert!(matches!(err, AuthError::UserStatus(UserStatus::Suspended)));
        assert_eq!(Status::from(err).code, crate::error::Code::PermissionDenied);

        let stored = users.get(&first.user.id).unwrap().unwrap();
        assert_eq!(stored.status, UserStatus::Suspended);
        assert_eq!(stored.role, Role::Admin);
        assert_eq!(sessions.list_by_user(&first.user.id).unwrap().len(), 1);
    }

    #[test]
    fn login_stamps_last_login() {
        let svc = service(AuthConfig::default());
        let outcome = login(&svc, &Keypair::generate()).unwrap();
        assert!(outcome.user.last_login_at.is_some());
        let stored = svc.users().get(&outcome.user.id).unwrap().unwrap();
        assert_eq!(stored.last_login_at, outcome.user.last_login_at);
    }

    #[test]
    fn change_access_keeps_one_admin() {
        let svc = service(AuthConfig::default());
        let admin = login(&svc, &Keypair::generate()).unwrap();
        let member = login(&svc, &Keypair::generate()).unwrap();

        let err = svc.change_access(&admin.user.id, Some(Role::User), None).unwrap_err();
        assert!(matches!(err, AuthError::LastAdmin));
        assert_eq!(Status::from(err).code, crate::error::Code::FailedPrecondition);
        assert!(matches!(
            svc.change_access(&admin.user.id, None, Some(UserStatus::Suspended)),
            Err(AuthError::LastAdmin)
        ));

        let promoted = svc.change_access(&member.user.id, Some(Role::Admin), None).unwrap();
        assert_eq!(promoted.previous_role, Role::User);
        assert_eq!(promoted.user.role, Role::Admin);

        let demoted = svc.change_access(&admin.user.id, Some(Role::Readonly), None).unwrap();
        assert_eq!(demoted.user.role, Role::Readonly);
        assert!(matches!(
            svc.change_access("ghost", Some(Role::User), None),
            Err(AuthError::UserNotFound(_))
        ));
    }

    #[test]
    fn concurrent_demotions_leave_an_admin() {
        for _ in 0..20 {
            let svc = Arc::new(service(AuthConfig::default()));
            let first = login(&svc, &Keypair::generate()).unwrap();
            let second = login(&svc, &Keypair::generate()).unwrap();
            svc.change_access(&second.user.id, Some(Role::Admin), None).unwrap();

            let barrier = Arc::new(std::sync::Barrier::new(2));
            let handles: Vec<_> = [first.user.id.clone(), second.user.id.clone()]
                .into_iter()
                .map(|id| {
                    let svc = svc.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        svc.change_access(&id, None, Some(UserStatus::Suspended)).is_ok()
                    })
                })
                .collect();
            let succeeded = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count();
            assert_eq!(succeeded, 1);

            let active_admins = svc
                .users()
                .list()
                .unwrap()
                .into_iter()
                .filter(|u| u.role == Role::Admin && u.is_active())
                .count();
            assert_eq!(active_admins, 1);
        }
    }

    #[test]
    fn refresh_does_not_revive_idle_session() {
        let svc = service(AuthConfig::default());
        let outcome = login(&svc, &Keypair::generate()).unwrap();

        let mut stale = outcome.session.clone();
        stale.id = new_session_token();
        stale.last_activity_at = Utc::now() - svc.session_timeout() - chrono::Duration::seconds(1);
        svc.sessions.create(&stale).unwrap();

        assert!(matches!(
            svc.refresh_session(&stale.id),
            Err(AuthError::SessionNotFound)
        ));
        let stored = svc.sessions.get(&stale.id).unwrap().unwrap();
        assert_eq!(stored.last_activity_at, stale.last_activity_at);
    }
}
