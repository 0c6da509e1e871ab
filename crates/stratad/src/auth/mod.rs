//! Public-key challenge-response authentication and session lifecycle

pub mod service;

use axum::http::HeaderMap;

use crate::session::Session;
use crate::users::User;

pub use service::{
    AuthError, AuthService, ClientInfo, InvalidSessionReason, Profile, SessionInfo,
    SessionValidation, VerifyOutcome,
};

/// Metadata header carrying the session token
pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

/// The authenticated principal of a call.
#[derive(Clone, Debug)]
pub struct Caller {
    pub user: User,
    pub session: Session,
}

impl Caller {
    pub fn user_id(&self) -> &str {
        &self.user.id
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }
}

/// Session token from call metadata.
///
/// The dedicated session header wins; otherwise `Authorization` is read as
/// `Bearer <token>` (prefix case-insensitive) or as a raw token.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get(SESSION_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }

    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?
        .trim_start();

    let token = match auth_header.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => auth_header[7..].trim(),
        // a bare scheme with its trailing space stripped in transit
        _ if auth_header.trim_end().eq_ignore_ascii_case("bearer") => "",
        _ => auth_header.trim_end(),
    };

    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn session_header_wins() {
        let map = headers(&[
            (SESSION_TOKEN_HEADER, "tok-a"),
            ("authorization", "Bearer tok-b"),
        ]);
        assert_eq!(extract_token(&map).as_deref(), Some("tok-a"));
    }

    #[test]
    fn bearer_prefix_is_case_insensitive() {
        for value in ["Bearer tok", "bearer tok", "BEARER   tok"] {
            let map = headers(&[("authorization", value)]);
            assert_eq!(extract_token(&map).as_deref(), Some("tok"), "{value}");
        }
    }

    #[test]
    fn raw_authorization_value_is_a_token() {
        let map = headers(&[("authorization", "tok-raw")]);
        assert_eq!(extract_token(&map).as_deref(), Some("tok-raw"));
    }

    #[test]
    fn missing_or_empty_token() {
        assert_eq!(extract_token(&HeaderMap::new()), None);
        let map = headers(&[("authorization", "Bearer ")]);
        assert_eq!(extract_token(&map), None);
        let map = headers(&[(SESSION_TOKEN_HEADER, " ")]);
        assert_eq!(extract_token(&map), None);
    }
}
