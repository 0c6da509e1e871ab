//! Session records and their persistence.
//!
//! A session id doubles as the opaque bearer token handed to the client.
//! Expiry is lazy: a session is live while `ended_at` is unset and
//! `last_activity_at + timeout` lies in the future.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::control_db::{format_ts, parse_ts, ControlDb};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("invalid session timestamp: {0}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

const TOKEN_BYTES: usize = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    #[default]
    Cli,
    Web,
    Api,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Web => "web",
            Self::Api => "api",
        }
    }
}

impl std::str::FromStr for SessionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cli" => Ok(Self::Cli),
            "web" => Ok(Self::Web),
            "api" => Ok(Self::Api),
            other => Err(format!("unknown session type: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub session_type: SessionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_agent: Option<String>,
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn expires_at(&self, timeout: Duration) -> DateTime<Utc> {
        self.last_activity_at + timeout
    }

    pub fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now >= self.expires_at(timeout)
    }

    pub fn is_live(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.ended_at.is_none() && !self.is_expired(now, timeout)
    }
}

/// Fresh opaque session token: 32 random bytes, base64url.
pub fn new_session_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Storage contract for sessions.
pub trait SessionStore: Send + Sync {
    fn create(&self, session: &Session) -> Result<()>;
    fn get(&self, id: &str) -> Result<Option<Session>>;
    /// Bump `last_activity_at` on a session that is still live at `at`.
    /// Ended and idle-expired sessions stay dead.
    fn touch(&self, id: &str, at: DateTime<Utc>, timeout: Duration) -> Result<bool>;
    /// Set `ended_at` if unset. Returns true only for the call that ended it.
    fn end(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;
    /// Sessions of a user, newest first.
    fn list_by_user(&self, user_id: &str) -> Result<Vec<Session>>;
    /// Drop ended sessions and sessions idle since before `inactive_before`.
    fn cleanup(&self, inactive_before: DateTime<Utc>) -> Result<u64>;
}

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    inner: Arc<RwLock<HashMap<String, Session>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn create(&self, session: &Session) -> Result<()> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Session>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(id).cloned())
    }

    fn touch(&self, id: &str, at: DateTime<Utc>, timeout: Duration) -> Result<bool> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match map.get_mut(id) {
            Some(session) if session.is_live(at, timeout) => {
                session.last_activity_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn end(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match map.get_mut(id) {
            Some(session) if session.ended_at.is_none() => {
                session.ended_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn list_by_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut sessions: Vec<Session> = map
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }

    fn cleanup(&self, inactive_before: DateTime<Utc>) -> Result<u64> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let before = map.len() as u64;
        map.retain(|_, s| s.ended_at.is_none() && s.last_activity_at > inactive_before);
        Ok(before - map.len() as u64)
    }
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Arc<ControlDb>,
}

impl SqliteSessionStore {
    pub fn new(db: Arc<ControlDb>) -> Self {
        Self { db }
    }
}

const SESSION_COLUMNS: &str = "id, user_id, session_type, client_ip, client_agent, node_id, \
                               started_at, last_activity_at, ended_at";

fn parse_required(value: String) -> Result<DateTime<Utc>> {
    parse_ts(&value).ok_or(SessionError::InvalidTimestamp(value))
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session> {
    let session_type: String = row.get(2)?;
    let ended_at: Option<String> = row.get(8)?;
    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        session_type: session_type.parse().unwrap_or_default(),
        client_ip: row.get(3)?,
        client_agent: row.get(4)?,
        node_id: row.get(5)?,
        started_at: parse_required(row.get(6)?)?,
        last_activity_at: parse_required(row.get(7)?)?,
        ended_at: ended_at.map(parse_required).transpose()?,
    })
}

impl SessionStore for SqliteSessionStore {
    fn create(&self, session: &Session) -> Result<()> {
        let conn = self.db.lock_conn();
        conn.execute(
            &format!(
                "INSERT INTO sessions ({SESSION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            rusqlite::params![
                session.id,
                session.user_id,
                session.session_type.as_str(),
                session.client_ip,
                session.client_agent,
                session.node_id,
                format_ts(session.started_at),
                format_ts(session.last_activity_at),
                session.ended_at.map(format_ts),
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.db.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(rusqlite::params![id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        row_to_session(row).map(Some)
    }

    fn touch(&self, id: &str, at: DateTime<Utc>, timeout: Duration) -> Result<bool> {
        let conn = self.db.lock_conn();
        let changed = conn.execute(
            r#"
UPDATE sessions
SET last_activity_at = ?2
WHERE id = ?1 AND ended_at IS NULL AND last_activity_at > ?3
            "#,
            rusqlite::params![id, format_ts(at), format_ts(at - timeout)],
        )?;
        Ok(changed > 0)
    }

    fn end(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.db.lock_conn();
        let changed = conn.execute(
            "UPDATE sessions SET ended_at = ?2 WHERE id = ?1 AND ended_at IS NULL",
            rusqlite::params![id, format_ts(at)],
        )?;
        Ok(changed > 0)
    }

    fn list_by_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let conn = self.db.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1 ORDER BY started_at DESC"
        ))?;
        let mut rows = stmt.query(rusqlite::params![user_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_session(row)?);
        }
        Ok(out)
    }

    fn cleanup(&self, inactive_before: DateTime<Utc>) -> Result<u64> {
        let conn = self.db.lock_conn();
        let changed = conn.execute(
            "DELETE FROM sessions WHERE ended_at IS NOT NULL OR last_activity_at <= ?1",
            rusqlite::params![format_ts(inactive_before)],
        )?;
        Ok(changed as u64)
    }
}
