//! Registered principals and their persistence.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::KeyType;

use crate::control_db::{format_ts, parse_ts, ControlDb};

#[derive(Debug, thiserror::Error)]
pub enum UserStoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("user with fingerprint {0} already exists")]
    Conflict(String),
    #[error("corrupt user row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, UserStoreError>;

/// Role, totally ordered: Admin > User > Readonly
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Readonly,
    User,
    Admin,
}

impl Role {
    pub fn level(&self) -> u8 {
        match self {
            Self::Admin => 3,
            Self::User => 2,
            Self::Readonly => 1,
        }
    }

    pub fn satisfies(&self, required: Role) -> bool {
        self.level() >= required.level()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Readonly => "readonly",
        }
    }
}

impl PartialOrd for Role {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Role {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.level().cmp(&other.level())
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            "readonly" | "read_only" => Ok(Self::Readonly),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Pending,
    Active,
    Suspended,
    Deleted,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UserStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown user status: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    /// Canonical OpenSSH form, without comment
    pub public_key: String,
    pub key_type: KeyType,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub role: Role,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }
}

/// Storage contract for users.
pub trait UserStore: Send + Sync {
    /// Insert a new user. Fails with `Conflict` when the fingerprint is taken.
    fn create(&self, user: &User) -> Result<()>;
    fn get(&self, id: &str) -> Result<Option<User>>;
    fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<User>>;
    /// Set role and status only; returns false when the user does not exist.
    fn set_access(
        &self,
        id: &str,
        role: Role,
        status: UserStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;
    /// Stamp a login on a user that is still active. Returns false when the
    /// user is missing or no longer active, leaving the row untouched.
    fn record_login(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;
    fn list(&self) -> Result<Vec<User>>;
    fn count(&self) -> Result<u64>;
}

#[derive(Clone, Default)]
pub struct InMemoryUserStore {
    inner: Arc<RwLock<HashMap<String, User>>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserStore for InMemoryUserStore {
    fn create(&self, user: &User) -> Result<()> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if map.values().any(|u| u.fingerprint == user.fingerprint) {
            return Err(UserStoreError::Conflict(user.fingerprint.clone()));
        }
        map.insert(user.id.clone(), user.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<User>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(id).cloned())
    }

    fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<User>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.values().find(|u| u.fingerprint == fingerprint).cloned())
    }

    fn set_access(
        &self,
        id: &str,
        role: Role,
        status: UserStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match map.get_mut(id) {
            Some(user) => {
                user.role = role;
                user.status = status;
                user.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn record_login(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match map.get_mut(id) {
            Some(user) if user.is_active() => {
                user.last_login_at = Some(at);
                user.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn list(&self) -> Result<Vec<User>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut users: Vec<User> = map.values().cloned().collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(users)
    }

    fn count(&self) -> Result<u64> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.len() as u64)
    }
}

#[derive(Clone)]
pub struct SqliteUserStore {
    db: Arc<ControlDb>,
}

impl SqliteUserStore {
    pub fn new(db: Arc<ControlDb>) -> Self {
        Self { db }
    }
}

const USER_COLUMNS: &str = "id, public_key, key_type, fingerprint, display_name, email, role, \
                            status, created_at, updated_at, last_login_at";

fn row_to_user(row: &rusqlite::Row<'_>) -> Result<User> {
    let id: String = row.get(0)?;
    let corrupt = |reason: String| UserStoreError::Corrupt {
        id: id.clone(),
        reason,
    };

    let key_type: String = row.get(2)?;
    let role: String = row.get(6)?;
    let status: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    let last_login_at: Option<String> = row.get(10)?;

    Ok(User {
        id: id.clone(),
        public_key: row.get(1)?,
        key_type: key_type.parse().map_err(|e| corrupt(format!("{e}")))?,
        fingerprint: row.get(3)?,
        display_name: row.get(4)?,
        email: row.get(5)?,
        role: role.parse().map_err(corrupt)?,
        status: status.parse().map_err(corrupt)?,
        created_at: parse_ts(&created_at)
            .ok_or_else(|| corrupt(format!("bad created_at {created_at}")))?,
        updated_at: parse_ts(&updated_at)
            .ok_or_else(|| corrupt(format!("bad updated_at {updated_at}")))?,
        last_login_at: last_login_at.as_deref().and_then(parse_ts),
    })
}

impl SqliteUserStore {
    fn query_users(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<User>> {
        let conn = self.db.lock_conn();
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_user(row)?);
        }
        Ok(out)
    }
}

impl UserStore for SqliteUserStore {
    fn create(&self, user: &User) -> Result<()> {
        let conn = self.db.lock_conn();
        let res = conn.execute(
            &format!(
                "INSERT INTO users ({USER_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            rusqlite::params![
                user.id,
                user.public_key,
                user.key_type.as_str(),
                user.fingerprint,
                user.display_name,
                user.email,
                user.role.as_str(),
                user.status.as_str(),
                format_ts(user.created_at),
                format_ts(user.updated_at),
                user.last_login_at.map(format_ts),
            ],
        );

        match res {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(UserStoreError::Conflict(user.fingerprint.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn get(&self, id: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
        Ok(self.query_users(&sql, &[&id as &dyn rusqlite::ToSql])?.into_iter().next())
    }

    fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE fingerprint = ?1");
        Ok(self.query_users(&sql, &[&fingerprint as &dyn rusqlite::ToSql])?.into_iter().next())
    }

    fn set_access(
        &self,
        id: &str,
        role: Role,
        status: UserStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.db.lock_conn();
        let changed = conn.execute(
            "UPDATE users SET role = ?2, status = ?3, updated_at = ?4 WHERE id = ?1",
            rusqlite::params![id, role.as_str(), status.as_str(), format_ts(at)],
        )?;
        Ok(changed > 0)
    }

    fn record_login(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.db.lock_conn();
        let changed = conn.execute(
            r#"
UPDATE users
SET last_login_at = ?2, updated_at = ?2
WHERE id = ?1 AND status = 'active'
            "#,
            rusqlite::params![id, format_ts(at)],
        )?;
        Ok(changed > 0)
    }

    fn list(&self) -> Result<Vec<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY created_at ASC, id ASC");
        self.query_users(&sql, &[])
    }

    fn count(&self) -> Result<u64> {
        let conn = self.db.lock_conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}
