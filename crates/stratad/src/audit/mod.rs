//! Hash-chained, append-only audit log for privileged mutations.
//!
//! Each entry commits to its predecessor through `prev_hash`, and its own
//! `entry_hash` is SHA-256 over a fixed, length-prefixed encoding of the
//! identifying fields. Appends are serialized by a single-writer lock; the
//! SQLite store additionally refuses an append whose `prev_hash` does not
//! match the stored tail, so the chain cannot fork even across handles.

mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use strata_core::{sha256, sha256_hex};

/// Error type for audit operations
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chain tail moved: expected prev_hash {expected:?}, stored tail is {found:?}")]
    ChainConflict { expected: String, found: String },
    #[error("corrupt audit row {seq}: {reason}")]
    Corrupt { seq: u64, reason: String },
}

pub type Result<T> = std::result::Result<T, AuditError>;

/// Timestamp layout hashed into every entry
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";

/// Source tag for entries produced by the RPC pipeline
pub const SOURCE_RPC: &str = "rpc";

/// Actor recorded when no user is attached to the call
pub const ANONYMOUS_ACTOR: &str = "anonymous";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Ddl,
    Execute,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Ddl => "DDL",
            Self::Execute => "EXECUTE",
        }
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "DDL" => Ok(Self::Ddl),
            "EXECUTE" => Ok(Self::Execute),
            other => Err(format!("unknown audit action: {other}")),
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sealed audit record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Insertion order, assigned by the store (1-based)
    pub seq: u64,
    pub timestamp: String,
    pub node_id: String,
    pub operation_id: String,
    pub action: AuditAction,
    pub resource: String,
    /// Raw request description
    pub description: String,
    pub query_hash: String,
    pub rows_affected: u64,
    pub duration_ms: u64,
    pub source: String,
    pub actor: String,
    pub metadata: serde_json::Value,
    pub prev_hash: String,
    pub entry_hash: String,
    pub suspicious: bool,
}

impl AuditEntry {
    /// Recompute the hash this entry should carry.
    pub fn compute_hash(&self) -> String {
        entry_hash(
            &self.timestamp,
            &self.node_id,
            &self.operation_id,
            self.action,
            &self.resource,
            &self.actor,
            &self.prev_hash,
            self.duration_ms,
        )
    }
}

/// The caller-supplied part of an entry; chain fields are filled in by [`AuditLog`].
#[derive(Clone, Debug)]
pub struct AuditDraft {
    pub operation_id: String,
    pub action: AuditAction,
    pub resource: String,
    pub description: String,
    pub rows_affected: u64,
    pub duration_ms: u64,
    pub source: String,
    pub actor: String,
    pub metadata: serde_json::Value,
    pub suspicious: bool,
}

impl AuditDraft {
    pub fn new(
        action: AuditAction,
        resource: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            operation_id: uuid::Uuid::now_v7().to_string(),
            action,
            resource: resource.into(),
            description: description.into(),
            rows_affected: 0,
            duration_ms: 0,
            source: SOURCE_RPC.to_string(),
            actor: ANONYMOUS_ACTOR.to_string(),
            metadata: serde_json::Value::Object(Default::default()),
            suspicious: false,
        }
    }

    fn seal(self, node_id: &str, prev_hash: String, now: DateTime<Utc>) -> AuditEntry {
        let mut entry = AuditEntry {
            seq: 0,
            timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
            node_id: node_id.to_string(),
            query_hash: sha256_hex(self.description.as_bytes()),
            operation_id: self.operation_id,
            action: self.action,
            resource: self.resource,
            description: self.description,
            rows_affected: self.rows_affected,
            duration_ms: self.duration_ms,
            source: self.source,
            actor: self.actor,
            metadata: self.metadata,
            prev_hash,
            entry_hash: String::new(),
            suspicious: self.suspicious,
        };
        entry.entry_hash = entry.compute_hash();
        entry
    }
}

/// SHA-256 over the canonical field order, each field prefixed by its
/// big-endian u64 byte length.
#[allow(clippy::too_many_arguments)]
pub fn entry_hash(
    timestamp: &str,
    node_id: &str,
    operation_id: &str,
    action: AuditAction,
    resource: &str,
    actor: &str,
    prev_hash: &str,
    duration_ms: u64,
) -> String {
    let duration = duration_ms.to_string();
    let fields: [&[u8]; 8] = [
        timestamp.as_bytes(),
        node_id.as_bytes(),
        operation_id.as_bytes(),
        action.as_str().as_bytes(),
        resource.as_bytes(),
        actor.as_bytes(),
        prev_hash.as_bytes(),
        duration.as_bytes(),
    ];

    let mut buf = Vec::with_capacity(fields.iter().map(|f| f.len() + 8).sum());
    for field in fields {
        buf.extend_from_slice(&(field.len() as u64).to_be_bytes());
        buf.extend_from_slice(field);
    }
    sha256(&buf).to_hex()
}

/// Storage contract for the chain.
pub trait AuditStore: Send + Sync {
    /// Append `entry` if its `prev_hash` equals the stored tail; returns the assigned seq.
    fn append(&self, entry: &AuditEntry) -> Result<u64>;
    /// `entry_hash` of the newest entry, or "" for an empty chain.
    fn last_hash(&self) -> Result<String>;
    /// Entries with `seq > after`, oldest first.
    fn list(&self, after: u64, limit: usize) -> Result<Vec<AuditEntry>>;
    fn count(&self) -> Result<u64>;
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AuditEntry>> {
        self.entries.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl AuditStore for InMemoryAuditStore {
    fn append(&self, entry: &AuditEntry) -> Result<u64> {
        let mut entries = self.lock();
        let tail = entries.last().map(|e| e.entry_hash.clone()).unwrap_or_default();
        if tail != entry.prev_hash {
            return Err(AuditError::ChainConflict {
                expected: entry.prev_hash.clone(),
                found: tail,
            });
        }
        let seq = entries.len() as u64 + 1;
        let mut stored = entry.clone();
        stored.seq = seq;
        entries.push(stored);
        Ok(seq)
    }

    fn last_hash(&self) -> Result<String> {
        Ok(self.lock().last().map(|e| e.entry_hash.clone()).unwrap_or_default())
    }

    fn list(&self, after: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        Ok(self
            .lock()
            .iter()
            .filter(|e| e.seq > after)
            .take(limit)
            .cloned()
            .collect())
    }

    fn count(&self) -> Result<u64> {
        Ok(self.lock().len() as u64)
    }
}

/// SQLite-backed chain storage
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(schema::CREATE_TABLES)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn read_tail(conn: &Connection) -> Result<String> {
    let mut stmt = conn.prepare(schema::SELECT_LAST_HASH)?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => Ok(row.get(0)?),
        None => Ok(String::new()),
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<AuditEntry> {
    let seq: i64 = row.get(0)?;
    let seq = seq.max(0) as u64;
    let action: String = row.get(4)?;
    let metadata: String = row.get(12)?;
    let rows_affected: i64 = row.get(8)?;
    let duration_ms: i64 = row.get(9)?;
    let suspicious: i64 = row.get(15)?;

    Ok(AuditEntry {
        seq,
        timestamp: row.get(1)?,
        node_id: row.get(2)?,
        operation_id: row.get(3)?,
        action: action
            .parse()
            .map_err(|reason| AuditError::Corrupt { seq, reason })?,
        resource: row.get(5)?,
        description: row.get(6)?,
        query_hash: row.get(7)?,
        rows_affected: rows_affected.max(0) as u64,
        duration_ms: duration_ms.max(0) as u64,
        source: row.get(10)?,
        actor: row.get(11)?,
        metadata: serde_json::from_str(&metadata)?,
        prev_hash: row.get(13)?,
        entry_hash: row.get(14)?,
        suspicious: suspicious != 0,
    })
}

impl AuditStore for SqliteAuditStore {
    fn append(&self, entry: &AuditEntry) -> Result<u64> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let tail = read_tail(&tx)?;
        if tail != entry.prev_hash {
            return Err(AuditError::ChainConflict {
                expected: entry.prev_hash.clone(),
                found: tail,
            });
        }

        tx.execute(
            schema::INSERT_ENTRY,
            params![
                entry.timestamp,
                entry.node_id,
                entry.operation_id,
                entry.action.as_str(),
                entry.resource,
                entry.description,
                entry.query_hash,
                entry.rows_affected as i64,
                entry.duration_ms as i64,
                entry.source,
                entry.actor,
                serde_json::to_string(&entry.metadata)?,
                entry.prev_hash,
                entry.entry_hash,
                entry.suspicious as i64,
            ],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;
        Ok(seq.max(0) as u64)
    }

    fn last_hash(&self) -> Result<String> {
        read_tail(&self.lock_conn())
    }

    fn list(&self, after: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(schema::SELECT_ENTRIES)?;
        let mut rows = stmt.query(params![after as i64, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_entry(row)?);
        }
        Ok(out)
    }

    fn count(&self) -> Result<u64> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(schema::COUNT_ENTRIES, [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

/// Outcome of re-walking the chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub valid: bool,
    pub entries_checked: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_broken_seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Incremental chain checker; feed entries in insertion order.
#[derive(Debug, Default)]
pub struct ChainVerifier {
    expected_prev: String,
    checked: u64,
    broken: Option<(u64, String)>,
}

impl ChainVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: &AuditEntry) {
        if self.broken.is_some() {
            return;
        }
        self.checked += 1;

        if entry.prev_hash != self.expected_prev {
            self.broken = Some((
                entry.seq,
                "prev_hash does not link to previous entry".to_string(),
            ));
            return;
        }
        if entry.compute_hash() != entry.entry_hash {
            self.broken = Some((entry.seq, "entry_hash does not match contents".to_string()));
            return;
        }
        if entry.query_hash != sha256_hex(entry.description.as_bytes()) {
            self.broken = Some((entry.seq, "query_hash does not match description".to_string()));
            return;
        }
        self.expected_prev = entry.entry_hash.clone();
    }

    pub fn finish(self) -> ChainReport {
        match self.broken {
            Some((seq, reason)) => ChainReport {
                valid: false,
                entries_checked: self.checked,
                first_broken_seq: Some(seq),
                reason: Some(reason),
            },
            None => ChainReport {
                valid: true,
                entries_checked: self.checked,
                first_broken_seq: None,
                reason: None,
            },
        }
    }
}

/// Check a complete chain held in memory.
pub fn verify_chain(entries: &[AuditEntry]) -> ChainReport {
    let mut verifier = ChainVerifier::new();
    for entry in entries {
        verifier.push(entry);
    }
    verifier.finish()
}

const VERIFY_PAGE: usize = 500;

/// The append side of the chain.
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    node_id: String,
    writer: Mutex<()>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>, node_id: impl Into<String>) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            writer: Mutex::new(()),
        }
    }

    /// Seal `draft` onto the tail and append it.
    pub fn log(&self, draft: AuditDraft) -> Result<AuditEntry> {
        let _writer = self.writer.lock().unwrap_or_else(|err| err.into_inner());
        let prev_hash = self.store.last_hash()?;
        let mut entry = draft.seal(&self.node_id, prev_hash, Utc::now());
        entry.seq = self.store.append(&entry)?;
        Ok(entry)
    }

    pub fn get_last_hash(&self) -> Result<String> {
        self.store.last_hash()
    }

    pub fn list(&self, after: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        self.store.list(after, limit)
    }

    pub fn count(&self) -> Result<u64> {
        self.store.count()
    }

    /// Re-walk the stored chain from the genesis entry.
    pub fn verify(&self) -> Result<ChainReport> {
        let mut verifier = ChainVerifier::new();
        let mut after = 0;
        loop {
            let page = self.store.list(after, VERIFY_PAGE)?;
            let Some(last) = page.last() else {
                break;
            };
            after = last.seq;
            for entry in &page {
                verifier.push(entry);
            }
            if page.len() < VERIFY_PAGE {
                break;
            }
        }
        Ok(verifier.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(action: AuditAction, actor: &str) -> AuditDraft {
        let mut draft = AuditDraft::new(action, "user", "/strata.v1.UserService/UpdateUserRole");
        draft.actor = actor.to_string();
        draft.duration_ms = 3;
        draft
    }

    fn exercise_log(store: Arc<dyn AuditStore>) {
        let log = AuditLog::new(store, "node-a");
        assert_eq!(log.get_last_hash().unwrap(), "");

        let first = log.log(draft(AuditAction::Update, "u1")).unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.prev_hash, "");
        assert_eq!(first.entry_hash, first.compute_hash());
        assert_eq!(log.get_last_hash().unwrap(), first.entry_hash);

        let second = log.log(draft(AuditAction::Execute, "u2")).unwrap();
        assert_eq!(second.prev_hash, first.entry_hash);

        let listed = log.list(0, 10).unwrap();
        assert_eq!(listed, vec![first.clone(), second.clone()]);
        assert_eq!(log.list(1, 10).unwrap(), vec![second]);
        assert_eq!(log.count().unwrap(), 2);

        let report = log.verify().unwrap();
        assert!(report.valid);
        assert_eq!(report.entries_checked, 2);
    }

    #[test]
    fn in_memory_chain_links() {
        exercise_log(Arc::new(InMemoryAuditStore::new()));
    }

    #[test]
    fn sqlite_chain_links() {
        exercise_log(Arc::new(SqliteAuditStore::in_memory().unwrap()));
    }

    #[test]
    fn stale_prev_hash_is_refused() {
        for store in [
            Arc::new(InMemoryAuditStore::new()) as Arc<dyn AuditStore>,
            Arc::new(SqliteAuditStore::in_memory().unwrap()),
        ] {
            let log = AuditLog::new(store.clone(), "node-a");
            log.log(draft(AuditAction::Create, "u1")).unwrap();

            let forked = draft(AuditAction::Delete, "u1").seal("node-a", String::new(), Utc::now());
            let err = store.append(&forked).unwrap_err();
            assert!(matches!(err, AuditError::ChainConflict { .. }));
            assert_eq!(store.count().unwrap(), 1);
        }
    }

    #[test]
    fn timestamp_has_fixed_layout() {
        let now = DateTime::parse_from_rfc3339("2024-03-01T12:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let entry = draft(AuditAction::Ddl, "u1").seal("n", String::new(), now);
        assert_eq!(entry.timestamp, "2024-03-01T12:00:00.500000000Z");
        assert_eq!(entry.query_hash, sha256_hex(entry.description.as_bytes()));
    }

    #[test]
    fn tampering_is_detected() {
        let log = AuditLog::new(Arc::new(InMemoryAuditStore::new()), "node-a");
        for actor in ["a", "b", "c"] {
            log.log(draft(AuditAction::Update, actor)).unwrap();
        }
        let mut entries = log.list(0, 10).unwrap();
        assert!(verify_chain(&entries).valid);

        entries[1].actor = "mallory".to_string();
        let report = verify_chain(&entries);
        assert!(!report.valid);
        assert_eq!(report.first_broken_seq, Some(2));

        let mut entries = log.list(0, 10).unwrap();
        entries.remove(1);
        let report = verify_chain(&entries);
        assert_eq!(report.first_broken_seq, Some(3));
    }

    #[test]
    fn length_prefix_prevents_field_shifting() {
        let a = entry_hash("t", "ab", "c", AuditAction::Create, "r", "x", "", 1);
        let b = entry_hash("t", "a", "bc", AuditAction::Create, "r", "x", "", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn concurrent_appends_never_fork() {
        let log = Arc::new(AuditLog::new(
            Arc::new(SqliteAuditStore::in_memory().unwrap()),
            "node-a",
        ));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        log.log(draft(AuditAction::Update, &format!("u{i}"))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let report = log.verify().unwrap();
        assert!(report.valid);
        assert_eq!(report.entries_checked, 80);
    }
}
