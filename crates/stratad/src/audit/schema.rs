//! Database schema for the audit chain

/// SQL to create the audit tables
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS audit_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    node_id TEXT NOT NULL,
    operation_id TEXT NOT NULL,
    action TEXT NOT NULL,
    resource TEXT NOT NULL,
    description TEXT NOT NULL,
    query_hash TEXT NOT NULL,
    rows_affected INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    source TEXT NOT NULL,
    actor TEXT NOT NULL,
    metadata TEXT NOT NULL,
    prev_hash TEXT NOT NULL,
    entry_hash TEXT NOT NULL UNIQUE,
    suspicious INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_entries(actor);
CREATE INDEX IF NOT EXISTS idx_audit_suspicious ON audit_entries(suspicious);

CREATE TABLE IF NOT EXISTS audit_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

INSERT OR REPLACE INTO audit_metadata (key, value) VALUES ('schema_version', '1');
"#;

/// SQL to read the chain tail
pub const SELECT_LAST_HASH: &str =
    "SELECT entry_hash FROM audit_entries ORDER BY seq DESC LIMIT 1";

/// SQL to insert an entry
pub const INSERT_ENTRY: &str = r#"
INSERT INTO audit_entries
    (timestamp, node_id, operation_id, action, resource, description, query_hash,
     rows_affected, duration_ms, source, actor, metadata, prev_hash, entry_hash, suspicious)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
"#;

/// SQL to page through entries in insertion order
pub const SELECT_ENTRIES: &str = r#"
SELECT seq, timestamp, node_id, operation_id, action, resource, description, query_hash,
       rows_affected, duration_ms, source, actor, metadata, prev_hash, entry_hash, suspicious
FROM audit_entries
WHERE seq > ?1
ORDER BY seq ASC
LIMIT ?2
"#;

/// SQL to count entries
pub const COUNT_ENTRIES: &str = "SELECT COUNT(*) FROM audit_entries";
