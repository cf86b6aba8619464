//! SQLite schema for the offline store.

/// Entity documents, mutation queue, offline credentials and sync metadata.
pub const SCHEMA: &str = r#"
-- Every entity table (projects, subprojects, ...) lives here as JSON documents
CREATE TABLE IF NOT EXISTS records (
    table_name TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 1,
    local_updated_at TEXT NOT NULL,
    PRIMARY KEY (table_name, id)
);

CREATE INDEX IF NOT EXISTS idx_records_synced
    ON records(table_name, synced);

-- Pending writes, drained in seq order
CREATE TABLE IF NOT EXISTS pending_mutations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    last_error TEXT,
    next_attempt_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_mutations_entity
    ON pending_mutations(entity_type, entity_id);

-- One entry per email, overwritten on every online login
CREATE TABLE IF NOT EXISTS auth_cache (
    email TEXT PRIMARY KEY,
    password_hash TEXT NOT NULL,
    salt TEXT NOT NULL,
    token TEXT NOT NULL,
    user_data TEXT NOT NULL,
    last_login_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
