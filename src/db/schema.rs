/// Ordered schema migrations. Entry `i` upgrades `user_version` i to i + 1.
pub const MIGRATIONS: &[&str] = &[V1, V2];

const V1: &str = r#"
-- Writes that could not be delivered yet, replayed in id order
CREATE TABLE IF NOT EXISTS pending_writes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    context TEXT,
    created_at INTEGER NOT NULL
);

-- Background-refreshed snapshots, one row per logical key
CREATE TABLE IF NOT EXISTS cached_data (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cached_data_timestamp ON cached_data(timestamp);

-- Versioned response cache buckets
CREATE TABLE IF NOT EXISTS cache_buckets (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    bucket TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    response_type TEXT NOT NULL,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (bucket, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_bucket ON cache_entries(bucket);
"#;

const V2: &str = r#"
-- Replay bookkeeping for bounded retries
ALTER TABLE pending_writes ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;
ALTER TABLE pending_writes ADD COLUMN last_error TEXT;

CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY,
    payload TEXT NOT NULL,
    context TEXT,
    created_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL,
    last_error TEXT,
    dead_lettered_at INTEGER NOT NULL
);
"#;
