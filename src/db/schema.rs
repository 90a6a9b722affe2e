//! SQL DDL for initializing the credential storage.
//! SQLite-first design; can be adapted for other RDBMS.

/// SQLite schema with:
/// - `id` INTEGER PRIMARY KEY AUTOINCREMENT
/// - one row per authorization; rows are deactivated, never deleted
/// - timestamps as fixed-width RFC3339 UTC text, so text order is time order
/// - partial UNIQUE index allowing a single active row per (user_id, provider)
pub const SQLITE_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    provider TEXT NOT NULL, -- gmail | airtable
    provider_identity TEXT NOT NULL,
    access_token TEXT NOT NULL,
    refresh_token TEXT NOT NULL,
    expires_at TEXT NOT NULL, -- RFC3339
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL, -- RFC3339
    updated_at TEXT NOT NULL -- RFC3339
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_credentials_active_slot
    ON credentials(user_id, provider) WHERE is_active = 1;

CREATE INDEX IF NOT EXISTS idx_credentials_user ON credentials(user_id, provider)
"#;
