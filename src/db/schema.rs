//! SQL DDL for initializing the database schema.
//! SQLite-first design; can be adapted for other RDBMS.

/// SQLite schema includes:
/// - `calendar_credentials` (one row per user: tokens, sync cursor, managed calendar)
/// - `sync_links` (one row per synced item)
/// - `watch_channels` (registered push-notification channels)
/// - `appointments` / `bills` (host item tables read and updated by the engine)
pub const SQLITE_INIT: &str = r#"
-- ---------------------------------------------------------------------------
-- Calendar connection per user
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS calendar_credentials (
    user_id TEXT PRIMARY KEY NOT NULL,
    access_token TEXT NULL,
    refresh_token TEXT NOT NULL,
    scope TEXT NULL,
    expires_at TEXT NULL, -- RFC3339
    account_email TEXT NULL,
    calendar_id TEXT NULL,
    sync_token TEXT NULL,
    last_pulled_at TEXT NULL, -- RFC3339
    managed_calendar_id TEXT NULL,
    managed_calendar_summary TEXT NULL,
    managed_calendar_state TEXT NOT NULL DEFAULT 'unprovisioned',
    managed_calendar_verified_at TEXT NULL, -- RFC3339
    managed_calendar_acl_role TEXT NULL,
    managed_calendar_acl_verified_at TEXT NULL, -- RFC3339
    legacy_calendar_id TEXT NULL,
    needs_reauth INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL, -- RFC3339
    updated_at TEXT NOT NULL -- RFC3339
);

-- ---------------------------------------------------------------------------
-- Item <-> event links
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_links (
    item_id TEXT PRIMARY KEY NOT NULL,
    item_kind TEXT NOT NULL,
    user_id TEXT NOT NULL,
    calendar_id TEXT NULL,
    event_id TEXT NULL,
    etag TEXT NULL,
    last_synced_at TEXT NULL, -- RFC3339
    last_sync_direction TEXT NULL,
    local_hash TEXT NULL,
    remote_updated_at TEXT NULL, -- RFC3339
    sync_status TEXT NOT NULL DEFAULT 'idle',
    last_error TEXT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_links_user ON sync_links(user_id);
CREATE INDEX IF NOT EXISTS idx_sync_links_event ON sync_links(user_id, event_id);

-- ---------------------------------------------------------------------------
-- Push-notification channels
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS watch_channels (
    channel_id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    calendar_id TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    resource_uri TEXT NULL,
    expiration TEXT NULL, -- RFC3339
    channel_token TEXT NOT NULL,
    created_at TEXT NOT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_watch_channels_user ON watch_channels(user_id);

-- ---------------------------------------------------------------------------
-- Host items
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS appointments (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    starts_at TEXT NOT NULL, -- RFC3339
    ends_at TEXT NOT NULL, -- RFC3339
    location TEXT NULL,
    notes TEXT NULL,
    status TEXT NOT NULL DEFAULT 'scheduled',
    updated_at TEXT NOT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_appointments_user ON appointments(user_id);

CREATE TABLE IF NOT EXISTS bills (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    amount_cents INTEGER NOT NULL,
    currency TEXT NOT NULL,
    due_date TEXT NOT NULL, -- YYYY-MM-DD
    status TEXT NOT NULL DEFAULT 'pending',
    updated_at TEXT NOT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_bills_user ON bills(user_id);
"#;
