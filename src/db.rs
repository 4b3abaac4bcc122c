//! SQLite pool initialization and schema.
//!
//! All ids are hyphenated UUID text. Timestamps are stored as fixed-width
//! RFC 3339 UTC text (microsecond precision, `Z` suffix) so that SQL string
//! comparison agrees with chronological order.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

/// Format a timestamp for storage and API responses.
pub fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time in storage format.
pub fn now_ts() -> String {
    fmt_ts(Utc::now())
}

/// Parse a stored or client-supplied RFC 3339 timestamp.
pub fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub async fn init_pool(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = if database_url.starts_with("sqlite:") {
        SqliteConnectOptions::from_str(database_url)?
    } else {
        SqliteConnectOptions::new().filename(database_url)
    }
    .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;
    info!("database initialized at {}", database_url);
    Ok(pool)
}

/// Create all tables and indexes. Idempotent.
pub async fn init_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS projects (
            project_id TEXT PRIMARY KEY NOT NULL,
            slug TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            tenant_id TEXT,
            created_at TEXT NOT NULL,
            deleted_at TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_slug
         ON projects (slug) WHERE deleted_at IS NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS agents (
            agent_id TEXT PRIMARY KEY NOT NULL,
            project_id TEXT NOT NULL,
            alias TEXT NOT NULL,
            human_name TEXT NOT NULL DEFAULT '',
            agent_type TEXT NOT NULL DEFAULT 'agent',
            access_mode TEXT NOT NULL DEFAULT 'open',
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL,
            deleted_at TEXT,
            FOREIGN KEY (project_id) REFERENCES projects (project_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_agents_project_alias
         ON agents (project_id, alias) WHERE deleted_at IS NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS api_keys (
            api_key_id TEXT PRIMARY KEY NOT NULL,
            project_id TEXT NOT NULL,
            agent_id TEXT,
            key_prefix TEXT NOT NULL DEFAULT '',
            key_hash TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            last_used_at TEXT,
            FOREIGN KEY (project_id) REFERENCES projects (project_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_keys_hash ON api_keys (key_hash)")
        .execute(pool)
        .await?;

    // One active key per agent; re-init rotates by deactivating the old one.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_api_keys_active_agent
         ON api_keys (agent_id) WHERE is_active = 1 AND agent_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS contacts (
            contact_id TEXT PRIMARY KEY NOT NULL,
            project_id TEXT NOT NULL,
            contact_address TEXT NOT NULL,
            label TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (project_id, contact_address),
            FOREIGN KEY (project_id) REFERENCES projects (project_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS messages (
            message_id TEXT PRIMARY KEY NOT NULL,
            project_id TEXT NOT NULL,
            from_agent_id TEXT NOT NULL,
            to_agent_id TEXT NOT NULL,
            from_alias TEXT NOT NULL,
            subject TEXT NOT NULL DEFAULT '',
            body TEXT NOT NULL,
            priority TEXT NOT NULL DEFAULT 'normal',
            thread_id TEXT,
            from_did TEXT,
            to_did TEXT,
            signature TEXT,
            signing_key_id TEXT,
            created_at TEXT NOT NULL,
            read_at TEXT,
            FOREIGN KEY (project_id) REFERENCES projects (project_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_inbox
         ON messages (project_id, to_agent_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS chat_sessions (
            session_id TEXT PRIMARY KEY NOT NULL,
            project_id TEXT NOT NULL,
            participant_hash TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (project_id, participant_hash),
            FOREIGN KEY (project_id) REFERENCES projects (project_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS chat_session_participants (
            session_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            alias TEXT NOT NULL,
            joined_at TEXT NOT NULL,
            PRIMARY KEY (session_id, agent_id),
            FOREIGN KEY (session_id) REFERENCES chat_sessions (session_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS chat_messages (
            message_id TEXT PRIMARY KEY NOT NULL,
            session_id TEXT NOT NULL,
            from_agent_id TEXT NOT NULL,
            from_alias TEXT NOT NULL,
            body TEXT NOT NULL,
            sender_leaving INTEGER NOT NULL DEFAULT 0,
            hang_on INTEGER NOT NULL DEFAULT 0,
            from_did TEXT,
            to_did TEXT,
            signature TEXT,
            signing_key_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (session_id) REFERENCES chat_sessions (session_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chat_messages_session
         ON chat_messages (session_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS chat_read_receipts (
            session_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            last_read_message_id TEXT,
            last_read_at TEXT,
            PRIMARY KEY (session_id, agent_id),
            FOREIGN KEY (session_id) REFERENCES chat_sessions (session_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS reservations (
            project_id TEXT NOT NULL,
            resource_key TEXT NOT NULL,
            holder_agent_id TEXT NOT NULL,
            holder_alias TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (project_id, resource_key),
            FOREIGN KEY (project_id) REFERENCES projects (project_id)
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Escape a string for use in a SQL LIKE pattern with `ESCAPE '\'`.
pub fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_are_fixed_width_and_ordered() {
        let a = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        let c = a + chrono::Duration::seconds(1);

        let (fa, fb, fc) = (fmt_ts(a), fmt_ts(b), fmt_ts(c));
        assert_eq!(fa.len(), fb.len());
        assert_eq!(fa.len(), fc.len());
        assert!(fa < fb && fb < fc);
        assert!(fa.ends_with('Z'));
    }

    #[test]
    fn parse_round_trips() {
        let now = Utc::now();
        let parsed = parse_ts(&fmt_ts(now)).unwrap();
        assert_eq!(fmt_ts(now), fmt_ts(parsed));
    }

    #[test]
    fn like_escaping_covers_wildcards() {
        assert_eq!(escape_like("a%b_c"), "a\\%b\\_c");
        assert_eq!(escape_like("back\\slash"), "back\\\\slash");
        assert_eq!(escape_like("plain"), "plain");
    }
}
