//! Reservation lease manager.
//!
//! Per-project named locks on opaque string keys. A row is held iff
//! `expires_at > now`; expiry is evaluated lazily at read/write time, so no
//! sweeper is needed for correctness. Acquire is a single atomic upsert that
//! overwrites expired rows and loses to live ones; only the holder may renew
//! or release a live row.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::db::{escape_like, fmt_ts, now_ts};
use crate::error::{Error, Result};
use crate::identity;

pub const RESERVATION_MIN_TTL_SECONDS: i64 = 60;

pub fn clamp_ttl(ttl_seconds: i64, max_ttl_seconds: i64) -> i64 {
    ttl_seconds.clamp(RESERVATION_MIN_TTL_SECONDS, max_ttl_seconds)
}

#[derive(Clone, Debug, Serialize)]
pub struct ReservationView {
    pub project_id: String,
    pub resource_key: String,
    pub holder_agent_id: String,
    pub holder_alias: String,
    pub acquired_at: String,
    pub expires_at: String,
    pub metadata: serde_json::Value,
}

fn decode_metadata(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw)
        .ok()
        .filter(serde_json::Value::is_object)
        .unwrap_or_else(|| serde_json::json!({}))
}

fn view_from_row(row: &sqlx::sqlite::SqliteRow) -> ReservationView {
    ReservationView {
        project_id: row.get("project_id"),
        resource_key: row.get("resource_key"),
        holder_agent_id: row.get("holder_agent_id"),
        holder_alias: row.get("holder_alias"),
        acquired_at: row.get("acquired_at"),
        expires_at: row.get("expires_at"),
        metadata: decode_metadata(row.get("metadata_json")),
    }
}

/// Acquire a lease. Fails with a holder-carrying `CONFLICT` when the key is
/// live under another agent; silently overwrites expired rows.
pub async fn acquire(
    pool: &SqlitePool,
    project_id: &str,
    agent_id: &str,
    resource_key: &str,
    ttl_seconds: i64,
    max_ttl_seconds: i64,
    metadata: &serde_json::Value,
) -> Result<ReservationView> {
    let agent = identity::get_agent_by_id(pool, project_id, agent_id)
        .await?
        .ok_or_else(|| Error::NotFound("agent not found".to_string()))?;

    let ttl = clamp_ttl(ttl_seconds, max_ttl_seconds);
    let now = chrono::Utc::now();
    let acquired_at = fmt_ts(now);
    let expires_at = fmt_ts(now + chrono::Duration::seconds(ttl));
    let metadata_json = serde_json::to_string(metadata)
        .map_err(|e| Error::InvalidArgument(format!("invalid metadata: {e}")))?;

    // Insert, or take over iff the existing row has expired. One statement,
    // so concurrent acquirers race on the row lock and exactly one wins.
    let result = sqlx::query(
        "INSERT INTO reservations
            (project_id, resource_key, holder_agent_id, holder_alias,
             acquired_at, expires_at, metadata_json)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (project_id, resource_key) DO UPDATE SET
            holder_agent_id = excluded.holder_agent_id,
            holder_alias = excluded.holder_alias,
            acquired_at = excluded.acquired_at,
            expires_at = excluded.expires_at,
            metadata_json = excluded.metadata_json
         WHERE reservations.expires_at <= excluded.acquired_at",
    )
    .bind(project_id)
    .bind(resource_key)
    .bind(agent_id)
    .bind(&agent.alias)
    .bind(&acquired_at)
    .bind(&expires_at)
    .bind(&metadata_json)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        let holder = sqlx::query(
            "SELECT holder_agent_id, holder_alias, expires_at
             FROM reservations
             WHERE project_id = ? AND resource_key = ?",
        )
        .bind(project_id)
        .bind(resource_key)
        .fetch_optional(pool)
        .await?;

        // The winner may have released in between; report a conflict only
        // with live holder data.
        if let Some(row) = holder {
            return Err(Error::ReservationHeld {
                holder_agent_id: row.get("holder_agent_id"),
                holder_alias: row.get("holder_alias"),
                expires_at: row.get("expires_at"),
            });
        }
        return Err(Error::Conflict("reservation is already held".to_string()));
    }

    Ok(ReservationView {
        project_id: project_id.to_string(),
        resource_key: resource_key.to_string(),
        holder_agent_id: agent_id.to_string(),
        holder_alias: agent.alias,
        acquired_at,
        expires_at,
        metadata: metadata.clone(),
    })
}

/// Extend a live lease held by the caller. Returns the new `expires_at`.
pub async fn renew(
    pool: &SqlitePool,
    project_id: &str,
    agent_id: &str,
    resource_key: &str,
    ttl_seconds: i64,
    max_ttl_seconds: i64,
) -> Result<String> {
    let ttl = clamp_ttl(ttl_seconds, max_ttl_seconds);
    let now = chrono::Utc::now();
    let now_str = fmt_ts(now);
    let expires_at = fmt_ts(now + chrono::Duration::seconds(ttl));

    let result = sqlx::query(
        "UPDATE reservations SET expires_at = ?
         WHERE project_id = ? AND resource_key = ?
           AND holder_agent_id = ? AND expires_at > ?",
    )
    .bind(&expires_at)
    .bind(project_id)
    .bind(resource_key)
    .bind(agent_id)
    .bind(&now_str)
    .execute(pool)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(expires_at);
    }

    // Distinguish an absent/expired row from another live holder.
    let row = sqlx::query(
        "SELECT holder_agent_id, expires_at FROM reservations
         WHERE project_id = ? AND resource_key = ?",
    )
    .bind(project_id)
    .bind(resource_key)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(r) if r.get::<String, _>("expires_at") > now_str => {
            Err(Error::Forbidden("reservation held by another agent".to_string()))
        }
        _ => Err(Error::NotFound("reservation not found".to_string())),
    }
}

/// Release a lease. Idempotent when the row is absent; expired rows may be
/// cleaned up by anyone. Returns whether a live row owned by the caller was
/// deleted.
pub async fn release(
    pool: &SqlitePool,
    project_id: &str,
    agent_id: &str,
    resource_key: &str,
) -> Result<bool> {
    let now_str = now_ts();

    let result = sqlx::query(
        "DELETE FROM reservations
         WHERE project_id = ? AND resource_key = ?
           AND holder_agent_id = ? AND expires_at > ?",
    )
    .bind(project_id)
    .bind(resource_key)
    .bind(agent_id)
    .bind(&now_str)
    .execute(pool)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(true);
    }

    let row = sqlx::query(
        "SELECT holder_agent_id, expires_at FROM reservations
         WHERE project_id = ? AND resource_key = ?",
    )
    .bind(project_id)
    .bind(resource_key)
    .fetch_optional(pool)
    .await?;

    match row {
        None => Ok(false),
        Some(r) if r.get::<String, _>("expires_at") <= now_str => {
            // Expired row: anyone may clean it up.
            sqlx::query(
                "DELETE FROM reservations
                 WHERE project_id = ? AND resource_key = ? AND expires_at <= ?",
            )
            .bind(project_id)
            .bind(resource_key)
            .bind(&now_str)
            .execute(pool)
            .await?;
            Ok(false)
        }
        Some(_) => Err(Error::Forbidden("reservation held by another agent".to_string())),
    }
}

/// Bulk-release the caller's own reservations, optionally narrowed by
/// prefix. Rejects a prefix that matches only other agents' rows.
pub async fn revoke(
    pool: &SqlitePool,
    project_id: &str,
    agent_id: &str,
    prefix: Option<&str>,
) -> Result<u64> {
    match prefix {
        Some(prefix) => {
            let pattern = format!("{}%", escape_like(prefix));
            let result = sqlx::query(
                "DELETE FROM reservations
                 WHERE project_id = ? AND holder_agent_id = ?
                   AND resource_key LIKE ? ESCAPE '\\'",
            )
            .bind(project_id)
            .bind(agent_id)
            .bind(&pattern)
            .execute(pool)
            .await?;

            if result.rows_affected() == 0 {
                let held_by_others = sqlx::query(
                    "SELECT 1 FROM reservations
                     WHERE project_id = ? AND resource_key LIKE ? ESCAPE '\\'
                     LIMIT 1",
                )
                .bind(project_id)
                .bind(&pattern)
                .fetch_optional(pool)
                .await?;
                if held_by_others.is_some() {
                    return Err(Error::Forbidden(
                        "cannot revoke reservations held by other agents".to_string(),
                    ));
                }
            }
            Ok(result.rows_affected())
        }
        None => {
            let result = sqlx::query(
                "DELETE FROM reservations WHERE project_id = ? AND holder_agent_id = ?",
            )
            .bind(project_id)
            .bind(agent_id)
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        }
    }
}

/// Live reservations of a project, optionally filtered by key prefix.
pub async fn list(
    pool: &SqlitePool,
    project_id: &str,
    prefix: Option<&str>,
) -> Result<Vec<ReservationView>> {
    let now_str = now_ts();

    let rows = match prefix {
        Some(prefix) => {
            let pattern = format!("{}%", escape_like(prefix));
            sqlx::query(
                "SELECT project_id, resource_key, holder_agent_id, holder_alias,
                        acquired_at, expires_at, metadata_json
                 FROM reservations
                 WHERE project_id = ? AND expires_at > ?
                   AND resource_key LIKE ? ESCAPE '\\'
                 ORDER BY resource_key ASC",
            )
            .bind(project_id)
            .bind(&now_str)
            .bind(&pattern)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT project_id, resource_key, holder_agent_id, holder_alias,
                        acquired_at, expires_at, metadata_json
                 FROM reservations
                 WHERE project_id = ? AND expires_at > ?
                 ORDER BY resource_key ASC",
            )
            .bind(project_id)
            .bind(&now_str)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(rows.iter().map(view_from_row).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_clamps_to_floor_and_ceiling() {
        assert_eq!(clamp_ttl(1, 86_400), RESERVATION_MIN_TTL_SECONDS);
        assert_eq!(clamp_ttl(3600, 86_400), 3600);
        assert_eq!(clamp_ttl(1_000_000, 86_400), 86_400);
    }

    #[test]
    fn metadata_decoding_tolerates_garbage() {
        assert_eq!(decode_metadata("{\"k\":1}"), serde_json::json!({"k": 1}));
        assert_eq!(decode_metadata("not json"), serde_json::json!({}));
        assert_eq!(decode_metadata("[1,2]"), serde_json::json!({}));
    }
}
