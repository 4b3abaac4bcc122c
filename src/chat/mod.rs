//! Chat session engine.
//!
//! Sessions are persistent multi-party conversations, unique per
//! `(project, participant set)`. The hard guarantees live here: create is
//! idempotent on the canonical participant set, messages are totally ordered
//! by `(created_at, message_id)`, read receipts advance monotonically, and
//! every committed write publishes exactly one bus event after the commit.

pub mod stream;
pub mod wait;

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::bus::Event;
use crate::config::AppState;
use crate::db::now_ts;
use crate::error::{Error, Result};
use crate::identity::{self, contacts, validate_agent_alias, AgentRow};
use crate::mail;
use crate::models::SignatureFields;

/// Canonical digest of a participant set: sorted, deduped aliases joined
/// with `,`, hashed with SHA-256. Only used for uniqueness in the store.
pub fn participant_hash(aliases: &[String]) -> String {
    let mut normalized: Vec<&str> = aliases.iter().map(|a| a.as_str()).collect();
    normalized.sort_unstable();
    normalized.dedup();
    format!("{:x}", Sha256::digest(normalized.join(",").as_bytes()))
}

#[derive(Clone, Debug, Serialize)]
pub struct Participant {
    pub agent_id: String,
    pub alias: String,
}

#[derive(Clone, Debug)]
pub struct ChatMessageView {
    pub message_id: String,
    pub from_agent: String,
    pub from_agent_id: String,
    pub body: String,
    pub sender_leaving: bool,
    pub hang_on: bool,
    pub timestamp: String,
    pub signatures: SignatureFields,
}

#[derive(Clone, Debug)]
pub struct SessionView {
    pub session_id: String,
    pub participants: Vec<String>,
    pub created_at: String,
}

#[derive(Clone, Debug)]
pub struct PendingRow {
    pub session_id: String,
    pub participants: Vec<String>,
    pub last_message: String,
    pub last_from: String,
    pub unread_count: i64,
    pub last_activity: String,
    pub sender_waiting: bool,
    pub time_remaining_seconds: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct CreateSessionOutcome {
    pub session_id: String,
    pub message_id: String,
    pub created_at: String,
    pub participants: Vec<Participant>,
    pub targets_connected: Vec<String>,
    pub targets_left: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct SendOutcome {
    pub message_id: String,
    pub created_at: String,
    pub extends_wait_seconds: i64,
}

#[derive(Clone, Debug)]
pub struct MarkReadOutcome {
    pub messages_marked: i64,
    pub wait_extended_seconds: i64,
}

/// Whether a session exists within the given project.
pub async fn session_in_project(
    pool: &SqlitePool,
    session_id: &str,
    project_id: &str,
) -> Result<bool> {
    let row = sqlx::query("SELECT 1 FROM chat_sessions WHERE session_id = ? AND project_id = ?")
        .bind(session_id)
        .bind(project_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// The caller's canonical alias in a session, or `None` if not a participant.
pub async fn participant_alias(
    pool: &SqlitePool,
    session_id: &str,
    agent_id: &str,
) -> Result<Option<String>> {
    let row = sqlx::query(
        "SELECT alias FROM chat_session_participants WHERE session_id = ? AND agent_id = ?",
    )
    .bind(session_id)
    .bind(agent_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get("alias")))
}

/// Participants of a session, ordered by alias.
pub async fn participants(pool: &SqlitePool, session_id: &str) -> Result<Vec<Participant>> {
    let rows = sqlx::query(
        "SELECT agent_id, alias FROM chat_session_participants
         WHERE session_id = ?
         ORDER BY alias ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| Participant {
            agent_id: r.get("agent_id"),
            alias: r.get("alias"),
        })
        .collect())
}

/// Find or create the session for a canonical participant set. Idempotent:
/// the same set always yields the same session, with no duplicate
/// participant rows.
async fn ensure_session(
    pool: &SqlitePool,
    project_id: &str,
    agent_rows: &[AgentRow],
) -> Result<String> {
    let aliases: Vec<String> = agent_rows.iter().map(|a| a.alias.clone()).collect();
    let p_hash = participant_hash(&aliases);

    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO chat_sessions (session_id, project_id, participant_hash, created_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (project_id, participant_hash) DO NOTHING",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(project_id)
    .bind(&p_hash)
    .bind(now_ts())
    .execute(&mut *tx)
    .await?;

    let session_id: String = sqlx::query(
        "SELECT session_id FROM chat_sessions
         WHERE project_id = ? AND participant_hash = ?",
    )
    .bind(project_id)
    .bind(&p_hash)
    .fetch_one(&mut *tx)
    .await?
    .get("session_id");

    for agent in agent_rows {
        sqlx::query(
            "INSERT INTO chat_session_participants (session_id, agent_id, alias, joined_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (session_id, agent_id) DO UPDATE SET alias = excluded.alias",
        )
        .bind(&session_id)
        .bind(&agent.agent_id)
        .bind(&agent.alias)
        .bind(now_ts())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(session_id)
}

struct AppendedMessage {
    message_id: String,
    created_at: String,
}

/// Append a message and advance the sender's own read receipt (sending
/// implies having read up to this point).
async fn append_message(
    pool: &SqlitePool,
    session_id: &str,
    from_agent_id: &str,
    from_alias: &str,
    body: &str,
    sender_leaving: bool,
    hang_on: bool,
    signatures: &SignatureFields,
) -> Result<AppendedMessage> {
    let message_id = Uuid::new_v4().to_string();
    let created_at = now_ts();

    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO chat_messages
            (message_id, session_id, from_agent_id, from_alias, body, sender_leaving, hang_on,
             from_did, to_did, signature, signing_key_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&message_id)
    .bind(session_id)
    .bind(from_agent_id)
    .bind(from_alias)
    .bind(body)
    .bind(sender_leaving)
    .bind(hang_on)
    .bind(&signatures.from_did)
    .bind(&signatures.to_did)
    .bind(&signatures.signature)
    .bind(&signatures.signing_key_id)
    .bind(&created_at)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO chat_read_receipts (session_id, agent_id, last_read_message_id, last_read_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (session_id, agent_id) DO UPDATE SET
            last_read_message_id = excluded.last_read_message_id,
            last_read_at = excluded.last_read_at",
    )
    .bind(session_id)
    .bind(from_agent_id)
    .bind(&message_id)
    .bind(&created_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(AppendedMessage {
        message_id,
        created_at,
    })
}

fn message_event(
    state: &AppState,
    session_id: &str,
    msg: &AppendedMessage,
    from_alias: &str,
    from_agent_id: &str,
    body: &str,
    sender_leaving: bool,
    hang_on: bool,
    signatures: &SignatureFields,
) -> Event {
    Event::Message {
        session_id: session_id.to_string(),
        message_id: msg.message_id.clone(),
        from_agent: from_alias.to_string(),
        from_agent_id: from_agent_id.to_string(),
        body: body.to_string(),
        sender_leaving,
        hang_on,
        extends_wait_seconds: if hang_on {
            state.settings.hang_on_extension_seconds
        } else {
            0
        },
        timestamp: msg.created_at.clone(),
        from_did: signatures.from_did.clone(),
        to_did: signatures.to_did.clone(),
        signature: signatures.signature.clone(),
        signing_key_id: signatures.signing_key_id.clone(),
    }
}

/// Aliases among `targets` whose most recent message in the session said
/// they were leaving, or whose agent status is no longer active.
async fn targets_left(
    pool: &SqlitePool,
    session_id: &str,
    targets: &[AgentRow],
) -> Result<Vec<String>> {
    let mut left = Vec::new();
    for target in targets {
        if target.status != "active" {
            left.push(target.alias.clone());
            continue;
        }
        let row = sqlx::query(
            "SELECT sender_leaving FROM chat_messages
             WHERE session_id = ? AND from_agent_id = ?
             ORDER BY created_at DESC, message_id DESC
             LIMIT 1",
        )
        .bind(session_id)
        .bind(&target.agent_id)
        .fetch_optional(pool)
        .await?;
        if row.is_some_and(|r| r.get::<bool, _>("sender_leaving")) {
            left.push(target.alias.clone());
        }
    }
    Ok(left)
}

/// Create (or reuse) the session for `sender ∪ to_aliases` and append the
/// first message.
pub async fn create_session(
    state: &AppState,
    project_id: &str,
    agent_id: &str,
    to_aliases: &[String],
    message: &str,
    leaving: bool,
    signatures: &SignatureFields,
) -> Result<CreateSessionOutcome> {
    let pool = &state.pool;

    let sender = identity::get_agent_by_id(pool, project_id, agent_id)
        .await?
        .ok_or_else(|| Error::NotFound("agent not found".to_string()))?;

    let mut cleaned: Vec<String> = Vec::new();
    for alias in to_aliases {
        let alias = alias.trim();
        if alias.is_empty() {
            continue;
        }
        cleaned.push(validate_agent_alias(alias)?);
    }
    if cleaned.is_empty() {
        return Err(Error::InvalidArgument("to_aliases must not be empty".to_string()));
    }
    if cleaned.iter().any(|a| a == &sender.alias) {
        return Err(Error::InvalidArgument("self-chat is not supported".to_string()));
    }

    let mut targets: Vec<AgentRow> = Vec::new();
    for alias in &cleaned {
        let agent = identity::get_agent_by_alias(pool, project_id, alias)
            .await?
            .ok_or_else(|| Error::NotFound("agent not found".to_string()))?;
        if !targets.iter().any(|t| t.agent_id == agent.agent_id) {
            targets.push(agent);
        }
    }

    // Contacts-only targets must have allowlisted the sender.
    let project = identity::get_project(pool, project_id)
        .await?
        .ok_or_else(|| Error::NotFound("project not found".to_string()))?;
    let sender_address = format!("{}/{}", project.slug, sender.alias);
    for target in &targets {
        if !contacts::check_access(pool, target, &sender_address).await? {
            return Err(Error::Forbidden(
                "recipient accepts messages from contacts only".to_string(),
            ));
        }
    }

    let mut agent_rows = vec![sender.clone()];
    agent_rows.extend(targets.iter().cloned());
    if agent_rows.len() < 2 {
        return Err(Error::InvalidArgument(
            "a session needs at least two distinct participants".to_string(),
        ));
    }

    let session_id = ensure_session(pool, project_id, &agent_rows).await?;

    // Hold the session's write-ordering lock across commit and publish so
    // subscribers see messages in commit order.
    let write_guard = state.bus.write_lock(&session_id).await;
    let msg = append_message(
        pool,
        &session_id,
        agent_id,
        &sender.alias,
        message,
        leaving,
        false,
        signatures,
    )
    .await?;

    let participants = participants(pool, &session_id).await?;
    let left = targets_left(pool, &session_id, &targets).await?;

    let target_ids: Vec<String> = targets.iter().map(|t| t.agent_id.clone()).collect();
    let online = state.presence.online_agents(project_id, &target_ids).await;
    let targets_connected: Vec<String> = targets
        .iter()
        .filter(|t| online.contains(&t.agent_id))
        .map(|t| t.alias.clone())
        .collect();

    state
        .bus
        .publish(
            &session_id,
            message_event(
                state, &session_id, &msg, &sender.alias, agent_id, message, leaving, false,
                signatures,
            ),
        )
        .await;
    drop(write_guard);

    Ok(CreateSessionOutcome {
        session_id,
        message_id: msg.message_id,
        created_at: msg.created_at,
        participants,
        targets_connected,
        targets_left: left,
    })
}

/// Send a message in an existing session. The canonical alias comes from the
/// participants table, not the request, so a sender cannot spoof it.
pub async fn send_message(
    state: &AppState,
    project_id: &str,
    agent_id: &str,
    session_id: &str,
    body: &str,
    hang_on: bool,
    signatures: &SignatureFields,
) -> Result<SendOutcome> {
    let pool = &state.pool;

    if !session_in_project(pool, session_id, project_id).await? {
        return Err(Error::NotFound("session not found".to_string()));
    }
    let alias = participant_alias(pool, session_id, agent_id)
        .await?
        .ok_or_else(|| Error::Forbidden("not a participant in this session".to_string()))?;

    // sender_leaving is only set via session creation with leaving=true.
    let write_guard = state.bus.write_lock(session_id).await;
    let msg = append_message(pool, session_id, agent_id, &alias, body, false, hang_on, signatures)
        .await?;

    state
        .bus
        .publish(
            session_id,
            message_event(state, session_id, &msg, &alias, agent_id, body, false, hang_on, signatures),
        )
        .await;
    drop(write_guard);

    Ok(SendOutcome {
        message_id: msg.message_id,
        created_at: msg.created_at,
        extends_wait_seconds: if hang_on {
            state.settings.hang_on_extension_seconds
        } else {
            0
        },
    })
}

/// Messages of a session in ascending order, bounded to the latest `limit`.
/// `unread_only` keeps other senders' messages newer than the caller's
/// `last_read_at`.
pub async fn history(
    pool: &SqlitePool,
    project_id: &str,
    session_id: &str,
    agent_id: &str,
    unread_only: bool,
    limit: i64,
) -> Result<Vec<ChatMessageView>> {
    if !session_in_project(pool, session_id, project_id).await? {
        return Err(Error::NotFound("session not found".to_string()));
    }
    if participant_alias(pool, session_id, agent_id).await?.is_none() {
        return Err(Error::Forbidden("not a participant in this session".to_string()));
    }

    let last_read_at: Option<String> = sqlx::query(
        "SELECT last_read_at FROM chat_read_receipts WHERE session_id = ? AND agent_id = ?",
    )
    .bind(session_id)
    .bind(agent_id)
    .fetch_optional(pool)
    .await?
    .and_then(|r| r.get("last_read_at"));

    let rows = sqlx::query(
        "SELECT message_id, from_agent_id, from_alias, body, sender_leaving, hang_on,
                from_did, to_did, signature, signing_key_id, created_at
         FROM chat_messages
         WHERE session_id = ?
           AND (? = 0 OR (created_at > COALESCE(?, '') AND from_agent_id <> ?))
         ORDER BY created_at DESC, message_id DESC
         LIMIT ?",
    )
    .bind(session_id)
    .bind(unread_only)
    .bind(&last_read_at)
    .bind(agent_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut messages: Vec<ChatMessageView> = rows
        .iter()
        .map(|r| ChatMessageView {
            message_id: r.get("message_id"),
            from_agent: r.get("from_alias"),
            from_agent_id: r.get("from_agent_id"),
            body: r.get("body"),
            sender_leaving: r.get("sender_leaving"),
            hang_on: r.get("hang_on"),
            timestamp: r.get("created_at"),
            signatures: SignatureFields {
                from_did: r.get("from_did"),
                to_did: r.get("to_did"),
                signature: r.get("signature"),
                signing_key_id: r.get("signing_key_id"),
            },
        })
        .collect();
    messages.reverse();
    Ok(messages)
}

/// Advance the caller's read receipt up to a message. Monotone: rolling back
/// to an older message leaves the receipt unchanged and marks nothing.
pub async fn mark_read(
    state: &AppState,
    project_id: &str,
    session_id: &str,
    agent_id: &str,
    up_to_message_id: &str,
) -> Result<MarkReadOutcome> {
    let pool = &state.pool;

    if Uuid::parse_str(up_to_message_id).is_err() {
        return Err(Error::InvalidArgument("invalid up_to_message_id format".to_string()));
    }
    if !session_in_project(pool, session_id, project_id).await? {
        return Err(Error::NotFound("session not found".to_string()));
    }
    let reader_alias = participant_alias(pool, session_id, agent_id)
        .await?
        .ok_or_else(|| Error::Forbidden("not a participant in this session".to_string()))?;

    let up_to_time: String = sqlx::query(
        "SELECT created_at FROM chat_messages WHERE session_id = ? AND message_id = ?",
    )
    .bind(session_id)
    .bind(up_to_message_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound("message not found".to_string()))?
    .get("created_at");

    let old_last: Option<String> = sqlx::query(
        "SELECT last_read_at FROM chat_read_receipts WHERE session_id = ? AND agent_id = ?",
    )
    .bind(session_id)
    .bind(agent_id)
    .fetch_optional(pool)
    .await?
    .and_then(|r| r.get("last_read_at"));

    let marked: i64 = sqlx::query(
        "SELECT COUNT(*) AS cnt FROM chat_messages
         WHERE session_id = ?
           AND from_agent_id <> ?
           AND created_at > COALESCE(?, '')
           AND created_at <= ?",
    )
    .bind(session_id)
    .bind(agent_id)
    .bind(&old_last)
    .bind(&up_to_time)
    .fetch_one(pool)
    .await?
    .get("cnt");

    // Advance only when the target message is newer than the one currently
    // stored. Compares message creation times, not wall-clock read times.
    let read_time = now_ts();
    let write_guard = state.bus.write_lock(session_id).await;
    let advanced = sqlx::query(
        "INSERT INTO chat_read_receipts (session_id, agent_id, last_read_message_id, last_read_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (session_id, agent_id) DO UPDATE SET
            last_read_message_id = excluded.last_read_message_id,
            last_read_at = excluded.last_read_at
         WHERE ? > COALESCE(
            (SELECT created_at FROM chat_messages
             WHERE message_id = chat_read_receipts.last_read_message_id),
            '')",
    )
    .bind(session_id)
    .bind(agent_id)
    .bind(up_to_message_id)
    .bind(&read_time)
    .bind(&up_to_time)
    .execute(pool)
    .await?
    .rows_affected()
        == 1;

    if !advanced {
        drop(write_guard);
        return Ok(MarkReadOutcome {
            messages_marked: 0,
            wait_extended_seconds: 0,
        });
    }

    let wait_extended_seconds = if state.waiters.has_other_waiter(session_id, agent_id) {
        state.settings.hang_on_extension_seconds
    } else {
        0
    };

    state
        .bus
        .publish(
            session_id,
            Event::ReadReceipt {
                session_id: session_id.to_string(),
                reader_alias,
                reader_agent_id: agent_id.to_string(),
                up_to_message_id: up_to_message_id.to_string(),
                extends_wait_seconds: state.settings.hang_on_extension_seconds,
                timestamp: read_time,
            },
        )
        .await;
    drop(write_guard);

    Ok(MarkReadOutcome {
        messages_marked: marked,
        wait_extended_seconds,
    })
}

/// One row per session the caller participates in, newest activity first,
/// plus the caller's unread-mail count.
pub async fn pending(
    state: &AppState,
    project_id: &str,
    agent_id: &str,
) -> Result<(Vec<PendingRow>, i64)> {
    let pool = &state.pool;

    let sessions = sqlx::query(
        "SELECT s.session_id, s.created_at
         FROM chat_sessions s
         JOIN chat_session_participants p
           ON p.session_id = s.session_id AND p.agent_id = ?
         WHERE s.project_id = ?",
    )
    .bind(agent_id)
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    let mut rows = Vec::with_capacity(sessions.len());
    for session in &sessions {
        let session_id: String = session.get("session_id");
        let session_created_at: String = session.get("created_at");

        let parts = participants(pool, &session_id).await?;

        let last = sqlx::query(
            "SELECT body, from_alias, from_agent_id, created_at
             FROM chat_messages
             WHERE session_id = ?
             ORDER BY created_at DESC, message_id DESC
             LIMIT 1",
        )
        .bind(&session_id)
        .fetch_optional(pool)
        .await?;

        let unread: i64 = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM chat_messages m
             WHERE m.session_id = ?
               AND m.from_agent_id <> ?
               AND m.created_at > COALESCE(
                  (SELECT last_read_at FROM chat_read_receipts
                   WHERE session_id = m.session_id AND agent_id = ?),
                  '')",
        )
        .bind(&session_id)
        .bind(agent_id)
        .bind(agent_id)
        .fetch_one(pool)
        .await?
        .get("cnt");

        let (last_message, last_from, last_from_id, last_activity) = match &last {
            Some(r) => (
                r.get::<String, _>("body"),
                r.get::<String, _>("from_alias"),
                r.get::<String, _>("from_agent_id"),
                r.get::<String, _>("created_at"),
            ),
            None => (String::new(), String::new(), String::new(), session_created_at),
        };

        // A sender is "waiting" when the latest message is theirs and they
        // hold a live waiter registration on this session.
        let waiter = if !last_from_id.is_empty() && last_from_id != agent_id {
            state.waiters.get(&session_id, &last_from_id)
        } else {
            None
        };
        let (sender_waiting, time_remaining_seconds) = match waiter {
            Some(slot) if slot.remaining_seconds() > 0 => {
                (true, Some(slot.remaining_seconds()))
            }
            _ => (false, None),
        };

        rows.push(PendingRow {
            session_id,
            participants: parts.into_iter().map(|p| p.alias).collect(),
            last_message,
            last_from,
            unread_count: unread,
            last_activity,
            sender_waiting,
            time_remaining_seconds,
        });
    }

    rows.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));

    let mail_unread = mail::unread_count(pool, project_id, agent_id).await?;
    Ok((rows, mail_unread))
}

/// Sessions the caller participates in, newest first.
pub async fn list_sessions(
    pool: &SqlitePool,
    project_id: &str,
    agent_id: &str,
) -> Result<Vec<SessionView>> {
    let sessions = sqlx::query(
        "SELECT s.session_id, s.created_at
         FROM chat_sessions s
         JOIN chat_session_participants p
           ON p.session_id = s.session_id AND p.agent_id = ?
         WHERE s.project_id = ?
         ORDER BY s.created_at DESC",
    )
    .bind(agent_id)
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    let mut views = Vec::with_capacity(sessions.len());
    for session in &sessions {
        let session_id: String = session.get("session_id");
        let parts = participants(pool, &session_id).await?;
        views.push(SessionView {
            session_id,
            participants: parts.into_iter().map(|p| p.alias).collect(),
            created_at: session.get("created_at"),
        });
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_hash_is_order_and_duplicate_insensitive() {
        let a = participant_hash(&["alice".to_string(), "bob".to_string()]);
        let b = participant_hash(&["bob".to_string(), "alice".to_string()]);
        let c = participant_hash(&["bob".to_string(), "alice".to_string(), "alice".to_string()]);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.len(), 64);

        let other = participant_hash(&["alice".to_string(), "carol".to_string()]);
        assert_ne!(a, other);
    }

    #[test]
    fn participant_hash_is_case_sensitive() {
        let lower = participant_hash(&["alice".to_string()]);
        let upper = participant_hash(&["Alice".to_string()]);
        assert_ne!(lower, upper);
    }
}
