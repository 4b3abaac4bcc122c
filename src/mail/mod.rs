//! Mail store: asynchronous per-recipient messages with at-most-once ack.
//!
//! Send is durable on commit and publishes a mail-arrived event for the
//! recipient's topic. The inbox is a poll surface ordered newest-first.
//! `read_at` moves through exactly one transition, NULL -> set, and only by
//! the recipient.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::bus::{Event, EventBus};
use crate::config::AppState;
use crate::db::now_ts;
use crate::error::{Error, Result};
use crate::identity::{self, contacts, AgentRow};
use crate::models::{Priority, SignatureFields};

/// Recipient reference: by id or by alias, resolved within the project.
#[derive(Clone, Debug)]
pub enum Recipient {
    AgentId(String),
    Alias(String),
}

#[derive(Clone, Debug)]
pub struct MailRow {
    pub message_id: String,
    pub from_agent_id: String,
    pub from_alias: String,
    pub subject: String,
    pub body: String,
    pub priority: String,
    pub thread_id: Option<String>,
    pub signatures: SignatureFields,
    pub read_at: Option<String>,
    pub created_at: String,
}

fn mail_from_row(row: &sqlx::sqlite::SqliteRow) -> MailRow {
    MailRow {
        message_id: row.get("message_id"),
        from_agent_id: row.get("from_agent_id"),
        from_alias: row.get("from_alias"),
        subject: row.get("subject"),
        body: row.get("body"),
        priority: row.get("priority"),
        thread_id: row.get("thread_id"),
        signatures: SignatureFields {
            from_did: row.get("from_did"),
            to_did: row.get("to_did"),
            signature: row.get("signature"),
            signing_key_id: row.get("signing_key_id"),
        },
        read_at: row.get("read_at"),
        created_at: row.get("created_at"),
    }
}

async fn resolve_recipient(
    pool: &SqlitePool,
    project_id: &str,
    to: &Recipient,
) -> Result<AgentRow> {
    let agent = match to {
        Recipient::AgentId(agent_id) => {
            if Uuid::parse_str(agent_id).is_err() {
                return Err(Error::InvalidArgument("invalid to_agent_id format".to_string()));
            }
            identity::get_agent_by_id(pool, project_id, agent_id).await?
        }
        Recipient::Alias(alias) => identity::get_agent_by_alias(pool, project_id, alias).await?,
    };
    agent.ok_or_else(|| Error::NotFound("agent not found".to_string()))
}

/// Deliver a mail message. Returns `(message_id, created_at)`.
pub async fn send_mail(
    state: &AppState,
    project_id: &str,
    from_agent_id: &str,
    to: Recipient,
    subject: &str,
    body: &str,
    priority: Priority,
    thread_id: Option<&str>,
    signatures: &SignatureFields,
) -> Result<(String, String)> {
    let pool = &state.pool;

    let sender = identity::get_agent_by_id(pool, project_id, from_agent_id)
        .await?
        .ok_or_else(|| Error::NotFound("agent not found".to_string()))?;

    let recipient = resolve_recipient(pool, project_id, &to).await?;
    if recipient.status == "deregistered" {
        return Err(Error::Gone("recipient agent is deregistered".to_string()));
    }

    if let Some(tid) = thread_id {
        if Uuid::parse_str(tid).is_err() {
            return Err(Error::InvalidArgument("invalid thread_id format".to_string()));
        }
    }

    let project = identity::get_project(pool, project_id)
        .await?
        .ok_or_else(|| Error::NotFound("project not found".to_string()))?;
    let sender_address = format!("{}/{}", project.slug, sender.alias);
    if !contacts::check_access(pool, &recipient, &sender_address).await? {
        return Err(Error::Forbidden(
            "recipient accepts messages from contacts only".to_string(),
        ));
    }

    let message_id = Uuid::new_v4().to_string();
    let created_at = now_ts();

    sqlx::query(
        "INSERT INTO messages
            (message_id, project_id, from_agent_id, to_agent_id, from_alias, subject, body,
             priority, thread_id, from_did, to_did, signature, signing_key_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&message_id)
    .bind(project_id)
    .bind(from_agent_id)
    .bind(&recipient.agent_id)
    .bind(&sender.alias)
    .bind(subject)
    .bind(body)
    .bind(priority.as_str())
    .bind(thread_id)
    .bind(&signatures.from_did)
    .bind(&signatures.to_did)
    .bind(&signatures.signature)
    .bind(&signatures.signing_key_id)
    .bind(&created_at)
    .execute(pool)
    .await?;

    state
        .bus
        .publish(
            &EventBus::mail_topic(project_id, &recipient.agent_id),
            Event::Mail {
                message_id: message_id.clone(),
                from_alias: sender.alias.clone(),
                subject: subject.to_string(),
                priority: priority.as_str().to_string(),
                timestamp: created_at.clone(),
            },
        )
        .await;

    Ok((message_id, created_at))
}

/// The recipient's inbox, newest first.
pub async fn inbox(
    pool: &SqlitePool,
    project_id: &str,
    agent_id: &str,
    unread_only: bool,
    limit: i64,
) -> Result<Vec<MailRow>> {
    let rows = sqlx::query(
        "SELECT message_id, from_agent_id, from_alias, subject, body, priority, thread_id,
                from_did, to_did, signature, signing_key_id, read_at, created_at
         FROM messages
         WHERE project_id = ?
           AND to_agent_id = ?
           AND (? = 0 OR read_at IS NULL)
         ORDER BY created_at DESC, message_id DESC
         LIMIT ?",
    )
    .bind(project_id)
    .bind(agent_id)
    .bind(unread_only)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(mail_from_row).collect())
}

/// Count of unread mail for an agent.
pub async fn unread_count(pool: &SqlitePool, project_id: &str, agent_id: &str) -> Result<i64> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS cnt FROM messages
         WHERE project_id = ? AND to_agent_id = ? AND read_at IS NULL",
    )
    .bind(project_id)
    .bind(agent_id)
    .fetch_one(pool)
    .await?;
    Ok(row.get("cnt"))
}

/// Acknowledge a message. At-most-once: the first ack sets `read_at`, later
/// acks are no-ops returning the original timestamp.
pub async fn ack(
    pool: &SqlitePool,
    project_id: &str,
    agent_id: &str,
    message_id: &str,
) -> Result<String> {
    if Uuid::parse_str(message_id).is_err() {
        return Err(Error::InvalidArgument("invalid message_id format".to_string()));
    }

    let row = sqlx::query(
        "SELECT to_agent_id, read_at FROM messages
         WHERE project_id = ? AND message_id = ?",
    )
    .bind(project_id)
    .bind(message_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound("message not found".to_string()))?;

    if row.get::<String, _>("to_agent_id") != agent_id {
        return Err(Error::Forbidden(
            "not authorized to acknowledge this message".to_string(),
        ));
    }

    if let Some(read_at) = row.get::<Option<String>, _>("read_at") {
        return Ok(read_at);
    }

    let read_at = now_ts();
    sqlx::query(
        "UPDATE messages SET read_at = ?
         WHERE project_id = ? AND message_id = ? AND read_at IS NULL",
    )
    .bind(&read_at)
    .bind(project_id)
    .bind(message_id)
    .execute(pool)
    .await?;

    // Re-read for a stable answer if a concurrent ack won the race.
    let row = sqlx::query("SELECT read_at FROM messages WHERE project_id = ? AND message_id = ?")
        .bind(project_id)
        .bind(message_id)
        .fetch_one(pool)
        .await?;
    Ok(row
        .get::<Option<String>, _>("read_at")
        .unwrap_or(read_at))
}
