//! Mail endpoints: send, inbox, ack.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::config::AppState;
use crate::error::{Error, Result};
use crate::mail::{self, Recipient};
use crate::models::{Priority, SignatureFields};

#[derive(Debug, Deserialize)]
pub struct SendMailRequest {
    #[serde(default)]
    pub to_agent_id: Option<String>,
    #[serde(default)]
    pub to_alias: Option<String>,
    #[serde(default)]
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(flatten)]
    pub signatures: SignatureFields,
}

#[derive(Debug, Serialize)]
pub struct SendMailResponse {
    pub message_id: String,
    pub status: &'static str,
    pub delivered_at: String,
}

/// POST /v1/messages
pub async fn send(
    State(state): State<AppState>,
    principal: Principal,
    Json(payload): Json<SendMailRequest>,
) -> Result<Json<SendMailResponse>> {
    let agent_id = principal.require_agent()?;

    let to = match (&payload.to_agent_id, &payload.to_alias) {
        (Some(id), _) if !id.trim().is_empty() => Recipient::AgentId(id.trim().to_string()),
        (_, Some(alias)) if !alias.trim().is_empty() => Recipient::Alias(alias.trim().to_string()),
        _ => {
            return Err(Error::InvalidArgument(
                "must provide to_agent_id or to_alias".to_string(),
            ))
        }
    };

    let (message_id, delivered_at) = mail::send_mail(
        &state,
        &principal.project_id,
        agent_id,
        to,
        &payload.subject,
        &payload.body,
        payload.priority,
        payload.thread_id.as_deref(),
        &payload.signatures,
    )
    .await?;

    Ok(Json(SendMailResponse {
        message_id,
        status: "delivered",
        delivered_at,
    }))
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct InboxParams {
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

#[derive(Debug, Serialize)]
pub struct InboxMessage {
    pub message_id: String,
    pub from_agent_id: String,
    pub from_alias: String,
    pub subject: String,
    pub body: String,
    pub priority: String,
    pub thread_id: Option<String>,
    pub read_at: Option<String>,
    pub created_at: String,
    #[serde(flatten)]
    pub signatures: SignatureFields,
}

#[derive(Debug, Serialize)]
pub struct InboxResponse {
    pub messages: Vec<InboxMessage>,
}

/// GET /v1/messages/inbox?unread_only&limit
pub async fn inbox(
    State(state): State<AppState>,
    principal: Principal,
    Query(params): Query<InboxParams>,
) -> Result<Json<InboxResponse>> {
    let agent_id = principal.require_agent()?;
    if !(1..=500).contains(&params.limit) {
        return Err(Error::InvalidArgument("limit must be between 1 and 500".to_string()));
    }

    let rows = mail::inbox(
        &state.pool,
        &principal.project_id,
        agent_id,
        params.unread_only,
        params.limit,
    )
    .await?;

    Ok(Json(InboxResponse {
        messages: rows
            .into_iter()
            .map(|r| InboxMessage {
                message_id: r.message_id,
                from_agent_id: r.from_agent_id,
                from_alias: r.from_alias,
                subject: r.subject,
                body: r.body,
                priority: r.priority,
                thread_id: r.thread_id,
                read_at: r.read_at,
                created_at: r.created_at,
                signatures: r.signatures,
            })
            .collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub message_id: String,
    pub acknowledged_at: String,
}

/// POST /v1/messages/{message_id}/ack
pub async fn ack(
    State(state): State<AppState>,
    principal: Principal,
    Path(message_id): Path<String>,
) -> Result<Json<AckResponse>> {
    let agent_id = principal.require_agent()?;
    let acknowledged_at =
        mail::ack(&state.pool, &principal.project_id, agent_id, message_id.trim()).await?;
    Ok(Json(AckResponse {
        message_id: message_id.trim().to_string(),
        acknowledged_at,
    }))
}
