//! Chat endpoints: create/send (optionally blocking on a reply), history,
//! read receipts, pending, session listing, and the SSE stream.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::chat::{self, stream::session_stream, wait, Participant};
use crate::config::AppState;
use crate::db::parse_ts;
use crate::error::{Error, Result};
use crate::models::SignatureFields;

/// Resolve the effective blocking wait for a send: an explicit
/// `wait_seconds` wins, the `wait` flag falls back to the configured
/// default, everything else returns immediately.
fn resolve_wait(wait: bool, wait_seconds: Option<i64>, default_seconds: i64) -> i64 {
    match wait_seconds {
        Some(seconds) => seconds.max(0),
        None if wait => default_seconds,
        None => 0,
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub to_aliases: Vec<String>,
    pub message: String,
    #[serde(default)]
    pub leaving: bool,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub wait_seconds: Option<i64>,
    #[serde(flatten)]
    pub signatures: SignatureFields,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub message_id: String,
    pub participants: Vec<Participant>,
    pub sse_url: String,
    pub targets_connected: Vec<String>,
    pub targets_left: Vec<String>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waited_seconds: Option<i64>,
}

/// POST /v1/chat/sessions
///
/// Create (or reuse) the session for the participant set and append the
/// first message. With `wait`/`wait_seconds` the request blocks until a
/// reply, an extension-aware deadline, or disconnect.
pub async fn create_session(
    State(state): State<AppState>,
    principal: Principal,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>> {
    let agent_id = principal.require_agent()?.to_string();

    let outcome = chat::create_session(
        &state,
        &principal.project_id,
        &agent_id,
        &payload.to_aliases,
        &payload.message,
        payload.leaving,
        &payload.signatures,
    )
    .await?;

    let mut response = CreateSessionResponse {
        sse_url: format!("/v1/chat/sessions/{}/stream", outcome.session_id),
        session_id: outcome.session_id.clone(),
        message_id: outcome.message_id.clone(),
        participants: outcome.participants,
        targets_connected: outcome.targets_connected,
        targets_left: outcome.targets_left,
        status: "sent",
        reply: None,
        reply_from: None,
        waited_seconds: None,
    };

    // A departing sender has nothing to wait for.
    let wait_seconds = if payload.leaving {
        0
    } else {
        resolve_wait(payload.wait, payload.wait_seconds, state.settings.start_wait_seconds)
    };
    if wait_seconds > 0 {
        let started = Utc::now();
        let result = wait::wait_for_reply(
            &state.bus,
            &state.waiters,
            &outcome.session_id,
            &agent_id,
            &outcome.message_id,
            wait_seconds,
        )
        .await;
        response.status = result.status();
        response.waited_seconds = Some((Utc::now() - started).num_seconds());
        if let wait::WaitOutcome::Replied { from, body } | wait::WaitOutcome::SenderLeft { from, body } =
            result
        {
            response.reply_from = Some(from);
            response.reply = Some(body);
        }
    }

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
    #[serde(default)]
    pub hang_on: bool,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub wait_seconds: Option<i64>,
    #[serde(flatten)]
    pub signatures: SignatureFields,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message_id: String,
    pub delivered: bool,
    pub extends_wait_seconds: i64,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waited_seconds: Option<i64>,
}

/// POST /v1/chat/sessions/{session_id}/messages
pub async fn send_message(
    State(state): State<AppState>,
    principal: Principal,
    Path(session_id): Path<String>,
    Json(payload): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>> {
    let agent_id = principal.require_agent()?.to_string();

    let outcome = chat::send_message(
        &state,
        &principal.project_id,
        &agent_id,
        session_id.trim(),
        &payload.body,
        payload.hang_on,
        &payload.signatures,
    )
    .await?;

    let mut response = SendMessageResponse {
        message_id: outcome.message_id.clone(),
        delivered: true,
        extends_wait_seconds: outcome.extends_wait_seconds,
        status: "sent",
        reply: None,
        reply_from: None,
        waited_seconds: None,
    };

    // Hang-on is a control message granting the *other* side time; it never
    // blocks the sender.
    let wait_seconds = if payload.hang_on {
        0
    } else {
        resolve_wait(payload.wait, payload.wait_seconds, state.settings.quick_wait_seconds)
    };
    if wait_seconds > 0 {
        let started = Utc::now();
        let result = wait::wait_for_reply(
            &state.bus,
            &state.waiters,
            session_id.trim(),
            &agent_id,
            &outcome.message_id,
            wait_seconds,
        )
        .await;
        response.status = result.status();
        response.waited_seconds = Some((Utc::now() - started).num_seconds());
        if let wait::WaitOutcome::Replied { from, body } | wait::WaitOutcome::SenderLeft { from, body } =
            result
        {
            response.reply_from = Some(from);
            response.reply = Some(body);
        }
    }

    Ok(Json(response))
}

fn default_history_limit() -> i64 {
    200
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

#[derive(Debug, Serialize)]
pub struct ChatMessageJson {
    pub message_id: String,
    pub from_agent: String,
    pub body: String,
    pub timestamp: String,
    pub sender_leaving: bool,
    pub hang_on: bool,
    #[serde(flatten)]
    pub signatures: SignatureFields,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub messages: Vec<ChatMessageJson>,
}

/// GET /v1/chat/sessions/{session_id}/messages?unread_only&limit
pub async fn history(
    State(state): State<AppState>,
    principal: Principal,
    Path(session_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>> {
    let agent_id = principal.require_agent()?;
    if !(1..=2000).contains(&params.limit) {
        return Err(Error::InvalidArgument("limit must be between 1 and 2000".to_string()));
    }

    let messages = chat::history(
        &state.pool,
        &principal.project_id,
        session_id.trim(),
        agent_id,
        params.unread_only,
        params.limit,
    )
    .await?;

    Ok(Json(HistoryResponse {
        messages: messages
            .into_iter()
            .map(|m| ChatMessageJson {
                message_id: m.message_id,
                from_agent: m.from_agent,
                body: m.body,
                timestamp: m.timestamp,
                sender_leaving: m.sender_leaving,
                hang_on: m.hang_on,
                signatures: m.signatures,
            })
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub up_to_message_id: String,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub success: bool,
    pub messages_marked: i64,
    pub wait_extended_seconds: i64,
}

/// POST /v1/chat/sessions/{session_id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    principal: Principal,
    Path(session_id): Path<String>,
    Json(payload): Json<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>> {
    let agent_id = principal.require_agent()?;

    let outcome = chat::mark_read(
        &state,
        &principal.project_id,
        session_id.trim(),
        agent_id,
        payload.up_to_message_id.trim(),
    )
    .await?;

    Ok(Json(MarkReadResponse {
        success: true,
        messages_marked: outcome.messages_marked,
        wait_extended_seconds: outcome.wait_extended_seconds,
    }))
}

#[derive(Debug, Serialize)]
pub struct PendingItem {
    pub session_id: String,
    pub participants: Vec<String>,
    pub last_message: String,
    pub last_from: String,
    pub unread_count: i64,
    pub last_activity: String,
    pub sender_waiting: bool,
    pub time_remaining_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub pending: Vec<PendingItem>,
    pub messages_waiting: i64,
}

/// GET /v1/chat/pending
pub async fn pending(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<PendingResponse>> {
    let agent_id = principal.require_agent()?;
    let (rows, messages_waiting) = chat::pending(&state, &principal.project_id, agent_id).await?;

    Ok(Json(PendingResponse {
        pending: rows
            .into_iter()
            .map(|r| PendingItem {
                session_id: r.session_id,
                participants: r.participants,
                last_message: r.last_message,
                last_from: r.last_from,
                unread_count: r.unread_count,
                last_activity: r.last_activity,
                sender_waiting: r.sender_waiting,
                time_remaining_seconds: r.time_remaining_seconds,
            })
            .collect(),
        messages_waiting,
    }))
}

#[derive(Debug, Serialize)]
pub struct SessionItem {
    pub session_id: String,
    pub participants: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionItem>,
}

/// GET /v1/chat/sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<ListSessionsResponse>> {
    let agent_id = principal.require_agent()?;
    let sessions = chat::list_sessions(&state.pool, &principal.project_id, agent_id).await?;

    Ok(Json(ListSessionsResponse {
        sessions: sessions
            .into_iter()
            .map(|s| SessionItem {
                session_id: s.session_id,
                participants: s.participants,
                created_at: s.created_at,
            })
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub deadline: String,
    #[serde(default)]
    pub after: Option<String>,
}

/// GET /v1/chat/sessions/{session_id}/stream?deadline=<RFC3339>[&after=<RFC3339>]
///
/// Server-push channel for this session's events. The deadline is required
/// and must be in the future; the stream closes at the (possibly extended)
/// deadline or on disconnect.
pub async fn stream(
    State(state): State<AppState>,
    principal: Principal,
    Path(session_id): Path<String>,
    Query(params): Query<StreamParams>,
) -> Result<Response> {
    let agent_id = principal.require_agent()?.to_string();
    let session_id = session_id.trim().to_string();

    if !chat::session_in_project(&state.pool, &session_id, &principal.project_id).await? {
        return Err(Error::NotFound("session not found".to_string()));
    }
    if chat::participant_alias(&state.pool, &session_id, &agent_id)
        .await?
        .is_none()
    {
        return Err(Error::Forbidden("not a participant in this session".to_string()));
    }

    let deadline = parse_ts(&params.deadline)
        .ok_or_else(|| Error::InvalidArgument("invalid deadline format".to_string()))?;
    if deadline <= Utc::now() {
        return Err(Error::InvalidArgument("deadline must be in the future".to_string()));
    }

    let after = match &params.after {
        Some(value) => Some(
            parse_ts(value)
                .ok_or_else(|| Error::InvalidArgument("invalid after format".to_string()))?,
        ),
        None => None,
    };

    let body = Body::from_stream(session_stream(state, session_id, agent_id, deadline, after));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .map_err(|e| Error::Internal(format!("failed to build stream response: {e}")))
}
