//! Agent listing, presence heartbeat, alias suggestion, and contacts CRUD.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::config::AppState;
use crate::db::fmt_ts;
use crate::error::{Error, Result};
use crate::identity::{self, alias::suggest_next_name_prefix, contacts, validate_project_slug};

#[derive(Debug, Serialize)]
pub struct AgentView {
    pub agent_id: String,
    pub alias: String,
    pub human_name: String,
    pub agent_type: String,
    pub access_mode: String,
    pub status: String,
    pub online: bool,
}

#[derive(Debug, Serialize)]
pub struct ListAgentsResponse {
    pub project_id: String,
    pub agents: Vec<AgentView>,
}

/// GET /v1/agents
///
/// Live agents of the caller's project, each enriched with best-effort
/// presence.
pub async fn list_agents(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<ListAgentsResponse>> {
    let rows = identity::list_agents(&state.pool, &principal.project_id).await?;
    let agent_ids: Vec<String> = rows.iter().map(|a| a.agent_id.clone()).collect();
    let online = state
        .presence
        .online_agents(&principal.project_id, &agent_ids)
        .await;

    let agents = rows
        .into_iter()
        .map(|a| AgentView {
            online: online.contains(&a.agent_id),
            agent_id: a.agent_id,
            alias: a.alias,
            human_name: a.human_name,
            agent_type: a.agent_type,
            access_mode: a.access_mode,
            status: a.status,
        })
        .collect();

    Ok(Json(ListAgentsResponse {
        project_id: principal.project_id,
        agents,
    }))
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub agent_id: String,
    pub last_seen: String,
    pub ttl_seconds: i64,
}

/// POST /v1/agents/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<HeartbeatResponse>> {
    let agent_id = principal.require_agent()?;
    let agent = identity::get_agent_by_id(&state.pool, &principal.project_id, agent_id)
        .await?
        .ok_or_else(|| Error::NotFound("agent not found".to_string()))?;

    let last_seen = state
        .presence
        .heartbeat(&principal.project_id, agent_id, &agent.alias)
        .await;

    Ok(Json(HeartbeatResponse {
        agent_id: agent_id.to_string(),
        last_seen: fmt_ts(last_seen),
        ttl_seconds: state.presence.ttl_seconds(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SuggestAliasPrefixRequest {
    pub project_slug: String,
}

#[derive(Debug, Serialize)]
pub struct SuggestAliasPrefixResponse {
    pub project_slug: String,
    pub project_id: Option<String>,
    pub name_prefix: String,
}

/// POST /v1/agents/suggest-alias-prefix
///
/// Suggest the next free classic alias prefix without allocating anything.
/// Unauthenticated for clean-start UX.
pub async fn suggest_alias_prefix(
    State(state): State<AppState>,
    Json(payload): Json<SuggestAliasPrefixRequest>,
) -> Result<Json<SuggestAliasPrefixResponse>> {
    let slug = validate_project_slug(&payload.project_slug)?;

    let project = identity::get_project_by_slug(&state.pool, &slug).await?;
    let Some(project) = project else {
        // Project doesn't exist yet: first prefix is always available.
        return Ok(Json(SuggestAliasPrefixResponse {
            project_slug: slug,
            project_id: None,
            name_prefix: "alice".to_string(),
        }));
    };

    let agents = identity::list_agents(&state.pool, &project.project_id).await?;
    let aliases: Vec<&str> = agents.iter().map(|a| a.alias.as_str()).collect();
    let name_prefix = suggest_next_name_prefix(aliases)
        .ok_or_else(|| Error::Conflict("alias_exhausted".to_string()))?;

    Ok(Json(SuggestAliasPrefixResponse {
        project_slug: slug,
        project_id: Some(project.project_id),
        name_prefix,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateContactRequest {
    pub contact_address: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ContactView {
    pub contact_id: String,
    pub contact_address: String,
    pub label: Option<String>,
    pub created_at: String,
}

impl From<contacts::ContactRow> for ContactView {
    fn from(row: contacts::ContactRow) -> Self {
        Self {
            contact_id: row.contact_id,
            contact_address: row.contact_address,
            label: row.label,
            created_at: row.created_at,
        }
    }
}

/// POST /v1/contacts
pub async fn create_contact(
    State(state): State<AppState>,
    principal: Principal,
    Json(payload): Json<CreateContactRequest>,
) -> Result<Json<ContactView>> {
    let contact = contacts::add_contact(
        &state.pool,
        &principal.project_id,
        &payload.contact_address,
        payload.label.as_deref(),
    )
    .await?;
    Ok(Json(contact.into()))
}

#[derive(Debug, Serialize)]
pub struct ListContactsResponse {
    pub contacts: Vec<ContactView>,
}

/// GET /v1/contacts
pub async fn list_contacts(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<ListContactsResponse>> {
    let rows = contacts::list_contacts(&state.pool, &principal.project_id).await?;
    Ok(Json(ListContactsResponse {
        contacts: rows.into_iter().map(ContactView::from).collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct DeleteContactResponse {
    pub deleted: bool,
}

/// DELETE /v1/contacts/{contact_id}
pub async fn delete_contact(
    State(state): State<AppState>,
    principal: Principal,
    Path(contact_id): Path<String>,
) -> Result<Json<DeleteContactResponse>> {
    contacts::remove_contact(&state.pool, &principal.project_id, &contact_id).await?;
    Ok(Json(DeleteContactResponse { deleted: true }))
}
