//! Auth introspection and project info.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::auth::Principal;
use crate::config::AppState;
use crate::error::{Error, Result};
use crate::identity;

#[derive(Debug, Serialize)]
pub struct IntrospectResponse {
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub human_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
}

/// GET /v1/auth/introspect
///
/// Validate the caller's auth context and return its scope, enriched with
/// agent identity when the principal is agent-bound. Exists so fronting
/// services can validate keys without owning verification.
pub async fn introspect(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<IntrospectResponse>> {
    let mut response = IntrospectResponse {
        project_id: principal.project_id.clone(),
        agent_id: principal.agent_id.clone(),
        api_key_id: principal.api_key_id.clone(),
        alias: None,
        human_name: None,
        agent_type: None,
    };

    if let Some(agent_id) = &principal.agent_id {
        if let Some(agent) =
            identity::get_agent_by_id(&state.pool, &principal.project_id, agent_id).await?
        {
            response.alias = Some(agent.alias);
            response.human_name = Some(agent.human_name);
            response.agent_type = Some(agent.agent_type);
        }
    }

    Ok(Json(response))
}

#[derive(Debug, Serialize)]
pub struct ProjectResponse {
    pub project_id: String,
    pub slug: String,
    pub name: String,
}

/// GET /v1/projects/current
pub async fn current_project(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<ProjectResponse>> {
    let project = identity::get_project(&state.pool, &principal.project_id)
        .await?
        .ok_or_else(|| Error::NotFound("project not found".to_string()))?;

    Ok(Json(ProjectResponse {
        project_id: project.project_id,
        slug: project.slug,
        name: project.name,
    }))
}
