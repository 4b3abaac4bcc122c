//! Bootstrap endpoint: project + agent + API key in one call.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::AppState;
use crate::db::now_ts;
use crate::error::Result;
use crate::identity;

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub project_slug: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub human_name: String,
    #[serde(default)]
    pub agent_type: String,
}

#[derive(Debug, Serialize)]
pub struct InitResponse {
    pub status: &'static str,
    pub created_at: String,
    pub project_id: String,
    pub project_slug: String,
    pub agent_id: String,
    pub alias: String,
    pub api_key: String,
    pub created: bool,
}

/// POST /v1/init
///
/// Unauthenticated clean-start bootstrap. Re-running for an existing alias
/// returns the same identity with a freshly rotated key.
pub async fn init(
    State(state): State<AppState>,
    Json(payload): Json<InitRequest>,
) -> Result<Json<InitResponse>> {
    let result = identity::bootstrap_identity(
        &state.pool,
        &payload.project_slug,
        &payload.project_name,
        payload.alias.as_deref(),
        &payload.human_name,
        &payload.agent_type,
    )
    .await?;

    info!(
        "init {} alias={} created={}",
        result.project_slug, result.alias, result.created
    );

    Ok(Json(InitResponse {
        status: "ok",
        created_at: now_ts(),
        project_id: result.project_id,
        project_slug: result.project_slug,
        agent_id: result.agent_id,
        alias: result.alias,
        api_key: result.api_key,
        created: result.created,
    }))
}
