//! Reservation endpoints: acquire, renew, release, revoke, list.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::config::AppState;
use crate::error::{Error, Result};
use crate::reservations::{self, ReservationView};

const RESOURCE_KEY_MAX_LENGTH: usize = 4096;

fn validate_resource_key(key: &str) -> Result<&str> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("resource_key is required".to_string()));
    }
    if key.len() > RESOURCE_KEY_MAX_LENGTH {
        return Err(Error::InvalidArgument("resource_key too long".to_string()));
    }
    Ok(key)
}

#[derive(Debug, Deserialize)]
pub struct AcquireRequest {
    pub resource_key: String,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct AcquireResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub reservation: ReservationView,
}

/// POST /v1/reservations
pub async fn acquire(
    State(state): State<AppState>,
    principal: Principal,
    Json(payload): Json<AcquireRequest>,
) -> Result<Json<AcquireResponse>> {
    let agent_id = principal.require_agent()?;
    validate_resource_key(&payload.resource_key)?;

    let metadata = if payload.metadata.is_null() {
        serde_json::json!({})
    } else if payload.metadata.is_object() {
        payload.metadata
    } else {
        return Err(Error::InvalidArgument("metadata must be an object".to_string()));
    };

    let reservation = reservations::acquire(
        &state.pool,
        &principal.project_id,
        agent_id,
        &payload.resource_key,
        payload
            .ttl_seconds
            .unwrap_or(state.settings.reservation_default_ttl_seconds),
        state.settings.reservation_max_ttl_seconds,
        &metadata,
    )
    .await?;

    Ok(Json(AcquireResponse {
        status: "acquired",
        reservation,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RenewRequest {
    pub resource_key: String,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RenewResponse {
    pub status: &'static str,
    pub resource_key: String,
    pub expires_at: String,
}

/// POST /v1/reservations/renew
pub async fn renew(
    State(state): State<AppState>,
    principal: Principal,
    Json(payload): Json<RenewRequest>,
) -> Result<Json<RenewResponse>> {
    let agent_id = principal.require_agent()?;
    validate_resource_key(&payload.resource_key)?;

    let expires_at = reservations::renew(
        &state.pool,
        &principal.project_id,
        agent_id,
        &payload.resource_key,
        payload
            .ttl_seconds
            .unwrap_or(state.settings.reservation_default_ttl_seconds),
        state.settings.reservation_max_ttl_seconds,
    )
    .await?;

    Ok(Json(RenewResponse {
        status: "renewed",
        resource_key: payload.resource_key,
        expires_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub resource_key: String,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub status: &'static str,
    pub resource_key: String,
    pub released: bool,
}

/// POST /v1/reservations/release
pub async fn release(
    State(state): State<AppState>,
    principal: Principal,
    Json(payload): Json<ReleaseRequest>,
) -> Result<Json<ReleaseResponse>> {
    let agent_id = principal.require_agent()?;
    validate_resource_key(&payload.resource_key)?;

    let released = reservations::release(
        &state.pool,
        &principal.project_id,
        agent_id,
        &payload.resource_key,
    )
    .await?;

    Ok(Json(ReleaseResponse {
        status: "released",
        resource_key: payload.resource_key,
        released,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub status: &'static str,
    pub deleted: u64,
}

/// POST /v1/reservations/revoke
///
/// Bulk-release the caller's own reservations, optionally narrowed by
/// prefix.
pub async fn revoke(
    State(state): State<AppState>,
    principal: Principal,
    Json(payload): Json<RevokeRequest>,
) -> Result<Json<RevokeResponse>> {
    let agent_id = principal.require_agent()?;

    let deleted = reservations::revoke(
        &state.pool,
        &principal.project_id,
        agent_id,
        payload.prefix.as_deref(),
    )
    .await?;

    Ok(Json(RevokeResponse {
        status: "revoked",
        deleted,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub reservations: Vec<ReservationView>,
}

/// GET /v1/reservations?prefix=<p>
pub async fn list(
    State(state): State<AppState>,
    principal: Principal,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>> {
    let rows = reservations::list(
        &state.pool,
        &principal.project_id,
        params.prefix.as_deref(),
    )
    .await?;
    Ok(Json(ListResponse { reservations: rows }))
}
