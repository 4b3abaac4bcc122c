//! Authentication and project scoping.
//!
//! Two modes, mutually exclusive per deployment:
//!
//! - Bearer: `Authorization: Bearer <key>`, looked up by full-key SHA-256
//!   digest. No prefix index is consulted, so an invalid key reveals nothing
//!   about which prefixes exist.
//! - Proxy trust: a fronting wrapper authenticates the caller and injects a
//!   signed context. When enabled, the Bearer path is disabled entirely; a
//!   malformed or tampered context fails terminally rather than falling back.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::config::AppState;
use crate::db::now_ts;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const PROXY_AUTH_HEADER: &str = "x-aw-auth";
pub const PROXY_PROJECT_HEADER: &str = "x-project-id";
pub const PROXY_ACTOR_HEADER: &str = "x-aweb-actor-id";
pub const PROXY_API_KEY_HEADER: &str = "x-api-key";
pub const PROXY_USER_HEADER: &str = "x-user-id";

/// The authenticated scope of a request.
#[derive(Clone, Debug)]
pub struct Principal {
    pub project_id: String,
    pub agent_id: Option<String>,
    pub api_key_id: Option<String>,
}

impl Principal {
    /// The acting agent, for operations that require one. Project-only keys
    /// cannot send mail, chat, or hold reservations.
    pub fn require_agent(&self) -> Result<&str> {
        self.agent_id
            .as_deref()
            .ok_or_else(|| Error::Forbidden("API key is not bound to an agent".to_string()))
    }
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or_else(|| Error::Internal("auth context missing from request".to_string()))
    }
}

/// Hash an API key for storage and lookup.
pub fn hash_api_key(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn hex_decode(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&value[i..i + 2], 16).ok())
        .collect()
}

/// Generate a fresh API key. Returns `(full_key, key_prefix, key_hash)`;
/// only the hash is stored for lookup, the prefix is display-only.
pub fn generate_api_key() -> (String, String, String) {
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let full_key = format!("aw_sk_{}", hex_encode(&bytes));
    let key_prefix = full_key[..12].to_string();
    let key_hash = hash_api_key(&full_key);
    (full_key, key_prefix, key_hash)
}

fn is_valid_uuid(value: &str) -> bool {
    uuid::Uuid::parse_str(value).is_ok()
}

/// Extract the Bearer token from the Authorization header.
///
/// Absent header yields `Ok(None)`; a present but malformed header is an
/// authentication failure.
fn parse_bearer_token(headers: &HeaderMap) -> Result<Option<String>> {
    let value = match headers.get(header::AUTHORIZATION) {
        Some(v) => v
            .to_str()
            .map_err(|_| Error::Unauthenticated("invalid Authorization header".to_string()))?,
        None => return Ok(None),
    };

    let token = value.strip_prefix("Bearer ").ok_or_else(|| {
        Error::Unauthenticated("invalid Authorization header, expected: Bearer <token>".to_string())
    })?;

    Ok(Some(token.to_string()))
}

/// Verify a Bearer token and return the key's canonical identity context.
pub async fn verify_bearer_token(pool: &SqlitePool, token: &str) -> Result<Principal> {
    let key_hash = hash_api_key(token);

    let row = sqlx::query(
        "SELECT api_key_id, project_id, agent_id, is_active
         FROM api_keys
         WHERE key_hash = ?",
    )
    .bind(&key_hash)
    .fetch_optional(pool)
    .await?;

    let row = row.ok_or_else(|| Error::Unauthenticated("invalid API key".to_string()))?;
    if !row.get::<bool, _>("is_active") {
        return Err(Error::Unauthenticated("invalid API key".to_string()));
    }

    // Usage tracking is opportunistic; a failed update must not fail auth.
    if let Err(err) = sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE key_hash = ?")
        .bind(now_ts())
        .bind(&key_hash)
        .execute(pool)
        .await
    {
        warn!("failed to update api key last_used_at: {}", err);
    }

    Ok(Principal {
        project_id: row.get("project_id"),
        agent_id: row.get("agent_id"),
        api_key_id: Some(row.get("api_key_id")),
    })
}

/// Compute the signed proxy auth header value for a given context.
pub fn proxy_auth_header_value(
    secret: &str,
    project_id: &str,
    principal_type: &str,
    principal_id: &str,
    actor_id: &str,
) -> String {
    let msg = format!("v2:{project_id}:{principal_type}:{principal_id}:{actor_id}");
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(msg.as_bytes());
    let sig = hex_encode(&mac.finalize().into_bytes());
    format!("{msg}:{sig}")
}

fn proxy_header(headers: &HeaderMap, name: &str) -> Result<Option<String>> {
    match headers.get(name) {
        Some(v) => v
            .to_str()
            .map(|s| Some(s.to_string()))
            .map_err(|_| Error::Unauthenticated("authentication required".to_string())),
        None => Ok(None),
    }
}

/// Validate proxy-injected auth context headers. Any inconsistency is a
/// terminal authentication failure; callers must not fall back to Bearer.
fn parse_proxy_context(headers: &HeaderMap, secret: &str) -> Result<Principal> {
    let unauthenticated = || Error::Unauthenticated("authentication required".to_string());

    let signed = proxy_header(headers, PROXY_AUTH_HEADER)?.ok_or_else(unauthenticated)?;

    let project_id = proxy_header(headers, PROXY_PROJECT_HEADER)?.ok_or_else(unauthenticated)?;
    if !is_valid_uuid(&project_id) {
        return Err(unauthenticated());
    }

    let actor_id = proxy_header(headers, PROXY_ACTOR_HEADER)?.ok_or_else(unauthenticated)?;
    if !is_valid_uuid(&actor_id) {
        return Err(unauthenticated());
    }

    let api_key_id = proxy_header(headers, PROXY_API_KEY_HEADER)?;
    let user_id = proxy_header(headers, PROXY_USER_HEADER)?;
    let (principal_type, principal_id) = match (&user_id, &api_key_id) {
        (Some(uid), _) => ("u", uid.clone()),
        (None, Some(kid)) => ("k", kid.clone()),
        (None, None) => return Err(unauthenticated()),
    };
    if !is_valid_uuid(&principal_id) {
        return Err(unauthenticated());
    }

    let msg = format!("v2:{project_id}:{principal_type}:{principal_id}:{actor_id}");
    let expected_prefix = format!("{msg}:");
    let sig_hex = signed.strip_prefix(&expected_prefix).ok_or_else(unauthenticated)?;
    let sig = hex_decode(sig_hex).ok_or_else(unauthenticated)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(msg.as_bytes());
    mac.verify_slice(&sig).map_err(|_| unauthenticated())?;

    Ok(Principal {
        project_id,
        agent_id: Some(actor_id),
        api_key_id: if principal_type == "k" { Some(principal_id) } else { None },
    })
}

/// Authenticate a request to a [`Principal`].
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Principal> {
    if state.settings.trust_proxy_headers {
        let secret = state
            .settings
            .internal_auth_secret
            .as_deref()
            .ok_or_else(|| Error::Internal("internal auth secret not configured".to_string()))?;
        return parse_proxy_context(headers, secret);
    }

    let token = parse_bearer_token(headers)?
        .ok_or_else(|| Error::Unauthenticated("authentication required".to_string()))?;
    verify_bearer_token(&state.pool, &token).await
}

/// Middleware for authenticated routes: resolve the caller once and stash
/// the [`Principal`] in request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    debug!("authenticating {} {}", req.method(), req.uri().path());
    let principal = authenticate(&state, req.headers()).await?;
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn api_key_hash_is_stable_hex_sha256() {
        let (key, prefix, hash) = generate_api_key();
        assert!(key.starts_with("aw_sk_"));
        assert_eq!(key.len(), 6 + 64);
        assert_eq!(prefix, &key[..12]);
        assert_eq!(hash, hash_api_key(&key));
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn bearer_parsing_rejects_malformed_header() {
        let mut headers = HeaderMap::new();
        assert!(parse_bearer_token(&headers).unwrap().is_none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(parse_bearer_token(&headers).is_err());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert_eq!(parse_bearer_token(&headers).unwrap().unwrap(), "tok");
    }

    fn proxy_headers(secret: &str, project: &str, actor: &str, key_id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let signed = proxy_auth_header_value(secret, project, "k", key_id, actor);
        headers.insert(PROXY_AUTH_HEADER, signed.parse().unwrap());
        headers.insert(PROXY_PROJECT_HEADER, project.parse().unwrap());
        headers.insert(PROXY_ACTOR_HEADER, actor.parse().unwrap());
        headers.insert(PROXY_API_KEY_HEADER, key_id.parse().unwrap());
        headers
    }

    #[test]
    fn proxy_context_round_trips() {
        let project = uuid::Uuid::new_v4().to_string();
        let actor = uuid::Uuid::new_v4().to_string();
        let key_id = uuid::Uuid::new_v4().to_string();
        let headers = proxy_headers("s3cret", &project, &actor, &key_id);

        let principal = parse_proxy_context(&headers, "s3cret").unwrap();
        assert_eq!(principal.project_id, project);
        assert_eq!(principal.agent_id.as_deref(), Some(actor.as_str()));
        assert_eq!(principal.api_key_id.as_deref(), Some(key_id.as_str()));
    }

    #[test]
    fn tampered_proxy_context_is_rejected() {
        let project = uuid::Uuid::new_v4().to_string();
        let actor = uuid::Uuid::new_v4().to_string();
        let key_id = uuid::Uuid::new_v4().to_string();
        let mut headers = proxy_headers("s3cret", &project, &actor, &key_id);

        // Swap the scoped project after signing.
        let other = uuid::Uuid::new_v4().to_string();
        headers.insert(PROXY_PROJECT_HEADER, other.parse().unwrap());
        assert!(parse_proxy_context(&headers, "s3cret").is_err());

        // Wrong secret.
        let headers = proxy_headers("s3cret", &project, &actor, &key_id);
        assert!(parse_proxy_context(&headers, "other").is_err());
    }

    #[test]
    fn proxy_context_requires_all_headers() {
        let mut headers = HeaderMap::new();
        assert!(parse_proxy_context(&headers, "s3cret").is_err());

        headers.insert(PROXY_AUTH_HEADER, "garbage".parse().unwrap());
        assert!(parse_proxy_context(&headers, "s3cret").is_err());
    }
}
