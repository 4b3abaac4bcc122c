//! aweb — coordination substrate for AI agents.
//!
//! Hosts projects, agents, and per-agent API keys, and exposes four
//! coordination primitives over HTTP+JSON: asynchronous mail, synchronous
//! chat with server-push streaming and blocking reply waits, opaque named
//! reservation leases, and best-effort presence. Every operation is scoped
//! to the authenticated project; cross-project references are never created
//! or accepted.

pub mod auth;
pub mod bus;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod mail;
pub mod models;
pub mod presence;
pub mod reservations;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{AppState, Settings};

/// Build the full application router over shared state.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/v1/init", post(handlers::init::init))
        .route(
            "/v1/agents/suggest-alias-prefix",
            post(handlers::agents::suggest_alias_prefix),
        );

    let protected = Router::new()
        // Identity
        .route("/v1/auth/introspect", get(handlers::auth::introspect))
        .route("/v1/projects/current", get(handlers::auth::current_project))
        // Agents & presence
        .route("/v1/agents", get(handlers::agents::list_agents))
        .route("/v1/agents/heartbeat", post(handlers::agents::heartbeat))
        // Contacts
        .route(
            "/v1/contacts",
            post(handlers::agents::create_contact).get(handlers::agents::list_contacts),
        )
        .route("/v1/contacts/{contact_id}", delete(handlers::agents::delete_contact))
        // Mail
        .route("/v1/messages", post(handlers::mail::send))
        .route("/v1/messages/inbox", get(handlers::mail::inbox))
        .route("/v1/messages/{message_id}/ack", post(handlers::mail::ack))
        // Chat
        .route(
            "/v1/chat/sessions",
            post(handlers::chat::create_session).get(handlers::chat::list_sessions),
        )
        .route("/v1/chat/pending", get(handlers::chat::pending))
        .route(
            "/v1/chat/sessions/{session_id}/messages",
            get(handlers::chat::history).post(handlers::chat::send_message),
        )
        .route("/v1/chat/sessions/{session_id}/read", post(handlers::chat::mark_read))
        .route("/v1/chat/sessions/{session_id}/stream", get(handlers::chat::stream))
        // Reservations
        .route(
            "/v1/reservations",
            post(handlers::reservations::acquire).get(handlers::reservations::list),
        )
        .route("/v1/reservations/renew", post(handlers::reservations::renew))
        .route("/v1/reservations/release", post(handlers::reservations::release))
        .route("/v1/reservations/revoke", post(handlers::reservations::revoke))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    public
        .merge(protected)
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "OK"
}

/// Initialize logging, storage, and state, then serve until shutdown.
pub async fn run() -> anyhow::Result<()> {
    let settings = Settings::from_env()?;

    let filter = EnvFilter::try_new(&settings.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // Already set, ignore
    }

    info!("=== aweb ===");
    let pool = db::init_pool(&settings.database_url).await?;

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))?;

    let state = AppState::new(pool, settings);
    let app = router(state);

    info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
