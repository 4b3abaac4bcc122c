//! Server configuration and shared application state.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::bus::EventBus;
use crate::chat::wait::WaiterRegistry;
use crate::presence::PresenceStore;

/// Runtime settings, read once from the environment at startup.
#[derive(Clone, Debug)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub log_level: String,
    /// Trust signed proxy-injected auth context instead of Bearer tokens.
    pub trust_proxy_headers: bool,
    /// HMAC secret for proxy context verification. Required when
    /// `trust_proxy_headers` is set.
    pub internal_auth_secret: Option<String>,
    /// Seconds added to a waiting sender's deadline by a hang-on message or
    /// a read receipt.
    pub hang_on_extension_seconds: i64,
    pub reservation_default_ttl_seconds: i64,
    pub reservation_max_ttl_seconds: i64,
    pub heartbeat_ttl_seconds: i64,
    /// Default blocking wait when starting a conversation.
    pub start_wait_seconds: i64,
    /// Default blocking wait for an in-session send.
    pub quick_wait_seconds: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
            database_url: "aweb.sqlite".to_string(),
            log_level: "info".to_string(),
            trust_proxy_headers: false,
            internal_auth_secret: None,
            hang_on_extension_seconds: 300,
            reservation_default_ttl_seconds: 3600,
            reservation_max_ttl_seconds: 86_400,
            heartbeat_ttl_seconds: 1800,
            start_wait_seconds: 300,
            quick_wait_seconds: 60,
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).unwrap_or_default().trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_i64(name: &str, default: i64) -> anyhow::Result<i64> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse::<i64>()
            .map_err(|_| anyhow::anyhow!("{} must be an integer, got '{}'", name, v)),
        Err(_) => Ok(default),
    }
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let port = match std::env::var("AWEB_PORT") {
            Ok(v) => v
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("AWEB_PORT must be a valid port, got '{}'", v))?,
            Err(_) => defaults.port,
        };

        let database_url = std::env::var("AWEB_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .unwrap_or(defaults.database_url);

        let settings = Self {
            host: std::env::var("AWEB_HOST").unwrap_or(defaults.host),
            port,
            database_url,
            log_level: std::env::var("AWEB_LOG_LEVEL").unwrap_or(defaults.log_level),
            trust_proxy_headers: env_flag("AWEB_TRUST_PROXY_HEADERS"),
            internal_auth_secret: std::env::var("AWEB_INTERNAL_AUTH_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            hang_on_extension_seconds: env_i64(
                "AWEB_HANG_ON_EXTENSION_SECONDS",
                defaults.hang_on_extension_seconds,
            )?,
            reservation_default_ttl_seconds: env_i64(
                "AWEB_RESERVATION_DEFAULT_TTL_SECONDS",
                defaults.reservation_default_ttl_seconds,
            )?,
            reservation_max_ttl_seconds: env_i64(
                "AWEB_RESERVATION_MAX_TTL_SECONDS",
                defaults.reservation_max_ttl_seconds,
            )?,
            heartbeat_ttl_seconds: env_i64(
                "AWEB_HEARTBEAT_TTL_SECONDS",
                defaults.heartbeat_ttl_seconds,
            )?,
            start_wait_seconds: env_i64("AWEB_START_WAIT_SECONDS", defaults.start_wait_seconds)?,
            quick_wait_seconds: env_i64("AWEB_QUICK_WAIT_SECONDS", defaults.quick_wait_seconds)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Fail fast on inconsistent auth configuration: trusting proxy headers
    /// without a signing secret would let anyone forge a project scope.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.trust_proxy_headers && self.internal_auth_secret.is_none() {
            anyhow::bail!(
                "AWEB_TRUST_PROXY_HEADERS is enabled but AWEB_INTERNAL_AUTH_SECRET is not set"
            );
        }
        Ok(())
    }
}

/// App state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub settings: Arc<Settings>,
    pub presence: Arc<PresenceStore>,
    pub bus: Arc<EventBus>,
    pub waiters: Arc<WaiterRegistry>,
}

impl AppState {
    pub fn new(pool: SqlitePool, settings: Settings) -> Self {
        let presence = Arc::new(PresenceStore::new(settings.heartbeat_ttl_seconds));
        Self {
            pool,
            settings: Arc::new(settings),
            presence,
            bus: Arc::new(EventBus::new()),
            waiters: Arc::new(WaiterRegistry::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_trust_requires_secret() {
        let settings = Settings {
            trust_proxy_headers: true,
            internal_auth_secret: None,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            trust_proxy_headers: true,
            internal_auth_secret: Some("secret".into()),
            ..Settings::default()
        };
        assert!(settings.validate().is_ok());
    }
}
