//! Service error taxonomy and HTTP mapping.
//!
//! Service modules return these instead of raw status codes so they stay
//! transport-agnostic; the axum layer converts them through `IntoResponse`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Reservation held by another live holder. Carries the holder so the
    /// loser of a race can see who won.
    #[error("reservation is already held")]
    ReservationHeld {
        holder_agent_id: String,
        holder_alias: String,
        expires_at: String,
    },

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Gone(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    fn code(&self) -> &'static str {
        match self {
            Error::Unauthenticated(_) => "UNAUTHENTICATED",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) | Error::ReservationHeld { .. } => "CONFLICT",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::Gone(_) => "GONE",
            Error::Unavailable(_) => "UNAVAILABLE",
            Error::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) | Error::ReservationHeld { .. } => StatusCode::CONFLICT,
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::Gone(_) => StatusCode::GONE,
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Error::ReservationHeld {
                holder_agent_id,
                holder_alias,
                expires_at,
            } => json!({
                "error": { "code": self.code(), "message": self.to_string() },
                "holder_agent_id": holder_agent_id,
                "holder_alias": holder_alias,
                "expires_at": expires_at,
            }),
            _ => json!({
                "error": { "code": self.code(), "message": self.to_string() }
            }),
        };

        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }

        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("not found".to_string()),
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_status_codes() {
        assert_eq!(Error::Unauthenticated("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(Error::InvalidArgument("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::Gone("x".into()).status(), StatusCode::GONE);
        assert_eq!(Error::Unavailable("x".into()).status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn reservation_conflict_carries_holder() {
        let err = Error::ReservationHeld {
            holder_agent_id: "a-1".into(),
            holder_alias: "alice".into(),
            expires_at: "2026-01-01T00:00:00Z".into(),
        };
        assert_eq!(err.code(), "CONFLICT");
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }
}
