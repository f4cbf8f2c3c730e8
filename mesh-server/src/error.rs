//! The error hierarchy surfaced to external callers (spec.md §7).
//!
//! A single `ServerError` aggregates every failure mode the repository,
//! orchestration service, heartbeat engine, and API surface can produce,
//! the same way the teacher's `error.rs` aggregates `rusqlite::Error`,
//! `std::io::Error`, and `serde_json::Error` behind one enum. Each variant
//! maps to exactly one of the seven kinds from spec.md §7 and one HTTP
//! status code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Auth(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("prefix exhausted")]
    Exhausted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    fn status(&self) -> StatusCode {
        use ServerError::*;
        match self {
            Validation(_) => StatusCode::BAD_REQUEST,
            Auth(_) => StatusCode::UNAUTHORIZED,
            Forbidden(_) => StatusCode::FORBIDDEN,
            NotFound(_) => StatusCode::NOT_FOUND,
            Conflict(_) => StatusCode::CONFLICT,
            InvalidState(_) => StatusCode::CONFLICT,
            Exhausted => StatusCode::CONFLICT,
            Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<mesh_core::CoreError> for ServerError {
    fn from(e: mesh_core::CoreError) -> Self {
        match e {
            mesh_core::CoreError::Exhausted => ServerError::Exhausted,
            mesh_core::CoreError::NotAssignable(ip) => {
                ServerError::Validation(format!("address {ip} is not assignable"))
            },
            mesh_core::CoreError::Validation(msg) => ServerError::Validation(msg),
        }
    }
}

impl From<rusqlite::Error> for ServerError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => {
                ServerError::NotFound("no matching row".into())
            },
            rusqlite::Error::SqliteFailure(err, msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ServerError::Conflict(msg.unwrap_or_else(|| "unique constraint violated".into()))
            },
            other => {
                log::error!("database error: {other}");
                ServerError::Internal(other.to_string())
            },
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if matches!(self, ServerError::Internal(_)) {
            log::error!("internal error: {self}");
        }
        let status = self.status();
        (status, Json(ErrorEnvelope { error: self.to_string() })).into_response()
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
