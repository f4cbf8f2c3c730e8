//! C8 — external API surface: the REST adapter translating HTTP requests
//! into C4 (orchestration)/C5 (heartbeat) operations and C3 (config
//! generator) pull responses (spec.md §4.8).
//!
//! Split by resource the way the teacher splits `api::admin::{peer, cidr,
//! association}`, generalized from warp filters to axum routers since this
//! surface serves many networks rather than exactly one.

pub mod agent;
pub mod dns;
pub mod groups;
pub mod networks;
pub mod peers;
pub mod policies;
pub mod routes;
pub mod security;

use crate::{
    auth::Principal,
    error::{ServerError, ServerResult},
    Context,
};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

pub fn router() -> axum::Router<Context> {
    axum::Router::new()
        .merge(networks::router())
        .merge(peers::router())
        .merge(groups::router())
        .merge(policies::router())
        .merge(routes::router())
        .merge(dns::router())
        .merge(security::router())
        .merge(agent::router())
}

/// Extracts and validates the caller's bearer credential against the
/// configured `Authenticator` (spec.md §4.7 "validate(bearer) → {user id,
/// role, ...}").
pub fn authenticate(ctx: &Context, headers: &HeaderMap) -> ServerResult<Principal> {
    let token = bearer_token(headers)?;
    ctx.authenticator.authenticate(token)
}

/// Resolves an agent's session credential to the peer it was issued to
/// (spec.md §4.7). Used by the agent pull/heartbeat/channel endpoints,
/// which authenticate as a peer rather than a human principal.
pub fn authenticate_agent(ctx: &Context, headers: &HeaderMap) -> ServerResult<mesh_core::Peer> {
    let token = bearer_token(headers)?;
    crate::auth::authenticate_agent(&*ctx.repo, token)
}

fn bearer_token(headers: &HeaderMap) -> ServerResult<&str> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or_else(|| ServerError::Auth("missing authorization header".into()))?
        .to_str()
        .map_err(|_| ServerError::Auth("authorization header is not valid utf-8".into()))?;
    value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ServerError::Auth("expected a bearer token".into()))
}

#[derive(Debug, Deserialize)]
pub struct PaginationQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl PaginationQuery {
    /// Defaults and clamps per spec.md §4.8: `page_size` defaults to 50,
    /// capped at 100.
    pub fn resolve(&self) -> (u32, u32) {
        let page = self.page.unwrap_or(1).max(1);
        let page_size = self.page_size.unwrap_or(50).clamp(1, 100);
        (page, page_size)
    }
}

#[derive(Serialize)]
pub struct PageResponse<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

impl<T> From<crate::repository::Page<T>> for PageResponse<T> {
    fn from(page: crate::repository::Page<T>) -> Self {
        Self { data: page.data, page: page.page, page_size: page.page_size, total: page.total }
    }
}
