//! `meshd` control-plane server: ties together the repository (C2), the
//! orchestration service (C4), the heartbeat engine (C5), the notifier hub
//! (C6), and authentication (C7) behind one HTTP surface (C8).
//!
//! Mirrors the shape of the teacher's `Context`/`serve` pair in
//! `server::lib`, generalized from a single-network hyper service to a
//! multi-network axum `Router`.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod keys;
pub mod notify;
pub mod repository;
pub mod service;

use crate::{
    auth::Authenticator, config::ConfigFile, heartbeat::HeartbeatEngine, keys::X25519KeyPairSource,
    notify::Hub, repository::Repository, service::Service,
};
use axum::Router;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

/// Every collaborator an API handler might need, cloned cheaply (all
/// fields are `Arc`s) into each request's task — the axum analogue of the
/// teacher's `Context` struct threaded through every filter.
#[derive(Clone)]
pub struct Context {
    pub repo: Arc<dyn Repository>,
    pub service: Arc<Service>,
    pub heartbeat: Arc<HeartbeatEngine>,
    pub notifier: Arc<Hub>,
    pub authenticator: Arc<dyn Authenticator>,
}

impl Context {
    pub fn new(repo: Arc<dyn Repository>, authenticator: Arc<dyn Authenticator>) -> Self {
        let notifier = Arc::new(Hub::new());
        let keys = Arc::new(X25519KeyPairSource);
        let service = Arc::new(Service::new(repo.clone(), notifier.clone(), keys));
        let heartbeat = Arc::new(HeartbeatEngine::new(repo.clone(), service.clone()));
        Self { repo, service, heartbeat, notifier, authenticator }
    }

    /// Builds a `Context` wired for local/test use: `SqliteRepository`
    /// against an in-memory database and authentication disabled.
    pub fn in_memory_for_tests() -> Self {
        let repo: Arc<dyn Repository> =
            Arc::new(repository::SqliteRepository::open_in_memory().expect("opening :memory: db"));
        Self::new(repo, Arc::new(auth::NoAuthenticator::new()))
    }
}

/// Builds the top-level router: every `/api/v1/...` path from spec.md §4.8
/// plus request tracing, a per-request timeout, and permissive CORS for the
/// browser UI (out of scope itself, but its origin is not — spec.md §1).
pub fn router(context: Context) -> Router {
    Router::new()
        .nest("/api/v1", api::router())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
        .layer(CorsLayer::permissive())
        .with_state(context)
}

pub async fn serve(context: Context, config: &ConfigFile) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("listening on {addr}");
    axum::serve(listener, router(context).into_make_service()).await
}
