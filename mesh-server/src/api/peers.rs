use crate::{
    api::{authenticate, PageResponse, PaginationQuery},
    error::ServerResult,
    repository::PeerUpdate,
    Context,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use mesh_core::{Endpoint, Label, NetworkId, Peer, PeerId, Role};
use serde::{Deserialize, Serialize};

pub fn router() -> Router<Context> {
    Router::new()
        .route("/networks/:network_id/peers", get(list).post(create))
        .route("/networks/:network_id/peers/:peer_id", get(get_one).patch(update).delete(delete))
}

#[derive(Deserialize)]
struct CreatePeerRequest {
    name: Label,
    #[serde(default)]
    endpoint: Option<Endpoint>,
    #[serde(default)]
    listen_port: Option<u16>,
    #[serde(default = "default_role")]
    role: Role,
    #[serde(default = "default_true")]
    agent_managed: bool,
}

fn default_role() -> Role {
    Role::Regular
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
struct CreatePeerResponse {
    #[serde(flatten)]
    peer: Peer,
    enrollment_token: String,
}

async fn create(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path(network_id): Path<NetworkId>,
    Json(body): Json<CreatePeerRequest>,
) -> ServerResult<(StatusCode, Json<CreatePeerResponse>)> {
    let principal = authenticate(&ctx, &headers)?;
    let (peer, enrollment_token) = ctx.service.create_peer(
        &principal,
        &network_id,
        body.name,
        body.endpoint,
        body.listen_port,
        body.role,
        body.agent_managed,
    )?;
    Ok((StatusCode::CREATED, Json(CreatePeerResponse { peer, enrollment_token })))
}

async fn list(
    State(ctx): State<Context>,
    Path(network_id): Path<NetworkId>,
    Query(pagination): Query<PaginationQuery>,
) -> ServerResult<Json<PageResponse<Peer>>> {
    let (page, page_size) = pagination.resolve();
    Ok(Json(ctx.service.list_peers(&network_id, page, page_size)?.into()))
}

async fn get_one(
    State(ctx): State<Context>,
    Path((network_id, peer_id)): Path<(NetworkId, PeerId)>,
) -> ServerResult<Json<Peer>> {
    Ok(Json(ctx.service.get_peer(&network_id, &peer_id)?))
}

async fn update(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, peer_id)): Path<(NetworkId, PeerId)>,
    Json(update): Json<PeerUpdate>,
) -> ServerResult<Json<Peer>> {
    let principal = authenticate(&ctx, &headers)?;
    Ok(Json(ctx.service.update_peer(&principal, &network_id, &peer_id, update)?))
}

async fn delete(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, peer_id)): Path<(NetworkId, PeerId)>,
) -> ServerResult<StatusCode> {
    let principal = authenticate(&ctx, &headers)?;
    ctx.service.delete_peer(&principal, &network_id, &peer_id)?;
    Ok(StatusCode::NO_CONTENT)
}
