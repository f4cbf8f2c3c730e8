use crate::{
    api::{authenticate, PageResponse, PaginationQuery},
    error::ServerResult,
    repository::NetworkUpdate,
    Context,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, put},
    Json, Router,
};
use mesh_core::{Network, NetworkContents, NetworkId};
use serde::Deserialize;

pub fn router() -> Router<Context> {
    Router::new()
        .route("/networks", get(list).post(create))
        .route("/networks/:network_id", get(get_one).patch(update))
        .route("/networks/:network_id/cidr", put(change_cidr))
}

async fn create(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Json(contents): Json<NetworkContents>,
) -> ServerResult<(StatusCode, Json<Network>)> {
    let principal = authenticate(&ctx, &headers)?;
    let network = ctx.service.create_network(&principal, contents)?;
    Ok((StatusCode::CREATED, Json(network)))
}

async fn list(
    State(ctx): State<Context>,
    Query(pagination): Query<PaginationQuery>,
) -> ServerResult<Json<PageResponse<Network>>> {
    let (page, page_size) = pagination.resolve();
    Ok(Json(ctx.service.list_networks(page, page_size)?.into()))
}

async fn get_one(
    State(ctx): State<Context>,
    Path(network_id): Path<NetworkId>,
) -> ServerResult<Json<Network>> {
    Ok(Json(ctx.service.get_network(&network_id)?))
}

async fn update(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path(network_id): Path<NetworkId>,
    Json(update): Json<NetworkUpdate>,
) -> ServerResult<Json<Network>> {
    let principal = authenticate(&ctx, &headers)?;
    Ok(Json(ctx.service.update_network(&principal, &network_id, update)?))
}

#[derive(Deserialize)]
struct ChangeCidrRequest {
    cidr: ipnet::IpNet,
}

async fn change_cidr(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path(network_id): Path<NetworkId>,
    Json(body): Json<ChangeCidrRequest>,
) -> ServerResult<Json<Network>> {
    let principal = authenticate(&ctx, &headers)?;
    Ok(Json(ctx.service.change_network_cidr(&principal, &network_id, body.cidr)?))
}
