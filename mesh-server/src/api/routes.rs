use crate::{
    api::{authenticate, PageResponse, PaginationQuery},
    error::ServerResult,
    repository::RouteUpdate,
    Context,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use mesh_core::{NetworkId, Route, RouteContents, RouteId};

pub fn router() -> Router<Context> {
    Router::new()
        .route("/networks/:network_id/routes", get(list).post(create))
        .route("/networks/:network_id/routes/:route_id", get(get_one).patch(update).delete(delete))
}

async fn create(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path(network_id): Path<NetworkId>,
    Json(contents): Json<RouteContents>,
) -> ServerResult<(StatusCode, Json<Route>)> {
    let principal = authenticate(&ctx, &headers)?;
    let route = ctx.service.create_route(&principal, &network_id, contents)?;
    Ok((StatusCode::CREATED, Json(route)))
}

async fn list(
    State(ctx): State<Context>,
    Path(network_id): Path<NetworkId>,
    Query(pagination): Query<PaginationQuery>,
) -> ServerResult<Json<PageResponse<Route>>> {
    let (page, page_size) = pagination.resolve();
    Ok(Json(ctx.service.list_routes(&network_id, page, page_size)?.into()))
}

async fn get_one(
    State(ctx): State<Context>,
    Path((network_id, route_id)): Path<(NetworkId, RouteId)>,
) -> ServerResult<Json<Route>> {
    Ok(Json(ctx.service.get_route(&network_id, &route_id)?))
}

async fn update(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, route_id)): Path<(NetworkId, RouteId)>,
    Json(update): Json<RouteUpdate>,
) -> ServerResult<Json<Route>> {
    let principal = authenticate(&ctx, &headers)?;
    Ok(Json(ctx.service.update_route(&principal, &network_id, &route_id, update)?))
}

async fn delete(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, route_id)): Path<(NetworkId, RouteId)>,
) -> ServerResult<StatusCode> {
    let principal = authenticate(&ctx, &headers)?;
    ctx.service.delete_route(&principal, &network_id, &route_id)?;
    Ok(StatusCode::NO_CONTENT)
}
