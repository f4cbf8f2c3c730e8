use crate::{
    api::{authenticate, PageResponse, PaginationQuery},
    error::ServerResult,
    repository::GroupUpdate,
    Context,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use mesh_core::{Group, GroupContents, GroupId, NetworkId, PeerId, PolicyId, RouteId};

pub fn router() -> Router<Context> {
    Router::new()
        .route("/networks/:network_id/groups", get(list).post(create))
        .route("/networks/:network_id/groups/:group_id", get(get_one).patch(update).delete(delete))
        .route(
            "/networks/:network_id/groups/:group_id/peers/:peer_id",
            axum::routing::put(add_peer).delete(remove_peer),
        )
        .route(
            "/networks/:network_id/groups/:group_id/policies/:policy_id",
            axum::routing::put(attach_policy).delete(detach_policy),
        )
        .route(
            "/networks/:network_id/groups/:group_id/routes/:route_id",
            axum::routing::put(attach_route).delete(detach_route),
        )
}

async fn create(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path(network_id): Path<NetworkId>,
    Json(contents): Json<GroupContents>,
) -> ServerResult<(StatusCode, Json<Group>)> {
    let principal = authenticate(&ctx, &headers)?;
    let group = ctx.service.create_group(&principal, &network_id, contents)?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn list(
    State(ctx): State<Context>,
    Path(network_id): Path<NetworkId>,
    Query(pagination): Query<PaginationQuery>,
) -> ServerResult<Json<PageResponse<Group>>> {
    let (page, page_size) = pagination.resolve();
    Ok(Json(ctx.service.list_groups(&network_id, page, page_size)?.into()))
}

async fn get_one(
    State(ctx): State<Context>,
    Path((network_id, group_id)): Path<(NetworkId, GroupId)>,
) -> ServerResult<Json<Group>> {
    Ok(Json(ctx.service.get_group(&network_id, &group_id)?))
}

async fn update(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, group_id)): Path<(NetworkId, GroupId)>,
    Json(update): Json<GroupUpdate>,
) -> ServerResult<Json<Group>> {
    let principal = authenticate(&ctx, &headers)?;
    Ok(Json(ctx.service.update_group(&principal, &network_id, &group_id, update)?))
}

async fn delete(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, group_id)): Path<(NetworkId, GroupId)>,
) -> ServerResult<StatusCode> {
    let principal = authenticate(&ctx, &headers)?;
    ctx.service.delete_group(&principal, &network_id, &group_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_peer(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, group_id, peer_id)): Path<(NetworkId, GroupId, PeerId)>,
) -> ServerResult<StatusCode> {
    let principal = authenticate(&ctx, &headers)?;
    ctx.service.add_peer_to_group(&principal, &network_id, &group_id, &peer_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_peer(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, group_id, peer_id)): Path<(NetworkId, GroupId, PeerId)>,
) -> ServerResult<StatusCode> {
    let principal = authenticate(&ctx, &headers)?;
    ctx.service.remove_peer_from_group(&principal, &network_id, &group_id, &peer_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn attach_policy(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, group_id, policy_id)): Path<(NetworkId, GroupId, PolicyId)>,
) -> ServerResult<StatusCode> {
    let principal = authenticate(&ctx, &headers)?;
    ctx.service.attach_policy(&principal, &network_id, &group_id, &policy_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn detach_policy(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, group_id, policy_id)): Path<(NetworkId, GroupId, PolicyId)>,
) -> ServerResult<StatusCode> {
    let principal = authenticate(&ctx, &headers)?;
    ctx.service.detach_policy(&principal, &network_id, &group_id, &policy_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn attach_route(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, group_id, route_id)): Path<(NetworkId, GroupId, RouteId)>,
) -> ServerResult<StatusCode> {
    let principal = authenticate(&ctx, &headers)?;
    ctx.service.attach_route(&principal, &network_id, &group_id, &route_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn detach_route(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, group_id, route_id)): Path<(NetworkId, GroupId, RouteId)>,
) -> ServerResult<StatusCode> {
    let principal = authenticate(&ctx, &headers)?;
    ctx.service.detach_route(&principal, &network_id, &group_id, &route_id)?;
    Ok(StatusCode::NO_CONTENT)
}
