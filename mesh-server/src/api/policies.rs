use crate::{
    api::{authenticate, PageResponse, PaginationQuery},
    error::ServerResult,
    repository::PolicyUpdate,
    Context,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use mesh_core::{NetworkId, Policy, PolicyContents, PolicyId, Rule};

pub fn router() -> Router<Context> {
    Router::new()
        .route("/networks/:network_id/policies", get(list).post(create))
        .route("/networks/:network_id/policies/:policy_id", get(get_one).patch(update).delete(delete))
        .route("/networks/:network_id/policies/:policy_id/rules", axum::routing::post(add_rule))
        .route("/networks/:network_id/policies/:policy_id/rules/:rule_index", axum::routing::delete(remove_rule))
}

async fn create(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path(network_id): Path<NetworkId>,
    Json(contents): Json<PolicyContents>,
) -> ServerResult<(StatusCode, Json<Policy>)> {
    let principal = authenticate(&ctx, &headers)?;
    let policy = ctx.service.create_policy(&principal, &network_id, contents)?;
    Ok((StatusCode::CREATED, Json(policy)))
}

async fn list(
    State(ctx): State<Context>,
    Path(network_id): Path<NetworkId>,
    Query(pagination): Query<PaginationQuery>,
) -> ServerResult<Json<PageResponse<Policy>>> {
    let (page, page_size) = pagination.resolve();
    Ok(Json(ctx.service.list_policies(&network_id, page, page_size)?.into()))
}

async fn get_one(
    State(ctx): State<Context>,
    Path((network_id, policy_id)): Path<(NetworkId, PolicyId)>,
) -> ServerResult<Json<Policy>> {
    Ok(Json(ctx.service.get_policy(&network_id, &policy_id)?))
}

async fn update(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, policy_id)): Path<(NetworkId, PolicyId)>,
    Json(update): Json<PolicyUpdate>,
) -> ServerResult<Json<Policy>> {
    let principal = authenticate(&ctx, &headers)?;
    Ok(Json(ctx.service.update_policy(&principal, &network_id, &policy_id, update)?))
}

async fn delete(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, policy_id)): Path<(NetworkId, PolicyId)>,
) -> ServerResult<StatusCode> {
    let principal = authenticate(&ctx, &headers)?;
    ctx.service.delete_policy(&principal, &network_id, &policy_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_rule(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, policy_id)): Path<(NetworkId, PolicyId)>,
    Json(rule): Json<Rule>,
) -> ServerResult<(StatusCode, Json<Policy>)> {
    let principal = authenticate(&ctx, &headers)?;
    let policy = ctx.service.add_rule(&principal, &network_id, &policy_id, rule)?;
    Ok((StatusCode::CREATED, Json(policy)))
}

async fn remove_rule(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, policy_id, rule_index)): Path<(NetworkId, PolicyId, usize)>,
) -> ServerResult<Json<Policy>> {
    let principal = authenticate(&ctx, &headers)?;
    Ok(Json(ctx.service.remove_rule(&principal, &network_id, &policy_id, rule_index)?))
}
