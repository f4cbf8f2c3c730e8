use crate::{
    api::{authenticate, PageResponse, PaginationQuery},
    error::ServerResult,
    repository::SecurityConfigUpdate,
    Context,
};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::get,
    Json, Router,
};
use mesh_core::{IncidentId, NetworkId, SecurityConfig, SecurityIncident};

pub fn router() -> Router<Context> {
    Router::new()
        .route("/networks/:network_id/security-config", get(get_config).patch(update_config))
        .route("/networks/:network_id/incidents", get(list_incidents))
        .route("/networks/:network_id/incidents/:incident_id", get(get_incident))
        .route(
            "/networks/:network_id/incidents/:incident_id/resolve",
            axum::routing::post(resolve_incident),
        )
}

async fn get_config(
    State(ctx): State<Context>,
    Path(network_id): Path<NetworkId>,
) -> ServerResult<Json<SecurityConfig>> {
    Ok(Json(ctx.service.get_security_config(&network_id)?))
}

async fn update_config(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path(network_id): Path<NetworkId>,
    Json(update): Json<SecurityConfigUpdate>,
) -> ServerResult<Json<SecurityConfig>> {
    let principal = authenticate(&ctx, &headers)?;
    Ok(Json(ctx.service.update_security_config(&principal, &network_id, update)?))
}

async fn list_incidents(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path(network_id): Path<NetworkId>,
    Query(pagination): Query<PaginationQuery>,
) -> ServerResult<Json<PageResponse<SecurityIncident>>> {
    authenticate(&ctx, &headers)?;
    let (page, page_size) = pagination.resolve();
    let page = ctx.service.list_incidents(&network_id, page, page_size)?;
    Ok(Json(page.into()))
}

async fn get_incident(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, incident_id)): Path<(NetworkId, IncidentId)>,
) -> ServerResult<Json<SecurityIncident>> {
    authenticate(&ctx, &headers)?;
    Ok(Json(ctx.service.get_incident(&network_id, &incident_id)?))
}

async fn resolve_incident(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, incident_id)): Path<(NetworkId, IncidentId)>,
) -> ServerResult<Json<SecurityIncident>> {
    let principal = authenticate(&ctx, &headers)?;
    Ok(Json(ctx.service.resolve_incident(&principal, &network_id, &incident_id)?))
}
