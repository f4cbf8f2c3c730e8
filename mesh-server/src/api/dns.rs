use crate::{
    api::{authenticate, PageResponse, PaginationQuery},
    error::ServerResult,
    repository::DnsRecordUpdate,
    Context,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use mesh_core::{DnsRecord, DnsRecordContents, DnsRecordId, NetworkId, RouteId};

pub fn router() -> Router<Context> {
    Router::new()
        .route("/networks/:network_id/routes/:route_id/dns", get(list).post(create))
        .route(
            "/networks/:network_id/routes/:route_id/dns/:record_id",
            get(get_one).patch(update).delete(delete),
        )
}

async fn create(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, route_id)): Path<(NetworkId, RouteId)>,
    Json(contents): Json<DnsRecordContents>,
) -> ServerResult<(StatusCode, Json<DnsRecord>)> {
    let principal = authenticate(&ctx, &headers)?;
    let record = ctx.service.create_dns_record(&principal, &network_id, &route_id, contents)?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list(
    State(ctx): State<Context>,
    Path((_network_id, route_id)): Path<(NetworkId, RouteId)>,
    Query(pagination): Query<PaginationQuery>,
) -> ServerResult<Json<PageResponse<DnsRecord>>> {
    let (page, page_size) = pagination.resolve();
    Ok(Json(ctx.service.list_dns_records(&route_id, page, page_size)?.into()))
}

async fn get_one(
    State(ctx): State<Context>,
    Path((_network_id, route_id, record_id)): Path<(NetworkId, RouteId, DnsRecordId)>,
) -> ServerResult<Json<DnsRecord>> {
    Ok(Json(ctx.service.get_dns_record(&route_id, &record_id)?))
}

async fn update(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, route_id, record_id)): Path<(NetworkId, RouteId, DnsRecordId)>,
    Json(update): Json<DnsRecordUpdate>,
) -> ServerResult<Json<DnsRecord>> {
    let principal = authenticate(&ctx, &headers)?;
    Ok(Json(ctx.service.update_dns_record(&principal, &network_id, &route_id, &record_id, update)?))
}

async fn delete(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Path((network_id, route_id, record_id)): Path<(NetworkId, RouteId, DnsRecordId)>,
) -> ServerResult<StatusCode> {
    let principal = authenticate(&ctx, &headers)?;
    ctx.service.delete_dns_record(&principal, &network_id, &route_id, &record_id)?;
    Ok(StatusCode::NO_CONTENT)
}
