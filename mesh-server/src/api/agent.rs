//! Agent-facing endpoints (spec.md §6): enrollment, config pull,
//! heartbeat, and the persistent refresh channel. These authenticate as
//! a peer via its session credential rather than as a human principal —
//! the teacher's equivalent is the plain-HTTP `GET /fetch`/`POST
//! /user-endpoint` pair its agent polls; here it's complemented by a
//! websocket push so an agent need not poll on a fixed interval.

use crate::{
    error::{ServerError, ServerResult},
    heartbeat::HeartbeatInput,
    notify::RefreshEvent,
    Context,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use mesh_core::{codegen::NetworkView, Peer, Role};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

pub fn router() -> Router<Context> {
    Router::new()
        .route("/agent/enroll", post(enroll))
        .route("/agent/config", get(pull_config))
        .route("/agent/heartbeat", post(heartbeat))
        .route("/agent/channel", get(channel))
}

#[derive(Deserialize)]
struct EnrollRequest {
    enrollment_token: String,
}

#[derive(Serialize)]
struct EnrollResponse {
    network_id: mesh_core::NetworkId,
    peer_id: mesh_core::PeerId,
    session_credential: String,
}

async fn enroll(
    State(ctx): State<Context>,
    Json(body): Json<EnrollRequest>,
) -> ServerResult<Json<EnrollResponse>> {
    let (network_id, peer_id, session_credential) =
        crate::auth::enroll(&*ctx.repo, &body.enrollment_token)?;
    Ok(Json(EnrollResponse { network_id, peer_id, session_credential }))
}

#[derive(Serialize)]
struct DnsSection {
    ip: std::net::IpAddr,
    domain: String,
    peers: Vec<mesh_core::codegen::DnsEntry>,
    upstream_servers: Vec<String>,
}

#[derive(Serialize)]
struct PolicySection {
    ip: std::net::IpAddr,
    iptables_rules: Vec<String>,
    peers: Vec<mesh_core::codegen::PolicyPeerEntry>,
}

#[derive(Serialize)]
struct ConfigPullResponse {
    wireguard_config: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dns: Option<DnsSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    policy: Option<PolicySection>,
}

async fn pull_config(
    State(ctx): State<Context>,
    headers: HeaderMap,
) -> ServerResult<Json<ConfigPullResponse>> {
    let peer = super::authenticate_agent(&ctx, &headers)?;
    let view = load_network_view(&ctx, &peer.network_id)?;

    let wireguard_config = view.view().tunnel_config(&peer.id).map_err(ServerError::from)?;

    let dns = if peer.role == Role::Jump {
        let output = view.view().dns_view(&peer.id).map_err(ServerError::from)?;
        Some(DnsSection {
            ip: output.ip,
            domain: output.domain,
            peers: output.records,
            upstream_servers: output.upstream_servers,
        })
    } else {
        None
    };

    let policy = if peer.agent_managed {
        let output = if peer.role == Role::Jump {
            view.view().firewall_view(&peer.id).map_err(ServerError::from)?
        } else {
            view.view().empty_firewall_view(&peer.id).map_err(ServerError::from)?
        };
        Some(PolicySection { ip: output.ip, iptables_rules: output.iptables_rules, peers: output.peers })
    } else {
        None
    };

    Ok(Json(ConfigPullResponse { wireguard_config, dns, policy }))
}

#[derive(Deserialize)]
struct HeartbeatRequest {
    hostname: String,
    system_uptime: u64,
    wireguard_uptime: u64,
    peer_endpoints: std::collections::HashMap<String, mesh_core::Endpoint>,
}

async fn heartbeat(
    State(ctx): State<Context>,
    headers: HeaderMap,
    Json(body): Json<HeartbeatRequest>,
) -> ServerResult<axum::http::StatusCode> {
    let peer = super::authenticate_agent(&ctx, &headers)?;
    let input = HeartbeatInput {
        peer_id: peer.id.clone(),
        hostname: body.hostname,
        system_uptime: body.system_uptime,
        tunnel_uptime: body.wireguard_uptime,
        peer_endpoints: body.peer_endpoints,
    };
    ctx.heartbeat.process(&peer.network_id, input, SystemTime::now());
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn channel(State(ctx): State<Context>, headers: HeaderMap, ws: WebSocketUpgrade) -> ServerResult<Response> {
    let peer = super::authenticate_agent(&ctx, &headers)?;
    Ok(ws.on_upgrade(move |socket| pump(socket, ctx, peer)))
}

/// Registers the connection, then relays refresh events until the agent
/// disconnects or is superseded by a new registration for the same key
/// (spec.md §5 "cancelled when... superseded by a new registration").
async fn pump(mut socket: WebSocket, ctx: Context, peer: Peer) {
    let mut rx = ctx.notifier.register(peer.network_id.clone(), peer.id.clone());
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(RefreshEvent) => {
                        let payload = serde_json::json!({ "kind": "refresh" }).to_string();
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    },
                    None => break,
                }
            },
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {},
                }
            },
        }
    }
    ctx.notifier.unregister(&peer.network_id, &peer.id);
}

/// Everything a config pull needs, gathered in one pass of repository
/// reads (spec.md §4.3 "gathered by the caller from repository reads").
struct LoadedNetworkView {
    network: mesh_core::Network,
    peers: Vec<Peer>,
    groups: Vec<mesh_core::Group>,
    policies: Vec<mesh_core::Policy>,
    routes: Vec<mesh_core::Route>,
    dns_records: Vec<mesh_core::DnsRecord>,
    pairs: Vec<mesh_core::PeerPair>,
}

impl LoadedNetworkView {
    fn view(&self) -> NetworkView<'_> {
        NetworkView {
            network: &self.network,
            peers: &self.peers,
            groups: &self.groups,
            policies: &self.policies,
            routes: &self.routes,
            dns_records: &self.dns_records,
            pairs: &self.pairs,
        }
    }
}

fn load_network_view(ctx: &Context, network_id: &mesh_core::NetworkId) -> ServerResult<LoadedNetworkView> {
    Ok(LoadedNetworkView {
        network: ctx.repo.get_network(network_id)?,
        peers: ctx.repo.list_peers(network_id)?,
        groups: ctx.repo.list_groups(network_id)?,
        policies: ctx.repo.list_policies(network_id)?,
        routes: ctx.repo.list_routes(network_id)?,
        dns_records: ctx.repo.list_dns_records_for_network(network_id)?,
        pairs: ctx.repo.all_peer_pairs(network_id)?,
    })
}
