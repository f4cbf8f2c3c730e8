//! The production `Repository` implementation: hand-written SQL over
//! `rusqlite`, no ORM, in the teacher's `db/{cidr,peer,association}.rs`
//! style — one `CREATE TABLE` per entity as a associated `const`, and a
//! `from_row` decoder per query shape. Persistent layout follows spec.md
//! §6: one logical table per entity, indexed by `(network_id, id)` and
//! `(network_id, name)`, plus join tables for group↔peer, group↔policy
//! (ordered), group↔route, and peer↔peer preshared keys.

use super::{
    DnsRecordUpdate, GroupUpdate, NetworkUpdate, NewIncident, NewPeer, Page, PeerUpdate,
    PolicyUpdate, Repository, RouteUpdate, SecurityConfigUpdate,
};
use crate::error::{ServerError, ServerResult};
use ipnet::IpNet;
use mesh_core::{
    AgentSession, DnsRecord, DnsRecordContents, DnsRecordId, Direction, Endpoint,
    EndpointChangeRecord, EndpointSource, Group, GroupContents, GroupId, IncidentId, IncidentKind,
    Network, NetworkContents, NetworkId, Peer, PeerContents, PeerId, PeerPair, Policy,
    PolicyContents, PolicyId, Role, Route, RouteContents, RouteId, Rule, RuleAction,
    SecurityConfig, SecurityIncident, TargetKind, UserId,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::{
    net::IpAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS networks (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    cidr TEXT NOT NULL,
    domain_suffix TEXT NOT NULL,
    upstream_dns TEXT NOT NULL DEFAULT '[]',
    default_group_ids TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS peers (
    id TEXT PRIMARY KEY,
    network_id TEXT NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    public_key TEXT NOT NULL,
    private_key TEXT NOT NULL,
    address TEXT NOT NULL,
    endpoint TEXT,
    listen_port INTEGER,
    role TEXT NOT NULL,
    agent_managed INTEGER NOT NULL,
    owner_user_id TEXT,
    enrollment_token_hash TEXT,
    enrollment_consumed INTEGER NOT NULL DEFAULT 0,
    session_credential_hash TEXT,
    whitelist TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(network_id, name),
    UNIQUE(network_id, address),
    UNIQUE(network_id, public_key)
);
CREATE TABLE IF NOT EXISTS peer_pairs (
    network_id TEXT NOT NULL,
    peer_id_1 TEXT NOT NULL,
    peer_id_2 TEXT NOT NULL,
    preshared_key TEXT NOT NULL,
    PRIMARY KEY (network_id, peer_id_1, peer_id_2)
);
CREATE TABLE IF NOT EXISTS groups (
    id TEXT PRIMARY KEY,
    network_id TEXT NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    priority INTEGER NOT NULL,
    UNIQUE(network_id, name)
);
CREATE TABLE IF NOT EXISTS group_peers (
    group_id TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
    peer_id TEXT NOT NULL,
    PRIMARY KEY (group_id, peer_id)
);
CREATE TABLE IF NOT EXISTS group_policies (
    group_id TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
    policy_id TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    PRIMARY KEY (group_id, policy_id)
);
CREATE TABLE IF NOT EXISTS group_routes (
    group_id TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
    route_id TEXT NOT NULL,
    PRIMARY KEY (group_id, route_id)
);
CREATE TABLE IF NOT EXISTS policies (
    id TEXT PRIMARY KEY,
    network_id TEXT NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    UNIQUE(network_id, name)
);
CREATE TABLE IF NOT EXISTS policy_rules (
    policy_id TEXT NOT NULL REFERENCES policies(id) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    direction TEXT NOT NULL,
    action TEXT NOT NULL,
    target TEXT NOT NULL,
    target_kind TEXT NOT NULL,
    description TEXT,
    PRIMARY KEY (policy_id, ordinal)
);
CREATE TABLE IF NOT EXISTS routes (
    id TEXT PRIMARY KEY,
    network_id TEXT NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    destination_cidr TEXT NOT NULL,
    jump_peer_id TEXT NOT NULL,
    domain_suffix TEXT,
    UNIQUE(network_id, name)
);
CREATE TABLE IF NOT EXISTS dns_records (
    id TEXT PRIMARY KEY,
    route_id TEXT NOT NULL REFERENCES routes(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    ip TEXT NOT NULL,
    UNIQUE(route_id, name)
);
CREATE TABLE IF NOT EXISTS security_configs (
    network_id TEXT PRIMARY KEY REFERENCES networks(id) ON DELETE CASCADE,
    enabled INTEGER NOT NULL,
    session_conflict_threshold_secs INTEGER NOT NULL,
    endpoint_change_threshold_secs INTEGER NOT NULL,
    max_endpoint_changes_per_day INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS security_incidents (
    id TEXT PRIMARY KEY,
    network_id TEXT NOT NULL REFERENCES networks(id) ON DELETE CASCADE,
    peer_id TEXT NOT NULL,
    public_key_at_detection TEXT NOT NULL,
    kind TEXT NOT NULL,
    detected_at INTEGER NOT NULL,
    endpoints_involved TEXT NOT NULL DEFAULT '[]',
    detail TEXT NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    resolved_by TEXT,
    resolved_at INTEGER
);
CREATE TABLE IF NOT EXISTS agent_sessions (
    network_id TEXT NOT NULL,
    peer_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    hostname TEXT NOT NULL,
    system_uptime INTEGER NOT NULL,
    tunnel_uptime INTEGER NOT NULL,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    reported_endpoint TEXT,
    PRIMARY KEY (network_id, peer_id, hostname)
);
CREATE TABLE IF NOT EXISTS endpoint_change_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    network_id TEXT NOT NULL,
    peer_id TEXT NOT NULL,
    old_endpoint TEXT,
    new_endpoint TEXT,
    changed_at INTEGER NOT NULL,
    source TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_endpoint_changes_peer ON endpoint_change_records(network_id, peer_id, changed_at);
";

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn to_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn from_secs(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

fn opt_endpoint(s: Option<String>) -> Option<Endpoint> {
    s.and_then(|s| s.parse().ok())
}

impl SqliteRepository {
    pub fn open(path: &std::path::Path) -> ServerResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ServerError::Internal(format!("opening database: {e}")))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> ServerResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ServerError::Internal(format!("opening in-memory database: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> ServerResult<Self> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn network_row(row: &Row) -> rusqlite::Result<Network> {
        let upstream_dns: String = row.get(4)?;
        let default_group_ids: String = row.get(5)?;
        Ok(Network {
            id: NetworkId::from(row.get::<_, String>(0)?),
            contents: NetworkContents {
                name: row.get::<_, String>(1)?.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
                cidr: row.get::<_, String>(2)?.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
                domain_suffix: row.get::<_, String>(3)?.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
                upstream_dns: serde_json::from_str(&upstream_dns).unwrap_or_default(),
                default_group_ids: serde_json::from_str::<Vec<String>>(&default_group_ids)
                    .unwrap_or_default()
                    .into_iter()
                    .map(GroupId::from)
                    .collect(),
            },
            created_at: from_secs(row.get(6)?),
            updated_at: from_secs(row.get(7)?),
        })
    }

    fn peer_row(row: &Row) -> rusqlite::Result<Peer> {
        let role: String = row.get(8)?;
        Ok(Peer {
            id: PeerId::from(row.get::<_, String>(0)?),
            network_id: NetworkId::from(row.get::<_, String>(1)?),
            contents: PeerContents {
                name: row.get::<_, String>(2)?.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
                public_key: row.get(3)?,
                private_key: row.get(4)?,
                address: row.get::<_, String>(5)?.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
                endpoint: opt_endpoint(row.get(6)?),
                listen_port: row.get(7)?,
                role: if role == "jump" { Role::Jump } else { Role::Regular },
                agent_managed: row.get(9)?,
                owner_user_id: row.get::<_, Option<String>>(10)?.map(UserId::from),
                group_ids: vec![],
            },
            created_at: from_secs(row.get(11)?),
            updated_at: from_secs(row.get(12)?),
        })
    }

    /// Peers store no normalized `group_ids` column (group membership is
    /// the `group_peers` join table); this fills the in-memory
    /// convenience field used by the config generator and API responses.
    fn hydrate_peer_group_ids(&self, conn: &Connection, peer: &mut Peer) -> rusqlite::Result<()> {
        let mut stmt = conn.prepare_cached("SELECT group_id FROM group_peers WHERE peer_id = ?1")?;
        let ids = stmt
            .query_map(params![peer.id.as_str()], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        peer.contents.group_ids = ids.into_iter().map(GroupId::from).collect();
        Ok(())
    }

    fn group_row(conn: &Connection, row: &Row) -> rusqlite::Result<Group> {
        let id: String = row.get(0)?;
        let mut stmt = conn.prepare_cached("SELECT peer_id FROM group_peers WHERE group_id = ?1")?;
        let peer_ids = stmt
            .query_map(params![id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(PeerId::from)
            .collect();
        let mut stmt =
            conn.prepare_cached("SELECT policy_id FROM group_policies WHERE group_id = ?1 ORDER BY ordinal")?;
        let policy_ids = stmt
            .query_map(params![id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(PolicyId::from)
            .collect();
        let mut stmt = conn.prepare_cached("SELECT route_id FROM group_routes WHERE group_id = ?1")?;
        let route_ids = stmt
            .query_map(params![id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(RouteId::from)
            .collect();

        Ok(Group {
            id: GroupId::from(id),
            network_id: NetworkId::from(row.get::<_, String>(1)?),
            contents: GroupContents {
                name: row.get::<_, String>(2)?.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
                description: row.get(3)?,
                priority: row.get(4)?,
                peer_ids,
                policy_ids,
                route_ids,
            },
        })
    }

    fn policy_row(conn: &Connection, row: &Row) -> rusqlite::Result<Policy> {
        let id: String = row.get(0)?;
        let mut stmt = conn.prepare_cached(
            "SELECT direction, action, target, target_kind, description FROM policy_rules WHERE policy_id = ?1 ORDER BY ordinal",
        )?;
        let rules = stmt
            .query_map(params![id], |r| {
                let direction: String = r.get(0)?;
                let action: String = r.get(1)?;
                let target_kind: String = r.get(3)?;
                Ok(Rule {
                    direction: if direction == "input" { Direction::Input } else { Direction::Output },
                    action: if action == "allow" { RuleAction::Allow } else { RuleAction::Deny },
                    target: r.get(2)?,
                    target_kind: match target_kind.as_str() {
                        "cidr" => TargetKind::Cidr,
                        "peer" => TargetKind::Peer,
                        _ => TargetKind::Group,
                    },
                    description: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Policy {
            id: PolicyId::from(id),
            network_id: NetworkId::from(row.get::<_, String>(1)?),
            contents: PolicyContents {
                name: row.get::<_, String>(2)?.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
                description: row.get(3)?,
                rules,
            },
        })
    }

    fn route_row(row: &Row) -> rusqlite::Result<Route> {
        Ok(Route {
            id: RouteId::from(row.get::<_, String>(0)?),
            network_id: NetworkId::from(row.get::<_, String>(1)?),
            contents: RouteContents {
                name: row.get::<_, String>(2)?.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
                destination_cidr: row.get::<_, String>(3)?.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
                jump_peer_id: PeerId::from(row.get::<_, String>(4)?),
                domain_suffix: row.get::<_, Option<String>>(5)?.and_then(|s| s.parse().ok()),
            },
        })
    }

    fn dns_row(row: &Row) -> rusqlite::Result<DnsRecord> {
        Ok(DnsRecord {
            id: DnsRecordId::from(row.get::<_, String>(0)?),
            route_id: RouteId::from(row.get::<_, String>(1)?),
            contents: DnsRecordContents {
                name: row.get::<_, String>(2)?.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
                ip: row.get::<_, String>(3)?.parse().map_err(|_| rusqlite::Error::InvalidQuery)?,
            },
        })
    }

    fn incident_row(row: &Row) -> rusqlite::Result<SecurityIncident> {
        let kind: String = row.get(4)?;
        let endpoints: String = row.get(6)?;
        Ok(SecurityIncident {
            id: IncidentId::from(row.get::<_, String>(0)?),
            network_id: NetworkId::from(row.get::<_, String>(1)?),
            peer_id: PeerId::from(row.get::<_, String>(2)?),
            public_key_at_detection: row.get(3)?,
            kind: match kind.as_str() {
                "session_conflict" => IncidentKind::SessionConflict,
                "shared_config" => IncidentKind::SharedConfig,
                _ => IncidentKind::SuspiciousActivity,
            },
            detected_at: from_secs(row.get(5)?),
            endpoints_involved: serde_json::from_str::<Vec<String>>(&endpoints)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            detail: row.get(7)?,
            resolved: row.get(8)?,
            resolved_by: row.get(9)?,
            resolved_at: row.get::<_, Option<i64>>(10)?.map(from_secs),
        })
    }

    fn session_row(row: &Row) -> rusqlite::Result<AgentSession> {
        Ok(AgentSession {
            network_id: NetworkId::from(row.get::<_, String>(0)?),
            peer_id: PeerId::from(row.get::<_, String>(1)?),
            session_id: row.get(2)?,
            hostname: row.get(3)?,
            system_uptime: row.get::<_, i64>(4)? as u64,
            tunnel_uptime: row.get::<_, i64>(5)? as u64,
            first_seen: from_secs(row.get(6)?),
            last_seen: from_secs(row.get(7)?),
            reported_endpoint: opt_endpoint(row.get(8)?),
        })
    }

    fn endpoint_change_row(row: &Row) -> rusqlite::Result<EndpointChangeRecord> {
        let source: String = row.get(5)?;
        Ok(EndpointChangeRecord {
            network_id: NetworkId::from(row.get::<_, String>(0)?),
            peer_id: PeerId::from(row.get::<_, String>(1)?),
            old_endpoint: opt_endpoint(row.get(2)?),
            new_endpoint: opt_endpoint(row.get(3)?),
            changed_at: from_secs(row.get(4)?),
            source: if source == "wireguard" {
                EndpointSource::WireGuard
            } else {
                EndpointSource::Peer(PeerId::from(source))
            },
        })
    }

    fn encode_source(source: &EndpointSource) -> String {
        match source {
            EndpointSource::WireGuard => "wireguard".to_string(),
            EndpointSource::Peer(id) => id.to_string(),
        }
    }
}

impl Repository for SqliteRepository {
    // ---------------------------------------------------------------- networks
    fn create_network(&self, contents: NetworkContents) -> ServerResult<Network> {
        let conn = self.conn.lock();
        let id = NetworkId::new();
        let now = now_secs();
        conn.execute(
            "INSERT INTO networks (id, name, cidr, domain_suffix, upstream_dns, default_group_ids, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                id.as_str(),
                contents.name.as_str(),
                contents.cidr.to_string(),
                contents.domain_suffix.as_str(),
                serde_json::to_string(&contents.upstream_dns).unwrap(),
                serde_json::to_string(&contents.default_group_ids.iter().map(|g| g.to_string()).collect::<Vec<_>>()).unwrap(),
                now,
            ],
        )?;
        Ok(Network { id, contents, created_at: from_secs(now), updated_at: from_secs(now) })
    }

    fn get_network(&self, id: &NetworkId) -> ServerResult<Network> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, cidr, domain_suffix, upstream_dns, default_group_ids, created_at, updated_at FROM networks WHERE id = ?1",
            params![id.as_str()],
            Self::network_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => ServerError::NotFound(format!("network {id}")),
            e => e.into(),
        })
    }

    fn find_network_by_name(&self, name: &str) -> ServerResult<Option<Network>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id, name, cidr, domain_suffix, upstream_dns, default_group_ids, created_at, updated_at FROM networks WHERE name = ?1",
                params![name],
                Self::network_row,
            )
            .optional()?)
    }

    fn list_networks(&self) -> ServerResult<Vec<Network>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, cidr, domain_suffix, upstream_dns, default_group_ids, created_at, updated_at FROM networks ORDER BY name",
        )?;
        Ok(stmt.query_map(params![], Self::network_row)?.collect::<Result<_, _>>()?)
    }

    fn update_network(&self, id: &NetworkId, update: NetworkUpdate) -> ServerResult<Network> {
        let conn = self.conn.lock();
        let mut net = conn.query_row(
            "SELECT id, name, cidr, domain_suffix, upstream_dns, default_group_ids, created_at, updated_at FROM networks WHERE id = ?1",
            params![id.as_str()],
            Self::network_row,
        )?;
        if let Some(name) = update.name {
            net.contents.name = name;
        }
        if let Some(suffix) = update.domain_suffix {
            net.contents.domain_suffix = suffix;
        }
        if let Some(dns) = update.upstream_dns {
            net.contents.upstream_dns = dns;
        }
        if let Some(groups) = update.default_group_ids {
            net.contents.default_group_ids = groups;
        }
        let now = now_secs();
        conn.execute(
            "UPDATE networks SET name = ?1, domain_suffix = ?2, upstream_dns = ?3, default_group_ids = ?4, updated_at = ?5 WHERE id = ?6",
            params![
                net.contents.name.as_str(),
                net.contents.domain_suffix.as_str(),
                serde_json::to_string(&net.contents.upstream_dns).unwrap(),
                serde_json::to_string(&net.contents.default_group_ids.iter().map(|g| g.to_string()).collect::<Vec<_>>()).unwrap(),
                now,
                id.as_str(),
            ],
        )?;
        net.updated_at = from_secs(now);
        Ok(net)
    }

    fn change_network_cidr(&self, id: &NetworkId, new_cidr: IpNet) -> ServerResult<Network> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let static_count: u32 = tx.query_row(
            "SELECT COUNT(*) FROM peers WHERE network_id = ?1 AND role = 'regular' AND agent_managed = 0",
            params![id.as_str()],
            |r| r.get(0),
        )?;
        if static_count > 0 {
            return Err(ServerError::InvalidState(
                "cannot change cidr: network has a statically configured regular peer".into(),
            ));
        }

        let mut stmt = tx.prepare("SELECT id, address FROM peers WHERE network_id = ?1")?;
        let raw: Vec<(String, String)> = stmt
            .query_map(params![id.as_str()], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        let peers: Vec<(String, IpAddr)> = raw
            .into_iter()
            .map(|(peer_id, address)| {
                address
                    .parse()
                    .map(|ip| (peer_id, ip))
                    .map_err(|_| ServerError::Internal("corrupt peer address".into()))
            })
            .collect::<ServerResult<_>>()?;

        let mut allocated = std::collections::BTreeSet::new();
        for (peer_id, _) in &peers {
            let ip = mesh_core::ipam::acquire_host(&new_cidr, &allocated)?;
            allocated.insert(ip);
            tx.execute(
                "UPDATE peers SET address = ?1, updated_at = ?2 WHERE id = ?3",
                params![ip.to_string(), now_secs(), peer_id],
            )?;
        }

        let now = now_secs();
        tx.execute(
            "UPDATE networks SET cidr = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_cidr.to_string(), now, id.as_str()],
        )?;
        tx.commit()?;
        drop(conn);
        self.get_network(id)
    }

    // ------------------------------------------------------------------ peers
    fn create_peer(&self, network_id: &NetworkId, new: NewPeer) -> ServerResult<Peer> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let cidr: String = tx.query_row(
            "SELECT cidr FROM networks WHERE id = ?1",
            params![network_id.as_str()],
            |r| r.get(0),
        )?;
        let cidr: IpNet = cidr.parse().map_err(|_| ServerError::Internal("corrupt network cidr".into()))?;

        let mut stmt = tx.prepare("SELECT address FROM peers WHERE network_id = ?1")?;
        let raw_addresses: Vec<String> =
            stmt.query_map(params![network_id.as_str()], |r| r.get::<_, String>(0))?.collect::<Result<_, _>>()?;
        drop(stmt);
        let allocated: std::collections::BTreeSet<IpAddr> = raw_addresses
            .into_iter()
            .map(|s| s.parse().map_err(|_| ServerError::Internal("corrupt peer address".into())))
            .collect::<ServerResult<_>>()?;

        let address = mesh_core::ipam::acquire_host(&cidr, &allocated)?;

        let id = PeerId::new();
        let now = now_secs();
        tx.execute(
            "INSERT INTO peers (id, network_id, name, public_key, private_key, address, endpoint, listen_port, role, agent_managed, owner_user_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                id.as_str(),
                network_id.as_str(),
                new.name.as_str(),
                new.public_key,
                new.private_key,
                address.to_string(),
                new.endpoint.as_ref().map(|e| e.to_string()),
                new.listen_port,
                if new.role == Role::Jump { "jump" } else { "regular" },
                new.agent_managed,
                new.owner_user_id.as_ref().map(|u| u.to_string()),
                now,
            ],
        )?;

        let mut stmt = tx.prepare("SELECT id FROM peers WHERE network_id = ?1 AND id != ?2")?;
        let existing_ids: Vec<String> =
            stmt.query_map(params![network_id.as_str(), id.as_str()], |r| r.get(0))?.collect::<Result<_, _>>()?;
        drop(stmt);
        for other in &existing_ids {
            let (a, b) = PeerPair::normalize(id.clone(), PeerId::from(other.clone()));
            let psk = generate_preshared_key();
            tx.execute(
                "INSERT INTO peer_pairs (network_id, peer_id_1, peer_id_2, preshared_key) VALUES (?1, ?2, ?3, ?4)",
                params![network_id.as_str(), a.as_str(), b.as_str(), psk],
            )?;
        }

        if !new.owner_is_admin {
            let default_group_ids: String = tx.query_row(
                "SELECT default_group_ids FROM networks WHERE id = ?1",
                params![network_id.as_str()],
                |r| r.get(0),
            )?;
            for gid in serde_json::from_str::<Vec<String>>(&default_group_ids).unwrap_or_default() {
                tx.execute(
                    "INSERT OR IGNORE INTO group_peers (group_id, peer_id) VALUES (?1, ?2)",
                    params![gid, id.as_str()],
                )?;
            }
        }

        tx.commit()?;
        drop(conn);
        self.get_peer(network_id, &id)
    }

    fn get_peer(&self, network_id: &NetworkId, id: &PeerId) -> ServerResult<Peer> {
        let conn = self.conn.lock();
        let mut peer = conn
            .query_row(
                "SELECT id, network_id, name, public_key, private_key, address, endpoint, listen_port, role, agent_managed, owner_user_id, created_at, updated_at
                 FROM peers WHERE network_id = ?1 AND id = ?2",
                params![network_id.as_str(), id.as_str()],
                Self::peer_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => ServerError::NotFound(format!("peer {id}")),
                e => e.into(),
            })?;
        self.hydrate_peer_group_ids(&conn, &mut peer)?;
        Ok(peer)
    }

    fn find_peer_by_name(&self, network_id: &NetworkId, name: &str) -> ServerResult<Option<Peer>> {
        let conn = self.conn.lock();
        let peer = conn
            .query_row(
                "SELECT id, network_id, name, public_key, private_key, address, endpoint, listen_port, role, agent_managed, owner_user_id, created_at, updated_at
                 FROM peers WHERE network_id = ?1 AND name = ?2",
                params![network_id.as_str(), name],
                Self::peer_row,
            )
            .optional()?;
        match peer {
            Some(mut p) => {
                self.hydrate_peer_group_ids(&conn, &mut p)?;
                Ok(Some(p))
            },
            None => Ok(None),
        }
    }

    fn find_peer_by_public_key(&self, network_id: &NetworkId, key: &str) -> ServerResult<Option<Peer>> {
        let conn = self.conn.lock();
        let peer = conn
            .query_row(
                "SELECT id, network_id, name, public_key, private_key, address, endpoint, listen_port, role, agent_managed, owner_user_id, created_at, updated_at
                 FROM peers WHERE network_id = ?1 AND public_key = ?2",
                params![network_id.as_str(), key],
                Self::peer_row,
            )
            .optional()?;
        match peer {
            Some(mut p) => {
                self.hydrate_peer_group_ids(&conn, &mut p)?;
                Ok(Some(p))
            },
            None => Ok(None),
        }
    }

    fn find_peer_by_address(&self, network_id: &NetworkId, ip: IpAddr) -> ServerResult<Option<Peer>> {
        let conn = self.conn.lock();
        let peer = conn
            .query_row(
                "SELECT id, network_id, name, public_key, private_key, address, endpoint, listen_port, role, agent_managed, owner_user_id, created_at, updated_at
                 FROM peers WHERE network_id = ?1 AND address = ?2",
                params![network_id.as_str(), ip.to_string()],
                Self::peer_row,
            )
            .optional()?;
        match peer {
            Some(mut p) => {
                self.hydrate_peer_group_ids(&conn, &mut p)?;
                Ok(Some(p))
            },
            None => Ok(None),
        }
    }

    fn find_peer_globally_by_public_key(&self, key: &str) -> ServerResult<Option<Peer>> {
        let conn = self.conn.lock();
        let peer = conn
            .query_row(
                "SELECT id, network_id, name, public_key, private_key, address, endpoint, listen_port, role, agent_managed, owner_user_id, created_at, updated_at
                 FROM peers WHERE public_key = ?1",
                params![key],
                Self::peer_row,
            )
            .optional()?;
        match peer {
            Some(mut p) => {
                self.hydrate_peer_group_ids(&conn, &mut p)?;
                Ok(Some(p))
            },
            None => Ok(None),
        }
    }

    fn list_peers(&self, network_id: &NetworkId) -> ServerResult<Vec<Peer>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, network_id, name, public_key, private_key, address, endpoint, listen_port, role, agent_managed, owner_user_id, created_at, updated_at
             FROM peers WHERE network_id = ?1 ORDER BY name",
        )?;
        let mut peers: Vec<Peer> =
            stmt.query_map(params![network_id.as_str()], Self::peer_row)?.collect::<Result<_, _>>()?;
        for peer in &mut peers {
            self.hydrate_peer_group_ids(&conn, peer)?;
        }
        Ok(peers)
    }

    fn update_peer(&self, network_id: &NetworkId, id: &PeerId, update: PeerUpdate) -> ServerResult<Peer> {
        let conn = self.conn.lock();
        let mut peer = conn.query_row(
            "SELECT id, network_id, name, public_key, private_key, address, endpoint, listen_port, role, agent_managed, owner_user_id, created_at, updated_at
             FROM peers WHERE network_id = ?1 AND id = ?2",
            params![network_id.as_str(), id.as_str()],
            Self::peer_row,
        )?;
        if let Some(name) = update.name {
            peer.contents.name = name;
        }
        if let Some(endpoint) = update.endpoint {
            peer.contents.endpoint = endpoint;
        }
        if let Some(port) = update.listen_port {
            peer.contents.listen_port = port;
        }
        let now = now_secs();
        conn.execute(
            "UPDATE peers SET name = ?1, endpoint = ?2, listen_port = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                peer.contents.name.as_str(),
                peer.contents.endpoint.as_ref().map(|e| e.to_string()),
                peer.contents.listen_port,
                now,
                id.as_str(),
            ],
        )?;
        peer.updated_at = from_secs(now);
        self.hydrate_peer_group_ids(&conn, &mut peer)?;
        Ok(peer)
    }

    fn delete_peer(&self, network_id: &NetworkId, id: &PeerId) -> ServerResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let role: String = tx
            .query_row(
                "SELECT role FROM peers WHERE network_id = ?1 AND id = ?2",
                params![network_id.as_str(), id.as_str()],
                |r| r.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => ServerError::NotFound(format!("peer {id}")),
                e => ServerError::from(e),
            })?;

        if role == "jump" {
            let jump_count: u32 = tx.query_row(
                "SELECT COUNT(*) FROM peers WHERE network_id = ?1 AND role = 'jump'",
                params![network_id.as_str()],
                |r| r.get(0),
            )?;
            let total: u32 = tx.query_row(
                "SELECT COUNT(*) FROM peers WHERE network_id = ?1",
                params![network_id.as_str()],
                |r| r.get(0),
            )?;
            if jump_count <= 1 && total > 1 {
                return Err(ServerError::InvalidState(
                    "cannot delete the last jump peer of a non-empty network".into(),
                ));
            }
        }

        tx.execute(
            "DELETE FROM peer_pairs WHERE network_id = ?1 AND (peer_id_1 = ?2 OR peer_id_2 = ?2)",
            params![network_id.as_str(), id.as_str()],
        )?;
        tx.execute("DELETE FROM group_peers WHERE peer_id = ?1", params![id.as_str()])?;
        tx.execute(
            "DELETE FROM peers WHERE network_id = ?1 AND id = ?2",
            params![network_id.as_str(), id.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn count_jump_peers(&self, network_id: &NetworkId) -> ServerResult<u32> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM peers WHERE network_id = ?1 AND role = 'jump'",
            params![network_id.as_str()],
            |r| r.get(0),
        )?)
    }

    fn peer_pairs_for(&self, network_id: &NetworkId, peer_id: &PeerId) -> ServerResult<Vec<PeerPair>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT network_id, peer_id_1, peer_id_2, preshared_key FROM peer_pairs
             WHERE network_id = ?1 AND (peer_id_1 = ?2 OR peer_id_2 = ?2)",
        )?;
        Ok(stmt
            .query_map(params![network_id.as_str(), peer_id.as_str()], pair_row)?
            .collect::<Result<_, _>>()?)
    }

    fn all_peer_pairs(&self, network_id: &NetworkId) -> ServerResult<Vec<PeerPair>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT network_id, peer_id_1, peer_id_2, preshared_key FROM peer_pairs WHERE network_id = ?1")?;
        Ok(stmt.query_map(params![network_id.as_str()], pair_row)?.collect::<Result<_, _>>()?)
    }

    // ------------------------------------------------------------ enrollment
    fn set_enrollment_token(&self, network_id: &NetworkId, peer_id: &PeerId, token_hash: &str) -> ServerResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE peers SET enrollment_token_hash = ?1, enrollment_consumed = 0 WHERE network_id = ?2 AND id = ?3",
            params![token_hash, network_id.as_str(), peer_id.as_str()],
        )?;
        Ok(())
    }

    fn consume_enrollment_token(&self, token_hash: &str) -> ServerResult<Option<(NetworkId, PeerId)>> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT network_id, id FROM peers WHERE enrollment_token_hash = ?1 AND enrollment_consumed = 0",
                params![token_hash],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()?;
        match found {
            Some((network_id, peer_id)) => {
                conn.execute(
                    "UPDATE peers SET enrollment_consumed = 1 WHERE network_id = ?1 AND id = ?2",
                    params![network_id, peer_id],
                )?;
                Ok(Some((NetworkId::from(network_id), PeerId::from(peer_id))))
            },
            None => Ok(None),
        }
    }

    fn set_session_credential(&self, network_id: &NetworkId, peer_id: &PeerId, credential_hash: &str) -> ServerResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE peers SET session_credential_hash = ?1 WHERE network_id = ?2 AND id = ?3",
            params![credential_hash, network_id.as_str(), peer_id.as_str()],
        )?;
        Ok(())
    }

    fn find_peer_by_session_credential(&self, credential_hash: &str) -> ServerResult<Option<Peer>> {
        let conn = self.conn.lock();
        let peer = conn
            .query_row(
                "SELECT id, network_id, name, public_key, private_key, address, endpoint, listen_port, role, agent_managed, owner_user_id, created_at, updated_at
                 FROM peers WHERE session_credential_hash = ?1",
                params![credential_hash],
                Self::peer_row,
            )
            .optional()?;
        match peer {
            Some(mut p) => {
                self.hydrate_peer_group_ids(&conn, &mut p)?;
                Ok(Some(p))
            },
            None => Ok(None),
        }
    }

    // ----------------------------------------------------------------- groups
    fn create_group(&self, network_id: &NetworkId, contents: GroupContents) -> ServerResult<Group> {
        let conn = self.conn.lock();
        let id = GroupId::new();
        conn.execute(
            "INSERT INTO groups (id, network_id, name, description, priority) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.as_str(), network_id.as_str(), contents.name.as_str(), contents.description, contents.priority],
        )?;
        for peer_id in &contents.peer_ids {
            conn.execute(
                "INSERT OR IGNORE INTO group_peers (group_id, peer_id) VALUES (?1, ?2)",
                params![id.as_str(), peer_id.as_str()],
            )?;
        }
        for (ordinal, policy_id) in contents.policy_ids.iter().enumerate() {
            conn.execute(
                "INSERT OR IGNORE INTO group_policies (group_id, policy_id, ordinal) VALUES (?1, ?2, ?3)",
                params![id.as_str(), policy_id.as_str(), ordinal as i64],
            )?;
        }
        for route_id in &contents.route_ids {
            conn.execute(
                "INSERT OR IGNORE INTO group_routes (group_id, route_id) VALUES (?1, ?2)",
                params![id.as_str(), route_id.as_str()],
            )?;
        }
        drop(conn);
        self.get_group(network_id, &id)
    }

    fn get_group(&self, network_id: &NetworkId, id: &GroupId) -> ServerResult<Group> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, network_id, name, description, priority FROM groups WHERE network_id = ?1 AND id = ?2",
            params![network_id.as_str(), id.as_str()],
            |row| Self::group_row(&conn, row),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => ServerError::NotFound(format!("group {id}")),
            e => e.into(),
        })
    }

    fn find_group_by_name(&self, network_id: &NetworkId, name: &str) -> ServerResult<Option<Group>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id, network_id, name, description, priority FROM groups WHERE network_id = ?1 AND name = ?2",
                params![network_id.as_str(), name],
                |row| Self::group_row(&conn, row),
            )
            .optional()?)
    }

    fn list_groups(&self, network_id: &NetworkId) -> ServerResult<Vec<Group>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, network_id, name, description, priority FROM groups WHERE network_id = ?1 ORDER BY priority, name",
        )?;
        Ok(stmt
            .query_map(params![network_id.as_str()], |row| Self::group_row(&conn, row))?
            .collect::<Result<_, _>>()?)
    }

    fn update_group(&self, network_id: &NetworkId, id: &GroupId, update: GroupUpdate) -> ServerResult<Group> {
        let conn = self.conn.lock();
        let mut group = conn.query_row(
            "SELECT id, network_id, name, description, priority FROM groups WHERE network_id = ?1 AND id = ?2",
            params![network_id.as_str(), id.as_str()],
            |row| Self::group_row(&conn, row),
        )?;
        if let Some(name) = update.name {
            group.contents.name = name;
        }
        if let Some(desc) = update.description {
            group.contents.description = desc;
        }
        if let Some(priority) = update.priority {
            group.contents.priority = priority;
        }
        conn.execute(
            "UPDATE groups SET name = ?1, description = ?2, priority = ?3 WHERE id = ?4",
            params![group.contents.name.as_str(), group.contents.description, group.contents.priority, id.as_str()],
        )?;
        Ok(group)
    }

    fn delete_group(&self, network_id: &NetworkId, id: &GroupId) -> ServerResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM groups WHERE network_id = ?1 AND id = ?2",
            params![network_id.as_str(), id.as_str()],
        )?;
        Ok(())
    }

    fn groups_containing_peer(&self, network_id: &NetworkId, peer_id: &PeerId) -> ServerResult<Vec<Group>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT g.id FROM groups g JOIN group_peers gp ON gp.group_id = g.id WHERE g.network_id = ?1 AND gp.peer_id = ?2",
        )?;
        let ids: Vec<String> = stmt.query_map(params![network_id.as_str(), peer_id.as_str()], |r| r.get(0))?.collect::<Result<_, _>>()?;
        drop(stmt);
        drop(conn);
        ids.into_iter().map(|id| self.get_group(network_id, &GroupId::from(id))).collect()
    }

    fn add_peer_to_group(&self, network_id: &NetworkId, group_id: &GroupId, peer_id: &PeerId) -> ServerResult<()> {
        let conn = self.conn.lock();
        let already: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM group_peers WHERE group_id = ?1 AND peer_id = ?2)",
            params![group_id.as_str(), peer_id.as_str()],
            |r| r.get(0),
        )?;
        if already {
            return Err(ServerError::InvalidState("peer already in group".into()));
        }
        let _ = network_id;
        conn.execute(
            "INSERT INTO group_peers (group_id, peer_id) VALUES (?1, ?2)",
            params![group_id.as_str(), peer_id.as_str()],
        )?;
        Ok(())
    }

    fn remove_peer_from_group(&self, _network_id: &NetworkId, group_id: &GroupId, peer_id: &PeerId) -> ServerResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM group_peers WHERE group_id = ?1 AND peer_id = ?2",
            params![group_id.as_str(), peer_id.as_str()],
        )?;
        Ok(())
    }

    fn attach_policy(&self, _network_id: &NetworkId, group_id: &GroupId, policy_id: &PolicyId) -> ServerResult<()> {
        let conn = self.conn.lock();
        let next_ordinal: i64 = conn.query_row(
            "SELECT COALESCE(MAX(ordinal) + 1, 0) FROM group_policies WHERE group_id = ?1",
            params![group_id.as_str()],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT INTO group_policies (group_id, policy_id, ordinal) VALUES (?1, ?2, ?3)",
            params![group_id.as_str(), policy_id.as_str(), next_ordinal],
        )?;
        Ok(())
    }

    fn detach_policy(&self, _network_id: &NetworkId, group_id: &GroupId, policy_id: &PolicyId) -> ServerResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM group_policies WHERE group_id = ?1 AND policy_id = ?2",
            params![group_id.as_str(), policy_id.as_str()],
        )?;
        Ok(())
    }

    fn attach_route(&self, _network_id: &NetworkId, group_id: &GroupId, route_id: &RouteId) -> ServerResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO group_routes (group_id, route_id) VALUES (?1, ?2)",
            params![group_id.as_str(), route_id.as_str()],
        )?;
        Ok(())
    }

    fn detach_route(&self, _network_id: &NetworkId, group_id: &GroupId, route_id: &RouteId) -> ServerResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM group_routes WHERE group_id = ?1 AND route_id = ?2",
            params![group_id.as_str(), route_id.as_str()],
        )?;
        Ok(())
    }

    // --------------------------------------------------------------- policies
    fn create_policy(&self, network_id: &NetworkId, contents: PolicyContents) -> ServerResult<Policy> {
        let conn = self.conn.lock();
        let id = PolicyId::new();
        conn.execute(
            "INSERT INTO policies (id, network_id, name, description) VALUES (?1, ?2, ?3, ?4)",
            params![id.as_str(), network_id.as_str(), contents.name.as_str(), contents.description],
        )?;
        for (ordinal, rule) in contents.rules.iter().enumerate() {
            insert_rule(&conn, id.as_str(), ordinal as i64, rule)?;
        }
        drop(conn);
        self.get_policy(network_id, &id)
    }

    fn get_policy(&self, network_id: &NetworkId, id: &PolicyId) -> ServerResult<Policy> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, network_id, name, description FROM policies WHERE network_id = ?1 AND id = ?2",
            params![network_id.as_str(), id.as_str()],
            |row| Self::policy_row(&conn, row),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => ServerError::NotFound(format!("policy {id}")),
            e => e.into(),
        })
    }

    fn find_policy_by_name(&self, network_id: &NetworkId, name: &str) -> ServerResult<Option<Policy>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id, network_id, name, description FROM policies WHERE network_id = ?1 AND name = ?2",
                params![network_id.as_str(), name],
                |row| Self::policy_row(&conn, row),
            )
            .optional()?)
    }

    fn list_policies(&self, network_id: &NetworkId) -> ServerResult<Vec<Policy>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM policies WHERE network_id = ?1 ORDER BY name")?;
        let ids: Vec<String> = stmt.query_map(params![network_id.as_str()], |r| r.get(0))?.collect::<Result<_, _>>()?;
        drop(stmt);
        ids.into_iter()
            .map(|id| {
                conn.query_row(
                    "SELECT id, network_id, name, description FROM policies WHERE id = ?1",
                    params![id],
                    |row| Self::policy_row(&conn, row),
                )
                .map_err(ServerError::from)
            })
            .collect()
    }

    fn update_policy(&self, network_id: &NetworkId, id: &PolicyId, update: PolicyUpdate) -> ServerResult<Policy> {
        let conn = self.conn.lock();
        let mut policy = conn.query_row(
            "SELECT id, network_id, name, description FROM policies WHERE network_id = ?1 AND id = ?2",
            params![network_id.as_str(), id.as_str()],
            |row| Self::policy_row(&conn, row),
        )?;
        if let Some(name) = update.name {
            policy.contents.name = name;
        }
        if let Some(desc) = update.description {
            policy.contents.description = desc;
        }
        conn.execute(
            "UPDATE policies SET name = ?1, description = ?2 WHERE id = ?3",
            params![policy.contents.name.as_str(), policy.contents.description, id.as_str()],
        )?;
        Ok(policy)
    }

    fn delete_policy(&self, network_id: &NetworkId, id: &PolicyId) -> ServerResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM policies WHERE network_id = ?1 AND id = ?2", params![network_id.as_str(), id.as_str()])?;
        Ok(())
    }

    fn add_rule(&self, network_id: &NetworkId, policy_id: &PolicyId, rule: Rule) -> ServerResult<Policy> {
        let conn = self.conn.lock();
        let next_ordinal: i64 = conn.query_row(
            "SELECT COALESCE(MAX(ordinal) + 1, 0) FROM policy_rules WHERE policy_id = ?1",
            params![policy_id.as_str()],
            |r| r.get(0),
        )?;
        insert_rule(&conn, policy_id.as_str(), next_ordinal, &rule)?;
        drop(conn);
        self.get_policy(network_id, policy_id)
    }

    fn remove_rule(&self, network_id: &NetworkId, policy_id: &PolicyId, rule_index: usize) -> ServerResult<Policy> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM policy_rules WHERE policy_id = ?1 AND ordinal = ?2",
            params![policy_id.as_str(), rule_index as i64],
        )?;
        // Re-pack ordinals so the list stays contiguous.
        let mut stmt = conn.prepare("SELECT ordinal FROM policy_rules WHERE policy_id = ?1 ORDER BY ordinal")?;
        let ordinals: Vec<i64> = stmt.query_map(params![policy_id.as_str()], |r| r.get(0))?.collect::<Result<_, _>>()?;
        drop(stmt);
        for (new_ordinal, old_ordinal) in ordinals.into_iter().enumerate() {
            if new_ordinal as i64 != old_ordinal {
                conn.execute(
                    "UPDATE policy_rules SET ordinal = ?1 WHERE policy_id = ?2 AND ordinal = ?3",
                    params![new_ordinal as i64, policy_id.as_str(), old_ordinal],
                )?;
            }
        }
        drop(conn);
        self.get_policy(network_id, policy_id)
    }

    // ----------------------------------------------------------------- routes
    fn create_route(&self, network_id: &NetworkId, contents: RouteContents) -> ServerResult<Route> {
        let conn = self.conn.lock();
        let id = RouteId::new();
        conn.execute(
            "INSERT INTO routes (id, network_id, name, destination_cidr, jump_peer_id, domain_suffix) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.as_str(),
                network_id.as_str(),
                contents.name.as_str(),
                contents.destination_cidr.to_string(),
                contents.jump_peer_id.as_str(),
                contents.domain_suffix.as_ref().map(|s| s.as_str()),
            ],
        )?;
        Ok(Route { id, network_id: network_id.clone(), contents })
    }

    fn get_route(&self, network_id: &NetworkId, id: &RouteId) -> ServerResult<Route> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, network_id, name, destination_cidr, jump_peer_id, domain_suffix FROM routes WHERE network_id = ?1 AND id = ?2",
            params![network_id.as_str(), id.as_str()],
            Self::route_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => ServerError::NotFound(format!("route {id}")),
            e => e.into(),
        })
    }

    fn find_route_by_name(&self, network_id: &NetworkId, name: &str) -> ServerResult<Option<Route>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id, network_id, name, destination_cidr, jump_peer_id, domain_suffix FROM routes WHERE network_id = ?1 AND name = ?2",
                params![network_id.as_str(), name],
                Self::route_row,
            )
            .optional()?)
    }

    fn list_routes(&self, network_id: &NetworkId) -> ServerResult<Vec<Route>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, network_id, name, destination_cidr, jump_peer_id, domain_suffix FROM routes WHERE network_id = ?1 ORDER BY name",
        )?;
        Ok(stmt.query_map(params![network_id.as_str()], Self::route_row)?.collect::<Result<_, _>>()?)
    }

    fn update_route(&self, network_id: &NetworkId, id: &RouteId, update: RouteUpdate) -> ServerResult<Route> {
        let conn = self.conn.lock();
        let mut route = conn.query_row(
            "SELECT id, network_id, name, destination_cidr, jump_peer_id, domain_suffix FROM routes WHERE network_id = ?1 AND id = ?2",
            params![network_id.as_str(), id.as_str()],
            Self::route_row,
        )?;
        if let Some(name) = update.name {
            route.contents.name = name;
        }
        if let Some(cidr) = update.destination_cidr {
            route.contents.destination_cidr = cidr;
        }
        if let Some(jump) = update.jump_peer_id {
            route.contents.jump_peer_id = jump;
        }
        if let Some(suffix) = update.domain_suffix {
            route.contents.domain_suffix = suffix;
        }
        conn.execute(
            "UPDATE routes SET name = ?1, destination_cidr = ?2, jump_peer_id = ?3, domain_suffix = ?4 WHERE id = ?5",
            params![
                route.contents.name.as_str(),
                route.contents.destination_cidr.to_string(),
                route.contents.jump_peer_id.as_str(),
                route.contents.domain_suffix.as_ref().map(|s| s.as_str()),
                id.as_str(),
            ],
        )?;
        Ok(route)
    }

    fn delete_route(&self, network_id: &NetworkId, id: &RouteId) -> ServerResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM routes WHERE network_id = ?1 AND id = ?2", params![network_id.as_str(), id.as_str()])?;
        Ok(())
    }

    // ------------------------------------------------------------- dns records
    fn create_dns_record(&self, route_id: &RouteId, contents: DnsRecordContents) -> ServerResult<DnsRecord> {
        let conn = self.conn.lock();
        let id = DnsRecordId::new();
        conn.execute(
            "INSERT INTO dns_records (id, route_id, name, ip) VALUES (?1, ?2, ?3, ?4)",
            params![id.as_str(), route_id.as_str(), contents.name.as_str(), contents.ip.to_string()],
        )?;
        Ok(DnsRecord { id, route_id: route_id.clone(), contents })
    }

    fn get_dns_record(&self, route_id: &RouteId, id: &DnsRecordId) -> ServerResult<DnsRecord> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, route_id, name, ip FROM dns_records WHERE route_id = ?1 AND id = ?2",
            params![route_id.as_str(), id.as_str()],
            Self::dns_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => ServerError::NotFound(format!("dns record {id}")),
            e => e.into(),
        })
    }

    fn list_dns_records(&self, route_id: &RouteId) -> ServerResult<Vec<DnsRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT id, route_id, name, ip FROM dns_records WHERE route_id = ?1 ORDER BY name")?;
        Ok(stmt.query_map(params![route_id.as_str()], Self::dns_row)?.collect::<Result<_, _>>()?)
    }

    fn list_dns_records_for_network(&self, network_id: &NetworkId) -> ServerResult<Vec<DnsRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT d.id, d.route_id, d.name, d.ip FROM dns_records d
             JOIN routes r ON r.id = d.route_id WHERE r.network_id = ?1 ORDER BY d.name",
        )?;
        Ok(stmt.query_map(params![network_id.as_str()], Self::dns_row)?.collect::<Result<_, _>>()?)
    }

    fn update_dns_record(&self, route_id: &RouteId, id: &DnsRecordId, update: DnsRecordUpdate) -> ServerResult<DnsRecord> {
        let conn = self.conn.lock();
        let mut record = conn.query_row(
            "SELECT id, route_id, name, ip FROM dns_records WHERE route_id = ?1 AND id = ?2",
            params![route_id.as_str(), id.as_str()],
            Self::dns_row,
        )?;
        if let Some(name) = update.name {
            record.contents.name = name;
        }
        if let Some(ip) = update.ip {
            record.contents.ip = ip;
        }
        conn.execute(
            "UPDATE dns_records SET name = ?1, ip = ?2 WHERE id = ?3",
            params![record.contents.name.as_str(), record.contents.ip.to_string(), id.as_str()],
        )?;
        Ok(record)
    }

    fn delete_dns_record(&self, route_id: &RouteId, id: &DnsRecordId) -> ServerResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM dns_records WHERE route_id = ?1 AND id = ?2", params![route_id.as_str(), id.as_str()])?;
        Ok(())
    }

    // --------------------------------------------------------- security config
    fn get_security_config(&self, network_id: &NetworkId) -> ServerResult<SecurityConfig> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT enabled, session_conflict_threshold_secs, endpoint_change_threshold_secs, max_endpoint_changes_per_day
                 FROM security_configs WHERE network_id = ?1",
                params![network_id.as_str()],
                |r| {
                    Ok((r.get::<_, bool>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?, r.get::<_, i64>(3)?))
                },
            )
            .optional()?;
        match row {
            Some((enabled, session, endpoint, max_changes)) => Ok(SecurityConfig {
                network_id: network_id.clone(),
                enabled,
                session_conflict_threshold: Duration::from_secs(session as u64),
                endpoint_change_threshold: Duration::from_secs(endpoint as u64),
                max_endpoint_changes_per_day: max_changes as u32,
            }),
            None => {
                let defaults = SecurityConfig::defaults(network_id.clone());
                conn.execute(
                    "INSERT INTO security_configs (network_id, enabled, session_conflict_threshold_secs, endpoint_change_threshold_secs, max_endpoint_changes_per_day)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        network_id.as_str(),
                        defaults.enabled,
                        defaults.session_conflict_threshold.as_secs() as i64,
                        defaults.endpoint_change_threshold.as_secs() as i64,
                        defaults.max_endpoint_changes_per_day,
                    ],
                )?;
                Ok(defaults)
            },
        }
    }

    fn update_security_config(&self, network_id: &NetworkId, update: SecurityConfigUpdate) -> ServerResult<SecurityConfig> {
        let mut cfg = self.get_security_config(network_id)?;
        if let Some(enabled) = update.enabled {
            cfg.enabled = enabled;
        }
        if let Some(t) = update.session_conflict_threshold {
            cfg.session_conflict_threshold = t;
        }
        if let Some(t) = update.endpoint_change_threshold {
            cfg.endpoint_change_threshold = t;
        }
        if let Some(n) = update.max_endpoint_changes_per_day {
            cfg.max_endpoint_changes_per_day = n;
        }
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE security_configs SET enabled = ?1, session_conflict_threshold_secs = ?2, endpoint_change_threshold_secs = ?3, max_endpoint_changes_per_day = ?4
             WHERE network_id = ?5",
            params![
                cfg.enabled,
                cfg.session_conflict_threshold.as_secs() as i64,
                cfg.endpoint_change_threshold.as_secs() as i64,
                cfg.max_endpoint_changes_per_day,
                network_id.as_str(),
            ],
        )?;
        Ok(cfg)
    }

    // ------------------------------------------------------------- incidents
    fn create_incident_if_absent(&self, incident: NewIncident) -> ServerResult<Option<SecurityIncident>> {
        let conn = self.conn.lock();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM security_incidents WHERE peer_id = ?1 AND kind = ?2 AND resolved = 0)",
            params![incident.peer_id.as_str(), kind_str(incident.kind)],
            |r| r.get(0),
        )?;
        if exists {
            return Ok(None);
        }
        let id = IncidentId::new();
        let now = now_secs();
        conn.execute(
            "INSERT INTO security_incidents (id, network_id, peer_id, public_key_at_detection, kind, detected_at, endpoints_involved, detail, resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                id.as_str(),
                incident.network_id.as_str(),
                incident.peer_id.as_str(),
                incident.public_key_at_detection,
                kind_str(incident.kind),
                now,
                serde_json::to_string(&incident.endpoints_involved.iter().map(|e| e.to_string()).collect::<Vec<_>>()).unwrap(),
                incident.detail,
            ],
        )?;
        Ok(Some(SecurityIncident {
            id,
            network_id: incident.network_id,
            peer_id: incident.peer_id,
            public_key_at_detection: incident.public_key_at_detection,
            kind: incident.kind,
            detected_at: from_secs(now),
            endpoints_involved: incident.endpoints_involved,
            detail: incident.detail,
            resolved: false,
            resolved_by: None,
            resolved_at: None,
        }))
    }

    fn get_incident(&self, network_id: &NetworkId, id: &IncidentId) -> ServerResult<SecurityIncident> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, network_id, peer_id, public_key_at_detection, kind, detected_at, endpoints_involved, detail, resolved, resolved_by, resolved_at
             FROM security_incidents WHERE network_id = ?1 AND id = ?2",
            params![network_id.as_str(), id.as_str()],
            Self::incident_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => ServerError::NotFound(format!("incident {id}")),
            e => e.into(),
        })
    }

    fn list_incidents(&self, network_id: &NetworkId, page: u32, page_size: u32) -> ServerResult<Page<SecurityIncident>> {
        let conn = self.conn.lock();
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM security_incidents WHERE network_id = ?1",
            params![network_id.as_str()],
            |r| r.get::<_, i64>(0),
        )? as u64;
        let offset = (page.saturating_sub(1)) as i64 * page_size as i64;
        let mut stmt = conn.prepare(
            "SELECT id, network_id, peer_id, public_key_at_detection, kind, detected_at, endpoints_involved, detail, resolved, resolved_by, resolved_at
             FROM security_incidents WHERE network_id = ?1 ORDER BY detected_at DESC LIMIT ?2 OFFSET ?3",
        )?;
        let data = stmt
            .query_map(params![network_id.as_str(), page_size as i64, offset], Self::incident_row)?
            .collect::<Result<_, _>>()?;
        Ok(Page { data, page, page_size, total })
    }

    fn has_unresolved_incident(&self, peer_id: &PeerId, kind: IncidentKind) -> ServerResult<bool> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM security_incidents WHERE peer_id = ?1 AND kind = ?2 AND resolved = 0)",
            params![peer_id.as_str(), kind_str(kind)],
            |r| r.get(0),
        )?)
    }

    fn resolve_incident(&self, network_id: &NetworkId, id: &IncidentId, resolved_by: &str) -> ServerResult<SecurityIncident> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let peer_id: String = tx
            .query_row(
                "SELECT peer_id FROM security_incidents WHERE network_id = ?1 AND id = ?2",
                params![network_id.as_str(), id.as_str()],
                |r| r.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => ServerError::NotFound(format!("incident {id}")),
                e => ServerError::from(e),
            })?;

        tx.execute(
            "DELETE FROM endpoint_change_records WHERE network_id = ?1 AND peer_id = ?2",
            params![network_id.as_str(), peer_id],
        )?;
        tx.execute(
            "UPDATE agent_sessions SET reported_endpoint = NULL WHERE network_id = ?1 AND peer_id = ?2",
            params![network_id.as_str(), peer_id],
        )?;
        if let Some(quarantine_id) = tx
            .query_row(
                "SELECT id FROM groups WHERE network_id = ?1 AND name = 'quarantine'",
                params![network_id.as_str()],
                |r| r.get::<_, String>(0),
            )
            .optional()?
        {
            tx.execute(
                "DELETE FROM group_peers WHERE group_id = ?1 AND peer_id = ?2",
                params![quarantine_id, peer_id],
            )?;
        }
        let now = now_secs();
        tx.execute(
            "UPDATE security_incidents SET resolved = 1, resolved_by = ?1, resolved_at = ?2 WHERE id = ?3",
            params![resolved_by, now, id.as_str()],
        )?;
        tx.commit()?;
        drop(conn);
        self.get_incident(network_id, id)
    }

    // --------------------------------------------------------------- sessions
    fn upsert_session(&self, session: AgentSession) -> ServerResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent_sessions (network_id, peer_id, session_id, hostname, system_uptime, tunnel_uptime, first_seen, last_seen, reported_endpoint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(network_id, peer_id, hostname) DO UPDATE SET
                session_id = excluded.session_id,
                system_uptime = excluded.system_uptime,
                tunnel_uptime = excluded.tunnel_uptime,
                last_seen = excluded.last_seen,
                reported_endpoint = excluded.reported_endpoint",
            params![
                session.network_id.as_str(),
                session.peer_id.as_str(),
                session.session_id,
                session.hostname,
                session.system_uptime as i64,
                session.tunnel_uptime as i64,
                to_secs(session.first_seen),
                to_secs(session.last_seen),
                session.reported_endpoint.as_ref().map(|e| e.to_string()),
            ],
        )?;
        Ok(())
    }

    fn sessions_for_peer(&self, network_id: &NetworkId, peer_id: &PeerId) -> ServerResult<Vec<AgentSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT network_id, peer_id, session_id, hostname, system_uptime, tunnel_uptime, first_seen, last_seen, reported_endpoint
             FROM agent_sessions WHERE network_id = ?1 AND peer_id = ?2",
        )?;
        Ok(stmt.query_map(params![network_id.as_str(), peer_id.as_str()], Self::session_row)?.collect::<Result<_, _>>()?)
    }

    fn find_session(&self, network_id: &NetworkId, peer_id: &PeerId, hostname: &str) -> ServerResult<Option<AgentSession>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT network_id, peer_id, session_id, hostname, system_uptime, tunnel_uptime, first_seen, last_seen, reported_endpoint
                 FROM agent_sessions WHERE network_id = ?1 AND peer_id = ?2 AND hostname = ?3",
                params![network_id.as_str(), peer_id.as_str(), hostname],
                Self::session_row,
            )
            .optional()?)
    }

    // ------------------------------------------------------- endpoint changes
    fn append_endpoint_change(&self, record: EndpointChangeRecord) -> ServerResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO endpoint_change_records (network_id, peer_id, old_endpoint, new_endpoint, changed_at, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.network_id.as_str(),
                record.peer_id.as_str(),
                record.old_endpoint.as_ref().map(|e| e.to_string()),
                record.new_endpoint.as_ref().map(|e| e.to_string()),
                to_secs(record.changed_at),
                Self::encode_source(&record.source),
            ],
        )?;
        Ok(())
    }

    fn endpoint_changes_since(&self, network_id: &NetworkId, peer_id: &PeerId, since: SystemTime) -> ServerResult<Vec<EndpointChangeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT network_id, peer_id, old_endpoint, new_endpoint, changed_at, source FROM endpoint_change_records
             WHERE network_id = ?1 AND peer_id = ?2 AND changed_at >= ?3 ORDER BY changed_at",
        )?;
        Ok(stmt
            .query_map(params![network_id.as_str(), peer_id.as_str(), to_secs(since)], Self::endpoint_change_row)?
            .collect::<Result<_, _>>()?)
    }

    fn prune_endpoint_changes_older_than(&self, cutoff: SystemTime) -> ServerResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM endpoint_change_records WHERE changed_at < ?1", params![to_secs(cutoff)])?;
        Ok(())
    }

    // --------------------------------------------------------------- whitelist
    fn jump_whitelist(&self, network_id: &NetworkId, jump_id: &PeerId) -> ServerResult<Vec<IpAddr>> {
        let _ = network_id;
        let conn = self.conn.lock();
        let raw: String = conn.query_row("SELECT whitelist FROM peers WHERE id = ?1", params![jump_id.as_str()], |r| r.get(0))?;
        Ok(serde_json::from_str::<Vec<String>>(&raw).unwrap_or_default().into_iter().filter_map(|s| s.parse().ok()).collect())
    }

    fn set_jump_whitelist(&self, network_id: &NetworkId, jump_id: &PeerId, ips: &[IpAddr]) -> ServerResult<()> {
        let _ = network_id;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE peers SET whitelist = ?1 WHERE id = ?2",
            params![serde_json::to_string(&ips.iter().map(|i| i.to_string()).collect::<Vec<_>>()).unwrap(), jump_id.as_str()],
        )?;
        Ok(())
    }
}

fn pair_row(row: &Row) -> rusqlite::Result<PeerPair> {
    Ok(PeerPair {
        network_id: NetworkId::from(row.get::<_, String>(0)?),
        peer_id_1: PeerId::from(row.get::<_, String>(1)?),
        peer_id_2: PeerId::from(row.get::<_, String>(2)?),
        preshared_key: row.get(3)?,
    })
}

fn insert_rule(conn: &Connection, policy_id: &str, ordinal: i64, rule: &Rule) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO policy_rules (policy_id, ordinal, direction, action, target, target_kind, description)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            policy_id,
            ordinal,
            if rule.direction == Direction::Input { "input" } else { "output" },
            if rule.action == RuleAction::Allow { "allow" } else { "deny" },
            rule.target,
            match rule.target_kind {
                TargetKind::Cidr => "cidr",
                TargetKind::Peer => "peer",
                TargetKind::Group => "group",
            },
            rule.description,
        ],
    )?;
    Ok(())
}

fn kind_str(kind: IncidentKind) -> &'static str {
    match kind {
        IncidentKind::SessionConflict => "session_conflict",
        IncidentKind::SharedConfig => "shared_config",
        IncidentKind::SuspiciousActivity => "suspicious_activity",
    }
}

/// Generates a random preshared key in the same base64 shape a WireGuard
/// key takes (32 random bytes). Key generation proper is an out-of-scope
/// external primitive (spec.md §1); this covers only the PSK, which the
/// control plane itself must mint per pair.
pub fn generate_preshared_key() -> String {
    use base64::Engine;
    let mut bytes = [0u8; 32];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

