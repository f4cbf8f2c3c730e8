use crate::id::{DnsRecordId, GroupId, IncidentId, NetworkId, PeerId, PolicyId, RouteId, UserId};
use crate::label::Label;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    net::IpAddr,
    str::FromStr,
    time::{Duration, SystemTime},
};

/// An external endpoint, supporting both IP and domain-name hosts, as
/// reported by agents and stored on peers/sessions. Modeled on
/// `innernet_shared::types::Endpoint`, minus its `wireguard-control`/`url`
/// dependency (out of scope here — only a `host:port` string form is
/// needed).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for Endpoint {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or("couldn't parse in form of 'host:port'")?;
        if host.is_empty() {
            return Err("couldn't parse empty host");
        }
        let port = port.parse().map_err(|_| "couldn't parse port")?;
        Ok(Self { host: host.to_string(), port })
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Serialize for Endpoint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Jump,
    Regular,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Administrator,
    User,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkContents {
    pub name: Label,
    pub cidr: IpNet,
    #[serde(default = "default_domain_suffix")]
    pub domain_suffix: Label,
    #[serde(default)]
    pub upstream_dns: Vec<IpAddr>,
    #[serde(default)]
    pub default_group_ids: Vec<GroupId>,
}

fn default_domain_suffix() -> Label {
    "internal".parse().expect("'internal' is a valid label")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    #[serde(flatten)]
    pub contents: NetworkContents,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl std::ops::Deref for Network {
    type Target = NetworkContents;
    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerContents {
    pub name: Label,
    pub public_key: String,
    /// Never serialized to external callers; present server-side only.
    #[serde(skip_serializing)]
    pub private_key: String,
    pub address: IpAddr,
    pub endpoint: Option<Endpoint>,
    pub listen_port: Option<u16>,
    pub role: Role,
    pub agent_managed: bool,
    pub owner_user_id: Option<UserId>,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub network_id: NetworkId,
    #[serde(flatten)]
    pub contents: PeerContents,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl std::ops::Deref for Peer {
    type Target = PeerContents;
    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

pub const DEFAULT_JUMP_LISTEN_PORT: u16 = 51820;
pub const PERSISTENT_KEEPALIVE_INTERVAL_SECS: u16 = 25;

/// An unordered pairwise connection record between two peers in the same
/// network, carrying the preshared key for that pair. Grounded on the
/// teacher's `Association` (CIDR-to-CIDR), generalized here to peer-to-peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerPair {
    pub network_id: NetworkId,
    pub peer_id_1: PeerId,
    pub peer_id_2: PeerId,
    pub preshared_key: String,
}

impl PeerPair {
    /// Canonical (sorted) ordering of the two peer ids, so a pair can be
    /// looked up regardless of which order its members are supplied in.
    pub fn normalize(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn other(&self, id: &PeerId) -> Option<&PeerId> {
        if &self.peer_id_1 == id {
            Some(&self.peer_id_2)
        } else if &self.peer_id_2 == id {
            Some(&self.peer_id_1)
        } else {
            None
        }
    }
}

pub const QUARANTINE_GROUP_NAME: &str = "quarantine";
pub const QUARANTINE_GROUP_PRIORITY: i32 = 0;
pub const QUARANTINE_POLICY_NAME: &str = "quarantine-deny-all";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupContents {
    pub name: Label,
    #[serde(default)]
    pub description: String,
    pub priority: i32,
    #[serde(default)]
    pub peer_ids: Vec<PeerId>,
    #[serde(default)]
    pub policy_ids: Vec<PolicyId>,
    #[serde(default)]
    pub route_ids: Vec<RouteId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub network_id: NetworkId,
    #[serde(flatten)]
    pub contents: GroupContents,
}

impl std::ops::Deref for Group {
    type Target = GroupContents;
    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Deny,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Cidr,
    Peer,
    Group,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rule {
    pub direction: Direction,
    pub action: RuleAction,
    pub target: String,
    pub target_kind: TargetKind,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyContents {
    pub name: Label,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub network_id: NetworkId,
    #[serde(flatten)]
    pub contents: PolicyContents,
}

impl std::ops::Deref for Policy {
    type Target = PolicyContents;
    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteContents {
    pub name: Label,
    pub destination_cidr: IpNet,
    pub jump_peer_id: PeerId,
    pub domain_suffix: Option<Label>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    pub network_id: NetworkId,
    #[serde(flatten)]
    pub contents: RouteContents,
}

impl std::ops::Deref for Route {
    type Target = RouteContents;
    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DnsRecordContents {
    pub name: Label,
    pub ip: IpAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DnsRecord {
    pub id: DnsRecordId,
    pub route_id: RouteId,
    #[serde(flatten)]
    pub contents: DnsRecordContents,
}

impl std::ops::Deref for DnsRecord {
    type Target = DnsRecordContents;
    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentSession {
    pub network_id: NetworkId,
    pub peer_id: PeerId,
    pub session_id: String,
    pub hostname: String,
    pub system_uptime: u64,
    pub tunnel_uptime: u64,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub reported_endpoint: Option<Endpoint>,
}

impl AgentSession {
    pub fn is_active(&self, now: SystemTime, threshold: Duration) -> bool {
        now.duration_since(self.last_seen).unwrap_or_default() <= threshold
    }
}

/// The observing source of an endpoint-change record: either a specific
/// jump peer that reported it via heartbeat, or the symbolic WireGuard
/// handshake source (spec §3).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointSource {
    Peer(PeerId),
    WireGuard,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointChangeRecord {
    pub network_id: NetworkId,
    pub peer_id: PeerId,
    pub old_endpoint: Option<Endpoint>,
    pub new_endpoint: Option<Endpoint>,
    pub changed_at: SystemTime,
    pub source: EndpointSource,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    SessionConflict,
    SharedConfig,
    SuspiciousActivity,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecurityIncident {
    pub id: IncidentId,
    pub network_id: NetworkId,
    pub peer_id: PeerId,
    pub public_key_at_detection: String,
    pub kind: IncidentKind,
    pub detected_at: SystemTime,
    pub endpoints_involved: Vec<Endpoint>,
    pub detail: String,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<SystemTime>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub network_id: NetworkId,
    pub enabled: bool,
    pub session_conflict_threshold: Duration,
    pub endpoint_change_threshold: Duration,
    pub max_endpoint_changes_per_day: u32,
}

impl SecurityConfig {
    pub fn defaults(network_id: NetworkId) -> Self {
        Self {
            network_id,
            enabled: true,
            session_conflict_threshold: Duration::from_secs(5 * 60),
            endpoint_change_threshold: Duration::from_secs(30 * 60),
            max_endpoint_changes_per_day: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_round_trips() {
        let e: Endpoint = "10.0.0.5:51820".parse().unwrap();
        assert_eq!(e.host(), "10.0.0.5");
        assert_eq!(e.port(), 51820);
        assert_eq!(e.to_string(), "10.0.0.5:51820");
    }

    #[test]
    fn endpoint_rejects_missing_port() {
        assert!("10.0.0.5".parse::<Endpoint>().is_err());
    }

    #[test]
    fn peer_pair_normalizes_regardless_of_order() {
        let a = PeerId::from("a".to_string());
        let b = PeerId::from("b".to_string());
        assert_eq!(PeerPair::normalize(a.clone(), b.clone()), PeerPair::normalize(b, a));
    }
}
