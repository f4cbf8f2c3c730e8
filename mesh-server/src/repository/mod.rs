//! C2 — repository layer: transactional persistence of every entity in
//! spec.md §3, the single source of truth enforcing uniqueness and
//! referential constraints.
//!
//! `Repository` is expressed as a capability trait (spec.md §9 "Dynamic
//! dispatch... described as capability interfaces") so the orchestration
//! service (C4) is polymorphic over it, generalizing the teacher's
//! concrete `Arc<Mutex<Connection>>` field in `Context` into `Arc<dyn
//! Repository>`. `SqliteRepository` (`repository::sqlite`) is the only
//! implementation: it is opened against an on-disk database file in
//! production and against rusqlite's `:memory:` database in tests, which
//! doubles as the "in-memory test double" spec.md's design notes call
//! for — see DESIGN.md for why a second hand-rolled in-memory store
//! would have duplicated the uniqueness/referential-integrity rules
//! that already live here once.

pub mod sqlite;

pub use sqlite::SqliteRepository;

use crate::error::ServerResult;
use ipnet::IpNet;
use mesh_core::{
    AgentSession, DnsRecord, DnsRecordContents, DnsRecordId, EndpointChangeRecord, Group,
    GroupContents, GroupId, IncidentKind, Label, Network, NetworkContents, NetworkId, Peer,
    PeerContents, PeerId, PeerPair, Policy, PolicyContents, PolicyId, Role, Route, RouteContents,
    RouteId, Rule, SecurityConfig, SecurityIncident, UserId,
};
use serde::Deserialize;
use std::{net::IpAddr, time::SystemTime};

/// Fields of a network mutable post-creation, other than its cidr (which
/// goes through `Repository::change_network_cidr` because of its special
/// transactional shape). Deserializes directly from a PATCH body: an
/// absent field means "leave unchanged".
#[derive(Default, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkUpdate {
    pub name: Option<Label>,
    pub domain_suffix: Option<Label>,
    pub upstream_dns: Option<Vec<IpAddr>>,
    pub default_group_ids: Option<Vec<GroupId>>,
}

/// Caller-supplied fields for peer creation. Address, keys, and the
/// enrollment token are assigned by the service/repository, not the
/// caller (spec.md §3 "Lifecycle: ... key pair generated server-side").
pub struct NewPeer {
    pub name: Label,
    pub public_key: String,
    pub private_key: String,
    pub endpoint: Option<mesh_core::Endpoint>,
    pub listen_port: Option<u16>,
    pub role: Role,
    pub agent_managed: bool,
    pub owner_user_id: Option<UserId>,
    /// `None` when created by an administrator (no default-group
    /// auto-join per spec.md §4.4).
    pub owner_is_admin: bool,
}

#[derive(Default, Clone, Deserialize)]
#[serde(default)]
pub struct PeerUpdate {
    pub name: Option<Label>,
    #[serde(default, with = "serde_with::rust::double_option")]
    pub endpoint: Option<Option<mesh_core::Endpoint>>,
    #[serde(default, with = "serde_with::rust::double_option")]
    pub listen_port: Option<Option<u16>>,
}

#[derive(Default, Clone, Deserialize)]
#[serde(default)]
pub struct GroupUpdate {
    pub name: Option<Label>,
    pub description: Option<String>,
    pub priority: Option<i32>,
}

#[derive(Default, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyUpdate {
    pub name: Option<Label>,
    pub description: Option<String>,
}

#[derive(Default, Clone, Deserialize)]
#[serde(default)]
pub struct RouteUpdate {
    pub name: Option<Label>,
    pub destination_cidr: Option<IpNet>,
    pub jump_peer_id: Option<PeerId>,
    #[serde(default, with = "serde_with::rust::double_option")]
    pub domain_suffix: Option<Option<Label>>,
}

#[derive(Default, Clone, Deserialize)]
#[serde(default)]
pub struct DnsRecordUpdate {
    pub name: Option<Label>,
    pub ip: Option<IpAddr>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// A PATCH body for a network's security config. Thresholds are accepted
/// and reported as whole seconds rather than serde's default
/// `Duration` struct representation, matching how every other duration
/// in the external API is expressed (spec.md §4.8).
#[derive(Default, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfigUpdate {
    pub enabled: Option<bool>,
    #[serde(with = "duration_secs")]
    pub session_conflict_threshold: Option<std::time::Duration>,
    #[serde(with = "duration_secs")]
    pub endpoint_change_threshold: Option<std::time::Duration>,
    pub max_endpoint_changes_per_day: Option<u32>,
}

/// An incident to open, subject to the "at most one unresolved incident
/// of a given kind per peer" guard (spec.md §3, §7).
pub struct NewIncident {
    pub network_id: NetworkId,
    pub peer_id: PeerId,
    pub public_key_at_detection: String,
    pub kind: IncidentKind,
    pub endpoints_involved: Vec<mesh_core::Endpoint>,
    pub detail: String,
}

pub struct Page<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

pub trait Repository: Send + Sync {
    // ---- networks ----
    fn create_network(&self, contents: NetworkContents) -> ServerResult<Network>;
    fn get_network(&self, id: &NetworkId) -> ServerResult<Network>;
    fn find_network_by_name(&self, name: &str) -> ServerResult<Option<Network>>;
    fn list_networks(&self) -> ServerResult<Vec<Network>>;
    fn update_network(&self, id: &NetworkId, update: NetworkUpdate) -> ServerResult<Network>;
    /// Reallocates every peer's address under `new_cidr` and updates the
    /// network in one transaction; fails `invalid-state` if a statically
    /// configured regular peer exists (spec.md §3, §4.2).
    fn change_network_cidr(&self, id: &NetworkId, new_cidr: IpNet) -> ServerResult<Network>;

    // ---- peers ----
    /// Allocates an address, inserts the peer, creates a pair-connection
    /// against every existing peer in the network, and (for non-admin
    /// owners) joins the network's default groups — all in one
    /// transaction (spec.md §4.2).
    fn create_peer(&self, network_id: &NetworkId, new: NewPeer) -> ServerResult<Peer>;
    fn get_peer(&self, network_id: &NetworkId, id: &PeerId) -> ServerResult<Peer>;
    fn find_peer_by_name(&self, network_id: &NetworkId, name: &str) -> ServerResult<Option<Peer>>;
    fn find_peer_by_public_key(&self, network_id: &NetworkId, key: &str) -> ServerResult<Option<Peer>>;
    fn find_peer_by_address(&self, network_id: &NetworkId, ip: IpAddr) -> ServerResult<Option<Peer>>;
    fn find_peer_globally_by_public_key(&self, key: &str) -> ServerResult<Option<Peer>>;
    fn list_peers(&self, network_id: &NetworkId) -> ServerResult<Vec<Peer>>;
    fn update_peer(&self, network_id: &NetworkId, id: &PeerId, update: PeerUpdate) -> ServerResult<Peer>;
    /// Releases the address back to IPAM, deletes every pair-connection
    /// touching the peer, removes it from all groups, then deletes it
    /// (spec.md §4.2). Fails `invalid-state` if this is the network's
    /// last jump peer and the network is non-empty.
    fn delete_peer(&self, network_id: &NetworkId, id: &PeerId) -> ServerResult<()>;
    fn count_jump_peers(&self, network_id: &NetworkId) -> ServerResult<u32>;
    fn peer_pairs_for(&self, network_id: &NetworkId, peer_id: &PeerId) -> ServerResult<Vec<PeerPair>>;
    fn all_peer_pairs(&self, network_id: &NetworkId) -> ServerResult<Vec<PeerPair>>;

    // ---- enrollment ----
    fn set_enrollment_token(&self, network_id: &NetworkId, peer_id: &PeerId, token_hash: &str) -> ServerResult<()>;
    /// Consumes a one-time enrollment token; returns `None` if unknown or
    /// already consumed (spec.md §4.7).
    fn consume_enrollment_token(&self, token_hash: &str) -> ServerResult<Option<(NetworkId, PeerId)>>;
    fn set_session_credential(&self, network_id: &NetworkId, peer_id: &PeerId, credential_hash: &str) -> ServerResult<()>;
    fn find_peer_by_session_credential(&self, credential_hash: &str) -> ServerResult<Option<Peer>>;

    // ---- groups ----
    fn create_group(&self, network_id: &NetworkId, contents: GroupContents) -> ServerResult<Group>;
    fn get_group(&self, network_id: &NetworkId, id: &GroupId) -> ServerResult<Group>;
    fn find_group_by_name(&self, network_id: &NetworkId, name: &str) -> ServerResult<Option<Group>>;
    fn list_groups(&self, network_id: &NetworkId) -> ServerResult<Vec<Group>>;
    fn update_group(&self, network_id: &NetworkId, id: &GroupId, update: GroupUpdate) -> ServerResult<Group>;
    fn delete_group(&self, network_id: &NetworkId, id: &GroupId) -> ServerResult<()>;
    fn groups_containing_peer(&self, network_id: &NetworkId, peer_id: &PeerId) -> ServerResult<Vec<Group>>;
    fn add_peer_to_group(&self, network_id: &NetworkId, group_id: &GroupId, peer_id: &PeerId) -> ServerResult<()>;
    fn remove_peer_from_group(&self, network_id: &NetworkId, group_id: &GroupId, peer_id: &PeerId) -> ServerResult<()>;
    fn attach_policy(&self, network_id: &NetworkId, group_id: &GroupId, policy_id: &PolicyId) -> ServerResult<()>;
    fn detach_policy(&self, network_id: &NetworkId, group_id: &GroupId, policy_id: &PolicyId) -> ServerResult<()>;
    fn attach_route(&self, network_id: &NetworkId, group_id: &GroupId, route_id: &RouteId) -> ServerResult<()>;
    fn detach_route(&self, network_id: &NetworkId, group_id: &GroupId, route_id: &RouteId) -> ServerResult<()>;

    // ---- policies ----
    fn create_policy(&self, network_id: &NetworkId, contents: PolicyContents) -> ServerResult<Policy>;
    fn get_policy(&self, network_id: &NetworkId, id: &PolicyId) -> ServerResult<Policy>;
    fn find_policy_by_name(&self, network_id: &NetworkId, name: &str) -> ServerResult<Option<Policy>>;
    fn list_policies(&self, network_id: &NetworkId) -> ServerResult<Vec<Policy>>;
    fn update_policy(&self, network_id: &NetworkId, id: &PolicyId, update: PolicyUpdate) -> ServerResult<Policy>;
    fn delete_policy(&self, network_id: &NetworkId, id: &PolicyId) -> ServerResult<()>;
    fn add_rule(&self, network_id: &NetworkId, policy_id: &PolicyId, rule: Rule) -> ServerResult<Policy>;
    fn remove_rule(&self, network_id: &NetworkId, policy_id: &PolicyId, rule_index: usize) -> ServerResult<Policy>;

    // ---- routes ----
    fn create_route(&self, network_id: &NetworkId, contents: RouteContents) -> ServerResult<Route>;
    fn get_route(&self, network_id: &NetworkId, id: &RouteId) -> ServerResult<Route>;
    fn find_route_by_name(&self, network_id: &NetworkId, name: &str) -> ServerResult<Option<Route>>;
    fn list_routes(&self, network_id: &NetworkId) -> ServerResult<Vec<Route>>;
    fn update_route(&self, network_id: &NetworkId, id: &RouteId, update: RouteUpdate) -> ServerResult<Route>;
    fn delete_route(&self, network_id: &NetworkId, id: &RouteId) -> ServerResult<()>;

    // ---- dns mappings ----
    fn create_dns_record(&self, route_id: &RouteId, contents: DnsRecordContents) -> ServerResult<DnsRecord>;
    fn get_dns_record(&self, route_id: &RouteId, id: &DnsRecordId) -> ServerResult<DnsRecord>;
    fn list_dns_records(&self, route_id: &RouteId) -> ServerResult<Vec<DnsRecord>>;
    fn list_dns_records_for_network(&self, network_id: &NetworkId) -> ServerResult<Vec<DnsRecord>>;
    fn update_dns_record(&self, route_id: &RouteId, id: &DnsRecordId, update: DnsRecordUpdate) -> ServerResult<DnsRecord>;
    fn delete_dns_record(&self, route_id: &RouteId, id: &DnsRecordId) -> ServerResult<()>;

    // ---- security config ----
    fn get_security_config(&self, network_id: &NetworkId) -> ServerResult<SecurityConfig>;
    fn update_security_config(&self, network_id: &NetworkId, update: SecurityConfigUpdate) -> ServerResult<SecurityConfig>;

    // ---- incidents ----
    /// Opens the incident unless one of the same kind is already
    /// unresolved for the peer; returns `None` when skipped (spec.md §7
    /// "idempotent by (peer id, kind, unresolved) guard").
    fn create_incident_if_absent(&self, incident: NewIncident) -> ServerResult<Option<SecurityIncident>>;
    fn get_incident(&self, network_id: &NetworkId, id: &mesh_core::IncidentId) -> ServerResult<SecurityIncident>;
    fn list_incidents(&self, network_id: &NetworkId, page: u32, page_size: u32) -> ServerResult<Page<SecurityIncident>>;
    fn has_unresolved_incident(&self, peer_id: &PeerId, kind: IncidentKind) -> ServerResult<bool>;
    /// Clears the peer's endpoint-change history, blanks reported
    /// endpoints on its sessions, removes it from quarantine, and marks
    /// the incident resolved — all in one transaction (spec.md §4.2,
    /// §4.5).
    fn resolve_incident(&self, network_id: &NetworkId, id: &mesh_core::IncidentId, resolved_by: &str) -> ServerResult<SecurityIncident>;

    // ---- sessions ----
    fn upsert_session(&self, session: AgentSession) -> ServerResult<()>;
    fn sessions_for_peer(&self, network_id: &NetworkId, peer_id: &PeerId) -> ServerResult<Vec<AgentSession>>;
    fn find_session(&self, network_id: &NetworkId, peer_id: &PeerId, hostname: &str) -> ServerResult<Option<AgentSession>>;

    // ---- endpoint-change records ----
    fn append_endpoint_change(&self, record: EndpointChangeRecord) -> ServerResult<()>;
    fn endpoint_changes_since(&self, network_id: &NetworkId, peer_id: &PeerId, since: SystemTime) -> ServerResult<Vec<EndpointChangeRecord>>;
    fn prune_endpoint_changes_older_than(&self, cutoff: SystemTime) -> ServerResult<()>;

    // ---- quarantine whitelist ----
    fn jump_whitelist(&self, network_id: &NetworkId, jump_id: &PeerId) -> ServerResult<Vec<IpAddr>>;
    fn set_jump_whitelist(&self, network_id: &NetworkId, jump_id: &PeerId, ips: &[IpAddr]) -> ServerResult<()>;
}
