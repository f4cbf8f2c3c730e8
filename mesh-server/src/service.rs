//! C4 — orchestration service: every write operation on networks, peers,
//! groups, policies, routes, and DNS mappings, plus the quarantine/reconnect
//! pair C5 drives. Owns authorization, input validation, and the
//! notification policy (spec.md §4.4); delegates persistence to C2 and
//! config-change fan-out to C6.
//!
//! Generalizes the teacher's `Context`-threaded free functions (`add_cidr`,
//! `add_peer`, ...) into methods on one collaborator struct, the way the
//! spec's design notes ask ("the orchestration service is polymorphic over
//! [its collaborators]").

use crate::{
    auth::Principal,
    error::{ServerError, ServerResult},
    keys::KeyPairSource,
    notify::Hub,
    repository::{
        DnsRecordUpdate, GroupUpdate, NetworkUpdate, NewIncident, NewPeer, Page, PeerUpdate,
        PolicyUpdate, Repository, RouteUpdate, SecurityConfigUpdate,
    },
};
use ipnet::IpNet;
use mesh_core::{
    DnsRecord, DnsRecordContents, DnsRecordId, Endpoint, Group, GroupContents, GroupId,
    IncidentKind, Label, Network, NetworkContents, NetworkId, Peer, PeerId, Policy,
    PolicyContents, PolicyId, Role, Route, RouteContents, RouteId, Rule, SecurityConfig,
    SecurityIncident, UserId, QUARANTINE_GROUP_NAME, QUARANTINE_GROUP_PRIORITY,
    QUARANTINE_POLICY_NAME,
};
use std::sync::Arc;

fn require_admin(principal: &Principal) -> ServerResult<()> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(ServerError::Forbidden("administrator privileges required".into()))
    }
}

/// Allows the operation when the caller is an administrator, or when
/// `owner` names the caller themself (spec.md §4.4 "administrator vs.
/// owner"). A peer with no owner (admin-created) can only be touched by
/// an administrator.
fn require_admin_or_owner(principal: &Principal, owner: Option<&UserId>) -> ServerResult<()> {
    if principal.is_admin() {
        return Ok(());
    }
    match owner {
        Some(owner_id) if owner_id == &principal.user_id => Ok(()),
        _ => Err(ServerError::Forbidden("not the owner of this resource".into())),
    }
}

/// Slices an already-loaded resource list into one page (spec.md §4.8).
/// These six resources live entirely under one network or route, so
/// unlike incidents (which can accumulate without bound) a single query
/// plus an in-memory slice is the simplest correct implementation —
/// the repository layer keeps exposing the unpaged list for callers
/// (config generation, heartbeat reconciliation) that need every row.
fn paginate<T>(items: Vec<T>, page: u32, page_size: u32) -> Page<T> {
    let page = page.max(1);
    let page_size = page_size.max(1);
    let total = items.len() as u64;
    let start = (page - 1) as usize * page_size as usize;
    let data = items.into_iter().skip(start).take(page_size as usize).collect();
    Page { data, page, page_size, total }
}

/// Swallows a not-found error, used to make the idempotent parts of
/// quarantine/reconnect genuinely idempotent (spec.md §4.4 "reconnect...
/// is idempotent when the group or membership is absent").
fn ignore_not_found(result: ServerResult<()>) -> ServerResult<()> {
    match result {
        Err(ServerError::NotFound(_)) => Ok(()),
        other => other,
    }
}

fn ignore_conflict(result: ServerResult<()>) -> ServerResult<()> {
    match result {
        Err(ServerError::Conflict(_)) => Ok(()),
        other => other,
    }
}

pub struct Service {
    repo: Arc<dyn Repository>,
    notifier: Arc<Hub>,
    keys: Arc<dyn KeyPairSource>,
}

impl Service {
    pub fn new(repo: Arc<dyn Repository>, notifier: Arc<Hub>, keys: Arc<dyn KeyPairSource>) -> Self {
        Self { repo, notifier, keys }
    }

    // ---------------------------------------------------------------
    // networks
    // ---------------------------------------------------------------

    pub fn create_network(&self, principal: &Principal, contents: NetworkContents) -> ServerResult<Network> {
        require_admin(principal)?;
        self.repo.create_network(contents)
    }

    pub fn get_network(&self, id: &NetworkId) -> ServerResult<Network> {
        self.repo.get_network(id)
    }

    pub fn list_networks(&self, page: u32, page_size: u32) -> ServerResult<Page<Network>> {
        Ok(paginate(self.repo.list_networks()?, page, page_size))
    }

    pub fn update_network(
        &self,
        principal: &Principal,
        id: &NetworkId,
        update: NetworkUpdate,
    ) -> ServerResult<Network> {
        require_admin(principal)?;
        // Name-only updates don't change any peer's materialized config
        // (spec.md §4.4 "name-only updates... no notification"); anything
        // touching domain_suffix/upstream_dns/default_group_ids does,
        // since those feed DNS and default-group assignment.
        let name_only = update.domain_suffix.is_none()
            && update.upstream_dns.is_none()
            && update.default_group_ids.is_none();
        let network = self.repo.update_network(id, update)?;
        if !name_only {
            self.notifier.notify_network(id);
        }
        Ok(network)
    }

    pub fn change_network_cidr(
        &self,
        principal: &Principal,
        id: &NetworkId,
        new_cidr: IpNet,
    ) -> ServerResult<Network> {
        require_admin(principal)?;
        let network = self.repo.change_network_cidr(id, new_cidr)?;
        self.notifier.notify_network(id);
        Ok(network)
    }

    // ---------------------------------------------------------------
    // peers
    // ---------------------------------------------------------------

    /// Creates a peer, generating its key pair and enrollment token. For
    /// a non-administrator caller, the peer is auto-joined to the
    /// network's default groups (spec.md §4.4 "Default groups").
    pub fn create_peer(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        name: Label,
        endpoint: Option<Endpoint>,
        listen_port: Option<u16>,
        role: Role,
        agent_managed: bool,
    ) -> ServerResult<(Peer, String)> {
        if role == Role::Jump && !agent_managed {
            return Err(ServerError::Validation("jump peers must be agent-managed".into()));
        }
        let keys = self.keys.generate();
        let owner_user_id = if principal.is_admin() { None } else { Some(principal.user_id.clone()) };
        let new_peer = NewPeer {
            name,
            public_key: keys.public_key,
            private_key: keys.private_key,
            endpoint,
            listen_port: if role == Role::Jump {
                Some(listen_port.unwrap_or(mesh_core::DEFAULT_JUMP_LISTEN_PORT))
            } else {
                listen_port
            },
            role,
            agent_managed,
            owner_user_id,
            owner_is_admin: principal.is_admin(),
        };
        let peer = self.repo.create_peer(network_id, new_peer)?;
        let enrollment_token = crate::auth::issue_enrollment_token(&*self.repo, network_id, &peer.id)?;
        self.notifier.notify_network(network_id);
        Ok((peer, enrollment_token))
    }

    pub fn get_peer(&self, network_id: &NetworkId, id: &PeerId) -> ServerResult<Peer> {
        self.repo.get_peer(network_id, id)
    }

    pub fn list_peers(&self, network_id: &NetworkId, page: u32, page_size: u32) -> ServerResult<Page<Peer>> {
        Ok(paginate(self.repo.list_peers(network_id)?, page, page_size))
    }

    pub fn update_peer(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        id: &PeerId,
        update: PeerUpdate,
    ) -> ServerResult<Peer> {
        let existing = self.repo.get_peer(network_id, id)?;
        require_admin_or_owner(principal, existing.owner_user_id.as_ref())?;
        let name_only = update.endpoint.is_none() && update.listen_port.is_none();
        let peer = self.repo.update_peer(network_id, id, update)?;
        if !name_only {
            self.notifier.notify_network(network_id);
        }
        Ok(peer)
    }

    pub fn delete_peer(&self, principal: &Principal, network_id: &NetworkId, id: &PeerId) -> ServerResult<()> {
        let existing = self.repo.get_peer(network_id, id)?;
        require_admin_or_owner(principal, existing.owner_user_id.as_ref())?;
        self.repo.delete_peer(network_id, id)?;
        self.notifier.notify_network(network_id);
        Ok(())
    }

    // ---------------------------------------------------------------
    // groups
    // ---------------------------------------------------------------

    pub fn create_group(&self, principal: &Principal, network_id: &NetworkId, contents: GroupContents) -> ServerResult<Group> {
        require_admin(principal)?;
        self.repo.create_group(network_id, contents)
    }

    pub fn get_group(&self, network_id: &NetworkId, id: &GroupId) -> ServerResult<Group> {
        self.repo.get_group(network_id, id)
    }

    pub fn list_groups(&self, network_id: &NetworkId, page: u32, page_size: u32) -> ServerResult<Page<Group>> {
        Ok(paginate(self.repo.list_groups(network_id)?, page, page_size))
    }

    pub fn update_group(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        id: &GroupId,
        update: GroupUpdate,
    ) -> ServerResult<Group> {
        require_admin(principal)?;
        let name_only = update.priority.is_none();
        let group = self.repo.update_group(network_id, id, update)?;
        if !name_only {
            self.notifier.notify_network(network_id);
        }
        Ok(group)
    }

    pub fn delete_group(&self, principal: &Principal, network_id: &NetworkId, id: &GroupId) -> ServerResult<()> {
        require_admin(principal)?;
        let group = self.repo.get_group(network_id, id)?;
        if group.name.as_str() == QUARANTINE_GROUP_NAME {
            return Err(ServerError::InvalidState("the quarantine group cannot be deleted".into()));
        }
        self.repo.delete_group(network_id, id)?;
        self.notifier.notify_network(network_id);
        Ok(())
    }

    pub fn add_peer_to_group(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        group_id: &GroupId,
        peer_id: &PeerId,
    ) -> ServerResult<()> {
        require_admin(principal)?;
        // The repository surfaces the join table's unique constraint as a
        // generic conflict; spec.md §7 classifies "peer already in group"
        // as `invalid-state`, so the service re-maps it here.
        match self.repo.add_peer_to_group(network_id, group_id, peer_id) {
            Err(ServerError::Conflict(_)) => {
                return Err(ServerError::InvalidState("peer is already a member of this group".into()))
            },
            other => other?,
        }
        self.notifier.notify_network(network_id);
        Ok(())
    }

    pub fn remove_peer_from_group(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        group_id: &GroupId,
        peer_id: &PeerId,
    ) -> ServerResult<()> {
        require_admin(principal)?;
        self.repo.remove_peer_from_group(network_id, group_id, peer_id)?;
        self.notifier.notify_network(network_id);
        Ok(())
    }

    pub fn attach_policy(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        group_id: &GroupId,
        policy_id: &PolicyId,
    ) -> ServerResult<()> {
        require_admin(principal)?;
        self.repo.attach_policy(network_id, group_id, policy_id)?;
        self.notifier.notify_network(network_id);
        Ok(())
    }

    pub fn detach_policy(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        group_id: &GroupId,
        policy_id: &PolicyId,
    ) -> ServerResult<()> {
        require_admin(principal)?;
        self.repo.detach_policy(network_id, group_id, policy_id)?;
        self.notifier.notify_network(network_id);
        Ok(())
    }

    pub fn attach_route(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        group_id: &GroupId,
        route_id: &RouteId,
    ) -> ServerResult<()> {
        require_admin(principal)?;
        self.repo.attach_route(network_id, group_id, route_id)?;
        self.notifier.notify_network(network_id);
        Ok(())
    }

    pub fn detach_route(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        group_id: &GroupId,
        route_id: &RouteId,
    ) -> ServerResult<()> {
        require_admin(principal)?;
        self.repo.detach_route(network_id, group_id, route_id)?;
        self.notifier.notify_network(network_id);
        Ok(())
    }

    // ---------------------------------------------------------------
    // policies
    // ---------------------------------------------------------------

    pub fn create_policy(&self, principal: &Principal, network_id: &NetworkId, contents: PolicyContents) -> ServerResult<Policy> {
        require_admin(principal)?;
        self.repo.create_policy(network_id, contents)
    }

    pub fn get_policy(&self, network_id: &NetworkId, id: &PolicyId) -> ServerResult<Policy> {
        self.repo.get_policy(network_id, id)
    }

    pub fn list_policies(&self, network_id: &NetworkId, page: u32, page_size: u32) -> ServerResult<Page<Policy>> {
        Ok(paginate(self.repo.list_policies(network_id)?, page, page_size))
    }

    pub fn update_policy(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        id: &PolicyId,
        update: PolicyUpdate,
    ) -> ServerResult<Policy> {
        require_admin(principal)?;
        self.repo.update_policy(network_id, id, update)
    }

    pub fn delete_policy(&self, principal: &Principal, network_id: &NetworkId, id: &PolicyId) -> ServerResult<()> {
        require_admin(principal)?;
        self.repo.delete_policy(network_id, id)?;
        self.notifier.notify_network(network_id);
        Ok(())
    }

    pub fn add_rule(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        policy_id: &PolicyId,
        rule: Rule,
    ) -> ServerResult<Policy> {
        require_admin(principal)?;
        let policy = self.repo.add_rule(network_id, policy_id, rule)?;
        self.notifier.notify_network(network_id);
        Ok(policy)
    }

    pub fn remove_rule(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        policy_id: &PolicyId,
        rule_index: usize,
    ) -> ServerResult<Policy> {
        require_admin(principal)?;
        let policy = self.repo.remove_rule(network_id, policy_id, rule_index)?;
        self.notifier.notify_network(network_id);
        Ok(policy)
    }

    // ---------------------------------------------------------------
    // routes
    // ---------------------------------------------------------------

    pub fn create_route(&self, principal: &Principal, network_id: &NetworkId, contents: RouteContents) -> ServerResult<Route> {
        require_admin(principal)?;
        let jump = self.repo.get_peer(network_id, &contents.jump_peer_id)?;
        if jump.role != Role::Jump {
            return Err(ServerError::Validation("jump_peer_id must reference a jump peer".into()));
        }
        self.repo.create_route(network_id, contents)
    }

    pub fn get_route(&self, network_id: &NetworkId, id: &RouteId) -> ServerResult<Route> {
        self.repo.get_route(network_id, id)
    }

    pub fn list_routes(&self, network_id: &NetworkId, page: u32, page_size: u32) -> ServerResult<Page<Route>> {
        Ok(paginate(self.repo.list_routes(network_id)?, page, page_size))
    }

    pub fn update_route(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        id: &RouteId,
        update: RouteUpdate,
    ) -> ServerResult<Route> {
        require_admin(principal)?;
        if let Some(jump_peer_id) = &update.jump_peer_id {
            let jump = self.repo.get_peer(network_id, jump_peer_id)?;
            if jump.role != Role::Jump {
                return Err(ServerError::Validation("jump_peer_id must reference a jump peer".into()));
            }
        }
        let name_only = update.destination_cidr.is_none()
            && update.jump_peer_id.is_none()
            && update.domain_suffix.is_none();
        let route = self.repo.update_route(network_id, id, update)?;
        if !name_only {
            self.notifier.notify_network(network_id);
        }
        Ok(route)
    }

    pub fn delete_route(&self, principal: &Principal, network_id: &NetworkId, id: &RouteId) -> ServerResult<()> {
        require_admin(principal)?;
        self.repo.delete_route(network_id, id)?;
        self.notifier.notify_network(network_id);
        Ok(())
    }

    // ---------------------------------------------------------------
    // dns mappings
    // ---------------------------------------------------------------

    pub fn create_dns_record(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        route_id: &RouteId,
        contents: DnsRecordContents,
    ) -> ServerResult<DnsRecord> {
        require_admin(principal)?;
        let route = self.repo.get_route(network_id, route_id)?;
        if !route.destination_cidr.contains(&contents.ip) {
            return Err(ServerError::Validation("ip must fall within the route's destination cidr".into()));
        }
        let record = self.repo.create_dns_record(route_id, contents)?;
        self.notifier.notify_network(network_id);
        Ok(record)
    }

    pub fn get_dns_record(&self, route_id: &RouteId, id: &DnsRecordId) -> ServerResult<DnsRecord> {
        self.repo.get_dns_record(route_id, id)
    }

    pub fn list_dns_records(
        &self,
        route_id: &RouteId,
        page: u32,
        page_size: u32,
    ) -> ServerResult<Page<DnsRecord>> {
        Ok(paginate(self.repo.list_dns_records(route_id)?, page, page_size))
    }

    pub fn update_dns_record(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        route_id: &RouteId,
        id: &DnsRecordId,
        update: DnsRecordUpdate,
    ) -> ServerResult<DnsRecord> {
        require_admin(principal)?;
        if let Some(ip) = update.ip {
            let route = self.repo.get_route(network_id, route_id)?;
            if !route.destination_cidr.contains(&ip) {
                return Err(ServerError::Validation("ip must fall within the route's destination cidr".into()));
            }
        }
        let record = self.repo.update_dns_record(route_id, id, update)?;
        self.notifier.notify_network(network_id);
        Ok(record)
    }

    pub fn delete_dns_record(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        route_id: &RouteId,
        id: &DnsRecordId,
    ) -> ServerResult<()> {
        require_admin(principal)?;
        self.repo.delete_dns_record(route_id, id)?;
        self.notifier.notify_network(network_id);
        Ok(())
    }

    // ---------------------------------------------------------------
    // security config & incidents
    // ---------------------------------------------------------------

    pub fn get_security_config(&self, network_id: &NetworkId) -> ServerResult<SecurityConfig> {
        self.repo.get_security_config(network_id)
    }

    pub fn update_security_config(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        update: SecurityConfigUpdate,
    ) -> ServerResult<SecurityConfig> {
        require_admin(principal)?;
        self.repo.update_security_config(network_id, update)
    }

    pub fn get_incident(&self, network_id: &NetworkId, id: &mesh_core::IncidentId) -> ServerResult<SecurityIncident> {
        self.repo.get_incident(network_id, id)
    }

    pub fn list_incidents(
        &self,
        network_id: &NetworkId,
        page: u32,
        page_size: u32,
    ) -> ServerResult<crate::repository::Page<SecurityIncident>> {
        self.repo.list_incidents(network_id, page, page_size)
    }

    /// Resolves an incident: clears the peer's endpoint-change history,
    /// blanks reported endpoints, and reconnects the peer, all inside
    /// the repository's single transaction (spec.md §4.2, §4.5).
    pub fn resolve_incident(
        &self,
        principal: &Principal,
        network_id: &NetworkId,
        id: &mesh_core::IncidentId,
    ) -> ServerResult<SecurityIncident> {
        require_admin(principal)?;
        let incident = self.repo.resolve_incident(network_id, id, principal.user_id.as_str())?;
        self.notifier.notify_network(network_id);
        Ok(incident)
    }

    pub fn create_incident_if_absent(&self, incident: NewIncident) -> ServerResult<Option<SecurityIncident>> {
        self.repo.create_incident_if_absent(incident)
    }

    // ---------------------------------------------------------------
    // quarantine / reconnect (invoked by C5, spec.md §4.4, §4.5)
    // ---------------------------------------------------------------

    /// Ensures the network's `quarantine` group and `quarantine-deny-all`
    /// policy exist, then adds `peer_id`. Idempotent: re-quarantining an
    /// already-quarantined peer is a no-op.
    pub fn quarantine(&self, network_id: &NetworkId, peer_id: &PeerId, reason: &str) -> ServerResult<()> {
        log::warn!("quarantining peer {peer_id} in network {network_id}: {reason}");
        let group = self.ensure_quarantine_group(network_id)?;
        ignore_conflict(self.repo.add_peer_to_group(network_id, &group.id, peer_id))?;
        self.notifier.notify_network(network_id);
        Ok(())
    }

    /// Removes `peer_id` from the quarantine group, if present. Idempotent
    /// when the group or membership is absent (spec.md §4.4).
    pub fn reconnect(&self, network_id: &NetworkId, peer_id: &PeerId) -> ServerResult<()> {
        if let Some(group) = self.repo.find_group_by_name(network_id, QUARANTINE_GROUP_NAME)? {
            ignore_not_found(self.repo.remove_peer_from_group(network_id, &group.id, peer_id))?;
            self.notifier.notify_network(network_id);
        }
        Ok(())
    }

    fn ensure_quarantine_group(&self, network_id: &NetworkId) -> ServerResult<Group> {
        let group = match self.repo.find_group_by_name(network_id, QUARANTINE_GROUP_NAME)? {
            Some(group) => group,
            None => self.repo.create_group(
                network_id,
                GroupContents {
                    name: QUARANTINE_GROUP_NAME.parse().expect("reserved name is a valid label"),
                    description: "peers implicated in a security incident".into(),
                    priority: QUARANTINE_GROUP_PRIORITY,
                    peer_ids: vec![],
                    policy_ids: vec![],
                    route_ids: vec![],
                },
            )?,
        };
        let policy = match self.repo.find_policy_by_name(network_id, QUARANTINE_POLICY_NAME)? {
            Some(policy) => policy,
            None => self.repo.create_policy(
                network_id,
                PolicyContents {
                    name: QUARANTINE_POLICY_NAME.parse().expect("reserved name is a valid label"),
                    description: "denies all traffic; attached to the quarantine group".into(),
                    rules: vec![
                        Rule {
                            direction: mesh_core::Direction::Input,
                            action: mesh_core::RuleAction::Deny,
                            target: "0.0.0.0/0".into(),
                            target_kind: mesh_core::TargetKind::Cidr,
                            description: None,
                        },
                        Rule {
                            direction: mesh_core::Direction::Output,
                            action: mesh_core::RuleAction::Deny,
                            target: "0.0.0.0/0".into(),
                            target_kind: mesh_core::TargetKind::Cidr,
                            description: None,
                        },
                    ],
                },
            )?,
        };
        if !group.policy_ids.contains(&policy.id) {
            ignore_conflict(self.repo.attach_policy(network_id, &group.id, &policy.id))?;
        }
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{auth::NoAuthenticator, keys::X25519KeyPairSource, repository::SqliteRepository};

    fn service() -> (Service, Principal) {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let notifier = Arc::new(Hub::new());
        let keys: Arc<dyn KeyPairSource> = Arc::new(X25519KeyPairSource);
        let service = Service::new(repo, notifier, keys);
        use crate::auth::Authenticator;
        let principal = NoAuthenticator::new().authenticate("x").unwrap();
        (service, principal)
    }

    fn regular_user(user_id: UserId) -> Principal {
        Principal { user_id, role: mesh_core::UserRole::User }
    }

    #[test]
    fn default_group_assignment_applies_only_to_non_admin_creators() {
        let (service, admin) = service();
        let network = service
            .create_network(
                &admin,
                NetworkContents {
                    name: "office".parse().unwrap(),
                    cidr: "10.0.0.0/24".parse().unwrap(),
                    domain_suffix: "internal".parse().unwrap(),
                    upstream_dns: vec![],
                    default_group_ids: vec![],
                },
            )
            .unwrap();
        let group = service
            .create_group(
                &admin,
                &network.id,
                GroupContents {
                    name: "g1".parse().unwrap(),
                    description: String::new(),
                    priority: 10,
                    peer_ids: vec![],
                    policy_ids: vec![],
                    route_ids: vec![],
                },
            )
            .unwrap();
        service
            .update_network(
                &admin,
                &network.id,
                NetworkUpdate { default_group_ids: Some(vec![group.id.clone()]), ..Default::default() },
            )
            .unwrap();

        let user = regular_user(UserId::new());
        let (phone, _token) = service
            .create_peer(&user, &network.id, "phone".parse().unwrap(), None, None, Role::Regular, true)
            .unwrap();
        assert_eq!(phone.group_ids, vec![group.id.clone()]);

        let (laptop, _token) = service
            .create_peer(&admin, &network.id, "laptop".parse().unwrap(), None, None, Role::Regular, true)
            .unwrap();
        assert!(laptop.group_ids.is_empty());
    }

    #[test]
    fn non_owner_cannot_delete_another_users_peer() {
        let (service, admin) = service();
        let network = service
            .create_network(
                &admin,
                NetworkContents {
                    name: "office".parse().unwrap(),
                    cidr: "10.0.0.0/24".parse().unwrap(),
                    domain_suffix: "internal".parse().unwrap(),
                    upstream_dns: vec![],
                    default_group_ids: vec![],
                },
            )
            .unwrap();
        let owner = regular_user(UserId::new());
        let (peer, _token) = service
            .create_peer(&owner, &network.id, "phone".parse().unwrap(), None, None, Role::Regular, true)
            .unwrap();

        let other = regular_user(UserId::new());
        let result = service.delete_peer(&other, &network.id, &peer.id);
        assert!(matches!(result, Err(ServerError::Forbidden(_))));
    }

    #[test]
    fn quarantine_then_reconnect_is_idempotent() {
        let (service, admin) = service();
        let network = service
            .create_network(
                &admin,
                NetworkContents {
                    name: "office".parse().unwrap(),
                    cidr: "10.0.0.0/24".parse().unwrap(),
                    domain_suffix: "internal".parse().unwrap(),
                    upstream_dns: vec![],
                    default_group_ids: vec![],
                },
            )
            .unwrap();
        let (gw, _) = service
            .create_peer(&admin, &network.id, "gw".parse().unwrap(), None, None, Role::Jump, true)
            .unwrap();
        let (lap, _) = service
            .create_peer(&admin, &network.id, "lap".parse().unwrap(), None, None, Role::Regular, true)
            .unwrap();
        let _ = gw;

        service.quarantine(&network.id, &lap.id, "test").unwrap();
        service.quarantine(&network.id, &lap.id, "test again").unwrap();
        let groups = service.list_groups(&network.id, 1, 100).unwrap().data;
        let quarantine = groups.iter().find(|g| g.name.as_str() == QUARANTINE_GROUP_NAME).unwrap();
        assert_eq!(quarantine.peer_ids.iter().filter(|id| *id == &lap.id).count(), 1);

        service.reconnect(&network.id, &lap.id).unwrap();
        service.reconnect(&network.id, &lap.id).unwrap();
        let groups = service.list_groups(&network.id, 1, 100).unwrap().data;
        let quarantine = groups.iter().find(|g| g.name.as_str() == QUARANTINE_GROUP_NAME).unwrap();
        assert!(!quarantine.peer_ids.contains(&lap.id));
    }
}
