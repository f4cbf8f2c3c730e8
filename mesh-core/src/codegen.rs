//! C3 — config generator.
//!
//! Pure functions turning a peer's view of the network graph into its
//! WireGuard tunnel config and, for jump peers, its DNS record list and
//! firewall rule list. Nothing in this module performs I/O, touches a
//! clock, or holds state across calls — identical inputs always produce
//! byte-identical output (spec §4.3, §8).

use crate::{
    error::CoreError,
    id::PeerId,
    label::sanitize_label,
    model::{
        Direction, DnsRecord, Group, Network, Peer, PeerPair, Policy, Role, Route, RuleAction,
        TargetKind, PERSISTENT_KEEPALIVE_INTERVAL_SECS, QUARANTINE_GROUP_NAME,
    },
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write as _,
};

/// Everything the generator needs about a network, gathered by the caller
/// (C4/C8) from repository reads. Borrowed, never mutated.
pub struct NetworkView<'a> {
    pub network: &'a Network,
    pub peers: &'a [Peer],
    pub groups: &'a [Group],
    pub policies: &'a [Policy],
    pub routes: &'a [Route],
    pub dns_records: &'a [DnsRecord],
    pub pairs: &'a [PeerPair],
}

impl<'a> NetworkView<'a> {
    fn peer(&self, id: &PeerId) -> Option<&'a Peer> {
        self.peers.iter().find(|p| &p.id == id)
    }

    fn groups_containing(&self, id: &PeerId) -> Vec<&'a Group> {
        let mut groups: Vec<&Group> = self
            .groups
            .iter()
            .filter(|g| g.peer_ids.contains(id))
            .collect();
        groups.sort_by_key(|g| (g.priority, g.name.to_string()));
        groups
    }

    fn is_quarantined(&self, id: &PeerId) -> bool {
        self.groups_containing(id)
            .iter()
            .any(|g| g.name.as_str() == QUARANTINE_GROUP_NAME)
    }

    fn policy(&self, id: &crate::id::PolicyId) -> Option<&'a Policy> {
        self.policies.iter().find(|p| &p.id == id)
    }

    fn preshared_key(&self, a: &PeerId, b: &PeerId) -> Option<&'a str> {
        let (x, y) = PeerPair::normalize(a.clone(), b.clone());
        self.pairs
            .iter()
            .find(|p| p.peer_id_1 == x && p.peer_id_2 == y)
            .map(|p| p.preshared_key.as_str())
    }

    /// Addresses of every member of a group.
    fn group_member_addresses(&self, group: &Group) -> Vec<std::net::IpAddr> {
        group
            .peer_ids
            .iter()
            .filter_map(|id| self.peer(id))
            .map(|p| p.address)
            .collect()
    }

    /// First matching rule (in group-priority, then policy, then rule order)
    /// across every group `source` belongs to, evaluated for `direction`
    /// against `dest`. `None` means no rule matched (implicit allow).
    fn first_matching_rule_action(
        &self,
        source: &Peer,
        dest: &Peer,
        direction: Direction,
    ) -> Option<RuleAction> {
        for group in self.groups_containing(&source.id) {
            for policy_id in &group.policy_ids {
                let Some(policy) = self.policy(policy_id) else { continue };
                for rule in &policy.rules {
                    if rule.direction != direction {
                        continue;
                    }
                    let matches = match rule.target_kind {
                        TargetKind::Cidr => rule
                            .target
                            .parse::<ipnet::IpNet>()
                            .map(|net| net.contains(&dest.address))
                            .unwrap_or(false),
                        TargetKind::Peer => rule.target == dest.id.as_str(),
                        TargetKind::Group => self
                            .groups
                            .iter()
                            .find(|g| g.id.as_str() == rule.target)
                            .map(|g| g.peer_ids.contains(&dest.id))
                            .unwrap_or(false),
                    };
                    if matches {
                        return Some(rule.action);
                    }
                }
            }
        }
        None
    }

    /// Whether `source` may communicate with `dest` at all, folding in
    /// quarantine symmetry and policy evaluation (spec §4.3).
    fn communication_allowed(&self, source: &Peer, dest: &Peer) -> bool {
        if self.is_quarantined(&source.id) || self.is_quarantined(&dest.id) {
            return false;
        }
        if dest.role == Role::Jump {
            return true;
        }
        !matches!(self.first_matching_rule_action(source, dest, Direction::Output), Some(RuleAction::Deny))
    }

    /// The set of peers `source` can see: every jump peer, plus every peer
    /// communication is not forbidden with. Symmetric with respect to
    /// quarantine. Sorted by name for deterministic output.
    pub fn peer_view(&self, source: &Peer) -> Vec<&'a Peer> {
        let mut view: Vec<&Peer> = self
            .peers
            .iter()
            .filter(|p| p.id != source.id)
            .filter(|p| self.communication_allowed(source, p))
            .collect();
        view.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
        view
    }

    /// Routes reachable by `source` via its group memberships, deduplicated
    /// by route id.
    fn reachable_routes(&self, source: &Peer) -> Vec<&'a Route> {
        let mut route_ids = BTreeSet::new();
        for group in self.groups_containing(&source.id) {
            for route_id in &group.route_ids {
                route_ids.insert(route_id.clone());
            }
        }
        let mut routes: Vec<&Route> = self
            .routes
            .iter()
            .filter(|r| route_ids.contains(&r.id))
            .collect();
        routes.sort_by_key(|r| r.name.to_string());
        routes
    }

    /// The AllowedIPs a `source` peer should carry for a given `dest` peer
    /// in its view (spec §4.3 "Allowed-destinations computation").
    fn allowed_ips(&self, source: &Peer, dest: &Peer) -> Vec<String> {
        if dest.role != Role::Jump {
            return vec![format!("{}/32", dest.address)];
        }
        let mut cidrs = vec![self.network.cidr.to_string()];
        for route in self.reachable_routes(source) {
            if &route.jump_peer_id == &dest.id {
                cidrs.push(route.destination_cidr.to_string());
            }
        }
        cidrs
    }

    /// Renders the WireGuard INI tunnel config for `peer_id`'s point of view.
    pub fn tunnel_config(&self, peer_id: &PeerId) -> Result<String, CoreError> {
        let source = self
            .peer(peer_id)
            .ok_or_else(|| CoreError::Validation("unknown peer".into()))?;

        let mut out = String::new();
        writeln!(out, "[Interface]").ok();
        writeln!(out, "PrivateKey = {}", source.private_key).ok();
        writeln!(out, "Address = {}", source.address).ok();
        if source.role == Role::Jump {
            writeln!(out, "ListenPort = {}", source.listen_port.unwrap_or(crate::model::DEFAULT_JUMP_LISTEN_PORT)).ok();
        }
        if source.role != Role::Jump {
            if let Some(jump) = self.peer_view(source).into_iter().find(|p| p.role == Role::Jump) {
                writeln!(out, "DNS = {}", jump.address).ok();
            }
        }

        for dest in self.peer_view(source) {
            writeln!(out).ok();
            writeln!(out, "[Peer]").ok();
            writeln!(out, "# Name: {}", dest.name).ok();
            writeln!(out, "PublicKey = {}", dest.public_key).ok();
            if let Some(psk) = self.preshared_key(&source.id, &dest.id) {
                writeln!(out, "PresharedKey = {}", psk).ok();
            }
            if let Some(endpoint) = &dest.endpoint {
                writeln!(out, "Endpoint = {}", endpoint).ok();
            }
            writeln!(out, "AllowedIPs = {}", self.allowed_ips(source, dest).join(", ")).ok();
            if source.role != Role::Jump {
                writeln!(out, "PersistentKeepalive = {}", PERSISTENT_KEEPALIVE_INTERVAL_SECS).ok();
            }
        }

        Ok(out)
    }

    /// One DNS record per peer in the network plus one per route DNS
    /// mapping reachable from `jump` (spec §4.3, §6). `jump` must be a
    /// jump peer.
    pub fn dns_view(&self, jump_id: &PeerId) -> Result<DnsViewOutput, CoreError> {
        let jump = self
            .peer(jump_id)
            .filter(|p| p.role == Role::Jump)
            .ok_or_else(|| CoreError::Validation("not a jump peer".into()))?;

        let mut records: Vec<DnsEntry> = self
            .peers
            .iter()
            .map(|p| DnsEntry { name: sanitize_label(&p.name), ip: p.address })
            .collect();

        for route in self.routes.iter().filter(|r| &r.jump_peer_id == jump_id) {
            let suffix = route
                .domain_suffix
                .clone()
                .unwrap_or_else(|| self.network.domain_suffix.clone());
            for mapping in self.dns_records.iter().filter(|d| d.route_id == route.id) {
                records.push(DnsEntry {
                    name: format!("{}.{}.{}", mapping.name, route.name, suffix),
                    ip: mapping.ip,
                });
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(DnsViewOutput {
            ip: jump.address,
            domain: self.network.domain_suffix.to_string(),
            records,
            upstream_servers: self.network.upstream_dns.iter().map(|ip| ip.to_string()).collect(),
        })
    }

    /// The jump firewall rule list: for each policy attached to each group
    /// containing `jump`, in group priority then policy then rule order,
    /// emit a directional rule; finish with a default-deny per direction
    /// (spec §4.3).
    pub fn firewall_view(&self, jump_id: &PeerId) -> Result<PolicyViewOutput, CoreError> {
        let jump = self
            .peer(jump_id)
            .filter(|p| p.role == Role::Jump)
            .ok_or_else(|| CoreError::Validation("not a jump peer".into()))?;

        let mut rules = Vec::new();
        for group in self.groups_containing(jump_id) {
            for policy_id in &group.policy_ids {
                let Some(policy) = self.policy(policy_id) else { continue };
                for rule in &policy.rules {
                    let targets: Vec<String> = match rule.target_kind {
                        TargetKind::Cidr => vec![rule.target.clone()],
                        TargetKind::Peer => self
                            .peer(&crate::id::PeerId::from(rule.target.clone()))
                            .map(|p| vec![format!("{}/32", p.address)])
                            .unwrap_or_default(),
                        TargetKind::Group => self
                            .groups
                            .iter()
                            .find(|g| g.id.as_str() == rule.target)
                            .map(|g| {
                                self.group_member_addresses(g)
                                    .into_iter()
                                    .map(|ip| format!("{ip}/32"))
                                    .collect()
                            })
                            .unwrap_or_default(),
                    };
                    for target in targets {
                        rules.push(iptables_rule(rule.direction, rule.action, &target));
                    }
                }
            }
        }
        rules.push(iptables_rule(Direction::Input, RuleAction::Deny, "0.0.0.0/0"));
        rules.push(iptables_rule(Direction::Output, RuleAction::Deny, "0.0.0.0/0"));

        let peers = self
            .peer_view(jump)
            .into_iter()
            .map(|p| PolicyPeerEntry {
                id: p.id.to_string(),
                name: p.name.to_string(),
                ip: p.address,
                use_agent: p.agent_managed,
            })
            .collect();

        Ok(PolicyViewOutput { ip: jump.address, iptables_rules: rules, peers })
    }

    /// The empty firewall shell returned to non-jump agent-managed peers,
    /// which triggers local firewall initialization (spec §6).
    pub fn empty_firewall_view(&self, peer_id: &PeerId) -> Result<PolicyViewOutput, CoreError> {
        let peer = self
            .peer(peer_id)
            .ok_or_else(|| CoreError::Validation("unknown peer".into()))?;
        Ok(PolicyViewOutput { ip: peer.address, iptables_rules: Vec::new(), peers: Vec::new() })
    }
}

fn iptables_rule(direction: Direction, action: RuleAction, target: &str) -> String {
    let chain = match direction {
        Direction::Input => "INPUT",
        Direction::Output => "OUTPUT",
    };
    let flag = match direction {
        Direction::Input => "-s",
        Direction::Output => "-d",
    };
    let verdict = match action {
        RuleAction::Allow => "ACCEPT",
        RuleAction::Deny => "DROP",
    };
    format!("-A {chain} {flag} {target} -j {verdict}")
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DnsEntry {
    pub name: String,
    pub ip: std::net::IpAddr,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DnsViewOutput {
    pub ip: std::net::IpAddr,
    pub domain: String,
    pub records: Vec<DnsEntry>,
    pub upstream_servers: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PolicyPeerEntry {
    pub id: String,
    pub name: String,
    pub ip: std::net::IpAddr,
    pub use_agent: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PolicyViewOutput {
    pub ip: std::net::IpAddr,
    pub iptables_rules: Vec<String>,
    pub peers: Vec<PolicyPeerEntry>,
}

/// Builds the full reachable-route-cidr index for invariant checks/tests:
/// which jump peer section a given route's cidr must appear under.
pub fn route_jump_index(routes: &[Route]) -> BTreeMap<String, PeerId> {
    routes.iter().map(|r| (r.destination_cidr.to_string(), r.jump_peer_id.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::time::SystemTime;

    fn peer(id: &str, name: &str, addr: &str, role: Role) -> Peer {
        Peer {
            id: id.to_string().into(),
            network_id: "net".to_string().into(),
            contents: PeerContents {
                name: name.parse().unwrap(),
                public_key: format!("pk-{id}"),
                private_key: format!("sk-{id}"),
                address: addr.parse().unwrap(),
                endpoint: None,
                listen_port: if role == Role::Jump { Some(DEFAULT_JUMP_LISTEN_PORT) } else { None },
                role,
                agent_managed: true,
                owner_user_id: None,
                group_ids: vec![],
            },
            created_at: SystemTime::UNIX_EPOCH,
            updated_at: SystemTime::UNIX_EPOCH,
        }
    }

    fn network() -> Network {
        Network {
            id: "net".to_string().into(),
            contents: NetworkContents {
                name: "office".parse().unwrap(),
                cidr: "10.0.0.0/24".parse().unwrap(),
                domain_suffix: "internal".parse().unwrap(),
                upstream_dns: vec![],
                default_group_ids: vec![],
            },
            created_at: SystemTime::UNIX_EPOCH,
            updated_at: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn two_peer_network_sees_each_other_and_cidr_on_jump() {
        let net = network();
        let gw = peer("gw", "gw", "10.0.0.1", Role::Jump);
        let lap = peer("lap", "lap", "10.0.0.2", Role::Regular);
        let peers = vec![gw.clone(), lap.clone()];
        let view = NetworkView {
            network: &net,
            peers: &peers,
            groups: &[],
            policies: &[],
            routes: &[],
            dns_records: &[],
            pairs: &[],
        };

        let config = view.tunnel_config(&lap.id).unwrap();
        assert_eq!(config.matches("[Peer]").count(), 1);
        assert!(config.contains("AllowedIPs = 10.0.0.0/24"));
        assert!(config.contains("PersistentKeepalive = 25"));

        let gw_config = view.tunnel_config(&gw.id).unwrap();
        assert_eq!(gw_config.matches("[Peer]").count(), 1);
        assert!(!gw_config.contains("PersistentKeepalive"));
    }

    #[test]
    fn quarantine_is_symmetric() {
        let net = network();
        let gw = peer("gw", "gw", "10.0.0.1", Role::Jump);
        let lap = peer("lap", "lap", "10.0.0.2", Role::Regular);
        let phone = peer("phone", "phone", "10.0.0.3", Role::Regular);
        let peers = vec![gw.clone(), lap.clone(), phone.clone()];
        let quarantine = Group {
            id: "q".to_string().into(),
            network_id: "net".to_string().into(),
            contents: GroupContents {
                name: QUARANTINE_GROUP_NAME.parse().unwrap(),
                description: String::new(),
                priority: QUARANTINE_GROUP_PRIORITY,
                peer_ids: vec![lap.id.clone()],
                policy_ids: vec![],
                route_ids: vec![],
            },
        };
        let groups = vec![quarantine];
        let view = NetworkView {
            network: &net,
            peers: &peers,
            groups: &groups,
            policies: &[],
            routes: &[],
            dns_records: &[],
            pairs: &[],
        };

        let phone_config = view.tunnel_config(&phone.id).unwrap();
        assert!(!phone_config.contains("lap"));
        let lap_config = view.tunnel_config(&lap.id).unwrap();
        assert!(!lap_config.contains("# Name: phone"));
    }

    #[test]
    fn deterministic_output() {
        let net = network();
        let gw = peer("gw", "gw", "10.0.0.1", Role::Jump);
        let lap = peer("lap", "lap", "10.0.0.2", Role::Regular);
        let peers = vec![gw.clone(), lap.clone()];
        let view = NetworkView {
            network: &net,
            peers: &peers,
            groups: &[],
            policies: &[],
            routes: &[],
            dns_records: &[],
            pairs: &[],
        };
        assert_eq!(view.tunnel_config(&lap.id).unwrap(), view.tunnel_config(&lap.id).unwrap());
    }
}
