//! C5 — heartbeat & security engine: the five-step pipeline that turns an
//! agent's heartbeat into session bookkeeping, endpoint-change history, and
//! (when warranted) a quarantine (spec.md §4.5).
//!
//! Every step is independently fallible but none may abort the heartbeat —
//! "best-effort detection must not break liveness" (spec.md §7) — so each
//! step's error is logged and swallowed by `run_step`, mirroring the way
//! the teacher's background jobs log-and-continue rather than propagate.

use crate::{error::ServerResult, repository::Repository, service::Service};
use mesh_core::{
    AgentSession, Endpoint, EndpointChangeRecord, EndpointSource, IncidentKind, NetworkId, Peer,
    PeerId,
};
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::Arc,
    time::{Duration, SystemTime},
};

/// The decoded body of `POST /api/v1/agent/heartbeat` (spec.md §6).
pub struct HeartbeatInput {
    pub peer_id: PeerId,
    pub hostname: String,
    pub system_uptime: u64,
    pub tunnel_uptime: u64,
    /// Public key to last-seen-endpoint, as observed by this peer's
    /// tunnel (populated by jumps from handshake data; may be empty or
    /// self-only for non-jumps).
    pub peer_endpoints: HashMap<String, Endpoint>,
}

pub struct HeartbeatEngine {
    repo: Arc<dyn Repository>,
    service: Arc<Service>,
}

fn run_step<T: Default>(name: &str, result: ServerResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            log::error!("heartbeat step '{name}' failed: {e}");
            T::default()
        },
    }
}

impl HeartbeatEngine {
    pub fn new(repo: Arc<dyn Repository>, service: Arc<Service>) -> Self {
        Self { repo, service }
    }

    pub fn process(&self, network_id: &NetworkId, input: HeartbeatInput, now: SystemTime) {
        let config = match self.repo.get_security_config(network_id) {
            Ok(config) => config,
            Err(e) => {
                log::error!("heartbeat: failed to load security config for {network_id}: {e}");
                return;
            },
        };

        run_step("session bookkeeping", self.session_bookkeeping(network_id, &input, now, &config));
        let changed_peers: Vec<PeerId> =
            run_step("endpoint observations", self.endpoint_observations(network_id, &input, now));

        if config.enabled {
            run_step("shared config detection", self.shared_config_detection(network_id, now, &config));
            run_step("suspicious activity detection", self.suspicious_activity_detection(network_id, now, &config));
        }
        run_step("whitelist cleanup", self.whitelist_cleanup(network_id, now, &config, &changed_peers));
    }

    /// Step 1: upserts the reporting peer's own session, detecting a
    /// second active hostname as a session-conflict candidate (spec.md
    /// §4.5.1).
    fn session_bookkeeping(
        &self,
        network_id: &NetworkId,
        input: &HeartbeatInput,
        now: SystemTime,
        config: &mesh_core::SecurityConfig,
    ) -> ServerResult<()> {
        let sessions = self.repo.sessions_for_peer(network_id, &input.peer_id)?;
        let peer = self.repo.get_peer(network_id, &input.peer_id)?;
        let self_endpoint = peer_self_endpoint(&peer, input);

        let conflicting = config.enabled
            && sessions.iter().any(|s| {
                s.hostname != input.hostname
                    && s.is_active(now, config.session_conflict_threshold)
                    && s.reported_endpoint.is_some()
                    && self_endpoint.is_some()
            });

        if conflicting {
            if !self.repo.has_unresolved_incident(&input.peer_id, IncidentKind::SessionConflict)? {
                let old_endpoint = sessions
                    .iter()
                    .filter(|s| s.hostname != input.hostname)
                    .filter_map(|s| s.reported_endpoint.clone())
                    .next();
                let mut endpoints_involved = Vec::new();
                endpoints_involved.extend(old_endpoint);
                endpoints_involved.extend(self_endpoint.clone());
                self.open_incident_and_quarantine(
                    network_id,
                    &input.peer_id,
                    &peer.public_key,
                    IncidentKind::SessionConflict,
                    endpoints_involved,
                    format!("conflicting active session from hostname '{}'", input.hostname),
                )?;
            }
        }

        self.repo.upsert_session(AgentSession {
            network_id: network_id.clone(),
            peer_id: input.peer_id.clone(),
            session_id: format!("{}:{}", input.peer_id, input.hostname),
            hostname: input.hostname.clone(),
            system_uptime: input.system_uptime,
            tunnel_uptime: input.tunnel_uptime,
            first_seen: now,
            last_seen: now,
            reported_endpoint: self_endpoint,
        })?;
        Ok(())
    }

    /// Step 2: for each observed (public key, endpoint) pair, updates the
    /// session this jump maintains for that remote peer and appends an
    /// endpoint-change record when the endpoint moved (spec.md §4.5.2).
    /// Returns the ids of peers whose endpoint actually changed this
    /// heartbeat, so step 5 can exclude them from the whitelist even
    /// though their session is still active.
    fn endpoint_observations(
        &self,
        network_id: &NetworkId,
        input: &HeartbeatInput,
        now: SystemTime,
    ) -> ServerResult<Vec<PeerId>> {
        let mut changed = Vec::new();
        for (public_key, endpoint) in &input.peer_endpoints {
            let Some(observed) = self.repo.find_peer_by_public_key(network_id, public_key)? else {
                continue;
            };
            if observed.id == input.peer_id {
                continue;
            }
            let source_hostname = format!("jump:{}", input.peer_id);
            let existing = self.repo.find_session(network_id, &observed.id, &source_hostname)?;
            let old_endpoint = existing.as_ref().and_then(|s| s.reported_endpoint.clone());

            self.repo.upsert_session(AgentSession {
                network_id: network_id.clone(),
                peer_id: observed.id.clone(),
                session_id: format!("{}:{}", observed.id, source_hostname),
                hostname: source_hostname,
                system_uptime: 0,
                tunnel_uptime: 0,
                first_seen: existing.map(|s| s.first_seen).unwrap_or(now),
                last_seen: now,
                reported_endpoint: Some(endpoint.clone()),
            })?;

            // A reset to an empty endpoint is not an observed change; we
            // never report one here since the wire contract only ever
            // carries a concrete endpoint, never an empty one.
            if old_endpoint.as_ref() != Some(endpoint) {
                self.repo.append_endpoint_change(EndpointChangeRecord {
                    network_id: network_id.clone(),
                    peer_id: observed.id.clone(),
                    old_endpoint,
                    new_endpoint: Some(endpoint.clone()),
                    changed_at: now,
                    source: EndpointSource::Peer(input.peer_id.clone()),
                })?;
                changed.push(observed.id.clone());
            }
        }
        Ok(changed)
    }

    /// Step 3: within `endpoint_change_threshold`, a single source
    /// observing a peer at two or more distinct endpoints is a
    /// shared-config candidate (spec.md §4.5.3).
    fn shared_config_detection(
        &self,
        network_id: &NetworkId,
        now: SystemTime,
        config: &mesh_core::SecurityConfig,
    ) -> ServerResult<()> {
        let since = now
            .checked_sub(config.endpoint_change_threshold)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        for peer in self.repo.list_peers(network_id)? {
            let changes = self.repo.endpoint_changes_since(network_id, &peer.id, since)?;
            let mut by_source: HashMap<String, std::collections::HashSet<Endpoint>> = HashMap::new();
            for change in &changes {
                if let Some(endpoint) = &change.new_endpoint {
                    by_source.entry(source_key(&change.source)).or_default().insert(endpoint.clone());
                }
            }
            if by_source.values().any(|endpoints| endpoints.len() >= 2) {
                if !self.repo.has_unresolved_incident(&peer.id, IncidentKind::SharedConfig)? {
                    let endpoints_involved: Vec<Endpoint> =
                        changes.iter().filter_map(|c| c.new_endpoint.clone()).collect();
                    self.open_incident_and_quarantine(
                        network_id,
                        &peer.id,
                        &peer.public_key,
                        IncidentKind::SharedConfig,
                        endpoints_involved,
                        "peer observed at multiple endpoints by a single source within the shared-config window".into(),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Step 4: over the last 24h, a single source recording at least
    /// `max_endpoint_changes_per_day` changes for a peer is a
    /// suspicious-activity candidate (spec.md §4.5.4).
    fn suspicious_activity_detection(
        &self,
        network_id: &NetworkId,
        now: SystemTime,
        config: &mesh_core::SecurityConfig,
    ) -> ServerResult<()> {
        let since = now.checked_sub(Duration::from_secs(24 * 3600)).unwrap_or(SystemTime::UNIX_EPOCH);
        for peer in self.repo.list_peers(network_id)? {
            let changes = self.repo.endpoint_changes_since(network_id, &peer.id, since)?;
            let mut counts: HashMap<String, u32> = HashMap::new();
            for change in &changes {
                *counts.entry(source_key(&change.source)).or_default() += 1;
            }
            if counts.values().any(|&count| count >= config.max_endpoint_changes_per_day) {
                if !self.repo.has_unresolved_incident(&peer.id, IncidentKind::SuspiciousActivity)? {
                    let endpoints_involved: Vec<Endpoint> =
                        changes.iter().filter_map(|c| c.new_endpoint.clone()).collect();
                    self.open_incident_and_quarantine(
                        network_id,
                        &peer.id,
                        &peer.public_key,
                        IncidentKind::SuspiciousActivity,
                        endpoints_involved,
                        format!(
                            "peer changed endpoints at least {} times in 24h as observed by a single source",
                            config.max_endpoint_changes_per_day
                        ),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Step 5: reconciles every jump's captive-portal whitelist against
    /// peers currently reporting active endpoints (spec.md §4.5.5): newly
    /// active peers are admitted, and peers no longer active or whose
    /// endpoint just changed this heartbeat are dropped. This is the
    /// whitelist's only writer, so it both populates and prunes it — there
    /// is no separate "admit" step elsewhere in the pipeline.
    fn whitelist_cleanup(
        &self,
        network_id: &NetworkId,
        now: SystemTime,
        config: &mesh_core::SecurityConfig,
        changed_peers: &[PeerId],
    ) -> ServerResult<()> {
        let peers = self.repo.list_peers(network_id)?;
        let jumps: Vec<&Peer> = peers.iter().filter(|p| p.role == mesh_core::Role::Jump).collect();

        let mut active_addresses = std::collections::HashSet::new();
        for peer in &peers {
            if changed_peers.contains(&peer.id) {
                continue;
            }
            let sessions = self.repo.sessions_for_peer(network_id, &peer.id)?;
            if sessions.iter().any(|s| s.is_active(now, config.session_conflict_threshold)) {
                active_addresses.insert(peer.address);
            }
        }

        for jump in jumps {
            let current = self.repo.jump_whitelist(network_id, &jump.id)?;
            let mut reconciled: Vec<_> =
                current.into_iter().filter(|ip| active_addresses.contains(ip)).collect();
            for address in &active_addresses {
                if !reconciled.contains(address) {
                    reconciled.push(*address);
                }
            }
            self.repo.set_jump_whitelist(network_id, &jump.id, &reconciled)?;
        }
        Ok(())
    }

    fn open_incident_and_quarantine(
        &self,
        network_id: &NetworkId,
        peer_id: &PeerId,
        public_key: &str,
        kind: IncidentKind,
        endpoints_involved: Vec<Endpoint>,
        detail: String,
    ) -> ServerResult<()> {
        let opened = self.service.create_incident_if_absent(crate::repository::NewIncident {
            network_id: network_id.clone(),
            peer_id: peer_id.clone(),
            public_key_at_detection: public_key.to_string(),
            kind,
            endpoints_involved,
            detail,
        })?;
        if opened.is_some() {
            self.service.quarantine(network_id, peer_id, &format!("{kind:?}"))?;
        }
        Ok(())
    }
}

fn source_key(source: &EndpointSource) -> String {
    match source {
        EndpointSource::Peer(id) => id.to_string(),
        EndpointSource::WireGuard => "wireguard".to_string(),
    }
}

/// The endpoint to record on the reporting peer's own session, taken from
/// its self-entry in `peer_endpoints` when present. The wire contract
/// (spec.md §6) has no separate "my own endpoint" field, so a
/// self-reporting agent is expected to include its own public key in the
/// map when it knows its endpoint.
fn peer_self_endpoint(peer: &Peer, input: &HeartbeatInput) -> Option<Endpoint> {
    input.peer_endpoints.get(&peer.public_key).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keys::X25519KeyPairSource, notify::Hub, repository::SqliteRepository};
    use mesh_core::{NetworkContents, Role};

    fn engine() -> (HeartbeatEngine, Arc<Service>, mesh_core::Network, crate::auth::Principal) {
        let repo: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let notifier = Arc::new(Hub::new());
        let keys = Arc::new(X25519KeyPairSource);
        let service = Arc::new(Service::new(repo.clone(), notifier, keys));
        use crate::auth::Authenticator;
        let admin = crate::auth::NoAuthenticator::new().authenticate("x").unwrap();
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
        let heartbeat_engine = HeartbeatEngine::new(repo, service.clone());
        (heartbeat_engine, service, network, admin)
    }

    #[test]
    fn conflicting_hostnames_open_session_conflict_and_quarantine() {
        let (engine, service, network, admin) = engine();
        let (lap, _token) = service
            .create_peer(&admin, &network.id, "lap".parse().unwrap(), None, None, Role::Regular, true)
            .unwrap();

        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let mut endpoints_h1 = HashMap::new();
        endpoints_h1.insert(lap.public_key.clone(), "1.1.1.1:51820".parse().unwrap());
        engine.process(
            &network.id,
            HeartbeatInput {
                peer_id: lap.id.clone(),
                hostname: "h1".into(),
                system_uptime: 10,
                tunnel_uptime: 10,
                peer_endpoints: endpoints_h1,
            },
            t0,
        );

        let t1 = t0 + Duration::from_secs(60);
        let mut endpoints_h2 = HashMap::new();
        endpoints_h2.insert(lap.public_key.clone(), "2.2.2.2:51820".parse().unwrap());
        engine.process(
            &network.id,
            HeartbeatInput {
                peer_id: lap.id.clone(),
                hostname: "h2".into(),
                system_uptime: 5,
                tunnel_uptime: 5,
                peer_endpoints: endpoints_h2,
            },
            t1,
        );

        let groups = service.list_groups(&network.id, 1, 100).unwrap().data;
        let quarantine =
            groups.iter().find(|g| g.name.as_str() == mesh_core::QUARANTINE_GROUP_NAME).unwrap();
        assert!(quarantine.peer_ids.contains(&lap.id));
    }

    #[test]
    fn shared_config_detection_quarantines_peer_seen_at_two_endpoints_by_one_jump() {
        let (engine, service, network, admin) = engine();
        let (gw, _) = service
            .create_peer(&admin, &network.id, "gw".parse().unwrap(), None, None, Role::Jump, true)
            .unwrap();
        let (lap, _) = service
            .create_peer(&admin, &network.id, "lap".parse().unwrap(), None, None, Role::Regular, true)
            .unwrap();

        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(2_000_000);
        let mut e0 = HashMap::new();
        e0.insert(lap.public_key.clone(), "1.1.1.1:51820".parse().unwrap());
        engine.process(
            &network.id,
            HeartbeatInput {
                peer_id: gw.id.clone(),
                hostname: "gw-host".into(),
                system_uptime: 1,
                tunnel_uptime: 1,
                peer_endpoints: e0,
            },
            t0,
        );

        let t1 = t0 + Duration::from_secs(5 * 60);
        let mut e1 = HashMap::new();
        e1.insert(lap.public_key.clone(), "2.2.2.2:51820".parse().unwrap());
        engine.process(
            &network.id,
            HeartbeatInput {
                peer_id: gw.id.clone(),
                hostname: "gw-host".into(),
                system_uptime: 2,
                tunnel_uptime: 2,
                peer_endpoints: e1,
            },
            t1,
        );

        let groups = service.list_groups(&network.id, 1, 100).unwrap().data;
        let quarantine =
            groups.iter().find(|g| g.name.as_str() == mesh_core::QUARANTINE_GROUP_NAME).unwrap();
        assert!(quarantine.peer_ids.contains(&lap.id));
    }
}
