//! C7 — administrator authentication and agent enrollment.
//!
//! Two distinct identities use this module: human administrators, who
//! authenticate the external API surface with a bearer JWT validated
//! against an OIDC issuer's JWKS (mirroring the teacher's
//! `AuthHeaders`/admin-key check, generalized from a static pre-shared
//! key to a proper token), and agents, who exchange a one-time
//! enrollment token for a long-lived session credential (spec.md §4.7).

use crate::{
    error::{ServerError, ServerResult},
    repository::Repository,
};
use mesh_core::UserId;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// The authenticated caller of an administrative API request (spec.md §4.8
/// "every mutating request is attributed to a caller").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub role: mesh_core::UserRole,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        matches!(self.role, mesh_core::UserRole::Administrator)
    }
}

/// Validates bearer tokens into a `Principal`. A capability interface so
/// the production JWKS-backed implementation and the disabled/test
/// double share one seam, the way the teacher's `get_auth_token` and
/// `none`-mode coexist behind one check.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, bearer_token: &str) -> ServerResult<Principal>;
}

/// `auth_enabled = false`: every request is treated as an administrator.
/// Used for local/single-operator deployments and the integration test
/// suite (spec.md §4.8 "authentication is an environment knob, not a
/// hardcoded requirement").
pub struct NoAuthenticator {
    user_id: UserId,
}

impl NoAuthenticator {
    pub fn new() -> Self {
        Self { user_id: UserId::new() }
    }
}

impl Default for NoAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for NoAuthenticator {
    fn authenticate(&self, _bearer_token: &str) -> ServerResult<Principal> {
        Ok(Principal { user_id: self.user_id.clone(), role: mesh_core::UserRole::Administrator })
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<jsonwebtoken::jwk::Jwk>,
}

struct CachedJwks {
    jwks: Jwks,
    fetched_at: std::time::Instant,
}

/// Production authenticator: validates a bearer JWT's signature against
/// the issuer's JWKS endpoint, caching the key set for
/// `ConfigFile::jwks_cache_secs` so every request doesn't round-trip to
/// the issuer (spec.md §4.7 "JWKS keys are cached and refreshed
/// periodically, not fetched per request"). Uses a blocking HTTP client
/// since a jwks refresh is rare and brief; callers on the async request
/// path invoke `authenticate` through `spawn_blocking`.
pub struct JwksAuthenticator {
    issuer_url: String,
    client: reqwest::blocking::Client,
    cache_duration: Duration,
    cache: RwLock<Option<CachedJwks>>,
    admin_roles: Vec<String>,
}

impl JwksAuthenticator {
    pub fn new(issuer_url: String, cache_duration: Duration) -> Self {
        Self {
            issuer_url,
            client: reqwest::blocking::Client::new(),
            cache_duration,
            cache: RwLock::new(None),
            admin_roles: vec!["admin".to_string(), "administrator".to_string()],
        }
    }

    fn fetch_jwks(&self) -> ServerResult<()> {
        let url = format!("{}/.well-known/jwks.json", self.issuer_url.trim_end_matches('/'));
        let jwks: Jwks = self
            .client
            .get(&url)
            .send()
            .map_err(|e| ServerError::Internal(format!("fetching jwks: {e}")))?
            .json()
            .map_err(|e| ServerError::Internal(format!("parsing jwks: {e}")))?;
        *self.cache.write() = Some(CachedJwks { jwks, fetched_at: std::time::Instant::now() });
        Ok(())
    }

    fn with_fresh_jwks<T>(&self, f: impl FnOnce(&Jwks) -> ServerResult<T>) -> ServerResult<T> {
        {
            let guard = self.cache.read();
            if let Some(cached) = guard.as_ref() {
                if cached.fetched_at.elapsed() < self.cache_duration {
                    return f(&cached.jwks);
                }
            }
        }
        self.fetch_jwks()?;
        let guard = self.cache.read();
        f(&guard.as_ref().expect("fetch_jwks just populated the cache").jwks)
    }
}

impl Authenticator for JwksAuthenticator {
    fn authenticate(&self, bearer_token: &str) -> ServerResult<Principal> {
        use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};

        let header = decode_header(bearer_token)
            .map_err(|e| ServerError::Auth(format!("malformed token: {e}")))?;
        let kid = header.kid.ok_or_else(|| ServerError::Auth("token has no kid".into()))?;

        self.with_fresh_jwks(|jwks| {
            let jwk = jwks
                .keys
                .iter()
                .find(|k| k.common.key_id.as_deref() == Some(kid.as_str()))
                .ok_or_else(|| ServerError::Auth("unknown signing key".into()))?;
            let decoding_key = DecodingKey::from_jwk(jwk)
                .map_err(|e| ServerError::Internal(format!("decoding jwk: {e}")))?;
            let mut validation = Validation::new(Algorithm::RS256);
            validation.set_issuer(&[&self.issuer_url]);
            let data = decode::<Claims>(bearer_token, &decoding_key, &validation)
                .map_err(|e| ServerError::Auth(format!("invalid token: {e}")))?;
            let role = if data.claims.roles.iter().any(|r| self.admin_roles.contains(r)) {
                mesh_core::UserRole::Administrator
            } else {
                mesh_core::UserRole::User
            };
            Ok(Principal { user_id: UserId::from(data.claims.sub), role })
        })
    }
}

/// Generates a URL-safe, high-entropy opaque token, used both for
/// one-time enrollment tokens and long-lived session credentials
/// (spec.md §4.7). Only the token's hash is ever persisted
/// (`hash_token`); the plaintext is handed to the caller exactly once.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}

/// Token hashing uses a plain SHA-256 digest rather than a slow password
/// hash: these are high-entropy random tokens, not user-chosen
/// passwords, so there's nothing for a slow hash to defend against that
/// the token's own entropy doesn't already (spec.md §4.7).
pub fn hash_token(token: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)
}

/// Issues a fresh one-time enrollment token for `peer_id`, persists its
/// hash, and returns the plaintext for delivery to the enrolling agent
/// out of band (spec.md §4.7 "an administrator mints an enrollment
/// token when creating an agent-managed peer").
pub fn issue_enrollment_token(
    repo: &dyn Repository,
    network_id: &mesh_core::NetworkId,
    peer_id: &mesh_core::PeerId,
) -> ServerResult<String> {
    let token = generate_token();
    repo.set_enrollment_token(network_id, peer_id, &hash_token(&token))?;
    Ok(token)
}

/// Exchanges a one-time enrollment token for a long-lived session
/// credential, consuming the enrollment token so it cannot be replayed
/// (spec.md §4.7). Returns the plaintext session credential for the
/// agent to store and present on every subsequent request.
pub fn enroll(
    repo: &dyn Repository,
    enrollment_token: &str,
) -> ServerResult<(mesh_core::NetworkId, mesh_core::PeerId, String)> {
    let (network_id, peer_id) = repo
        .consume_enrollment_token(&hash_token(enrollment_token))?
        .ok_or_else(|| ServerError::Auth("enrollment token unknown or already used".into()))?;
    let credential = generate_token();
    repo.set_session_credential(&network_id, &peer_id, &hash_token(&credential))?;
    Ok((network_id, peer_id, credential))
}

/// Resolves an agent's session credential to the peer it belongs to,
/// for the heartbeat/config-pull/websocket endpoints (spec.md §4.7).
pub fn authenticate_agent(
    repo: &dyn Repository,
    session_credential: &str,
) -> ServerResult<mesh_core::Peer> {
    repo.find_peer_by_session_credential(&hash_token(session_credential))?
        .ok_or_else(|| ServerError::Auth("unknown session credential".into()))
}

/// In-memory registry of static API keys, one further fallback the
/// teacher supports alongside OIDC: a deployment can skip standing up
/// an issuer entirely and hand operators a fixed key each (spec.md §4.7
/// "Open Question: support static API keys as an alternative to OIDC" —
/// resolved yes, scoped to administrators only, see DESIGN.md).
pub struct StaticKeyAuthenticator {
    keys: HashMap<String, Principal>,
}

impl StaticKeyAuthenticator {
    pub fn new(keys: HashMap<String, Principal>) -> Self {
        Self { keys }
    }
}

impl Authenticator for StaticKeyAuthenticator {
    fn authenticate(&self, bearer_token: &str) -> ServerResult<Principal> {
        self.keys
            .get(bearer_token)
            .cloned()
            .ok_or_else(|| ServerError::Auth("unknown api key".into()))
    }
}

/// Lazily-initialized process-wide fallback used only by tests that need
/// a `NoAuthenticator` without wiring one through every call site.
pub fn test_authenticator() -> Arc<dyn Authenticator> {
    static INSTANCE: OnceCell<Arc<dyn Authenticator>> = OnceCell::new();
    INSTANCE.get_or_init(|| Arc::new(NoAuthenticator::new())).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::SqliteRepository;

    #[test]
    fn no_authenticator_always_grants_admin() {
        let auth = NoAuthenticator::new();
        let principal = auth.authenticate("whatever").unwrap();
        assert!(principal.is_admin());
    }

    #[test]
    fn static_key_authenticator_rejects_unknown_key() {
        let auth = StaticKeyAuthenticator::new(HashMap::new());
        assert!(auth.authenticate("nope").is_err());
    }

    #[test]
    fn token_hash_is_deterministic_and_not_reversible_by_inspection() {
        let token = generate_token();
        assert_eq!(hash_token(&token), hash_token(&token));
        assert_ne!(hash_token(&token), token);
    }

    #[test]
    fn enrollment_token_is_single_use() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let network = repo
            .create_network(mesh_core::NetworkContents {
                name: "net".parse().unwrap(),
                cidr: "10.0.0.0/24".parse().unwrap(),
                domain_suffix: "internal".parse().unwrap(),
                upstream_dns: vec![],
                default_group_ids: vec![],
            })
            .unwrap();
        let peer = repo
            .create_peer(
                &network.id,
                crate::repository::NewPeer {
                    name: "agent".parse().unwrap(),
                    public_key: "pk".into(),
                    private_key: "sk".into(),
                    endpoint: None,
                    listen_port: None,
                    role: mesh_core::Role::Regular,
                    agent_managed: true,
                    owner_user_id: None,
                    owner_is_admin: true,
                },
            )
            .unwrap();

        let token = issue_enrollment_token(&repo, &network.id, &peer.id).unwrap();
        let (enrolled_network, enrolled_peer, _credential) = enroll(&repo, &token).unwrap();
        assert_eq!(enrolled_network, network.id);
        assert_eq!(enrolled_peer, peer.id);

        assert!(enroll(&repo, &token).is_err());
    }
}
