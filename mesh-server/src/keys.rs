//! Tunnel key-pair generation, consumed by C4 as an external primitive
//! (spec.md §1 "out of scope: cryptographic key generation for tunnels").
//!
//! The teacher generates keys through `wgctrl::KeyPair`, which wraps
//! `x25519-dalek` underneath; here we depend on `x25519-dalek` directly
//! rather than the whole `wireguard-control` crate, since its device/netlink
//! control surface has no counterpart in this server (see DESIGN.md).

use rand::rngs::OsRng;

pub struct KeyPair {
    pub public_key: String,
    pub private_key: String,
}

/// A source of fresh WireGuard key pairs. A capability interface so tests
/// can substitute deterministic keys without touching an RNG.
pub trait KeyPairSource: Send + Sync {
    fn generate(&self) -> KeyPair;
}

pub struct X25519KeyPairSource;

impl KeyPairSource for X25519KeyPairSource {
    fn generate(&self) -> KeyPair {
        let private = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&private);
        KeyPair {
            public_key: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, public.as_bytes()),
            private_key: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, private.to_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_distinct() {
        let source = X25519KeyPairSource;
        let a = source.generate();
        let b = source.generate();
        assert_ne!(a.private_key, b.private_key);
        assert_ne!(a.public_key, b.public_key);
    }
}
