//! C1 — IP address management.
//!
//! This module is the pure algorithm at the heart of IPAM: given a prefix
//! and the set of host addresses already allocated within it, deterministically
//! pick the lowest free usable host. Persistence of the allocation set (so
//! concurrent acquires are serialized and committed alongside the caller's
//! write) is `mesh-server`'s job: `Repository::create_peer` and
//! `Repository::change_network_cidr` read the network's currently-assigned
//! addresses inside their own transaction and call `acquire_host` before
//! writing the result back.

use crate::error::CoreError;
use ipnet::IpNet;
use std::{collections::BTreeSet, net::IpAddr};

/// Whether `ip` may be assigned to a host within `cidr` — i.e. it is not the
/// network or broadcast address of an IPv4 prefix narrower than /31 (point
/// to point and host prefixes have no reserved addresses).
pub fn is_assignable(cidr: &IpNet, ip: IpAddr) -> bool {
    if !cidr.contains(&ip) {
        return false;
    }
    match cidr {
        IpNet::V4(v4) if v4.prefix_len() < 31 => {
            ip != IpAddr::V4(v4.network()) && ip != IpAddr::V4(v4.broadcast())
        },
        _ => true,
    }
}

/// Iterates every assignable host address of `cidr` in ascending order.
pub fn hosts(cidr: &IpNet) -> impl Iterator<Item = IpAddr> + '_ {
    cidr.hosts().filter(move |ip| is_assignable(cidr, *ip))
}

/// Deterministically selects the lowest free usable host address of `cidr`
/// not present in `allocated`. Returns `CoreError::Exhausted` when none
/// remain (spec §8: "IPAM returns exhausted exactly when the prefix has no
/// free usable host").
pub fn acquire_host(cidr: &IpNet, allocated: &BTreeSet<IpAddr>) -> Result<IpAddr, CoreError> {
    hosts(cidr)
        .find(|ip| !allocated.contains(ip))
        .ok_or(CoreError::Exhausted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_picks_lowest_free_host() {
        let cidr: IpNet = "10.0.0.0/30".parse().unwrap();
        let allocated = BTreeSet::new();
        // /30 has two usable hosts: .1 and .2
        assert_eq!(acquire_host(&cidr, &allocated).unwrap(), "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn acquire_skips_allocated() {
        let cidr: IpNet = "10.0.0.0/30".parse().unwrap();
        let mut allocated = BTreeSet::new();
        allocated.insert("10.0.0.1".parse().unwrap());
        assert_eq!(acquire_host(&cidr, &allocated).unwrap(), "10.0.0.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn acquire_exhausted_exactly_when_full() {
        let cidr: IpNet = "10.0.0.0/30".parse().unwrap();
        let mut allocated = BTreeSet::new();
        allocated.insert("10.0.0.1".parse().unwrap());
        allocated.insert("10.0.0.2".parse().unwrap());
        assert_eq!(acquire_host(&cidr, &allocated), Err(CoreError::Exhausted));
    }

    #[test]
    fn network_and_broadcast_excluded() {
        let cidr: IpNet = "10.0.0.0/24".parse().unwrap();
        assert!(!is_assignable(&cidr, "10.0.0.0".parse().unwrap()));
        assert!(!is_assignable(&cidr, "10.0.0.255".parse().unwrap()));
        assert!(is_assignable(&cidr, "10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn point_to_point_prefix_has_no_reserved_addresses() {
        let cidr: IpNet = "10.0.0.0/31".parse().unwrap();
        assert!(is_assignable(&cidr, "10.0.0.0".parse().unwrap()));
        assert!(is_assignable(&cidr, "10.0.0.1".parse().unwrap()));
    }
}
