//! BEP-42 node-ID hardening.
//!
//! Ties a node ID to its external IP through CRC32C so one host cannot
//! occupy arbitrary points of the ID space. The external address itself
//! is learned from the `ip` field peers echo back in replies; once
//! enough distinct peers agree, the server can adopt a conforming ID.
//! Private and loopback addresses are exempt.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv6Addr};

use rand::Rng as _;

use crate::id::NodeId;

/// Bits of the IPv4 address that feed the hash.
const V4_MASK: u32 = 0x030f_3fff;

/// Bits of the upper IPv6 half that feed the hash.
const V6_MASK: u64 = 0x0103_070f_1f3f_7fff;

/// Distinct peers that must echo the same external IP before it is
/// believed.
pub const REQUIRED_VOTES: usize = 3;

/// Candidate external addresses we bother tracking.
const MAX_CANDIDATES: usize = 16;

/// Derives a conforming node ID for the given external IP.
///
/// The first 21 bits come from the CRC32C of the masked address mixed
/// with a random nonce `r`, the last byte stores `r`, and the middle
/// stays random. Exempt addresses get a fully random ID.
pub fn node_id_for_ip(ip: IpAddr) -> NodeId {
    if is_exempt(&ip) {
        return NodeId::random();
    }

    let r = rand::rng().random::<u8>() & 0x07;
    let crc = masked_crc(ip, r);

    let mut id = [0u8; 20];
    rand::rng().fill(&mut id[..]);
    id[0] = (crc >> 24) as u8;
    id[1] = (crc >> 16) as u8;
    id[2] = (id[2] & 0x07) | ((crc >> 8) as u8 & 0xf8);
    id[19] = r;
    NodeId(id)
}

/// Whether `id` is a valid BEP-42 ID for `ip`.
///
/// Exempt addresses always pass.
pub fn id_matches_ip(id: &NodeId, ip: IpAddr) -> bool {
    if is_exempt(&ip) {
        return true;
    }
    let r = id.0[19] & 0x07;
    let crc = masked_crc(ip, r);

    let actual =
        (u32::from(id.0[0]) << 24) | (u32::from(id.0[1]) << 16) | (u32::from(id.0[2]) << 8);
    (actual ^ crc) & 0xffff_f800 == 0
}

fn masked_crc(ip: IpAddr, r: u8) -> u32 {
    match ip {
        IpAddr::V4(v4) => {
            let masked = (u32::from(v4) & V4_MASK) | (u32::from(r) << 29);
            crc32c::crc32c(&masked.to_be_bytes())
        }
        IpAddr::V6(v6) => {
            let upper = u64::from_be_bytes(v6.octets()[..8].try_into().unwrap_or([0u8; 8]));
            let masked = (upper & V6_MASK) | (u64::from(r) << 61);
            crc32c::crc32c(&masked.to_be_bytes())
        }
    }
}

/// Addresses outside the public internet carry no BEP-42 restriction.
pub fn is_exempt(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, _, _] = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || (a == 169 && b == 254)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || is_v6_link_local(v6) || is_v6_unique_local(v6)
        }
    }
}

fn is_v6_link_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

fn is_v6_unique_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xfe00 == 0xfc00
}

/// Tallies the external address peers report seeing us at.
///
/// An address is confirmed once [`REQUIRED_VOTES`] distinct peers have
/// echoed it. The tally is bounded so hostile peers cannot grow it.
#[derive(Debug, Default)]
pub struct AddressVotes {
    tally: HashMap<IpAddr, HashSet<IpAddr>>,
    confirmed: Option<IpAddr>,
}

impl AddressVotes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirmed(&self) -> Option<IpAddr> {
        self.confirmed
    }

    /// Records that `voter` reported seeing us at `observed`. Returns
    /// the address when this vote newly confirms it.
    pub fn vote(&mut self, observed: IpAddr, voter: IpAddr) -> Option<IpAddr> {
        if self.confirmed == Some(observed) {
            return None;
        }
        if !self.tally.contains_key(&observed) && self.tally.len() >= MAX_CANDIDATES {
            return None;
        }
        let voters = self.tally.entry(observed).or_default();
        voters.insert(voter);
        if voters.len() >= REQUIRED_VOTES {
            self.tally.remove(&observed);
            self.confirmed = Some(observed);
            Some(observed)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn derived_id_validates_against_its_ip() {
        let ip = IpAddr::V4(Ipv4Addr::new(124, 31, 75, 21));
        let id = node_id_for_ip(ip);
        assert!(id_matches_ip(&id, ip));
    }

    #[test]
    fn derived_id_fails_against_another_ip() {
        let ip = IpAddr::V4(Ipv4Addr::new(124, 31, 75, 21));
        let other = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        let id = node_id_for_ip(ip);
        assert!(!id_matches_ip(&id, other));
    }

    #[test]
    fn v6_ids_validate_too() {
        let ip: IpAddr = "2001:4860:4860::8888".parse().unwrap();
        let id = node_id_for_ip(ip);
        assert!(id_matches_ip(&id, ip));
    }

    #[test]
    fn exempt_ranges() {
        for local in ["10.1.2.3", "172.16.0.1", "192.168.1.1", "169.254.0.9", "127.0.0.1"] {
            assert!(is_exempt(&local.parse().unwrap()), "{local}");
        }
        for global in ["8.8.8.8", "1.2.3.4"] {
            assert!(!is_exempt(&global.parse().unwrap()), "{global}");
        }
        assert!(is_exempt(&"::1".parse().unwrap()));
        assert!(is_exempt(&"fe80::1".parse().unwrap()));
        assert!(is_exempt(&"fd00::1".parse().unwrap()));
        assert!(!is_exempt(&"2001:4860:4860::8888".parse().unwrap()));
    }

    #[test]
    fn any_id_passes_on_exempt_addresses() {
        assert!(id_matches_ip(&NodeId::random(), "192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn votes_confirm_after_three_distinct_peers() {
        let observed: IpAddr = "5.6.7.8".parse().unwrap();
        let mut votes = AddressVotes::new();

        assert_eq!(votes.vote(observed, "1.1.1.1".parse().unwrap()), None);
        assert_eq!(votes.vote(observed, "1.1.1.1".parse().unwrap()), None);
        assert_eq!(votes.vote(observed, "2.2.2.2".parse().unwrap()), None);
        assert_eq!(
            votes.vote(observed, "3.3.3.3".parse().unwrap()),
            Some(observed)
        );
        assert_eq!(votes.confirmed(), Some(observed));

        // repeating the confirmed address changes nothing
        assert_eq!(votes.vote(observed, "4.4.4.4".parse().unwrap()), None);
    }

    #[test]
    fn a_new_address_can_replace_the_confirmed_one() {
        let first: IpAddr = "5.6.7.8".parse().unwrap();
        let second: IpAddr = "9.9.9.9".parse().unwrap();
        let mut votes = AddressVotes::new();
        for (i, voter) in ["1.1.1.1", "2.2.2.2", "3.3.3.3"].iter().enumerate() {
            let result = votes.vote(first, voter.parse().unwrap());
            assert_eq!(result.is_some(), i == 2);
        }
        for (i, voter) in ["6.6.6.6", "7.7.7.7", "8.8.8.8"].iter().enumerate() {
            let result = votes.vote(second, voter.parse().unwrap());
            assert_eq!(result.is_some(), i == 2);
        }
        assert_eq!(votes.confirmed(), Some(second));
    }
}
