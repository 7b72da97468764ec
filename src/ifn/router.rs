//! Allowed-IP routing table
//!
//! Longest-prefix match from an address to a peer id, used in both
//! directions: destination address to peer for outbound traffic, and
//! decrypted inner source address to peer for inbound validation.
//!
//! A bit-indexed binary trie per family. Insertion happens only at
//! startup; lookups run on every packet and walk at most address-bits
//! nodes.

use std::net::IpAddr;

use ipnet::IpNet;

#[derive(Debug, Default)]
struct Node {
    peer: Option<u32>,
    children: [Option<Box<Node>>; 2],
}

impl Node {
    fn insert(&mut self, bits: u128, width: u8, prefixlen: u8, peer: u32) {
        let mut node = self;
        for i in 0..prefixlen {
            let bit = ((bits >> (width - 1 - i)) & 1) as usize;
            node = node.children[bit].get_or_insert_with(Box::default);
        }
        // later insertions win on an exact duplicate prefix
        node.peer = Some(peer);
    }

    fn lookup(&self, bits: u128, width: u8) -> Option<u32> {
        let mut node = self;
        let mut best = node.peer;
        for i in 0..width {
            let bit = ((bits >> (width - 1 - i)) & 1) as usize;
            match &node.children[bit] {
                Some(child) => {
                    node = child;
                    if node.peer.is_some() {
                        best = node.peer;
                    }
                }
                None => break,
            }
        }
        best
    }
}

/// Longest-prefix-match table from IP address to peer id.
#[derive(Debug, Default)]
pub struct AllowedIps {
    v4: Node,
    v6: Node,
}

impl AllowedIps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `net` as belonging to `peer`. Startup only.
    pub fn insert(&mut self, net: IpNet, peer: u32) {
        match net.trunc() {
            IpNet::V4(net) => {
                let bits = u32::from(net.network()) as u128;
                self.v4.insert(bits, 32, net.prefix_len(), peer);
            }
            IpNet::V6(net) => {
                let bits = u128::from(net.network());
                self.v6.insert(bits, 128, net.prefix_len(), peer);
            }
        }
    }

    /// The peer with the most specific allowed prefix covering `addr`.
    pub fn lookup(&self, addr: IpAddr) -> Option<u32> {
        match addr {
            IpAddr::V4(ip) => self.v4.lookup(u32::from(ip) as u128, 32),
            IpAddr::V6(ip) => self.v6.lookup(u128::from(ip), 128),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, u32)]) -> AllowedIps {
        let mut t = AllowedIps::new();
        for (net, peer) in entries {
            t.insert(net.parse().unwrap(), *peer);
        }
        t
    }

    #[test]
    fn most_specific_prefix_wins() {
        let t = table(&[
            ("10.0.0.0/8", 0),
            ("10.1.0.0/16", 1),
            ("10.1.2.0/24", 2),
        ]);

        assert_eq!(t.lookup("10.2.3.4".parse().unwrap()), Some(0));
        assert_eq!(t.lookup("10.1.9.9".parse().unwrap()), Some(1));
        assert_eq!(t.lookup("10.1.2.3".parse().unwrap()), Some(2));
        assert_eq!(t.lookup("192.168.1.1".parse().unwrap()), None);
    }

    #[test]
    fn default_route_catches_everything_in_family() {
        let t = table(&[("0.0.0.0/0", 7), ("10.0.0.0/8", 1)]);
        assert_eq!(t.lookup("8.8.8.8".parse().unwrap()), Some(7));
        assert_eq!(t.lookup("10.0.0.1".parse().unwrap()), Some(1));
        // the v4 default does not leak into v6
        assert_eq!(t.lookup("2001:db8::1".parse().unwrap()), None);
    }

    #[test]
    fn v6_prefixes() {
        let t = table(&[("fd00::/8", 0), ("fd00:aaaa::/32", 1), ("::/0", 9)]);
        assert_eq!(t.lookup("fd00:aaaa::77".parse().unwrap()), Some(1));
        assert_eq!(t.lookup("fd77::1".parse().unwrap()), Some(0));
        assert_eq!(t.lookup("2001:db8::1".parse().unwrap()), Some(9));
    }

    #[test]
    fn host_routes() {
        let t = table(&[("192.0.2.55/32", 3), ("192.0.2.0/24", 4)]);
        assert_eq!(t.lookup("192.0.2.55".parse().unwrap()), Some(3));
        assert_eq!(t.lookup("192.0.2.56".parse().unwrap()), Some(4));
    }

    #[test]
    fn unaligned_prefix_is_truncated_to_its_network() {
        // 10.1.2.3/16 means 10.1.0.0/16
        let t = table(&[("10.1.2.3/16", 5)]);
        assert_eq!(t.lookup("10.1.200.200".parse().unwrap()), Some(5));
        assert_eq!(t.lookup("10.2.0.1".parse().unwrap()), None);
    }

    #[test]
    fn duplicate_prefix_last_insertion_wins() {
        let t = table(&[("10.0.0.0/8", 1), ("10.0.0.0/8", 2)]);
        assert_eq!(t.lookup("10.9.9.9".parse().unwrap()), Some(2));
    }
}
