//! Startup configuration protocol, master to child
//!
//! A strict sequence per child: `SInit`, then for every interface one
//! `SIfn` followed by its interface-address and listen-address
//! `SCidrAddr`s and its `SPeer`s (each followed by its allowed-IP
//! `SCidrAddr`s), and one final `SEos` once every child is configured.
//! Only after `SEos` may a child touch untrusted input.
//!
//! The same layouts serve all three children; the master zeroes every
//! field the receiving role has no business holding, so the byte stream
//! itself is role-minimized.

use std::net::SocketAddr;

use zeroize::Zeroize;

use super::ipc::{decode_sockaddr, encode_sockaddr, SOCKADDR_LEN};
use crate::error::IpcError;

fn put_str(out: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(out.len());
    out[..n].copy_from_slice(&bytes[..n]);
    out[n..].fill(0);
}

fn get_str(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn short(expected: usize, got: usize) -> IpcError {
    IpcError::ShortMessage { expected, got }
}

/// Global child parameters.
#[derive(Debug, Clone)]
pub struct SInit {
    pub background: bool,
    pub verbose: i32,
    pub uid: u32,
    pub gid: u32,
    /// Channel descriptor towards the enclave (proxy and IFN roles).
    pub enclport: i32,
    /// Channel descriptor towards the proxy (enclave and IFN roles).
    pub proxport: i32,
    pub nifns: u32,
}

impl SInit {
    pub const SIZE: usize = 25;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.background as u8;
        buf[1..5].copy_from_slice(&self.verbose.to_le_bytes());
        buf[5..9].copy_from_slice(&self.uid.to_le_bytes());
        buf[9..13].copy_from_slice(&self.gid.to_le_bytes());
        buf[13..17].copy_from_slice(&self.enclport.to_le_bytes());
        buf[17..21].copy_from_slice(&self.proxport.to_le_bytes());
        buf[21..25].copy_from_slice(&self.nifns.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, IpcError> {
        if data.len() != Self::SIZE {
            return Err(short(Self::SIZE, data.len()));
        }
        Ok(Self {
            background: data[0] != 0,
            verbose: i32::from_le_bytes(data[1..5].try_into().unwrap()),
            uid: u32::from_le_bytes(data[5..9].try_into().unwrap()),
            gid: u32::from_le_bytes(data[9..13].try_into().unwrap()),
            enclport: i32::from_le_bytes(data[13..17].try_into().unwrap()),
            proxport: i32::from_le_bytes(data[17..21].try_into().unwrap()),
            nifns: u32::from_le_bytes(data[21..25].try_into().unwrap()),
        })
    }
}

/// Per-interface parameters and keys.
#[derive(Debug, Clone)]
pub struct SIfn {
    pub ifnid: u32,
    /// Channel descriptor towards this interface's worker process.
    pub ifnport: i32,
    pub ifname: String,
    pub ifdesc: String,
    pub privkey: [u8; 32],
    pub pubkey: [u8; 32],
    pub pubkeyhash: [u8; 32],
    pub mac1key: [u8; 32],
    pub cookiekey: [u8; 32],
    pub nifaddrs: u32,
    pub nlistenaddrs: u32,
    pub npeers: u32,
}

impl SIfn {
    pub const SIZE: usize = 260;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.ifnid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.ifnport.to_le_bytes());
        put_str(&mut buf[8..24], &self.ifname);
        put_str(&mut buf[24..88], &self.ifdesc);
        buf[88..120].copy_from_slice(&self.privkey);
        buf[120..152].copy_from_slice(&self.pubkey);
        buf[152..184].copy_from_slice(&self.pubkeyhash);
        buf[184..216].copy_from_slice(&self.mac1key);
        buf[216..248].copy_from_slice(&self.cookiekey);
        buf[248..252].copy_from_slice(&self.nifaddrs.to_le_bytes());
        buf[252..256].copy_from_slice(&self.nlistenaddrs.to_le_bytes());
        buf[256..260].copy_from_slice(&self.npeers.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, IpcError> {
        if data.len() != Self::SIZE {
            return Err(short(Self::SIZE, data.len()));
        }
        Ok(Self {
            ifnid: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            ifnport: i32::from_le_bytes(data[4..8].try_into().unwrap()),
            ifname: get_str(&data[8..24]),
            ifdesc: get_str(&data[24..88]),
            privkey: data[88..120].try_into().unwrap(),
            pubkey: data[120..152].try_into().unwrap(),
            pubkeyhash: data[152..184].try_into().unwrap(),
            mac1key: data[184..216].try_into().unwrap(),
            cookiekey: data[216..248].try_into().unwrap(),
            nifaddrs: u32::from_le_bytes(data[248..252].try_into().unwrap()),
            nlistenaddrs: u32::from_le_bytes(data[252..256].try_into().unwrap()),
            npeers: u32::from_le_bytes(data[256..260].try_into().unwrap()),
        })
    }
}

impl Drop for SIfn {
    fn drop(&mut self) {
        self.privkey.zeroize();
    }
}

/// Per-peer parameters and keys.
#[derive(Debug, Clone)]
pub struct SPeer {
    pub ifnid: u32,
    pub peerid: u32,
    pub name: String,
    pub endpoint: Option<SocketAddr>,
    pub psk: [u8; 32],
    pub pubkey: [u8; 32],
    pub mac1key: [u8; 32],
    pub cookiekey: [u8; 32],
    pub nallowedips: u32,
}

impl SPeer {
    pub const SIZE: usize = 195;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.ifnid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.peerid.to_le_bytes());
        put_str(&mut buf[8..40], &self.name);
        encode_sockaddr(self.endpoint, &mut buf[40..63]);
        buf[63..95].copy_from_slice(&self.psk);
        buf[95..127].copy_from_slice(&self.pubkey);
        buf[127..159].copy_from_slice(&self.mac1key);
        buf[159..191].copy_from_slice(&self.cookiekey);
        buf[191..195].copy_from_slice(&self.nallowedips.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, IpcError> {
        if data.len() != Self::SIZE {
            return Err(short(Self::SIZE, data.len()));
        }
        Ok(Self {
            ifnid: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            peerid: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            name: get_str(&data[8..40]),
            endpoint: decode_sockaddr(&data[40..63])?,
            psk: data[63..95].try_into().unwrap(),
            pubkey: data[95..127].try_into().unwrap(),
            mac1key: data[127..159].try_into().unwrap(),
            cookiekey: data[159..191].try_into().unwrap(),
            nallowedips: u32::from_le_bytes(data[191..195].try_into().unwrap()),
        })
    }
}

impl Drop for SPeer {
    fn drop(&mut self) {
        self.psk.zeroize();
    }
}

/// One CIDR-tagged address: an interface address, a listen address
/// (prefix length unused) or a peer allowed-IP entry.
#[derive(Debug, Clone, Copy)]
pub struct SCidrAddr {
    pub ifnid: u32,
    pub peerid: u32,
    pub addr: SocketAddr,
    pub prefixlen: u8,
}

impl SCidrAddr {
    pub const SIZE: usize = 32;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.ifnid.to_le_bytes());
        buf[4..8].copy_from_slice(&self.peerid.to_le_bytes());
        encode_sockaddr(Some(self.addr), &mut buf[8..8 + SOCKADDR_LEN]);
        buf[31] = self.prefixlen;
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, IpcError> {
        if data.len() != Self::SIZE {
            return Err(short(Self::SIZE, data.len()));
        }
        let addr = decode_sockaddr(&data[8..8 + SOCKADDR_LEN])?.ok_or(
            IpcError::UnexpectedMessage {
                mtcode: super::MsgType::SCidrAddr as u8,
            },
        )?;
        Ok(Self {
            ifnid: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            peerid: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            addr,
            prefixlen: data[31],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sinit_roundtrip() {
        let init = SInit {
            background: true,
            verbose: -1,
            uid: 1234,
            gid: 1234,
            enclport: 7,
            proxport: 8,
            nifns: 2,
        };
        let parsed = SInit::from_bytes(&init.to_bytes()).unwrap();
        assert!(parsed.background);
        assert_eq!(parsed.verbose, -1);
        assert_eq!(parsed.enclport, 7);
        assert_eq!(parsed.proxport, 8);
        assert_eq!(parsed.nifns, 2);
    }

    #[test]
    fn sifn_roundtrip_and_name_padding() {
        let ifn = SIfn {
            ifnid: 0,
            ifnport: 9,
            ifname: "tun3".into(),
            ifdesc: "office tunnel".into(),
            privkey: [1u8; 32],
            pubkey: [2u8; 32],
            pubkeyhash: [3u8; 32],
            mac1key: [4u8; 32],
            cookiekey: [5u8; 32],
            nifaddrs: 1,
            nlistenaddrs: 2,
            npeers: 3,
        };
        let parsed = SIfn::from_bytes(&ifn.to_bytes()).unwrap();
        assert_eq!(parsed.ifname, "tun3");
        assert_eq!(parsed.ifdesc, "office tunnel");
        assert_eq!(parsed.privkey, [1u8; 32]);
        assert_eq!(parsed.npeers, 3);
    }

    #[test]
    fn speer_roundtrip_with_and_without_endpoint() {
        let mut peer = SPeer {
            ifnid: 1,
            peerid: 2,
            name: "alice".into(),
            endpoint: Some("198.51.100.4:51820".parse().unwrap()),
            psk: [9u8; 32],
            pubkey: [8u8; 32],
            mac1key: [7u8; 32],
            cookiekey: [6u8; 32],
            nallowedips: 4,
        };
        let parsed = SPeer::from_bytes(&peer.to_bytes()).unwrap();
        assert_eq!(parsed.name, "alice");
        assert_eq!(parsed.endpoint, peer.endpoint);
        assert_eq!(parsed.psk, [9u8; 32]);

        peer.endpoint = None;
        let parsed = SPeer::from_bytes(&peer.to_bytes()).unwrap();
        assert_eq!(parsed.endpoint, None);
    }

    #[test]
    fn scidraddr_roundtrip() {
        let ca = SCidrAddr {
            ifnid: 0,
            peerid: 3,
            addr: "[fd00::1]:0".parse().unwrap(),
            prefixlen: 64,
        };
        let parsed = SCidrAddr::from_bytes(&ca.to_bytes()).unwrap();
        assert_eq!(parsed.peerid, 3);
        assert_eq!(parsed.addr, ca.addr);
        assert_eq!(parsed.prefixlen, 64);
    }

    #[test]
    fn truncated_startup_message_is_an_error() {
        let init = SInit {
            background: false,
            verbose: 0,
            uid: 0,
            gid: 0,
            enclport: -1,
            proxport: -1,
            nifns: 0,
        };
        let bytes = init.to_bytes();
        assert!(SInit::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
