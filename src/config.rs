//! Operator configuration
//!
//! An INI-style file with one `[Interface]` section per tunnel, each
//! followed by its `[Peer]` sections. Only the master ever reads it;
//! the children receive the role-minimized result over the startup
//! protocol.
//!
//! A pre-shared key may be set globally, per interface or per peer;
//! the most specific scope wins and resolution happens here, so the
//! enclave receives exactly one PSK per peer.

use std::net::SocketAddr;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;

use crate::crypto::SecretKey;
use crate::error::ConfigError;

/// Complete parsed configuration.
pub struct Config {
    /// Account the children drop their privileges to.
    pub user: String,
    pub ifns: Vec<IfnConfig>,
}

/// One tunnel interface.
pub struct IfnConfig {
    pub name: String,
    pub description: String,
    pub privkey: SecretKey,
    pub listen_addrs: Vec<SocketAddr>,
    pub addrs: Vec<IpNet>,
    pub peers: Vec<PeerConfig>,
}

/// One peer, with its PSK already scope-resolved.
pub struct PeerConfig {
    pub name: String,
    pub pubkey: [u8; 32],
    pub psk: SecretKey,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Global,
    Interface,
    Peer,
}

#[derive(Default)]
struct IfnBuilder {
    name: Option<String>,
    description: String,
    privkey: Option<[u8; 32]>,
    listen_addrs: Vec<SocketAddr>,
    addrs: Vec<IpNet>,
    psk: Option<[u8; 32]>,
    peers: Vec<PeerBuilder>,
}

#[derive(Default)]
struct PeerBuilder {
    name: Option<String>,
    pubkey: Option<[u8; 32]>,
    psk: Option<[u8; 32]>,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<IpNet>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut user: Option<String> = None;
        let mut global_psk: Option<[u8; 32]> = None;
        let mut ifns: Vec<IfnBuilder> = Vec::new();
        let mut section = Section::Global;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.eq_ignore_ascii_case("[interface]") {
                ifns.push(IfnBuilder::default());
                section = Section::Interface;
                continue;
            }
            if line.eq_ignore_ascii_case("[peer]") {
                let ifn = ifns.last_mut().ok_or(ConfigError::ParseError {
                    line: line_num,
                    message: "[Peer] before any [Interface]".into(),
                })?;
                ifn.peers.push(PeerBuilder::default());
                section = Section::Peer;
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("expected 'key = value', got: {line}"),
                });
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            match section {
                Section::Global => match key.as_str() {
                    "user" => user = Some(value.to_string()),
                    "psk" => global_psk = Some(parse_key(value, "PSK")?),
                    other => {
                        return Err(ConfigError::ParseError {
                            line: line_num,
                            message: format!("unknown global option: {other}"),
                        })
                    }
                },
                Section::Interface => {
                    let ifn = ifns.last_mut().expect("section implies an interface");
                    match key.as_str() {
                        "name" => ifn.name = Some(value.to_string()),
                        "description" => ifn.description = value.to_string(),
                        "privatekey" => ifn.privkey = Some(parse_key(value, "PrivateKey")?),
                        "psk" => ifn.psk = Some(parse_key(value, "PSK")?),
                        "listenaddress" => {
                            for part in split_list(value) {
                                ifn.listen_addrs.push(parse_sockaddr(part)?);
                            }
                        }
                        "address" => {
                            for part in split_list(value) {
                                ifn.addrs.push(parse_net(part)?);
                            }
                        }
                        other => {
                            return Err(ConfigError::ParseError {
                                line: line_num,
                                message: format!("unknown interface option: {other}"),
                            })
                        }
                    }
                }
                Section::Peer => {
                    let peer = ifns
                        .last_mut()
                        .and_then(|i| i.peers.last_mut())
                        .expect("section implies a peer");
                    match key.as_str() {
                        "name" => peer.name = Some(value.to_string()),
                        "publickey" => peer.pubkey = Some(parse_key(value, "PublicKey")?),
                        "psk" => peer.psk = Some(parse_key(value, "PSK")?),
                        "endpoint" => peer.endpoint = Some(parse_sockaddr(value)?),
                        "allowedips" => {
                            for part in split_list(value) {
                                peer.allowed_ips.push(parse_net(part)?);
                            }
                        }
                        other => {
                            return Err(ConfigError::ParseError {
                                line: line_num,
                                message: format!("unknown peer option: {other}"),
                            })
                        }
                    }
                }
            }
        }

        if ifns.is_empty() {
            return Err(ConfigError::MissingField {
                field: "[Interface]".into(),
            });
        }

        let ifns = ifns
            .into_iter()
            .map(|b| b.build(global_psk))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            user: user.unwrap_or_else(|| "nobody".to_string()),
            ifns,
        })
    }
}

impl IfnBuilder {
    fn build(self, global_psk: Option<[u8; 32]>) -> Result<IfnConfig, ConfigError> {
        let name = self.name.ok_or(ConfigError::MissingField {
            field: "Interface Name".into(),
        })?;
        let privkey = self.privkey.ok_or(ConfigError::MissingField {
            field: "PrivateKey".into(),
        })?;
        if self.listen_addrs.is_empty() {
            return Err(ConfigError::MissingField {
                field: "ListenAddress".into(),
            });
        }

        let ifn_psk = self.psk.or(global_psk);
        let peers = self
            .peers
            .into_iter()
            .map(|p| p.build(ifn_psk))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(IfnConfig {
            name,
            description: self.description,
            privkey: SecretKey::from_bytes(privkey),
            listen_addrs: self.listen_addrs,
            addrs: self.addrs,
            peers,
        })
    }
}

impl PeerBuilder {
    fn build(self, ifn_psk: Option<[u8; 32]>) -> Result<PeerConfig, ConfigError> {
        let pubkey = self.pubkey.ok_or(ConfigError::MissingField {
            field: "PublicKey".into(),
        })?;
        if self.allowed_ips.is_empty() {
            return Err(ConfigError::MissingField {
                field: "AllowedIPs".into(),
            });
        }

        // most specific PSK scope wins; all-zero when none configured
        let psk = self.psk.or(ifn_psk).unwrap_or([0u8; 32]);

        Ok(PeerConfig {
            name: self.name.unwrap_or_else(|| "peer".to_string()),
            pubkey,
            psk: SecretKey::from_bytes(psk),
            endpoint: self.endpoint,
            allowed_ips: self.allowed_ips,
        })
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_key(value: &str, field: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64.decode(value).map_err(|_| ConfigError::InvalidKey {
        field: field.to_string(),
    })?;
    bytes.try_into().map_err(|_| ConfigError::InvalidKey {
        field: field.to_string(),
    })
}

fn parse_sockaddr(value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        value: value.to_string(),
    })
}

fn parse_net(value: &str) -> Result<IpNet, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidCidr {
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(byte: u8) -> String {
        BASE64.encode([byte; 32])
    }

    fn sample() -> String {
        format!(
            "# test configuration\n\
             User = _tunnel\n\
             \n\
             [Interface]\n\
             Name = tun0\n\
             Description = office\n\
             PrivateKey = {}\n\
             ListenAddress = 192.0.2.1:51820, [2001:db8::1]:51820\n\
             Address = 10.9.0.1/24\n\
             \n\
             [Peer]\n\
             Name = alice\n\
             PublicKey = {}\n\
             Endpoint = 198.51.100.7:51820\n\
             AllowedIPs = 10.9.0.2/32, fd00::/64\n\
             \n\
             [Peer]\n\
             Name = bob\n\
             PublicKey = {}\n\
             AllowedIPs = 10.9.0.3/32\n",
            b64(1),
            b64(2),
            b64(3)
        )
    }

    #[test]
    fn parses_interfaces_and_peers() {
        let cfg = Config::parse(&sample()).unwrap();
        assert_eq!(cfg.user, "_tunnel");
        assert_eq!(cfg.ifns.len(), 1);

        let ifn = &cfg.ifns[0];
        assert_eq!(ifn.name, "tun0");
        assert_eq!(ifn.description, "office");
        assert_eq!(ifn.listen_addrs.len(), 2);
        assert_eq!(ifn.addrs, vec!["10.9.0.1/24".parse::<IpNet>().unwrap()]);
        assert_eq!(ifn.peers.len(), 2);

        let alice = &ifn.peers[0];
        assert_eq!(alice.name, "alice");
        assert_eq!(alice.pubkey, [2u8; 32]);
        assert_eq!(
            alice.endpoint,
            Some("198.51.100.7:51820".parse().unwrap())
        );
        assert_eq!(alice.allowed_ips.len(), 2);

        assert_eq!(ifn.peers[1].endpoint, None);
    }

    #[test]
    fn psk_scope_resolution_most_specific_wins() {
        let content = format!(
            "PSK = {}\n\
             [Interface]\n\
             Name = tun0\n\
             PrivateKey = {}\n\
             ListenAddress = 127.0.0.1:1\n\
             PSK = {}\n\
             [Peer]\n\
             PublicKey = {}\n\
             AllowedIPs = 10.0.0.0/24\n\
             PSK = {}\n\
             [Peer]\n\
             PublicKey = {}\n\
             AllowedIPs = 10.0.1.0/24\n",
            b64(0xAA),
            b64(1),
            b64(0xBB),
            b64(2),
            b64(0xCC),
            b64(3)
        );
        let cfg = Config::parse(&content).unwrap();
        let peers = &cfg.ifns[0].peers;
        // peer-level beats interface-level beats global
        assert_eq!(peers[0].psk.expose(), &[0xCC; 32]);
        assert_eq!(peers[1].psk.expose(), &[0xBB; 32]);
    }

    #[test]
    fn zero_psk_when_none_configured() {
        let content = format!(
            "[Interface]\n\
             Name = tun0\n\
             PrivateKey = {}\n\
             ListenAddress = 127.0.0.1:1\n\
             [Peer]\n\
             PublicKey = {}\n\
             AllowedIPs = 0.0.0.0/0\n",
            b64(1),
            b64(2)
        );
        let cfg = Config::parse(&content).unwrap();
        assert_eq!(cfg.ifns[0].peers[0].psk.expose(), &[0u8; 32]);
    }

    #[test]
    fn missing_required_fields() {
        assert!(matches!(
            Config::parse("[Interface]\nName = tun0\nListenAddress = 127.0.0.1:1\n"),
            Err(ConfigError::MissingField { .. })
        ));
        assert!(matches!(
            Config::parse(""),
            Err(ConfigError::MissingField { .. })
        ));

        let content = format!(
            "[Interface]\nName = tun0\nPrivateKey = {}\nListenAddress = 127.0.0.1:1\n\
             [Peer]\nPublicKey = {}\n",
            b64(1),
            b64(2)
        );
        // a peer without allowed IPs could never route
        assert!(matches!(
            Config::parse(&content),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn rejects_bad_keys_and_addresses() {
        let content = "[Interface]\nName = tun0\nPrivateKey = not-base64!\n";
        assert!(matches!(
            Config::parse(content),
            Err(ConfigError::InvalidKey { .. })
        ));

        let content = format!(
            "[Interface]\nName = tun0\nPrivateKey = {}\nListenAddress = not-an-addr\n",
            b64(1)
        );
        assert!(matches!(
            Config::parse(&content),
            Err(ConfigError::InvalidAddress { .. })
        ));

        let content = "[Peer]\nPublicKey = x\n";
        assert!(matches!(
            Config::parse(content),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
