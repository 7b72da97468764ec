//! Sepwire - privilege-separated WireGuard tunnel daemon
//!
//! The daemon is split into four long-lived processes connected by
//! pre-opened datagram socketpairs:
//!
//! - the *enclave* holds the long-term private keys and drives the
//!   Noise IKpsk2 handshake,
//! - the *proxy* owns every listening UDP socket and pins established
//!   flows onto connected sockets,
//! - one *interface worker* per tunnel device encrypts and decrypts
//!   transport data and keeps the per-peer session cache,
//! - the *master* bootstraps the others, feeds them their configuration
//!   and then supervises the process group.
//!
//! A compromise of any single process discloses as little key material
//! as possible: transport keys leave the enclave exactly once and are
//! zeroized at the sender, and neither the proxy nor an interface worker
//! ever holds a long-term secret.

pub mod config;
pub mod crypto;
pub mod enclave;
pub mod error;
pub mod ifn;
pub mod master;
pub mod privsep;
pub mod proxy;
pub mod wire;

pub use config::Config;
pub use error::SepwireError;
