//! Zeroizing containers for long-term secrets
//!
//! A `SecretKey` holds one 32-byte secret (static private key, PSK or
//! precomputed DH secret). It is not `Copy`, wipes its memory on drop
//! and never appears in `Debug` output. Each secret has exactly one
//! owner; sending one over an in-process channel consumes it there.

use std::fmt;

use zeroize::Zeroize;

use super::x25519;

/// One 32-byte secret with a single owner.
#[derive(Clone)]
pub struct SecretKey {
    bytes: [u8; 32],
}

impl SecretKey {
    /// Generate a fresh X25519 private key.
    pub fn generate() -> Self {
        let (private, _) = x25519::keypair();
        Self { bytes: private }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// The all-zero key, used as the default PSK when none is configured.
    pub fn zero() -> Self {
        Self { bytes: [0u8; 32] }
    }

    /// Corresponding X25519 public key.
    pub fn public_key(&self) -> [u8; 32] {
        x25519::pubkey(&self.bytes)
    }

    /// X25519 shared secret with `public`.
    pub fn dh(&self, public: &[u8; 32]) -> SecretKey {
        SecretKey {
            bytes: x25519::dh(&self.bytes, public),
        }
    }

    /// Borrow the raw bytes. Callers must not copy them into
    /// longer-lived storage.
    pub fn expose(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([redacted])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_key_material() {
        let key = SecretKey::from_bytes([0xAB; 32]);
        let printed = format!("{:?}", key);
        assert!(!printed.contains("171")); // 0xAB
        assert!(printed.contains("redacted"));
    }

    #[test]
    fn dh_through_secretkey_matches_raw_dh() {
        let a = SecretKey::generate();
        let b = SecretKey::generate();
        let ab = a.dh(&b.public_key());
        let ba = b.dh(&a.public_key());
        assert_eq!(ab.expose(), ba.expose());
    }
}
