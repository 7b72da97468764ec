//! X25519 Diffie-Hellman

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// Both private and public keys are 32 bytes
pub const KEY_LEN: usize = 32;

/// Generate a fresh keypair, returned as (private, public).
pub fn keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Derive the public key of a private key.
pub fn pubkey(private: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    PublicKey::from(&StaticSecret::from(*private)).to_bytes()
}

/// X25519(private, public) shared secret.
pub fn dh(private: &[u8; KEY_LEN], public: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    StaticSecret::from(*private)
        .diffie_hellman(&PublicKey::from(*public))
        .to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_agrees() {
        let (apriv, apub) = keypair();
        let (bpriv, bpub) = keypair();
        assert_eq!(dh(&apriv, &bpub), dh(&bpriv, &apub));
    }

    #[test]
    fn pubkey_matches_keypair() {
        let (private, public) = keypair();
        assert_eq!(pubkey(&private), public);
    }

    #[test]
    fn rfc7748_public_key_vector() {
        let private = [
            0x77, 0x07, 0x6d, 0x0a, 0x73, 0x18, 0xa5, 0x7d, 0x3c, 0x16, 0xc1, 0x72, 0x51, 0xb2,
            0x66, 0x45, 0xdf, 0x4c, 0x2f, 0x87, 0xeb, 0xc0, 0x99, 0x2a, 0xb1, 0x77, 0xfb, 0xa5,
            0x1d, 0xb9, 0x2c, 0x2a,
        ];
        let expected = [
            0x85, 0x20, 0xf0, 0x09, 0x89, 0x30, 0xa7, 0x54, 0x74, 0x8b, 0x7d, 0xdc, 0xb4, 0x3e,
            0xf7, 0x5a, 0x0d, 0xbf, 0x3a, 0x0d, 0x26, 0x38, 0x1a, 0xf4, 0xeb, 0xa4, 0xa9, 0x8e,
            0xaa, 0x9b, 0x4e, 0x6a,
        ];
        assert_eq!(pubkey(&private), expected);
    }
}
