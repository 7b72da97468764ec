//! Cryptographic primitives for the WireGuard protocol
//!
//! - BLAKE2s hashing, keyed MAC and the HMAC counter KDF (blake2s)
//! - ChaCha20-Poly1305 and XChaCha20-Poly1305 AEAD (aead)
//! - X25519 Diffie-Hellman (x25519)
//! - Noise IKpsk2 symmetric state and derived protocol keys (noise)
//! - zeroizing containers for long-term secrets (keys)

pub mod aead;
pub mod blake2s;
pub mod keys;
pub mod noise;
pub mod x25519;

pub use keys::SecretKey;
