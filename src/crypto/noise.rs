//! Noise IKpsk2 symmetric state and derived protocol keys
//!
//! Pattern: Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s. The running chaining
//! key and transcript hash live here; the handshake message logic itself
//! is in the enclave, the only process allowed to touch long-term keys.

use zeroize::Zeroize;

use super::{aead, blake2s};
use crate::error::CryptoError;

/// Noise protocol construction string
pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// WireGuard identifier string
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// Label for mac1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for cookie key derivation
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// Hash and chaining key length
pub const HASH_LEN: usize = blake2s::HASH_LEN;

/// hash(CONSTRUCTION), the initial chaining key of every handshake.
pub fn construction_hash() -> [u8; HASH_LEN] {
    blake2s::hash(CONSTRUCTION)
}

/// hash(hash(CONSTRUCTION) || IDENTIFIER)
pub fn construction_id_hash() -> [u8; HASH_LEN] {
    blake2s::hash2(&construction_hash(), IDENTIFIER)
}

/// hash(hash(hash(CONSTRUCTION) || IDENTIFIER) || spub), the initial
/// transcript hash for handshakes addressed to the holder of `spub`.
pub fn pubkey_hash(spub: &[u8; 32]) -> [u8; HASH_LEN] {
    blake2s::hash2(&construction_id_hash(), spub)
}

/// hash(label-mac1 || spub)
pub fn mac1_key(spub: &[u8; 32]) -> [u8; 32] {
    blake2s::hash2(LABEL_MAC1, spub)
}

/// hash(label-cookie || spub)
pub fn cookie_key(spub: &[u8; 32]) -> [u8; 32] {
    blake2s::hash2(LABEL_COOKIE, spub)
}

/// The mutable symmetric state of one handshake: chaining key `c` and
/// transcript hash `h`. Zeroized on drop; `c` is secret material.
#[derive(Clone)]
pub struct SymmetricState {
    pub c: [u8; HASH_LEN],
    pub h: [u8; HASH_LEN],
}

impl Drop for SymmetricState {
    fn drop(&mut self) {
        self.c.zeroize();
        self.h.zeroize();
    }
}

impl SymmetricState {
    /// Fresh state for a handshake addressed to the holder of
    /// `responder_spub` (ours when responding, the peer's when
    /// initiating).
    pub fn new(responder_spub: &[u8; 32]) -> Self {
        Self {
            c: construction_hash(),
            h: pubkey_hash(responder_spub),
        }
    }

    /// h = hash(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.h = blake2s::hash2(&self.h, data);
    }

    /// c = KDF_1(c, input)
    pub fn mix_chain(&mut self, input: &[u8]) {
        self.c = blake2s::kdf1(&self.c, input);
    }

    /// (c, k) = KDF_2(c, input); returns the message key k
    pub fn mix_key(&mut self, input: &[u8]) -> [u8; 32] {
        let (c, k) = blake2s::kdf2(&self.c, input);
        self.c = c;
        k
    }

    /// (c, tau, k) = KDF_3(c, psk); hashes tau into h, returns k
    pub fn mix_psk(&mut self, psk: &[u8; 32]) -> [u8; 32] {
        let (c, mut tau, k) = blake2s::kdf3(&self.c, psk);
        self.c = c;
        self.mix_hash(&tau);
        tau.zeroize();
        k
    }

    /// Seal `plaintext` with a zero nonce and h as AAD, then hash the
    /// ciphertext into the transcript.
    pub fn seal_and_hash(
        &mut self,
        key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let sealed = aead::seal(key, 0, plaintext, &self.h)?;
        self.mix_hash(&sealed);
        Ok(sealed)
    }

    /// Open `ciphertext` with a zero nonce and h as AAD, then hash the
    /// ciphertext into the transcript.
    pub fn open_and_hash(
        &mut self,
        key: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let opened = aead::open(key, 0, ciphertext, &self.h)?;
        self.mix_hash(ciphertext);
        Ok(opened)
    }
}

/// Directional transport keys derived from a finished handshake:
/// (send, recv) = KDF_2(c, empty) for the initiator, swapped for the
/// responder.
pub fn transport_keys(c: &[u8; HASH_LEN], responder: bool) -> ([u8; 32], [u8; 32]) {
    let (t1, t2) = blake2s::kdf2(c, &[]);
    if responder {
        (t2, t1)
    } else {
        (t1, t2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // fixed for the lifetime of the protocol
    const CONSHASH: &str = "60e26daef327efc02ec335e2a025d2d016eb4206f87277f52d38d1988b78cd36";
    const CONSIDHASH: &str = "2211b361081ac566691243db458ad5322d9c6c662293e8b70ee19c65ba079ef3";

    #[test]
    fn construction_hashes_known_answers() {
        assert_eq!(hex::encode(construction_hash()), CONSHASH);
        assert_eq!(hex::encode(construction_id_hash()), CONSIDHASH);
    }

    #[test]
    fn initiator_and_responder_start_identically() {
        let spub = [42u8; 32];
        let a = SymmetricState::new(&spub);
        let b = SymmetricState::new(&spub);
        assert_eq!(a.c, b.c);
        assert_eq!(a.h, b.h);
        assert_ne!(a.h, SymmetricState::new(&[43u8; 32]).h);
    }

    #[test]
    fn seal_and_open_keep_transcripts_in_step() {
        let spub = [1u8; 32];
        let mut tx = SymmetricState::new(&spub);
        let mut rx = tx.clone();
        let key = [9u8; 32];

        let sealed = tx.seal_and_hash(&key, b"static key").unwrap();
        let opened = rx.open_and_hash(&key, &sealed).unwrap();

        assert_eq!(opened, b"static key");
        assert_eq!(tx.h, rx.h);
    }

    #[test]
    fn transport_keys_are_swapped_for_the_responder() {
        let c = [17u8; 32];
        let (isend, irecv) = transport_keys(&c, false);
        let (rsend, rrecv) = transport_keys(&c, true);
        assert_eq!(isend, rrecv);
        assert_eq!(irecv, rsend);
    }
}
