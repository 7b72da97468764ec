//! BLAKE2s primitives for WireGuard
//!
//! Hash, keyed MAC and the Noise counter KDF over HMAC-BLAKE2s.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::SimpleHmac;

/// RFC 2104 HMAC over BLAKE2s-256, as used by every WireGuard
/// implementation despite the whitepaper's looser notation.
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 output, also the chaining key length
pub const HASH_LEN: usize = 32;

/// Length of the short keyed MAC used for mac1/mac2
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 of a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// BLAKE2s-256 of two concatenated inputs: HASH(a || b)
pub fn hash2(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, b);
    hasher.finalize().into()
}

/// Keyed BLAKE2s MAC with 16-byte output and a 32-byte key (mac1)
pub fn mac(key: &[u8; HASH_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    let mut m = Blake2sMac::<U16>::new_from_slice(key).expect("32-byte key");
    MacTrait::update(&mut m, data);
    m.finalize_fixed().into()
}

/// Keyed BLAKE2s MAC with 16-byte output and a 16-byte cookie key (mac2)
pub fn mac_keyed16(key: &[u8; MAC_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    let mut m = Blake2sMac::<U16>::new_from_slice(key).expect("16-byte key");
    MacTrait::update(&mut m, data);
    m.finalize_fixed().into()
}

/// Constant-time comparison of a received MAC against the computed one.
pub fn valid_mac(received: &[u8; MAC_LEN], key: &[u8; HASH_LEN], data: &[u8]) -> bool {
    let mut m = Blake2sMac::<U16>::new_from_slice(key).expect("32-byte key");
    MacTrait::update(&mut m, data);
    m.verify_slice(received).is_ok()
}

/// HMAC-BLAKE2s
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    let mut m = HmacBlake2s::new_from_slice(key).expect("any key length");
    Update::update(&mut m, data);
    m.finalize_fixed().into()
}

/// KDF_1(key, input): one 32-byte output of the counter construction
pub fn kdf1(key: &[u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let t0 = hmac(key, input);
    hmac(&t0, &[0x01])
}

/// KDF_2(key, input): two 32-byte outputs
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let t0 = hmac(key, input);
    let t1 = hmac(&t0, &[0x01]);
    let t2 = hmac(&t0, &chained(&t1, 0x02));
    (t1, t2)
}

/// KDF_3(key, input): three 32-byte outputs
pub fn kdf3(
    key: &[u8; HASH_LEN],
    input: &[u8],
) -> ([u8; HASH_LEN], [u8; HASH_LEN], [u8; HASH_LEN]) {
    let t0 = hmac(key, input);
    let t1 = hmac(&t0, &[0x01]);
    let t2 = hmac(&t0, &chained(&t1, 0x02));
    let t3 = hmac(&t0, &chained(&t2, 0x03));
    (t1, t2, t3)
}

/// T_n || n, the input of the next expansion round
fn chained(prev: &[u8; HASH_LEN], n: u8) -> [u8; HASH_LEN + 1] {
    let mut buf = [0u8; HASH_LEN + 1];
    buf[..HASH_LEN].copy_from_slice(prev);
    buf[HASH_LEN] = n;
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    // hash("Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s")
    const CONSTRUCTION_HASH: &str =
        "60e26daef327efc02ec335e2a025d2d016eb4206f87277f52d38d1988b78cd36";

    #[test]
    fn construction_hash_known_answer() {
        let got = hash(b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s");
        assert_eq!(hex::encode(got), CONSTRUCTION_HASH);
    }

    #[test]
    fn hash2_equals_concatenated_hash() {
        let a = b"hello";
        let b = b"world";
        let mut joined = Vec::new();
        joined.extend_from_slice(a);
        joined.extend_from_slice(b);
        assert_eq!(hash2(a, b), hash(&joined));
    }

    #[test]
    fn kdf_outputs_form_a_prefix_chain() {
        let key = [7u8; 32];
        let input = b"input key material";

        let k1 = kdf1(&key, input);
        let (k2a, k2b) = kdf2(&key, input);
        let (k3a, k3b, k3c) = kdf3(&key, input);

        // each KDF_n is a prefix of KDF_{n+1}
        assert_eq!(k1, k2a);
        assert_eq!(k2a, k3a);
        assert_eq!(k2b, k3b);

        assert_ne!(k3a, k3b);
        assert_ne!(k3b, k3c);
    }

    #[test]
    fn mac_is_16_bytes_and_deterministic() {
        let key = [3u8; 32];
        let m1 = mac(&key, b"some message");
        let m2 = mac(&key, b"some message");
        assert_eq!(m1, m2);
        assert_ne!(m1, mac(&key, b"other message"));
    }

    #[test]
    fn valid_mac_accepts_and_rejects() {
        let key = [9u8; 32];
        let m = mac(&key, b"data");
        assert!(valid_mac(&m, &key, b"data"));
        assert!(!valid_mac(&m, &key, b"tampered"));
        let wrong_key = [10u8; 32];
        assert!(!valid_mac(&m, &wrong_key, b"data"));
    }
}
