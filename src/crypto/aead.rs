//! AEAD operations
//!
//! ChaCha20-Poly1305 for handshake fields and transport data,
//! XChaCha20-Poly1305 for cookie replies.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce,
};

use crate::error::CryptoError;

/// Poly1305 authentication tag length
pub const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// XChaCha20-Poly1305 nonce length
pub const XNONCE_LEN: usize = 24;

/// The 64-bit counter becomes the last 8 bytes of the 96-bit nonce,
/// little-endian. Handshake fields use counter 0; the key is fresh for
/// every such message, so the fixed nonce is sound.
fn nonce_from(counter: u64) -> Nonce {
    let mut bytes = [0u8; NONCE_LEN];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(bytes)
}

/// Seal plaintext under `key`; output is plaintext length plus tag.
pub fn seal(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            &nonce_from(counter),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

/// Open a sealed buffer under `key`. Fails on any tag or AAD mismatch.
pub fn open(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            &nonce_from(counter),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

/// Open an XChaCha20-Poly1305 sealed buffer (cookie replies).
pub fn xopen(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

/// Seal with XChaCha20-Poly1305 (cookie replies).
pub fn xseal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = [5u8; 32];
        let sealed = seal(&key, 42, b"payload", b"aad").unwrap();
        assert_eq!(sealed.len(), 7 + TAG_LEN);
        let opened = open(&key, 42, &sealed, b"aad").unwrap();
        assert_eq!(opened, b"payload");
    }

    #[test]
    fn open_rejects_wrong_key_counter_or_aad() {
        let key = [5u8; 32];
        let sealed = seal(&key, 42, b"payload", b"aad").unwrap();

        assert!(open(&[6u8; 32], 42, &sealed, b"aad").is_err());
        assert!(open(&key, 43, &sealed, b"aad").is_err());
        assert!(open(&key, 42, &sealed, b"bad").is_err());
    }

    #[test]
    fn empty_plaintext_carries_only_the_tag() {
        // the handshake response seals an empty payload
        let key = [1u8; 32];
        let sealed = seal(&key, 0, &[], b"h").unwrap();
        assert_eq!(sealed.len(), TAG_LEN);
        assert!(open(&key, 0, &sealed, b"h").unwrap().is_empty());
    }

    #[test]
    fn xchacha_roundtrip() {
        let key = [8u8; 32];
        let nonce = [2u8; 24];
        let sealed = xseal(&key, &nonce, b"cookie", b"mac1").unwrap();
        assert_eq!(xopen(&key, &nonce, &sealed, b"mac1").unwrap(), b"cookie");
        assert!(xopen(&key, &nonce, &sealed, b"mac2").is_err());
    }
}
