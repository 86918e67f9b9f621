//! Symmetric primitives: XChaCha20-Poly1305 and HKDF-SHA256

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sealkeep_core::model::WrappedKey;
use sealkeep_core::{Error, Result};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Symmetric key length (32 bytes)
pub const KEY_LEN: usize = 32;

/// XChaCha20-Poly1305 nonce length (24 bytes)
pub const NONCE_LEN: usize = 24;

/// Generate cryptographically secure random bytes
pub(crate) fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

pub(crate) fn random_key() -> Zeroizing<[u8; KEY_LEN]> {
    Zeroizing::new(random_bytes::<KEY_LEN>())
}

/// Encrypt under `key` with a fresh random nonce
pub(crate) fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<WrappedKey> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = random_bytes::<NONCE_LEN>();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| Error::Internal("encryption failed".to_string()))?;

    Ok(WrappedKey {
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

/// Decrypt and authenticate. `None` on any failure, including a malformed
/// nonce; callers decide which error that is.
pub(crate) fn decrypt(key: &[u8; KEY_LEN], wrapped: &WrappedKey, aad: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
    if wrapped.nonce.len() != NONCE_LEN {
        return None;
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(&wrapped.nonce),
            Payload {
                msg: &wrapped.ciphertext,
                aad,
            },
        )
        .ok()
        .map(Zeroizing::new)
}

/// Decrypt a wrapped 32-byte key
pub(crate) fn decrypt_key(
    key: &[u8; KEY_LEN],
    wrapped: &WrappedKey,
    aad: &[u8],
) -> Option<Zeroizing<[u8; KEY_LEN]>> {
    let plaintext = decrypt(key, wrapped, aad)?;
    let bytes: [u8; KEY_LEN] = plaintext.as_slice().try_into().ok()?;
    Some(Zeroizing::new(bytes))
}

/// HKDF-SHA256 expand to a 32-byte key
pub(crate) fn derive_key(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, &mut okm[..])
        .map_err(|e| Error::Internal(format!("key derivation failed: {}", e)))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = random_key();
        let wrapped = encrypt(&key, b"payload", b"aad").unwrap();
        assert_eq!(wrapped.nonce.len(), NONCE_LEN);

        let plain = decrypt(&key, &wrapped, b"aad").unwrap();
        assert_eq!(plain.as_slice(), b"payload");
    }

    #[test]
    fn test_aad_is_bound() {
        let key = random_key();
        let wrapped = encrypt(&key, b"payload", b"org-a").unwrap();
        assert!(decrypt(&key, &wrapped, b"org-b").is_none());
    }

    #[test]
    fn test_malformed_nonce_rejected() {
        let key = random_key();
        let mut wrapped = encrypt(&key, b"payload", b"").unwrap();
        wrapped.nonce.truncate(12);
        assert!(decrypt(&key, &wrapped, b"").is_none());
    }

    #[test]
    fn test_derive_key_separates_info() {
        let a = derive_key(b"ikm", None, b"one").unwrap();
        let b = derive_key(b"ikm", None, b"two").unwrap();
        assert_ne!(*a, *b);
    }
}
