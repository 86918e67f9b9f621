//! Organization key material
//!
//! Encryption keypairs are X25519, signing keypairs Ed25519. Private halves
//! exist in plaintext only inside these types, which zero themselves on
//! drop and expose no byte accessors.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sealkeep_core::model::{KeyType, Keypair, KeypairId, NewKeypair, OrgId, WrappedKey};
use sealkeep_core::{Error, Result};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::master::MasterKey;

/// Public key length for both key types (32 bytes)
pub const PUBLIC_KEY_LEN: usize = 32;

/// Unlocked X25519 private key of an encryption keypair
pub struct EncryptionPrivateKey {
    id: KeypairId,
    org_id: OrgId,
    secret: StaticSecret,
}

impl EncryptionPrivateKey {
    /// Unwrap the private half of `keypair` and check it matches the public
    /// record.
    pub fn unlock(keypair: &Keypair, wrapped: &WrappedKey, master: &MasterKey) -> Result<Self> {
        expect_type(keypair, KeyType::Encryption)?;
        let bytes = master.unwrap_private(KeyType::Encryption, wrapped)?;
        let secret = StaticSecret::from(*bytes);

        if PublicKey::from(&secret).as_bytes()[..] != keypair.public_key[..] {
            return Err(Error::Internal(format!(
                "private key does not match keypair {}",
                keypair.id
            )));
        }

        Ok(Self {
            id: keypair.id,
            org_id: keypair.org_id,
            secret,
        })
    }

    pub fn id(&self) -> KeypairId {
        self.id
    }

    pub fn org_id(&self) -> OrgId {
        self.org_id
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub(crate) fn public(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }
}

impl std::fmt::Debug for EncryptionPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionPrivateKey").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Unlocked Ed25519 private key of a signing keypair
pub struct SigningPrivateKey {
    id: KeypairId,
    org_id: OrgId,
    key: SigningKey,
}

impl SigningPrivateKey {
    pub fn unlock(keypair: &Keypair, wrapped: &WrappedKey, master: &MasterKey) -> Result<Self> {
        expect_type(keypair, KeyType::Signing)?;
        let bytes = master.unwrap_private(KeyType::Signing, wrapped)?;
        let key = SigningKey::from_bytes(&bytes);

        if key.verifying_key().as_bytes()[..] != keypair.public_key[..] {
            return Err(Error::Internal(format!(
                "private key does not match keypair {}",
                keypair.id
            )));
        }

        Ok(Self {
            id: keypair.id,
            org_id: keypair.org_id,
            key,
        })
    }

    pub fn id(&self) -> KeypairId {
        self.id
    }

    pub fn org_id(&self) -> OrgId {
        self.org_id
    }

    pub(crate) fn key(&self) -> &SigningKey {
        &self.key
    }
}

impl std::fmt::Debug for SigningPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningPrivateKey").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Generate a fresh keypair of `key_type`, its private half wrapped with
/// `master`. The plaintext private key never leaves this function.
pub fn mint(key_type: KeyType, master: &MasterKey) -> Result<NewKeypair> {
    let (public_key, private) = match key_type {
        KeyType::Encryption => {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = PublicKey::from(&secret);
            (public.as_bytes().to_vec(), Zeroizing::new(secret.to_bytes()))
        }
        KeyType::Signing => {
            let key = SigningKey::generate(&mut OsRng);
            (
                key.verifying_key().as_bytes().to_vec(),
                Zeroizing::new(key.to_bytes()),
            )
        }
    };

    Ok(NewKeypair {
        key_type,
        public_key,
        private_key: master.wrap_private(key_type, &private[..])?,
    })
}

/// Parse a recipient's public key. Only active encryption keypairs with a
/// well-formed 32-byte key qualify.
pub fn recipient_key(keypair: &Keypair) -> Result<PublicKey> {
    if keypair.key_type != KeyType::Encryption {
        return Err(Error::InvalidRecipient(format!(
            "keypair {} is a {} key",
            keypair.id, keypair.key_type
        )));
    }
    if keypair.revoked() {
        return Err(Error::InvalidRecipient(format!("keypair {} is revoked", keypair.id)));
    }
    let bytes: [u8; PUBLIC_KEY_LEN] = keypair.public_key.as_slice().try_into().map_err(|_| {
        Error::InvalidRecipient(format!(
            "keypair {} has a {}-byte public key",
            keypair.id,
            keypair.public_key.len()
        ))
    })?;
    Ok(PublicKey::from(bytes))
}

/// Parse a signer's Ed25519 verifying key
pub(crate) fn verifying_key(keypair: &Keypair) -> Option<VerifyingKey> {
    let bytes: [u8; PUBLIC_KEY_LEN] = keypair.public_key.as_slice().try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

fn expect_type(keypair: &Keypair, key_type: KeyType) -> Result<()> {
    if keypair.key_type == key_type {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!(
            "keypair {} is a {} key, expected {}",
            keypair.id, keypair.key_type, key_type
        )))
    }
}
