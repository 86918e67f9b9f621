//! Which active key types an organization has

use sealkeep_core::model::{KeyType, Keypair};

/// Active (non-revoked) key types of one organization
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KeyPresence {
    pub signing: bool,
    pub encryption: bool,
}

impl KeyPresence {
    /// Build from a keypair listing. Revoked keypairs count as absent.
    pub fn from_keypairs(keypairs: &[Keypair]) -> Self {
        keypairs
            .iter()
            .filter(|k| !k.revoked())
            .fold(Self::default(), |mut presence, k| {
                match k.key_type {
                    KeyType::Signing => presence.signing = true,
                    KeyType::Encryption => presence.encryption = true,
                }
                presence
            })
    }

    pub fn has(&self, key_type: KeyType) -> bool {
        match key_type {
            KeyType::Signing => self.signing,
            KeyType::Encryption => self.encryption,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.signing && self.encryption
    }

    /// Key types still to generate, signing first
    pub fn missing(&self) -> Vec<KeyType> {
        KeyType::ALL.into_iter().filter(|t| !self.has(*t)).collect()
    }
}

/// Active keypairs of `key_type` in a listing, newest first
pub fn active_of(keypairs: &[Keypair], key_type: KeyType) -> impl Iterator<Item = &Keypair> {
    keypairs
        .iter()
        .rev()
        .filter(move |k| k.key_type == key_type && !k.revoked())
}
