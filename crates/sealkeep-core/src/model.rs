//! Key material data model
//!
//! Immutable value types for organizations, keypairs, wrapped keys and
//! envelopes. None of these hold plaintext private key material; that lives
//! only inside the daemon's session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> crate::Result<Self> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| crate::Error::InvalidRequest(format!("malformed id '{}'", s)))
            }
        }
    };
}

id_type!(
    /// Organization identifier
    OrgId
);
id_type!(
    /// Keypair identifier
    KeypairId
);
id_type!(
    /// Account identifier
    AccountId
);

/// Tenant owning keypairs and secrets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrgId,
    pub name: String,
}

/// Purpose of an organization keypair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Signing,
    Encryption,
}

impl KeyType {
    pub const ALL: [KeyType; 2] = [KeyType::Signing, KeyType::Encryption];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signing => "signing",
            Self::Encryption => "encryption",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Public record of an organization keypair, as the registry stores it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keypair {
    pub id: KeypairId,
    pub org_id: OrgId,
    pub key_type: KeyType,
    #[serde(with = "crate::encoding::base64")]
    pub public_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Keypair {
    pub fn revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Symmetrically encrypted key bytes (XChaCha20-Poly1305)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    #[serde(with = "crate::encoding::base64")]
    pub nonce: Vec<u8>,
    #[serde(with = "crate::encoding::base64")]
    pub ciphertext: Vec<u8>,
}

/// A keypair minted by the client, ready to be registered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewKeypair {
    pub key_type: KeyType,
    #[serde(with = "crate::encoding::base64")]
    pub public_key: Vec<u8>,
    /// Private half, wrapped with the owner's master key
    pub private_key: WrappedKey,
}

/// What `ensure_keypairs` did for one organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GenerationOutcome {
    AlreadyComplete,
    Generated { key_types: Vec<KeyType> },
}

impl GenerationOutcome {
    pub fn generated(&self) -> &[KeyType] {
        match self {
            Self::AlreadyComplete => &[],
            Self::Generated { key_types } => key_types,
        }
    }
}

/// One sealed copy of a secret's content key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeEntry {
    /// Encryption keypair the content key was sealed for
    pub recipient: KeypairId,
    /// Sender's ephemeral X25519 public key
    #[serde(with = "crate::encoding::base64")]
    pub ephemeral_public: Vec<u8>,
    pub sealed_key: WrappedKey,
}

/// A secret's ciphertext, per-recipient sealed content keys and a detached
/// signature by the organization's signing keypair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEnvelope {
    pub version: u8,
    pub org_id: OrgId,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub content: WrappedKey,
    /// Ordered by recipient id, no duplicates
    pub entries: Vec<EnvelopeEntry>,
    pub signer: KeypairId,
    #[serde(with = "crate::encoding::base64")]
    pub signature: Vec<u8>,
}

impl SecretEnvelope {
    pub fn entry_for(&self, recipient: KeypairId) -> Option<&EnvelopeEntry> {
        self.entries.iter().find(|e| e.recipient == recipient)
    }
}

/// Argon2id parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

/// What a client needs before it can derive its login token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginParams {
    #[serde(with = "crate::encoding::base64")]
    pub salt: Vec<u8>,
    pub kdf: KdfParams,
}

/// Returned by a successful login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    /// Master key wrapped with the password-derived key
    pub master_key: WrappedKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(revoked: bool) -> Keypair {
        Keypair {
            id: KeypairId::new(),
            org_id: OrgId::new(),
            key_type: KeyType::Signing,
            public_key: vec![7; 32],
            created_at: Utc::now(),
            revoked_at: revoked.then(Utc::now),
        }
    }

    #[test]
    fn test_revoked_derives_from_timestamp() {
        assert!(!keypair(false).revoked());
        assert!(keypair(true).revoked());
    }

    #[test]
    fn test_keypair_json_uses_base64() {
        let kp = keypair(false);
        let json = serde_json::to_value(&kp).unwrap();
        assert_eq!(json["public_key"], "BwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwc=");
        assert_eq!(json["key_type"], "signing");
        let back: Keypair = serde_json::from_value(json).unwrap();
        assert_eq!(back, kp);
    }

    #[test]
    fn test_id_parse() {
        let id = KeypairId::new();
        let parsed: KeypairId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-an-id".parse::<KeypairId>().is_err());
    }

    #[test]
    fn test_generation_outcome() {
        assert!(GenerationOutcome::AlreadyComplete.generated().is_empty());
        let generated = GenerationOutcome::Generated {
            key_types: vec![KeyType::Encryption],
        };
        assert_eq!(generated.generated(), &[KeyType::Encryption]);
    }
}
