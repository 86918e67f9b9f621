//! Password derivation and the account master key
//!
//! # Algorithms
//!
//! - **Password stretching**: Argon2id with per-account salt and parameters
//! - **Key separation**: HKDF-SHA256 expands the stretched password into a
//!   login token (sent to the registry) and a wrapping key (never leaves
//!   the process)
//! - **Wrapping**: XChaCha20-Poly1305
//!
//! The master key in turn wraps every organization private key the account
//! owns.

use argon2::{Algorithm, Argon2, Params, Version};
use sealkeep_core::encoding::to_base64;
use sealkeep_core::model::{KdfParams, KeyType, LoginParams, WrappedKey};
use sealkeep_core::{Error, Result};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::cipher::{self, KEY_LEN};

/// Salt length for password derivation (16 bytes)
pub const SALT_LEN: usize = 16;

const AUTH_INFO: &[u8] = b"sealkeep login token v1";
const WRAP_INFO: &[u8] = b"sealkeep master key wrap v1";
const MASTER_AAD: &[u8] = b"sealkeep master key";

/// Stretched password. Zeroed on drop.
pub struct PasswordKey(Zeroizing<[u8; KEY_LEN]>);

impl PasswordKey {
    /// Run Argon2id over the password. Slow with real parameters; call it
    /// off the async executor.
    pub fn derive(password: &[u8], params: &LoginParams) -> Result<Self> {
        let kdf = Params::new(
            params.kdf.memory_kib,
            params.kdf.iterations,
            params.kdf.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| Error::Internal(format!("invalid Argon2 params: {}", e)))?;

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, kdf)
            .hash_password_into(password, &params.salt, &mut key[..])
            .map_err(|e| Error::Internal(format!("password derivation failed: {}", e)))?;

        Ok(Self(key))
    }

    /// Token presented to the registry at login
    pub fn auth_token(&self) -> Result<String> {
        let token = cipher::derive_key(&self.0[..], None, AUTH_INFO)?;
        Ok(to_base64(&token[..]))
    }

    fn wrapping_key(&self) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        cipher::derive_key(&self.0[..], None, WRAP_INFO)
    }

    /// Recover the master key. A key that does not authenticate means the
    /// password was wrong.
    pub fn unwrap_master(&self, wrapped: &WrappedKey) -> Result<MasterKey> {
        let wrapping = self.wrapping_key()?;
        cipher::decrypt_key(&wrapping, wrapped, MASTER_AAD)
            .map(MasterKey)
            .ok_or(Error::InvalidCredentials)
    }
}

/// Account master key. Zeroed on drop, never serialized.
pub struct MasterKey(Zeroizing<[u8; KEY_LEN]>);

impl MasterKey {
    pub fn generate() -> Self {
        Self(cipher::random_key())
    }

    pub fn wrap_with(&self, password_key: &PasswordKey) -> Result<WrappedKey> {
        let wrapping = password_key.wrapping_key()?;
        cipher::encrypt(&wrapping, &self.0[..], MASTER_AAD)
    }

    pub(crate) fn wrap_private(&self, key_type: KeyType, private: &[u8]) -> Result<WrappedKey> {
        cipher::encrypt(&self.0, private, private_key_aad(key_type).as_bytes())
    }

    pub(crate) fn unwrap_private(
        &self,
        key_type: KeyType,
        wrapped: &WrappedKey,
    ) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        cipher::decrypt_key(&self.0, wrapped, private_key_aad(key_type).as_bytes()).ok_or_else(
            || Error::PermissionDenied(format!("{} private key is not wrapped for this account", key_type)),
        )
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

fn private_key_aad(key_type: KeyType) -> String {
    format!("sealkeep private key:{}", key_type)
}

/// Registry-side material for a new account
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub params: LoginParams,
    /// SHA-256 of the login token
    pub auth_hash: Vec<u8>,
    pub master_key: WrappedKey,
}

/// Create the login parameters, token hash and wrapped master key for a new
/// account. The plaintext master key is dropped before returning.
pub fn enroll(password: &[u8], kdf: KdfParams) -> Result<Enrollment> {
    let params = LoginParams {
        salt: cipher::random_bytes::<SALT_LEN>().to_vec(),
        kdf,
    };
    let password_key = PasswordKey::derive(password, &params)?;
    let master = MasterKey::generate();

    Ok(Enrollment {
        auth_hash: Sha256::digest(password_key.auth_token()?.as_bytes()).to_vec(),
        master_key: master.wrap_with(&password_key)?,
        params,
    })
}
