//! File-backed registry
//!
//! Keeps the whole store in memory behind a mutex and, when opened on a
//! file, rewrites that file (mode 0600) after every mutation. It can be told
//! to fail listing or generation for an organization, and counts generation
//! requests, which is what the keypair and daemon tests lean on.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use super::Registry;
use crate::model::{
    Account, AccountId, Keypair, KeypairId, LoginParams, NewKeypair, OrgId, Organization,
    SecretEnvelope, WrappedKey,
};
use crate::{Error, Result};

/// Registry-side view of an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: AccountId,
    pub email: String,
    pub params: LoginParams,
    /// SHA-256 of the login token
    #[serde(with = "crate::encoding::base64")]
    pub auth_hash: Vec<u8>,
    pub master_key: WrappedKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredKeypair {
    keypair: Keypair,
    private_key: WrappedKey,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Store {
    #[serde(default)]
    accounts: Vec<AccountRecord>,
    #[serde(default)]
    orgs: Vec<Organization>,
    #[serde(default)]
    keypairs: Vec<StoredKeypair>,
    #[serde(default)]
    envelopes: Vec<SecretEnvelope>,
}

#[derive(Debug, Default)]
struct Faults {
    listing: HashSet<OrgId>,
    generation: HashSet<OrgId>,
}

pub struct LocalRegistry {
    store: Mutex<Store>,
    file: Option<PathBuf>,
    faults: Mutex<Faults>,
    generate_calls: AtomicUsize,
    latency: Option<Duration>,
}

impl Default for LocalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRegistry {
    /// Purely in-memory registry
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store::default()),
            file: None,
            faults: Mutex::new(Faults::default()),
            generate_calls: AtomicUsize::new(0),
            latency: None,
        }
    }

    /// Registry persisted to `path`, loading it if it exists
    pub fn open(path: &Path) -> Result<Self> {
        let store = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str(&content).map_err(|e| {
                Error::Internal(format!("corrupt registry store {}: {}", path.display(), e))
            })?
        } else {
            Store::default()
        };

        Ok(Self {
            store: Mutex::new(store),
            file: Some(path.to_path_buf()),
            ..Self::new()
        })
    }

    /// Delay every operation, to widen race windows in tests
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn create_org(&self, name: &str) -> Result<Organization> {
        self.update(|store| {
            if store.orgs.iter().any(|o| o.name == name) {
                return Err(Error::InvalidRequest(format!("organization '{}' exists", name)));
            }
            let org = Organization {
                id: OrgId::new(),
                name: name.to_string(),
            };
            store.orgs.push(org.clone());
            Ok(org)
        })
    }

    pub fn create_account(&self, record: AccountRecord) -> Result<()> {
        self.update(|store| {
            if store.accounts.iter().any(|a| a.email == record.email) {
                return Err(Error::InvalidRequest(format!("account '{}' exists", record.email)));
            }
            store.accounts.push(record);
            Ok(())
        })
    }

    /// Number of `generate_keypairs` requests received so far
    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn fail_listing(&self, org_id: OrgId) {
        self.faults().listing.insert(org_id);
    }

    pub fn fail_generation(&self, org_id: OrgId) {
        self.faults().generation.insert(org_id);
    }

    pub fn clear_faults(&self) {
        let mut faults = self.faults();
        faults.listing.clear();
        faults.generation.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `change` to a copy of the store, persist the copy, then swap it
    /// in. A failed write leaves memory as it was.
    fn update<T>(&self, change: impl FnOnce(&mut Store) -> Result<T>) -> Result<T> {
        let mut store = self.lock();
        let mut next = store.clone();
        let value = change(&mut next)?;
        self.persist(&next)?;
        *store = next;
        Ok(value)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn persist(&self, store: &Store) -> Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };

        let write = || -> std::io::Result<()> {
            let tmp = path.with_extension("json.tmp");
            let content = serde_json::to_vec_pretty(store)?;
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)?;
            file.write_all(&content)?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        };

        write().map_err(|e| {
            warn!("Failed to persist registry {}: {}", path.display(), e);
            Error::Transient(e.to_string())
        })
    }
}

#[async_trait]
impl Registry for LocalRegistry {
    async fn prelogin(&self, email: &str) -> Result<LoginParams> {
        self.delay().await;
        self.lock()
            .accounts
            .iter()
            .find(|a| a.email == email)
            .map(|a| a.params.clone())
            .ok_or(Error::InvalidCredentials)
    }

    async fn login(&self, email: &str, auth_token: &str) -> Result<Account> {
        self.delay().await;
        let store = self.lock();
        let record = store
            .accounts
            .iter()
            .find(|a| a.email == email)
            .ok_or(Error::InvalidCredentials)?;

        let presented = Sha256::digest(auth_token.as_bytes());
        if !bool::from(presented.as_slice().ct_eq(&record.auth_hash)) {
            debug!("Login token mismatch for {}", email);
            return Err(Error::InvalidCredentials);
        }

        Ok(Account {
            id: record.id,
            email: record.email.clone(),
            master_key: record.master_key.clone(),
        })
    }

    async fn org_by_name(&self, name: &str) -> Result<Organization> {
        self.delay().await;
        self.lock()
            .orgs
            .iter()
            .find(|o| o.name == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Org '{}'", name)))
    }

    async fn list_orgs(&self) -> Result<Vec<Organization>> {
        self.delay().await;
        Ok(self.lock().orgs.clone())
    }

    async fn list_keypairs(&self, org_id: OrgId) -> Result<Vec<Keypair>> {
        self.delay().await;
        if self.faults().listing.contains(&org_id) {
            return Err(Error::Transient(format!("listing keypairs for {} failed", org_id)));
        }

        let store = self.lock();
        if !store.orgs.iter().any(|o| o.id == org_id) {
            return Err(Error::NotFound(format!("Org {}", org_id)));
        }
        Ok(store
            .keypairs
            .iter()
            .filter(|k| k.keypair.org_id == org_id)
            .map(|k| k.keypair.clone())
            .collect())
    }

    async fn generate_keypairs(&self, org_id: OrgId, keys: Vec<NewKeypair>) -> Result<Vec<Keypair>> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.faults().generation.contains(&org_id) {
            return Err(Error::Transient(format!("generating keypairs for {} failed", org_id)));
        }

        self.update(|store| {
            if !store.orgs.iter().any(|o| o.id == org_id) {
                return Err(Error::NotFound(format!("Org {}", org_id)));
            }

            let now = Utc::now();
            let created = keys
                .into_iter()
                .map(|new| {
                    let keypair = Keypair {
                        id: KeypairId::new(),
                        org_id,
                        key_type: new.key_type,
                        public_key: new.public_key,
                        created_at: now,
                        revoked_at: None,
                    };
                    store.keypairs.push(StoredKeypair {
                        keypair: keypair.clone(),
                        private_key: new.private_key,
                    });
                    keypair
                })
                .collect();
            Ok(created)
        })
    }

    async fn revoke_keypair(&self, keypair_id: KeypairId) -> Result<Keypair> {
        self.delay().await;
        self.update(|store| {
            let stored = store
                .keypairs
                .iter_mut()
                .find(|k| k.keypair.id == keypair_id)
                .ok_or_else(|| Error::NotFound(format!("Keypair {}", keypair_id)))?;

            if stored.keypair.revoked_at.is_none() {
                stored.keypair.revoked_at = Some(Utc::now());
            }
            Ok(stored.keypair.clone())
        })
    }

    async fn private_key(&self, keypair_id: KeypairId) -> Result<WrappedKey> {
        self.delay().await;
        self.lock()
            .keypairs
            .iter()
            .find(|k| k.keypair.id == keypair_id)
            .map(|k| k.private_key.clone())
            .ok_or_else(|| Error::NotFound(format!("Keypair {}", keypair_id)))
    }

    async fn put_envelope(&self, envelope: SecretEnvelope) -> Result<()> {
        self.delay().await;
        self.update(|store| {
            store
                .envelopes
                .retain(|e| !(e.org_id == envelope.org_id && e.path == envelope.path));
            store.envelopes.push(envelope);
            Ok(())
        })
    }

    async fn get_envelope(&self, org_id: OrgId, path: &str) -> Result<SecretEnvelope> {
        self.delay().await;
        self.lock()
            .envelopes
            .iter()
            .find(|e| e.org_id == org_id && e.path == path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Secret '{}'", path)))
    }
}
