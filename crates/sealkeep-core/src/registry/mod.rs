//! Registry collaborator
//!
//! The remote registry is authoritative for organizations, keypair records,
//! wrapped private keys and secret envelopes. Only its logical operations
//! are modeled here; [`LocalRegistry`] is a file-backed implementation used
//! for single-machine setups and tests.
//!
//! Implementations report unreachable-backend conditions as
//! [`Error::Transient`](crate::Error::Transient) and never retry internally.

mod local;

pub use local::{AccountRecord, LocalRegistry};

use async_trait::async_trait;

use crate::model::{
    Account, Keypair, KeypairId, LoginParams, NewKeypair, OrgId, Organization, SecretEnvelope,
    WrappedKey,
};
use crate::Result;

#[async_trait]
pub trait Registry: Send + Sync {
    /// Parameters needed to derive the login token for `email`
    async fn prelogin(&self, email: &str) -> Result<LoginParams>;

    /// Verify a login token, returning the account and its wrapped master key
    async fn login(&self, email: &str, auth_token: &str) -> Result<Account>;

    /// Look up an organization by name, `NotFound` if absent
    async fn org_by_name(&self, name: &str) -> Result<Organization>;

    async fn list_orgs(&self) -> Result<Vec<Organization>>;

    /// All keypairs of an organization, revoked ones included, oldest first
    async fn list_keypairs(&self, org_id: OrgId) -> Result<Vec<Keypair>>;

    /// Register client-minted keypairs for an organization
    async fn generate_keypairs(&self, org_id: OrgId, keys: Vec<NewKeypair>) -> Result<Vec<Keypair>>;

    async fn revoke_keypair(&self, keypair_id: KeypairId) -> Result<Keypair>;

    /// Wrapped private half of a keypair
    async fn private_key(&self, keypair_id: KeypairId) -> Result<WrappedKey>;

    async fn put_envelope(&self, envelope: SecretEnvelope) -> Result<()>;

    async fn get_envelope(&self, org_id: OrgId, path: &str) -> Result<SecretEnvelope>;
}
