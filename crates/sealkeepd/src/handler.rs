//! Request dispatch
//!
//! Maps control channel requests onto the session, the keypair manager and
//! the envelope engine. Registry calls happen outside the session scope;
//! only the crypto itself runs inside `with_session`.

use std::sync::Arc;

use keypairs::{active_of, KeyMinter, KeypairManager, LogProgress};
use sealkeep_core::encoding::{from_base64, to_base64};
use sealkeep_core::model::{GenerationOutcome, KeyType, Keypair, KeypairId, NewKeypair, Organization};
use sealkeep_core::protocol::{
    GenerateReport, KeypairList, OpenReport, OrgOutcome, Request, Response, SealReport, StatusReport,
    WireError,
};
use sealkeep_core::{Error, Registry, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::session::Session;

/// Identity of the process on the other end of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    pub pid: Option<i32>,
}

/// Mints keypairs with the session's master key
struct SessionMinter<'a>(&'a Session);

impl KeyMinter for SessionMinter<'_> {
    fn mint(&self, key_type: KeyType) -> Result<NewKeypair> {
        self.0.with_session(|keys| keys.mint(key_type))
    }
}

pub struct Handler {
    session: Arc<Session>,
    keypairs: KeypairManager,
}

impl Handler {
    pub fn new(registry: Arc<dyn Registry>, session: Arc<Session>) -> Self {
        Self {
            session,
            keypairs: KeypairManager::new(registry),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Serve one request. Errors are logged with their cause and answered
    /// with the stable public message only.
    pub async fn handle(&self, caller: &Caller, request: Request) -> Response {
        let name = request.name();
        debug!("Request {} from uid {} pid {:?}", name, caller.uid, caller.pid);
        self.session.touch();

        match self.dispatch(request).await {
            Ok(value) => Response::success(value),
            Err(e) => {
                if e.is_transient() {
                    warn!("Request {} hit an unavailable registry: {}", name, e);
                } else {
                    debug!("Request {} failed: {}", name, e);
                }
                Response::error(WireError::from(&e))
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Value> {
        match request {
            Request::Status => to_value(self.status()),
            Request::Login { email, password } => {
                self.session.login(&email, Zeroizing::new(password)).await?;
                to_value(self.status())
            }
            Request::Logout => {
                self.session.logout().await;
                to_value(self.status())
            }
            Request::Lock => {
                self.session.lock().await;
                to_value(self.status())
            }
            Request::ListKeypairs { org } => to_value(self.list_keypairs(&org).await?),
            Request::GenerateKeypairs { org, all } => {
                to_value(self.generate_keypairs(org.as_deref(), all).await?)
            }
            Request::RevokeKeypair { keypair_id } => to_value(self.revoke(keypair_id).await?),
            Request::Seal { org, path, secret } => {
                let secret = Zeroizing::new(from_base64(&secret)?);
                to_value(self.seal(&org, &path, &secret).await?)
            }
            Request::Open { org, path } => to_value(self.open(&org, &path).await?),
        }
    }

    fn status(&self) -> StatusReport {
        StatusReport {
            state: self.session.state().to_string(),
            email: self.session.email(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
        }
    }

    async fn list_keypairs(&self, org: &str) -> Result<KeypairList> {
        self.session.require_logged_in()?;
        let org = self.keypairs.resolve_org(org).await?;
        let keypairs = self.keypairs.list_keypairs(&org).await?;
        Ok(KeypairList { org, keypairs })
    }

    async fn generate_keypairs(&self, org: Option<&str>, all: bool) -> Result<GenerateReport> {
        self.session.require_logged_in()?;
        let minter = SessionMinter(&self.session);

        let results = match (org, all) {
            (Some(_), true) => {
                return Err(Error::InvalidRequest(
                    "--org and --all cannot be used together".to_string(),
                ))
            }
            (None, true) => {
                self.keypairs
                    .ensure_keypairs_for_every_org(&minter, &LogProgress)
                    .await?
            }
            (Some(name), false) => {
                let org = self.keypairs.resolve_org(name).await?;
                self.ensure_one(org, &minter).await?
            }
            (None, false) => {
                let org = self.keypairs.default_org().await?;
                self.ensure_one(org, &minter).await?
            }
        };

        Ok(GenerateReport {
            results: results
                .into_iter()
                .map(|(org, outcome)| OrgOutcome { org, outcome })
                .collect(),
        })
    }

    async fn ensure_one(
        &self,
        org: Organization,
        minter: &SessionMinter<'_>,
    ) -> Result<Vec<(Organization, GenerationOutcome)>> {
        let outcome = self.keypairs.ensure_keypairs(&org, minter, &LogProgress).await?;
        Ok(vec![(org, outcome)])
    }

    async fn revoke(&self, keypair_id: KeypairId) -> Result<Keypair> {
        self.session.require_logged_in()?;
        let keypair = self.keypairs.revoke(keypair_id).await?;
        // The session may have been locked meanwhile, which already dropped it
        let _ = self.session.with_session(|keys| Ok(keys.evict(keypair_id)));
        Ok(keypair)
    }

    async fn seal(&self, org: &str, path: &str, secret: &[u8]) -> Result<SealReport> {
        self.session.require_logged_in()?;
        let org = self.keypairs.resolve_org(org).await?;
        let keypairs = self.keypairs.list_keypairs(&org).await?;

        let signer = active_of(&keypairs, KeyType::Signing)
            .next()
            .ok_or_else(|| Error::NotFound(format!("Signing keypair for org '{}'", org.name)))?;
        let recipients: Vec<Keypair> = active_of(&keypairs, KeyType::Encryption).cloned().collect();

        let wrapped = if self.session.with_session(|keys| Ok(keys.is_unlocked(signer.id)))? {
            None
        } else {
            Some(self.keypairs.registry().private_key(signer.id).await?)
        };

        let envelope = self.session.with_session(|keys| {
            let signing = keys.signing_key(signer, wrapped.as_ref())?;
            envelope::seal(org.id, path, secret, &recipients, signing)
        })?;

        let report = SealReport {
            path: envelope.path.clone(),
            recipients: envelope.entries.len(),
            signer: envelope.signer,
        };
        self.keypairs.registry().put_envelope(envelope).await?;
        Ok(report)
    }

    async fn open(&self, org: &str, path: &str) -> Result<OpenReport> {
        self.session.require_logged_in()?;
        let org = self.keypairs.resolve_org(org).await?;
        let envelope = self.keypairs.registry().get_envelope(org.id, path).await?;
        let keypairs = self.keypairs.list_keypairs(&org).await?;

        let signer = keypairs
            .iter()
            .find(|k| k.id == envelope.signer)
            .ok_or(Error::SignatureInvalid)?;
        envelope::verify(&envelope, signer)?;

        // Revoked encryption keys still open what was sealed for them
        let recipient = keypairs
            .iter()
            .find(|k| k.key_type == KeyType::Encryption && envelope.entry_for(k.id).is_some())
            .ok_or(Error::NotAuthorized)?;

        let wrapped = if self.session.with_session(|keys| Ok(keys.is_unlocked(recipient.id)))? {
            None
        } else {
            Some(self.keypairs.registry().private_key(recipient.id).await?)
        };

        let secret = self.session.with_session(|keys| {
            let private = keys
                .encryption_key(recipient, wrapped.as_ref())
                .map_err(|e| match e {
                    // Wrapped for another account: not ours to read
                    Error::PermissionDenied(_) => Error::NotAuthorized,
                    other => other,
                })?;
            envelope::open(&envelope, private, signer)
        })?;

        Ok(OpenReport {
            path: envelope.path,
            secret: to_base64(&secret),
        })
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Internal(format!("encoding response: {}", e)))
}
