//! Keypair lifecycle manager
//!
//! Ensures every organization holds exactly one active signing keypair and
//! one active encryption keypair. Generation is idempotent: the missing set
//! is computed from a fresh listing taken under the organization's
//! generation lock, so a repeated or concurrent call observes keys created
//! by an earlier one instead of minting duplicates.

use std::sync::Arc;

use sealkeep_core::model::{GenerationOutcome, KeyType, Keypair, KeypairId, NewKeypair, Organization};
use sealkeep_core::{Error, PartialFailure, Registry, Result};
use tracing::{debug, info, warn};

use crate::locks::GenerationLocks;
use crate::presence::KeyPresence;
use crate::progress::Progress;

/// Mints new keypairs. Implemented by whoever holds the key material that
/// wraps the private halves; the manager only ever sees wrapped keys.
pub trait KeyMinter: Send + Sync {
    fn mint(&self, key_type: KeyType) -> Result<NewKeypair>;
}

pub struct KeypairManager {
    registry: Arc<dyn Registry>,
    locks: GenerationLocks,
}

impl KeypairManager {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            locks: GenerationLocks::new(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub async fn resolve_org(&self, name: &str) -> Result<Organization> {
        self.registry.org_by_name(name).await
    }

    /// The organization used when a caller names none: the first one the
    /// registry lists.
    pub async fn default_org(&self) -> Result<Organization> {
        self.registry
            .list_orgs()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound("Org".to_string()))
    }

    /// All keypairs of `org`, revoked ones included, oldest first
    pub async fn list_keypairs(&self, org: &Organization) -> Result<Vec<Keypair>> {
        let mut keypairs = self.registry.list_keypairs(org.id).await?;
        keypairs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key_type.cmp(&b.key_type)));
        Ok(keypairs)
    }

    pub async fn presence(&self, org: &Organization) -> Result<KeyPresence> {
        Ok(KeyPresence::from_keypairs(&self.list_keypairs(org).await?))
    }

    /// True iff `org` has an active signing and an active encryption keypair.
    /// Always asks the registry.
    pub async fn is_key_complete(&self, org: &Organization) -> Result<bool> {
        Ok(self.presence(org).await?.is_complete())
    }

    /// Generate exactly the key types `org` is missing.
    ///
    /// Holds the organization's generation lock from listing through
    /// registration. A listing failure aborts before anything is generated.
    pub async fn ensure_keypairs(
        &self,
        org: &Organization,
        minter: &dyn KeyMinter,
        progress: &dyn Progress,
    ) -> Result<GenerationOutcome> {
        match self.ensure_locked(org, minter, progress).await {
            Ok(outcome) => {
                progress.finished(org, &outcome);
                Ok(outcome)
            }
            Err(e) => {
                progress.failed(org, &e);
                Err(e)
            }
        }
    }

    async fn ensure_locked(
        &self,
        org: &Organization,
        minter: &dyn KeyMinter,
        progress: &dyn Progress,
    ) -> Result<GenerationOutcome> {
        let _guard = self.locks.acquire(org.id).await;

        progress.checking(org);
        let missing = self.presence(org).await?.missing();
        if missing.is_empty() {
            debug!("Org {} is key-complete", org.name);
            return Ok(GenerationOutcome::AlreadyComplete);
        }

        progress.generating(org, &missing);
        let new_keys = missing
            .iter()
            .map(|key_type| minter.mint(*key_type))
            .collect::<Result<Vec<_>>>()?;

        let created = self.registry.generate_keypairs(org.id, new_keys).await?;
        info!("Registered {} keypair(s) for org {}", created.len(), org.name);

        Ok(GenerationOutcome::Generated {
            key_types: created.iter().map(|k| k.key_type).collect(),
        })
    }

    /// Run [`ensure_keypairs`](Self::ensure_keypairs) for every organization.
    ///
    /// One organization's failure does not stop the others. If any failed,
    /// the result is a `PartialFailure` carrying both sides.
    pub async fn ensure_keypairs_for_all(
        &self,
        orgs: &[Organization],
        minter: &dyn KeyMinter,
        progress: &dyn Progress,
    ) -> Result<Vec<(Organization, GenerationOutcome)>> {
        let mut tally = PartialFailure::default();
        for org in orgs {
            match self.ensure_keypairs(org, minter, progress).await {
                Ok(outcome) => tally.succeeded.push((org.clone(), outcome)),
                Err(e) => tally.failed.push((org.clone(), e)),
            }
        }

        if tally.failed.is_empty() {
            Ok(tally.succeeded)
        } else {
            warn!(
                "Keypair generation failed for {} of {} orgs",
                tally.failed.len(),
                orgs.len()
            );
            Err(Error::PartialFailure(tally))
        }
    }

    /// Enumerate organizations once, then ensure keypairs for each
    pub async fn ensure_keypairs_for_every_org(
        &self,
        minter: &dyn KeyMinter,
        progress: &dyn Progress,
    ) -> Result<Vec<(Organization, GenerationOutcome)>> {
        let orgs = self.registry.list_orgs().await?;
        self.ensure_keypairs_for_all(&orgs, minter, progress).await
    }

    /// Revoke a keypair. The record stays listed with its revocation time.
    pub async fn revoke(&self, keypair_id: KeypairId) -> Result<Keypair> {
        let keypair = self.registry.revoke_keypair(keypair_id).await?;
        info!("Revoked {} keypair {}", keypair.key_type, keypair.id);
        Ok(keypair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::active_of;
    use crate::progress::Silent;
    use sealkeep_core::model::WrappedKey;
    use sealkeep_core::LocalRegistry;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Produces distinguishable placeholder keys
    #[derive(Default)]
    struct FakeMinter {
        next: AtomicU8,
    }

    impl KeyMinter for FakeMinter {
        fn mint(&self, key_type: KeyType) -> Result<NewKeypair> {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            Ok(NewKeypair {
                key_type,
                public_key: vec![n; 32],
                private_key: WrappedKey {
                    nonce: vec![0; 24],
                    ciphertext: vec![n; 48],
                },
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Progress for Recorder {
        fn checking(&self, org: &Organization) {
            self.events.lock().unwrap().push(format!("checking {}", org.name));
        }

        fn generating(&self, org: &Organization, key_types: &[KeyType]) {
            self.events
                .lock()
                .unwrap()
                .push(format!("generating {} {}", org.name, key_types.len()));
        }

        fn failed(&self, org: &Organization, _error: &Error) {
            self.events.lock().unwrap().push(format!("failed {}", org.name));
        }
    }

    fn setup(orgs: &[&str]) -> (Arc<LocalRegistry>, KeypairManager, Vec<Organization>) {
        setup_with(LocalRegistry::new(), orgs)
    }

    fn setup_with(
        registry: LocalRegistry,
        orgs: &[&str],
    ) -> (Arc<LocalRegistry>, KeypairManager, Vec<Organization>) {
        let registry = Arc::new(registry);
        let orgs = orgs
            .iter()
            .map(|name| registry.create_org(name).unwrap())
            .collect();
        let manager = KeypairManager::new(registry.clone());
        (registry, manager, orgs)
    }

    fn active(keypairs: &[Keypair], key_type: KeyType) -> usize {
        keypairs
            .iter()
            .filter(|k| k.key_type == key_type && !k.revoked())
            .count()
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let (registry, manager, orgs) = setup(&["acme"]);
        let minter = FakeMinter::default();

        let first = manager.ensure_keypairs(&orgs[0], &minter, &Silent).await.unwrap();
        assert_eq!(first.generated(), &[KeyType::Signing, KeyType::Encryption]);
        assert!(manager.is_key_complete(&orgs[0]).await.unwrap());

        let second = manager.ensure_keypairs(&orgs[0], &minter, &Silent).await.unwrap();
        assert_eq!(second, GenerationOutcome::AlreadyComplete);
        assert_eq!(registry.generate_calls(), 1);
        assert!(manager.is_key_complete(&orgs[0]).await.unwrap());
    }

    #[tokio::test]
    async fn test_revoked_key_is_absent_but_listed() {
        let (registry, manager, orgs) = setup(&["acme"]);
        let minter = FakeMinter::default();
        manager.ensure_keypairs(&orgs[0], &minter, &Silent).await.unwrap();

        let listed = manager.list_keypairs(&orgs[0]).await.unwrap();
        let signing = active_of(&listed, KeyType::Signing).next().unwrap().clone();
        manager.revoke(signing.id).await.unwrap();

        assert!(!manager.is_key_complete(&orgs[0]).await.unwrap());
        let listed = manager.list_keypairs(&orgs[0]).await.unwrap();
        assert!(listed.iter().any(|k| k.id == signing.id && k.revoked()));

        let outcome = manager.ensure_keypairs(&orgs[0], &minter, &Silent).await.unwrap();
        assert_eq!(outcome.generated(), &[KeyType::Signing]);
        assert_eq!(registry.generate_calls(), 2);

        let listed = manager.list_keypairs(&orgs[0]).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(active(&listed, KeyType::Signing), 1);
        assert_eq!(active(&listed, KeyType::Encryption), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_both_sides() {
        let (registry, manager, orgs) = setup(&["a", "b"]);
        registry.fail_generation(orgs[1].id);

        let err = manager
            .ensure_keypairs_for_all(&orgs, &FakeMinter::default(), &Silent)
            .await
            .unwrap_err();

        let Error::PartialFailure(partial) = err else {
            panic!("expected partial failure");
        };
        assert_eq!(partial.succeeded.len(), 1);
        assert_eq!(partial.succeeded[0].0, orgs[0]);
        assert_eq!(partial.failed.len(), 1);
        assert_eq!(partial.failed[0].0, orgs[1]);
        assert!(partial.failed[0].1.is_transient());

        assert!(manager.is_key_complete(&orgs[0]).await.unwrap());
        assert!(!manager.is_key_complete(&orgs[1]).await.unwrap());
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_only_that_org() {
        let (registry, manager, orgs) = setup(&["a", "b", "c"]);
        registry.fail_listing(orgs[1].id);
        let recorder = Recorder::default();

        let err = manager
            .ensure_keypairs_for_all(&orgs, &FakeMinter::default(), &recorder)
            .await
            .unwrap_err();

        let Error::PartialFailure(partial) = err else {
            panic!("expected partial failure");
        };
        assert_eq!(partial.succeeded.len(), 2);
        assert_eq!(partial.failed[0].0, orgs[1]);
        // b never reached generation
        assert_eq!(registry.generate_calls(), 2);

        let events = recorder.events.lock().unwrap().clone();
        assert!(events.contains(&"failed b".to_string()));
        assert!(!events.iter().any(|e| e.starts_with("generating b")));
    }

    #[tokio::test]
    async fn test_all_succeed() {
        let (_registry, manager, _orgs) = setup(&["a", "b"]);
        let minter = FakeMinter::default();

        let results = manager
            .ensure_keypairs_for_every_org(&minter, &Silent)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, o)| o.generated().len() == 2));
    }

    #[tokio::test]
    async fn test_concurrent_ensure_generates_once() {
        let (registry, manager, orgs) =
            setup_with(LocalRegistry::new().with_latency(Duration::from_millis(20)), &["acme"]);
        let minter = FakeMinter::default();

        let (a, b) = tokio::join!(
            manager.ensure_keypairs(&orgs[0], &minter, &Silent),
            manager.ensure_keypairs(&orgs[0], &minter, &Silent),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(
            outcomes.iter().filter(|o| **o == GenerationOutcome::AlreadyComplete).count(),
            1
        );
        assert_eq!(registry.generate_calls(), 1);

        let listed = manager.list_keypairs(&orgs[0]).await.unwrap();
        assert_eq!(active(&listed, KeyType::Signing), 1);
        assert_eq!(active(&listed, KeyType::Encryption), 1);
    }

    #[tokio::test]
    async fn test_cancelled_generation_releases_lock() {
        let (registry, manager, orgs) =
            setup_with(LocalRegistry::new().with_latency(Duration::from_millis(50)), &["acme"]);
        let minter = FakeMinter::default();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            manager.ensure_keypairs(&orgs[0], &minter, &Silent),
        )
        .await;
        assert!(cancelled.is_err());

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            manager.ensure_keypairs(&orgs[0], &minter, &Silent),
        )
        .await
        .expect("lock was not released")
        .unwrap();
        assert_eq!(outcome.generated().len(), 2);
        assert_eq!(registry.generate_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_org_and_default() {
        let (_registry, manager, _) = setup(&[]);
        assert!(matches!(manager.resolve_org("nope").await, Err(Error::NotFound(_))));
        assert!(matches!(manager.default_org().await, Err(Error::NotFound(_))));

        let (_registry, manager, orgs) = setup(&["first", "second"]);
        assert_eq!(manager.default_org().await.unwrap(), orgs[0]);
    }

    #[tokio::test]
    async fn test_progress_reports_steps() {
        let (_registry, manager, orgs) = setup(&["acme"]);
        let recorder = Recorder::default();
        manager
            .ensure_keypairs(&orgs[0], &FakeMinter::default(), &recorder)
            .await
            .unwrap();

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec!["checking acme", "generating acme 2"]);
    }

    #[tokio::test]
    async fn test_minter_failure_generates_nothing() {
        struct Refuses;
        impl KeyMinter for Refuses {
            fn mint(&self, _key_type: KeyType) -> Result<NewKeypair> {
                Err(Error::NotAuthenticated)
            }
        }

        let (registry, manager, orgs) = setup(&["acme"]);
        assert!(matches!(
            manager.ensure_keypairs(&orgs[0], &Refuses, &Silent).await,
            Err(Error::NotAuthenticated)
        ));
        assert_eq!(registry.generate_calls(), 0);
    }
}
