//! Session state machine
//!
//! ```text
//! LoggedOut ──login──► Authenticating ──ok──► LoggedIn ──lock/idle──► Locked
//!     ▲                      │                   │                     │
//!     │                      └──fail─► previous  └──logout──► LoggedOut │
//!     └───────────────────────────── logout ◄──────────────── login ◄──┘
//! ```
//!
//! Key material exists only in `LoggedIn`. Leaving that state drops the
//! session keys, which zero themselves, before the new state is visible.
//! Transitions are serialized by one async mutex; readers of the current
//! state never wait on a transition and fail fast instead.

use std::collections::hash_map::{Entry, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use envelope::{EncryptionPrivateKey, MasterKey, PasswordKey, SigningPrivateKey};
use sealkeep_core::model::{AccountId, KeyType, Keypair, KeypairId, NewKeypair, WrappedKey};
use sealkeep_core::{Error, Registry, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    LoggedOut,
    Authenticating,
    LoggedIn,
    Locked,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoggedOut => "logged_out",
            Self::Authenticating => "authenticating",
            Self::LoggedIn => "logged_in",
            Self::Locked => "locked",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Key material of a logged-in session. Only reachable through
/// [`Session::with_session`].
pub struct SessionKeys {
    account: AccountId,
    email: String,
    master: MasterKey,
    encryption: HashMap<KeypairId, EncryptionPrivateKey>,
    signing: HashMap<KeypairId, SigningPrivateKey>,
}

impl SessionKeys {
    fn new(account: AccountId, email: String, master: MasterKey) -> Self {
        Self {
            account,
            email,
            master,
            encryption: HashMap::new(),
            signing: HashMap::new(),
        }
    }

    pub fn account(&self) -> AccountId {
        self.account
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// Mint a keypair whose private half is wrapped with this session's
    /// master key
    pub fn mint(&self, key_type: KeyType) -> Result<NewKeypair> {
        envelope::mint(key_type, &self.master)
    }

    pub fn is_unlocked(&self, keypair_id: KeypairId) -> bool {
        self.encryption.contains_key(&keypair_id) || self.signing.contains_key(&keypair_id)
    }

    /// The unlocked encryption key for `keypair`, unwrapping `wrapped` on
    /// first use
    pub fn encryption_key(
        &mut self,
        keypair: &Keypair,
        wrapped: Option<&WrappedKey>,
    ) -> Result<&EncryptionPrivateKey> {
        match self.encryption.entry(keypair.id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let wrapped = wrapped.ok_or_else(|| not_fetched(keypair))?;
                let key = EncryptionPrivateKey::unlock(keypair, wrapped, &self.master)?;
                debug!("Unlocked encryption keypair {}", keypair.id);
                Ok(entry.insert(key))
            }
        }
    }

    pub fn signing_key(
        &mut self,
        keypair: &Keypair,
        wrapped: Option<&WrappedKey>,
    ) -> Result<&SigningPrivateKey> {
        match self.signing.entry(keypair.id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let wrapped = wrapped.ok_or_else(|| not_fetched(keypair))?;
                let key = SigningPrivateKey::unlock(keypair, wrapped, &self.master)?;
                debug!("Unlocked signing keypair {}", keypair.id);
                Ok(entry.insert(key))
            }
        }
    }

    /// Drop an unlocked private key, e.g. after its keypair was revoked
    pub fn evict(&mut self, keypair_id: KeypairId) -> bool {
        let encryption = self.encryption.remove(&keypair_id).is_some();
        let signing = self.signing.remove(&keypair_id).is_some();
        encryption || signing
    }
}

fn not_fetched(keypair: &Keypair) -> Error {
    Error::Internal(format!("private key for {} was not fetched", keypair.id))
}

enum State {
    LoggedOut,
    Authenticating,
    LoggedIn(SessionKeys),
    Locked { email: String },
}

impl State {
    fn kind(&self) -> SessionState {
        match self {
            Self::LoggedOut => SessionState::LoggedOut,
            Self::Authenticating => SessionState::Authenticating,
            Self::LoggedIn(_) => SessionState::LoggedIn,
            Self::Locked { .. } => SessionState::Locked,
        }
    }

    fn email(&self) -> Option<&str> {
        match self {
            Self::LoggedIn(keys) => Some(keys.email()),
            Self::Locked { email } => Some(email),
            _ => None,
        }
    }
}

/// The daemon's single session
pub struct Session {
    registry: Arc<dyn Registry>,
    state: Mutex<State>,
    transition: tokio::sync::Mutex<()>,
    last_activity: Mutex<Instant>,
}

impl Session {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            state: Mutex::new(State::LoggedOut),
            transition: tokio::sync::Mutex::new(()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock_state().kind()
    }

    /// Email of the logged-in or locked account
    pub fn email(&self) -> Option<String> {
        self.lock_state().email().map(str::to_string)
    }

    /// Run `op` with the session keys. Fails with `NotAuthenticated` unless
    /// logged in; never waits on a transition.
    pub fn with_session<T>(&self, op: impl FnOnce(&mut SessionKeys) -> Result<T>) -> Result<T> {
        match &mut *self.lock_state() {
            State::LoggedIn(keys) => op(keys),
            _ => Err(Error::NotAuthenticated),
        }
    }

    pub fn require_logged_in(&self) -> Result<()> {
        self.with_session(|_| Ok(()))
    }

    /// Verify credentials with the registry and unlock the master key.
    ///
    /// Allowed from `LoggedOut` and `Locked`. On failure the session returns
    /// to where it was.
    pub async fn login(&self, email: &str, password: Zeroizing<String>) -> Result<()> {
        let _transition = self.transition.lock().await;

        let previous = {
            let mut state = self.lock_state();
            if matches!(*state, State::LoggedIn(_)) {
                return Err(Error::AlreadyAuthenticated);
            }
            std::mem::replace(&mut *state, State::Authenticating)
        };
        let mut attempt = Attempt {
            session: self,
            previous: Some(previous),
        };

        match self.authenticate(email, password).await {
            Ok(keys) => {
                attempt.previous = None;
                *self.lock_state() = State::LoggedIn(keys);
                self.touch();
                info!("Session logged in as {}", email);
                Ok(())
            }
            Err(e) => {
                warn!("Login for {} failed: {}", email, e);
                Err(e)
            }
        }
    }

    async fn authenticate(&self, email: &str, password: Zeroizing<String>) -> Result<SessionKeys> {
        let params = self.registry.prelogin(email).await?;

        let password_key =
            tokio::task::spawn_blocking(move || PasswordKey::derive(password.as_bytes(), &params))
                .await
                .map_err(|e| Error::Internal(format!("password derivation task failed: {}", e)))??;

        let token = Zeroizing::new(password_key.auth_token()?);
        let account = self.registry.login(email, &token).await?;
        let master = password_key.unwrap_master(&account.master_key)?;

        Ok(SessionKeys::new(account.id, account.email, master))
    }

    /// Zero the session and return to `LoggedOut`. Idempotent.
    pub async fn logout(&self) {
        let _transition = self.transition.lock().await;
        let was = self.replace(State::LoggedOut);
        if was != SessionState::LoggedOut {
            info!("Session logged out");
        }
    }

    /// Move `LoggedIn` to `Locked`. Other states are left alone.
    pub async fn lock(&self) -> SessionState {
        let _transition = self.transition.lock().await;
        self.lock_now("explicit lock")
    }

    /// Lock if nothing was served for `timeout`. Skips the check while a
    /// transition is in progress.
    pub fn lock_if_idle(&self, timeout: Duration) -> bool {
        let Ok(_transition) = self.transition.try_lock() else {
            return false;
        };
        if self.idle_for() < timeout || self.state() != SessionState::LoggedIn {
            return false;
        }
        self.lock_now("idle timeout") == SessionState::Locked
    }

    /// Record that a request was served
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    /// Caller holds the transition lock
    fn lock_now(&self, reason: &str) -> SessionState {
        let mut state = self.lock_state();
        if let State::LoggedIn(keys) = &*state {
            let email = keys.email().to_string();
            // Assigning drops the keys while the state lock is held
            *state = State::Locked { email };
            info!("Session locked ({})", reason);
        }
        state.kind()
    }

    /// Caller holds the transition lock. Returns the state replaced.
    fn replace(&self, next: State) -> SessionState {
        let mut state = self.lock_state();
        let previous = std::mem::replace(&mut *state, next);
        let kind = previous.kind();
        drop(previous);
        kind
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Puts the pre-login state back if a login attempt fails or is dropped
struct Attempt<'a> {
    session: &'a Session,
    previous: Option<State>,
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.session.lock_state() = previous;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use envelope::enroll;
    use sealkeep_core::model::KdfParams;
    use sealkeep_core::registry::AccountRecord;
    use sealkeep_core::LocalRegistry;

    pub(crate) const EMAIL: &str = "ops@example.com";
    pub(crate) const PASSWORD: &str = "correct horse battery";

    pub(crate) fn test_kdf() -> KdfParams {
        KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    /// Registry with one enrolled account
    pub(crate) fn registry_with_account() -> Arc<LocalRegistry> {
        let registry = LocalRegistry::new();
        let enrollment = enroll(PASSWORD.as_bytes(), test_kdf()).unwrap();
        registry
            .create_account(AccountRecord {
                id: AccountId::new(),
                email: EMAIL.to_string(),
                params: enrollment.params,
                auth_hash: enrollment.auth_hash,
                master_key: enrollment.master_key,
            })
            .unwrap();
        Arc::new(registry)
    }

    pub(crate) fn password(p: &str) -> Zeroizing<String> {
        Zeroizing::new(p.to_string())
    }

    pub(crate) async fn logged_in() -> (Arc<LocalRegistry>, Session) {
        let registry = registry_with_account();
        let session = Session::new(registry.clone());
        session.login(EMAIL, password(PASSWORD)).await.unwrap();
        (registry, session)
    }

    #[tokio::test]
    async fn test_login_logout() {
        let (_registry, session) = logged_in().await;
        assert_eq!(session.state(), SessionState::LoggedIn);
        assert_eq!(session.email().as_deref(), Some(EMAIL));
        assert!(session.with_session(|keys| Ok(keys.email() == EMAIL)).unwrap());

        session.logout().await;
        assert_eq!(session.state(), SessionState::LoggedOut);
        assert!(matches!(
            session.with_session(|_| Ok(())),
            Err(Error::NotAuthenticated)
        ));

        // Idempotent
        session.logout().await;
        assert_eq!(session.state(), SessionState::LoggedOut);
    }

    #[tokio::test]
    async fn test_second_login_rejected() {
        let (_registry, session) = logged_in().await;
        assert!(matches!(
            session.login(EMAIL, password(PASSWORD)).await,
            Err(Error::AlreadyAuthenticated)
        ));
        assert_eq!(session.state(), SessionState::LoggedIn);
    }

    #[tokio::test]
    async fn test_wrong_password_returns_to_logged_out() {
        let registry = registry_with_account();
        let session = Session::new(registry);

        assert!(matches!(
            session.login(EMAIL, password("wrong")).await,
            Err(Error::InvalidCredentials)
        ));
        assert_eq!(session.state(), SessionState::LoggedOut);

        assert!(matches!(
            session.login("nobody@example.com", password(PASSWORD)).await,
            Err(Error::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_lock_and_reauthenticate() {
        let (_registry, session) = logged_in().await;

        assert_eq!(session.lock().await, SessionState::Locked);
        assert_eq!(session.email().as_deref(), Some(EMAIL));
        assert!(matches!(
            session.with_session(|_| Ok(())),
            Err(Error::NotAuthenticated)
        ));

        // Failed re-authentication stays locked
        assert!(session.login(EMAIL, password("wrong")).await.is_err());
        assert_eq!(session.state(), SessionState::Locked);

        session.login(EMAIL, password(PASSWORD)).await.unwrap();
        assert_eq!(session.state(), SessionState::LoggedIn);
    }

    #[tokio::test]
    async fn test_lock_when_logged_out_is_noop() {
        let session = Session::new(registry_with_account());
        assert_eq!(session.lock().await, SessionState::LoggedOut);
    }

    #[tokio::test]
    async fn test_idle_lock() {
        let (_registry, session) = logged_in().await;

        assert!(!session.lock_if_idle(Duration::from_secs(60)));
        assert_eq!(session.state(), SessionState::LoggedIn);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(session.lock_if_idle(Duration::from_millis(10)));
        assert_eq!(session.state(), SessionState::Locked);

        // Already locked
        assert!(!session.lock_if_idle(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_touch_defers_idle_lock() {
        let (_registry, session) = logged_in().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        session.touch();
        assert!(!session.lock_if_idle(Duration::from_millis(25)));
    }

    #[tokio::test]
    async fn test_keys_cached_and_evicted() {
        let (_registry, session) = logged_in().await;
        let org_id = sealkeep_core::model::OrgId::new();

        let (keypair, wrapped) = session
            .with_session(|keys| {
                let new = keys.mint(KeyType::Encryption)?;
                let keypair = Keypair {
                    id: KeypairId::new(),
                    org_id,
                    key_type: KeyType::Encryption,
                    public_key: new.public_key,
                    created_at: chrono::Utc::now(),
                    revoked_at: None,
                };
                Ok((keypair, new.private_key))
            })
            .unwrap();

        session
            .with_session(|keys| keys.encryption_key(&keypair, Some(&wrapped)).map(|_| ()))
            .unwrap();
        assert!(session.with_session(|keys| Ok(keys.is_unlocked(keypair.id))).unwrap());

        // Cached: no wrapped key needed the second time
        session
            .with_session(|keys| keys.encryption_key(&keypair, None).map(|_| ()))
            .unwrap();

        assert!(session.with_session(|keys| Ok(keys.evict(keypair.id))).unwrap());
        assert!(session
            .with_session(|keys| keys.encryption_key(&keypair, None).map(|_| ()))
            .is_err());
    }
}
