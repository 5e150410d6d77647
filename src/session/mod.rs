//! Session manager (multi-account registry and token lifecycle)
//!
//! Owns the in-memory account registry, the current-account pointer, the
//! token freshness algorithm, and the background refresh task. All other
//! components read projections or request mutations through this type;
//! nothing else writes to the session store.
//!
//! Registry mutations happen under a synchronous lock that is never held
//! across an await point. Refreshes for the same DID are serialized through
//! a per-DID async lock so concurrent callers coalesce into one network
//! round trip; refreshes for different DIDs may overlap.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::api::{Agent, AgentFactory, AtpGateway};
use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent};
use crate::models::AccountCredential;
use crate::store::{SessionStore, StoreSnapshot};

/// Access tokens older than this are refreshed before use
const ACCESS_STALE_AFTER_MINUTES: i64 = 90;

/// Refresh tokens idle longer than this are unrecoverable and purged.
///
/// The clock resets on every successful refresh, so this is a rolling idle
/// timeout, not an absolute token lifetime.
const REFRESH_VALID_FOR_DAYS: i64 = 50;

/// In-memory account registry; insertion order is login order
#[derive(Default)]
struct Registry {
    accounts: Vec<AccountCredential>,
    current_did: Option<String>,
}

impl Registry {
    fn find(&self, did: &str) -> Option<&AccountCredential> {
        self.accounts.iter().find(|a| a.did == did)
    }

    /// Insert or replace by DID; an existing entry keeps its position so
    /// account-switcher ordering stays stable across re-logins.
    fn upsert(&mut self, credential: AccountCredential) {
        match self.accounts.iter_mut().find(|a| a.did == credential.did) {
            Some(slot) => *slot = credential,
            None => self.accounts.push(credential),
        }
    }

    fn remove(&mut self, did: &str) -> Option<AccountCredential> {
        let pos = self.accounts.iter().position(|a| a.did == did)?;
        if self.current_did.as_deref() == Some(did) {
            self.current_did = None;
        }
        Some(self.accounts.remove(pos))
    }

    /// Most-recently-used account, falling back to insertion order
    fn most_recently_used(&self) -> Option<&AccountCredential> {
        self.accounts
            .iter()
            .enumerate()
            .max_by_key(|(idx, a)| (a.last_used_at, *idx))
            .map(|(_, a)| a)
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            accounts: self.accounts.clone(),
            last_active_did: self.current_did.clone(),
        }
    }
}

/// Per-DID refresh serialization point.
///
/// `attempts` counts completed refresh attempts, successful or not, so a
/// caller that queued behind an in-flight refresh can tell one finished
/// while it waited, whatever its outcome.
#[derive(Default)]
struct RefreshGate {
    lock: tokio::sync::Mutex<()>,
    attempts: AtomicU64,
}

/// Multi-account session manager
pub struct SessionManager<G> {
    factory: AgentFactory<G>,
    store: SessionStore,
    bus: Arc<EventBus>,
    registry: Mutex<Registry>,
    /// Per-DID refresh gates; entries live as long as the manager
    refresh_gates: Mutex<HashMap<String, Arc<RefreshGate>>>,
    background: Mutex<Option<JoinHandle<()>>>,
    refresh_interval_secs: u64,
}

impl<G: AtpGateway + Send + Sync + 'static> SessionManager<G> {
    /// Create a manager with an empty registry.
    ///
    /// Call [`Self::initialize`] once at process start to hydrate it.
    pub fn new(
        factory: AgentFactory<G>,
        store: SessionStore,
        bus: Arc<EventBus>,
        refresh_interval_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            store,
            bus,
            registry: Mutex::new(Registry::default()),
            refresh_gates: Mutex::new(HashMap::new()),
            background: Mutex::new(None),
            refresh_interval_secs,
        })
    }

    /// Hydrate the registry from the session store and resume the
    /// last-active account. Explicit bootstrap entry point; call exactly
    /// once before any other operation.
    ///
    /// Storage failures mean "assume logged out for this launch", never a
    /// crash; potentially-valid remote sessions are left untouched.
    pub async fn initialize(self: &Arc<Self>) {
        let snapshot = match self.store.read_all() {
            Ok(snapshot) => snapshot,
            Err(SessionError::CorruptStore) => {
                tracing::warn!("Session store is corrupt, starting logged out");
                StoreSnapshot::default()
            }
            Err(e) => {
                tracing::warn!("Session store unavailable, starting logged out: {e}");
                StoreSnapshot::default()
            }
        };

        let last_active = {
            let mut registry = self.registry.lock().expect("registry poisoned");
            for credential in snapshot.accounts {
                registry.upsert(credential);
            }
            snapshot
                .last_active_did
                .and_then(|did| registry.find(&did).cloned())
        };

        if let Some(credential) = last_active {
            self.resume_session(credential).await;
        }

        self.start_background_refresh();
    }

    /// Resume a hydrated account without re-authenticating.
    ///
    /// Makes it current when it matches the persisted last-active pointer;
    /// resuming other accounts is silent (no `account-changed`). Returns the
    /// validated credential, or `None` when it had to be dropped.
    pub async fn resume_session(
        self: &Arc<Self>,
        credential: AccountCredential,
    ) -> Option<AccountCredential> {
        let did = credential.did.clone();
        let is_last_active = self
            .store
            .read_last_active()
            .ok()
            .flatten()
            .is_some_and(|last| last == did);

        {
            let mut registry = self.registry.lock().expect("registry poisoned");
            if registry.find(&did).is_none() {
                registry.upsert(credential);
            }
            if is_last_active {
                registry.current_did = Some(did.clone());
            }
        }

        self.get_valid_token(&did, false).await
    }

    /// Log in and make the account current.
    ///
    /// Re-login to a known DID replaces the entry in place, preserving its
    /// position. On any factory error the registry is left unmodified and
    /// the error propagates unchanged.
    pub async fn login(
        self: &Arc<Self>,
        identifier: &str,
        password: &str,
        source: &str,
    ) -> Result<AccountCredential, SessionError> {
        let credential = self.factory.login(identifier, password).await?;
        tracing::info!("Logged in as {} ({source})", credential.handle);

        {
            let mut registry = self.registry.lock().expect("registry poisoned");
            registry.upsert(credential.clone());
            registry.current_did = Some(credential.did.clone());
        }
        self.persist();

        self.bus.publish(&SessionEvent::AccountChanged {
            did: credential.did.clone(),
        });
        self.start_background_refresh();

        Ok(credential)
    }

    /// The central freshness algorithm.
    ///
    /// Returns a credential whose access token is usable, refreshing it
    /// first when it is stale (older than 90 minutes) or `force_refresh` is
    /// set. A refresh token idle for more than 50 days, or rejected by the
    /// remote, purges the account and emits `session-dropped`. Transient
    /// connection failures return the existing (possibly stale) credential
    /// rather than destroying a valid session.
    ///
    /// Concurrent calls for the same DID coalesce into a single in-flight
    /// refresh; every caller gets that refresh's result.
    pub async fn get_valid_token(&self, did: &str, force_refresh: bool) -> Option<AccountCredential> {
        let credential = self.lookup(did)?;
        let now = Utc::now();

        if credential.refresh_age(now) > Duration::days(REFRESH_VALID_FOR_DAYS) {
            tracing::info!("Refresh token for {did} expired, dropping session");
            self.purge(did);
            return None;
        }

        let stale = credential.access_age(now) > Duration::minutes(ACCESS_STALE_AFTER_MINUTES);
        if !force_refresh && !stale {
            return Some(credential);
        }

        // Serialize refreshes per DID. Whoever holds the lock performs the
        // network call and bumps the attempt counter whatever the outcome;
        // waiters that observe a bump reuse the state that attempt left
        // behind (rotated tokens, a purge, or a kept stale credential)
        // instead of hitting the network again.
        let gate = self.refresh_gate(did);
        let observed_attempt = gate.attempts.load(Ordering::Acquire);
        let _guard = gate.lock.lock().await;

        let credential = self.lookup(did)?;
        if gate.attempts.load(Ordering::Acquire) != observed_attempt {
            return Some(credential);
        }

        let outcome = self.factory.refresh(&credential).await;
        gate.attempts.fetch_add(1, Ordering::Release);

        match outcome {
            Ok(updated) => {
                {
                    let mut registry = self.registry.lock().expect("registry poisoned");
                    registry.upsert(updated.clone());
                }
                self.persist();
                Some(updated)
            }
            Err(SessionError::RefreshRejected) => {
                tracing::info!("Refresh rejected for {did}, dropping session");
                self.purge(did);
                None
            }
            Err(e) => {
                tracing::warn!("Token refresh for {did} failed, keeping stale token: {e}");
                Some(credential)
            }
        }
    }

    /// [`Self::get_valid_token`] with a latency budget.
    ///
    /// When the budget elapses the in-flight refresh is abandoned (it keeps
    /// running and will land in the registry) and the current stored,
    /// possibly stale, credential is returned so the caller never hangs.
    pub async fn get_valid_token_within(
        self: &Arc<Self>,
        did: &str,
        budget: std::time::Duration,
    ) -> Option<AccountCredential> {
        let this = Arc::clone(self);
        let owned_did = did.to_string();
        let task = tokio::spawn(async move { this.get_valid_token(&owned_did, false).await });

        match tokio::time::timeout(budget, task).await {
            Ok(Ok(result)) => result,
            _ => self.lookup(did),
        }
    }

    /// Make a known account current
    pub fn switch_account(&self, did: &str) -> Result<AccountCredential, SessionError> {
        let credential = {
            let mut registry = self.registry.lock().expect("registry poisoned");
            let Some(slot) = registry.accounts.iter_mut().find(|a| a.did == did) else {
                return Err(SessionError::UnknownAccount {
                    did: did.to_string(),
                });
            };
            slot.last_used_at = Some(Utc::now());
            let credential = slot.clone();
            registry.current_did = Some(did.to_string());
            credential
        };
        self.persist();

        self.bus.publish(&SessionEvent::AccountChanged {
            did: did.to_string(),
        });
        Ok(credential)
    }

    /// Log out the current account.
    ///
    /// No-op when nothing is current. Remote invalidation is best-effort;
    /// locally the account is always removed. When other accounts remain the
    /// most-recently-used one becomes current, otherwise `session-dropped`
    /// is emitted.
    pub async fn logout_current_account(&self, source: &str) -> Result<(), SessionError> {
        let Some(credential) = self.current_account() else {
            return Ok(());
        };
        tracing::info!("Logging out {} ({source})", credential.handle);

        self.factory.delete_remote_session(&credential).await;

        let next = {
            let mut registry = self.registry.lock().expect("registry poisoned");
            registry.remove(&credential.did);
            let next = registry.most_recently_used().cloned();
            registry.current_did = next.as_ref().map(|a| a.did.clone());
            next
        };
        self.persist();

        match next {
            Some(next) => self.bus.publish(&SessionEvent::AccountChanged { did: next.did }),
            None => {
                self.stop_background_refresh();
                self.bus.publish(&SessionEvent::SessionDropped {
                    did: Some(credential.did),
                });
            }
        }
        Ok(())
    }

    /// Log out of every known account and clear all persisted state
    pub async fn logout_every_account(&self, source: &str) -> Result<(), SessionError> {
        tracing::info!("Logging out of every account ({source})");
        self.stop_background_refresh();

        let (accounts, current_did) = {
            let registry = self.registry.lock().expect("registry poisoned");
            (registry.accounts.clone(), registry.current_did.clone())
        };

        for credential in &accounts {
            self.factory.delete_remote_session(credential).await;
        }

        {
            let mut registry = self.registry.lock().expect("registry poisoned");
            registry.accounts.clear();
            registry.current_did = None;
        }
        // A clear failure must not leave logout half-done: local state is
        // already dropped, so log it and still notify subscribers.
        if let Err(e) = self.store.clear() {
            tracing::warn!("Failed to clear session store: {e}");
        }

        if !accounts.is_empty() {
            self.bus
                .publish(&SessionEvent::SessionDropped { did: current_did });
        }
        Ok(())
    }

    /// The current account's credential, if any
    pub fn current_account(&self) -> Option<AccountCredential> {
        let registry = self.registry.lock().expect("registry poisoned");
        registry
            .current_did
            .as_deref()
            .and_then(|did| registry.find(did).cloned())
    }

    /// All known accounts, in login order
    pub fn accounts(&self) -> Vec<AccountCredential> {
        self.registry
            .lock()
            .expect("registry poisoned")
            .accounts
            .clone()
    }

    /// Bind an agent for the current account, refreshing its token first
    pub async fn current_agent(&self) -> Result<Agent, SessionError> {
        let Some(credential) = self.current_account() else {
            return Err(SessionError::UnknownAccount {
                did: "(none)".to_string(),
            });
        };
        let credential = self
            .get_valid_token(&credential.did, false)
            .await
            .ok_or(SessionError::RefreshRejected)?;
        Ok(Agent::bind(self.factory.service(), &credential))
    }

    fn lookup(&self, did: &str) -> Option<AccountCredential> {
        self.registry
            .lock()
            .expect("registry poisoned")
            .find(did)
            .cloned()
    }

    fn refresh_gate(&self, did: &str) -> Arc<RefreshGate> {
        let mut gates = self.refresh_gates.lock().expect("refresh gates poisoned");
        Arc::clone(gates.entry(did.to_string()).or_default())
    }

    /// Remove an unrecoverable credential from registry and store
    fn purge(&self, did: &str) {
        {
            let mut registry = self.registry.lock().expect("registry poisoned");
            registry.remove(did);
        }
        self.persist();
        self.bus.publish(&SessionEvent::SessionDropped {
            did: Some(did.to_string()),
        });
    }

    /// Write the registry through to the store.
    ///
    /// A persist failure keeps the in-memory session usable for this launch;
    /// the remote-side session is still valid either way.
    fn persist(&self) {
        let snapshot = self
            .registry
            .lock()
            .expect("registry poisoned")
            .snapshot();
        if let Err(e) = self.store.write_all(&snapshot) {
            tracing::warn!("Failed to persist sessions: {e}");
        }
    }

    /// Start the periodic token-refresh task for non-current accounts.
    /// Idempotent; holds only a weak reference so it dies with the manager.
    fn start_background_refresh(self: &Arc<Self>) {
        if self.refresh_interval_secs == 0 {
            return;
        }
        let mut guard = self.background.lock().expect("background poisoned");
        if guard.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let interval_secs = self.refresh_interval_secs;
        *guard = Some(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            // First tick fires immediately; the launch path already
            // validated the current account.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                for credential in manager.accounts() {
                    if manager.get_valid_token(&credential.did, false).await.is_none() {
                        tracing::warn!("Background refresh dropped {}", credential.did);
                    }
                }
            }
        }));
    }

    fn stop_background_refresh(&self) {
        if let Some(handle) = self
            .background
            .lock()
            .expect("background poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

impl<G> Drop for SessionManager<G> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .background
            .lock()
            .expect("background poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CreatedSession, RefreshedSession};
    use crate::events::EventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy, Debug)]
    enum RefreshMode {
        Ok,
        Reject,
        ConnectionFail,
    }

    #[derive(Clone)]
    struct MockGateway {
        seen_identifiers: Arc<Mutex<Vec<String>>>,
        login_result: Arc<Mutex<Result<(), SessionError>>>,
        refresh_calls: Arc<AtomicUsize>,
        refresh_mode: Arc<Mutex<RefreshMode>>,
        refresh_delay_ms: u64,
        delete_calls: Arc<AtomicUsize>,
    }

    impl Default for MockGateway {
        fn default() -> Self {
            Self {
                seen_identifiers: Arc::default(),
                login_result: Arc::new(Mutex::new(Ok(()))),
                refresh_calls: Arc::default(),
                refresh_mode: Arc::new(Mutex::new(RefreshMode::Ok)),
                refresh_delay_ms: 0,
                delete_calls: Arc::default(),
            }
        }
    }

    impl MockGateway {
        fn set_refresh_mode(&self, mode: RefreshMode) {
            *self.refresh_mode.lock().unwrap() = mode;
        }

        fn fail_next_login(&self, error: SessionError) {
            *self.login_result.lock().unwrap() = Err(error);
        }
    }

    impl AtpGateway for MockGateway {
        async fn create_session(
            &self,
            _service: &str,
            identifier: &str,
            _password: &str,
        ) -> Result<CreatedSession, SessionError> {
            self.seen_identifiers
                .lock()
                .unwrap()
                .push(identifier.to_string());

            let mut result = self.login_result.lock().unwrap();
            if let Err(e) = std::mem::replace(&mut *result, Ok(())) {
                return Err(e);
            }

            let name = identifier.split('.').next().unwrap_or(identifier);
            Ok(CreatedSession {
                did: format!("did:plc:{name}"),
                handle: identifier.to_string(),
                access_jwt: format!("access-{name}"),
                refresh_jwt: format!("refresh-{name}"),
                active: true,
            })
        }

        async fn refresh_session(
            &self,
            _service: &str,
            _refresh_jwt: &str,
        ) -> Result<RefreshedSession, SessionError> {
            if self.refresh_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.refresh_delay_ms)).await;
            }
            let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
            match *self.refresh_mode.lock().unwrap() {
                RefreshMode::Ok => Ok(RefreshedSession {
                    access_jwt: format!("access-rotated-{n}"),
                    refresh_jwt: format!("refresh-rotated-{n}"),
                }),
                RefreshMode::Reject => Err(SessionError::RefreshRejected),
                RefreshMode::ConnectionFail => Err(SessionError::ConnectionFailed(None)),
            }
        }

        async fn delete_session(
            &self,
            _service: &str,
            _refresh_jwt: &str,
        ) -> Result<(), SessionError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        gateway: MockGateway,
        store: SessionStore,
        bus: Arc<EventBus>,
        manager: Arc<SessionManager<MockGateway>>,
    }

    fn fixture(gateway: MockGateway) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open_path(dir.path().join("sessions.enc"));
        let bus = EventBus::new();
        let factory = AgentFactory::new(gateway.clone(), "https://pds.test", "bsky.social");
        let manager = SessionManager::new(factory, store.clone(), Arc::clone(&bus), 0);
        Fixture {
            _dir: dir,
            gateway,
            store,
            bus,
            manager,
        }
    }

    fn stored_credential(
        did: &str,
        access_age_minutes: i64,
        refresh_age_days: i64,
    ) -> AccountCredential {
        let now = Utc::now();
        AccountCredential {
            did: did.to_string(),
            handle: format!("{did}.test"),
            access_jwt: "stored-access".to_string(),
            refresh_jwt: "stored-refresh".to_string(),
            access_issued_at: now - Duration::minutes(access_age_minutes),
            refresh_issued_at: now - Duration::days(refresh_age_days),
            active: true,
            last_used_at: None,
        }
    }

    async fn fixture_with_stored(creds: Vec<AccountCredential>, last_active: Option<&str>) -> Fixture {
        let f = fixture(MockGateway::default());
        f.store
            .write_all(&StoreSnapshot {
                accounts: creds,
                last_active_did: last_active.map(str::to_string),
            })
            .unwrap();
        f.manager.initialize().await;
        f
    }

    #[tokio::test]
    async fn test_login_normalizes_bare_identifier() {
        let f = fixture(MockGateway::default());
        f.manager.login("alice", "hunter2", "Test").await.unwrap();
        assert_eq!(
            *f.gateway.seen_identifiers.lock().unwrap(),
            vec!["alice.bsky.social".to_string()]
        );
    }

    #[tokio::test]
    async fn test_login_sets_current_and_persists() {
        let f = fixture(MockGateway::default());
        let cred = f.manager.login("alice", "hunter2", "Test").await.unwrap();

        assert_eq!(f.manager.current_account().unwrap().did, cred.did);
        let snapshot = f.store.read_all().unwrap();
        assert_eq!(snapshot.accounts.len(), 1);
        assert_eq!(snapshot.last_active_did, Some(cred.did));
    }

    #[tokio::test]
    async fn test_rate_limited_login_propagates_and_leaves_registry_untouched() {
        let f = fixture(MockGateway::default());
        f.gateway.fail_next_login(SessionError::RateLimited { retry_after: None });

        let err = f.manager.login("alice", "hunter2", "Test").await.unwrap_err();
        assert!(matches!(err, SessionError::RateLimited { .. }));
        assert!(f.manager.accounts().is_empty());
        // One attempt only, no automatic retry.
        assert_eq!(f.gateway.seen_identifiers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_relogin_replaces_in_place() {
        let f = fixture(MockGateway::default());
        f.manager.login("alice", "pw", "Test").await.unwrap();
        f.manager.login("bob", "pw", "Test").await.unwrap();
        f.manager.login("alice", "pw2", "Test").await.unwrap();

        let accounts = f.manager.accounts();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].did, "did:plc:alice");
        assert_eq!(accounts[1].did, "did:plc:bob");
        assert_eq!(f.manager.current_account().unwrap().did, "did:plc:alice");
    }

    #[tokio::test]
    async fn test_fresh_access_token_triggers_no_refresh() {
        let f =
            fixture_with_stored(vec![stored_credential("did:plc:a", 10, 1)], Some("did:plc:a"))
                .await;

        let cred = f.manager.get_valid_token("did:plc:a", false).await.unwrap();
        assert_eq!(cred.access_jwt, "stored-access");
        assert_eq!(f.gateway.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_access_token_triggers_one_refresh() {
        let f = fixture_with_stored(vec![stored_credential("did:plc:a", 91, 1)], None).await;

        let cred = f.manager.get_valid_token("did:plc:a", false).await.unwrap();
        assert_eq!(cred.access_jwt, "access-rotated-1");
        assert_eq!(f.gateway.refresh_calls.load(Ordering::SeqCst), 1);

        // Rotated tokens were persisted.
        let snapshot = f.store.read_all().unwrap();
        assert_eq!(snapshot.accounts[0].refresh_jwt, "refresh-rotated-1");
    }

    #[tokio::test]
    async fn test_force_refresh_on_fresh_token() {
        let f = fixture_with_stored(vec![stored_credential("did:plc:a", 1, 0)], None).await;

        let cred = f.manager.get_valid_token("did:plc:a", true).await.unwrap();
        assert_eq!(cred.access_jwt, "access-rotated-1");
        assert_eq!(f.gateway.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fifty_day_idle_refresh_token_is_purged() {
        let f = fixture_with_stored(vec![stored_credential("did:plc:a", 10, 51)], None).await;

        let dropped = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let dropped = Arc::clone(&dropped);
            f.bus.subscribe(EventKind::SessionDropped, move |event| {
                if let SessionEvent::SessionDropped { did } = event {
                    dropped.lock().unwrap().push(did.clone());
                }
            })
        };

        assert!(f.manager.get_valid_token("did:plc:a", false).await.is_none());
        assert!(f.manager.accounts().is_empty());
        assert!(f.store.read_all().unwrap().accounts.is_empty());
        assert_eq!(
            *dropped.lock().unwrap(),
            vec![Some("did:plc:a".to_string())]
        );
        // Never even tried the network.
        assert_eq!(f.gateway.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejected_refresh_purges_and_emits_drop() {
        let f = fixture_with_stored(vec![stored_credential("did:plc:a", 91, 1)], None).await;
        f.gateway.set_refresh_mode(RefreshMode::Reject);

        let dropped = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let dropped = Arc::clone(&dropped);
            f.bus.subscribe(EventKind::SessionDropped, move |_| {
                dropped.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(f.manager.get_valid_token("did:plc:a", false).await.is_none());
        assert!(f.manager.accounts().is_empty());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_failure_keeps_stale_credential() {
        let f = fixture_with_stored(vec![stored_credential("did:plc:a", 91, 1)], None).await;
        f.gateway.set_refresh_mode(RefreshMode::ConnectionFail);

        let cred = f.manager.get_valid_token("did:plc:a", false).await.unwrap();
        assert_eq!(cred.access_jwt, "stored-access");
        assert_eq!(f.manager.accounts().len(), 1);
        assert_eq!(f.gateway.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_coalesce_into_one_refresh() {
        let mut gateway = MockGateway::default();
        gateway.refresh_delay_ms = 50;
        let f = fixture(gateway);
        f.store
            .write_all(&StoreSnapshot {
                accounts: vec![stored_credential("did:plc:a", 91, 1)],
                last_active_did: None,
            })
            .unwrap();
        f.manager.initialize().await;

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let manager = Arc::clone(&f.manager);
            tasks.push(tokio::spawn(async move {
                manager.get_valid_token("did:plc:a", false).await
            }));
        }

        let mut tokens = Vec::new();
        for task in tasks {
            tokens.push(task.await.unwrap().unwrap().access_jwt);
        }

        assert_eq!(f.gateway.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == "access-rotated-1"));
    }

    #[tokio::test]
    async fn test_concurrent_callers_coalesce_when_refresh_fails() {
        let mut gateway = MockGateway::default();
        gateway.refresh_delay_ms = 50;
        let f = fixture(gateway);
        f.gateway.set_refresh_mode(RefreshMode::ConnectionFail);
        f.store
            .write_all(&StoreSnapshot {
                accounts: vec![stored_credential("did:plc:a", 91, 1)],
                last_active_did: None,
            })
            .unwrap();
        f.manager.initialize().await;

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let manager = Arc::clone(&f.manager);
            tasks.push(tokio::spawn(async move {
                manager.get_valid_token("did:plc:a", false).await
            }));
        }

        for task in tasks {
            let cred = task.await.unwrap().unwrap();
            assert_eq!(cred.access_jwt, "stored-access");
        }

        // One attempt against the unreachable server, not five; the
        // credential survives.
        assert_eq!(f.gateway.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.manager.accounts().len(), 1);
    }

    #[tokio::test]
    async fn test_bounded_wait_returns_stale_within_budget() {
        let mut gateway = MockGateway::default();
        gateway.refresh_delay_ms = 1_000;
        let f = fixture(gateway);
        f.store
            .write_all(&StoreSnapshot {
                accounts: vec![stored_credential("did:plc:a", 91, 1)],
                last_active_did: None,
            })
            .unwrap();
        f.manager.initialize().await;

        let cred = f
            .manager
            .get_valid_token_within("did:plc:a", std::time::Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(cred.access_jwt, "stored-access");
    }

    #[tokio::test]
    async fn test_initialize_resumes_last_active_account() {
        let f = fixture_with_stored(
            vec![
                stored_credential("did:plc:a", 10, 1),
                stored_credential("did:plc:b", 10, 1),
            ],
            Some("did:plc:b"),
        )
        .await;

        assert_eq!(f.manager.current_account().unwrap().did, "did:plc:b");
        assert_eq!(f.manager.accounts().len(), 2);
    }

    #[tokio::test]
    async fn test_switch_account() {
        let f = fixture(MockGateway::default());
        f.manager.login("alice", "pw", "Test").await.unwrap();
        f.manager.login("bob", "pw", "Test").await.unwrap();

        let changed = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let changed = Arc::clone(&changed);
            f.bus.subscribe(EventKind::AccountChanged, move |event| {
                if let SessionEvent::AccountChanged { did } = event {
                    changed.lock().unwrap().push(did.clone());
                }
            })
        };

        f.manager.switch_account("did:plc:alice").unwrap();
        assert_eq!(f.manager.current_account().unwrap().did, "did:plc:alice");
        assert_eq!(
            f.store.read_last_active().unwrap().as_deref(),
            Some("did:plc:alice")
        );
        assert_eq!(*changed.lock().unwrap(), vec!["did:plc:alice".to_string()]);
    }

    #[tokio::test]
    async fn test_switch_to_unknown_account_fails() {
        let f = fixture(MockGateway::default());
        assert!(matches!(
            f.manager.switch_account("did:plc:nobody"),
            Err(SessionError::UnknownAccount { .. })
        ));
    }

    #[tokio::test]
    async fn test_logout_with_no_current_account_is_noop() {
        let f = fixture(MockGateway::default());

        let events = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let events = Arc::clone(&events);
            f.bus.subscribe(EventKind::SessionDropped, move |_| {
                events.fetch_add(1, Ordering::SeqCst);
            })
        };

        f.manager.logout_current_account("Test").await.unwrap();
        assert!(f.manager.accounts().is_empty());
        assert_eq!(events.load(Ordering::SeqCst), 0);
        assert_eq!(f.gateway.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_logout_switches_to_most_recently_used() {
        let f = fixture(MockGateway::default());
        f.manager.login("alice", "pw", "Test").await.unwrap();
        f.manager.login("bob", "pw", "Test").await.unwrap();
        f.manager.login("carol", "pw", "Test").await.unwrap();
        // bob becomes most recently used, then switch back to carol's slot
        // by logging out the current account (carol).
        f.manager.switch_account("did:plc:bob").unwrap();
        f.manager.switch_account("did:plc:carol").unwrap();

        f.manager.logout_current_account("Test").await.unwrap();

        assert_eq!(f.manager.current_account().unwrap().did, "did:plc:bob");
        assert_eq!(f.manager.accounts().len(), 2);
        assert_eq!(f.gateway.delete_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_logout_last_account_emits_session_dropped() {
        let f = fixture(MockGateway::default());
        f.manager.login("alice", "pw", "Test").await.unwrap();

        let dropped = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let dropped = Arc::clone(&dropped);
            f.bus.subscribe(EventKind::SessionDropped, move |_| {
                dropped.fetch_add(1, Ordering::SeqCst);
            })
        };

        f.manager.logout_current_account("Test").await.unwrap();
        assert!(f.manager.current_account().is_none());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_logout_every_account_clears_everything() {
        let f = fixture(MockGateway::default());
        f.manager.login("alice", "pw", "Test").await.unwrap();
        f.manager.login("bob", "pw", "Test").await.unwrap();

        f.manager.logout_every_account("Settings").await.unwrap();

        assert!(f.manager.accounts().is_empty());
        assert!(f.manager.current_account().is_none());
        assert!(f.store.read_all().unwrap().accounts.is_empty());
        assert_eq!(f.gateway.delete_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_logout_every_account_survives_store_failure() {
        // A directory at the store path makes every write and clear fail.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.enc");
        std::fs::create_dir(&path).unwrap();

        let gateway = MockGateway::default();
        let store = SessionStore::open_path(path);
        let bus = EventBus::new();
        let factory = AgentFactory::new(gateway, "https://pds.test", "bsky.social");
        let manager = SessionManager::new(factory, store, Arc::clone(&bus), 0);
        manager.login("alice", "pw", "Test").await.unwrap();

        let dropped = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let dropped = Arc::clone(&dropped);
            bus.subscribe(EventKind::SessionDropped, move |_| {
                dropped.fetch_add(1, Ordering::SeqCst);
            })
        };

        manager.logout_every_account("Test").await.unwrap();
        assert!(manager.accounts().is_empty());
        assert!(manager.current_account().is_none());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resume_does_not_emit_account_changed() {
        let f = fixture(MockGateway::default());
        f.store
            .write_all(&StoreSnapshot {
                accounts: vec![stored_credential("did:plc:a", 10, 1)],
                last_active_did: Some("did:plc:a".to_string()),
            })
            .unwrap();

        let changed = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let changed = Arc::clone(&changed);
            f.bus.subscribe(EventKind::AccountChanged, move |_| {
                changed.fetch_add(1, Ordering::SeqCst);
            })
        };

        f.manager.initialize().await;

        assert_eq!(f.manager.current_account().unwrap().did, "did:plc:a");
        assert_eq!(changed.load(Ordering::SeqCst), 0);
    }
}
