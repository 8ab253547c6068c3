//! In-memory identity providers
//!
//! Scriptable stand-ins for the two provider SDKs, for tests and
//! single-process use. Every call is counted so callers can assert on
//! what the session manager actually did.

use super::{ConnectionUpdate, Identity, IdentityProvider, LoginOptions, WalletExtension};
use crate::agent::SigningAgent;
use crate::error::{Result, SessionError};
use crate::types::Principal;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, Notify};

/// Identity with a fixed principal
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    principal: Principal,
}

impl StaticIdentity {
    pub fn new(principal: impl Into<Principal>) -> Self {
        Self {
            principal: principal.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            principal: Principal::anonymous(),
        }
    }
}

impl Identity for StaticIdentity {
    fn principal(&self) -> Principal {
        self.principal.clone()
    }
}

/// Signing agent with a fixed principal, as handed out by a wallet
#[derive(Debug, Clone)]
pub struct StaticAgent {
    principal: Principal,
    host: String,
}

impl StaticAgent {
    pub fn new(principal: impl Into<Principal>, host: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            host: host.into(),
        }
    }
}

impl SigningAgent for StaticAgent {
    fn principal(&self) -> Principal {
        self.principal.clone()
    }

    fn host(&self) -> &str {
        &self.host
    }
}

/// What the next interactive login resolves to
#[derive(Debug, Clone)]
enum LoginOutcome {
    Succeed(Principal),
    Fail(String),
}

/// In-memory interactive identity provider
pub struct MemoryIdentityProvider {
    /// Principal of the current SDK session; `None` means not authenticated
    session: RwLock<Option<Principal>>,
    next_login: RwLock<LoginOutcome>,
    login_gate: RwLock<Option<Arc<Notify>>>,
    fail_logout: AtomicBool,
    login_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    last_login: RwLock<Option<LoginOptions>>,
}

impl MemoryIdentityProvider {
    /// Provider whose logins succeed as `principal`
    pub fn new(principal: impl Into<Principal>) -> Self {
        Self {
            session: RwLock::new(None),
            next_login: RwLock::new(LoginOutcome::Succeed(principal.into())),
            login_gate: RwLock::new(None),
            fail_logout: AtomicBool::new(false),
            login_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            last_login: RwLock::new(None),
        }
    }

    /// Provider that already holds an authenticated session, as after a reload
    pub fn authenticated(principal: impl Into<Principal>) -> Self {
        let principal = principal.into();
        let provider = Self::new(principal.clone());
        provider.set_session(Some(principal));
        provider
    }

    /// Replace the SDK session
    pub fn set_session(&self, principal: Option<Principal>) {
        if let Ok(mut session) = self.session.write() {
            *session = principal;
        }
    }

    /// Make the next login succeed as `principal`
    pub fn succeed_login_as(&self, principal: impl Into<Principal>) {
        if let Ok(mut next) = self.next_login.write() {
            *next = LoginOutcome::Succeed(principal.into());
        }
    }

    /// Make the next login fail with `reason`
    pub fn fail_login(&self, reason: impl Into<String>) {
        if let Ok(mut next) = self.next_login.write() {
            *next = LoginOutcome::Fail(reason.into());
        }
    }

    /// Block logins until the returned handle is notified
    pub fn gate_login(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        if let Ok(mut slot) = self.login_gate.write() {
            *slot = Some(gate.clone());
        }
        gate
    }

    pub fn fail_logout(&self, fail: bool) {
        self.fail_logout.store(fail, Ordering::SeqCst);
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    /// Options passed to the most recent login
    pub fn last_login(&self) -> Option<LoginOptions> {
        self.last_login.read().ok().and_then(|l| l.clone())
    }

    fn lock_error(e: impl std::fmt::Display) -> SessionError {
        SessionError::Authentication(format!("identity provider lock poisoned: {}", e))
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn is_authenticated(&self) -> Result<bool> {
        let session = self.session.read().map_err(Self::lock_error)?;
        Ok(session.is_some())
    }

    async fn identity(&self) -> Result<Arc<dyn Identity>> {
        let session = self.session.read().map_err(Self::lock_error)?;
        let identity = match session.as_ref() {
            Some(principal) => StaticIdentity::new(principal.clone()),
            None => StaticIdentity::anonymous(),
        };
        Ok(Arc::new(identity))
    }

    async fn login(&self, options: &LoginOptions) -> Result<()> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_login.write() {
            *last = Some(options.clone());
        }

        let gate = self.login_gate.read().map_err(Self::lock_error)?.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let outcome = self.next_login.read().map_err(Self::lock_error)?.clone();
        match outcome {
            LoginOutcome::Succeed(principal) => {
                self.set_session(Some(principal));
                Ok(())
            }
            LoginOutcome::Fail(reason) => Err(SessionError::Authentication(reason)),
        }
    }

    async fn logout(&self) -> Result<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_logout.load(Ordering::SeqCst) {
            return Err(SessionError::ProviderUnavailable(
                "logout endpoint unreachable".to_string(),
            ));
        }
        self.set_session(None);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory-identity"
    }
}

/// In-memory browser-extension wallet
pub struct MemoryWallet {
    principal: Principal,
    account_id: Option<String>,
    host: RwLock<Option<String>>,
    connected: AtomicBool,
    refuse: AtomicBool,
    fail_disconnect: AtomicBool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    last_whitelist: RwLock<Vec<String>>,
    updates: broadcast::Sender<ConnectionUpdate>,
}

impl MemoryWallet {
    pub fn new(principal: impl Into<Principal>, account_id: Option<String>) -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            principal: principal.into(),
            account_id,
            host: RwLock::new(None),
            connected: AtomicBool::new(false),
            refuse: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            last_whitelist: RwLock::new(Vec::new()),
            updates,
        }
    }

    /// Make connection requests be refused by the user
    pub fn refuse_connect(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    /// Simulate the extension dropping the connection
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.updates.send(ConnectionUpdate::Disconnected);
    }

    /// Simulate the user switching accounts inside the extension
    pub fn switch_account(&self, principal: impl Into<Principal>) {
        let _ = self
            .updates
            .send(ConnectionUpdate::AccountChanged(principal.into()));
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Whitelist passed to the most recent connection request
    pub fn last_whitelist(&self) -> Vec<String> {
        self.last_whitelist
            .read()
            .map(|w| w.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl WalletExtension for MemoryWallet {
    async fn is_connected(&self) -> Result<bool> {
        Ok(self.connected.load(Ordering::SeqCst))
    }

    async fn request_connect(&self, whitelist: &[String], host: &str) -> Result<bool> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_whitelist.write() {
            *last = whitelist.to_vec();
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if let Ok(mut h) = self.host.write() {
            *h = Some(host.to_string());
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn principal_id(&self) -> Option<Principal> {
        self.connected
            .load(Ordering::SeqCst)
            .then(|| self.principal.clone())
    }

    async fn account_id(&self) -> Option<String> {
        if self.connected.load(Ordering::SeqCst) {
            self.account_id.clone()
        } else {
            None
        }
    }

    async fn agent(&self) -> Option<Arc<dyn SigningAgent>> {
        if !self.connected.load(Ordering::SeqCst) {
            return None;
        }
        let host = self.host.read().ok()?.clone()?;
        Some(Arc::new(StaticAgent::new(self.principal.clone(), host)))
    }

    fn connection_updates(&self) -> broadcast::Receiver<ConnectionUpdate> {
        self.updates.subscribe()
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(SessionError::ProviderUnavailable(
                "extension did not respond".to_string(),
            ));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory-wallet"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options() -> LoginOptions {
        LoginOptions {
            identity_provider: "https://identity.ic0.app".to_string(),
            max_time_to_live: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_identity_provider_login_flow() {
        let provider = MemoryIdentityProvider::new("aaaaa-aa");
        assert!(!provider.is_authenticated().await.unwrap());
        assert!(provider.identity().await.unwrap().principal().is_anonymous());

        provider.login(&options()).await.unwrap();
        assert!(provider.is_authenticated().await.unwrap());
        assert_eq!(provider.identity().await.unwrap().principal().as_str(), "aaaaa-aa");
        assert_eq!(provider.login_calls(), 1);
        assert_eq!(provider.last_login(), Some(options()));

        provider.logout().await.unwrap();
        assert!(!provider.is_authenticated().await.unwrap());
    }

    #[tokio::test]
    async fn test_identity_provider_failed_login() {
        let provider = MemoryIdentityProvider::new("aaaaa-aa");
        provider.fail_login("UserInterrupt");

        let err = provider.login(&options()).await.unwrap_err();
        assert!(err.to_string().contains("UserInterrupt"));
        assert!(!provider.is_authenticated().await.unwrap());
    }

    #[tokio::test]
    async fn test_identity_provider_failing_logout() {
        let provider = MemoryIdentityProvider::authenticated("aaaaa-aa");
        provider.fail_logout(true);
        assert!(provider.logout().await.is_err());
        assert_eq!(provider.logout_calls(), 1);
    }

    #[tokio::test]
    async fn test_wallet_connect_and_drop() {
        let wallet = MemoryWallet::new("bbbbb-bb", Some("acc-1".to_string()));
        let mut updates = wallet.connection_updates();
        assert!(wallet.agent().await.is_none());

        let whitelist = vec!["ryjl3-tyaaa-aaaaa-aaaba-cai".to_string()];
        assert!(wallet.request_connect(&whitelist, "https://icp0.io").await.unwrap());
        assert!(wallet.is_connected().await.unwrap());
        assert_eq!(wallet.principal_id().await, Some(Principal::new("bbbbb-bb")));
        assert_eq!(wallet.account_id().await.as_deref(), Some("acc-1"));
        assert_eq!(wallet.agent().await.unwrap().host(), "https://icp0.io");
        assert_eq!(wallet.last_whitelist(), whitelist);

        wallet.drop_connection();
        assert_eq!(updates.recv().await.unwrap(), ConnectionUpdate::Disconnected);
        assert!(!wallet.is_connected().await.unwrap());
    }

    #[tokio::test]
    async fn test_wallet_refused() {
        let wallet = MemoryWallet::new("bbbbb-bb", None);
        wallet.refuse_connect(true);
        assert!(!wallet.request_connect(&[], "https://icp0.io").await.unwrap());
        assert!(wallet.principal_id().await.is_none());
        assert_eq!(wallet.connect_calls(), 1);
    }
}
