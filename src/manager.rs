//! Session manager — the connection state machine
//!
//! `SessionManager` owns the connection to one of the two identity
//! providers, the signing agent derived from it, the persisted session
//! record and the cached user profile.
//!
//! Every connect attempt and every disconnect bumps an epoch counter. A
//! connect continuation only commits if its epoch is still current, so a
//! slow login that resolves after `disconnect()` is discarded instead of
//! resurrecting the session.

use crate::agent::{HttpAgent, SigningAgent};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::navigator::{LogNavigator, Navigator};
use crate::provider::{ConnectionUpdate, Identity, IdentityProvider, WalletExtension};
use crate::service::ServiceSet;
use crate::store::{KeyValueStore, SessionPersistence};
use crate::types::{
    ConnectionState, DisconnectReason, Principal, ProfileResult, ProfileUpdate, ProviderKind,
    SessionEvent, SessionRecord, SessionSnapshot, UserProfile,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Provider-specific part of a live connection
enum Credential {
    /// Identity from the interactive provider; the agent was built from it
    InternetIdentity { identity: Arc<dyn Identity> },
    /// Wallet connection; the agent was handed out by the extension
    Wallet { account_id: Option<String> },
}

impl Credential {
    fn kind(&self) -> ProviderKind {
        match self {
            Self::InternetIdentity { .. } => ProviderKind::InternetIdentity,
            Self::Wallet { .. } => ProviderKind::Wallet,
        }
    }

    fn account_id(&self) -> Option<String> {
        match self {
            Self::InternetIdentity { .. } => None,
            Self::Wallet { account_id } => account_id.clone(),
        }
    }
}

struct ActiveSession {
    id: String,
    epoch: u64,
    principal: Principal,
    agent: Arc<dyn SigningAgent>,
    credential: Credential,
    services_ready: bool,
}

impl ActiveSession {
    fn new(
        epoch: u64,
        principal: Principal,
        agent: Arc<dyn SigningAgent>,
        credential: Credential,
    ) -> Self {
        Self {
            id: format!("sess-{}", uuid::Uuid::new_v4()),
            epoch,
            principal,
            agent,
            credential,
            services_ready: false,
        }
    }

    fn record(&self) -> SessionRecord {
        SessionRecord {
            provider: self.credential.kind(),
            principal: self.principal.clone(),
            account_id: self.credential.account_id(),
        }
    }
}

#[derive(Default)]
enum SessionState {
    #[default]
    Disconnected,
    Connecting {
        provider: ProviderKind,
        epoch: u64,
    },
    Connected(ActiveSession),
}

impl SessionState {
    fn connection_state(&self) -> ConnectionState {
        match self {
            Self::Disconnected => ConnectionState::Disconnected,
            Self::Connecting { provider, .. } => ConnectionState::Connecting(*provider),
            Self::Connected(active) => ConnectionState::Connected(active.credential.kind()),
        }
    }
}

/// Outcome of a wallet connection request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletConnect {
    /// Connected as this principal
    Connected(Principal),
    /// Extension not detected; the install page was opened
    InstallRequired,
}

struct Inner {
    config: SessionConfig,
    identity_provider: Arc<dyn IdentityProvider>,
    wallet: Option<Arc<dyn WalletExtension>>,
    services: ServiceSet,
    persistence: SessionPersistence,
    navigator: Arc<dyn Navigator>,

    /// Lock order: `transition`, then `state`, then `profile`
    transition: Mutex<()>,
    state: RwLock<SessionState>,
    profile: RwLock<Option<UserProfile>>,
    epoch: AtomicU64,
    /// Held across one proxy initialize or release batch; never held
    /// while waiting on `transition`
    fanout: Mutex<()>,

    events: broadcast::Sender<SessionEvent>,
    /// Wallet watcher task and the epoch it belongs to
    watcher: std::sync::Mutex<Option<(u64, JoinHandle<()>)>>,
}

/// Builder for `SessionManager`
pub struct SessionManagerBuilder {
    config: SessionConfig,
    identity_provider: Arc<dyn IdentityProvider>,
    wallet: Option<Arc<dyn WalletExtension>>,
    services: ServiceSet,
    store: Arc<dyn KeyValueStore>,
    navigator: Arc<dyn Navigator>,
}

impl SessionManagerBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the detected wallet extension
    pub fn wallet(mut self, wallet: Arc<dyn WalletExtension>) -> Self {
        self.wallet = Some(wallet);
        self
    }

    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = navigator;
        self
    }

    /// Build a disconnected manager without attempting restoration
    pub fn build(self) -> Result<SessionManager> {
        self.config.validate()?;
        let (events, _) = broadcast::channel(64);

        Ok(SessionManager {
            inner: Arc::new(Inner {
                config: self.config,
                identity_provider: self.identity_provider,
                wallet: self.wallet,
                services: self.services,
                persistence: SessionPersistence::new(self.store),
                navigator: self.navigator,
                transition: Mutex::new(()),
                state: RwLock::new(SessionState::Disconnected),
                profile: RwLock::new(None),
                epoch: AtomicU64::new(0),
                fanout: Mutex::new(()),
                events,
                watcher: std::sync::Mutex::new(None),
            }),
        })
    }

    /// Build the manager and run silent restoration
    pub async fn start(self) -> Result<SessionManager> {
        let manager = self.build()?;
        manager.restore().await;
        Ok(manager)
    }
}

/// Process-wide session manager
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn builder(
        identity_provider: Arc<dyn IdentityProvider>,
        services: ServiceSet,
        store: Arc<dyn KeyValueStore>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config: SessionConfig::default(),
            identity_provider,
            wallet: None,
            services,
            store,
            navigator: Arc::new(LogNavigator),
        }
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Subscribe to session lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.state.read().await.connection_state()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.state.read().await;
        match &*state {
            SessionState::Connected(active) => SessionSnapshot {
                state: state.connection_state(),
                principal: Some(active.principal.clone()),
                account_id: active.credential.account_id(),
                services_ready: active.services_ready,
                session_id: Some(active.id.clone()),
            },
            other => SessionSnapshot {
                state: other.connection_state(),
                ..Default::default()
            },
        }
    }

    /// Primary address of the connected session
    pub async fn principal(&self) -> Option<Principal> {
        match &*self.inner.state.read().await {
            SessionState::Connected(active) => Some(active.principal.clone()),
            _ => None,
        }
    }

    /// Secondary address (wallet sessions only)
    pub async fn account_id(&self) -> Option<String> {
        match &*self.inner.state.read().await {
            SessionState::Connected(active) => active.credential.account_id(),
            _ => None,
        }
    }

    /// Signing agent of the connected session
    pub async fn agent(&self) -> Option<Arc<dyn SigningAgent>> {
        match &*self.inner.state.read().await {
            SessionState::Connected(active) => Some(active.agent.clone()),
            _ => None,
        }
    }

    /// Identity handle of an interactive-provider session
    pub async fn identity(&self) -> Option<Arc<dyn Identity>> {
        match &*self.inner.state.read().await {
            SessionState::Connected(ActiveSession {
                credential: Credential::InternetIdentity { identity },
                ..
            }) => Some(identity.clone()),
            _ => None,
        }
    }

    pub async fn services_ready(&self) -> bool {
        matches!(
            &*self.inner.state.read().await,
            SessionState::Connected(active) if active.services_ready
        )
    }

    /// Cached user profile
    pub async fn profile(&self) -> Option<UserProfile> {
        self.inner.profile.read().await.clone()
    }

    /// True once services are ready and the registry has no profile
    pub async fn needs_profile_setup(&self) -> bool {
        let state = self.inner.state.read().await;
        match &*state {
            SessionState::Connected(active) if active.services_ready => {
                self.inner.profile.read().await.is_none()
            }
            _ => false,
        }
    }

    // ─── Connect ─────────────────────────────────────────────────

    /// Connect with the given provider, using the configured whitelist for wallets
    pub async fn connect(&self, provider: ProviderKind) -> Result<Option<Principal>> {
        match provider {
            ProviderKind::InternetIdentity => self.connect_internet_identity().await.map(Some),
            ProviderKind::Wallet => {
                let whitelist = self.inner.config.whitelist.clone();
                match self.connect_wallet(&whitelist).await? {
                    WalletConnect::Connected(principal) => Ok(Some(principal)),
                    WalletConnect::InstallRequired => Ok(None),
                }
            }
        }
    }

    /// Interactive login through the identity provider
    pub async fn connect_internet_identity(&self) -> Result<Principal> {
        self.end_current_session().await;
        let epoch = self.begin_connect(ProviderKind::InternetIdentity).await?;

        let options = self.inner.config.login_options();
        if let Err(e) = self.inner.identity_provider.login(&options).await {
            tracing::warn!(error = %e, "Interactive login failed");
            self.abort_connect(epoch).await;
            return Err(as_authentication(e));
        }

        let identity = match self.inner.identity_provider.identity().await {
            Ok(identity) => identity,
            Err(e) => {
                self.abort_connect(epoch).await;
                return Err(as_authentication(e));
            }
        };

        self.finish_identity_connect(epoch, identity).await
    }

    /// Connect through the wallet extension
    ///
    /// Opens the install page and returns `InstallRequired` when no
    /// extension was detected.
    pub async fn connect_wallet(&self, whitelist: &[String]) -> Result<WalletConnect> {
        let Some(wallet) = self.inner.wallet.clone() else {
            tracing::info!(
                url = %self.inner.config.wallet_install_url,
                "Wallet extension not detected"
            );
            self.inner
                .navigator
                .open(&self.inner.config.wallet_install_url);
            return Ok(WalletConnect::InstallRequired);
        };

        self.end_current_session().await;
        let epoch = self.begin_connect(ProviderKind::Wallet).await?;

        match wallet.request_connect(whitelist, &self.inner.config.host).await {
            Ok(true) => {}
            Ok(false) => {
                self.abort_connect(epoch).await;
                return Err(SessionError::Authentication(
                    "wallet connection request refused".to_string(),
                ));
            }
            Err(e) => {
                tracing::warn!(wallet = wallet.name(), error = %e, "Wallet connection failed");
                self.abort_connect(epoch).await;
                return Err(as_authentication(e));
            }
        }

        let updates = wallet.connection_updates();
        let (Some(principal), Some(agent)) = (wallet.principal_id().await, wallet.agent().await)
        else {
            self.abort_connect(epoch).await;
            return Err(SessionError::Authentication(
                "wallet did not provide a principal and agent".to_string(),
            ));
        };

        if principal.is_anonymous() {
            self.reject_anonymous(epoch).await;
            if let Err(e) = wallet.disconnect().await {
                tracing::warn!(error = %e, "Wallet disconnect failed");
            }
            return Err(anonymous_error());
        }

        let account_id = wallet.account_id().await;
        let active = ActiveSession::new(
            epoch,
            principal.clone(),
            agent.clone(),
            Credential::Wallet { account_id },
        );

        if let Err(e) = self.commit(epoch, active).await {
            if let Err(e) = wallet.disconnect().await {
                tracing::warn!(error = %e, "Wallet disconnect after superseded connect failed");
            }
            return Err(e);
        }

        self.spawn_wallet_watcher(epoch, updates);
        self.activate(epoch, agent).await;
        Ok(WalletConnect::Connected(principal))
    }

    /// Silent restoration on startup
    ///
    /// Only interactive-provider sessions are restored; a persisted wallet
    /// record is discarded because the extension needs a user gesture.
    pub async fn restore(&self) -> ConnectionState {
        let record = match self.inner.persistence.load() {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load session record");
                None
            }
        };

        if let Some(record) = &record {
            if record.provider == ProviderKind::Wallet {
                tracing::info!(
                    principal = %record.principal,
                    "Discarding persisted wallet session; reconnect requires user action"
                );
                self.clear_persisted();
            }
        }

        let authenticated = match self.inner.identity_provider.is_authenticated().await {
            Ok(authenticated) => authenticated,
            Err(e) => {
                tracing::warn!(error = %e, "Identity provider status check failed");
                false
            }
        };

        if !authenticated {
            if matches!(&record, Some(r) if r.provider == ProviderKind::InternetIdentity) {
                tracing::debug!("Identity provider session expired; clearing record");
                self.clear_persisted();
            }
            return self.state().await;
        }

        let epoch = match self.begin_connect(ProviderKind::InternetIdentity).await {
            Ok(epoch) => epoch,
            Err(_) => return self.state().await,
        };

        let identity = match self.inner.identity_provider.identity().await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read restored identity");
                self.abort_connect(epoch).await;
                self.clear_persisted();
                return self.state().await;
            }
        };

        match self.finish_identity_connect(epoch, identity).await {
            Ok(principal) => tracing::info!(principal = %principal, "Session restored"),
            Err(e) => tracing::info!(error = %e, "Session not restored"),
        }
        self.state().await
    }

    // ─── Disconnect ──────────────────────────────────────────────

    /// End the session; never fails
    pub async fn disconnect(&self) {
        self.teardown(DisconnectReason::User, true).await;
    }

    // ─── Profile ─────────────────────────────────────────────────

    /// Re-fetch the profile of the connected principal
    ///
    /// No-op unless connected, non-anonymous, and services are ready.
    pub async fn refresh_user_profile(&self) {
        let (principal, epoch) = match &*self.inner.state.read().await {
            SessionState::Connected(active) if active.services_ready => {
                (active.principal.clone(), active.epoch)
            }
            _ => {
                tracing::debug!("Profile refresh skipped; services not ready");
                return;
            }
        };
        if principal.is_anonymous() {
            return;
        }

        let profile = match self
            .inner
            .services
            .user_registry()
            .get_profile(&principal)
            .await
        {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(principal = %principal, error = %e, "Profile fetch failed");
                None
            }
        };

        let state = self.inner.state.read().await;
        let still_current = matches!(
            &*state,
            SessionState::Connected(active) if active.epoch == epoch && active.principal == principal
        );
        if !still_current {
            tracing::debug!(principal = %principal, "Discarding stale profile result");
            return;
        }

        *self.inner.profile.write().await = profile.clone();
        drop(state);

        tracing::debug!(
            principal = %principal,
            found = profile.is_some(),
            "Profile refreshed"
        );
        self.emit(SessionEvent::ProfileUpdated(profile));
    }

    /// Merge `update` into the profile, push it, then refresh
    pub async fn update_user_profile(&self, update: ProfileUpdate) -> ProfileResult {
        let principal = match &*self.inner.state.read().await {
            SessionState::Connected(active) if active.services_ready => active.principal.clone(),
            SessionState::Connected(_) => {
                return ProfileResult::failed("Services are still initializing")
            }
            _ => return ProfileResult::failed(SessionError::NotConnected.to_string()),
        };

        let registry = self.inner.services.user_registry();
        let cached = self
            .profile()
            .await
            .filter(|profile| profile.principal == principal);
        let existing = match cached {
            Some(profile) => Some(profile),
            None => match registry.get_profile(&principal).await {
                Ok(profile) => profile,
                Err(e) => {
                    tracing::warn!(principal = %principal, error = %e, "Profile lookup before update failed");
                    return ProfileResult::failed(e.to_string());
                }
            },
        };

        let profile = update.merge_into(existing, &principal);
        if let Err(e) = registry.update_profile(profile).await {
            tracing::warn!(principal = %principal, error = %e, "Profile update failed");
            return ProfileResult::failed(e.to_string());
        }

        tracing::info!(principal = %principal, "Profile updated");
        self.refresh_user_profile().await;
        ProfileResult::ok()
    }

    // ─── Transitions ─────────────────────────────────────────────

    fn current_epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    fn clear_persisted(&self) {
        if let Err(e) = self.inner.persistence.clear() {
            tracing::warn!(error = %e, "Failed to clear session record");
        }
    }

    /// Disconnect first when switching away from a live session
    async fn end_current_session(&self) {
        if self.state().await.is_connected() {
            self.teardown(DisconnectReason::ProviderSwitch, true).await;
        }
    }

    async fn begin_connect(&self, provider: ProviderKind) -> Result<u64> {
        let _guard = self.inner.transition.lock().await;
        let mut state = self.inner.state.write().await;
        if !matches!(&*state, SessionState::Disconnected) {
            return Err(SessionError::InProgress);
        }

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *state = SessionState::Connecting { provider, epoch };
        drop(state);

        tracing::debug!(provider = %provider, epoch, "Connecting");
        self.emit(SessionEvent::StateChanged(ConnectionState::Connecting(provider)));
        Ok(epoch)
    }

    /// Revert `Connecting` to `Disconnected` if `epoch` is still in flight
    async fn abort_connect(&self, epoch: u64) {
        let _guard = self.inner.transition.lock().await;
        let mut state = self.inner.state.write().await;
        if matches!(&*state, SessionState::Connecting { epoch: e, .. } if *e == epoch) {
            *state = SessionState::Disconnected;
            drop(state);
            self.emit(SessionEvent::StateChanged(ConnectionState::Disconnected));
        }
    }

    async fn reject_anonymous(&self, epoch: u64) {
        tracing::warn!("Provider returned the anonymous identity; treating as not authenticated");
        self.abort_connect(epoch).await;
        self.clear_persisted();
        self.emit(SessionEvent::Disconnected(DisconnectReason::AnonymousIdentity));
    }

    /// Move `Connecting(epoch)` to `Connected` and persist the record
    async fn commit(&self, epoch: u64, active: ActiveSession) -> Result<()> {
        let _guard = self.inner.transition.lock().await;
        let mut state = self.inner.state.write().await;
        if !matches!(&*state, SessionState::Connecting { epoch: e, .. } if *e == epoch) {
            tracing::info!(
                principal = %active.principal,
                epoch,
                current = self.current_epoch(),
                "Connect result superseded"
            );
            return Err(SessionError::Superseded);
        }

        if let Err(e) = self.inner.persistence.save(&active.record()) {
            tracing::warn!(error = %e, "Failed to persist session record");
        }

        let kind = active.credential.kind();
        tracing::info!(
            principal = %active.principal,
            provider = %kind,
            session_id = %active.id,
            "Session connected"
        );
        *state = SessionState::Connected(active);
        drop(state);

        self.emit(SessionEvent::StateChanged(ConnectionState::Connected(kind)));
        Ok(())
    }

    async fn finish_identity_connect(
        &self,
        epoch: u64,
        identity: Arc<dyn Identity>,
    ) -> Result<Principal> {
        let principal = identity.principal();
        if principal.is_anonymous() {
            self.reject_anonymous(epoch).await;
            return Err(anonymous_error());
        }

        let agent: Arc<dyn SigningAgent> =
            Arc::new(HttpAgent::new(identity.clone(), self.inner.config.host.clone()));
        let active = ActiveSession::new(
            epoch,
            principal.clone(),
            agent.clone(),
            Credential::InternetIdentity { identity },
        );

        if let Err(e) = self.commit(epoch, active).await {
            if let Err(e) = self.inner.identity_provider.logout().await {
                tracing::warn!(error = %e, "Logout after superseded connect failed");
            }
            return Err(e);
        }

        self.activate(epoch, agent).await;
        Ok(principal)
    }

    /// True while `agent` is still the agent of the session at `epoch`
    async fn is_current(&self, epoch: u64, agent: &Arc<dyn SigningAgent>) -> bool {
        matches!(
            &*self.inner.state.read().await,
            SessionState::Connected(active)
                if active.epoch == epoch && Arc::ptr_eq(&active.agent, agent)
        )
    }

    /// Fan the agent out to every proxy, then fetch the profile
    ///
    /// Batches run one at a time. A batch whose agent was replaced or
    /// disconnected while it ran releases the proxies again, so the next
    /// batch (or the teardown waiting behind it) starts from a clean slate.
    async fn activate(&self, epoch: u64, agent: Arc<dyn SigningAgent>) {
        {
            let _fanout = self.inner.fanout.lock().await;
            if !self.is_current(epoch, &agent).await {
                tracing::debug!(epoch, "Agent replaced before initialization");
                return;
            }

            let initialized = self.inner.services.initialize_all(&agent).await;

            let current = {
                let mut state = self.inner.state.write().await;
                match &mut *state {
                    SessionState::Connected(active)
                        if active.epoch == epoch && Arc::ptr_eq(&active.agent, &agent) =>
                    {
                        active.services_ready = initialized.is_ok();
                        true
                    }
                    _ => false,
                }
            };

            if !current {
                tracing::debug!(
                    epoch,
                    "Agent replaced during initialization; releasing services"
                );
                self.inner.services.release_all().await;
                return;
            }
            if let Err(e) = initialized {
                tracing::warn!(error = %e, "Services not ready; profile fetch skipped");
                return;
            }
        }

        self.emit(SessionEvent::ServicesReady);
        self.refresh_user_profile().await;
    }

    /// Shared cleanup for every path into `Disconnected`
    async fn teardown(&self, reason: DisconnectReason, abort_watcher: bool) {
        let (previous, had_profile) = {
            let _guard = self.inner.transition.lock().await;
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            let mut state = self.inner.state.write().await;
            let previous = std::mem::take(&mut *state);
            let had_profile = self.inner.profile.write().await.take().is_some();
            self.clear_persisted();
            (previous, had_profile)
        };

        let watcher = self.inner.watcher.lock().ok().and_then(|mut w| w.take());
        if let Some((_, handle)) = watcher {
            if abort_watcher {
                handle.abort();
            }
        }

        match previous {
            SessionState::Disconnected => {
                tracing::debug!("Disconnect requested while already disconnected");
                return;
            }
            SessionState::Connecting { provider, .. } => {
                tracing::info!(provider = %provider, "In-flight connection cancelled");
            }
            SessionState::Connected(active) => {
                {
                    let _fanout = self.inner.fanout.lock().await;
                    self.inner.services.release_all().await;
                }

                match &active.credential {
                    Credential::InternetIdentity { .. } => {
                        if let Err(e) = self.inner.identity_provider.logout().await {
                            tracing::warn!(error = %e, "Identity provider logout failed");
                        }
                    }
                    Credential::Wallet { .. } => {
                        if reason != DisconnectReason::ConnectionLost {
                            if let Some(wallet) = &self.inner.wallet {
                                if let Err(e) = wallet.disconnect().await {
                                    tracing::warn!(error = %e, "Wallet disconnect failed");
                                }
                            }
                        }
                    }
                }

                tracing::info!(
                    principal = %active.principal,
                    provider = %active.credential.kind(),
                    reason = ?reason,
                    "Session disconnected"
                );
            }
        }

        self.emit(SessionEvent::StateChanged(ConnectionState::Disconnected));
        if had_profile {
            self.emit(SessionEvent::ProfileUpdated(None));
        }
        self.emit(SessionEvent::Disconnected(reason));
    }

    // ─── Wallet connectivity ─────────────────────────────────────

    fn spawn_wallet_watcher(&self, epoch: u64, updates: broadcast::Receiver<ConnectionUpdate>) {
        let weak = Arc::downgrade(&self.inner);
        let mut updates = BroadcastStream::new(updates);

        let handle = tokio::spawn(async move {
            while let Some(update) = updates.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = SessionManager { inner };
                if manager.current_epoch() != epoch {
                    break;
                }

                match update {
                    Ok(ConnectionUpdate::Disconnected) => {
                        tracing::info!("Wallet reported connection lost");
                        manager
                            .teardown(DisconnectReason::ConnectionLost, false)
                            .await;
                        break;
                    }
                    Ok(ConnectionUpdate::AccountChanged(principal)) => {
                        if !manager.adopt_wallet_account(epoch, principal).await {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Wallet connection updates lagged");
                    }
                }
            }
        });

        let Ok(mut slot) = self.inner.watcher.lock() else {
            handle.abort();
            return;
        };
        // Teardown bumps the epoch before it empties the slot
        if self.current_epoch() != epoch {
            tracing::debug!(epoch, "Session ended before its watcher started");
            handle.abort();
            return;
        }
        if let Some((_, previous)) = slot.replace((epoch, handle)) {
            previous.abort();
        }
    }

    /// Rebind the session to the wallet's newly selected account
    ///
    /// Returns false if the session ended instead.
    async fn adopt_wallet_account(&self, epoch: u64, principal: Principal) -> bool {
        if principal.is_anonymous() {
            self.teardown(DisconnectReason::AnonymousIdentity, false)
                .await;
            return false;
        }

        let Some(wallet) = self.inner.wallet.clone() else {
            return false;
        };
        let Some(agent) = wallet.agent().await else {
            self.teardown(DisconnectReason::ConnectionLost, false).await;
            return false;
        };
        let account_id = wallet.account_id().await;

        {
            let _guard = self.inner.transition.lock().await;
            let mut state = self.inner.state.write().await;
            let SessionState::Connected(active) = &mut *state else {
                return false;
            };
            if active.epoch != epoch {
                return false;
            }

            active.principal = principal.clone();
            active.agent = agent.clone();
            active.credential = Credential::Wallet { account_id };
            active.services_ready = false;
            if let Err(e) = self.inner.persistence.save(&active.record()) {
                tracing::warn!(error = %e, "Failed to persist session record");
            }
            *self.inner.profile.write().await = None;
        }

        tracing::info!(principal = %principal, "Wallet account changed");
        self.emit(SessionEvent::StateChanged(ConnectionState::Connected(
            ProviderKind::Wallet,
        )));
        self.emit(SessionEvent::ProfileUpdated(None));
        self.activate(epoch, agent).await;
        true
    }
}

fn anonymous_error() -> SessionError {
    SessionError::Authentication("provider returned the anonymous identity".to_string())
}

fn as_authentication(e: SessionError) -> SessionError {
    match e {
        SessionError::Authentication(_) => e,
        other => SessionError::Authentication(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::{MemoryIdentityProvider, MemoryWallet, StaticAgent};
    use crate::service::{MemoryProxy, MemoryUserRegistry};
    use crate::store::MemoryKeyValueStore;
    use tokio_test::{assert_pending, assert_ready_err};

    struct Fixture {
        manager: SessionManager,
        identity: Arc<MemoryIdentityProvider>,
        wallet: Arc<MemoryWallet>,
        users: Arc<MemoryUserRegistry>,
        tokens: Arc<MemoryProxy>,
        store: Arc<MemoryKeyValueStore>,
    }

    fn fixture() -> Fixture {
        let identity = Arc::new(MemoryIdentityProvider::new("aaaaa-aa"));
        let wallet = Arc::new(MemoryWallet::new("bbbbb-bb", Some("acc-1".to_string())));
        let users = Arc::new(MemoryUserRegistry::new());
        let tokens = Arc::new(MemoryProxy::new("token-registry"));
        let store = Arc::new(MemoryKeyValueStore::default());

        let services = ServiceSet::new(users.clone()).with_proxy(tokens.clone());
        let manager = SessionManager::builder(identity.clone(), services, store.clone())
            .wallet(wallet.clone())
            .build()
            .unwrap();

        Fixture {
            manager,
            identity,
            wallet,
            users,
            tokens,
            store,
        }
    }

    async fn assert_consistent(manager: &SessionManager) {
        let state = manager.state().await;
        let agent = manager.agent().await;
        let principal = manager.principal().await;
        assert_eq!(state.is_connected(), agent.is_some());
        assert_eq!(state.is_connected(), principal.is_some());
        assert_eq!(state == ConnectionState::Disconnected, state.provider().is_none());
    }

    #[tokio::test]
    async fn test_connect_internet_identity() {
        let f = fixture();
        let principal = f.manager.connect_internet_identity().await.unwrap();

        assert_eq!(principal.as_str(), "aaaaa-aa");
        assert_eq!(
            f.manager.state().await,
            ConnectionState::Connected(ProviderKind::InternetIdentity)
        );
        assert!(f.manager.identity().await.is_some());
        assert!(f.manager.services_ready().await);
        assert_eq!(f.tokens.bound_principal(), Some(principal.clone()));
        assert_eq!(f.users.get_calls(), 1);
        assert!(f.manager.needs_profile_setup().await);
        assert_eq!(
            f.identity.last_login().unwrap().max_time_to_live,
            f.manager.config().max_time_to_live()
        );
        assert_consistent(&f.manager).await;
    }

    #[tokio::test]
    async fn test_connect_while_connecting_is_rejected() {
        let f = fixture();
        let gate = f.identity.gate_login();

        let manager = f.manager.clone();
        let first = tokio::spawn(async move { manager.connect_internet_identity().await });
        while f.manager.state().await == ConnectionState::Disconnected {
            tokio::task::yield_now().await;
        }

        let err = f.manager.connect_internet_identity().await.unwrap_err();
        assert!(matches!(err, SessionError::InProgress));

        gate.notify_one();
        first.await.unwrap().unwrap();
        assert!(f.manager.state().await.is_connected());
    }

    #[tokio::test]
    async fn test_login_resolving_after_disconnect_is_discarded() {
        let f = fixture();
        let gate = f.identity.gate_login();

        let mut connecting = tokio_test::task::spawn(f.manager.connect_internet_identity());
        assert_pending!(connecting.poll());
        assert_eq!(
            f.manager.state().await,
            ConnectionState::Connecting(ProviderKind::InternetIdentity)
        );

        f.manager.disconnect().await;
        gate.notify_one();
        assert!(connecting.is_woken());

        let err = assert_ready_err!(connecting.poll());
        assert!(matches!(err, SessionError::Superseded));
        assert_eq!(f.manager.state().await, ConnectionState::Disconnected);
        assert_eq!(f.identity.logout_calls(), 1);
        assert!(f.tokens.bound_principal().is_none());
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_watcher_of_ended_session_is_not_kept() {
        let f = fixture();
        let epoch = f.manager.begin_connect(ProviderKind::Wallet).await.unwrap();
        let updates = f.wallet.connection_updates();
        let agent: Arc<dyn SigningAgent> =
            Arc::new(StaticAgent::new("bbbbb-bb", "https://ic0.app"));
        let active = ActiveSession::new(
            epoch,
            Principal::new("bbbbb-bb"),
            agent,
            Credential::Wallet { account_id: None },
        );
        f.manager.commit(epoch, active).await.unwrap();

        f.manager.disconnect().await;
        f.manager.spawn_wallet_watcher(epoch, updates);

        assert!(f.manager.inner.watcher.lock().unwrap().is_none());
        assert_eq!(f.manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_switch_provider_replaces_session() {
        let f = fixture();
        f.manager.connect_internet_identity().await.unwrap();

        let outcome = f.manager.connect_wallet(&[]).await.unwrap();
        assert_eq!(outcome, WalletConnect::Connected(Principal::new("bbbbb-bb")));
        assert_eq!(f.identity.logout_calls(), 1);
        assert_eq!(f.manager.account_id().await.as_deref(), Some("acc-1"));
        assert!(f.manager.identity().await.is_none());
        assert_eq!(
            f.store.get(crate::store::PROVIDER_KEY).unwrap().as_deref(),
            Some("wallet")
        );
        assert_consistent(&f.manager).await;
    }

    #[tokio::test]
    async fn test_wallet_refusal_stays_disconnected() {
        let f = fixture();
        f.wallet.refuse_connect(true);

        let err = f.manager.connect_wallet(&[]).await.unwrap_err();
        assert!(matches!(err, SessionError::Authentication(_)));
        assert_eq!(f.manager.state().await, ConnectionState::Disconnected);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_swallows_logout_failure() {
        let f = fixture();
        f.manager.connect_internet_identity().await.unwrap();
        f.identity.fail_logout(true);

        f.manager.disconnect().await;

        assert_eq!(f.manager.state().await, ConnectionState::Disconnected);
        assert!(f.store.is_empty());
        assert!(f.manager.profile().await.is_none());
        assert!(f.tokens.bound_principal().is_none());
        assert_consistent(&f.manager).await;
    }

    #[tokio::test]
    async fn test_events_emitted_on_connect_and_disconnect() {
        let f = fixture();
        let mut events = f.manager.subscribe();

        f.manager.connect_internet_identity().await.unwrap();
        f.manager.disconnect().await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen.first(),
            Some(&SessionEvent::StateChanged(ConnectionState::Connecting(
                ProviderKind::InternetIdentity
            )))
        );
        assert!(seen.contains(&SessionEvent::ServicesReady));
        assert!(seen.contains(&SessionEvent::ProfileUpdated(None)));
        assert_eq!(
            seen.last(),
            Some(&SessionEvent::Disconnected(DisconnectReason::User))
        );
    }

    #[tokio::test]
    async fn test_failed_service_init_keeps_services_unready() {
        let f = fixture();
        f.tokens.fail_initialize(true);

        f.manager.connect_internet_identity().await.unwrap();

        assert!(f.manager.state().await.is_connected());
        assert!(!f.manager.services_ready().await);
        assert_eq!(f.users.get_calls(), 0);
        assert!(!f.manager.needs_profile_setup().await);
    }

    #[tokio::test]
    async fn test_update_profile_requires_session() {
        let f = fixture();
        let result = f
            .manager
            .update_user_profile(ProfileUpdate::default().display_name("X"))
            .await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(f.users.update_calls(), 0);
    }

    #[tokio::test]
    async fn test_update_profile_reports_remote_failure() {
        let f = fixture();
        f.manager.connect_internet_identity().await.unwrap();
        f.users.fail_update(true);

        let result = f
            .manager
            .update_user_profile(ProfileUpdate::default().display_name("X"))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("rejected"));
        assert!(f.manager.profile().await.is_none());
    }

    #[tokio::test]
    async fn test_profile_fetch_failure_resolves_to_none() {
        let f = fixture();
        f.users.fail_get(true);

        f.manager.connect_internet_identity().await.unwrap();
        assert!(f.manager.profile().await.is_none());
        assert_eq!(f.users.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_wallet_account_change_rebinds_services() {
        let f = fixture();
        f.manager.connect_wallet(&[]).await.unwrap();
        let mut events = f.manager.subscribe();

        f.wallet.switch_account("ccccc-cc");
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::ServicesReady => break,
                _ => continue,
            }
        }

        assert_eq!(f.manager.principal().await, Some(Principal::new("ccccc-cc")));
        assert_eq!(f.tokens.initialize_calls(), 2);
        assert_eq!(
            f.store.get(crate::store::PRINCIPAL_KEY).unwrap().as_deref(),
            Some("ccccc-cc")
        );
    }
}
