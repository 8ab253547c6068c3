//! Remote-service proxies that consume the session's signing agent
//!
//! Proxies (agent, token, sale and user registries) are external. The
//! session manager only needs `initialize`/`release` from each of them and
//! `get_profile`/`update_profile` from the user registry.

use crate::agent::SigningAgent;
use crate::error::{Result, SessionError};
use crate::types::{Principal, UserProfile};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;

/// A remote-service proxy bound to a signing agent
#[async_trait]
pub trait ServiceProxy: Send + Sync {
    /// Proxy name for logs and errors
    fn name(&self) -> &str;

    /// Bind (or rebind) the proxy to `agent`
    async fn initialize(&self, agent: Arc<dyn SigningAgent>) -> Result<()>;

    /// Drop any reference to the current agent
    async fn release(&self) {}
}

/// User registry proxy
#[async_trait]
pub trait UserRegistry: ServiceProxy {
    /// Fetch the profile for `principal`; `None` if none was ever created
    async fn get_profile(&self, principal: &Principal) -> Result<Option<UserProfile>>;

    /// Create or replace a profile
    async fn update_profile(&self, profile: UserProfile) -> Result<()>;
}

/// The set of proxies re-initialized on every agent change
#[derive(Clone)]
pub struct ServiceSet {
    user_registry: Arc<dyn UserRegistry>,
    proxies: Vec<Arc<dyn ServiceProxy>>,
}

impl ServiceSet {
    /// Create a set containing only the user registry
    pub fn new<R: UserRegistry + 'static>(user_registry: Arc<R>) -> Self {
        let proxy: Arc<dyn ServiceProxy> = user_registry.clone();
        Self {
            user_registry,
            proxies: vec![proxy],
        }
    }

    /// Add another dependent proxy
    pub fn with_proxy(mut self, proxy: Arc<dyn ServiceProxy>) -> Self {
        self.proxies.push(proxy);
        self
    }

    pub fn user_registry(&self) -> &Arc<dyn UserRegistry> {
        &self.user_registry
    }

    /// Number of proxies, user registry included
    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Initialize every proxy concurrently and wait for all of them
    ///
    /// Fails if any proxy failed; the others stay initialized.
    pub async fn initialize_all(&self, agent: &Arc<dyn SigningAgent>) -> Result<()> {
        let results = join_all(self.proxies.iter().map(|proxy| {
            let agent = agent.clone();
            async move { (proxy.name().to_string(), proxy.initialize(agent).await) }
        }))
        .await;

        let mut failed = Vec::new();
        let mut reasons = Vec::new();
        for (name, result) in results {
            if let Err(e) = result {
                tracing::warn!(service = %name, error = %e, "Service initialization failed");
                reasons.push(e.to_string());
                failed.push(name);
            }
        }

        if failed.is_empty() {
            tracing::debug!(count = self.proxies.len(), "Services initialized");
            Ok(())
        } else {
            Err(SessionError::Service {
                service: failed.join(", "),
                reason: reasons.join("; "),
            })
        }
    }

    /// Release every proxy concurrently
    pub async fn release_all(&self) {
        join_all(self.proxies.iter().map(|proxy| proxy.release())).await;
    }
}

/// Generic in-memory proxy (agent, token or sale registry stand-in)
pub struct MemoryProxy {
    name: String,
    agent: RwLock<Option<Arc<dyn SigningAgent>>>,
    fail_initialize: AtomicBool,
    initialize_calls: AtomicUsize,
    gate: RwLock<Option<Arc<Notify>>>,
}

impl MemoryProxy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent: RwLock::new(None),
            fail_initialize: AtomicBool::new(false),
            initialize_calls: AtomicUsize::new(0),
            gate: RwLock::new(None),
        }
    }

    pub fn fail_initialize(&self, fail: bool) {
        self.fail_initialize.store(fail, Ordering::SeqCst);
    }

    /// Block initialization until the returned handle is notified
    pub fn gate_initialize(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        if let Ok(mut slot) = self.gate.write() {
            *slot = Some(gate.clone());
        }
        gate
    }

    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    /// Principal of the agent the proxy is currently bound to
    pub fn bound_principal(&self) -> Option<Principal> {
        self.agent
            .read()
            .ok()
            .and_then(|a| a.as_ref().map(|agent| agent.principal()))
    }
}

#[async_trait]
impl ServiceProxy for MemoryProxy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, agent: Arc<dyn SigningAgent>) -> Result<()> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.read().ok().and_then(|g| g.clone());
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(SessionError::service(&self.name, "initialization refused"));
        }
        let mut slot = self
            .agent
            .write()
            .map_err(|e| SessionError::service(&self.name, e))?;
        *slot = Some(agent);
        Ok(())
    }

    async fn release(&self) {
        if let Ok(mut slot) = self.agent.write() {
            *slot = None;
        }
    }
}

/// In-memory user registry
pub struct MemoryUserRegistry {
    proxy: MemoryProxy,
    profiles: RwLock<HashMap<Principal, UserProfile>>,
    fail_get: AtomicBool,
    fail_update: AtomicBool,
    get_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl Default for MemoryUserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryUserRegistry {
    pub fn new() -> Self {
        Self {
            proxy: MemoryProxy::new("user-registry"),
            profiles: RwLock::new(HashMap::new()),
            fail_get: AtomicBool::new(false),
            fail_update: AtomicBool::new(false),
            get_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    /// Store a profile directly, bypassing the agent check
    pub fn seed(&self, profile: UserProfile) {
        if let Ok(mut profiles) = self.profiles.write() {
            profiles.insert(profile.principal.clone(), profile);
        }
    }

    /// Stored profile for `principal`
    pub fn stored(&self, principal: &Principal) -> Option<UserProfile> {
        self.profiles
            .read()
            .ok()
            .and_then(|p| p.get(principal).cloned())
    }

    pub fn fail_get(&self, fail: bool) {
        self.fail_get.store(fail, Ordering::SeqCst);
    }

    pub fn fail_update(&self, fail: bool) {
        self.fail_update.store(fail, Ordering::SeqCst);
    }

    pub fn fail_initialize(&self, fail: bool) {
        self.proxy.fail_initialize(fail);
    }

    pub fn gate_initialize(&self) -> Arc<Notify> {
        self.proxy.gate_initialize()
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn initialize_calls(&self) -> usize {
        self.proxy.initialize_calls()
    }

    pub fn bound_principal(&self) -> Option<Principal> {
        self.proxy.bound_principal()
    }

    fn ensure_bound(&self) -> Result<()> {
        if self.proxy.bound_principal().is_none() {
            return Err(SessionError::service(
                self.proxy.name(),
                "called before initialize",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceProxy for MemoryUserRegistry {
    fn name(&self) -> &str {
        self.proxy.name()
    }

    async fn initialize(&self, agent: Arc<dyn SigningAgent>) -> Result<()> {
        self.proxy.initialize(agent).await
    }

    async fn release(&self) {
        self.proxy.release().await
    }
}

#[async_trait]
impl UserRegistry for MemoryUserRegistry {
    async fn get_profile(&self, principal: &Principal) -> Result<Option<UserProfile>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_bound()?;
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(SessionError::service(self.name(), "profile lookup failed"));
        }
        Ok(self.stored(principal))
    }

    async fn update_profile(&self, profile: UserProfile) -> Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_bound()?;
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(SessionError::service(self.name(), "profile update rejected"));
        }
        self.seed(profile);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::StaticAgent;

    fn agent(principal: &str) -> Arc<dyn SigningAgent> {
        Arc::new(StaticAgent::new(principal, "https://icp0.io"))
    }

    #[tokio::test]
    async fn test_initialize_all_binds_every_proxy() {
        let users = Arc::new(MemoryUserRegistry::new());
        let tokens = Arc::new(MemoryProxy::new("token-registry"));
        let sales = Arc::new(MemoryProxy::new("sale-registry"));
        let services = ServiceSet::new(users.clone())
            .with_proxy(tokens.clone())
            .with_proxy(sales.clone());
        assert_eq!(services.len(), 3);

        services.initialize_all(&agent("aaaaa-aa")).await.unwrap();

        assert_eq!(users.bound_principal(), Some(Principal::new("aaaaa-aa")));
        assert_eq!(tokens.bound_principal(), Some(Principal::new("aaaaa-aa")));
        assert_eq!(sales.initialize_calls(), 1);

        services.release_all().await;
        assert!(users.bound_principal().is_none());
        assert!(tokens.bound_principal().is_none());
    }

    #[tokio::test]
    async fn test_initialize_all_reports_failures() {
        let users = Arc::new(MemoryUserRegistry::new());
        let tokens = Arc::new(MemoryProxy::new("token-registry"));
        tokens.fail_initialize(true);
        let services = ServiceSet::new(users.clone()).with_proxy(tokens.clone());

        let err = services.initialize_all(&agent("aaaaa-aa")).await.unwrap_err();
        match err {
            SessionError::Service { service, .. } => assert_eq!(service, "token-registry"),
            other => panic!("unexpected error: {other}"),
        }
        // The healthy proxy is still bound
        assert!(users.bound_principal().is_some());
    }

    #[tokio::test]
    async fn test_initialize_all_waits_for_slow_proxy() {
        let users = Arc::new(MemoryUserRegistry::new());
        let slow = Arc::new(MemoryProxy::new("agent-registry"));
        let gate = slow.gate_initialize();
        let services = ServiceSet::new(users).with_proxy(slow.clone());

        let handle = tokio::spawn({
            let services = services.clone();
            async move { services.initialize_all(&agent("aaaaa-aa")).await }
        });

        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        gate.notify_one();
        handle.await.unwrap().unwrap();
        assert!(slow.bound_principal().is_some());
    }

    #[tokio::test]
    async fn test_user_registry_requires_initialize() {
        let users = MemoryUserRegistry::new();
        let principal = Principal::new("aaaaa-aa");

        assert!(users.get_profile(&principal).await.is_err());
        assert_eq!(users.get_calls(), 1);

        users.initialize(agent("aaaaa-aa")).await.unwrap();
        assert!(users.get_profile(&principal).await.unwrap().is_none());

        users
            .update_profile(UserProfile::new(principal.clone()))
            .await
            .unwrap();
        assert!(users.get_profile(&principal).await.unwrap().is_some());
        assert_eq!(users.update_calls(), 1);
    }
}
