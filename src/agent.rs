//! Request-signing agents
//!
//! A `SigningAgent` is the authenticated handle remote-service proxies use
//! to sign ledger calls. The session manager builds an `HttpAgent` from a
//! provider-A identity, or adopts the agent a wallet extension hands out.

use crate::provider::Identity;
use crate::types::Principal;
use std::fmt;
use std::sync::Arc;

/// Authenticated request-signing handle shared with service proxies
pub trait SigningAgent: Send + Sync {
    /// Principal requests are signed as
    fn principal(&self) -> Principal;

    /// Ledger API host requests are sent to
    fn host(&self) -> &str;
}

impl fmt::Debug for dyn SigningAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningAgent")
            .field("principal", &self.principal())
            .field("host", &self.host())
            .finish()
    }
}

/// Signing agent backed by an identity from the interactive provider
pub struct HttpAgent {
    identity: Arc<dyn Identity>,
    host: String,
}

impl HttpAgent {
    pub fn new(identity: Arc<dyn Identity>, host: impl Into<String>) -> Self {
        Self {
            identity,
            host: host.into(),
        }
    }

    /// The identity this agent signs with
    pub fn identity(&self) -> &Arc<dyn Identity> {
        &self.identity
    }
}

impl SigningAgent for HttpAgent {
    fn principal(&self) -> Principal {
        self.identity.principal()
    }

    fn host(&self) -> &str {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::StaticIdentity;

    #[test]
    fn test_http_agent_signs_as_identity() {
        let identity: Arc<dyn Identity> = Arc::new(StaticIdentity::new("aaaaa-aa"));
        let agent = HttpAgent::new(identity, "https://icp0.io");

        assert_eq!(agent.principal(), Principal::new("aaaaa-aa"));
        assert_eq!(agent.host(), "https://icp0.io");
        assert_eq!(agent.identity().principal().as_str(), "aaaaa-aa");
    }

    #[test]
    fn test_dyn_agent_debug() {
        let identity: Arc<dyn Identity> = Arc::new(StaticIdentity::new("aaaaa-aa"));
        let agent: Arc<dyn SigningAgent> = Arc::new(HttpAgent::new(identity, "http://localhost"));
        let debug = format!("{:?}", agent);
        assert!(debug.contains("aaaaa-aa"));
        assert!(debug.contains("localhost"));
    }
}
