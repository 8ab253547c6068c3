//! Identity provider traits — the seams to the two authentication SDKs
//!
//! Provider A (`IdentityProvider`) is an interactive login SDK that hands
//! back an `Identity` the manager builds its own signing agent from.
//! Provider B (`WalletExtension`) is a browser-extension wallet that hands
//! back a ready-made signing agent.

use crate::agent::SigningAgent;
use crate::error::Result;
use crate::types::Principal;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub mod memory;

/// Opaque identity produced by provider A
pub trait Identity: Send + Sync {
    /// Principal this identity authenticates as
    fn principal(&self) -> Principal;
}

/// Options for an interactive login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOptions {
    /// Login page URL
    pub identity_provider: String,

    /// Requested credential validity window
    pub max_time_to_live: Duration,
}

impl LoginOptions {
    /// Lifetime in nanoseconds, the unit identity SDKs expect
    pub fn max_time_to_live_nanos(&self) -> u128 {
        self.max_time_to_live.as_nanos()
    }
}

/// Interactive identity-provider SDK (provider A)
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// True if the SDK holds a still-valid authenticated session
    async fn is_authenticated(&self) -> Result<bool>;

    /// Current identity (anonymous when not logged in)
    async fn identity(&self) -> Result<Arc<dyn Identity>>;

    /// Run the interactive login flow
    ///
    /// Resolves when the SDK reports success; an error means the user
    /// cancelled or the flow failed.
    async fn login(&self, options: &LoginOptions) -> Result<()>;

    /// End the SDK session
    async fn logout(&self) -> Result<()>;

    /// Provider name for logs
    fn name(&self) -> &str {
        "internet-identity"
    }
}

/// Connectivity notifications pushed by a wallet extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUpdate {
    /// The extension switched to another account
    AccountChanged(Principal),
    /// The extension dropped the connection
    Disconnected,
}

/// Browser-extension wallet SDK (provider B)
#[async_trait]
pub trait WalletExtension: Send + Sync {
    async fn is_connected(&self) -> Result<bool>;

    /// Ask the user to grant access to `whitelist` on `host`
    ///
    /// `Ok(false)` means the user refused.
    async fn request_connect(&self, whitelist: &[String], host: &str) -> Result<bool>;

    /// Principal of the connected account
    async fn principal_id(&self) -> Option<Principal>;

    /// Ledger account identifier of the connected account
    async fn account_id(&self) -> Option<String>;

    /// Signing agent the extension created during `request_connect`
    async fn agent(&self) -> Option<Arc<dyn SigningAgent>>;

    /// Stream of connectivity changes
    fn connection_updates(&self) -> broadcast::Receiver<ConnectionUpdate>;

    async fn disconnect(&self) -> Result<()>;

    /// Provider name for logs
    fn name(&self) -> &str {
        "wallet"
    }
}
