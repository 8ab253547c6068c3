//! Session manager configuration
//!
//! Every field has a default, so an empty TOML document is a valid config.

use crate::error::{Result, SessionError};
use crate::provider::LoginOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Identity provider login page opened for interactive login
    #[serde(default = "default_identity_provider")]
    pub identity_provider: String,

    /// Requested delegation lifetime for interactive login
    #[serde(default = "default_max_time_to_live_secs")]
    pub max_time_to_live_secs: u64,

    /// Ledger API host the signing agent talks to
    #[serde(default = "default_host")]
    pub host: String,

    /// Where to send users who do not have the wallet extension
    #[serde(default = "default_wallet_install_url")]
    pub wallet_install_url: String,

    /// Canister ids the wallet session may call
    #[serde(default)]
    pub whitelist: Vec<String>,
}

fn default_identity_provider() -> String {
    "https://identity.ic0.app".into()
}
fn default_max_time_to_live_secs() -> u64 {
    7 * 24 * 60 * 60
}
fn default_host() -> String {
    "https://icp0.io".into()
}
fn default_wallet_install_url() -> String {
    "https://plugwallet.ooo/".into()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity_provider: default_identity_provider(),
            max_time_to_live_secs: default_max_time_to_live_secs(),
            host: default_host(),
            wallet_install_url: default_wallet_install_url(),
            whitelist: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: SessionConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity_provider.trim().is_empty() {
            return Err(SessionError::Config(
                "identity_provider must not be empty".into(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(SessionError::Config("host must not be empty".into()));
        }
        if self.wallet_install_url.trim().is_empty() {
            return Err(SessionError::Config(
                "wallet_install_url must not be empty".into(),
            ));
        }
        if self.max_time_to_live_secs == 0 {
            return Err(SessionError::Config(
                "max_time_to_live_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn max_time_to_live(&self) -> Duration {
        Duration::from_secs(self.max_time_to_live_secs)
    }

    /// Options passed to the identity provider on interactive login
    pub fn login_options(&self) -> LoginOptions {
        LoginOptions {
            identity_provider: self.identity_provider.clone(),
            max_time_to_live: self.max_time_to_live(),
        }
    }
}
