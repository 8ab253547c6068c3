//! Core session types for the ledger-session system
//!
//! All serializable types use camelCase JSON for compatibility with the
//! remote registries and the presentation layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Text form of the well-known anonymous principal
///
/// Identity SDKs return this placeholder when no user is authenticated.
/// It must never be accepted as a connected session.
pub const ANONYMOUS_PRINCIPAL: &str = "2vxsx-fae";

/// Textual ledger principal (the session's primary address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    /// Wrap a principal's text form
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The anonymous placeholder principal
    pub fn anonymous() -> Self {
        Self(ANONYMOUS_PRINCIPAL.to_string())
    }

    /// True if this is the anonymous placeholder
    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS_PRINCIPAL
    }

    /// Text form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Principal {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Principal {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which identity provider backs a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderKind {
    /// Interactive identity-provider SDK (popup login)
    InternetIdentity,
    /// Browser-extension wallet
    Wallet,
}

impl ProviderKind {
    /// Stable string form used in persisted records
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InternetIdentity => "internet-identity",
            Self::Wallet => "wallet",
        }
    }

    /// Parse the persisted string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "internet-identity" => Some(Self::InternetIdentity),
            "wallet" => Some(Self::Wallet),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable connection state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "provider")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting(ProviderKind),
    Connected(ProviderKind),
}

impl ConnectionState {
    /// Provider involved in this state, if any
    pub fn provider(&self) -> Option<ProviderKind> {
        match self {
            Self::Disconnected => None,
            Self::Connecting(kind) | Self::Connected(kind) => Some(*kind),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

/// User profile stored in the remote user registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// Principal the profile belongs to
    pub principal: Principal,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Avatar image URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitter: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,

    /// When the profile was first created
    pub created_at: DateTime<Utc>,

    /// Agent identifiers owned by this user
    #[serde(default)]
    pub agents: Vec<String>,

    #[serde(default)]
    pub twitter_verified: bool,

    #[serde(default)]
    pub telegram_verified: bool,
}

impl UserProfile {
    /// Create an empty profile stamped with the current time
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            username: None,
            display_name: None,
            avatar: None,
            twitter: None,
            telegram: None,
            website: None,
            created_at: Utc::now(),
            agents: Vec::new(),
            twitter_verified: false,
            telegram_verified: false,
        }
    }
}

/// Sparse profile change; `None` fields keep their current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitter_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_verified: Option<bool>,
}

impl ProfileUpdate {
    pub fn display_name(mut self, value: impl Into<String>) -> Self {
        self.display_name = Some(value.into());
        self
    }

    pub fn username(mut self, value: impl Into<String>) -> Self {
        self.username = Some(value.into());
        self
    }

    pub fn agents(mut self, agents: Vec<String>) -> Self {
        self.agents = Some(agents);
        self
    }

    /// Apply this update on top of `base`, or on a fresh profile for `principal`
    pub fn merge_into(self, base: Option<UserProfile>, principal: &Principal) -> UserProfile {
        let mut profile = base.unwrap_or_else(|| UserProfile::new(principal.clone()));

        if let Some(v) = self.username {
            profile.username = Some(v);
        }
        if let Some(v) = self.display_name {
            profile.display_name = Some(v);
        }
        if let Some(v) = self.avatar {
            profile.avatar = Some(v);
        }
        if let Some(v) = self.twitter {
            profile.twitter = Some(v);
        }
        if let Some(v) = self.telegram {
            profile.telegram = Some(v);
        }
        if let Some(v) = self.website {
            profile.website = Some(v);
        }
        if let Some(v) = self.agents {
            profile.agents = v;
        }
        if let Some(v) = self.twitter_verified {
            profile.twitter_verified = v;
        }
        if let Some(v) = self.telegram_verified {
            profile.telegram_verified = v;
        }

        profile
    }
}

/// Outcome of a profile update, safe to hand directly to rendering code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProfileResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// The single session record kept in the local store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub provider: ProviderKind,
    pub principal: Principal,
    /// Secondary address, wallet sessions only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

/// Read-only view of the session for callers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub services_ready: bool,
    /// Identifier of the current connection (sess-<uuid>)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl SessionSnapshot {
    pub fn provider(&self) -> Option<ProviderKind> {
        self.state.provider()
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Explicit `disconnect()` call
    User,
    /// The wallet extension reported the connection was lost
    ConnectionLost,
    /// Replaced by a connection to another provider
    ProviderSwitch,
    /// The provider returned the anonymous identity
    AnonymousIdentity,
}

/// Session lifecycle events for the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connection state changed
    StateChanged(ConnectionState),
    /// All dependent services initialized with the current agent
    ServicesReady,
    /// Cached profile changed (`None` means setup is required or session ended)
    ProfileUpdated(Option<UserProfile>),
    /// Session ended
    Disconnected(DisconnectReason),
}
