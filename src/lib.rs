//! # ledger-session
//!
//! Wallet and identity-provider session management for ledger-backed
//! marketplace front-ends.
//!
//! ## Overview
//!
//! `ledger-session` owns the connection to one of two alternative identity
//! providers, derives the request-signing agent remote services need,
//! persists the session across reloads, and keeps the user profile of the
//! connected principal in sync.
//!
//! ## Quick Start
//!
//! ```rust
//! use ledger_session::{
//!     MemoryIdentityProvider, MemoryKeyValueStore, MemoryUserRegistry, ServiceSet,
//!     SessionManager,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> ledger_session::Result<()> {
//! let services = ServiceSet::new(Arc::new(MemoryUserRegistry::new()));
//! let manager = SessionManager::builder(
//!     Arc::new(MemoryIdentityProvider::new("aaaaa-aa")),
//!     services,
//!     Arc::new(MemoryKeyValueStore::default()),
//! )
//! .start()
//! .await?;
//!
//! let principal = manager.connect_internet_identity().await?;
//! println!("Connected as {}", principal);
//!
//! manager.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **SessionManager** — the connection state machine
//! - **IdentityProvider / WalletExtension** — the two provider SDK seams
//! - **ServiceSet** — remote-service proxies re-initialized on every agent change
//! - **SessionPersistence** — the single persisted session record

pub mod agent;
pub mod config;
pub mod error;
pub mod manager;
pub mod navigator;
pub mod provider;
pub mod service;
pub mod store;
pub mod types;

// Re-export core types
pub use agent::{HttpAgent, SigningAgent};
pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use manager::{SessionManager, SessionManagerBuilder, WalletConnect};
pub use navigator::{LogNavigator, Navigator, RecordingNavigator};
pub use provider::{ConnectionUpdate, Identity, IdentityProvider, LoginOptions, WalletExtension};
pub use service::{MemoryProxy, MemoryUserRegistry, ServiceProxy, ServiceSet, UserRegistry};
pub use store::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, SessionPersistence};
pub use types::{
    ConnectionState, DisconnectReason, Principal, ProfileResult, ProfileUpdate, ProviderKind,
    SessionEvent, SessionRecord, SessionSnapshot, UserProfile, ANONYMOUS_PRINCIPAL,
};

// Re-export in-memory providers for convenience
pub use provider::memory::{MemoryIdentityProvider, MemoryWallet, StaticAgent, StaticIdentity};
