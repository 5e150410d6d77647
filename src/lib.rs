//! # Plover 📷
//!
//! A terminal photo-feed client for Bluesky.
//!
//! ## Overview
//!
//! Plover browses, posts, likes, and searches image posts on the AT
//! Protocol network. Multiple accounts can stay logged in at once; token
//! rotation and session resumption are handled by the session core.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          CLI                                │
//! │   Parses commands, prints feeds, subscribes to session      │
//! │   events for "session expired" notices                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SessionManager                          │
//! │  • account registry (login order, one current account)      │
//! │  • token freshness: refresh at 90 min, purge at 50 days     │
//! │  • per-DID refresh coalescing, background refresh task      │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐ ┌─────────────────┐
//! │  SessionStore   │ │  AgentFactory   │ │    EventBus     │
//! │                 │ │                 │ │                 │
//! │ • encrypted     │ │ • login/refresh │ │ • session-      │
//! │   single record │ │ • bind Agent    │ │   dropped       │
//! │ • atomic writes │ │ • AtpGateway    │ │ • account-      │
//! │                 │ │   (HTTP seam)   │ │   changed       │
//! └─────────────────┘ └─────────────────┘ └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`api`] — AT Protocol XRPC client and the [`api::AtpGateway`] seam
//! - [`config`] — Configuration management
//! - [`error`] — Session error taxonomy
//! - [`events`] — Session event bus
//! - [`models`] — Data models (AccountCredential, PhotoPost)
//! - [`session`] — Multi-account session manager
//! - [`store`] — Encrypted credential persistence

#![doc(html_root_url = "https://docs.rs/plover/0.2.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::return_self_not_must_use)]

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod paths;
pub mod session;
pub mod store;

// Re-export main types for convenience
pub use api::{Agent, AgentFactory, AtpGateway, BlueskyGateway, DEFAULT_SERVICE};
pub use config::Config;
pub use error::SessionError;
pub use events::{EventBus, EventKind, SessionEvent, Subscription};
pub use models::{AccountCredential, PhotoPost};
pub use session::SessionManager;
pub use store::{SessionStore, StoreSnapshot};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
