//! # Bugnest
//!
//! A multi-tenant issue tracker backend: trackers, tickets, event fan-out
//! into subscriptions and notifications, outgoing webhooks, and signed
//! tracker export/import. Usable both as a standalone binary and as a
//! library.
//!
//! ## Library Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bugnest::config::ServerConfig;
//! use bugnest::participants::{NoFederation, ParticipantResolver};
//! use bugnest::server::{AppState, create_router};
//! use bugnest::signature::HmacSigner;
//! use bugnest::store::SqliteStore;
//! use bugnest::webhooks::DeliveryQueue;
//!
//! let store = SqliteStore::new("./data/bugnest.db").unwrap();
//! store.initialize().unwrap();
//!
//! let config = ServerConfig::default();
//! let signer = Arc::new(HmacSigner::new(config.internal_key.as_bytes()));
//! let state = Arc::new(AppState::new(
//!     Arc::new(store),
//!     config,
//!     ParticipantResolver::new(Arc::new(NoFederation)),
//!     signer,
//!     DeliveryQueue::new(),
//! ));
//! let router = create_router(state);
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Builds the `bugnest` binary. Disable with `default-features = false`.

pub mod auth;
pub mod config;
pub mod dump;
pub mod error;
pub mod events;
pub mod loaders;
pub mod mentions;
pub mod ops;
pub mod participants;
pub mod server;
pub mod signature;
pub mod store;
pub mod types;
pub mod validation;
pub mod webhooks;
