//! fedbridge - identity and activity model for a federation bridge
//!
//! Users, posts and follows from one decentralized social protocol are
//! mirrored into others. This crate keeps track of who and what has been
//! bridged where.
//!
//! ## Components
//!
//! - **Protocol registry**: descriptors for every protocol, id ownership and
//!   bridge subdomains
//! - **Users**: get-or-create with copy propagation, opt-out status, enable
//!   and disable per protocol
//! - **Objects**: authorized get-or-create, validation, copy id resolution
//! - **Followers**: cross-protocol edges with cursor paging
//! - **Originals cache**: copy id to original lookups, two cache layers deep

pub mod as1;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod db;
pub mod keys;
pub mod logging;
pub mod notify;
pub mod protocol;
pub mod services;
pub mod types;

pub use bridge::Bridge;
pub use config::{Args, BridgeConfig};
pub use types::{BridgeError, Result};
