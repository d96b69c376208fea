//! Shared types

mod error;

pub use error::{BridgeError, Result};
