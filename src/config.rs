//! Configuration for the bridge core
//!
//! CLI arguments and environment variable handling using clap, plus the
//! runtime [`BridgeConfig`] derived from them.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::cache::OriginalsCacheConfig;

/// Shared options for fedbridge binaries
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "fedbridge")]
    pub mongodb_db: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Parent domain of the per-protocol bridge subdomains, eg ap.brid.gy
    #[arg(long, env = "BRIDGE_DOMAIN", default_value = "brid.gy")]
    pub bridge_domain: String,

    /// TOML file describing the registered protocols
    #[arg(long, env = "PROTOCOLS_FILE", default_value = "protocols.toml")]
    pub protocols_file: PathBuf,

    /// Enable development mode (admits synthetic protocols)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Maximum process-local copy resolution entries
    #[arg(long, env = "ORIGINALS_CACHE_SIZE", default_value = "100000")]
    pub originals_cache_size: usize,

    /// Process-local copy resolution entry lifetime, in seconds
    #[arg(long, env = "ORIGINALS_LOCAL_TTL_SECS", default_value = "600")]
    pub originals_local_ttl_secs: u64,

    /// Shared copy resolution entry lifetime, in seconds
    #[arg(long, env = "ORIGINALS_SHARED_TTL_SECS", default_value = "86400")]
    pub originals_shared_ttl_secs: u64,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.bridge_domain.is_empty() || self.bridge_domain.contains('/') {
            return Err(format!("Invalid bridge domain: {:?}", self.bridge_domain));
        }
        if self.originals_cache_size == 0 {
            return Err("ORIGINALS_CACHE_SIZE must be positive".to_string());
        }
        Ok(())
    }
}

/// Runtime settings for [`crate::Bridge`]
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bridge_domain: String,

    /// Accounts younger than this are blocked by protocols that require old
    /// accounts
    pub old_account_age: chrono::Duration,

    /// Lifetime of ephemeral objects (posts, deletes, updates...)
    pub object_expire_age: chrono::Duration,

    /// Items per page when paging followers and objects
    pub page_size: usize,

    /// Attempts per transaction before a conflict is surfaced
    pub max_transaction_attempts: u32,

    pub originals: OriginalsCacheConfig,

    /// Lifetime of cached follower counts
    pub follower_count_ttl: Duration,

    /// Admit synthetic protocols into the registry
    pub allow_synthetic: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge_domain: "brid.gy".to_string(),
            old_account_age: chrono::Duration::days(14),
            object_expire_age: chrono::Duration::days(90),
            page_size: 20,
            max_transaction_attempts: 5,
            originals: OriginalsCacheConfig::default(),
            follower_count_ttl: Duration::from_secs(2 * 3600),
            allow_synthetic: false,
        }
    }
}

impl BridgeConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            bridge_domain: args.bridge_domain.clone(),
            originals: OriginalsCacheConfig {
                max_entries: args.originals_cache_size,
                local_ttl: Duration::from_secs(args.originals_local_ttl_secs),
                shared_ttl: Duration::from_secs(args.originals_shared_ttl_secs),
            },
            allow_synthetic: args.dev_mode,
            ..Default::default()
        }
    }
}
