//! Caching
//!
//! A shared TTL cache collaborator and the copy -> original resolution cache
//! layered on top of it.

pub mod originals;
pub mod shared;

pub use originals::{OriginalsCache, OriginalsCacheConfig, OriginalsStatsSnapshot};
pub use shared::{MemorySharedCache, SharedCache};
