//! Document schemas
//!
//! Users, objects and follower edges, plus the value types embedded in them.

pub mod follower;
pub mod metadata;
pub mod object;
pub mod target;
pub mod user;

pub use follower::{Follower, FollowerFields, FollowerStatus, FOLLOWER_COLLECTION};
pub use metadata::Metadata;
pub use object::{Content, FeedArchive, FeedFormat, Object, WireFormat, OBJECT_COLLECTION};
pub use target::{DmKind, SentDm, Target};
pub use user::{KeyMaterial, User, UserKey, UserStatus, USER_COLLECTION};
