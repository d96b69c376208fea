//! Bridge operations
//!
//! Each module adds an `impl Bridge` block for one part of the model.

pub mod followers;
pub mod objects;
pub mod paging;
pub mod users;

pub use followers::FollowCollection;
pub use objects::ObjectFields;
pub use paging::{fetch_page, ObjectOrder, Page, PageParams};
pub use users::{UserLookup, UserOptions};
