//! Storage layer
//!
//! An abstract transactional document store with in-memory and MongoDB
//! implementations, plus the document schemas.

pub mod memory;
pub mod mongo;
pub mod schemas;
pub mod store;

pub use memory::MemoryStore;
pub use mongo::MongoStore;
pub use store::{transact, DocumentStore, Filter, Precondition, Query};
