//! Backup Manager Library
//!
//! Snapshot, archive, off-host transfer and restore orchestration for a
//! docker compose stack made of a relational database, a key-value cache,
//! a vector store and the application services using them.

pub mod archive;
pub mod catalog;
pub mod config;
pub mod credentials;
pub mod health;
pub mod lock;
pub mod manager;
pub mod restore;
pub mod retention;
pub mod schedule;
pub mod snapshot;
pub mod stack;
pub mod summary;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
