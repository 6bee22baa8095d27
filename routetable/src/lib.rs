//! Prefix-keyed routing table.
//!
//! A routing table maps normalized URL path prefixes to route records
//! (upstream target, activity timestamp, caller-supplied metadata). Lookups
//! select the longest stored prefix that covers a request path. Two backends
//! implement the [`RouteStore`] contract: an in-memory trie and a SQLite
//! table for tables shared across processes.

pub mod error;
pub mod memory;
pub mod record;
pub mod sqlite;
pub mod store;
pub mod trie;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use record::{RouteMatch, RouteRecord, RouteUpdate};
pub use sqlite::SqliteStore;
pub use store::{normalize_prefix, RouteStore};
pub use trie::UrlTrie;
