use std::collections::BTreeMap;

use async_trait::async_trait;
use percent_encoding::percent_decode_str;

use crate::error::Result;
use crate::record::{RouteMatch, RouteRecord, RouteUpdate};

/// Canonical form of a stored prefix: leading `/`, no consecutive slashes,
/// no trailing slash unless the prefix is exactly `/`.
pub(crate) fn clean_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    for part in path.split('/').filter(|part| !part.is_empty()) {
        if out.len() > 1 {
            out.push('/');
        }
        out.push_str(part);
    }
    out
}

/// Full prefix normalization as applied at the edges: percent-decode once,
/// then canonicalize slashes. Comparisons against stored prefixes are
/// byte-exact after this.
pub fn normalize_prefix(raw: &str) -> String {
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    clean_path(&decoded)
}

/// Contract shared by routing-table backends.
///
/// Mutations are atomic with respect to concurrent lookups: a `get_target`
/// racing an `add`/`update`/`remove` observes the table before or after the
/// write, never mid-write.
#[async_trait]
pub trait RouteStore: Send + Sync + 'static {
    /// The record whose prefix is the longest stored prefix of `path`.
    async fn get_target(&self, path: &str) -> Result<Option<RouteMatch>>;

    /// The record stored at exactly `prefix`.
    async fn get(&self, prefix: &str) -> Result<Option<RouteRecord>>;

    /// The whole table, keyed by prefix.
    async fn get_all(&self) -> Result<BTreeMap<String, RouteRecord>>;

    /// Upsert: insert a new record, or replace the target and timestamp of an
    /// existing one while merging its metadata.
    async fn add(&self, prefix: &str, record: RouteRecord) -> Result<()>;

    /// Merge fields into an existing record. Fails with
    /// [`StoreError::NotFound`](crate::StoreError::NotFound) if absent.
    async fn update(&self, prefix: &str, update: RouteUpdate) -> Result<()>;

    /// Delete. Idempotent: removing an absent prefix is not an error.
    async fn remove(&self, prefix: &str) -> Result<()>;
}
