use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::record::{RouteMatch, RouteRecord, RouteUpdate};
use crate::store::{clean_path, RouteStore};
use crate::trie::UrlTrie;

/// In-memory routing table backed by a URL trie behind a read/write lock.
#[derive(Default)]
pub struct MemoryStore {
    routes: RwLock<UrlTrie<RouteRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RouteStore for MemoryStore {
    async fn get_target(&self, path: &str) -> Result<Option<RouteMatch>> {
        let routes = self.routes.read().await;
        Ok(routes.get(path).map(|(prefix, record)| RouteMatch {
            prefix: prefix.to_string(),
            record: record.clone(),
        }))
    }

    async fn get(&self, prefix: &str) -> Result<Option<RouteRecord>> {
        let routes = self.routes.read().await;
        Ok(routes.get_exact(&clean_path(prefix)).cloned())
    }

    async fn get_all(&self) -> Result<BTreeMap<String, RouteRecord>> {
        let routes = self.routes.read().await;
        Ok(routes
            .entries()
            .into_iter()
            .map(|(prefix, record)| (prefix.to_string(), record.clone()))
            .collect())
    }

    async fn add(&self, prefix: &str, record: RouteRecord) -> Result<()> {
        let prefix = clean_path(prefix);
        let mut routes = self.routes.write().await;
        match routes.get_exact_mut(&prefix) {
            Some(existing) => existing.absorb(record),
            None => routes.add(&prefix, record),
        }
        Ok(())
    }

    async fn update(&self, prefix: &str, update: RouteUpdate) -> Result<()> {
        let prefix = clean_path(prefix);
        let mut routes = self.routes.write().await;
        match routes.get_exact_mut(&prefix) {
            Some(record) => {
                record.apply(update);
                Ok(())
            }
            None => Err(crate::StoreError::NotFound(prefix)),
        }
    }

    async fn remove(&self, prefix: &str) -> Result<()> {
        let mut routes = self.routes.write().await;
        routes.remove(&clean_path(prefix));
        Ok(())
    }
}
