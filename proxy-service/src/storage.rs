//! Storage backend registry.
//!
//! The configuration names a backend by short identifier; each registered
//! factory constructs a store satisfying the [`RouteStore`] contract. The
//! built-in set covers `memory` and `database`; embedders may register
//! additional factories under their own names. No runtime code loading.

use std::collections::HashMap;
use std::sync::Arc;

use routetable::{MemoryStore, RouteStore, SqliteStore};

use crate::error::{ServerError, ServerResult};

pub const DATABASE_URL_ENV: &str = "CHP_DATABASE_URL";
pub const DATABASE_TABLE_ENV: &str = "CHP_DATABASE_TABLE";

const DEFAULT_DATABASE_URL: &str = "sqlite:///chp.sqlite";

pub type StoreFactory = Box<dyn Fn() -> ServerResult<Arc<dyn RouteStore>> + Send + Sync>;

pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Registry pre-populated with the built-in backends.
    pub fn builtin() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("memory", || Ok(Arc::new(MemoryStore::new())));
        registry.register("database", || {
            let url = std::env::var(DATABASE_URL_ENV)
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
            let table = std::env::var(DATABASE_TABLE_ENV)
                .unwrap_or_else(|_| routetable::sqlite::DEFAULT_TABLE.to_string());
            let store = SqliteStore::from_url(&url, &table)?;
            Ok(Arc::new(store))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> ServerResult<Arc<dyn RouteStore>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn build(&self, name: &str) -> ServerResult<Arc<dyn RouteStore>> {
        match self.factories.get(name) {
            Some(factory) => factory(),
            None => Err(ServerError::Config(format!(
                "unknown storage backend: {name}"
            ))),
        }
    }
}
