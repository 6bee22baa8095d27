//! Route lookup façade over the store.
//!
//! Thin coordinator between the HTTP surfaces and the storage backend:
//! normalizes paths, performs longest-prefix lookups, and records per-route
//! activity without ever blocking request dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{info, warn};

use routetable::{normalize_prefix, RouteMatch, RouteRecord, RouteStore, RouteUpdate};

use crate::error::ServerResult;

#[derive(Clone)]
pub struct RouteTable {
    store: Arc<dyn RouteStore>,
}

impl RouteTable {
    pub fn new(store: Arc<dyn RouteStore>) -> Self {
        Self { store }
    }

    pub async fn add_route(
        &self,
        path: &str,
        target: String,
        data: Map<String, Value>,
    ) -> ServerResult<()> {
        let prefix = normalize_prefix(path);
        info!(%prefix, %target, "adding route");
        let record = RouteRecord::new(target, Utc::now()).with_data(data);
        self.store.add(&prefix, record).await?;
        Ok(())
    }

    pub async fn remove_route(&self, path: &str) -> ServerResult<()> {
        let prefix = normalize_prefix(path);
        info!(%prefix, "removing route");
        self.store.remove(&prefix).await?;
        Ok(())
    }

    pub async fn get_route(&self, path: &str) -> ServerResult<Option<RouteRecord>> {
        Ok(self.store.get(&normalize_prefix(path)).await?)
    }

    /// The whole table, optionally filtered to routes idle since before the
    /// given instant.
    pub async fn get_routes(
        &self,
        inactive_since: Option<DateTime<Utc>>,
    ) -> ServerResult<BTreeMap<String, RouteRecord>> {
        let mut routes = self.store.get_all().await?;
        if let Some(cutoff) = inactive_since {
            routes.retain(|_, record| record.last_activity < cutoff);
        }
        Ok(routes)
    }

    /// Longest-prefix match for an already percent-decoded request path.
    pub async fn target_for_path(&self, path: &str) -> ServerResult<Option<RouteMatch>> {
        Ok(self.store.get_target(path).await?)
    }

    /// Record activity on a route. Fire-and-forget: the update runs on its
    /// own task and a failure is logged, never surfaced.
    pub fn touch(&self, prefix: &str) {
        let store = Arc::clone(&self.store);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            if let Err(err) = store
                .update(&prefix, RouteUpdate::activity(Utc::now()))
                .await
            {
                warn!(%prefix, %err, "failed to record route activity");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use routetable::MemoryStore;
    use serde_json::json;

    fn table() -> (Arc<MemoryStore>, RouteTable) {
        let store = Arc::new(MemoryStore::new());
        let routes = RouteTable::new(Arc::clone(&store) as Arc<dyn RouteStore>);
        (store, routes)
    }

    #[tokio::test]
    async fn add_route_normalizes_and_stamps_activity() {
        let (_, routes) = table();
        routes
            .add_route("/%2Fhello/", "http://127.0.0.1:9002".to_string(), Map::new())
            .await
            .unwrap();

        let record = routes.get_route("/hello").await.unwrap().unwrap();
        assert_eq!(record.target, "http://127.0.0.1:9002");
    }

    #[tokio::test]
    async fn inactive_since_filters_by_activity() {
        let (store, routes) = table();
        let t1 = Utc.timestamp_opt(1_000, 0).unwrap();
        let t2 = Utc.timestamp_opt(2_000, 0).unwrap();
        let t3 = Utc.timestamp_opt(3_000, 0).unwrap();
        for (prefix, stamp) in [("/one", t1), ("/two", t2), ("/three", t3)] {
            store
                .add(prefix, RouteRecord::new("http://t", stamp))
                .await
                .unwrap();
        }

        let idle = routes.get_routes(Some(t2)).await.unwrap();
        assert_eq!(idle.len(), 1);
        assert!(idle.contains_key("/one"));

        let all = routes.get_routes(None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn touch_is_lossy_but_lands() {
        let (store, routes) = table();
        let old = Utc.timestamp_opt(1_000, 0).unwrap();
        store
            .add("/busy", RouteRecord::new("http://t", old))
            .await
            .unwrap();

        routes.touch("/busy");
        // Touching a missing route only logs.
        routes.touch("/missing");

        // The spawned update is async; poll until it lands.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            let record = store.get("/busy").await.unwrap().unwrap();
            if record.last_activity > old {
                return;
            }
        }
        panic!("activity update never landed");
    }

    #[tokio::test]
    async fn data_round_trips_through_add() {
        let (_, routes) = table();
        let data = json!({"user": "dana", "server_name": "nb-1"})
            .as_object()
            .unwrap()
            .clone();
        routes
            .add_route("/user/dana", "http://t".to_string(), data.clone())
            .await
            .unwrap();

        let record = routes.get_route("/user/dana").await.unwrap().unwrap();
        assert_eq!(record.data, data);
    }
}
