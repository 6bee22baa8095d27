//! SQLite-backed routing table.
//!
//! One row per prefix lets several proxy processes share a table. Lookups
//! probe the ancestor prefixes of the request path from longest to shortest,
//! so no trie is held in memory and writers in other processes are picked up
//! immediately.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::{Result, StoreError};
use crate::record::{RouteMatch, RouteRecord, RouteUpdate};
use crate::store::{clean_path, RouteStore};

pub const DEFAULT_TABLE: &str = "chp_routes";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl SqliteStore {
    /// Open (or create) a database file and ensure the routes table exists.
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, table)
    }

    /// In-memory database, used by tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, DEFAULT_TABLE)
    }

    /// Accepts either a bare filesystem path or a `sqlite://`-style URL.
    pub fn from_url(url: &str, table: &str) -> Result<Self> {
        let path = url
            .strip_prefix("sqlite:///")
            .or_else(|| url.strip_prefix("sqlite://"))
            .unwrap_or(url);
        if path == ":memory:" {
            let conn = Connection::open_in_memory()?;
            return Self::with_connection(conn, table);
        }
        Self::open(path, table)
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self> {
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StoreError::Config(format!(
                "invalid table name: {table:?}"
            )));
        }

        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    prefix TEXT PRIMARY KEY,
                    target TEXT NOT NULL,
                    last_activity TEXT NOT NULL,
                    data TEXT NOT NULL
                )"
            ),
            [],
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_string(),
        };
        for (prefix, record) in store.load_all()? {
            info!(%prefix, target = %record.target, "restoring route");
        }
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Config("connection lock poisoned".to_string()))
    }

    fn load_all(&self) -> Result<BTreeMap<String, RouteRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT prefix, target, last_activity, data FROM {} ORDER BY prefix",
            self.table
        ))?;
        let rows = stmt.query_map([], row_to_entry)?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (prefix, record) = row?;
            let record = record?;
            out.insert(prefix, record);
        }
        Ok(out)
    }

    fn select(conn: &Connection, table: &str, prefix: &str) -> Result<Option<RouteRecord>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT prefix, target, last_activity, data FROM {table} WHERE prefix = ?1"
                ),
                params![prefix],
                row_to_entry,
            )
            .optional()?;
        match row {
            Some((_, record)) => Ok(Some(record?)),
            None => Ok(None),
        }
    }

    fn write(conn: &Connection, table: &str, prefix: &str, record: &RouteRecord) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO {table} (prefix, target, last_activity, data)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(prefix) DO UPDATE SET
                     target = excluded.target,
                     last_activity = excluded.last_activity,
                     data = excluded.data"
            ),
            params![
                prefix,
                record.target,
                record
                    .last_activity
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
                serde_json::to_string(&record.data)?,
            ],
        )?;
        Ok(())
    }
}

type RawEntry = (String, serde_json::Result<RouteRecord>);

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    let prefix: String = row.get(0)?;
    let target: String = row.get(1)?;
    let last_activity: String = row.get(2)?;
    let data: String = row.get(3)?;

    let record = parse_record(&target, &last_activity, &data);
    Ok((prefix, record))
}

fn parse_record(
    target: &str,
    last_activity: &str,
    data: &str,
) -> serde_json::Result<RouteRecord> {
    let last_activity = DateTime::parse_from_rfc3339(last_activity)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Ok(RouteRecord {
        target: target.to_string(),
        last_activity,
        data: serde_json::from_str(data)?,
    })
}

/// Ancestor prefixes of a cleaned path, longest first, ending with `/`.
fn candidate_prefixes(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = path.to_string();
    while current != "/" {
        out.push(current.clone());
        match current.rfind('/') {
            Some(0) | None => break,
            Some(idx) => current.truncate(idx),
        }
    }
    out.push("/".to_string());
    out
}

#[async_trait]
impl RouteStore for SqliteStore {
    async fn get_target(&self, path: &str) -> Result<Option<RouteMatch>> {
        let path = clean_path(path);
        let conn = self.lock()?;
        for prefix in candidate_prefixes(&path) {
            if let Some(record) = Self::select(&conn, &self.table, &prefix)? {
                return Ok(Some(RouteMatch { prefix, record }));
            }
        }
        Ok(None)
    }

    async fn get(&self, prefix: &str) -> Result<Option<RouteRecord>> {
        let conn = self.lock()?;
        Self::select(&conn, &self.table, &clean_path(prefix))
    }

    async fn get_all(&self) -> Result<BTreeMap<String, RouteRecord>> {
        self.load_all()
    }

    async fn add(&self, prefix: &str, record: RouteRecord) -> Result<()> {
        let prefix = clean_path(prefix);
        let conn = self.lock()?;
        let merged = match Self::select(&conn, &self.table, &prefix)? {
            Some(mut existing) => {
                existing.absorb(record);
                existing
            }
            None => record,
        };
        Self::write(&conn, &self.table, &prefix, &merged)
    }

    async fn update(&self, prefix: &str, update: RouteUpdate) -> Result<()> {
        let prefix = clean_path(prefix);
        let conn = self.lock()?;
        let mut record = Self::select(&conn, &self.table, &prefix)?
            .ok_or_else(|| StoreError::NotFound(prefix.clone()))?;
        record.apply(update);
        Self::write(&conn, &self.table, &prefix, &record)
    }

    async fn remove(&self, prefix: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!("DELETE FROM {} WHERE prefix = ?1", self.table),
            params![clean_path(prefix)],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(target: &str) -> RouteRecord {
        RouteRecord::new(target, Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    #[test]
    fn candidate_prefixes_walk_up_to_root() {
        assert_eq!(
            candidate_prefixes("/a/b/c"),
            vec!["/a/b/c", "/a/b", "/a", "/"]
        );
        assert_eq!(candidate_prefixes("/"), vec!["/"]);
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let store = SqliteStore::in_memory().unwrap();

        let rec = record("http://127.0.0.1:9000")
            .with_data(json!({"user": "dana"}).as_object().unwrap().clone());
        store.add("/user/dana", rec).await.unwrap();

        let loaded = store.get("/user/dana").await.unwrap().unwrap();
        assert_eq!(loaded.target, "http://127.0.0.1:9000");
        assert_eq!(loaded.data["user"], "dana");

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);

        store.remove("/user/dana").await.unwrap();
        assert!(store.get("/user/dana").await.unwrap().is_none());
        store.remove("/user/dana").await.unwrap();
    }

    #[tokio::test]
    async fn get_target_walks_ancestors() {
        let store = SqliteStore::in_memory().unwrap();
        store.add("/", record("http://root")).await.unwrap();
        store.add("/user/abc", record("http://b")).await.unwrap();

        let hit = store.get_target("/user/abc/page").await.unwrap().unwrap();
        assert_eq!(hit.prefix, "/user/abc");

        let hit = store.get_target("/user/xyz").await.unwrap().unwrap();
        assert_eq!(hit.prefix, "/");

        store.remove("/").await.unwrap();
        assert!(store.get_target("/nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn add_merges_existing_data() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .add(
                "/route",
                record("http://a").with_data(json!({"keep": 1}).as_object().unwrap().clone()),
            )
            .await
            .unwrap();
        store.add("/route", record("http://b")).await.unwrap();

        let merged = store.get("/route").await.unwrap().unwrap();
        assert_eq!(merged.target, "http://b");
        assert_eq!(merged.data["keep"], 1);
    }

    #[tokio::test]
    async fn update_missing_route_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .update("/missing", RouteUpdate::activity(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn routes_survive_reopen() {
        let path = std::env::temp_dir().join(format!(
            "routetable-test-{}-{}.sqlite",
            std::process::id(),
            line!()
        ));
        let _ = std::fs::remove_file(&path);

        {
            let store = SqliteStore::open(&path, DEFAULT_TABLE).unwrap();
            store.add("/persist", record("http://a")).await.unwrap();
        }

        let store = SqliteStore::open(&path, DEFAULT_TABLE).unwrap();
        let loaded = store.get("/persist").await.unwrap().unwrap();
        assert_eq!(loaded.target, "http://a");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rejects_suspicious_table_names() {
        let conn = Connection::open_in_memory().unwrap();
        let err = SqliteStore::with_connection(conn, "routes; DROP TABLE x").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }
}
