//! In-memory reference store.
//!
//! Mirrors the merge behaviour the engine relies on server-side: min/max
//! collapse for aggregating tables happens on insert, TTL deletion happens
//! only when a merge is forced via `optimize_final`. The clock is injectable
//! and advanceable so retention tests can move time without sleeping.

use crate::{
    check_cancel, tables, Filters, Ident, Row, Store, StoreError, TableRef, TtlSpec, TtlUnit,
    Value,
};
use flowsift_core::CancelToken;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Seeded server clock so tests are deterministic without configuration.
const DEFAULT_NOW: i64 = 1_700_000_000;

#[derive(Debug, Default)]
struct MemTable {
    rows: Vec<Row>,
    ttl: Option<TtlSpec>,
}

#[derive(Debug)]
struct Inner {
    now: i64,
    time_zone: String,
    databases: BTreeMap<String, BTreeMap<String, MemTable>>,
}

#[derive(Debug, Clone)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore {
            inner: Arc::new(Mutex::new(Inner {
                now: DEFAULT_NOW,
                time_zone: "UTC".to_string(),
                databases: BTreeMap::new(),
            })),
        }
    }

    pub async fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock().await;
        inner.now += by.as_secs() as i64;
    }

    pub async fn set_now(&self, now: i64) {
        self.inner.lock().await.now = now;
    }

    pub async fn now(&self) -> i64 {
        self.inner.lock().await.now
    }

    pub async fn set_time_zone(&self, zone: &str) {
        self.inner.lock().await.time_zone = zone.to_string();
    }

    /// Row count without touching TTL state.
    pub async fn count(&self, table: &TableRef) -> usize {
        let inner = self.inner.lock().await;
        inner
            .databases
            .get(table.database.as_str())
            .and_then(|db| db.get(table.table.as_str()))
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }
}

/// Equality that treats Int and UInt carrying the same number as equal, the
/// way a column read back through JSON may flip signedness.
fn values_eq(a: &Value, b: &Value) -> bool {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn matches(row: &Row, filters: Filters<'_>) -> bool {
    filters.iter().all(|(col, want)| row.get(col).is_some_and(|have| values_eq(have, want)))
}

fn merge_insert(table_name: &str, table: &mut MemTable, rows: Vec<Row>) {
    match tables::merge_for(table_name) {
        tables::MergeKind::Append => table.rows.extend(rows),
        tables::MergeKind::MinMax { keys, min_col, max_col } => {
            for row in rows {
                let existing = table.rows.iter_mut().find(|have| {
                    keys.iter().all(|k| match (have.get(k), row.get(k)) {
                        (Some(a), Some(b)) => values_eq(a, b),
                        (None, None) => true,
                        _ => false,
                    })
                });
                match existing {
                    Some(have) => {
                        if let (Some(old), Some(new)) = (have.i64(min_col), row.i64(min_col)) {
                            have.set(min_col, old.min(new));
                        }
                        if let (Some(old), Some(new)) = (have.i64(max_col), row.i64(max_col)) {
                            have.set(max_col, old.max(new));
                        }
                    }
                    None => table.rows.push(row),
                }
            }
        }
    }
}

fn apply_ttl(now: i64, table: &mut MemTable) {
    let Some(ttl) = table.ttl.clone() else {
        return;
    };
    let (now_units, max_age_units) = match ttl.unit {
        TtlUnit::Seconds => (now, ttl.max_age.as_secs() as i64),
        TtlUnit::Micros => (now * 1_000_000, ttl.max_age.as_micros() as i64),
    };
    table.rows.retain(|row| {
        let Some(stamp) = row.i64(ttl.column) else {
            return true;
        };
        if ttl.only_rolling && row.bool("rolling") != Some(true) {
            return true;
        }
        now_units - stamp <= max_age_units
    });
}

impl Inner {
    fn table_mut(&mut self, table: &TableRef) -> Result<&mut MemTable, StoreError> {
        let db = self
            .databases
            .get_mut(table.database.as_str())
            .ok_or_else(|| StoreError::Fatal(format!("unknown database {}", table.database)))?;
        Ok(db.entry(table.table.as_str().to_string()).or_default())
    }
}

impl Store for MemStore {
    async fn create_database(
        &self,
        database: &Ident,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        check_cancel(cancel)?;
        let mut inner = self.inner.lock().await;
        inner.databases.entry(database.as_str().to_string()).or_default();
        Ok(())
    }

    async fn drop_database(
        &self,
        database: &Ident,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        check_cancel(cancel)?;
        let mut inner = self.inner.lock().await;
        inner.databases.remove(database.as_str());
        Ok(())
    }

    async fn database_exists(
        &self,
        database: &Ident,
        cancel: &CancelToken,
    ) -> Result<bool, StoreError> {
        check_cancel(cancel)?;
        let inner = self.inner.lock().await;
        Ok(inner.databases.contains_key(database.as_str()))
    }

    async fn insert(
        &self,
        table: &TableRef,
        rows: Vec<Row>,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        check_cancel(cancel)?;
        let mut inner = self.inner.lock().await;
        let mem = inner.table_mut(table)?;
        merge_insert(table.table.as_str(), mem, rows);
        Ok(())
    }

    async fn select(
        &self,
        table: &TableRef,
        filters: Filters<'_>,
        cancel: &CancelToken,
    ) -> Result<Vec<Row>, StoreError> {
        check_cancel(cancel)?;
        let mut inner = self.inner.lock().await;
        let mem = inner.table_mut(table)?;
        Ok(mem.rows.iter().filter(|r| matches(r, filters)).cloned().collect())
    }

    async fn select_one(
        &self,
        table: &TableRef,
        filters: Filters<'_>,
        cancel: &CancelToken,
    ) -> Result<Option<Row>, StoreError> {
        let rows = self.select(table, filters, cancel).await?;
        Ok(rows.into_iter().next())
    }

    async fn delete(
        &self,
        table: &TableRef,
        filters: Filters<'_>,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        check_cancel(cancel)?;
        let mut inner = self.inner.lock().await;
        let mem = inner.table_mut(table)?;
        mem.rows.retain(|r| !matches(r, filters));
        Ok(())
    }

    async fn set_ttl(
        &self,
        table: &TableRef,
        ttl: &TtlSpec,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        check_cancel(cancel)?;
        let mut inner = self.inner.lock().await;
        let mem = inner.table_mut(table)?;
        mem.ttl = Some(ttl.clone());
        Ok(())
    }

    async fn optimize_final(
        &self,
        table: &TableRef,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        check_cancel(cancel)?;
        let mut inner = self.inner.lock().await;
        let now = inner.now;
        let mem = inner.table_mut(table)?;
        apply_ttl(now, mem);
        Ok(())
    }

    async fn server_now(&self, cancel: &CancelToken) -> Result<i64, StoreError> {
        check_cancel(cancel)?;
        Ok(self.inner.lock().await.now)
    }

    async fn server_time_zone(&self, cancel: &CancelToken) -> Result<String, StoreError> {
        check_cancel(cancel)?;
        Ok(self.inner.lock().await.time_zone.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{FILES, HISTORICAL_FIRST_SEEN, META_DB};

    fn meta(table: &str) -> TableRef {
        TableRef::new(META_DB, table).unwrap()
    }

    async fn fresh() -> (MemStore, CancelToken) {
        let store = MemStore::new();
        let cancel = CancelToken::new();
        store.create_database(&Ident::new(META_DB).unwrap(), &cancel).await.unwrap();
        (store, cancel)
    }

    #[tokio::test]
    async fn insert_select_with_filters() {
        let (store, cancel) = fresh().await;
        let files = meta(FILES);
        store
            .insert(
                &files,
                vec![
                    Row::new().with("database", "sensor1").with("path", "/a/conn.log"),
                    Row::new().with("database", "sensor2").with("path", "/b/conn.log"),
                ],
                &cancel,
            )
            .await
            .unwrap();
        let got = store
            .select(&files, &[("database", Value::from("sensor1"))], &cancel)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].text("path"), Some("/a/conn.log"));
    }

    #[tokio::test]
    async fn first_seen_rows_collapse_to_min_max() {
        let (store, cancel) = fresh().await;
        let hfs = meta(HISTORICAL_FIRST_SEEN);
        let row = |first: i64, last: i64| {
            Row::new()
                .with("ip", "::")
                .with("fqdn", "www.example.com")
                .with("first_seen", first)
                .with("last_seen", last)
        };
        store.insert(&hfs, vec![row(500, 500)], &cancel).await.unwrap();
        store.insert(&hfs, vec![row(100, 900)], &cancel).await.unwrap();
        store.insert(&hfs, vec![row(300, 300)], &cancel).await.unwrap();

        let got = store.select(&hfs, &[], &cancel).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].i64("first_seen"), Some(100));
        assert_eq!(got[0].i64("last_seen"), Some(900));
    }

    #[tokio::test]
    async fn distinct_identities_do_not_collapse() {
        let (store, cancel) = fresh().await;
        let hfs = meta(HISTORICAL_FIRST_SEEN);
        store
            .insert(
                &hfs,
                vec![
                    Row::new().with("ip", "10.0.0.1").with("fqdn", "").with("first_seen", 1i64).with("last_seen", 1i64),
                    Row::new().with("ip", "").with("fqdn", "a.test").with("first_seen", 1i64).with("last_seen", 1i64),
                ],
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(store.select(&hfs, &[], &cancel).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn ttl_takes_effect_only_at_optimize() {
        let (store, cancel) = fresh().await;
        let table = meta("imports");
        let now = store.now().await;
        store
            .insert(&table, vec![Row::new().with("started_at", now)], &cancel)
            .await
            .unwrap();
        store
            .set_ttl(
                &table,
                &TtlSpec {
                    column: "started_at",
                    unit: TtlUnit::Seconds,
                    max_age: Duration::from_secs(3600),
                    only_rolling: false,
                },
                &cancel,
            )
            .await
            .unwrap();

        store.advance(Duration::from_secs(7200)).await;
        // expired but not yet merged out
        assert_eq!(store.count(&table).await, 1);
        store.optimize_final(&table, &cancel).await.unwrap();
        assert_eq!(store.count(&table).await, 0);
    }

    #[tokio::test]
    async fn rolling_restriction_spares_non_rolling_rows() {
        let (store, cancel) = fresh().await;
        let files = meta(FILES);
        let now = store.now().await;
        store
            .insert(
                &files,
                vec![
                    Row::new().with("path", "/r/conn.log").with("ts", now).with("rolling", true),
                    Row::new().with("path", "/n/conn.log").with("ts", now).with("rolling", false),
                ],
                &cancel,
            )
            .await
            .unwrap();
        store
            .set_ttl(
                &files,
                &TtlSpec {
                    column: "ts",
                    unit: TtlUnit::Seconds,
                    max_age: Duration::from_secs(60),
                    only_rolling: true,
                },
                &cancel,
            )
            .await
            .unwrap();
        store.advance(Duration::from_secs(600)).await;
        store.optimize_final(&files, &cancel).await.unwrap();

        let left = store.select(&files, &[], &cancel).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].text("path"), Some("/n/conn.log"));
    }

    #[tokio::test]
    async fn micros_columns_age_in_micros() {
        let (store, cancel) = fresh().await;
        let table = meta("threat_mixtape");
        let now = store.now().await;
        store
            .insert(
                &table,
                vec![Row::new().with("analyzed_at", now * 1_000_000)],
                &cancel,
            )
            .await
            .unwrap();
        store
            .set_ttl(
                &table,
                &TtlSpec {
                    column: "analyzed_at",
                    unit: TtlUnit::Micros,
                    max_age: Duration::from_secs(100),
                    only_rolling: false,
                },
                &cancel,
            )
            .await
            .unwrap();
        store.advance(Duration::from_secs(50)).await;
        store.optimize_final(&table, &cancel).await.unwrap();
        assert_eq!(store.count(&table).await, 1);
        store.advance(Duration::from_secs(100)).await;
        store.optimize_final(&table, &cancel).await.unwrap();
        assert_eq!(store.count(&table).await, 0);
    }

    #[tokio::test]
    async fn cancelled_token_surfaces_as_cancelled() {
        let (store, cancel) = fresh().await;
        cancel.cancel();
        let err = store.server_now(&cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unknown_database_is_fatal() {
        let store = MemStore::new();
        let cancel = CancelToken::new();
        let table = TableRef::new("nope", "conn").unwrap();
        let err = store.select(&table, &[], &cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::Fatal(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn drop_database_removes_everything() {
        let (store, cancel) = fresh().await;
        let db = Ident::new("sensor1").unwrap();
        store.create_database(&db, &cancel).await.unwrap();
        let conn = TableRef::new("sensor1", "conn").unwrap();
        store.insert(&conn, vec![Row::new().with("ts", 1i64)], &cancel).await.unwrap();
        store.drop_database(&db, &cancel).await.unwrap();
        assert!(!store.database_exists(&db, &cancel).await.unwrap());
        assert!(store.select(&conn, &[], &cancel).await.is_err());
    }
}
