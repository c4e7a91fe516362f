//! Retention controller: forces the merges that make TTL deletion take
//! effect.
//!
//! Aged rows linger in parts until a merge runs, so a pass walks the fixed
//! metadata table list and every dataset's sensor tables, optimizing each in
//! turn. The pass is serial on purpose: merges are the heaviest thing the
//! store does, and one at a time keeps it responsive for imports. All time
//! math happens server-side, which is why a non-UTC server is refused before
//! anything runs.

use flowsift_core::CancelToken;
use telemetry_store::tables::{META_DB, METADATA_TABLES, MIN_MAX, SENSOR_TABLES};
use telemetry_store::{Ident, Store, StoreError, TableRef};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("store clock must be UTC, server reports {0:?}")]
    NonUtcStore(String),
    #[error("{0:?} is not a metadata table")]
    UnknownMetaTable(String),
    #[error("dataset name {0:?} is not usable as a database name")]
    BadDataset(String),
    #[error("retention failed on {table}: {source}")]
    Store {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("retention pass cancelled")]
    Cancelled,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    pub metadata_tables: usize,
    pub dataset_tables: usize,
}

pub struct RetentionController<S> {
    store: S,
}

impl<S: Store> RetentionController<S> {
    pub fn new(store: S) -> Self {
        RetentionController { store }
    }

    /// Datasets the metadatabase knows about, for callers that want to run
    /// retention over everything ever imported.
    pub async fn known_datasets(
        &self,
        cancel: &CancelToken,
    ) -> Result<Vec<String>, RetentionError> {
        let min_max = meta_table(MIN_MAX)?;
        let rows = self
            .store
            .select(&min_max, &[], cancel)
            .await
            .map_err(|source| wrap(&min_max, source))?;
        let mut datasets: Vec<String> =
            rows.into_iter().filter_map(|r| r.text("database").map(str::to_string)).collect();
        datasets.sort();
        datasets.dedup();
        Ok(datasets)
    }

    /// One full pass: metadata tables in their fixed order, then every
    /// sensor table of every given dataset. `only_meta_table` restricts the
    /// metadata pass to a single table, for operators chasing one backlog.
    pub async fn run(
        &self,
        datasets: &[String],
        only_meta_table: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<RetentionReport, RetentionError> {
        let zone = self
            .store
            .server_time_zone(cancel)
            .await
            .map_err(|source| wrap_name("server_time_zone", source))?;
        if zone != "UTC" {
            return Err(RetentionError::NonUtcStore(zone));
        }

        let mut report = RetentionReport::default();
        report.metadata_tables = self.metadata_pass(only_meta_table, cancel).await?;
        for dataset in datasets {
            report.dataset_tables += self.dataset_pass(dataset, cancel).await?;
        }
        info!(
            metadata_tables = report.metadata_tables,
            dataset_tables = report.dataset_tables,
            "retention pass finished"
        );
        Ok(report)
    }

    async fn metadata_pass(
        &self,
        only: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<usize, RetentionError> {
        if let Some(name) = only {
            if !METADATA_TABLES.contains(&name) {
                return Err(RetentionError::UnknownMetaTable(name.to_string()));
            }
        }
        let mut optimized = 0;
        for name in METADATA_TABLES {
            if only.is_some_and(|o| o != name) {
                continue;
            }
            let table = meta_table(name)?;
            self.optimize(&table, cancel).await?;
            optimized += 1;
        }
        Ok(optimized)
    }

    async fn dataset_pass(
        &self,
        dataset: &str,
        cancel: &CancelToken,
    ) -> Result<usize, RetentionError> {
        let database =
            Ident::new(dataset).map_err(|_| RetentionError::BadDataset(dataset.to_string()))?;
        let mut optimized = 0;
        for name in SENSOR_TABLES {
            let table = TableRef { database: database.clone(), table: meta_ident(name)? };
            self.optimize(&table, cancel).await?;
            optimized += 1;
        }
        Ok(optimized)
    }

    async fn optimize(
        &self,
        table: &TableRef,
        cancel: &CancelToken,
    ) -> Result<(), RetentionError> {
        debug!(%table, "optimizing");
        self.store.optimize_final(table, cancel).await.map_err(|source| wrap(table, source))
    }
}

fn meta_ident(name: &str) -> Result<Ident, RetentionError> {
    Ident::new(name).map_err(|_| RetentionError::BadDataset(name.to_string()))
}

fn meta_table(name: &str) -> Result<TableRef, RetentionError> {
    TableRef::new(META_DB, name).map_err(|source| wrap_name(name, source))
}

fn wrap(table: &TableRef, source: StoreError) -> RetentionError {
    wrap_name(&table.to_string(), source)
}

fn wrap_name(table: &str, source: StoreError) -> RetentionError {
    match source {
        StoreError::Cancelled => RetentionError::Cancelled,
        other => RetentionError::Store { table: table.to_string(), source: other },
    }
}
