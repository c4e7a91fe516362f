//! Metadatabase bookkeeping: the import event log, file markers, observed
//! min/max timestamps, and the merged first-seen identity history.

use first_seen::{clamp_against_existing, Candidate, Identity};
use flowsift_core::{CancelToken, FixedId};
use std::collections::HashSet;
use telemetry_store::tables::{
    self, FILES, HISTORICAL_FIRST_SEEN, IMPORTS, META_DB, MIN_MAX,
};
use telemetry_store::{Row, Store, StoreError, TableRef, Value};
use tracing::info;

pub(crate) fn meta_table(name: &str) -> Result<TableRef, StoreError> {
    TableRef::new(META_DB, name)
}

/// Paths already recorded for this dataset; re-imports skip them.
pub(crate) async fn already_imported_paths<S: Store>(
    store: &S,
    dataset: &str,
    cancel: &CancelToken,
) -> Result<HashSet<String>, StoreError> {
    let files = meta_table(FILES)?;
    let rows = store.select(&files, &[("database", Value::from(dataset))], cancel).await?;
    Ok(rows.into_iter().filter_map(|r| r.text("path").map(str::to_string)).collect())
}

/// Remove this dataset's bookkeeping ahead of a rebuild. The identity history
/// stays; it is keyed by identity, not dataset.
pub(crate) async fn clear_dataset_entries<S: Store>(
    store: &S,
    dataset: &str,
    cancel: &CancelToken,
) -> Result<(), StoreError> {
    for table in [IMPORTS, FILES, MIN_MAX] {
        let table = meta_table(table)?;
        store.delete(&table, &[("database", Value::from(dataset))], cancel).await?;
    }
    Ok(())
}

pub(crate) async fn import_started<S: Store>(
    store: &S,
    dataset: &str,
    import_id: FixedId,
    rolling: bool,
    rebuild: bool,
    started_at: i64,
    cancel: &CancelToken,
) -> Result<(), StoreError> {
    let imports = meta_table(IMPORTS)?;
    let row = Row::new()
        .with("import_id", import_id)
        .with("database", dataset)
        .with("rolling", rolling)
        .with("rebuild", rebuild)
        .with("started_at", started_at)
        .with("ended_at", 0i64);
    store.insert(&imports, vec![row], cancel).await
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn import_finished<S: Store>(
    store: &S,
    dataset: &str,
    import_id: FixedId,
    rolling: bool,
    rebuild: bool,
    started_at: i64,
    ended_at: i64,
    min_ts: i64,
    max_ts: i64,
    hours_seen: u64,
    cancel: &CancelToken,
) -> Result<(), StoreError> {
    let imports = meta_table(IMPORTS)?;
    let row = Row::new()
        .with("import_id", import_id)
        .with("database", dataset)
        .with("rolling", rolling)
        .with("rebuild", rebuild)
        .with("started_at", started_at)
        .with("ended_at", ended_at)
        .with("min_ts", min_ts)
        .with("max_ts", max_ts)
        .with("hours_seen", hours_seen);
    store.insert(&imports, vec![row], cancel).await
}

pub(crate) async fn mark_files<S: Store>(
    store: &S,
    dataset: &str,
    paths: &[String],
    import_id: FixedId,
    rolling: bool,
    now: i64,
    cancel: &CancelToken,
) -> Result<(), StoreError> {
    if paths.is_empty() {
        return Ok(());
    }
    let files = meta_table(FILES)?;
    let rows = paths
        .iter()
        .map(|path| {
            Row::new()
                .with("database", dataset)
                .with("path", path.as_str())
                .with("import_id", import_id)
                .with("rolling", rolling)
                .with("ts", now)
        })
        .collect();
    store.insert(&files, rows, cancel).await
}

pub(crate) async fn merge_min_max<S: Store>(
    store: &S,
    dataset: &str,
    min_ts: i64,
    max_ts: i64,
    cancel: &CancelToken,
) -> Result<(), StoreError> {
    let min_max = meta_table(MIN_MAX)?;
    let row = Row::new().with("database", dataset).with("min_ts", min_ts).with("max_ts", max_ts);
    store.insert(&min_max, vec![row], cancel).await
}

/// The identity columns for one candidate. FQDN identities carry the
/// unspecified address so the key stays two plain columns.
fn identity_columns(identity: &Identity) -> (String, String) {
    match identity {
        Identity::Ip(ip) => (ip.to_string(), String::new()),
        Identity::Fqdn(fqdn) => ("::".to_string(), fqdn.clone()),
    }
}

/// Merge this import's candidates into the identity history. Existing rows
/// are read first so a forward-moving first_seen is caught and clamped before
/// the write; the store's own min/max merge then keeps the result stable even
/// under concurrent imports.
pub(crate) async fn merge_first_seen<S: Store>(
    store: &S,
    candidates: Vec<Candidate>,
    cancel: &CancelToken,
) -> Result<(), StoreError> {
    if candidates.is_empty() {
        return Ok(());
    }
    let history = meta_table(HISTORICAL_FIRST_SEEN)?;
    info!(identities = candidates.len(), "merging first-seen identities");
    for mut candidate in candidates {
        let (ip, fqdn) = identity_columns(&candidate.identity);
        let existing = store
            .select_one(
                &history,
                &[("ip", Value::from(ip.as_str())), ("fqdn", Value::from(fqdn.as_str()))],
                cancel,
            )
            .await?;
        if let Some(row) = existing {
            if let (Some(first), Some(last)) = (row.i64("first_seen"), row.i64("last_seen")) {
                clamp_against_existing(&mut candidate, first, last);
            }
        }
        let row = Row::new()
            .with("ip", ip)
            .with("fqdn", fqdn)
            .with("first_seen", candidate.first_seen)
            .with("last_seen", candidate.last_seen);
        store.insert(&history, vec![row], cancel).await?;
    }
    Ok(())
}

/// Assign the retention tiers to a rolling dataset and the metadatabase.
pub(crate) async fn apply_ttls<S: Store>(
    store: &S,
    dataset: &str,
    cancel: &CancelToken,
) -> Result<(), StoreError> {
    for rule in tables::DATASET_TTL_RULES
        .iter()
        .chain([&tables::THREAT_MIXTAPE_TTL, &tables::PORT_INFO_TTL])
    {
        let table = TableRef::new(dataset, rule.table)?;
        store.set_ttl(&table, &rule.spec(), cancel).await?;
    }
    for rule in &tables::METADATA_TTL_RULES {
        let table = meta_table(rule.table)?;
        store.set_ttl(&table, &rule.spec(), cancel).await?;
    }
    Ok(())
}
