//! Import pipeline: log directory in, populated dataset out.
//!
//! One run streams every recognised log file through the topology filter,
//! correlates records by UID, shapes rows for the raw tables and rollup
//! views, and writes them through a fixed pool of batching writers with
//! bounded-queue back-pressure. Bookkeeping lands in the metadatabase when
//! the stream completes. A failed run leaves partial rows behind on purpose;
//! retention reconciles them.

mod format;
mod meta;

pub use format::ImportStamp;

use first_seen::FirstSeenTracker;
use flow_filter::Filter;
use flowsift_core::{backoff::Retry, CancelToken, FixedId, FixedIdError, Stage};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use telemetry_store::tables::META_DB;
use telemetry_store::{Ident, Row, Store, StoreError, TableRef};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uid_correlate::Correlator;
use zeek_reader::{LogFile, ReadError, Record};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("dataset name {0:?} is not usable as a database name")]
    BadDataset(String),
    #[error("no recognised log files in {}", .0.display())]
    NoLogFiles(PathBuf),
    #[error("every log file was already imported into dataset {0}")]
    AllFilesPreviouslyImported(String),
    #[error("store clock must be UTC, server reports {0:?}")]
    NonUtcStore(String),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("could not derive import id: {0}")]
    Id(#[from] FixedIdError),
    #[error("{stage} stage failed for dataset {dataset}: {source}")]
    Store {
        dataset: String,
        stage: Stage,
        #[source]
        source: StoreError,
    },
    #[error("import cancelled")]
    Cancelled,
}

/// Pipeline tuning. The defaults suit a local store; rolling imports on a
/// schedule usually shrink `batch_size` and grow `writers`.
#[derive(Debug, Clone, Copy)]
pub struct ImportOptions {
    pub batch_size: usize,
    pub writers: usize,
    pub queue_depth: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        ImportOptions { batch_size: 1000, writers: 4, queue_depth: 64 }
    }
}

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub dir: PathBuf,
    pub dataset: String,
    /// Start of the run in unix microseconds; hashes into the import id and
    /// stamps every row.
    pub import_time_micros: i64,
    pub rolling: bool,
    pub rebuild: bool,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub import_id: FixedId,
    pub files_imported: usize,
    pub records_written: u64,
    pub parse_errors: u64,
    pub min_ts: i64,
    pub max_ts: i64,
    pub hours_seen: u64,
}

struct Batch {
    table: &'static str,
    rows: Vec<Row>,
}

fn store_stage(dataset: &str, stage: Stage, err: StoreError) -> ImportError {
    match err {
        StoreError::Cancelled => ImportError::Cancelled,
        other => ImportError::Store { dataset: dataset.to_string(), stage, source: other },
    }
}

pub async fn run_import<S: Store>(
    store: Arc<S>,
    filter: Arc<Filter>,
    request: ImportRequest,
    opts: ImportOptions,
    cancel: CancelToken,
) -> Result<ImportSummary, ImportError> {
    let dataset = request.dataset.clone();
    let dataset_id = Ident::new(&dataset).map_err(|_| ImportError::BadDataset(dataset.clone()))?;
    if dataset == META_DB || dataset == "system" {
        return Err(ImportError::BadDataset(dataset));
    }

    let wrap = |stage: Stage| {
        let dataset = dataset.clone();
        move |err: StoreError| store_stage(&dataset, stage, err)
    };

    let zone = store.server_time_zone(&cancel).await.map_err(wrap(Stage::Write))?;
    if zone != "UTC" {
        return Err(ImportError::NonUtcStore(zone));
    }

    let meta_id = Ident::new(META_DB).map_err(|_| ImportError::BadDataset(META_DB.into()))?;
    store.create_database(&meta_id, &cancel).await.map_err(wrap(Stage::Write))?;

    if request.rebuild {
        info!(dataset = %dataset, "rebuild requested, dropping dataset");
        store.drop_database(&dataset_id, &cancel).await.map_err(wrap(Stage::Write))?;
        meta::clear_dataset_entries(store.as_ref(), &dataset, &cancel)
            .await
            .map_err(wrap(Stage::Write))?;
    }
    store.create_database(&dataset_id, &cancel).await.map_err(wrap(Stage::Write))?;

    if request.rolling {
        meta::apply_ttls(store.as_ref(), &dataset, &cancel).await.map_err(wrap(Stage::Write))?;
    }

    let all_files = zeek_reader::scan_dir(&request.dir)?;
    if all_files.is_empty() {
        return Err(ImportError::NoLogFiles(request.dir));
    }
    let seen = meta::already_imported_paths(store.as_ref(), &dataset, &cancel)
        .await
        .map_err(wrap(Stage::Write))?;
    let files: Vec<LogFile> = all_files
        .into_iter()
        .filter(|f| !seen.contains(&f.path.display().to_string()))
        .collect();
    if files.is_empty() {
        return Err(ImportError::AllFilesPreviouslyImported(dataset.clone()));
    }

    let import_id = FixedId::hash(&[&request.import_time_micros.to_string()])?;
    let stamp = ImportStamp::from_micros(request.import_time_micros);
    let started_at = store.server_now(&cancel).await.map_err(wrap(Stage::Write))?;
    meta::import_started(
        store.as_ref(),
        &dataset,
        import_id,
        request.rolling,
        request.rebuild,
        started_at,
        &cancel,
    )
    .await
    .map_err(wrap(Stage::Write))?;
    info!(
        dataset = %dataset,
        import_id = %import_id,
        files = files.len(),
        rolling = request.rolling,
        "import started"
    );

    // writer pool, shared receiver
    let (tx, rx) = mpsc::channel::<Batch>(opts.queue_depth.max(1));
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let written = Arc::new(AtomicU64::new(0));
    let mut writer_handles = Vec::with_capacity(opts.writers.max(1));
    for _ in 0..opts.writers.max(1) {
        let store = store.clone();
        let rx = rx.clone();
        let cancel = cancel.clone();
        let written = written.clone();
        let dataset = dataset.clone();
        writer_handles.push(tokio::spawn(async move {
            loop {
                let batch = { rx.lock().await.recv().await };
                let Some(batch) = batch else {
                    return Ok::<(), StoreError>(());
                };
                let table = TableRef::new(&dataset, batch.table)?;
                let count = batch.rows.len() as u64;
                write_with_retry(store.as_ref(), &table, batch.rows, &cancel).await?;
                written.fetch_add(count, Ordering::Relaxed);
            }
        }));
    }
    drop(rx);

    let parse = {
        let filter = filter.clone();
        let cancel = cancel.clone();
        let batch_size = opts.batch_size.max(1);
        tokio::task::spawn_blocking(move || {
            parse_stage(files, filter, stamp, import_id, batch_size, tx, cancel)
        })
    };

    let parse_result = match parse.await {
        Ok(result) => result,
        Err(err) => Err(store_stage(
            &dataset,
            Stage::Parse,
            StoreError::Fatal(format!("parse stage aborted: {err}")),
        )),
    };
    let mut writer_err = None;
    for handle in writer_handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if writer_err.is_none() {
                    writer_err = Some(err);
                }
            }
            Err(err) => {
                if writer_err.is_none() {
                    writer_err = Some(StoreError::Fatal(format!("writer aborted: {err}")));
                }
            }
        }
    }
    if let Some(err) = writer_err {
        return Err(store_stage(&dataset, Stage::Write, err));
    }
    let outcome = parse_result?;

    if cancel.is_cancelled() {
        return Err(ImportError::Cancelled);
    }

    meta::merge_first_seen(store.as_ref(), outcome.candidates, &cancel)
        .await
        .map_err(wrap(Stage::Write))?;
    let ended_at = store.server_now(&cancel).await.map_err(wrap(Stage::Write))?;
    meta::mark_files(
        store.as_ref(),
        &dataset,
        &outcome.parsed_paths,
        import_id,
        request.rolling,
        ended_at,
        &cancel,
    )
    .await
    .map_err(wrap(Stage::Write))?;
    let (min_ts, max_ts) = match (outcome.min_ts, outcome.max_ts) {
        (Some(min), Some(max)) => {
            meta::merge_min_max(store.as_ref(), &dataset, min, max, &cancel)
                .await
                .map_err(wrap(Stage::Write))?;
            (min, max)
        }
        _ => (0, 0),
    };
    let hours_seen = outcome.hours.len() as u64;
    meta::import_finished(
        store.as_ref(),
        &dataset,
        import_id,
        request.rolling,
        request.rebuild,
        started_at,
        ended_at,
        min_ts,
        max_ts,
        hours_seen,
        &cancel,
    )
    .await
    .map_err(wrap(Stage::Write))?;

    let summary = ImportSummary {
        import_id,
        files_imported: outcome.parsed_paths.len(),
        records_written: written.load(Ordering::Relaxed),
        parse_errors: outcome.parse_errors,
        min_ts,
        max_ts,
        hours_seen,
    };
    info!(
        dataset = %dataset,
        records = summary.records_written,
        parse_errors = summary.parse_errors,
        "import finished"
    );
    Ok(summary)
}

async fn write_with_retry<S: Store>(
    store: &S,
    table: &TableRef,
    rows: Vec<Row>,
    cancel: &CancelToken,
) -> Result<(), StoreError> {
    let retry = Retry::transient();
    let mut failures = 0;
    loop {
        match store.insert(table, rows.clone(), cancel).await {
            Ok(()) => return Ok(()),
            Err(StoreError::Cancelled) => return Err(StoreError::Cancelled),
            Err(err) if err.is_transient() => {
                failures += 1;
                if !retry.should_retry(failures) {
                    return Err(err);
                }
                warn!(%table, failures, error = %err, "transient write failure, backing off");
                retry.sleep(failures).await;
            }
            Err(err) => return Err(err),
        }
    }
}

struct ParseOutcome {
    parse_errors: u64,
    min_ts: Option<i64>,
    max_ts: Option<i64>,
    hours: HashSet<i64>,
    candidates: Vec<first_seen::Candidate>,
    parsed_paths: Vec<String>,
}

/// Synchronous read/filter/correlate stage; runs on the blocking pool and
/// feeds the writer queue. Conn files come first in `files` so correlation
/// facts exist before the application logs stream through.
fn parse_stage(
    files: Vec<LogFile>,
    filter: Arc<Filter>,
    stamp: ImportStamp,
    import_id: FixedId,
    batch_size: usize,
    tx: mpsc::Sender<Batch>,
    cancel: CancelToken,
) -> Result<ParseOutcome, ImportError> {
    let mut correlator = Correlator::new();
    let mut tracker = FirstSeenTracker::new();
    let mut batcher = Batcher { batch_size, pending: HashMap::new(), tx };
    let mut outcome = ParseOutcome {
        parse_errors: 0,
        min_ts: None,
        max_ts: None,
        hours: HashSet::new(),
        candidates: Vec::new(),
        parsed_paths: Vec::new(),
    };

    for file in files {
        if cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }
        let Some(records) = zeek_reader::open(&file)? else {
            continue;
        };
        let raw = format::raw_table(file.kind);
        for item in records {
            let record = match item {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "skipping malformed line");
                    outcome.parse_errors += 1;
                    continue;
                }
            };
            let ts = match record {
                Record::Conn(ref rec) => {
                    let cor = match correlator.correlate_conn(rec) {
                        Ok(cor) => cor,
                        Err(err) => {
                            warn!(error = %err, "skipping record");
                            outcome.parse_errors += 1;
                            continue;
                        }
                    };
                    if filter.filter_conn_pair(cor.src, cor.dst) {
                        continue;
                    }
                    correlator.observe_conn(rec);
                    tracker.observe(&cor);
                    batcher.push(raw, format::conn_row(rec, &cor, &filter, stamp, import_id))?;
                    batcher.push("uconn", format::uconn_row(&cor, stamp))?;
                    cor.ts
                }
                Record::Http(ref rec) => {
                    let cor = match correlator.correlate_http(rec) {
                        Ok(cor) => cor,
                        Err(err) => {
                            warn!(error = %err, "skipping record");
                            outcome.parse_errors += 1;
                            continue;
                        }
                    };
                    if filter.filter_conn_pair_for_http(cor.src, cor.dst) {
                        continue;
                    }
                    if cor.fqdn.as_deref().is_some_and(|f| filter.filter_domain(f)) {
                        continue;
                    }
                    tracker.observe(&cor);
                    batcher.push(raw, format::http_row(rec, &cor, &filter, stamp, import_id))?;
                    for row in format::mime_type_uri_rows(rec, &cor, stamp) {
                        batcher.push("mime_type_uris", row)?;
                    }
                    cor.ts
                }
                Record::Ssl(ref rec) => {
                    let cor = match correlator.correlate_ssl(rec) {
                        Ok(cor) => cor,
                        Err(err) => {
                            warn!(error = %err, "skipping record");
                            outcome.parse_errors += 1;
                            continue;
                        }
                    };
                    if filter.filter_conn_pair(cor.src, cor.dst) {
                        continue;
                    }
                    if cor.fqdn.as_deref().is_some_and(|f| filter.filter_domain(f)) {
                        continue;
                    }
                    tracker.observe(&cor);
                    batcher.push(raw, format::ssl_row(rec, &cor, &filter, stamp, import_id))?;
                    if !filter.filter_sni_pair(cor.src) && !rec.server_name.is_empty() {
                        batcher.push("usni", format::usni_row(&cor, &rec.server_name, stamp))?;
                    }
                    cor.ts
                }
                Record::Dns(ref rec) => {
                    let cor = match correlator.correlate_dns(rec) {
                        Ok(cor) => cor,
                        Err(err) => {
                            warn!(error = %err, "skipping record");
                            outcome.parse_errors += 1;
                            continue;
                        }
                    };
                    if filter.filter_dns_pair(cor.src, cor.dst) {
                        continue;
                    }
                    if filter.filter_domain(&rec.query) {
                        continue;
                    }
                    tracker.observe(&cor);
                    batcher.push(raw, format::dns_row(rec, &cor, &filter, stamp, import_id))?;
                    if !rec.query.is_empty() {
                        batcher.push("udns", format::udns_row(&cor, &rec.query, stamp))?;
                    }
                    for row in format::pdns_raw_rows(rec, &cor, stamp) {
                        batcher.push("pdns_raw", row)?;
                    }
                    for row in format::pdns_rows(rec, stamp) {
                        batcher.push("pdns", row)?;
                    }
                    cor.ts
                }
            };
            outcome.min_ts = Some(outcome.min_ts.map_or(ts, |m| m.min(ts)));
            outcome.max_ts = Some(outcome.max_ts.map_or(ts, |m| m.max(ts)));
            outcome.hours.insert(format::hour_bucket(ts));
        }
        outcome.parsed_paths.push(file.path.display().to_string());
    }

    batcher.finish()?;
    outcome.candidates = tracker.into_candidates();
    Ok(outcome)
}

struct Batcher {
    batch_size: usize,
    pending: HashMap<&'static str, Vec<Row>>,
    tx: mpsc::Sender<Batch>,
}

impl Batcher {
    fn push(&mut self, table: &'static str, row: Row) -> Result<(), ImportError> {
        let rows = self.pending.entry(table).or_default();
        rows.push(row);
        if rows.len() >= self.batch_size {
            let rows = std::mem::take(rows);
            self.send(table, rows)?;
        }
        Ok(())
    }

    fn send(&self, table: &'static str, rows: Vec<Row>) -> Result<(), ImportError> {
        // a closed queue means the writer pool died; its error wins
        self.tx
            .blocking_send(Batch { table, rows })
            .map_err(|_| ImportError::Cancelled)
    }

    fn finish(mut self) -> Result<(), ImportError> {
        let pending = std::mem::take(&mut self.pending);
        for (table, rows) in pending {
            if !rows.is_empty() {
                self.send(table, rows)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_filter::FilterSpec;
    use serde_json::json;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use telemetry_store::tables::{FILES, HISTORICAL_FIRST_SEEN, IMPORTS, META_DB, MIN_MAX};
    use telemetry_store::{MemStore, Value};

    const T0: i64 = 1_712_000_000;

    fn tempdir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("importer-test-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_lines(dir: &Path, name: &str, lines: &[String]) {
        let mut f = File::create(dir.join(name)).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
    }

    fn conn_line(uid: &str, src: &str, dst: &str, ts: i64) -> String {
        json!({
            "ts": ts, "uid": uid,
            "id.orig_h": src, "id.orig_p": 49158,
            "id.resp_h": dst, "id.resp_p": 443,
            "proto": "tcp", "service": "ssl",
            "duration": 1.5, "orig_ip_bytes": 1200, "resp_ip_bytes": 6100
        })
        .to_string()
    }

    fn ssl_line(uid: &str, src: &str, dst: &str, server_name: &str, ts: i64) -> String {
        json!({
            "ts": ts, "uid": uid,
            "id.orig_h": src, "id.orig_p": 49158,
            "id.resp_h": dst, "id.resp_p": 443,
            "server_name": server_name, "ja3": "abc"
        })
        .to_string()
    }

    fn http_line(uid: &str, src: &str, dst: &str, host: &str, ts: i64) -> String {
        json!({
            "ts": ts, "uid": uid,
            "id.orig_h": src, "id.orig_p": 50000,
            "id.resp_h": dst, "id.resp_p": 80,
            "method": "GET", "host": host, "uri": "/", "version": "1.1",
            "user_agent": "curl/8.0", "resp_mime_types": [], "trans_depth": 1
        })
        .to_string()
    }

    fn dns_line(uid: &str, src: &str, dst: &str, query: &str, answers: &[&str], ts: i64) -> String {
        json!({
            "ts": ts, "uid": uid,
            "id.orig_h": src, "id.orig_p": 5353,
            "id.resp_h": dst, "id.resp_p": 53,
            "query": query, "qtype_name": "A", "answers": answers
        })
        .to_string()
    }

    fn test_filter() -> Arc<Filter> {
        let spec = FilterSpec {
            internal_subnets: vec!["10.0.0.0/8".to_string()],
            ..FilterSpec::default()
        };
        Arc::new(Filter::from_spec(&spec).unwrap())
    }

    fn request(dir: &Path, dataset: &str) -> ImportRequest {
        ImportRequest {
            dir: dir.to_path_buf(),
            dataset: dataset.to_string(),
            import_time_micros: T0 * 1_000_000,
            rolling: false,
            rebuild: false,
        }
    }

    fn small_opts() -> ImportOptions {
        ImportOptions { batch_size: 2, writers: 2, queue_depth: 4 }
    }

    fn populate(dir: &Path) {
        write_lines(
            dir,
            "conn.log",
            &[conn_line("C1", "10.55.100.111", "165.227.88.15", T0 + 1000)],
        );
        write_lines(
            dir,
            "ssl.log",
            &[ssl_line("C1", "10.55.100.111", "165.227.88.15", "www.example.com", T0 + 1005)],
        );
        write_lines(
            dir,
            "http.log",
            &[http_line("C2", "10.55.100.111", "76.98.34.5", "dl.example.com", T0 + 2000)],
        );
        write_lines(
            dir,
            "dns.log",
            &[dns_line(
                "C3",
                "10.55.100.111",
                "10.55.0.53",
                "www.example.com",
                &["93.184.216.34"],
                T0 + 500,
            )],
        );
    }

    async fn meta_rows(store: &MemStore, table: &str, dataset: &str) -> Vec<Row> {
        let table = TableRef::new(META_DB, table).unwrap();
        store
            .select(&table, &[("database", Value::from(dataset))], &CancelToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn full_import_populates_tables_and_metadata() {
        let dir = tempdir("full");
        populate(&dir);
        let store = Arc::new(MemStore::new());
        let summary = run_import(
            store.clone(),
            test_filter(),
            request(&dir, "sensor1"),
            small_opts(),
            CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.files_imported, 4);
        assert_eq!(summary.parse_errors, 0);
        assert_eq!(summary.min_ts, T0 + 500);
        assert_eq!(summary.max_ts, T0 + 2000);
        // conn + uconn + ssl + usni + http + dns + udns + pdns_raw + pdns
        assert_eq!(summary.records_written, 9);

        for table in ["conn", "ssl", "http", "dns", "uconn", "usni", "udns", "pdns_raw", "pdns"] {
            let t = TableRef::new("sensor1", table).unwrap();
            assert_eq!(store.count(&t).await, 1, "{table}");
        }

        // start + finish rows
        assert_eq!(meta_rows(&store, IMPORTS, "sensor1").await.len(), 2);
        assert_eq!(meta_rows(&store, FILES, "sensor1").await.len(), 4);
        let min_max = meta_rows(&store, MIN_MAX, "sensor1").await;
        assert_eq!(min_max.len(), 1);
        assert_eq!(min_max[0].i64("min_ts"), Some(T0 + 500));
        assert_eq!(min_max[0].i64("max_ts"), Some(T0 + 2000));
    }

    #[tokio::test]
    async fn first_seen_takes_min_across_log_types() {
        let dir = tempdir("firstseen");
        populate(&dir);
        let store = Arc::new(MemStore::new());
        run_import(
            store.clone(),
            test_filter(),
            request(&dir, "sensor1"),
            small_opts(),
            CancelToken::new(),
        )
        .await
        .unwrap();

        let history = TableRef::new(META_DB, HISTORICAL_FIRST_SEEN).unwrap();
        let cancel = CancelToken::new();
        // DNS at T0+500 predates the SSL sighting of the same name at T0+1000
        let row = store
            .select_one(&history, &[("fqdn", Value::from("www.example.com"))], &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.i64("first_seen"), Some(T0 + 500));
        assert_eq!(row.text("ip"), Some("::"));

        // the SSL flow's destination got an IP identity from its conn record
        let row = store
            .select_one(&history, &[("ip", Value::from("165.227.88.15"))], &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.i64("first_seen"), Some(T0 + 1000));
        assert_eq!(row.text("fqdn"), Some(""));

        // the DNS server itself never became an identity through answers
        let all = store.select(&history, &[], &cancel).await.unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.iter().all(|r| r.text("ip") != Some("10.55.0.53")));
    }

    #[tokio::test]
    async fn second_import_of_same_files_is_refused() {
        let dir = tempdir("dup");
        populate(&dir);
        let store = Arc::new(MemStore::new());
        run_import(
            store.clone(),
            test_filter(),
            request(&dir, "sensor1"),
            small_opts(),
            CancelToken::new(),
        )
        .await
        .unwrap();

        let mut again = request(&dir, "sensor1");
        again.import_time_micros += 60 * 1_000_000;
        let err = run_import(store, test_filter(), again, small_opts(), CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::AllFilesPreviouslyImported(_)));
    }

    #[tokio::test]
    async fn rebuild_drops_dataset_and_clears_bookkeeping() {
        let dir = tempdir("rebuild");
        populate(&dir);
        let store = Arc::new(MemStore::new());
        run_import(
            store.clone(),
            test_filter(),
            request(&dir, "sensor1"),
            small_opts(),
            CancelToken::new(),
        )
        .await
        .unwrap();

        let mut again = request(&dir, "sensor1");
        again.rebuild = true;
        again.import_time_micros += 60 * 1_000_000;
        run_import(store.clone(), test_filter(), again, small_opts(), CancelToken::new())
            .await
            .unwrap();

        // old start/finish rows are gone, only the rebuild's pair remains
        assert_eq!(meta_rows(&store, IMPORTS, "sensor1").await.len(), 2);
        assert_eq!(meta_rows(&store, FILES, "sensor1").await.len(), 4);
        let conn = TableRef::new("sensor1", "conn").unwrap();
        assert_eq!(store.count(&conn).await, 1);
    }

    #[tokio::test]
    async fn filtered_pairs_produce_no_rows() {
        let dir = tempdir("filtered");
        write_lines(
            &dir,
            "conn.log",
            &[
                // both external
                conn_line("C1", "165.227.88.15", "76.98.34.5", T0),
                // destination on the mandatory never-include list
                conn_line("C2", "10.55.100.111", "127.0.0.1", T0),
            ],
        );
        let store = Arc::new(MemStore::new());
        let summary = run_import(
            store.clone(),
            test_filter(),
            request(&dir, "sensor1"),
            small_opts(),
            CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(summary.records_written, 0);
        let conn = TableRef::new("sensor1", "conn").unwrap();
        assert_eq!(store.count(&conn).await, 0);
    }

    #[tokio::test]
    async fn malformed_lines_are_counted_not_fatal() {
        let dir = tempdir("badlines");
        write_lines(
            &dir,
            "conn.log",
            &[
                conn_line("C1", "10.55.100.111", "165.227.88.15", T0),
                "definitely not json".to_string(),
            ],
        );
        let store = Arc::new(MemStore::new());
        let summary = run_import(
            store.clone(),
            test_filter(),
            request(&dir, "sensor1"),
            small_opts(),
            CancelToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(summary.parse_errors, 1);
        assert_eq!(summary.records_written, 2);
    }

    #[tokio::test]
    async fn rolling_import_assigns_ttls() {
        let dir = tempdir("rolling");
        populate(&dir);
        let store = Arc::new(MemStore::new());
        let mut req = request(&dir, "sensor1");
        req.rolling = true;
        run_import(store.clone(), test_filter(), req, small_opts(), CancelToken::new())
            .await
            .unwrap();

        // raw rows age out of the hot tier once their import is older than 26h
        store.set_now(T0 + 27 * 3600).await;
        let cancel = CancelToken::new();
        let conn = TableRef::new("sensor1", "conn").unwrap();
        store.optimize_final(&conn, &cancel).await.unwrap();
        assert_eq!(store.count(&conn).await, 0);

        // identity history is in the 90-day tier and survives
        let history = TableRef::new(META_DB, HISTORICAL_FIRST_SEEN).unwrap();
        store.optimize_final(&history, &cancel).await.unwrap();
        assert_eq!(store.count(&history).await, 4);

        // so does the import bookkeeping (1-year and 180-day tiers)
        let imports = TableRef::new(META_DB, IMPORTS).unwrap();
        store.optimize_final(&imports, &cancel).await.unwrap();
        assert_eq!(meta_rows(&store, IMPORTS, "sensor1").await.len(), 2);
        let files = TableRef::new(META_DB, FILES).unwrap();
        store.optimize_final(&files, &cancel).await.unwrap();
        assert_eq!(meta_rows(&store, FILES, "sensor1").await.len(), 4);
    }

    #[tokio::test]
    async fn future_import_keeps_reseen_identities_through_history_ttl() {
        const DAY: i64 = 24 * 3600;
        let dir = tempdir("future-a");
        write_lines(
            &dir,
            "conn.log",
            &[
                conn_line("C1", "10.55.100.111", "165.227.88.15", T0),
                conn_line("C2", "10.55.100.111", "76.98.34.5", T0),
            ],
        );
        write_lines(
            &dir,
            "ssl.log",
            &[
                ssl_line("C1", "10.55.100.111", "165.227.88.15", "www.alive.com", T0),
                ssl_line("C2", "10.55.100.111", "76.98.34.5", "www.stale.com", T0),
            ],
        );
        let store = Arc::new(MemStore::new());
        let mut req = request(&dir, "sensor1");
        req.rolling = true;
        run_import(store.clone(), test_filter(), req, small_opts(), CancelToken::new())
            .await
            .unwrap();

        // 60 days on, only the alive pair shows up again
        let later = tempdir("future-b");
        write_lines(
            &later,
            "conn.log",
            &[conn_line("C9", "10.55.100.111", "165.227.88.15", T0 + 60 * DAY)],
        );
        write_lines(
            &later,
            "ssl.log",
            &[ssl_line("C9", "10.55.100.111", "165.227.88.15", "www.alive.com", T0 + 60 * DAY)],
        );
        let mut req = request(&later, "sensor1");
        req.rolling = true;
        req.import_time_micros = (T0 + 60 * DAY) * 1_000_000;
        run_import(store.clone(), test_filter(), req, small_opts(), CancelToken::new())
            .await
            .unwrap();

        store.set_now(T0 + 91 * DAY).await;
        let cancel = CancelToken::new();
        let history = TableRef::new(META_DB, HISTORICAL_FIRST_SEEN).unwrap();
        store.optimize_final(&history, &cancel).await.unwrap();

        // last seen only at T0: past the 90-day window, gone
        assert!(store
            .select_one(&history, &[("fqdn", Value::from("www.stale.com"))], &cancel)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .select_one(&history, &[("ip", Value::from("76.98.34.5"))], &cancel)
            .await
            .unwrap()
            .is_none());

        // re-seen: original first_seen kept, last_seen moved to the later import
        let row = store
            .select_one(&history, &[("fqdn", Value::from("www.alive.com"))], &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.i64("first_seen"), Some(T0));
        assert!(row.i64("last_seen") >= Some(T0 + 60 * DAY));
        let row = store
            .select_one(&history, &[("ip", Value::from("165.227.88.15"))], &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.i64("first_seen"), Some(T0));
        assert!(row.i64("last_seen") >= Some(T0 + 60 * DAY));
    }

    #[tokio::test]
    async fn non_rolling_import_leaves_no_ttls() {
        let dir = tempdir("nonrolling");
        populate(&dir);
        let store = Arc::new(MemStore::new());
        run_import(
            store.clone(),
            test_filter(),
            request(&dir, "sensor1"),
            small_opts(),
            CancelToken::new(),
        )
        .await
        .unwrap();

        store.set_now(T0 + 365 * 24 * 3600).await;
        let cancel = CancelToken::new();
        let conn = TableRef::new("sensor1", "conn").unwrap();
        store.optimize_final(&conn, &cancel).await.unwrap();
        assert_eq!(store.count(&conn).await, 1);
    }

    #[tokio::test]
    async fn non_utc_store_is_refused() {
        let dir = tempdir("tz");
        populate(&dir);
        let store = Arc::new(MemStore::new());
        store.set_time_zone("America/New_York").await;
        let err = run_import(
            store,
            test_filter(),
            request(&dir, "sensor1"),
            small_opts(),
            CancelToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ImportError::NonUtcStore(_)));
    }

    #[tokio::test]
    async fn reserved_and_invalid_dataset_names_are_refused() {
        let dir = tempdir("names");
        populate(&dir);
        let store = Arc::new(MemStore::new());
        for bad in ["metadatabase", "system", "bad-name", ""] {
            let err = run_import(
                store.clone(),
                test_filter(),
                request(&dir, bad),
                small_opts(),
                CancelToken::new(),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, ImportError::BadDataset(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn cancelled_token_aborts_early() {
        let dir = tempdir("cancel");
        populate(&dir);
        let store = Arc::new(MemStore::new());
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = run_import(store, test_filter(), request(&dir, "sensor1"), small_opts(), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Cancelled));
    }

    #[tokio::test]
    async fn empty_directory_is_an_error() {
        let dir = tempdir("empty");
        let store = Arc::new(MemStore::new());
        let err = run_import(
            store,
            test_filter(),
            request(&dir, "sensor1"),
            small_opts(),
            CancelToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ImportError::NoLogFiles(_)));
    }
}
