//! Reader for newline-delimited JSON Zeek logs.
//!
//! A directory is scanned for the known log file names; each file yields a
//! lazy stream of typed records. Malformed lines are surfaced per line and do
//! not abort the file, up to a corruption cap.

mod records;

pub use records::{ConnRecord, DnsRecord, HttpRecord, Record, SslRecord};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// A file is abandoned as potentially corrupt after this many bad lines.
pub const LINE_ERROR_LIMIT: usize = 25;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("could not read log directory {path}: {source}")]
    Dir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not open log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single malformed line. Reported to the caller, never fatal for the file.
#[derive(Debug, Error)]
#[error("bad record at {path}:{line}: {source}")]
pub struct LineError {
    pub path: PathBuf,
    pub line: usize,
    #[source]
    pub source: serde_json::Error,
}

/// Log category, preserving the open/closed distinction for table routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    Conn,
    OpenConn,
    Http,
    OpenHttp,
    Ssl,
    OpenSsl,
    Dns,
}

impl LogKind {
    pub fn from_file_name(name: &str) -> Option<LogKind> {
        match name {
            "conn.log" => Some(LogKind::Conn),
            "open_conn.log" => Some(LogKind::OpenConn),
            "http.log" => Some(LogKind::Http),
            "open_http.log" => Some(LogKind::OpenHttp),
            "ssl.log" => Some(LogKind::Ssl),
            "open_ssl.log" => Some(LogKind::OpenSsl),
            "dns.log" => Some(LogKind::Dns),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, LogKind::OpenConn | LogKind::OpenHttp | LogKind::OpenSsl)
    }
}

#[derive(Debug, Clone)]
pub struct LogFile {
    pub kind: LogKind,
    pub path: PathBuf,
}

/// Collect the recognised log files in `dir`. Unknown files are ignored.
/// Conn logs sort first so correlation facts are available before the
/// application logs stream through.
pub fn scan_dir(dir: &Path) -> Result<Vec<LogFile>, ReadError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ReadError::Dir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ReadError::Dir {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name();
        let Some(kind) = name.to_str().and_then(LogKind::from_file_name) else {
            continue;
        };
        files.push(LogFile { kind, path: entry.path() });
    }

    files.sort_by_key(|f| match f.kind {
        LogKind::Conn | LogKind::OpenConn => 0,
        LogKind::Http | LogKind::OpenHttp => 1,
        LogKind::Ssl | LogKind::OpenSsl => 2,
        LogKind::Dns => 3,
    });
    Ok(files)
}

/// Open a log file for streaming. Empty files are skipped with a warning and
/// yield `None`.
pub fn open(file: &LogFile) -> Result<Option<RecordIter>, ReadError> {
    let handle = File::open(&file.path).map_err(|source| ReadError::Open {
        path: file.path.clone(),
        source,
    })?;
    let len = handle
        .metadata()
        .map_err(|source| ReadError::Open {
            path: file.path.clone(),
            source,
        })?
        .len();
    if len == 0 {
        warn!(path = %file.path.display(), "skipping empty log file");
        return Ok(None);
    }

    Ok(Some(RecordIter {
        kind: file.kind,
        path: file.path.clone(),
        lines: BufReader::new(handle).lines(),
        line_no: 0,
        error_count: 0,
    }))
}

/// Lazy line-by-line record stream over one log file.
pub struct RecordIter {
    kind: LogKind,
    path: PathBuf,
    lines: std::io::Lines<BufReader<File>>,
    line_no: usize,
    error_count: usize,
}

impl RecordIter {
    pub fn kind(&self) -> LogKind {
        self.kind
    }

    fn decode(&self, line: &str) -> Result<Record, serde_json::Error> {
        match self.kind {
            LogKind::Conn | LogKind::OpenConn => serde_json::from_str(line).map(Record::Conn),
            LogKind::Http | LogKind::OpenHttp => serde_json::from_str(line).map(Record::Http),
            LogKind::Ssl | LogKind::OpenSsl => serde_json::from_str(line).map(Record::Ssl),
            LogKind::Dns => serde_json::from_str(line).map(Record::Dns),
        }
    }
}

impl Iterator for RecordIter {
    type Item = Result<Record, LineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.error_count > LINE_ERROR_LIMIT {
                warn!(path = %self.path.display(), "log file is potentially corrupted, abandoning");
                return None;
            }
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "could not scan log file");
                    return None;
                }
            };
            self.line_no += 1;
            if line.is_empty() {
                continue;
            }
            match self.decode(&line) {
                Ok(record) => return Some(Ok(record)),
                Err(source) => {
                    self.error_count += 1;
                    return Some(Err(LineError {
                        path: self.path.clone(),
                        line: self.line_no,
                        source,
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_log(dir: &Path, name: &str, contents: &str) {
        let mut f = File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "zeek-reader-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    const CONN_LINE: &str = r#"{"ts":1712000000,"uid":"CTo78A11g7CYbbOHvj","id.orig_h":"10.55.100.111","id.orig_p":49158,"id.resp_h":"165.227.88.15","id.resp_p":443,"proto":"tcp","service":"ssl","duration":0.5,"orig_ip_bytes":1200,"resp_ip_bytes":6100}"#;

    #[test]
    fn scan_recognises_known_files_and_orders_conn_first() {
        let dir = tempdir();
        write_log(&dir, "dns.log", "");
        write_log(&dir, "conn.log", "");
        write_log(&dir, "open_ssl.log", "");
        write_log(&dir, "http.log", "");
        write_log(&dir, "notes.txt", "ignored");
        write_log(&dir, "weird.log", "ignored");

        let files = scan_dir(&dir).unwrap();
        let kinds: Vec<LogKind> = files.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![LogKind::Conn, LogKind::Http, LogKind::OpenSsl, LogKind::Dns]);
    }

    #[test]
    fn parses_conn_lines() {
        let dir = tempdir();
        write_log(&dir, "conn.log", &format!("{CONN_LINE}\n{CONN_LINE}\n"));
        let file = &scan_dir(&dir).unwrap()[0];
        let records: Vec<_> = open(file).unwrap().unwrap().collect();
        assert_eq!(records.len(), 2);
        let Record::Conn(conn) = records[0].as_ref().unwrap() else {
            panic!("expected conn record");
        };
        assert_eq!(conn.uid, "CTo78A11g7CYbbOHvj");
        assert_eq!(conn.dst_port, 443);
        assert_eq!(conn.orig_ip_bytes, 1200);
    }

    #[test]
    fn bad_line_is_surfaced_but_does_not_abort() {
        let dir = tempdir();
        write_log(
            &dir,
            "conn.log",
            &format!("{CONN_LINE}\nnot json at all\n{CONN_LINE}\n"),
        );
        let file = &scan_dir(&dir).unwrap()[0];
        let results: Vec<_> = open(file).unwrap().unwrap().collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.line, 2);
        assert!(results[2].is_ok());
    }

    #[test]
    fn missing_required_field_is_a_line_error() {
        let dir = tempdir();
        // no uid
        write_log(
            &dir,
            "dns.log",
            r#"{"ts":1712000000,"id.orig_h":"10.0.0.1","id.orig_p":5353,"id.resp_h":"10.0.0.2","id.resp_p":53,"query":"x.test"}"#,
        );
        let file = &scan_dir(&dir).unwrap()[0];
        let results: Vec<_> = open(file).unwrap().unwrap().collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let dir = tempdir();
        write_log(
            &dir,
            "ssl.log",
            r#"{"ts":1712000000,"uid":"Cx1","id.orig_h":"10.0.0.1","id.orig_p":1,"id.resp_h":"1.2.3.4","id.resp_p":443,"server_name":"www.example.com","ja3":"abc","brand_new_field":[1,2,3]}"#,
        );
        let file = &scan_dir(&dir).unwrap()[0];
        let results: Vec<_> = open(file).unwrap().unwrap().collect();
        let Record::Ssl(ssl) = results[0].as_ref().unwrap() else {
            panic!("expected ssl record");
        };
        assert_eq!(ssl.server_name, "www.example.com");
    }

    #[test]
    fn empty_file_is_skipped() {
        let dir = tempdir();
        write_log(&dir, "conn.log", "");
        let file = &scan_dir(&dir).unwrap()[0];
        assert!(open(file).unwrap().is_none());
    }

    #[test]
    fn corruption_cap_abandons_file() {
        let dir = tempdir();
        let mut contents = String::new();
        for _ in 0..(LINE_ERROR_LIMIT + 10) {
            contents.push_str("garbage\n");
        }
        contents.push_str(CONN_LINE);
        contents.push('\n');
        write_log(&dir, "conn.log", &contents);
        let file = &scan_dir(&dir).unwrap()[0];
        let results: Vec<_> = open(file).unwrap().unwrap().collect();
        // one error surfaced per bad line up to the cap, then the file is dropped
        assert_eq!(results.len(), LINE_ERROR_LIMIT + 1);
        assert!(results.iter().all(|r| r.is_err()));
    }

    #[test]
    fn open_variant_keeps_its_kind() {
        let dir = tempdir();
        write_log(&dir, "open_conn.log", &format!("{CONN_LINE}\n"));
        let file = &scan_dir(&dir).unwrap()[0];
        assert_eq!(file.kind, LogKind::OpenConn);
        assert!(file.kind.is_open());
        let iter = open(file).unwrap().unwrap();
        assert_eq!(iter.kind(), LogKind::OpenConn);
    }
}
