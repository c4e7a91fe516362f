//! Shaping parsed records into store rows.
//!
//! Every row carries the stamps of the import that wrote it; the hour and day
//! buckets drive rollup tables and retention, the raw timestamp stays the
//! record's own.

use flow_filter::Filter;
use flowsift_core::FixedId;
use std::net::IpAddr;
use telemetry_store::Row;
use uid_correlate::Correlated;
use zeek_reader::{ConnRecord, DnsRecord, HttpRecord, LogKind, SslRecord};

/// The moment an import run was started, in every granularity a table needs.
#[derive(Debug, Clone, Copy)]
pub struct ImportStamp {
    pub micros: i64,
    pub secs: i64,
    pub hour: i64,
    pub day: i64,
}

impl ImportStamp {
    pub fn from_micros(micros: i64) -> ImportStamp {
        let secs = micros.div_euclid(1_000_000);
        ImportStamp { micros, secs, hour: hour_bucket(secs), day: day_bucket(secs) }
    }
}

pub fn hour_bucket(ts: i64) -> i64 {
    ts - ts.rem_euclid(3600)
}

pub fn day_bucket(ts: i64) -> i64 {
    ts - ts.rem_euclid(86400)
}

/// Raw table a log kind lands in.
pub fn raw_table(kind: LogKind) -> &'static str {
    match kind {
        LogKind::Conn => "conn",
        LogKind::OpenConn => "open_conn",
        LogKind::Http => "http",
        LogKind::OpenHttp => "open_http",
        LogKind::Ssl => "ssl",
        LogKind::OpenSsl => "open_ssl",
        LogKind::Dns => "dns",
    }
}

fn base_row(
    ts: i64,
    uid: &str,
    src: IpAddr,
    src_port: u16,
    dst: IpAddr,
    dst_port: u16,
    filter: &Filter,
    stamp: ImportStamp,
    import_id: FixedId,
) -> Row {
    Row::new()
        .with("ts", ts)
        .with("uid", uid)
        .with("src", src.to_string())
        .with("src_port", src_port)
        .with("dst", dst.to_string())
        .with("dst_port", dst_port)
        .with("src_local", filter.is_internal(src))
        .with("dst_local", filter.is_internal(dst))
        .with("import_time", stamp.secs)
        .with("import_hour", stamp.hour)
        .with("import_id", import_id)
}

pub fn conn_row(
    rec: &ConnRecord,
    cor: &Correlated,
    filter: &Filter,
    stamp: ImportStamp,
    import_id: FixedId,
) -> Row {
    base_row(cor.ts, &rec.uid, cor.src, rec.src_port, cor.dst, rec.dst_port, filter, stamp, import_id)
        .with("proto", rec.proto.as_str())
        .with("service", rec.service.as_str())
        .with("duration", rec.duration)
        .with("orig_ip_bytes", rec.orig_ip_bytes)
        .with("resp_ip_bytes", rec.resp_ip_bytes)
}

pub fn http_row(
    rec: &HttpRecord,
    cor: &Correlated,
    filter: &Filter,
    stamp: ImportStamp,
    import_id: FixedId,
) -> Row {
    base_row(cor.ts, &rec.uid, cor.src, rec.src_port, cor.dst, rec.dst_port, filter, stamp, import_id)
        .with("method", rec.method.as_str())
        .with("host", rec.host.as_str())
        .with("uri", rec.uri.as_str())
        .with("version", rec.version.as_str())
        .with("user_agent", rec.user_agent.as_str())
        .with("resp_mime_types", rec.resp_mime_types.clone())
        .with("trans_depth", rec.trans_depth)
        .with("missing_host_header", cor.missing_host)
        .with("duration", cor.duration)
        .with("orig_ip_bytes", cor.orig_ip_bytes)
        .with("resp_ip_bytes", cor.resp_ip_bytes)
}

pub fn ssl_row(
    rec: &SslRecord,
    cor: &Correlated,
    filter: &Filter,
    stamp: ImportStamp,
    import_id: FixedId,
) -> Row {
    base_row(cor.ts, &rec.uid, cor.src, rec.src_port, cor.dst, rec.dst_port, filter, stamp, import_id)
        .with("server_name", rec.server_name.as_str())
        .with("ja3", rec.ja3.as_str())
        .with("duration", cor.duration)
        .with("orig_ip_bytes", cor.orig_ip_bytes)
        .with("resp_ip_bytes", cor.resp_ip_bytes)
}

pub fn dns_row(
    rec: &DnsRecord,
    cor: &Correlated,
    filter: &Filter,
    stamp: ImportStamp,
    import_id: FixedId,
) -> Row {
    base_row(cor.ts, &rec.uid, cor.src, rec.src_port, cor.dst, rec.dst_port, filter, stamp, import_id)
        .with("query", rec.query.as_str())
        .with("qtype_name", rec.qtype_name.as_str())
        .with("answers", rec.answers.clone())
}

pub fn uconn_row(cor: &Correlated, stamp: ImportStamp) -> Row {
    Row::new()
        .with("src", cor.src.to_string())
        .with("dst", cor.dst.to_string())
        .with("import_hour", stamp.hour)
}

pub fn usni_row(cor: &Correlated, server_name: &str, stamp: ImportStamp) -> Row {
    Row::new()
        .with("src", cor.src.to_string())
        .with("server_name", server_name)
        .with("import_hour", stamp.hour)
}

pub fn udns_row(cor: &Correlated, query: &str, stamp: ImportStamp) -> Row {
    Row::new()
        .with("src", cor.src.to_string())
        .with("query", query)
        .with("import_hour", stamp.hour)
}

/// One row per response MIME type. Records without a resolved host produce
/// nothing; the uri alone identifies no site.
pub fn mime_type_uri_rows(rec: &HttpRecord, cor: &Correlated, stamp: ImportStamp) -> Vec<Row> {
    let Some(host) = cor.fqdn.as_deref() else {
        return Vec::new();
    };
    rec.resp_mime_types
        .iter()
        .map(|mime| {
            Row::new()
                .with("host", host)
                .with("uri", rec.uri.as_str())
                .with("mime_type", mime.as_str())
                .with("import_hour", stamp.hour)
        })
        .collect()
}

/// One passive-DNS row per answer, as observed.
pub fn pdns_raw_rows(rec: &DnsRecord, cor: &Correlated, stamp: ImportStamp) -> Vec<Row> {
    rec.answers
        .iter()
        .map(|answer| {
            Row::new()
                .with("query", rec.query.as_str())
                .with("answer", answer.as_str())
                .with("ts", cor.ts)
                .with("import_time", stamp.secs)
        })
        .collect()
}

/// Daily passive-DNS rollup: only answers that are addresses.
pub fn pdns_rows(rec: &DnsRecord, stamp: ImportStamp) -> Vec<Row> {
    rec.answers
        .iter()
        .filter(|answer| answer.parse::<IpAddr>().is_ok())
        .map(|answer| {
            Row::new()
                .with("query", rec.query.as_str())
                .with("resolved_ip", answer.as_str())
                .with("import_day", stamp.day)
        })
        .collect()
}
