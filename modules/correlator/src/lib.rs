//! Correlation of application-log records with conn-log records by
//! connection UID.
//!
//! The conn record sharing a UID is the unique source of a record's duration
//! and byte counters; application records without a matching conn pass
//! through unchanged. Records are never fused across protocols; each emits
//! independently.

use std::collections::HashMap;
use std::net::IpAddr;
use thiserror::Error;
use tracing::warn;
use zeek_reader::{ConnRecord, DnsRecord, HttpRecord, SslRecord};

#[derive(Debug, Error)]
pub enum CorrelateError {
    #[error("unable to parse valid ip address pair ({src:?}, {dst:?})")]
    BadAddressPair { src: String, dst: String },
}

/// Where a correlated record's FQDN came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FqdnSource {
    Ssl,
    Http,
    Dns,
}

/// Timing and volume facts from a conn record, keyed by UID.
#[derive(Debug, Clone, Copy)]
pub struct ConnFacts {
    pub ts: i64,
    pub duration: f64,
    pub orig_ip_bytes: u64,
    pub resp_ip_bytes: u64,
}

/// A record enriched with its conn-log counterpart.
#[derive(Debug, Clone)]
pub struct Correlated {
    pub ts: i64,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub fqdn: Option<String>,
    pub source: Option<FqdnSource>,
    pub duration: f64,
    pub orig_ip_bytes: u64,
    pub resp_ip_bytes: u64,
    /// true when a conn record with the same UID supplied the numbers above
    pub linked: bool,
    /// HTTP record with an empty host header, kept as an IP-only connection
    pub missing_host: bool,
}

pub fn parse_addr_pair(src: &str, dst: &str) -> Result<(IpAddr, IpAddr), CorrelateError> {
    match (src.parse::<IpAddr>(), dst.parse::<IpAddr>()) {
        (Ok(s), Ok(d)) => Ok((s, d)),
        _ => Err(CorrelateError::BadAddressPair { src: src.to_string(), dst: dst.to_string() }),
    }
}

/// Apply the FQDN priority rule for a flow seen under several record types:
/// SSL server name, then a non-empty HTTP host, then the DNS query. An HTTP
/// host that is a raw IP literal yields no FQDN; the flow stays an IP-only
/// identity and is flagged for review.
pub fn resolve_fqdn(
    ssl_server_name: Option<&str>,
    http_host: Option<&str>,
    dns_query: Option<&str>,
) -> Option<(String, FqdnSource)> {
    if let Some(name) = ssl_server_name {
        if !name.is_empty() {
            return Some((name.to_string(), FqdnSource::Ssl));
        }
    }
    if let Some(host) = http_host {
        if !host.is_empty() {
            if host.parse::<IpAddr>().is_ok() {
                warn!(host, "HTTP host is a raw IP literal, treating as IP-only identity");
                return None;
            }
            return Some((host.to_string(), FqdnSource::Http));
        }
    }
    if let Some(query) = dns_query {
        if !query.is_empty() {
            return Some((query.to_string(), FqdnSource::Dns));
        }
    }
    None
}

/// Index of conn facts by UID, built while conn logs stream through and
/// consulted as the application logs follow.
#[derive(Debug, Default)]
pub struct Correlator {
    conns: HashMap<String, ConnFacts>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Record a conn entry's facts. The earliest-timestamped conn record for
    /// a UID is authoritative.
    pub fn observe_conn(&mut self, conn: &ConnRecord) {
        let facts = ConnFacts {
            ts: conn.ts,
            duration: conn.duration,
            orig_ip_bytes: conn.orig_ip_bytes,
            resp_ip_bytes: conn.resp_ip_bytes,
        };
        self.conns
            .entry(conn.uid.clone())
            .and_modify(|have| {
                if facts.ts < have.ts {
                    *have = facts;
                }
            })
            .or_insert(facts);
    }

    pub fn facts(&self, uid: &str) -> Option<ConnFacts> {
        self.conns.get(uid).copied()
    }

    pub fn correlate_http(&self, rec: &HttpRecord) -> Result<Correlated, CorrelateError> {
        let (src, dst) = parse_addr_pair(&rec.src, &rec.dst)?;
        let missing_host = rec.host.is_empty();
        let fqdn = resolve_fqdn(None, Some(&rec.host), None);
        Ok(self.build(&rec.uid, rec.ts, src, dst, fqdn, missing_host))
    }

    pub fn correlate_ssl(&self, rec: &SslRecord) -> Result<Correlated, CorrelateError> {
        let (src, dst) = parse_addr_pair(&rec.src, &rec.dst)?;
        let fqdn = resolve_fqdn(Some(&rec.server_name), None, None);
        Ok(self.build(&rec.uid, rec.ts, src, dst, fqdn, false))
    }

    pub fn correlate_dns(&self, rec: &DnsRecord) -> Result<Correlated, CorrelateError> {
        let (src, dst) = parse_addr_pair(&rec.src, &rec.dst)?;
        let fqdn = resolve_fqdn(None, None, Some(&rec.query));
        Ok(self.build(&rec.uid, rec.ts, src, dst, fqdn, false))
    }

    pub fn correlate_conn(&self, rec: &ConnRecord) -> Result<Correlated, CorrelateError> {
        let (src, dst) = parse_addr_pair(&rec.src, &rec.dst)?;
        Ok(Correlated {
            ts: rec.ts,
            src,
            dst,
            fqdn: None,
            source: None,
            duration: rec.duration,
            orig_ip_bytes: rec.orig_ip_bytes,
            resp_ip_bytes: rec.resp_ip_bytes,
            linked: false,
            missing_host: false,
        })
    }

    fn build(
        &self,
        uid: &str,
        own_ts: i64,
        src: IpAddr,
        dst: IpAddr,
        fqdn: Option<(String, FqdnSource)>,
        missing_host: bool,
    ) -> Correlated {
        let (fqdn, source) = match fqdn {
            Some((name, src)) => (Some(name), Some(src)),
            None => (None, None),
        };
        match self.conns.get(uid) {
            Some(facts) => Correlated {
                ts: facts.ts,
                src,
                dst,
                fqdn,
                source,
                duration: facts.duration,
                orig_ip_bytes: facts.orig_ip_bytes,
                resp_ip_bytes: facts.resp_ip_bytes,
                linked: true,
                missing_host,
            },
            None => Correlated {
                ts: own_ts,
                src,
                dst,
                fqdn,
                source,
                duration: 0.0,
                orig_ip_bytes: 0,
                resp_ip_bytes: 0,
                linked: false,
                missing_host,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(uid: &str, ts: i64) -> ConnRecord {
        ConnRecord {
            ts,
            uid: uid.to_string(),
            src: "10.55.100.111".into(),
            src_port: 49158,
            dst: "165.227.88.15".into(),
            dst_port: 443,
            proto: "tcp".into(),
            service: "ssl".into(),
            duration: 1.5,
            orig_ip_bytes: 1200,
            resp_ip_bytes: 6100,
        }
    }

    fn http(uid: &str, host: &str) -> HttpRecord {
        HttpRecord {
            ts: 2_000,
            uid: uid.to_string(),
            src: "10.55.100.111".into(),
            src_port: 49158,
            dst: "76.98.34.5".into(),
            dst_port: 80,
            method: "GET".into(),
            host: host.to_string(),
            uri: "/".into(),
            version: "1.1".into(),
            user_agent: "curl/8.0".into(),
            resp_mime_types: vec![],
            trans_depth: 1,
        }
    }

    fn ssl(uid: &str, server_name: &str) -> SslRecord {
        SslRecord {
            ts: 3_000,
            uid: uid.to_string(),
            src: "10.55.100.111".into(),
            src_port: 49158,
            dst: "165.227.88.15".into(),
            dst_port: 443,
            server_name: server_name.to_string(),
            ja3: "".into(),
        }
    }

    #[test]
    fn linked_record_takes_conn_facts() {
        let mut correlator = Correlator::new();
        correlator.observe_conn(&conn("Cuid1", 1_000));
        let out = correlator.correlate_ssl(&ssl("Cuid1", "www.google.com")).unwrap();
        assert!(out.linked);
        assert_eq!(out.ts, 1_000); // conn ts is authoritative
        assert_eq!(out.duration, 1.5);
        assert_eq!(out.orig_ip_bytes, 1200);
        assert_eq!(out.resp_ip_bytes, 6100);
        assert_eq!(out.fqdn.as_deref(), Some("www.google.com"));
        assert_eq!(out.source, Some(FqdnSource::Ssl));
    }

    #[test]
    fn unmatched_record_is_unchanged() {
        let correlator = Correlator::new();
        let out = correlator.correlate_http(&http("Cnope", "example.com")).unwrap();
        assert!(!out.linked);
        assert_eq!(out.ts, 2_000);
        assert_eq!(out.duration, 0.0);
        assert_eq!(out.orig_ip_bytes, 0);
    }

    #[test]
    fn earliest_conn_wins_for_duplicate_uids() {
        let mut correlator = Correlator::new();
        let mut late = conn("Cuid1", 5_000);
        late.duration = 9.0;
        correlator.observe_conn(&late);
        correlator.observe_conn(&conn("Cuid1", 1_000));
        let facts = correlator.facts("Cuid1").unwrap();
        assert_eq!(facts.ts, 1_000);
        assert_eq!(facts.duration, 1.5);
    }

    #[test]
    fn ssl_and_http_on_one_uid_emit_independently() {
        let mut correlator = Correlator::new();
        correlator.observe_conn(&conn("Cuid1", 1_000));
        let s = correlator.correlate_ssl(&ssl("Cuid1", "www.google.com")).unwrap();
        let h = correlator.correlate_http(&http("Cuid1", "www.google.com")).unwrap();
        assert_eq!(s.source, Some(FqdnSource::Ssl));
        assert_eq!(h.source, Some(FqdnSource::Http));
        assert_eq!(s.ts, h.ts);
    }

    #[test]
    fn missing_http_host_is_kept_ip_only() {
        let correlator = Correlator::new();
        let out = correlator.correlate_http(&http("Cuid2", "")).unwrap();
        assert!(out.missing_host);
        assert!(out.fqdn.is_none());
        assert_eq!(out.dst, "76.98.34.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn ip_literal_host_yields_no_fqdn() {
        let correlator = Correlator::new();
        let out = correlator.correlate_http(&http("Cuid3", "1.2.3.4")).unwrap();
        assert!(out.fqdn.is_none());
        assert!(!out.missing_host);
    }

    #[test]
    fn fqdn_priority_order() {
        assert_eq!(
            resolve_fqdn(Some("sni.example"), Some("host.example"), Some("q.example")),
            Some(("sni.example".to_string(), FqdnSource::Ssl))
        );
        assert_eq!(
            resolve_fqdn(Some(""), Some("host.example"), Some("q.example")),
            Some(("host.example".to_string(), FqdnSource::Http))
        );
        assert_eq!(
            resolve_fqdn(None, Some(""), Some("q.example")),
            Some(("q.example".to_string(), FqdnSource::Dns))
        );
        assert_eq!(resolve_fqdn(None, Some(""), None), None);
    }

    #[test]
    fn bad_addresses_error() {
        let correlator = Correlator::new();
        let mut rec = http("Cuid4", "example.com");
        rec.src = "not-an-ip".into();
        assert!(matches!(
            correlator.correlate_http(&rec),
            Err(CorrelateError::BadAddressPair { .. })
        ));
    }
}
