use serde::Deserialize;

/// Connection record from `conn.log` / `open_conn.log`.
///
/// Addresses stay as strings here; they are validated when records are
/// formatted for the store, so one bad address only costs one record.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnRecord {
    pub ts: i64,
    pub uid: String,
    #[serde(rename = "id.orig_h")]
    pub src: String,
    #[serde(rename = "id.orig_p")]
    pub src_port: u16,
    #[serde(rename = "id.resp_h")]
    pub dst: String,
    #[serde(rename = "id.resp_p")]
    pub dst_port: u16,
    #[serde(default)]
    pub proto: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub orig_ip_bytes: u64,
    #[serde(default)]
    pub resp_ip_bytes: u64,
}

/// HTTP record from `http.log` / `open_http.log`.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpRecord {
    pub ts: i64,
    pub uid: String,
    #[serde(rename = "id.orig_h")]
    pub src: String,
    #[serde(rename = "id.orig_p")]
    pub src_port: u16,
    #[serde(rename = "id.resp_h")]
    pub dst: String,
    #[serde(rename = "id.resp_p")]
    pub dst_port: u16,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub resp_mime_types: Vec<String>,
    #[serde(default)]
    pub trans_depth: u16,
}

/// SSL record from `ssl.log` / `open_ssl.log`.
#[derive(Debug, Clone, Deserialize)]
pub struct SslRecord {
    pub ts: i64,
    pub uid: String,
    #[serde(rename = "id.orig_h")]
    pub src: String,
    #[serde(rename = "id.orig_p")]
    pub src_port: u16,
    #[serde(rename = "id.resp_h")]
    pub dst: String,
    #[serde(rename = "id.resp_p")]
    pub dst_port: u16,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub ja3: String,
}

/// DNS record from `dns.log`.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsRecord {
    pub ts: i64,
    pub uid: String,
    #[serde(rename = "id.orig_h")]
    pub src: String,
    #[serde(rename = "id.orig_p")]
    pub src_port: u16,
    #[serde(rename = "id.resp_h")]
    pub dst: String,
    #[serde(rename = "id.resp_p")]
    pub dst_port: u16,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub qtype_name: String,
    #[serde(default)]
    pub answers: Vec<String>,
}

/// A typed record tagged with its source log category.
#[derive(Debug, Clone)]
pub enum Record {
    Conn(ConnRecord),
    Http(HttpRecord),
    Ssl(SslRecord),
    Dns(DnsRecord),
}

impl Record {
    pub fn uid(&self) -> &str {
        match self {
            Record::Conn(r) => &r.uid,
            Record::Http(r) => &r.uid,
            Record::Ssl(r) => &r.uid,
            Record::Dns(r) => &r.uid,
        }
    }

    pub fn ts(&self) -> i64 {
        match self {
            Record::Conn(r) => r.ts,
            Record::Http(r) => r.ts,
            Record::Ssl(r) => r.ts,
            Record::Dns(r) => r.ts,
        }
    }
}
