//! Columnar-store façade.
//!
//! Callers never build SQL text. Databases and tables are named through the
//! validated [`Ident`] newtype and all data travels as typed [`Value`]s, so
//! identifier interpolation outside the parameter mechanism is impossible by
//! construction. Two implementations: [`MemStore`] for in-process tests with
//! an advanceable clock, and [`HttpStore`] speaking the ClickHouse HTTP
//! interface.

mod http;
mod mem;
pub mod tables;

pub use http::HttpStore;
pub use mem::MemStore;

use flowsift_core::{CancelToken, FixedId};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid identifier {0:?}")]
    BadIdent(String),
    /// Worth retrying with backoff: timeouts, connection resets, overload.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// Not worth retrying: bad request, missing table, refused precondition.
    #[error("store failure: {0}")]
    Fatal(String),
    #[error("store operation cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Cancelled)
    }
}

/// A validated database, table, or column name: `[A-Za-z_][A-Za-z0-9_]*`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ident(String);

impl Ident {
    pub fn new(name: &str) -> Result<Ident, StoreError> {
        if Self::is_valid(name) {
            Ok(Ident(name.to_string()))
        } else {
            Err(StoreError::BadIdent(name.to_string()))
        }
    }

    pub fn is_valid(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableRef {
    pub database: Ident,
    pub table: Ident,
}

impl TableRef {
    pub fn new(database: &str, table: &str) -> Result<TableRef, StoreError> {
        Ok(TableRef { database: Ident::new(database)?, table: Ident::new(table)? })
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// A typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    TextArray(Vec<String>),
    Id(FixedId),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(v) => serde_json::Value::Bool(*v),
            Value::Int(v) => serde_json::Value::from(*v),
            Value::UInt(v) => serde_json::Value::from(*v),
            Value::Float(v) => serde_json::Value::from(*v),
            Value::Text(v) => serde_json::Value::from(v.clone()),
            Value::TextArray(v) => serde_json::Value::from(v.clone()),
            Value::Id(v) => serde_json::Value::from(v.hex()),
        }
    }

    pub(crate) fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(v) => Value::Bool(*v),
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_u64() {
                    Value::UInt(v)
                } else if let Some(v) = n.as_i64() {
                    Value::Int(v)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(v) => Value::Text(v.clone()),
            serde_json::Value::Array(items) => Value::TextArray(
                items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect(),
            ),
            serde_json::Value::Object(_) => Value::Null,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}
impl From<u64> for Value {
    fn from(v: u64) -> Value {
        Value::UInt(v)
    }
}
impl From<u16> for Value {
    fn from(v: u16) -> Value {
        Value::UInt(v as u64)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Text(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Text(v)
    }
}
impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Value {
        Value::TextArray(v)
    }
}
impl From<FixedId> for Value {
    fn from(v: FixedId) -> Value {
        Value::Id(v)
    }
}

/// One row, column name to value. Column names come from the table catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    pub fn new() -> Row {
        Row::default()
    }

    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Row {
        self.0.insert(column.to_string(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn set(&mut self, column: &str, value: impl Into<Value>) {
        self.0.insert(column.to_string(), value.into());
    }

    pub fn i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    pub fn u64(&self, column: &str) -> Option<u64> {
        self.get(column).and_then(Value::as_u64)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    pub fn bool(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(Value::as_bool)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// AND-combined equality filters for select/delete.
pub type Filters<'a> = &'a [(&'a str, Value)];

/// Which unit a TTL column stores its timestamps in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlUnit {
    Seconds,
    Micros,
}

/// Age-out rule for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TtlSpec {
    pub column: &'static str,
    pub unit: TtlUnit,
    pub max_age: Duration,
    /// Restrict deletion to rows whose `rolling` column is true.
    pub only_rolling: bool,
}

/// The operations the engine needs from a columnar store. Futures are Send so
/// callers can drive them from spawned tasks.
pub trait Store: Send + Sync + 'static {
    fn create_database(
        &self,
        database: &Ident,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn drop_database(
        &self,
        database: &Ident,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn database_exists(
        &self,
        database: &Ident,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn insert(
        &self,
        table: &TableRef,
        rows: Vec<Row>,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn select(
        &self,
        table: &TableRef,
        filters: Filters<'_>,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<Vec<Row>, StoreError>> + Send;

    fn select_one(
        &self,
        table: &TableRef,
        filters: Filters<'_>,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<Option<Row>, StoreError>> + Send;

    /// Delete matching rows; returns nothing because columnar deletes are
    /// asynchronous mutations server-side.
    fn delete(
        &self,
        table: &TableRef,
        filters: Filters<'_>,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn set_ttl(
        &self,
        table: &TableRef,
        ttl: &TtlSpec,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Force a merge so pending TTL deletions and aggregations take effect.
    fn optimize_final(
        &self,
        table: &TableRef,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Server wall clock, unix seconds. Retention math never uses the host
    /// clock.
    fn server_now(
        &self,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    fn server_time_zone(
        &self,
        cancel: &CancelToken,
    ) -> impl Future<Output = Result<String, StoreError>> + Send;
}

pub(crate) fn check_cancel(cancel: &CancelToken) -> Result<(), StoreError> {
    if cancel.is_cancelled() {
        Err(StoreError::Cancelled)
    } else {
        Ok(())
    }
}
