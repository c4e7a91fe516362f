//! ClickHouse HTTP-interface client.
//!
//! Statements are assembled from catalog constants and [`Ident`]-validated
//! names only; every runtime value travels as a `{name:Type}` placeholder
//! bound through `param_<name>` query parameters, so nothing user-controlled
//! ever lands in statement text.

use crate::{
    check_cancel, Filters, Ident, Row, Store, StoreError, TableRef, TtlSpec, TtlUnit, Value,
};
use flowsift_core::CancelToken;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    url: String,
}

impl HttpStore {
    /// `connection` is the HTTP endpoint, e.g. `http://localhost:8123`.
    /// Credentials go in the URL userinfo the way the server expects them.
    pub fn new(connection: &str) -> Result<HttpStore, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| StoreError::Fatal(format!("http client setup: {err}")))?;
        Ok(HttpStore { client, url: connection.trim_end_matches('/').to_string() })
    }

    async fn run_statement(
        &self,
        sql: String,
        params: Vec<(String, String)>,
        cancel: &CancelToken,
    ) -> Result<String, StoreError> {
        check_cancel(cancel)?;
        debug!(sql = %sql.lines().next().unwrap_or(""), "store statement");
        let request = self.client.post(&self.url).query(&params).body(sql);
        let response = cancel
            .run(request.send())
            .await
            .map_err(|_| StoreError::Cancelled)?
            .map_err(classify)?;
        let status = response.status();
        let body = cancel
            .run(response.text())
            .await
            .map_err(|_| StoreError::Cancelled)?
            .map_err(classify)?;
        if status.is_success() {
            Ok(body)
        } else if status.is_server_error() || status.as_u16() == 429 {
            Err(StoreError::Transient(format!("store returned {status}: {}", first_line(&body))))
        } else {
            Err(StoreError::Fatal(format!("store returned {status}: {}", first_line(&body))))
        }
    }

    async fn scalar(&self, sql: String, cancel: &CancelToken) -> Result<String, StoreError> {
        let body = self.run_statement(sql, Vec::new(), cancel).await?;
        Ok(body.trim().to_string())
    }
}

fn first_line(body: &str) -> &str {
    body.lines().next().unwrap_or("")
}

fn classify(err: reqwest::Error) -> StoreError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        StoreError::Transient(err.to_string())
    } else {
        StoreError::Fatal(err.to_string())
    }
}

/// Placeholder type and bound text for a filter value.
fn bind(value: &Value) -> Result<(&'static str, String), StoreError> {
    match value {
        Value::Bool(v) => Ok(("Bool", v.to_string())),
        Value::Int(v) => Ok(("Int64", v.to_string())),
        Value::UInt(v) => Ok(("UInt64", v.to_string())),
        Value::Float(v) => Ok(("Float64", v.to_string())),
        Value::Text(v) => Ok(("String", v.clone())),
        Value::Id(v) => Ok(("String", v.hex())),
        Value::Null | Value::TextArray(_) => {
            Err(StoreError::Fatal("unsupported filter value".to_string()))
        }
    }
}

/// Build `WHERE a = {p0:T} AND b = {p1:T}` plus its `param_*` bindings.
fn where_clause(
    filters: Filters<'_>,
) -> Result<(String, Vec<(String, String)>), StoreError> {
    if filters.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    let mut conditions = Vec::with_capacity(filters.len());
    let mut params = Vec::with_capacity(filters.len());
    for (i, (column, value)) in filters.iter().enumerate() {
        if !Ident::is_valid(column) {
            return Err(StoreError::BadIdent(column.to_string()));
        }
        let (ty, bound) = bind(value)?;
        conditions.push(format!("{column} = {{p{i}:{ty}}}"));
        params.push((format!("param_p{i}"), bound));
    }
    Ok((format!(" WHERE {}", conditions.join(" AND ")), params))
}

fn insert_body(table: &TableRef, rows: &[Row]) -> String {
    let mut body = format!("INSERT INTO {table} FORMAT JSONEachRow\n");
    for row in rows {
        let object: serde_json::Map<String, serde_json::Value> =
            row.columns().map(|(col, v)| (col.to_string(), v.to_json())).collect();
        body.push_str(&serde_json::Value::Object(object).to_string());
        body.push('\n');
    }
    body
}

fn ttl_expression(ttl: &TtlSpec) -> Result<String, StoreError> {
    if !Ident::is_valid(ttl.column) {
        return Err(StoreError::BadIdent(ttl.column.to_string()));
    }
    let secs = ttl.max_age.as_secs();
    let base = match ttl.unit {
        TtlUnit::Seconds => format!("toDateTime({})", ttl.column),
        TtlUnit::Micros => format!("toDateTime(intDiv({}, 1000000))", ttl.column),
    };
    let mut expr = format!("{base} + INTERVAL {secs} SECOND");
    if ttl.only_rolling {
        expr.push_str(" DELETE WHERE rolling = true");
    }
    Ok(expr)
}

fn parse_rows(body: &str) -> Result<Vec<Row>, StoreError> {
    let mut rows = Vec::new();
    for line in body.lines() {
        if line.is_empty() {
            continue;
        }
        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(line)
            .map_err(|err| StoreError::Fatal(format!("unreadable result row: {err}")))?;
        let mut row = Row::new();
        for (col, json) in &object {
            row.set(col, Value::from_json(json));
        }
        rows.push(row);
    }
    Ok(rows)
}

impl Store for HttpStore {
    async fn create_database(
        &self,
        database: &Ident,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        self.run_statement(format!("CREATE DATABASE IF NOT EXISTS {database}"), Vec::new(), cancel)
            .await?;
        Ok(())
    }

    async fn drop_database(
        &self,
        database: &Ident,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        self.run_statement(format!("DROP DATABASE IF EXISTS {database}"), Vec::new(), cancel)
            .await?;
        Ok(())
    }

    async fn database_exists(
        &self,
        database: &Ident,
        cancel: &CancelToken,
    ) -> Result<bool, StoreError> {
        let body = self
            .run_statement(
                "SELECT count() FROM system.databases WHERE name = {db:String}".to_string(),
                vec![("param_db".to_string(), database.as_str().to_string())],
                cancel,
            )
            .await?;
        Ok(body.trim() != "0")
    }

    async fn insert(
        &self,
        table: &TableRef,
        rows: Vec<Row>,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.run_statement(insert_body(table, &rows), Vec::new(), cancel).await?;
        Ok(())
    }

    async fn select(
        &self,
        table: &TableRef,
        filters: Filters<'_>,
        cancel: &CancelToken,
    ) -> Result<Vec<Row>, StoreError> {
        let (clause, params) = where_clause(filters)?;
        let sql = format!("SELECT * FROM {table}{clause} FORMAT JSONEachRow");
        let body = self.run_statement(sql, params, cancel).await?;
        parse_rows(&body)
    }

    async fn select_one(
        &self,
        table: &TableRef,
        filters: Filters<'_>,
        cancel: &CancelToken,
    ) -> Result<Option<Row>, StoreError> {
        let (clause, params) = where_clause(filters)?;
        let sql = format!("SELECT * FROM {table}{clause} LIMIT 1 FORMAT JSONEachRow");
        let body = self.run_statement(sql, params, cancel).await?;
        Ok(parse_rows(&body)?.into_iter().next())
    }

    async fn delete(
        &self,
        table: &TableRef,
        filters: Filters<'_>,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        let (clause, mut params) = where_clause(filters)?;
        let condition = if clause.is_empty() { " WHERE 1 = 1".to_string() } else { clause };
        params.push(("mutations_sync".to_string(), "1".to_string()));
        self.run_statement(format!("ALTER TABLE {table} DELETE{condition}"), params, cancel)
            .await?;
        Ok(())
    }

    async fn set_ttl(
        &self,
        table: &TableRef,
        ttl: &TtlSpec,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        let expr = ttl_expression(ttl)?;
        self.run_statement(format!("ALTER TABLE {table} MODIFY TTL {expr}"), Vec::new(), cancel)
            .await?;
        Ok(())
    }

    async fn optimize_final(
        &self,
        table: &TableRef,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        self.run_statement(format!("OPTIMIZE TABLE {table} FINAL"), Vec::new(), cancel).await?;
        Ok(())
    }

    async fn server_now(&self, cancel: &CancelToken) -> Result<i64, StoreError> {
        let body = self.scalar("SELECT toUnixTimestamp(now())".to_string(), cancel).await?;
        body.parse::<i64>()
            .map_err(|_| StoreError::Fatal(format!("unreadable server time {body:?}")))
    }

    async fn server_time_zone(&self, cancel: &CancelToken) -> Result<String, StoreError> {
        self.scalar("SELECT timeZone()".to_string(), cancel).await
    }
}
