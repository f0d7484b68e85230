//! ClickHouse backend over the HTTP interface.
//!
//! Statements are POSTed as the request body. Queries get
//! `FORMAT JSONCompact` appended and the response is decoded using the
//! column types from its `meta` block. `?` placeholders in code (not in
//! quotes or comments) are bound client-side as escaped literals; a
//! statement run without arguments is sent untouched.
//!
//! ClickHouse has no transactions: a [`ClickHouseTransaction`] buffers
//! `INSERT` statements and sends them on commit, runs anything else right
//! away, and drops the buffer on rollback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Backend, Transaction};
use crate::context::Context;
use crate::dsn::{split_host_port, Driver, Dsn};
use crate::error::{ClickHouseException, MigrateError, Result};
use crate::rows::{ExecResult, Rows};
use crate::value::Value;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 8123;
/// Default HTTPS port.
pub const DEFAULT_SECURE_PORT: u16 = 8443;
/// Database used when the DSN names none.
pub const DEFAULT_DATABASE: &str = "default";

const EXCEPTION_CODE_HEADER: &str = "X-ClickHouse-Exception-Code";

static EXCEPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)^Code: (\d+)[.,] (?:e\.displayText\(\) = )?DB::Exception: (.*?)(?: \(([A-Z0-9_]+)\))?(?: \(version .*\))?\s*$",
    )
    .expect("Invalid exception regex")
});

/// Connection settings derived from a `clickhouse://` DSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickHouseConfig {
    /// Base URLs, one per host, in failover order.
    pub endpoints: Vec<String>,
    /// Database queries run against.
    pub database: String,
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl ClickHouseConfig {
    /// Reads the settings from a DSN.
    ///
    /// The database comes from the DSN path, then the `database` option,
    /// then [`DEFAULT_DATABASE`]. `secure=true` switches to HTTPS and
    /// `alt_hosts` adds failover hosts after the listed ones.
    pub fn from_dsn(dsn: &Dsn) -> Result<Self> {
        let secure = matches!(dsn.option("secure"), Some("true" | "1"));
        let (scheme, default_port) = if secure {
            ("https", DEFAULT_SECURE_PORT)
        } else {
            ("http", DEFAULT_PORT)
        };

        let alt_hosts = dsn
            .option("alt_hosts")
            .map(|hosts| hosts.split(',').map(str::trim).filter(|h| !h.is_empty()))
            .into_iter()
            .flatten();
        let endpoints = dsn
            .hosts
            .iter()
            .map(String::as_str)
            .chain(alt_hosts)
            .map(|host| {
                let (name, port) = split_host_port(host, default_port)?;
                Ok(format!("{scheme}://{name}:{port}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let database = if dsn.database.is_empty() {
            dsn.option("database").unwrap_or(DEFAULT_DATABASE).to_string()
        } else {
            dsn.database.clone()
        };
        let username = if dsn.username.is_empty() {
            dsn.option("username").unwrap_or("default").to_string()
        } else {
            dsn.username.clone()
        };
        let password = if dsn.password.is_empty() {
            dsn.option("password").unwrap_or_default().to_string()
        } else {
            dsn.password.clone()
        };

        Ok(Self {
            endpoints,
            database,
            username,
            password,
        })
    }
}

struct Inner {
    client: Client,
    config: ClickHouseConfig,
    active: AtomicUsize,
}

impl Inner {
    fn endpoint(&self) -> &str {
        let index = self.active.load(Ordering::Acquire);
        &self.config.endpoints[index.min(self.config.endpoints.len() - 1)]
    }

    async fn send(&self, sql: String) -> Result<String> {
        let response = self
            .client
            .post(self.endpoint())
            .query(&[("database", self.config.database.as_str())])
            .header("X-ClickHouse-User", &self.config.username)
            .header("X-ClickHouse-Key", &self.config.password)
            .body(sql)
            .send()
            .await?;

        let status = response.status();
        let header_code = response
            .headers()
            .get(EXCEPTION_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i32>().ok());
        let body = response.text().await?;
        if !status.is_success() || header_code.is_some() {
            return Err(parse_exception(&body, header_code).into());
        }
        Ok(body)
    }

    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult> {
        let sql = bind(query, args)?;
        self.send(sql).await?;
        Ok(ExecResult::unsupported())
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows> {
        let sql = bind(query, args)?;
        let body = self.send(with_format(&sql)).await?;
        decode_response(&body)
    }
}

/// ClickHouse HTTP client with host failover.
pub struct ClickHouseBackend {
    inner: Arc<Inner>,
}

impl ClickHouseBackend {
    /// Builds the client; nothing is sent until the first call.
    pub fn open(dsn: &Dsn) -> Result<Self> {
        let config = ClickHouseConfig::from_dsn(dsn)?;
        let client = Client::builder().build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                config,
                active: AtomicUsize::new(0),
            }),
        })
    }
}

#[async_trait]
impl Backend for ClickHouseBackend {
    fn driver(&self) -> Driver {
        Driver::ClickHouse
    }

    /// Tries each endpoint in order and pins the first that answers.
    async fn ping(&self, ctx: &Context) -> Result<()> {
        let mut last_err = None;
        for (index, endpoint) in self.inner.config.endpoints.iter().enumerate() {
            let url = format!("{endpoint}/ping");
            let res = ctx
                .run(async {
                    let response = self.inner.client.get(&url).send().await?;
                    response.error_for_status()?;
                    Ok(())
                })
                .await;
            match res {
                Ok(()) => {
                    self.inner.active.store(index, Ordering::Release);
                    debug!(endpoint = %endpoint, "clickhouse endpoint selected");
                    return Ok(());
                }
                Err(MigrateError::Cancelled) => return Err(MigrateError::Cancelled),
                Err(err) => {
                    warn!(endpoint = %endpoint, error = %err, "clickhouse endpoint unavailable");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| MigrateError::Config("no ClickHouse hosts".into())))
    }

    async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Rows> {
        ctx.run(self.inner.query(query, args)).await
    }

    async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        ctx.run(self.inner.exec(query, args)).await
    }

    async fn begin(&self, ctx: &Context) -> Result<Arc<dyn Transaction>> {
        ctx.check()?;
        Ok(Arc::new(ClickHouseTransaction {
            inner: Arc::clone(&self.inner),
            ctx: Context::with_cancellation(ctx.cancellation_token().clone()),
            pending: Mutex::new(Some(Vec::new())),
        }))
    }
}

/// Buffered pseudo-transaction; see the module docs.
pub struct ClickHouseTransaction {
    inner: Arc<Inner>,
    /// Cancellation of the context the transaction was begun in; commit
    /// stops sending buffered statements once it fires.
    ctx: Context,
    pending: Mutex<Option<Vec<String>>>,
}

#[async_trait]
impl Transaction for ClickHouseTransaction {
    async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Rows> {
        if self.pending.lock().await.is_none() {
            return Err(MigrateError::TransactionAlreadyClosed);
        }
        ctx.run(self.inner.query(query, args)).await
    }

    async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        let mut pending = self.pending.lock().await;
        let buffer = pending
            .as_mut()
            .ok_or(MigrateError::TransactionAlreadyClosed)?;
        if is_insert(query) {
            buffer.push(bind(query, args)?);
            return Ok(ExecResult::unsupported());
        }
        drop(pending);
        ctx.run(self.inner.exec(query, args)).await
    }

    async fn commit(&self) -> Result<()> {
        self.ctx.check()?;
        let statements = self
            .pending
            .lock()
            .await
            .take()
            .ok_or(MigrateError::TransactionAlreadyClosed)?;
        for sql in statements {
            self.ctx.run(self.inner.send(sql)).await?;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.pending
            .lock()
            .await
            .take()
            .ok_or(MigrateError::TransactionAlreadyClosed)?;
        Ok(())
    }
}

fn is_insert(query: &str) -> bool {
    query
        .trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("insert"))
}

/// Appends the output format after the last code or quoted section, so a
/// trailing comment or semicolon cannot swallow it.
fn with_format(sql: &str) -> String {
    let mut offset = 0;
    let mut keep = 0;
    for (kind, text) in segments(sql) {
        offset += text.len();
        let meaningful = match kind {
            Segment::Quoted => true,
            Segment::Code => !text.trim_matches(is_terminator).is_empty(),
            Segment::Comment => false,
        };
        if meaningful {
            keep = offset;
        }
    }
    format!(
        "{} FORMAT JSONCompact",
        sql[..keep].trim_end_matches(is_terminator)
    )
}

fn is_terminator(c: char) -> bool {
    c == ';' || c.is_whitespace()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Code,
    Quoted,
    Comment,
}

/// Splits a statement into code, quoted (`'`, `"`, `` ` ``) and comment
/// (`--`, `/* */`) sections. Concatenating the pieces gives back `sql`.
fn segments(sql: &str) -> Vec<(Segment, &str)> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let next = bytes.get(i + 1).copied();
        let section = match bytes[i] {
            b'\'' | b'"' | b'`' => Some((Segment::Quoted, quoted_end(bytes, i))),
            b'-' if next == Some(b'-') => Some((
                Segment::Comment,
                sql[i..].find('\n').map_or(sql.len(), |n| i + n),
            )),
            b'/' if next == Some(b'*') => Some((
                Segment::Comment,
                sql[i + 2..].find("*/").map_or(sql.len(), |n| i + n + 4),
            )),
            _ => None,
        };
        let Some((kind, end)) = section else {
            i += 1;
            continue;
        };
        if start < i {
            out.push((Segment::Code, &sql[start..i]));
        }
        out.push((kind, &sql[i..end]));
        i = end;
        start = end;
    }
    if start < sql.len() {
        out.push((Segment::Code, &sql[start..]));
    }
    out
}

/// Index just past the quote closing the one at `open`, honouring
/// backslash escapes; the end of input if it never closes.
fn quoted_end(bytes: &[u8], open: usize) -> usize {
    let quote = bytes[open];
    let mut i = open + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Parses an exception body such as
/// `Code: 60. DB::Exception: Table x doesn't exist. (UNKNOWN_TABLE) (version ...)`.
pub fn parse_exception(body: &str, header_code: Option<i32>) -> ClickHouseException {
    let body = body.trim();
    match EXCEPTION_RE.captures(body) {
        Some(caps) => ClickHouseException {
            code: caps[1].parse().ok().or(header_code).unwrap_or_default(),
            name: caps.get(3).map_or_else(String::new, |m| m.as_str().to_string()),
            message: caps[2].trim().to_string(),
        },
        None => ClickHouseException {
            code: header_code.unwrap_or_default(),
            name: String::new(),
            message: body.to_string(),
        },
    }
}

/// Replaces `?` placeholders in code sections with literals. Without
/// arguments the query is returned as is, so a `?` in a comment or a
/// ternary expression survives.
pub fn bind(query: &str, args: &[Value]) -> Result<String> {
    if args.is_empty() {
        return Ok(query.to_string());
    }
    let mut out = String::with_capacity(query.len() + args.len() * 8);
    let mut args_iter = args.iter();
    let mut used = 0;

    for (kind, text) in segments(query) {
        if kind != Segment::Code {
            out.push_str(text);
            continue;
        }
        for c in text.chars() {
            if c != '?' {
                out.push(c);
                continue;
            }
            let arg = args_iter.next().ok_or_else(|| {
                MigrateError::Bind(format!(
                    "expected more than {} arguments for query",
                    args.len()
                ))
            })?;
            write_literal(&mut out, arg);
            used += 1;
        }
    }

    if used != args.len() {
        return Err(MigrateError::Bind(format!(
            "query has {used} placeholders but {} arguments were given",
            args.len()
        )));
    }
    Ok(out)
}

fn write_literal(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("NULL"),
        Value::Bool(v) => out.push_str(if *v { "1" } else { "0" }),
        Value::Int(v) => out.push_str(&v.to_string()),
        Value::UInt(v) => out.push_str(&v.to_string()),
        Value::Float(v) => out.push_str(&v.to_string()),
        Value::Text(v) => quote_string(out, v),
        Value::Bytes(v) => quote_string(out, &String::from_utf8_lossy(v)),
        Value::Time(v) => {
            out.push('\'');
            out.push_str(&v.format("%Y-%m-%d %H:%M:%S").to_string());
            out.push('\'');
        }
        Value::Tuple(values) => {
            out.push('[');
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_literal(out, v);
            }
            out.push(']');
        }
    }
}

fn quote_string(out: &mut String, s: &str) {
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            _ => out.push(c),
        }
    }
    out.push('\'');
}

#[derive(Debug, Deserialize)]
struct CompactResponse {
    meta: Vec<ColumnMeta>,
    data: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct ColumnMeta {
    name: String,
    #[serde(rename = "type")]
    ty: String,
}

/// Decodes a `JSONCompact` response body.
pub fn decode_response(body: &str) -> Result<Rows> {
    if body.trim().is_empty() {
        return Ok(Rows::empty());
    }
    let response: CompactResponse = serde_json::from_str(body)?;
    let rows = response
        .data
        .into_iter()
        .map(|row| {
            if row.len() != response.meta.len() {
                return Err(MigrateError::Protocol(format!(
                    "row has {} cells, expected {}",
                    row.len(),
                    response.meta.len()
                )));
            }
            Ok(row
                .into_iter()
                .zip(&response.meta)
                .map(|(cell, meta)| convert(&meta.ty, cell))
                .collect())
        })
        .collect::<Result<Vec<_>>>()?;
    let columns = response.meta.into_iter().map(|m| m.name).collect();
    Ok(Rows::new(columns, rows))
}

fn unwrap_type<'a>(ty: &'a str, wrapper: &str) -> Option<&'a str> {
    ty.strip_prefix(wrapper)
        .and_then(|rest| rest.strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
}

fn convert(ty: &str, cell: serde_json::Value) -> Value {
    use serde_json::Value as Json;

    if let Some(inner) = unwrap_type(ty, "Nullable").or_else(|| unwrap_type(ty, "LowCardinality"))
    {
        return convert(inner, cell);
    }
    if cell.is_null() {
        return Value::Null;
    }
    if let Some(inner) = unwrap_type(ty, "Array") {
        return match cell {
            Json::Array(items) => Value::Tuple(items.into_iter().map(|c| convert(inner, c)).collect()),
            other => json_value(other),
        };
    }

    if ty.starts_with("UInt") {
        if let Some(v) = parse_cell(&cell, serde_json::Number::as_u64) {
            return Value::UInt(v);
        }
    } else if ty.starts_with("Int") {
        if let Some(v) = parse_cell(&cell, serde_json::Number::as_i64) {
            return Value::Int(v);
        }
    } else if ty.starts_with("Float") {
        if let Some(v) = parse_cell(&cell, serde_json::Number::as_f64) {
            return Value::Float(v);
        }
    }
    json_value(cell)
}

/// 64-bit integers arrive quoted by default, so numeric columns accept
/// both JSON numbers and strings.
fn parse_cell<T: std::str::FromStr>(
    cell: &serde_json::Value,
    from_number: impl Fn(&serde_json::Number) -> Option<T>,
) -> Option<T> {
    match cell {
        serde_json::Value::Number(n) => from_number(n),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn json_value(cell: serde_json::Value) -> Value {
    use serde_json::Value as Json;

    match cell {
        Json::Null => Value::Null,
        Json::Bool(v) => Value::Bool(v),
        Json::Number(n) => n
            .as_u64()
            .map(Value::UInt)
            .or_else(|| n.as_i64().map(Value::Int))
            .or_else(|| n.as_f64().map(Value::Float))
            .unwrap_or(Value::Null),
        Json::String(s) => Value::Text(s),
        Json::Array(items) => Value::Tuple(items.into_iter().map(json_value).collect()),
        Json::Object(_) => Value::Text(cell.to_string()),
    }
}
