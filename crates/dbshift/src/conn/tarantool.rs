//! Tarantool backend speaking IPROTO over TCP.
//!
//! Every statement is a Lua chunk sent as `EVAL`; arguments arrive as `...`.
//! Transactions use IPROTO streams (`BEGIN`/`COMMIT`/`ROLLBACK` tagged with a
//! stream id).
//!
//! Framing: each packet is `0xce` + big-endian `u32` length, then a
//! MessagePack header map and an optional body map.
//!
//! Cancellation only interrupts connecting and waiting for the shared
//! session. Once a request is written its reply is always read, so a
//! cancelled caller never leaves a stale response for the next one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tracing::debug;

use super::{Backend, Transaction};
use crate::context::Context;
use crate::dsn::{split_host_port, Driver, Dsn};
use crate::error::{MigrateError, Result, TarantoolError};
use crate::rows::{ExecResult, Rows};
use crate::value::Value;

/// Default IPROTO port.
pub const DEFAULT_PORT: u16 = 3301;

const GREETING_SIZE: usize = 128;
const SALT_BASE64_LEN: usize = 44;
const SCRAMBLE_SIZE: usize = 20;

mod code {
    pub const AUTH: u64 = 0x07;
    pub const EVAL: u64 = 0x08;
    pub const BEGIN: u64 = 0x0e;
    pub const COMMIT: u64 = 0x0f;
    pub const ROLLBACK: u64 = 0x10;
    pub const PING: u64 = 0x40;
    pub const ERROR_FLAG: u64 = 0x8000;
}

mod key {
    pub const REQUEST_TYPE: u64 = 0x00;
    pub const SYNC: u64 = 0x01;
    pub const STREAM_ID: u64 = 0x0a;
    pub const TUPLE: u64 = 0x21;
    pub const USER_NAME: u64 = 0x23;
    pub const EXPR: u64 = 0x27;
    pub const DATA: u64 = 0x30;
    pub const ERROR: u64 = 0x31;
}

type Map = Vec<(rmpv::Value, rmpv::Value)>;

fn int(v: u64) -> rmpv::Value {
    rmpv::Value::from(v)
}

/// A single IPROTO session. Requests are strictly sequential.
pub struct Connection<S> {
    stream: S,
    sync: u64,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps a stream whose greeting has already been consumed.
    pub fn from_stream(stream: S) -> Self {
        Self { stream, sync: 0 }
    }

    /// Reads the greeting and authenticates unless `user` is empty or
    /// `guest`.
    pub async fn handshake(mut stream: S, user: &str, password: &str) -> Result<Self> {
        let mut greeting = [0_u8; GREETING_SIZE];
        stream.read_exact(&mut greeting).await?;
        let salt = parse_salt(&greeting)?;
        debug!(
            server = %String::from_utf8_lossy(&greeting[..GREETING_SIZE / 2]).trim(),
            "tarantool greeting"
        );

        let mut conn = Self::from_stream(stream);
        if !user.is_empty() && user != "guest" {
            conn.auth(user, password, &salt).await?;
        }
        Ok(conn)
    }

    async fn auth(&mut self, user: &str, password: &str, salt: &[u8]) -> Result<()> {
        let body = vec![
            (int(key::USER_NAME), rmpv::Value::from(user)),
            (
                int(key::TUPLE),
                rmpv::Value::Array(vec![
                    rmpv::Value::from("chap-sha1"),
                    rmpv::Value::Binary(scramble(salt, password).to_vec()),
                ]),
            ),
        ];
        self.request(code::AUTH, 0, body).await?;
        Ok(())
    }

    /// Sends `PING`.
    pub async fn ping(&mut self) -> Result<()> {
        self.request(code::PING, 0, Vec::new()).await?;
        Ok(())
    }

    /// Evaluates a Lua expression and returns its results.
    pub async fn eval(
        &mut self,
        expr: &str,
        args: &[Value],
        stream_id: u64,
    ) -> Result<Vec<rmpv::Value>> {
        let body = vec![
            (int(key::EXPR), rmpv::Value::from(expr)),
            (
                int(key::TUPLE),
                rmpv::Value::Array(args.iter().map(to_msgpack).collect()),
            ),
        ];
        let response = self.request(code::EVAL, stream_id, body).await?;
        let data = response
            .and_then(|body| take_key(body, key::DATA))
            .unwrap_or(rmpv::Value::Array(Vec::new()));
        match data {
            rmpv::Value::Array(values) => Ok(values),
            other => Err(MigrateError::Protocol(format!(
                "eval returned non-array data: {other}"
            ))),
        }
    }

    /// Sends a stream control request (`BEGIN`, `COMMIT`, `ROLLBACK`).
    pub async fn control(&mut self, request: u64, stream_id: u64) -> Result<()> {
        self.request(request, stream_id, Vec::new()).await?;
        Ok(())
    }

    async fn request(&mut self, request: u64, stream_id: u64, body: Map) -> Result<Option<Map>> {
        self.sync += 1;
        let sync = self.sync;
        let packet = encode_request(request, sync, stream_id, body)?;
        self.stream.write_all(&packet).await?;
        self.stream.flush().await?;

        let payload = read_packet(&mut self.stream).await?;
        let (header, body) = decode_response(&payload)?;

        let response_sync = header_int(&header, key::SYNC).unwrap_or_default();
        if response_sync != sync {
            return Err(MigrateError::Protocol(format!(
                "response sync {response_sync} does not match request {sync}"
            )));
        }
        let status = header_int(&header, key::REQUEST_TYPE).unwrap_or_default();
        if status & code::ERROR_FLAG != 0 {
            let message = body
                .and_then(|b| take_key(b, key::ERROR))
                .and_then(|v| v.as_str().map(ToString::to_string))
                .unwrap_or_default();
            return Err(TarantoolError {
                code: u32::try_from(status & !code::ERROR_FLAG).unwrap_or_default(),
                message,
            }
            .into());
        }
        Ok(body)
    }
}

/// Extracts the salt from the second greeting line.
pub fn parse_salt(greeting: &[u8]) -> Result<Vec<u8>> {
    let line = greeting
        .get(GREETING_SIZE / 2..GREETING_SIZE / 2 + SALT_BASE64_LEN)
        .ok_or_else(|| MigrateError::Protocol("short greeting".into()))?;
    let salt = base64::engine::general_purpose::STANDARD
        .decode(line)
        .map_err(|e| MigrateError::Protocol(format!("invalid greeting salt: {e}")))?;
    if salt.len() < SCRAMBLE_SIZE {
        return Err(MigrateError::Protocol("greeting salt too short".into()));
    }
    Ok(salt[..SCRAMBLE_SIZE].to_vec())
}

/// `chap-sha1` scramble: `sha1(pass) xor sha1(salt ++ sha1(sha1(pass)))`.
pub fn scramble(salt: &[u8], password: &str) -> [u8; SCRAMBLE_SIZE] {
    let step1 = Sha1::digest(password.as_bytes());
    let step2 = Sha1::digest(step1);
    let mut hasher = Sha1::new();
    hasher.update(&salt[..salt.len().min(SCRAMBLE_SIZE)]);
    hasher.update(step2);
    let step3 = hasher.finalize();

    let mut out = [0_u8; SCRAMBLE_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = step1[i] ^ step3[i];
    }
    out
}

/// Encodes a request packet including its length prefix.
pub fn encode_request(request: u64, sync: u64, stream_id: u64, body: Map) -> Result<Vec<u8>> {
    let mut header = vec![(int(key::REQUEST_TYPE), int(request)), (int(key::SYNC), int(sync))];
    if stream_id != 0 {
        header.push((int(key::STREAM_ID), int(stream_id)));
    }

    let mut payload = Vec::with_capacity(64);
    rmpv::encode::write_value(&mut payload, &rmpv::Value::Map(header))
        .map_err(|e| MigrateError::Protocol(e.to_string()))?;
    rmpv::encode::write_value(&mut payload, &rmpv::Value::Map(body))
        .map_err(|e| MigrateError::Protocol(e.to_string()))?;

    let len = u32::try_from(payload.len())
        .map_err(|_| MigrateError::Protocol("request too large".into()))?;
    let mut packet = Vec::with_capacity(payload.len() + 5);
    packet.push(0xce);
    packet.extend_from_slice(&len.to_be_bytes());
    packet.extend_from_slice(&payload);
    Ok(packet)
}

async fn read_packet<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let marker = stream.read_u8().await?;
    let len = match marker {
        0xce => stream.read_u32().await? as usize,
        0xcd => usize::from(stream.read_u16().await?),
        0xcc => usize::from(stream.read_u8().await?),
        fixint if fixint < 0x80 => usize::from(fixint),
        other => {
            return Err(MigrateError::Protocol(format!(
                "unexpected length marker 0x{other:02x}"
            )))
        }
    };
    let mut payload = vec![0_u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

fn decode_response(payload: &[u8]) -> Result<(Map, Option<Map>)> {
    let mut cursor = payload;
    let header = match rmpv::decode::read_value(&mut cursor)
        .map_err(|e| MigrateError::Protocol(e.to_string()))?
    {
        rmpv::Value::Map(map) => map,
        other => {
            return Err(MigrateError::Protocol(format!(
                "response header is not a map: {other}"
            )))
        }
    };
    if cursor.is_empty() {
        return Ok((header, None));
    }
    match rmpv::decode::read_value(&mut cursor).map_err(|e| MigrateError::Protocol(e.to_string()))? {
        rmpv::Value::Map(body) => Ok((header, Some(body))),
        other => Err(MigrateError::Protocol(format!(
            "response body is not a map: {other}"
        ))),
    }
}

fn header_int(map: &Map, wanted: u64) -> Option<u64> {
    map.iter()
        .find(|(k, _)| k.as_u64() == Some(wanted))
        .and_then(|(_, v)| v.as_u64())
}

fn take_key(map: Map, wanted: u64) -> Option<rmpv::Value> {
    map.into_iter()
        .find(|(k, _)| k.as_u64() == Some(wanted))
        .map(|(_, v)| v)
}

fn to_msgpack(value: &Value) -> rmpv::Value {
    match value {
        Value::Null => rmpv::Value::Nil,
        Value::Bool(v) => rmpv::Value::Boolean(*v),
        Value::Int(v) => rmpv::Value::from(*v),
        Value::UInt(v) => rmpv::Value::from(*v),
        Value::Float(v) => rmpv::Value::F64(*v),
        Value::Text(v) => rmpv::Value::from(v.as_str()),
        Value::Bytes(v) => rmpv::Value::Binary(v.clone()),
        Value::Time(v) => rmpv::Value::from(v.timestamp()),
        Value::Tuple(values) => rmpv::Value::Array(values.iter().map(to_msgpack).collect()),
    }
}

fn from_msgpack(value: rmpv::Value) -> Value {
    match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(v) => Value::Bool(v),
        rmpv::Value::Integer(n) => n
            .as_u64()
            .map(Value::UInt)
            .or_else(|| n.as_i64().map(Value::Int))
            .unwrap_or(Value::Null),
        rmpv::Value::F32(v) => Value::Float(f64::from(v)),
        rmpv::Value::F64(v) => Value::Float(v),
        rmpv::Value::String(s) => match s.into_str() {
            Some(text) => Value::Text(text),
            None => Value::Null,
        },
        rmpv::Value::Binary(b) | rmpv::Value::Ext(_, b) => Value::Bytes(b),
        rmpv::Value::Array(items) => Value::Tuple(items.into_iter().map(from_msgpack).collect()),
        map @ rmpv::Value::Map(_) => Value::Text(map.to_string()),
    }
}

/// Turns eval results into rows.
///
/// A single returned array of arrays (a `select` result) yields one row per
/// tuple. Otherwise each returned value is one row: arrays spread into
/// columns, scalars are a single column.
pub fn rows_from_eval(values: Vec<rmpv::Value>) -> Rows {
    let is_tuple_list = matches!(
        values.as_slice(),
        [rmpv::Value::Array(items)] if items.iter().all(|i| matches!(i, rmpv::Value::Array(_)))
    );
    let results = if is_tuple_list {
        match values.into_iter().next() {
            Some(rmpv::Value::Array(items)) => items,
            _ => Vec::new(),
        }
    } else {
        values
    };

    let rows: Vec<Vec<Value>> = results
        .into_iter()
        .map(|result| match from_msgpack(result) {
            Value::Tuple(columns) => columns,
            scalar => vec![scalar],
        })
        .collect();
    let width = rows.first().map_or(0, Vec::len);
    let columns = (1..=width).map(|i| format!("field{i}")).collect();
    Rows::new(columns, rows)
}

/// A [`Connection`] shared between callers.
struct Session<S> {
    conn: Mutex<Connection<S>>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(conn: Connection<S>) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Waits for the session; this is the only cancellable step.
    async fn acquire(&self, ctx: &Context) -> Result<MutexGuard<'_, Connection<S>>> {
        ctx.run(async { Ok::<_, MigrateError>(self.conn.lock().await) })
            .await
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        self.acquire(ctx).await?.ping().await
    }

    async fn eval(
        &self,
        ctx: &Context,
        expr: &str,
        args: &[Value],
        stream_id: u64,
    ) -> Result<Vec<rmpv::Value>> {
        self.acquire(ctx).await?.eval(expr, args, stream_id).await
    }

    async fn control(&self, ctx: &Context, request: u64, stream_id: u64) -> Result<()> {
        self.acquire(ctx).await?.control(request, stream_id).await
    }
}

struct Inner {
    host: String,
    port: u16,
    username: String,
    password: String,
    session: OnceCell<Session<TcpStream>>,
    next_stream: AtomicU64,
}

impl Inner {
    async fn session(&self, ctx: &Context) -> Result<&Session<TcpStream>> {
        ctx.run(self.session.get_or_try_init(|| async {
            let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
            stream.set_nodelay(true)?;
            let conn = Connection::handshake(stream, &self.username, &self.password).await?;
            debug!(host = %self.host, port = self.port, "tarantool connected");
            Ok::<_, MigrateError>(Session::new(conn))
        }))
        .await
    }

    async fn eval(
        &self,
        ctx: &Context,
        expr: &str,
        args: &[Value],
        stream_id: u64,
    ) -> Result<Rows> {
        let values = self
            .session(ctx)
            .await?
            .eval(ctx, expr, args, stream_id)
            .await?;
        Ok(rows_from_eval(values))
    }

    async fn control(&self, ctx: &Context, request: u64, stream_id: u64) -> Result<()> {
        self.session(ctx)
            .await?
            .control(ctx, request, stream_id)
            .await
    }
}

/// Tarantool connection; the socket is opened on first use.
pub struct TarantoolBackend {
    inner: Arc<Inner>,
}

impl TarantoolBackend {
    /// Reads host and credentials from the DSN.
    pub fn open(dsn: &Dsn) -> Result<Self> {
        let (host, port) = split_host_port(dsn.primary(), DEFAULT_PORT)?;
        Ok(Self {
            inner: Arc::new(Inner {
                host,
                port,
                username: dsn.username.clone(),
                password: dsn.password.clone(),
                session: OnceCell::new(),
                next_stream: AtomicU64::new(1),
            }),
        })
    }
}

#[async_trait]
impl Backend for TarantoolBackend {
    fn driver(&self) -> Driver {
        Driver::Tarantool
    }

    async fn ping(&self, ctx: &Context) -> Result<()> {
        self.inner.session(ctx).await?.ping(ctx).await
    }

    async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Rows> {
        self.inner.eval(ctx, query, args, 0).await
    }

    async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.inner.eval(ctx, query, args, 0).await?;
        Ok(ExecResult::unsupported())
    }

    async fn begin(&self, ctx: &Context) -> Result<Arc<dyn Transaction>> {
        let stream_id = self.inner.next_stream.fetch_add(1, Ordering::Relaxed);
        self.inner.control(ctx, code::BEGIN, stream_id).await?;
        Ok(Arc::new(TarantoolTransaction {
            inner: Arc::clone(&self.inner),
            stream_id,
            closed: AtomicBool::new(false),
        }))
    }
}

/// A transaction bound to one IPROTO stream.
pub struct TarantoolTransaction {
    inner: Arc<Inner>,
    stream_id: u64,
    closed: AtomicBool,
}

impl TarantoolTransaction {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MigrateError::TransactionAlreadyClosed);
        }
        Ok(())
    }

    /// Commit and rollback are never cancelled.
    async fn finish(&self, request: u64) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(MigrateError::TransactionAlreadyClosed);
        }
        self.inner
            .control(&Context::new(), request, self.stream_id)
            .await
    }
}

#[async_trait]
impl Transaction for TarantoolTransaction {
    async fn query(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<Rows> {
        self.ensure_open()?;
        self.inner.eval(ctx, query, args, self.stream_id).await
    }

    async fn exec(&self, ctx: &Context, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.ensure_open()?;
        self.inner.eval(ctx, query, args, self.stream_id).await?;
        Ok(ExecResult::unsupported())
    }

    async fn commit(&self) -> Result<()> {
        self.finish(code::COMMIT).await
    }

    async fn rollback(&self) -> Result<()> {
        self.finish(code::ROLLBACK).await
    }
}
