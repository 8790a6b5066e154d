//! The driver collaborator contract.
//!
//! A driver exposes connections, prepared statements and transactions. Beyond
//! the required methods each object may implement optional capabilities, and a
//! driver can offer any subset of them. Capabilities are probed at the call
//! site through the `Option<&dyn _>` accessors on [`Conn`] and [`Stmt`]; the
//! defaults report the capability as absent.

use std::fmt;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{DriverError, DriverResult};

/// A single argument or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// An argument with its 1-based position and optional name.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedValue {
    pub name: Option<String>,
    pub ordinal: usize,
    pub value: Value,
}

impl NamedValue {
    pub fn positional(ordinal: usize, value: impl Into<Value>) -> Self {
        Self {
            name: None,
            ordinal,
            value: value.into(),
        }
    }

    pub fn named(name: impl Into<String>, ordinal: usize, value: impl Into<Value>) -> Self {
        Self {
            name: Some(name.into()),
            ordinal,
            value: value.into(),
        }
    }
}

/// Build positional arguments numbered from 1.
pub fn positional<I, V>(values: I) -> Vec<NamedValue>
where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
{
    values
        .into_iter()
        .enumerate()
        .map(|(i, value)| NamedValue::positional(i + 1, value))
        .collect()
}

/// Argument values in call order, as handed to hooks.
pub fn arg_values(args: &[NamedValue]) -> Vec<Value> {
    args.iter().map(|arg| arg.value.clone()).collect()
}

/// Positional values for connection-level plain capabilities, which cannot
/// carry names.
pub fn named_to_values(args: &[NamedValue]) -> DriverResult<Vec<Value>> {
    args.iter()
        .map(|arg| match arg.name {
            Some(_) => Err(DriverError::NamedParameters),
            None => Ok(arg.value.clone()),
        })
        .collect()
}

/// Place each value at its ordinal, for statement-level plain capabilities.
pub fn ordinal_values(args: &[NamedValue]) -> DriverResult<Vec<Value>> {
    let mut values = vec![Value::Null; args.len()];
    for arg in args {
        let slot = arg
            .ordinal
            .checked_sub(1)
            .and_then(|i| values.get_mut(i))
            .ok_or(DriverError::BadOrdinal(arg.ordinal))?;
        *slot = arg.value.clone();
    }
    Ok(values)
}

/// Outcome of an execute call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    pub last_insert_id: Option<u64>,
}

/// A result set cursor.
pub trait Rows: Send {
    fn columns(&self) -> &[String];

    /// The next row, or `None` once exhausted.
    fn next_row(&mut self) -> DriverResult<Option<Vec<Value>>>;
}

pub type BoxRows = Box<dyn Rows>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Options for [`BeginTx`]. The plain `begin` path only supports the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

#[async_trait]
pub trait Execer: Send + Sync {
    async fn exec(&self, query: &str, args: &[Value]) -> DriverResult<ExecOutcome>;
}

#[async_trait]
pub trait ExecerContext: Send + Sync {
    async fn exec_context(
        &self,
        ctx: &Context,
        query: &str,
        args: &[NamedValue],
    ) -> DriverResult<ExecOutcome>;
}

#[async_trait]
pub trait Queryer: Send + Sync {
    async fn query(&self, query: &str, args: &[Value]) -> DriverResult<BoxRows>;
}

#[async_trait]
pub trait QueryerContext: Send + Sync {
    async fn query_context(
        &self,
        ctx: &Context,
        query: &str,
        args: &[NamedValue],
    ) -> DriverResult<BoxRows>;
}

#[async_trait]
pub trait PrepareContext: Send + Sync {
    async fn prepare_context(&self, ctx: &Context, query: &str) -> DriverResult<Box<dyn Stmt>>;
}

#[async_trait]
pub trait BeginTx: Send + Sync {
    async fn begin_tx(&self, ctx: &Context, opts: TxOptions) -> DriverResult<Box<dyn Tx>>;
}

#[async_trait]
pub trait StmtExecContext: Send + Sync {
    async fn exec_context(&self, ctx: &Context, args: &[NamedValue]) -> DriverResult<ExecOutcome>;
}

#[async_trait]
pub trait StmtQueryContext: Send + Sync {
    async fn query_context(&self, ctx: &Context, args: &[NamedValue]) -> DriverResult<BoxRows>;
}

/// A database connection.
#[async_trait]
pub trait Conn: Send + Sync {
    async fn prepare(&self, query: &str) -> DriverResult<Box<dyn Stmt>>;

    async fn begin(&self) -> DriverResult<Box<dyn Tx>>;

    async fn close(&self) -> DriverResult<()>;

    fn execer(&self) -> Option<&dyn Execer> {
        None
    }

    fn execer_context(&self) -> Option<&dyn ExecerContext> {
        None
    }

    fn queryer(&self) -> Option<&dyn Queryer> {
        None
    }

    fn queryer_context(&self) -> Option<&dyn QueryerContext> {
        None
    }

    fn prepare_context(&self) -> Option<&dyn PrepareContext> {
        None
    }

    fn begin_tx(&self) -> Option<&dyn BeginTx> {
        None
    }
}

/// A prepared statement. Does not remember its query text.
#[async_trait]
pub trait Stmt: Send + Sync {
    /// Number of placeholders, if the driver knows it.
    fn num_input(&self) -> Option<usize>;

    async fn exec(&self, args: &[Value]) -> DriverResult<ExecOutcome>;

    async fn query(&self, args: &[Value]) -> DriverResult<BoxRows>;

    async fn close(&self) -> DriverResult<()>;

    fn exec_context(&self) -> Option<&dyn StmtExecContext> {
        None
    }

    fn query_context(&self) -> Option<&dyn StmtQueryContext> {
        None
    }
}

#[async_trait]
pub trait Tx: Send + Sync {
    async fn commit(&mut self) -> DriverResult<()>;

    async fn rollback(&mut self) -> DriverResult<()>;
}

/// Opens connections by data source name.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn open(&self, name: &str) -> DriverResult<Box<dyn Conn>>;
}

/// Execute `query` the way a generic database layer would: directly when the
/// connection can, otherwise (or when the driver declines with
/// [`DriverError::Skip`]) through prepare + execute + close.
pub async fn exec(
    conn: &dyn Conn,
    ctx: &Context,
    query: &str,
    args: &[NamedValue],
) -> DriverResult<ExecOutcome> {
    let direct = if let Some(execer) = conn.execer_context() {
        execer.exec_context(ctx, query, args).await
    } else if let Some(execer) = conn.execer() {
        execer.exec(query, &named_to_values(args)?).await
    } else {
        Err(DriverError::Skip)
    };

    match direct {
        Err(DriverError::Skip) => exec_prepared(conn, ctx, query, args).await,
        other => other,
    }
}

/// Execute `query` through prepare + execute + close. An execute error wins
/// over a close error.
pub async fn exec_prepared(
    conn: &dyn Conn,
    ctx: &Context,
    query: &str,
    args: &[NamedValue],
) -> DriverResult<ExecOutcome> {
    let stmt = match conn.prepare_context() {
        Some(preparer) => preparer.prepare_context(ctx, query).await?,
        None => conn.prepare(query).await?,
    };
    let result = match stmt.exec_context() {
        Some(execer) => execer.exec_context(ctx, args).await,
        None => match ordinal_values(args) {
            Ok(values) => stmt.exec(&values).await,
            Err(err) => Err(err),
        },
    };
    let closed = stmt.close().await;
    let outcome = result?;
    closed?;
    Ok(outcome)
}

/// Run `query` through a prepared statement. The statement lives as long as
/// the returned rows.
pub async fn query_prepared(
    conn: &dyn Conn,
    ctx: &Context,
    query: &str,
    args: &[NamedValue],
) -> DriverResult<BoxRows> {
    let stmt = match conn.prepare_context() {
        Some(preparer) => preparer.prepare_context(ctx, query).await?,
        None => conn.prepare(query).await?,
    };
    let rows = match stmt.query_context() {
        Some(queryer) => queryer.query_context(ctx, args).await,
        None => match ordinal_values(args) {
            Ok(values) => stmt.query(&values).await,
            Err(err) => Err(err),
        },
    };
    match rows {
        Ok(rows) => Ok(Box::new(PreparedRows { rows, _stmt: stmt })),
        Err(err) => {
            // The query error takes precedence.
            let _ = stmt.close().await;
            Err(err)
        }
    }
}

struct PreparedRows {
    rows: BoxRows,
    _stmt: Box<dyn Stmt>,
}

impl Rows for PreparedRows {
    fn columns(&self) -> &[String] {
        self.rows.columns()
    }

    fn next_row(&mut self) -> DriverResult<Option<Vec<Value>>> {
        self.rows.next_row()
    }
}
