//! Capability-forwarding wrappers around driver objects.
//!
//! The wrappers present the same contract as the objects they own and run the
//! hook lifecycle around every execute and query. For each operation they use
//! the context-aware capability of the wrapped object when it has one and fall
//! back to the plain variant otherwise. On the fallback path the caller's
//! [`Context`] is dropped, so its deadline cannot cancel a call that has
//! already been dispatched.

use std::time::Instant;

use async_trait::async_trait;

use crate::context::{CallContext, Context};
use crate::driver::{
    arg_values, exec_prepared, named_to_values, ordinal_values, positional, query_prepared,
    BeginTx, BoxRows, Conn, Driver, ExecOutcome, ExecerContext, NamedValue, PrepareContext,
    QueryerContext, Stmt, StmtExecContext, StmtQueryContext, Tx, TxOptions, Value,
};
use crate::error::{DriverError, DriverResult};
use crate::hooks::{Interceptor, TxOutcome};

/// Wrap `driver` so every connection it opens is instrumented.
pub fn wrap<D: Driver>(driver: D, interceptor: Interceptor) -> HookedDriver<D> {
    HookedDriver {
        inner: driver,
        interceptor,
    }
}

/// A driver whose connections run the hook lifecycle.
#[derive(Debug)]
pub struct HookedDriver<D> {
    inner: D,
    interceptor: Interceptor,
}

impl<D> HookedDriver<D> {
    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

#[async_trait]
impl<D: Driver> Driver for HookedDriver<D> {
    async fn open(&self, name: &str) -> DriverResult<Box<dyn Conn>> {
        let conn = self.inner.open(name).await?;
        Ok(Box::new(HookedConn::from_boxed(conn, self.interceptor.clone())))
    }
}

/// An instrumented connection.
///
/// Advertises `ExecerContext` / `QueryerContext` only when the wrapped
/// connection has either variant of the capability, so generic callers keep
/// their prepare-based fallback for connections that offer neither.
pub struct HookedConn {
    inner: Box<dyn Conn>,
    interceptor: Interceptor,
}

impl HookedConn {
    pub fn new(conn: impl Conn + 'static, interceptor: Interceptor) -> Self {
        Self::from_boxed(Box::new(conn), interceptor)
    }

    pub fn from_boxed(conn: Box<dyn Conn>, interceptor: Interceptor) -> Self {
        Self {
            inner: conn,
            interceptor,
        }
    }

    /// Get a reference to the wrapped connection.
    pub fn inner(&self) -> &dyn Conn {
        self.inner.as_ref()
    }

    /// Dispatch to the wrapped connection. A decline is completed here through
    /// the wrapped connection's prepared path; callers never see
    /// [`DriverError::Skip`].
    async fn dispatch_exec(
        &self,
        ctx: &Context,
        query: &str,
        args: &[NamedValue],
    ) -> DriverResult<ExecOutcome> {
        let direct = if let Some(execer) = self.inner.execer_context() {
            execer.exec_context(ctx, query, args).await
        } else if let Some(execer) = self.inner.execer() {
            let values = named_to_values(args)?;
            execer.exec(query, &values).await
        } else {
            Err(DriverError::Skip)
        };
        match direct {
            Err(DriverError::Skip) => exec_prepared(self.inner.as_ref(), ctx, query, args).await,
            other => other,
        }
    }

    async fn dispatch_query(
        &self,
        ctx: &Context,
        query: &str,
        args: &[NamedValue],
    ) -> DriverResult<BoxRows> {
        let direct = if let Some(queryer) = self.inner.queryer_context() {
            queryer.query_context(ctx, query, args).await
        } else if let Some(queryer) = self.inner.queryer() {
            let values = named_to_values(args)?;
            queryer.query(query, &values).await
        } else {
            Err(DriverError::Skip)
        };
        match direct {
            Err(DriverError::Skip) => query_prepared(self.inner.as_ref(), ctx, query, args).await,
            other => other,
        }
    }

    async fn prepare_with(&self, ctx: &Context, query: &str) -> DriverResult<Box<dyn Stmt>> {
        let begin = Instant::now();
        let prepared = match self.inner.prepare_context() {
            Some(preparer) => preparer.prepare_context(ctx, query).await,
            None => self.inner.prepare(query).await,
        };

        match prepared {
            Ok(stmt) => Ok(Box::new(HookedStmt::new(
                stmt,
                self.interceptor.clone(),
                query,
            ))),
            Err(err) => {
                let call = CallContext::unclassified(begin);
                self.interceptor.hooks().on_error(&call, &err, query, &[]);
                Err(err)
            }
        }
    }

    async fn begin_with(&self, ctx: &Context, opts: TxOptions) -> DriverResult<Box<dyn Tx>> {
        let tx = match self.inner.begin_tx() {
            Some(beginner) => beginner.begin_tx(ctx, opts).await?,
            None if opts == TxOptions::default() => self.inner.begin().await?,
            None => return Err(DriverError::Unsupported("non-default transaction options")),
        };
        Ok(Box::new(HookedTx::new(tx, self.interceptor.clone())))
    }
}

#[async_trait]
impl Conn for HookedConn {
    async fn prepare(&self, query: &str) -> DriverResult<Box<dyn Stmt>> {
        self.prepare_with(&Context::background(), query).await
    }

    async fn begin(&self) -> DriverResult<Box<dyn Tx>> {
        self.begin_with(&Context::background(), TxOptions::default())
            .await
    }

    async fn close(&self) -> DriverResult<()> {
        self.inner.close().await
    }

    fn execer_context(&self) -> Option<&dyn ExecerContext> {
        let capable = self.inner.execer_context().is_some() || self.inner.execer().is_some();
        capable.then_some(self as &dyn ExecerContext)
    }

    fn queryer_context(&self) -> Option<&dyn QueryerContext> {
        let capable = self.inner.queryer_context().is_some() || self.inner.queryer().is_some();
        capable.then_some(self as &dyn QueryerContext)
    }

    fn prepare_context(&self) -> Option<&dyn PrepareContext> {
        Some(self)
    }

    fn begin_tx(&self) -> Option<&dyn BeginTx> {
        Some(self)
    }
}

#[async_trait]
impl ExecerContext for HookedConn {
    async fn exec_context(
        &self,
        ctx: &Context,
        query: &str,
        args: &[NamedValue],
    ) -> DriverResult<ExecOutcome> {
        let values = arg_values(args);
        self.interceptor
            .intercept(ctx, query, &values, move || {
                self.dispatch_exec(ctx, query, args)
            })
            .await
    }
}

#[async_trait]
impl QueryerContext for HookedConn {
    async fn query_context(
        &self,
        ctx: &Context,
        query: &str,
        args: &[NamedValue],
    ) -> DriverResult<BoxRows> {
        let values = arg_values(args);
        self.interceptor
            .intercept(ctx, query, &values, move || {
                self.dispatch_query(ctx, query, args)
            })
            .await
    }
}

#[async_trait]
impl PrepareContext for HookedConn {
    async fn prepare_context(&self, ctx: &Context, query: &str) -> DriverResult<Box<dyn Stmt>> {
        self.prepare_with(ctx, query).await
    }
}

#[async_trait]
impl BeginTx for HookedConn {
    async fn begin_tx(&self, ctx: &Context, opts: TxOptions) -> DriverResult<Box<dyn Tx>> {
        self.begin_with(ctx, opts).await
    }
}

/// An instrumented prepared statement.
///
/// Keeps the query text it was prepared from, since driver statements do not,
/// and reports it on every execute and query.
pub struct HookedStmt {
    inner: Box<dyn Stmt>,
    interceptor: Interceptor,
    query: String,
}

impl HookedStmt {
    pub fn new(stmt: Box<dyn Stmt>, interceptor: Interceptor, query: impl Into<String>) -> Self {
        Self {
            inner: stmt,
            interceptor,
            query: query.into(),
        }
    }

    pub fn query_text(&self) -> &str {
        &self.query
    }
}

#[async_trait]
impl Stmt for HookedStmt {
    fn num_input(&self) -> Option<usize> {
        self.inner.num_input()
    }

    async fn exec(&self, args: &[Value]) -> DriverResult<ExecOutcome> {
        let named = positional(args.iter().cloned());
        StmtExecContext::exec_context(self, &Context::background(), &named).await
    }

    async fn query(&self, args: &[Value]) -> DriverResult<BoxRows> {
        let named = positional(args.iter().cloned());
        StmtQueryContext::query_context(self, &Context::background(), &named).await
    }

    async fn close(&self) -> DriverResult<()> {
        self.inner.close().await
    }

    fn exec_context(&self) -> Option<&dyn StmtExecContext> {
        Some(self)
    }

    fn query_context(&self) -> Option<&dyn StmtQueryContext> {
        Some(self)
    }
}

#[async_trait]
impl StmtExecContext for HookedStmt {
    async fn exec_context(&self, ctx: &Context, args: &[NamedValue]) -> DriverResult<ExecOutcome> {
        let values = arg_values(args);
        let inner = self.inner.as_ref();
        self.interceptor
            .intercept(ctx, &self.query, &values, move || async move {
                match inner.exec_context() {
                    Some(execer) => execer.exec_context(ctx, args).await,
                    None => inner.exec(&ordinal_values(args)?).await,
                }
            })
            .await
    }
}

#[async_trait]
impl StmtQueryContext for HookedStmt {
    async fn query_context(&self, ctx: &Context, args: &[NamedValue]) -> DriverResult<BoxRows> {
        let values = arg_values(args);
        let inner = self.inner.as_ref();
        self.interceptor
            .intercept(ctx, &self.query, &values, move || async move {
                match inner.query_context() {
                    Some(queryer) => queryer.query_context(ctx, args).await,
                    None => inner.query(&ordinal_values(args)?).await,
                }
            })
            .await
    }
}

/// An instrumented transaction that reports its total duration when it ends.
pub struct HookedTx {
    inner: Box<dyn Tx>,
    interceptor: Interceptor,
    begin: Instant,
}

impl HookedTx {
    pub fn new(tx: Box<dyn Tx>, interceptor: Interceptor) -> Self {
        Self {
            inner: tx,
            interceptor,
            begin: Instant::now(),
        }
    }

    pub fn begun_at(&self) -> Instant {
        self.begin
    }

    fn finish(&self, outcome: TxOutcome) {
        self.interceptor
            .hooks()
            .on_transaction_end(self.begin.elapsed(), outcome);
    }
}

#[async_trait]
impl Tx for HookedTx {
    async fn commit(&mut self) -> DriverResult<()> {
        let result = self.inner.commit().await;
        self.finish(TxOutcome::Commit);
        result
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        let result = self.inner.rollback().await;
        self.finish(TxOutcome::Rollback);
        result
    }
}
