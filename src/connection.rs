//! Monitored SeaORM connection wrapper.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use async_trait::async_trait;
use sea_orm::{
    AccessMode, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr,
    ExecResult, IsolationLevel, QueryResult, Statement, TransactionError, TransactionTrait,
};

use crate::classify::SqlDialect;
use crate::config::MonitorConfig;
use crate::context::Context;
use crate::driver::Value;
use crate::error::{HookError, ObservedError};
use crate::hooks::{Interceptor, TxOutcome};
use crate::monitor::SqlMonitor;

/// A monitored wrapper around SeaORM's `DatabaseConnection`.
///
/// Implements `ConnectionTrait` and `TransactionTrait`, so it can be passed
/// anywhere a `DatabaseConnection` is accepted. Every statement runs through
/// the hook lifecycle. Transactions opened with
/// [`MonitoredConnection::begin_monitored`] or run through
/// [`TransactionTrait::transaction`] report their duration when they end;
/// the plain `DatabaseTransaction` returned by [`TransactionTrait::begin`] and
/// [`TransactionTrait::begin_with_config`] is not timed.
///
/// Statements issued inside a [`TransactionTrait::transaction`] callback run on
/// the plain `DatabaseTransaction` SeaORM hands to the callback and are only
/// covered by the transaction timing. Use [`MonitoredConnection::begin_monitored`]
/// to have them classified too.
///
/// # Example
///
/// ```rust,ignore
/// use sea_orm::Database;
/// use sql_monitor::MonitoredConnection;
///
/// let db = Database::connect("mysql://localhost/orders").await?;
/// let monitored = MonitoredConnection::from(db);
///
/// // Every query is now classified, measured and audited
/// let users = Users::find().all(&monitored).await?;
/// ```
#[derive(Debug, Clone)]
pub struct MonitoredConnection {
    inner: DatabaseConnection,
    interceptor: Interceptor,
}

impl MonitoredConnection {
    /// Create a monitored connection reporting through `monitor`.
    pub fn new(connection: DatabaseConnection, monitor: SqlMonitor) -> Self {
        Self::with_interceptor(connection, monitor.into_interceptor())
    }

    pub fn with_interceptor(connection: DatabaseConnection, interceptor: Interceptor) -> Self {
        Self {
            inner: connection,
            interceptor,
        }
    }

    /// Create a monitored connection with the default configuration for the
    /// connection's backend.
    pub fn wrap(connection: DatabaseConnection) -> Self {
        let config = backend_config(connection.get_database_backend());
        Self::new(connection, SqlMonitor::new(config))
    }

    /// Get a reference to the underlying `DatabaseConnection`.
    pub fn inner(&self) -> &DatabaseConnection {
        &self.inner
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    /// Consume the wrapper and return the inner `DatabaseConnection`.
    pub fn into_inner(self) -> DatabaseConnection {
        self.inner
    }

    pub async fn close(self) -> Result<(), DbErr> {
        self.inner.close().await
    }

    /// Begin a transaction whose statements are monitored individually.
    pub async fn begin_monitored(&self) -> Result<MonitoredTransaction, DbErr> {
        let tx = self.inner.begin().await?;
        Ok(MonitoredTransaction::new(tx, self.interceptor.clone()))
    }

    fn end_transaction<T, E>(&self, begin: Instant, result: &Result<T, TransactionError<E>>)
    where
        E: std::fmt::Display + std::fmt::Debug,
    {
        let outcome = if result.is_ok() {
            TxOutcome::Commit
        } else {
            TxOutcome::Rollback
        };
        self.interceptor
            .hooks()
            .on_transaction_end(begin.elapsed(), outcome);
    }
}

/// Default monitor configuration for a SeaORM backend.
pub fn backend_config(backend: DbBackend) -> MonitorConfig {
    let (dialect, system) = match backend {
        DbBackend::MySql => (SqlDialect::MySql, "mysql"),
        DbBackend::Postgres => (SqlDialect::Postgres, "postgresql"),
        DbBackend::Sqlite => (SqlDialect::Sqlite, "sqlite"),
    };
    MonitorConfig::default()
        .with_dialect(dialect)
        .with_system(system)
}

impl From<DatabaseConnection> for MonitoredConnection {
    fn from(connection: DatabaseConnection) -> Self {
        Self::wrap(connection)
    }
}

impl AsRef<DatabaseConnection> for MonitoredConnection {
    fn as_ref(&self) -> &DatabaseConnection {
        &self.inner
    }
}

impl From<HookError> for DbErr {
    fn from(err: HookError) -> Self {
        DbErr::Custom(err.to_string())
    }
}

impl ObservedError for DbErr {}

/// Arguments bound to `stmt`, in placeholder order.
fn statement_args(stmt: &Statement) -> Vec<Value> {
    stmt.values
        .as_ref()
        .map(|values| values.0.iter().map(convert_value).collect())
        .unwrap_or_default()
}

fn convert_value(value: &sea_orm::Value) -> Value {
    use sea_orm::Value as V;

    match value {
        V::Bool(v) => (*v).into(),
        V::TinyInt(v) => v.map(i64::from).into(),
        V::SmallInt(v) => v.map(i64::from).into(),
        V::Int(v) => v.map(i64::from).into(),
        V::BigInt(v) => (*v).into(),
        V::TinyUnsigned(v) => v.map(u64::from).into(),
        V::SmallUnsigned(v) => v.map(u64::from).into(),
        V::Unsigned(v) => v.map(u64::from).into(),
        V::BigUnsigned(v) => (*v).into(),
        V::Float(v) => v.map(f64::from).into(),
        V::Double(v) => (*v).into(),
        V::String(v) => v.as_deref().cloned().into(),
        V::Char(v) => v.map(String::from).into(),
        V::Bytes(v) => v.as_deref().cloned().into(),
        other => Value::Text(format!("{other:?}")),
    }
}

#[async_trait]
impl ConnectionTrait for MonitoredConnection {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        let sql = stmt.sql.clone();
        let args = statement_args(&stmt);
        self.interceptor
            .intercept(&Context::background(), &sql, &args, move || {
                self.inner.execute(stmt)
            })
            .await
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        self.interceptor
            .intercept(&Context::background(), sql, &[], move || {
                self.inner.execute_unprepared(sql)
            })
            .await
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        let sql = stmt.sql.clone();
        let args = statement_args(&stmt);
        self.interceptor
            .intercept(&Context::background(), &sql, &args, move || {
                self.inner.query_one(stmt)
            })
            .await
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let sql = stmt.sql.clone();
        let args = statement_args(&stmt);
        self.interceptor
            .intercept(&Context::background(), &sql, &args, move || {
                self.inner.query_all(stmt)
            })
            .await
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

#[async_trait]
impl TransactionTrait for MonitoredConnection {
    async fn begin(&self) -> Result<DatabaseTransaction, DbErr> {
        self.inner.begin().await
    }

    async fn begin_with_config(
        &self,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<DatabaseTransaction, DbErr> {
        self.inner
            .begin_with_config(isolation_level, access_mode)
            .await
    }

    async fn transaction<F, T, E>(&self, callback: F) -> Result<T, TransactionError<E>>
    where
        F: for<'c> FnOnce(
                &'c DatabaseTransaction,
            ) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'c>>
            + Send,
        T: Send,
        E: std::fmt::Display + std::fmt::Debug + Send,
    {
        let begin = Instant::now();
        let result = self.inner.transaction(callback).await;
        self.end_transaction(begin, &result);
        result
    }

    async fn transaction_with_config<F, T, E>(
        &self,
        callback: F,
        isolation_level: Option<IsolationLevel>,
        access_mode: Option<AccessMode>,
    ) -> Result<T, TransactionError<E>>
    where
        F: for<'c> FnOnce(
                &'c DatabaseTransaction,
            ) -> Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'c>>
            + Send,
        T: Send,
        E: std::fmt::Display + std::fmt::Debug + Send,
    {
        let begin = Instant::now();
        let result = self
            .inner
            .transaction_with_config(callback, isolation_level, access_mode)
            .await;
        self.end_transaction(begin, &result);
        result
    }
}

/// A transaction whose statements run through the hook lifecycle and whose
/// duration is reported on commit or rollback.
pub struct MonitoredTransaction {
    inner: DatabaseTransaction,
    interceptor: Interceptor,
    begin: Instant,
}

impl MonitoredTransaction {
    pub fn new(tx: DatabaseTransaction, interceptor: Interceptor) -> Self {
        Self {
            inner: tx,
            interceptor,
            begin: Instant::now(),
        }
    }

    pub fn inner(&self) -> &DatabaseTransaction {
        &self.inner
    }

    pub async fn commit(self) -> Result<(), DbErr> {
        let result = self.inner.commit().await;
        self.interceptor
            .hooks()
            .on_transaction_end(self.begin.elapsed(), TxOutcome::Commit);
        result
    }

    pub async fn rollback(self) -> Result<(), DbErr> {
        let result = self.inner.rollback().await;
        self.interceptor
            .hooks()
            .on_transaction_end(self.begin.elapsed(), TxOutcome::Rollback);
        result
    }
}

impl std::fmt::Debug for MonitoredTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredTransaction")
            .field("begin", &self.begin)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ConnectionTrait for MonitoredTransaction {
    fn get_database_backend(&self) -> DbBackend {
        self.inner.get_database_backend()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, DbErr> {
        let sql = stmt.sql.clone();
        let args = statement_args(&stmt);
        self.interceptor
            .intercept(&Context::background(), &sql, &args, move || {
                self.inner.execute(stmt)
            })
            .await
    }

    async fn execute_unprepared(&self, sql: &str) -> Result<ExecResult, DbErr> {
        self.interceptor
            .intercept(&Context::background(), sql, &[], move || {
                self.inner.execute_unprepared(sql)
            })
            .await
    }

    async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, DbErr> {
        let sql = stmt.sql.clone();
        let args = statement_args(&stmt);
        self.interceptor
            .intercept(&Context::background(), &sql, &args, move || {
                self.inner.query_one(stmt)
            })
            .await
    }

    async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, DbErr> {
        let sql = stmt.sql.clone();
        let args = statement_args(&stmt);
        self.interceptor
            .intercept(&Context::background(), &sql, &args, move || {
                self.inner.query_all(stmt)
            })
            .await
    }

    fn support_returning(&self) -> bool {
        self.inner.support_returning()
    }

    fn is_mock_connection(&self) -> bool {
        self.inner.is_mock_connection()
    }
}

/// Extension trait for easy wrapping of database connections.
pub trait MonitorExt {
    /// Wrap this connection with the default monitor for its backend.
    fn with_monitoring(self) -> MonitoredConnection;

    /// Wrap this connection with a custom monitor.
    fn with_monitor(self, monitor: SqlMonitor) -> MonitoredConnection;
}

impl MonitorExt for DatabaseConnection {
    fn with_monitoring(self) -> MonitoredConnection {
        MonitoredConnection::wrap(self)
    }

    fn with_monitor(self, monitor: SqlMonitor) -> MonitoredConnection {
        MonitoredConnection::new(self, monitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::LogTag;
    use crate::sink::MemorySink;
    use sea_orm::{MockDatabase, MockExecResult};
    use std::sync::Arc;
    use std::time::Duration;

    fn monitored(
        db: DatabaseConnection,
        config: MonitorConfig,
    ) -> (MonitoredConnection, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let monitor = SqlMonitor::new(config.with_database_name("test"))
            .with_metrics_sink(sink.clone())
            .with_log_sink(sink.clone());
        (MonitoredConnection::new(db, monitor), sink)
    }

    fn exec_result(rows_affected: u64) -> MockExecResult {
        MockExecResult {
            last_insert_id: 0,
            rows_affected,
        }
    }

    #[tokio::test]
    async fn test_execute_writes_audit_log() {
        let db = MockDatabase::new(DbBackend::MySql)
            .append_exec_results([exec_result(1)])
            .into_connection();
        let (conn, sink) = monitored(db, MonitorConfig::default());

        let result = conn
            .execute(Statement::from_sql_and_values(
                DbBackend::MySql,
                "UPDATE t_user SET name = ? WHERE id = ?",
                ["x".into(), 1i32.into()],
            ))
            .await
            .unwrap();

        assert_eq!(result.rows_affected(), 1);
        let audit = sink.logs_tagged(LogTag::OpLog);
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].table, "t_user");
        assert_eq!(audit[0].op.as_deref(), Some("update"));
        assert_eq!(audit[0].args, "[x 1]");
        assert_eq!(audit[0].db_name, "test");
        assert_eq!(sink.metrics().len(), 2);
    }

    #[tokio::test]
    async fn test_execute_error_is_returned_and_logged() {
        let db = MockDatabase::new(DbBackend::MySql)
            .append_exec_errors([DbErr::Custom("deadlock found".into())])
            .into_connection();
        let (conn, sink) = monitored(db, MonitorConfig::default());

        let err = conn
            .execute_unprepared("DELETE FROM users WHERE id = 3")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("deadlock found"));
        let logs = sink.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "query failed");
        assert_eq!(logs[0].table, "users");
        assert!(sink.logs_tagged(LogTag::OpLog).is_empty());
    }

    #[tokio::test]
    async fn test_monitored_transaction_reports_long_commit() {
        let db = MockDatabase::new(DbBackend::MySql)
            .append_exec_results([exec_result(2)])
            .into_connection();
        let (conn, sink) = monitored(
            db,
            MonitorConfig::default().with_long_transaction_threshold(Duration::ZERO),
        );

        let tx = conn.begin_monitored().await.unwrap();
        tx.execute_unprepared("INSERT INTO audit (id) VALUES (1)")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(sink.logs_tagged(LogTag::OpLog).len(), 1);
        let long = sink.logs_tagged(LogTag::LongTx);
        assert_eq!(long.len(), 1);
        assert_eq!(long[0].op.as_deref(), Some("commit"));
    }

    #[tokio::test]
    async fn test_transaction_callback_is_timed() {
        let db = MockDatabase::new(DbBackend::MySql)
            .append_exec_results([exec_result(1)])
            .into_connection();
        let (conn, sink) = monitored(
            db,
            MonitorConfig::default().with_long_transaction_threshold(Duration::ZERO),
        );

        conn.transaction::<_, (), DbErr>(|txn| {
            Box::pin(async move {
                txn.execute_unprepared("DELETE FROM sessions").await?;
                Ok(())
            })
        })
        .await
        .unwrap();

        let long = sink.logs_tagged(LogTag::LongTx);
        assert_eq!(long.len(), 1);
        assert_eq!(long[0].op.as_deref(), Some("commit"));
    }

    #[tokio::test]
    async fn test_plain_begin_is_not_timed() {
        let db = MockDatabase::new(DbBackend::MySql).into_connection();
        let (conn, sink) = monitored(
            db,
            MonitorConfig::default().with_long_transaction_threshold(Duration::ZERO),
        );

        let tx = TransactionTrait::begin(&conn).await.unwrap();
        tx.commit().await.unwrap();

        assert!(sink.logs_tagged(LogTag::LongTx).is_empty());
    }

    #[test]
    fn test_backend_config() {
        let config = backend_config(DbBackend::Postgres);
        assert_eq!(config.dialect, SqlDialect::Postgres);
        assert_eq!(config.system, "postgresql");
        assert_eq!(backend_config(DbBackend::MySql).system, "mysql");
    }

    #[test]
    fn test_convert_value() {
        assert_eq!(convert_value(&sea_orm::Value::Int(Some(7))), Value::Int(7));
        assert_eq!(convert_value(&sea_orm::Value::Int(None)), Value::Null);
        assert_eq!(
            convert_value(&sea_orm::Value::String(Some(Box::new("a".into())))),
            Value::Text("a".into())
        );
        assert_eq!(convert_value(&sea_orm::Value::Char(Some('z'))), Value::Text("z".into()));
    }
}
