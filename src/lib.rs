//! # sql-monitor
//!
//! Transparent SQL instrumentation: call counts, latency histograms, slow-query
//! logs, multi-table-read warnings, write audit logs and long-transaction
//! alerts for every statement an application sends to its database.
//!
//! Instrumentation is a wrapper around the database client. Applications keep
//! their client API; every execute and query is classified (operation kind and
//! referenced tables) and reported after it completes.
//!
//! ## Features
//!
//! - **Driver Wrapping**: [`wrap`] instruments any [`Driver`], forwarding every
//!   optional capability the wrapped driver offers
//! - **SeaORM Integration**: [`MonitoredConnection`] is a drop-in `ConnectionTrait`
//!   and `TransactionTrait` implementation
//! - **SQL Classification**: operation kind and tables via `sqlparser`, with
//!   sharded table names folded to one logical name
//! - **Policy Logging**: slow queries, multi-table reads and writes are logged
//!   through `tracing`
//! - **Metrics**: `client_handle_total` and `client_handle_seconds` through the
//!   `metrics` facade
//! - **Key-value Commands**: [`KvMonitor`] applies the same counting and timing
//!   to key-value clients
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sea_orm::Database;
//! use sql_monitor::{MonitorConfig, MonitoredConnection, SqlMonitor, TableNormalizer};
//!
//! let db = Database::connect("mysql://localhost/orders").await?;
//! let monitor = SqlMonitor::new(
//!     MonitorConfig::default()
//!         .with_app("billing")
//!         .with_database_name("orders")
//!         .with_table_normalizer(TableNormalizer::shard_suffix()),
//! );
//! let db = MonitoredConnection::new(db, monitor);
//!
//! // Use it exactly like a normal DatabaseConnection
//! let users = Users::find().all(&db).await?;
//! ```
//!
//! ## Log Records
//!
//! Records are `tracing` events on target `sql_monitor`. The `metric_type`
//! field tells them apart:
//!
//! | `metric_type` | Level | When |
//! |---------------|-------|------|
//! | `slowLog` | ERROR | A call took at least the slow-query threshold (1s) |
//! | `multiTables` | WARN | A fast SELECT read more than one table |
//! | `oplog` | INFO | An INSERT, UPDATE or DELETE completed |
//! | `longTx` | ERROR | A transaction ended at least 8s after it began |
//!
//! Every record carries `cost`, `query`, `args`, `app`, `db_name`,
//! `table_name` and `op`.

mod classify;
mod config;
mod connection;
mod context;
pub mod driver;
mod error;
mod hooks;
pub mod kv;
mod monitor;
mod policy;
mod registry;
mod sink;
mod wrap;

pub use classify::{Classification, Classifier, ClassifyError, SqlDialect, SqlOp, TableNormalizer};
pub use config::MonitorConfig;
pub use connection::{backend_config, MonitorExt, MonitoredConnection, MonitoredTransaction};
pub use context::{CallContext, Context};
pub use driver::{Conn, Driver, Stmt, Tx, Value};
pub use error::{DriverError, DriverResult, HookError, ObservedError};
pub use hooks::{HookErrorPolicy, Hooks, Interceptor, TxOutcome};
pub use kv::{HookedCommandClient, KeyPrefixes, KvMonitor};
pub use monitor::SqlMonitor;
pub use policy::{Action, LogTag, Thresholds};
pub use registry::{DbInfo, DbRegistry, PoolLimits};
pub use sink::{
    LogRecord, LogSink, MemorySink, MetricKind, MetricSample, MetricsFacade, MetricsSink,
    TracingLogSink, CLIENT_HANDLE_SECONDS, CLIENT_HANDLE_TOTAL, DEFAULT_MAX_FIELD_LEN,
};
pub use wrap::{wrap, HookedConn, HookedDriver, HookedStmt, HookedTx};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{MonitorConfig, MonitorExt, MonitoredConnection, SqlMonitor, TableNormalizer};
}
