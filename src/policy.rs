//! Maps timing and classification onto observability actions.

use std::time::Duration;

use tracing::Level;

use crate::classify::SqlOp;

/// Metric-type tag carried by policy log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogTag {
    SlowLog,
    MultiTables,
    OpLog,
    LongTx,
}

impl LogTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogTag::SlowLog => "slowLog",
            LogTag::MultiTables => "multiTables",
            LogTag::OpLog => "oplog",
            LogTag::LongTx => "longTx",
        }
    }
}

/// What the `after` hook should do for one completed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Observe latency in the per-(operation, table) histogram.
    RecordLatency,
    SlowQuery,
    MultiTableRead,
    WriteAudit,
}

impl Action {
    /// Log tag of the record this action emits, if any.
    pub fn tag(&self) -> Option<LogTag> {
        match self {
            Action::RecordLatency => None,
            Action::SlowQuery => Some(LogTag::SlowLog),
            Action::MultiTableRead => Some(LogTag::MultiTables),
            Action::WriteAudit => Some(LogTag::OpLog),
        }
    }

    pub fn level(&self) -> Option<Level> {
        match self {
            Action::RecordLatency => None,
            Action::SlowQuery => Some(Level::ERROR),
            Action::MultiTableRead => Some(Level::WARN),
            Action::WriteAudit => Some(Level::INFO),
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Action::RecordLatency => "latency recorded",
            Action::SlowQuery => "slow query",
            Action::MultiTableRead => "multi-table read",
            Action::WriteAudit => "write operation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Calls at or above this duration are slow queries.
    pub slow_query: Duration,
    /// Transactions held at least this long are long transactions.
    pub long_transaction: Duration,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            slow_query: Duration::from_secs(1),
            long_transaction: Duration::from_millis(8000),
        }
    }
}

/// Decide the actions for a completed call.
///
/// `has_table` says whether a primary table was found; latency is only
/// recorded for classified calls with a table to label it with. Slow query and
/// multi-table read are mutually exclusive.
pub fn decide(
    op: Option<SqlOp>,
    has_table: bool,
    multi_table: bool,
    elapsed: Duration,
    thresholds: &Thresholds,
) -> Vec<Action> {
    let mut actions = Vec::with_capacity(3);

    if op.is_some() && has_table {
        actions.push(Action::RecordLatency);
    }

    let slow = elapsed >= thresholds.slow_query;
    if slow {
        actions.push(Action::SlowQuery);
    } else if multi_table && op == Some(SqlOp::Select) {
        actions.push(Action::MultiTableRead);
    }

    if op.is_some_and(|op| op.is_write()) {
        actions.push(Action::WriteAudit);
    }

    actions
}

pub fn is_long_transaction(elapsed: Duration, thresholds: &Thresholds) -> bool {
    elapsed >= thresholds.long_transaction
}
