//! Caller context and per-call instrumentation state.

use std::time::{Duration, Instant};

use crate::classify::{Classification, SqlOp};
use crate::sink::truncate_field;

/// Caller-supplied execution context.
///
/// Handed unchanged to context-aware driver capabilities, which may honour the
/// deadline. When a driver only offers the plain variant of a capability the
/// context is dropped at dispatch and the deadline cannot be enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    deadline: Option<Instant>,
}

impl Context {
    /// A context without deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the deadline has already passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// State carried from `before` to `after` / `on_error` for exactly one call.
///
/// Built once by the `before` hook and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    begin: Instant,
    op: Option<SqlOp>,
    table: Option<String>,
    multi_table: bool,
}

impl CallContext {
    /// A call whose query could not be classified.
    pub fn unclassified(begin: Instant) -> Self {
        Self {
            begin,
            op: None,
            table: None,
            multi_table: false,
        }
    }

    /// A classified call. The primary table is capped at `max_table_len`
    /// characters; `Unknown` operations are stored as absent.
    pub fn classified(
        begin: Instant,
        classification: &Classification,
        max_table_len: usize,
    ) -> Self {
        let op = Some(classification.op).filter(|op| *op != SqlOp::Unknown);
        Self {
            begin,
            op,
            table: classification
                .primary_table()
                .map(|table| truncate_field(table, max_table_len).to_owned()),
            multi_table: classification.is_multi_table(),
        }
    }

    pub fn begin(&self) -> Instant {
        self.begin
    }

    pub fn op(&self) -> Option<SqlOp> {
        self.op
    }

    /// Primary (first discovered) table.
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn is_multi_table(&self) -> bool {
        self.multi_table
    }

    pub fn elapsed(&self) -> Duration {
        self.begin.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classified_context() {
        let classification = Classification {
            op: SqlOp::Select,
            tables: vec!["orders".into(), "customers".into()],
        };
        let call = CallContext::classified(Instant::now(), &classification, 1024);
        assert_eq!(call.op(), Some(SqlOp::Select));
        assert_eq!(call.table(), Some("orders"));
        assert!(call.is_multi_table());
    }

    #[test]
    fn test_unknown_op_is_absent() {
        let classification = Classification {
            op: SqlOp::Unknown,
            tables: vec![],
        };
        let call = CallContext::classified(Instant::now(), &classification, 1024);
        assert_eq!(call.op(), None);
        assert_eq!(call.table(), None);
        assert!(!call.is_multi_table());
    }

    #[test]
    fn test_table_name_is_capped() {
        let classification = Classification {
            op: SqlOp::Insert,
            tables: vec!["t".repeat(2000)],
        };
        let call = CallContext::classified(Instant::now(), &classification, 1024);
        assert_eq!(call.table().map(str::len), Some(1024));
    }

    #[test]
    fn test_context_deadline() {
        assert!(!Context::background().is_expired());
        assert_eq!(Context::background().deadline(), None);
        assert!(Context::with_deadline(Instant::now()).is_expired());
        assert!(!Context::with_timeout(Duration::from_secs(60)).is_expired());
    }
}
