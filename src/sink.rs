//! Log and metric sinks.
//!
//! The monitors never talk to a backend directly. They hand typed records to a
//! [`LogSink`] and typed observations to a [`MetricsSink`]. The defaults forward
//! to `tracing` and to the `metrics` facade; [`MemorySink`] keeps everything in
//! memory.

use std::sync::{Mutex, PoisonError};

use tracing::Level;

use crate::policy::LogTag;

/// Upper bound, in characters, for query text, arguments and table names in
/// emitted records.
pub const DEFAULT_MAX_FIELD_LEN: usize = 1024;

/// Counter incremented once per dispatched client call.
pub const CLIENT_HANDLE_TOTAL: &str = "client_handle_total";

/// Histogram of client call latency in seconds.
pub const CLIENT_HANDLE_SECONDS: &str = "client_handle_seconds";

/// Cut `value` to at most `max_chars` characters.
pub fn truncate_field(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((end, _)) => &value[..end],
        None => value,
    }
}

/// One structured log record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: Level,
    pub message: &'static str,
    pub tag: Option<LogTag>,
    pub cost_ms: u64,
    pub query: String,
    pub args: String,
    pub app: String,
    pub db_name: String,
    pub table: String,
    pub op: Option<String>,
    pub error: Option<String>,
    pub stack: Option<String>,
}

impl LogRecord {
    pub fn new(level: Level, message: &'static str) -> Self {
        Self {
            level,
            message,
            tag: None,
            cost_ms: 0,
            query: String::new(),
            args: String::new(),
            app: String::new(),
            db_name: String::new(),
            table: String::new(),
            op: None,
            error: None,
            stack: None,
        }
    }
}

/// Destination for structured log records.
pub trait LogSink: Send + Sync {
    fn emit(&self, record: LogRecord);
}

/// Destination for counter and histogram observations.
pub trait MetricsSink: Send + Sync {
    fn record_counter(&self, kind: &str, op: &str, name: &str, peer: &str);

    fn record_histogram(&self, kind: &str, op: &str, name: &str, peer: &str, seconds: f64);
}

/// Emits every record as a `tracing` event on target `sql_monitor`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn emit(&self, record: LogRecord) {
        macro_rules! emit_at_level {
            ($level:expr, $($field:tt)*) => {
                match $level {
                    Level::ERROR => tracing::error!($($field)*),
                    Level::WARN => tracing::warn!($($field)*),
                    Level::INFO => tracing::info!($($field)*),
                    Level::DEBUG => tracing::debug!($($field)*),
                    Level::TRACE => tracing::trace!($($field)*),
                }
            };
        }

        emit_at_level!(
            record.level,
            target: "sql_monitor",
            metric_type = record.tag.map(|tag| tag.as_str()),
            cost = record.cost_ms,
            query = %record.query,
            args = %record.args,
            app = %record.app,
            db_name = %record.db_name,
            table_name = %record.table,
            op = record.op.as_deref(),
            error = record.error.as_deref(),
            stack = record.stack.as_deref(),
            "{}",
            record.message
        );
    }
}

/// Records through the global `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsFacade;

impl MetricsSink for MetricsFacade {
    fn record_counter(&self, kind: &str, op: &str, name: &str, peer: &str) {
        metrics::counter!(
            CLIENT_HANDLE_TOTAL,
            "type" => kind.to_owned(),
            "op" => op.to_owned(),
            "name" => name.to_owned(),
            "peer" => peer.to_owned()
        )
        .increment(1);
    }

    fn record_histogram(&self, kind: &str, op: &str, name: &str, peer: &str, seconds: f64) {
        metrics::histogram!(
            CLIENT_HANDLE_SECONDS,
            "type" => kind.to_owned(),
            "op" => op.to_owned(),
            "name" => name.to_owned(),
            "peer" => peer.to_owned()
        )
        .record(seconds);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Histogram,
}

/// A metric observation captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub metric: MetricKind,
    pub kind: String,
    pub op: String,
    pub name: String,
    pub peer: String,
    pub value: f64,
}

/// Keeps records and metric samples in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    logs: Mutex<Vec<LogRecord>>,
    metrics: Mutex<Vec<MetricSample>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every log record emitted so far.
    pub fn logs(&self) -> Vec<LogRecord> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Records carrying `tag`.
    pub fn logs_tagged(&self, tag: LogTag) -> Vec<LogRecord> {
        self.logs()
            .into_iter()
            .filter(|record| record.tag == Some(tag))
            .collect()
    }

    pub fn metrics(&self) -> Vec<MetricSample> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn push_metric(&self, sample: MetricSample) {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample);
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: LogRecord) {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

impl MetricsSink for MemorySink {
    fn record_counter(&self, kind: &str, op: &str, name: &str, peer: &str) {
        self.push_metric(MetricSample {
            metric: MetricKind::Counter,
            kind: kind.to_owned(),
            op: op.to_owned(),
            name: name.to_owned(),
            peer: peer.to_owned(),
            value: 1.0,
        });
    }

    fn record_histogram(&self, kind: &str, op: &str, name: &str, peer: &str, seconds: f64) {
        self.push_metric(MetricSample {
            metric: MetricKind::Histogram,
            kind: kind.to_owned(),
            op: op.to_owned(),
            name: name.to_owned(),
            peer: peer.to_owned(),
            value: seconds,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_field() {
        assert_eq!(truncate_field("SELECT 1", 1024), "SELECT 1");
        assert_eq!(truncate_field("SELECT * FROM users", 10), "SELECT * F");

        let long = "x".repeat(3000);
        assert_eq!(truncate_field(&long, 1024).chars().count(), 1024);
        let exact = "y".repeat(1024);
        assert_eq!(truncate_field(&exact, 1024), exact);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let value = "表名".repeat(600);
        let cut = truncate_field(&value, 1024);
        assert_eq!(cut.chars().count(), 1024);
    }

    #[test]
    fn test_memory_sink_collects() {
        let sink = MemorySink::new();
        sink.record_counter("mysql", "select", "users", "main");
        sink.record_histogram("mysql", "select", "users", "main", 0.25);

        let mut record = LogRecord::new(Level::INFO, "write operation");
        record.tag = Some(LogTag::OpLog);
        sink.emit(record);
        sink.emit(LogRecord::new(Level::ERROR, "query failed"));

        let metrics = sink.metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].metric, MetricKind::Counter);
        assert_eq!(metrics[1].value, 0.25);
        assert_eq!(sink.logs().len(), 2);
        assert_eq!(sink.logs_tagged(LogTag::OpLog).len(), 1);
    }

    #[test]
    fn test_tracing_sink_does_not_panic_without_subscriber() {
        let mut record = LogRecord::new(Level::WARN, "multi-table read");
        record.tag = Some(LogTag::MultiTables);
        record.error = Some("boom".into());
        TracingLogSink.emit(record);
        MetricsFacade.record_counter("mysql", "select", "users", "main");
    }
}
