//! The SQL monitor: classification, policy and sinks behind the [`Hooks`] trait.

use std::backtrace::Backtrace;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Level;

use crate::classify::Classifier;
use crate::config::MonitorConfig;
use crate::context::{CallContext, Context};
use crate::driver::Value;
use crate::error::{HookError, ObservedError};
use crate::hooks::{Hooks, Interceptor, TxOutcome};
use crate::policy::{self, Action, LogTag};
use crate::sink::{
    truncate_field, LogRecord, LogSink, MetricsFacade, MetricsSink, TracingLogSink,
};

/// Hooks that turn every call into metrics and policy-driven log records.
///
/// # Example
///
/// ```rust,ignore
/// use sql_monitor::{wrap, MonitorConfig, SqlMonitor, TableNormalizer};
///
/// let monitor = SqlMonitor::new(
///     MonitorConfig::default()
///         .with_database_name("test")
///         .with_table_normalizer(TableNormalizer::shard_suffix()),
/// );
/// let driver = wrap(my_driver, monitor.into_interceptor());
/// ```
pub struct SqlMonitor {
    config: Arc<MonitorConfig>,
    classifier: Classifier,
    metrics: Arc<dyn MetricsSink>,
    logs: Arc<dyn LogSink>,
}

impl SqlMonitor {
    /// Create a monitor reporting to `tracing` and the `metrics` facade.
    pub fn new(config: MonitorConfig) -> Self {
        let classifier = Classifier::new(config.dialect, config.table_normalizer.clone());
        Self {
            config: Arc::new(config),
            classifier,
            metrics: Arc::new(MetricsFacade),
            logs: Arc::new(TracingLogSink),
        }
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.logs = sink;
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Build an [`Interceptor`] running this monitor with the configured
    /// after-hook error policy.
    pub fn into_interceptor(self) -> Interceptor {
        let policy = self.config.after_hook_errors;
        Interceptor::new(Arc::new(self)).with_after_hook_errors(policy)
    }

    fn record(
        &self,
        level: Level,
        message: &'static str,
        call: &CallContext,
        cost: Duration,
        query: &str,
        args: &[Value],
    ) -> LogRecord {
        let max = self.config.max_field_len;
        let mut record = LogRecord::new(level, message);
        record.cost_ms = cost.as_millis() as u64;
        record.query = truncate_field(query, max).to_owned();
        record.args = truncate_field(&format_args_list(args), max).to_owned();
        record.app = self.config.app.clone();
        record.db_name = self.config.database_name.clone();
        record.table = call.table().unwrap_or_default().to_owned();
        record.op = call.op().map(|op| op.as_str().to_owned());
        record
    }

    /// Apply the policy for a call that completed `elapsed` after it began.
    pub(crate) fn observe(
        &self,
        call: &CallContext,
        elapsed: Duration,
        query: &str,
        args: &[Value],
    ) {
        let thresholds = self.config.thresholds();
        let actions = policy::decide(
            call.op(),
            call.table().is_some(),
            call.is_multi_table(),
            elapsed,
            &thresholds,
        );

        for action in actions {
            if action == Action::RecordLatency {
                if let (Some(op), Some(table)) = (call.op(), call.table()) {
                    self.metrics.record_histogram(
                        self.config.system,
                        op.as_str(),
                        table,
                        &self.config.database_name,
                        elapsed.as_secs_f64(),
                    );
                }
                continue;
            }
            if let Some(level) = action.level() {
                let mut record =
                    self.record(level, action.message(), call, elapsed, query, args);
                record.tag = action.tag();
                self.logs.emit(record);
            }
        }
    }
}

impl std::fmt::Debug for SqlMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlMonitor")
            .field("config", &self.config)
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

impl Hooks for SqlMonitor {
    fn before(
        &self,
        _ctx: &Context,
        query: &str,
        args: &[Value],
    ) -> Result<CallContext, HookError> {
        let begin = Instant::now();

        let (call, parse_error) = match self.classifier.classify(query) {
            Ok(classification) => (
                CallContext::classified(begin, &classification, self.config.max_field_len),
                None,
            ),
            Err(err) => (CallContext::unclassified(begin), Some(err.to_string())),
        };

        match (call.op(), call.table()) {
            (Some(op), Some(table)) => {
                self.metrics.record_counter(
                    self.config.system,
                    op.as_str(),
                    table,
                    &self.config.database_name,
                );
            }
            (None, _) => {
                let mut record = self.record(
                    Level::ERROR,
                    "sql classification failed",
                    &call,
                    Duration::ZERO,
                    query,
                    args,
                );
                record.error = parse_error;
                self.logs.emit(record);
            }
            _ => {}
        }
        Ok(call)
    }

    fn after(&self, call: &CallContext, query: &str, args: &[Value]) -> Result<(), HookError> {
        self.observe(call, call.elapsed(), query, args);
        Ok(())
    }

    fn on_error(&self, call: &CallContext, err: &dyn ObservedError, query: &str, args: &[Value]) {
        if err.is_decline() {
            return;
        }
        let mut record = self.record(
            Level::ERROR,
            "query failed",
            call,
            call.elapsed(),
            query,
            args,
        );
        record.error = Some(err.to_string());
        self.logs.emit(record);
    }

    fn on_transaction_end(&self, elapsed: Duration, outcome: TxOutcome) {
        if !policy::is_long_transaction(elapsed, &self.config.thresholds()) {
            return;
        }
        let mut record = LogRecord::new(Level::ERROR, "long transaction");
        record.tag = Some(LogTag::LongTx);
        record.cost_ms = elapsed.as_millis() as u64;
        record.app = self.config.app.clone();
        record.db_name = self.config.database_name.clone();
        record.op = Some(outcome.as_str().to_owned());
        record.stack = Some(Backtrace::force_capture().to_string());
        self.logs.emit(record);
    }
}

/// Render arguments as `[a b c]`.
fn format_args_list(args: &[Value]) -> String {
    let mut out = String::from("[");
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&arg.to_string());
    }
    out.push(']');
    out
}
