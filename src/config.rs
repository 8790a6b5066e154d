//! Configuration for monitoring behavior.

use std::time::Duration;

use crate::classify::{SqlDialect, TableNormalizer};
use crate::hooks::HookErrorPolicy;
use crate::policy::Thresholds;
use crate::sink::DEFAULT_MAX_FIELD_LEN;

/// Configuration options for [`SqlMonitor`](crate::SqlMonitor).
///
/// # Example
///
/// ```rust
/// use sql_monitor::{MonitorConfig, TableNormalizer};
/// use std::time::Duration;
///
/// let config = MonitorConfig::default()
///     .with_app("billing")
///     .with_database_name("orders_db")
///     .with_table_normalizer(TableNormalizer::shard_suffix())
///     .with_slow_query_threshold(Duration::from_millis(500));
/// ```
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Application identity attached to every log record.
    /// Default: empty
    pub app: String,

    /// Database name, used as the metric `peer` label and the `db_name` log field.
    /// Default: empty
    pub database_name: String,

    /// Metric `type` label.
    /// Default: "mysql"
    pub system: &'static str,

    /// Grammar used to classify queries.
    /// Default: MySQL
    pub dialect: SqlDialect,

    /// Calls at or above this duration are logged as slow queries.
    /// Default: 1s
    pub slow_query_threshold: Duration,

    /// Transactions held at least this long are logged with a call stack.
    /// Default: 8s
    pub long_transaction_threshold: Duration,

    /// Character cap for query text, arguments and table names in records.
    /// Default: 1024
    pub max_field_len: usize,

    /// Maps physical table names (e.g. shards) to logical ones.
    /// Default: identity
    pub table_normalizer: TableNormalizer,

    /// What to do when the after hook fails.
    /// Default: propagate the failure to the caller
    pub after_hook_errors: HookErrorPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            app: String::new(),
            database_name: String::new(),
            system: "mysql",
            dialect: SqlDialect::default(),
            slow_query_threshold: Duration::from_secs(1),
            long_transaction_threshold: Duration::from_secs(8),
            max_field_len: DEFAULT_MAX_FIELD_LEN,
            table_normalizer: TableNormalizer::identity(),
            after_hook_errors: HookErrorPolicy::Propagate,
        }
    }
}

impl MonitorConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name carried on every log record.
    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = app.into();
        self
    }

    /// Set the database name reported as metric peer.
    ///
    /// Useful when your application connects to multiple databases.
    pub fn with_database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = name.into();
        self
    }

    /// Set the metric `type` label, e.g. `mysql`.
    pub fn with_system(mut self, system: &'static str) -> Self {
        self.system = system;
        self
    }

    /// Set the SQL grammar used to classify queries.
    pub fn with_dialect(mut self, dialect: SqlDialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Set the threshold for slow query logs.
    pub fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    /// Set the duration from which a finished transaction is logged with its
    /// stack.
    pub fn with_long_transaction_threshold(mut self, threshold: Duration) -> Self {
        self.long_transaction_threshold = threshold;
        self
    }

    /// Set the character cap for table names and query text in metric labels
    /// and log fields.
    pub fn with_max_field_len(mut self, len: usize) -> Self {
        self.max_field_len = len;
        self
    }

    /// Set the table-name normalization applied to every classified table.
    pub fn with_table_normalizer(mut self, normalizer: TableNormalizer) -> Self {
        self.table_normalizer = normalizer;
        self
    }

    /// Set what happens when the `after` hook fails on a successful call.
    pub fn with_after_hook_errors(mut self, policy: HookErrorPolicy) -> Self {
        self.after_hook_errors = policy;
        self
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            slow_query: self.slow_query_threshold,
            long_transaction: self.long_transaction_threshold,
        }
    }

    /// Create a development-friendly configuration with tight thresholds.
    ///
    /// Reports far more slow queries and long transactions than production
    /// traffic warrants.
    pub fn development() -> Self {
        Self {
            slow_query_threshold: Duration::from_millis(100),
            long_transaction_threshold: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Create a production configuration where observability failures never
    /// fail a query.
    pub fn production() -> Self {
        Self {
            after_hook_errors: HookErrorPolicy::LogAndContinue,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = MonitorConfig::default()
            .with_app("billing")
            .with_database_name("test_db")
            .with_dialect(SqlDialect::Postgres)
            .with_system("postgresql");

        assert_eq!(config.app, "billing");
        assert_eq!(config.database_name, "test_db");
        assert_eq!(config.dialect, SqlDialect::Postgres);
        assert_eq!(config.system, "postgresql");
    }

    #[test]
    fn test_default_thresholds() {
        let thresholds = MonitorConfig::default().thresholds();
        assert_eq!(thresholds.slow_query, Duration::from_secs(1));
        assert_eq!(thresholds.long_transaction, Duration::from_millis(8000));
        assert_eq!(MonitorConfig::default().max_field_len, 1024);
    }

    #[test]
    fn test_development_config() {
        let config = MonitorConfig::development();
        assert_eq!(config.slow_query_threshold, Duration::from_millis(100));
        assert_eq!(config.after_hook_errors, HookErrorPolicy::Propagate);
    }

    #[test]
    fn test_production_config() {
        let config = MonitorConfig::production();
        assert_eq!(config.after_hook_errors, HookErrorPolicy::LogAndContinue);
        assert_eq!(config.slow_query_threshold, Duration::from_secs(1));
    }
}
