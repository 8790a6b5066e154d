//! Key-value command interception.
//!
//! Commands whose argument line contains a registered key prefix are counted
//! and timed under the metric name `"<command> <prefix>"`. Failed commands are
//! logged unless the failure is the client's "no such key" reply.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::Level;

use crate::error::ObservedError;
use crate::sink::{
    truncate_field, LogRecord, LogSink, MetricsFacade, MetricsSink, TracingLogSink,
};

/// Character cap for the argument line used for prefix matching and logging.
pub const MAX_KEY_LEN: usize = 100;

/// Metric `type` label for key-value commands.
pub const KV_SYSTEM: &str = "redis";

/// A key-value command.
pub trait Command: Send + Sync {
    /// Command name, e.g. `get`.
    fn name(&self) -> &str;

    /// Full argument vector, command name first.
    fn args(&self) -> Vec<String>;
}

/// A key-value client that processes single commands and pipelines.
#[async_trait]
pub trait CommandProcessor: Send + Sync {
    type Cmd: Command;
    type Reply: Send;
    type Error: ObservedError + Send;

    async fn process(&self, cmd: &Self::Cmd) -> Result<Self::Reply, Self::Error>;

    /// Process `cmds` in one round trip. The pipeline succeeds or fails as a
    /// whole.
    async fn process_pipeline(
        &self,
        cmds: &[Self::Cmd],
    ) -> Result<Vec<Self::Reply>, Self::Error>;
}

/// Registered key prefixes, matched in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPrefixes {
    prefixes: Vec<String>,
}

impl KeyPrefixes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `prefix`. Empty prefixes never match.
    pub fn add(&mut self, prefix: impl Into<String>) {
        let prefix = prefix.into();
        if !prefix.is_empty() {
            self.prefixes.push(prefix);
        }
    }

    pub fn with(mut self, prefix: impl Into<String>) -> Self {
        self.add(prefix);
        self
    }

    /// Metric name for an argument line: its first word and the first
    /// registered prefix the line contains.
    pub fn match_line(&self, line: &str) -> Option<String> {
        let prefix = self.prefixes.iter().find(|prefix| line.contains(prefix.as_str()))?;
        let cmd = line.split(' ').next().unwrap_or_default();
        Some(format!("{cmd} {prefix}"))
    }
}

/// Counts, times and logs key-value commands.
pub struct KvMonitor {
    prefixes: KeyPrefixes,
    instance: String,
    app: String,
    metrics: Arc<dyn MetricsSink>,
    logs: Arc<dyn LogSink>,
}

impl KvMonitor {
    /// Create a monitor for the store instance named `instance`, reported as
    /// the metric `peer`.
    pub fn new(instance: impl Into<String>, prefixes: KeyPrefixes) -> Self {
        Self {
            prefixes,
            instance: instance.into(),
            app: String::new(),
            metrics: Arc::new(MetricsFacade),
            logs: Arc::new(TracingLogSink),
        }
    }

    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = app.into();
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.logs = sink;
        self
    }

    pub fn prefixes(&self) -> &KeyPrefixes {
        &self.prefixes
    }

    /// Wrap `client` so every command it processes is monitored.
    pub fn wrap<P: CommandProcessor>(self, client: P) -> HookedCommandClient<P> {
        HookedCommandClient {
            inner: client,
            monitor: Arc::new(self),
        }
    }

    fn key_line(cmd: &dyn Command) -> String {
        let line = cmd.args().join(" ");
        truncate_field(&line, MAX_KEY_LEN).to_owned()
    }

    /// Count `cmd` if it matches a prefix; returns the metric name.
    fn before(&self, cmd: &dyn Command) -> Option<String> {
        let name = self.prefixes.match_line(&Self::key_line(cmd))?;
        self.metrics
            .record_counter(KV_SYSTEM, cmd.name(), &name, &self.instance);
        Some(name)
    }

    fn after(
        &self,
        cmd: &dyn Command,
        matched: Option<&str>,
        begin: Instant,
        err: Option<&dyn ObservedError>,
    ) {
        let elapsed = begin.elapsed();
        if let Some(name) = matched {
            self.metrics.record_histogram(
                KV_SYSTEM,
                cmd.name(),
                name,
                &self.instance,
                elapsed.as_secs_f64(),
            );
        }

        let Some(err) = err.filter(|err| !err.is_decline()) else {
            return;
        };
        let mut record = LogRecord::new(Level::ERROR, "kv command failed");
        record.cost_ms = elapsed.as_millis() as u64;
        record.query = Self::key_line(cmd);
        record.app = self.app.clone();
        record.db_name = self.instance.clone();
        record.table = matched.unwrap_or_default().to_owned();
        record.op = Some(cmd.name().to_owned());
        record.error = Some(err.to_string());
        self.logs.emit(record);
    }
}

impl std::fmt::Debug for KvMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvMonitor")
            .field("prefixes", &self.prefixes)
            .field("instance", &self.instance)
            .field("app", &self.app)
            .finish_non_exhaustive()
    }
}

/// A key-value client whose commands run through a [`KvMonitor`].
#[derive(Debug)]
pub struct HookedCommandClient<P> {
    inner: P,
    monitor: Arc<KvMonitor>,
}

impl<P> HookedCommandClient<P> {
    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn monitor(&self) -> &KvMonitor {
        &self.monitor
    }
}

#[async_trait]
impl<P: CommandProcessor> CommandProcessor for HookedCommandClient<P> {
    type Cmd = P::Cmd;
    type Reply = P::Reply;
    type Error = P::Error;

    async fn process(&self, cmd: &Self::Cmd) -> Result<Self::Reply, Self::Error> {
        let begin = Instant::now();
        let matched = self.monitor.before(cmd);
        let result = self.inner.process(cmd).await;
        let err = result.as_ref().err().map(|err| err as &dyn ObservedError);
        self.monitor.after(cmd, matched.as_deref(), begin, err);
        result
    }

    async fn process_pipeline(
        &self,
        cmds: &[Self::Cmd],
    ) -> Result<Vec<Self::Reply>, Self::Error> {
        let begin = Instant::now();
        let matched: Vec<Option<String>> =
            cmds.iter().map(|cmd| self.monitor.before(cmd)).collect();
        let result = self.inner.process_pipeline(cmds).await;
        let err = result.as_ref().err().map(|err| err as &dyn ObservedError);
        for (cmd, matched) in cmds.iter().zip(&matched) {
            self.monitor.after(cmd, matched.as_deref(), begin, err);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemorySink, MetricKind};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct Cmd(Vec<String>);

    impl Cmd {
        fn new(args: &[&str]) -> Self {
            Self(args.iter().map(|arg| arg.to_string()).collect())
        }
    }

    impl Command for Cmd {
        fn name(&self) -> &str {
            &self.0[0]
        }

        fn args(&self) -> Vec<String> {
            self.0.clone()
        }
    }

    #[derive(Debug, PartialEq)]
    enum KvError {
        Nil,
        Io(&'static str),
    }

    impl std::fmt::Display for KvError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                KvError::Nil => f.write_str("nil"),
                KvError::Io(msg) => write!(f, "io: {msg}"),
            }
        }
    }

    impl ObservedError for KvError {
        fn is_decline(&self) -> bool {
            *self == KvError::Nil
        }
    }

    #[derive(Default)]
    struct FakeStore {
        data: Mutex<HashMap<String, String>>,
        broken: bool,
    }

    impl FakeStore {
        fn apply(&self, cmd: &Cmd) -> Result<String, KvError> {
            if self.broken {
                return Err(KvError::Io("connection reset"));
            }
            let mut data = self.data.lock().unwrap();
            match cmd.0.as_slice() {
                [name, key, value] if name == "set" => {
                    data.insert(key.clone(), value.clone());
                    Ok("OK".into())
                }
                [name, key] if name == "get" => data.get(key).cloned().ok_or(KvError::Nil),
                _ => Err(KvError::Io("unknown command")),
            }
        }
    }

    #[async_trait]
    impl CommandProcessor for FakeStore {
        type Cmd = Cmd;
        type Reply = String;
        type Error = KvError;

        async fn process(&self, cmd: &Cmd) -> Result<String, KvError> {
            self.apply(cmd)
        }

        async fn process_pipeline(&self, cmds: &[Cmd]) -> Result<Vec<String>, KvError> {
            cmds.iter().map(|cmd| self.apply(cmd)).collect()
        }
    }

    fn hooked(store: FakeStore) -> (HookedCommandClient<FakeStore>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let prefixes = KeyPrefixes::new().with("user:").with("session:");
        let client = KvMonitor::new("cache-main", prefixes)
            .with_app("webapp")
            .with_metrics_sink(sink.clone())
            .with_log_sink(sink.clone())
            .wrap(store);
        (client, sink)
    }

    #[test]
    fn test_match_line_in_registration_order() {
        let prefixes = KeyPrefixes::new().with("user:").with("user:profile");
        assert_eq!(
            prefixes.match_line("get user:profile:42"),
            Some("get user:".to_string())
        );
        assert_eq!(prefixes.match_line("get order:1"), None);
    }

    #[test]
    fn test_empty_prefix_never_matches() {
        let mut prefixes = KeyPrefixes::new();
        prefixes.add("");
        assert_eq!(prefixes.match_line("get anything"), None);
    }

    #[tokio::test]
    async fn test_matching_command_is_counted_and_timed() {
        let (client, sink) = hooked(FakeStore::default());

        let reply = client.process(&Cmd::new(&["set", "user:1", "ada"])).await.unwrap();
        assert_eq!(reply, "OK");

        let metrics = sink.metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].metric, MetricKind::Counter);
        assert_eq!(metrics[0].kind, "redis");
        assert_eq!(metrics[0].op, "set");
        assert_eq!(metrics[0].name, "set user:");
        assert_eq!(metrics[0].peer, "cache-main");
        assert_eq!(metrics[1].metric, MetricKind::Histogram);
        assert!(sink.logs().is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_command_is_not_measured() {
        let (client, sink) = hooked(FakeStore::default());

        client.process(&Cmd::new(&["set", "order:1", "x"])).await.unwrap();
        assert!(sink.metrics().is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_is_not_logged() {
        let (client, sink) = hooked(FakeStore::default());

        let err = client.process(&Cmd::new(&["get", "user:404"])).await.unwrap_err();
        assert_eq!(err, KvError::Nil);
        assert!(sink.logs().is_empty());
        assert_eq!(sink.metrics().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_logged() {
        let (client, sink) = hooked(FakeStore {
            broken: true,
            ..Default::default()
        });

        let err = client.process(&Cmd::new(&["get", "session:9"])).await.unwrap_err();
        assert_eq!(err, KvError::Io("connection reset"));

        let logs = sink.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, Level::ERROR);
        assert_eq!(logs[0].app, "webapp");
        assert_eq!(logs[0].query, "get session:9");
        assert_eq!(logs[0].table, "get session:");
        assert_eq!(logs[0].error.as_deref(), Some("io: connection reset"));
    }

    #[tokio::test]
    async fn test_pipeline_records_each_command() {
        let (client, sink) = hooked(FakeStore::default());

        let replies = client
            .process_pipeline(&[
                Cmd::new(&["set", "user:1", "ada"]),
                Cmd::new(&["set", "session:1", "tok"]),
                Cmd::new(&["set", "order:1", "x"]),
            ])
            .await
            .unwrap();
        assert_eq!(replies.len(), 3);

        let metrics = sink.metrics();
        let counters: Vec<_> = metrics
            .iter()
            .filter(|sample| sample.metric == MetricKind::Counter)
            .map(|sample| sample.name.as_str())
            .collect();
        assert_eq!(counters, vec!["set user:", "set session:"]);
        assert_eq!(metrics.len(), 4);
    }

    #[test]
    fn test_key_line_is_truncated() {
        let long = format!("user:{}", "k".repeat(300));
        let line = KvMonitor::key_line(&Cmd::new(&["get", long.as_str()]));
        assert_eq!(line.chars().count(), MAX_KEY_LEN);
    }
}
