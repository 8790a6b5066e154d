//! Named database handles owned by the application.

use std::collections::HashMap;
use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DbErr};

use crate::connection::MonitoredConnection;
use crate::monitor::SqlMonitor;

const DEFAULT_MAX_CONN: u32 = 5;
const DEFAULT_LIFETIME_HOURS: u64 = 1;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection settings for one named database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbInfo {
    pub db_name: String,
    pub conn_str: String,
    /// Pool size; 0 means the default of 5.
    pub max_conn: u32,
    /// Connection lifetime in hours; 0 means the default of 1.
    pub lifetime_hours: u64,
}

/// Pool sizing derived from a [`DbInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_connections: u32,
    /// Connections the pool keeps open while idle. The pool cannot cap idle
    /// connections, so the idle allowance is applied as this floor instead.
    pub min_connections: u32,
    pub max_lifetime: Duration,
}

impl DbInfo {
    pub fn new(db_name: impl Into<String>, conn_str: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            conn_str: conn_str.into(),
            max_conn: 0,
            lifetime_hours: 0,
        }
    }

    pub fn with_max_conn(mut self, max_conn: u32) -> Self {
        self.max_conn = max_conn;
        self
    }

    pub fn with_lifetime_hours(mut self, hours: u64) -> Self {
        self.lifetime_hours = hours;
        self
    }

    /// Pool limits: idle floor is a fifth of the maximum, at least one.
    pub fn pool_limits(&self) -> PoolLimits {
        let max_connections = if self.max_conn == 0 {
            DEFAULT_MAX_CONN
        } else {
            self.max_conn
        };
        let hours = if self.lifetime_hours == 0 {
            DEFAULT_LIFETIME_HOURS
        } else {
            self.lifetime_hours
        };
        PoolLimits {
            max_connections,
            min_connections: (max_connections / 5).max(1),
            max_lifetime: Duration::from_secs(hours * 3600),
        }
    }

    /// The connection URL, with `charset=utf8mb4` added to MySQL URLs that
    /// set no charset. Socket read and write timeouts are not URL options
    /// of the pool's MySQL driver and are left to the server settings.
    pub fn url(&self) -> String {
        decorate_mysql_url(&self.conn_str)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        let limits = self.pool_limits();
        let mut opts = ConnectOptions::new(self.url());
        opts.max_connections(limits.max_connections)
            .min_connections(limits.min_connections)
            .max_lifetime(limits.max_lifetime)
            .connect_timeout(CONNECT_TIMEOUT);
        opts
    }
}

fn decorate_mysql_url(url: &str) -> String {
    if !url.starts_with("mysql://") || url.contains("charset") {
        return url.to_owned();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}charset=utf8mb4")
}

/// Monitored connections by database name.
///
/// Built once at startup with [`DbRegistry::connect_all`], handed to the code
/// that needs database access, and torn down with [`DbRegistry::close`].
#[derive(Debug, Default)]
pub struct DbRegistry {
    conns: HashMap<String, MonitoredConnection>,
}

impl DbRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every database not registered yet, each with the monitor built
    /// by `make_monitor`. Stops at the first connection failure.
    pub async fn connect_all<F>(
        &mut self,
        infos: &[DbInfo],
        make_monitor: F,
    ) -> Result<(), DbErr>
    where
        F: Fn(&DbInfo) -> SqlMonitor,
    {
        for info in infos {
            if self.conns.contains_key(&info.db_name) {
                continue;
            }
            let conn = Database::connect(info.connect_options()).await?;
            let limits = info.pool_limits();
            tracing::info!(
                db_name = %info.db_name,
                max_connections = limits.max_connections,
                min_connections = limits.min_connections,
                "database registered"
            );
            self.conns.insert(
                info.db_name.clone(),
                MonitoredConnection::new(conn, make_monitor(info)),
            );
        }
        Ok(())
    }

    /// Register `conn` under `name`, returning the connection it replaces.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        conn: MonitoredConnection,
    ) -> Option<MonitoredConnection> {
        self.conns.insert(name.into(), conn)
    }

    pub fn get(&self, name: &str) -> Option<&MonitoredConnection> {
        self.conns.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.conns.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Close every connection. All are closed even when one fails; the first
    /// failure is returned.
    pub async fn close(self) -> Result<(), DbErr> {
        let mut first_err = None;
        for (name, conn) in self.conns {
            if let Err(err) = conn.close().await {
                tracing::warn!(db_name = %name, error = %err, "closing database failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
