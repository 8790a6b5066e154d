//! Basic example showing how to use sql-monitor with SeaORM.
//!
//! Run with: cargo run --example basic

use std::time::Duration;

use sea_orm::{ConnectionTrait, Database, DbBackend, Statement, TransactionTrait};
use sql_monitor::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sql_monitor=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Connect to database
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "mysql://root@localhost/test".into());

    tracing::info!("Connecting to database...");

    let db = Database::connect(&database_url).await?;

    // Option 1: Simple wrapping with the defaults for the backend
    // let monitored = MonitoredConnection::from(db);

    // Option 2: Using the extension trait with a custom monitor
    let monitored = db.with_monitor(SqlMonitor::new(
        MonitorConfig::development()
            .with_app("demo")
            .with_database_name("test")
            .with_table_normalizer(TableNormalizer::shard_suffix())
            .with_slow_query_threshold(Duration::from_millis(200)),
    ));

    // Write audit: logged at INFO with metric_type=oplog, table_name=t_user
    monitored
        .execute(Statement::from_sql_and_values(
            DbBackend::MySql,
            "UPDATE t_user_07 SET name = ? WHERE id = ?",
            ["ada".into(), 1i32.into()],
        ))
        .await?;

    // Multi-table read: logged at WARN with metric_type=multiTables
    monitored
        .query_all(Statement::from_string(
            DbBackend::MySql,
            "SELECT o.id FROM orders o JOIN customers c ON o.cid = c.id",
        ))
        .await?;

    // Transactions are timed from begin to commit or rollback
    let tx = monitored.begin_monitored().await?;
    tx.execute_unprepared("DELETE FROM sessions WHERE expired = 1")
        .await?;
    tx.commit().await?;

    // The closure form is timed as a whole
    monitored
        .transaction::<_, (), sea_orm::DbErr>(|txn| {
            Box::pin(async move {
                txn.execute_unprepared("INSERT INTO audit (note) VALUES ('demo')")
                    .await?;
                Ok(())
            })
        })
        .await?;

    tracing::info!("Done; see the sql_monitor events above");

    monitored.close().await?;

    Ok(())
}
