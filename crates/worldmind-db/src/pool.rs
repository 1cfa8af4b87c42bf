use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// SQLSTATE raised by `CREATE DATABASE` when the target already exists.
const DUPLICATE_DATABASE: &str = "42P04";

/// Schema bootstrap statements.
///
/// Executed on every pool creation; `IF NOT EXISTS` makes them idempotent so
/// the tables are created lazily on first connection without a separate
/// migration step.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS threads (
        thread_id   TEXT PRIMARY KEY,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS checkpoints (
        thread_id      TEXT NOT NULL REFERENCES threads(thread_id) ON DELETE CASCADE,
        checkpoint_id  TEXT NOT NULL,
        node_name      TEXT NOT NULL,
        seq            BIGINT NOT NULL,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        snapshot       BYTEA NOT NULL,
        PRIMARY KEY (thread_id, checkpoint_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_checkpoints_thread_seq
        ON checkpoints (thread_id, seq)",
];

/// Create a connection pool with sensible defaults and bootstrap the schema.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))?;

    bootstrap_schema(&pool).await?;
    Ok(pool)
}

/// Apply the checkpoint schema. Idempotent.
pub async fn bootstrap_schema(pool: &PgPool) -> Result<()> {
    for stmt in SCHEMA {
        pool.execute(*stmt)
            .await
            .context("failed to bootstrap checkpoint schema")?;
    }
    Ok(())
}

/// Create the target database when it is missing.
///
/// Issues `CREATE DATABASE` through the server's admin database and treats
/// the duplicate-database error as success, so two processes racing to
/// initialize the same deployment both come out clean.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let name = config
        .database_name()
        .context("database URL has no database name to create")?;

    // The name is interpolated into DDL (CREATE DATABASE takes no bind
    // parameters), so it must be a plain identifier.
    if !is_plain_identifier(name) {
        bail!("refusing to create database with non-identifier name {name:?}");
    }

    let admin_url = config.maintenance_url();
    let mut admin = PgConnection::connect(&admin_url)
        .await
        .with_context(|| format!("failed to reach admin database at {admin_url}"))?;

    let create = format!("CREATE DATABASE {name}");
    match sqlx::query(&create).execute(&mut admin).await {
        Ok(_) => info!(db = name, "checkpoint database created"),
        Err(sqlx::Error::Database(db_err))
            if db_err.code().as_deref() == Some(DUPLICATE_DATABASE) =>
        {
            info!(db = name, "checkpoint database already present");
        }
        Err(e) => {
            let _ = admin.close().await;
            return Err(e).with_context(|| format!("CREATE DATABASE {name} failed"));
        }
    }

    let _ = admin.close().await;
    Ok(())
}

/// Whether a string is safe to splice into DDL as an unquoted identifier:
/// a letter or underscore followed by letters, digits, or underscores.
fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
