//! Database query functions for the `threads` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::ThreadRow;

/// Insert a thread row if it does not already exist.
pub async fn ensure_thread(pool: &PgPool, thread_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO threads (thread_id) VALUES ($1) \
         ON CONFLICT (thread_id) DO NOTHING",
    )
    .bind(thread_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to ensure thread {thread_id}"))?;

    Ok(())
}

/// Look up a thread by id.
pub async fn get_thread(pool: &PgPool, thread_id: &str) -> Result<Option<ThreadRow>> {
    let row = sqlx::query_as::<_, ThreadRow>("SELECT * FROM threads WHERE thread_id = $1")
        .bind(thread_id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to get thread {thread_id}"))?;

    Ok(row)
}

/// List all threads, oldest first.
pub async fn list_threads(pool: &PgPool) -> Result<Vec<ThreadRow>> {
    let rows = sqlx::query_as::<_, ThreadRow>("SELECT * FROM threads ORDER BY created_at ASC")
        .fetch_all(pool)
        .await
        .context("failed to list threads")?;

    Ok(rows)
}

/// Delete a thread and (via cascade) all of its checkpoints.
pub async fn delete_thread(pool: &PgPool, thread_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM threads WHERE thread_id = $1")
        .bind(thread_id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to delete thread {thread_id}"))?;

    Ok(result.rows_affected())
}
