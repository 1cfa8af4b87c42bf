//! Database query functions for the `checkpoints` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::CheckpointRow;

/// Parameters for inserting a new checkpoint row.
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub thread_id: String,
    pub checkpoint_id: String,
    pub node_name: String,
    pub snapshot: Vec<u8>,
}

/// Insert a checkpoint, replacing any in-progress snapshot with the same id.
///
/// The per-thread `seq` counter is assigned atomically inside the statement
/// so concurrent writers (which the engine does not produce, but a second
/// operator process could) never collide on ordering.
pub async fn put_checkpoint(pool: &PgPool, new: &NewCheckpoint) -> Result<CheckpointRow> {
    let row = sqlx::query_as::<_, CheckpointRow>(
        "INSERT INTO checkpoints (thread_id, checkpoint_id, node_name, seq, snapshot) \
         VALUES ($1, $2, $3, \
                 (SELECT COALESCE(MAX(seq), 0) + 1 FROM checkpoints WHERE thread_id = $1), \
                 $4) \
         ON CONFLICT (thread_id, checkpoint_id) DO UPDATE \
             SET node_name = EXCLUDED.node_name, \
                 seq = EXCLUDED.seq, \
                 snapshot = EXCLUDED.snapshot, \
                 created_at = now() \
         RETURNING *",
    )
    .bind(&new.thread_id)
    .bind(&new.checkpoint_id)
    .bind(&new.node_name)
    .bind(&new.snapshot)
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to put checkpoint {} for thread {}",
            new.checkpoint_id, new.thread_id
        )
    })?;

    Ok(row)
}

/// Get the most recent checkpoint for a thread by insertion order.
pub async fn get_latest_checkpoint(
    pool: &PgPool,
    thread_id: &str,
) -> Result<Option<CheckpointRow>> {
    let row = sqlx::query_as::<_, CheckpointRow>(
        "SELECT * FROM checkpoints \
         WHERE thread_id = $1 \
         ORDER BY seq DESC \
         LIMIT 1",
    )
    .bind(thread_id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to get latest checkpoint for thread {thread_id}"))?;

    Ok(row)
}

/// Get a specific checkpoint by id.
pub async fn get_checkpoint(
    pool: &PgPool,
    thread_id: &str,
    checkpoint_id: &str,
) -> Result<Option<CheckpointRow>> {
    let row = sqlx::query_as::<_, CheckpointRow>(
        "SELECT * FROM checkpoints WHERE thread_id = $1 AND checkpoint_id = $2",
    )
    .bind(thread_id)
    .bind(checkpoint_id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to get checkpoint {checkpoint_id} for thread {thread_id}"))?;

    Ok(row)
}

/// List all checkpoints for a thread in chronological (insertion) order.
pub async fn list_checkpoints(pool: &PgPool, thread_id: &str) -> Result<Vec<CheckpointRow>> {
    let rows = sqlx::query_as::<_, CheckpointRow>(
        "SELECT * FROM checkpoints \
         WHERE thread_id = $1 \
         ORDER BY seq ASC",
    )
    .bind(thread_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list checkpoints for thread {thread_id}"))?;

    Ok(rows)
}

/// Delete all checkpoints for a thread. Returns the number of rows removed.
pub async fn delete_checkpoints(pool: &PgPool, thread_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM checkpoints WHERE thread_id = $1")
        .bind(thread_id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to delete checkpoints for thread {thread_id}"))?;

    Ok(result.rows_affected())
}
