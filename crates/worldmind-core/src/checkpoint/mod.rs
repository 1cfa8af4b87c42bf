//! Checkpoint store: durable snapshots of mission state keyed by
//! `(thread_id, checkpoint_id)`.
//!
//! Two backends: an in-memory store for tests and single-process runs, and a
//! PostgreSQL store over `worldmind-db` for missions that must survive
//! process restarts.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use worldmind_db::queries::checkpoints::{self, NewCheckpoint};
use worldmind_db::queries::threads;

use crate::mission::MissionState;

/// One stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub checkpoint_id: String,
    /// Name of the graph node this snapshot brackets.
    pub node_name: String,
    pub created_at: DateTime<Utc>,
    pub state: MissionState,
}

/// Durable snapshot storage.
///
/// `put` is atomic and replaces any in-progress snapshot with the same id;
/// `get_latest` returns the most recent snapshot by insertion order.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        node_name: &str,
        state: &MissionState,
    ) -> Result<()>;

    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// In-memory checkpoint store for tests and single-process missions.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    /// Per-thread checkpoints in insertion order.
    threads: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        node_name: &str,
        state: &MissionState,
    ) -> Result<()> {
        let checkpoint = Checkpoint {
            thread_id: thread_id.to_owned(),
            checkpoint_id: checkpoint_id.to_owned(),
            node_name: node_name.to_owned(),
            created_at: Utc::now(),
            state: state.clone(),
        };

        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        let entries = threads.entry(thread_id.to_owned()).or_default();

        // Replace an in-progress snapshot with the same id; the entry keeps
        // its original position so insertion order is stable.
        if let Some(existing) = entries
            .iter_mut()
            .find(|c| c.checkpoint_id == checkpoint_id)
        {
            *existing = checkpoint;
        } else {
            entries.push(checkpoint);
        }
        Ok(())
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        Ok(threads
            .get(thread_id)
            .and_then(|entries| entries.last().cloned()))
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        Ok(threads.get(thread_id).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// SQL backend
// ---------------------------------------------------------------------------

/// PostgreSQL-backed checkpoint store.
///
/// Snapshots are serde_json blobs; deserialization is an exact round-trip
/// of [`MissionState`].
#[derive(Debug, Clone)]
pub struct SqlCheckpointStore {
    pool: PgPool,
}

impl SqlCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn decode(row: worldmind_db::models::CheckpointRow) -> Result<Checkpoint> {
        let state: MissionState = serde_json::from_slice(&row.snapshot).with_context(|| {
            format!(
                "failed to decode snapshot for checkpoint {} of thread {}",
                row.checkpoint_id, row.thread_id
            )
        })?;
        Ok(Checkpoint {
            thread_id: row.thread_id,
            checkpoint_id: row.checkpoint_id,
            node_name: row.node_name,
            created_at: row.created_at,
            state,
        })
    }
}

#[async_trait]
impl CheckpointStore for SqlCheckpointStore {
    async fn put(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        node_name: &str,
        state: &MissionState,
    ) -> Result<()> {
        let snapshot = serde_json::to_vec(state).context("failed to encode state snapshot")?;

        threads::ensure_thread(&self.pool, thread_id).await?;
        checkpoints::put_checkpoint(
            &self.pool,
            &NewCheckpoint {
                thread_id: thread_id.to_owned(),
                checkpoint_id: checkpoint_id.to_owned(),
                node_name: node_name.to_owned(),
                snapshot,
            },
        )
        .await?;
        Ok(())
    }

    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let row = checkpoints::get_latest_checkpoint(&self.pool, thread_id).await?;
        row.map(Self::decode).transpose()
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let rows = checkpoints::list_checkpoints(&self.pool, thread_id).await?;
        rows.into_iter().map(Self::decode).collect()
    }
}
