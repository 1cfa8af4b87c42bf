use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A mission thread -- the checkpoint partition key.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ThreadRow {
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
}

/// One persisted checkpoint: a serialized mission state snapshot taken at a
/// graph node boundary.
///
/// `seq` is a per-thread insertion counter; `get_latest` orders by it rather
/// than by wall-clock time so resume is stable even when two checkpoints land
/// within the same timestamp tick.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CheckpointRow {
    pub thread_id: String,
    pub checkpoint_id: String,
    pub node_name: String,
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub snapshot: Vec<u8>,
}
