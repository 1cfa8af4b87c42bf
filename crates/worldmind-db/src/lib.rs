//! Checkpoint persistence for worldmind missions.
//!
//! Stores mission state snapshots in PostgreSQL, keyed by
//! `(thread_id, checkpoint_id)`. The schema is bootstrapped lazily on first
//! connection so no external migration step is required.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
