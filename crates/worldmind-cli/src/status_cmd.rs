//! The `status` and `checkpoints` read-side commands.

use anyhow::{Context, Result};

use worldmind_core::checkpoint::{CheckpointStore, SqlCheckpointStore};
use worldmind_db::config::DbConfig;
use worldmind_db::pool;

use crate::config as cli_config;

async fn open_store(database_url: Option<&str>) -> Result<SqlCheckpointStore> {
    let file = cli_config::load_config()?;
    let db_config = DbConfig::new(cli_config::resolve_database_url(database_url, &file));
    let pg = pool::create_pool(&db_config)
        .await
        .context("failed to connect to checkpoint database")?;
    Ok(SqlCheckpointStore::new(pg))
}

/// Print the latest known state of a mission thread.
pub async fn show_status(thread_id: &str, database_url: Option<&str>) -> Result<()> {
    let store = open_store(database_url).await?;

    let Some(checkpoint) = store.get_latest(thread_id).await? else {
        println!("no checkpoints for thread {thread_id}");
        return Ok(());
    };

    let state = &checkpoint.state;
    println!("thread:    {thread_id}");
    println!("mission:   {}", state.mission_id);
    println!("status:    {}", state.status);
    println!("node:      {} ({})", checkpoint.node_name, checkpoint.checkpoint_id);
    println!("waves:     {}", state.wave_count);
    println!(
        "tasks:     {} total, {} completed",
        state.tasks.len(),
        state.completed_task_ids.len()
    );
    for task in &state.tasks {
        println!(
            "  {}  {:<10}  {}  (attempt {}/{})",
            task.id, task.agent, task.status, task.iteration, task.max_iterations
        );
    }
    if let Some(url) = &state.deployment_url {
        println!("deployed:  {url}");
    }
    if !state.errors.is_empty() {
        println!("errors:");
        for error in &state.errors {
            println!("  - {error}");
        }
    }
    Ok(())
}

/// List every checkpoint recorded for a thread.
pub async fn list_checkpoints(thread_id: &str, database_url: Option<&str>) -> Result<()> {
    let store = open_store(database_url).await?;

    let checkpoints = store.list(thread_id).await?;
    if checkpoints.is_empty() {
        println!("no checkpoints for thread {thread_id}");
        return Ok(());
    }

    for checkpoint in checkpoints {
        println!(
            "{}  {}  {}  status={}",
            checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"),
            checkpoint.checkpoint_id,
            checkpoint.node_name,
            checkpoint.state.status
        );
    }
    Ok(())
}
