//! Configuration file management for worldmind.
//!
//! Provides a TOML-based config file at `~/.config/worldmind/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub caller: CallerSection,
    #[serde(default)]
    pub deployer: DeployerSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// PostgreSQL URL for the checkpoint store.
    pub url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CallerSection {
    /// Command invoked for structured LLM calls. Receives the call name as
    /// its first argument, JSON on stdin, and must print JSON on stdout.
    pub command: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DeployerSection {
    pub apps_domain: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the worldmind config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/worldmind` or
/// `~/.config/worldmind`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("worldmind");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("worldmind")
}

/// Return the path to the worldmind config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Missing file yields defaults.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Resolve the database URL: flag > env > config file > default.
pub fn resolve_database_url(flag: Option<&str>, file: &ConfigFile) -> String {
    if let Some(url) = flag {
        return url.to_owned();
    }
    if let Ok(url) = std::env::var("WORLDMIND_DATABASE_URL") {
        return url;
    }
    if let Some(url) = &file.database.url {
        return url.clone();
    }
    worldmind_db::config::DbConfig::DEFAULT_URL.to_owned()
}

/// Resolve the caller command: flag > env > config file.
pub fn resolve_caller_command(flag: Option<&str>, file: &ConfigFile) -> Option<String> {
    if let Some(cmd) = flag {
        return Some(cmd.to_owned());
    }
    if let Ok(cmd) = std::env::var("WORLDMIND_CALLER_CMD") {
        return Some(cmd);
    }
    file.caller.command.clone()
}
