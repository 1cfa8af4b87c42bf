use std::env;

/// Connection settings for the checkpoint database.
///
/// Only the URL is carried; everything else (pool sizing, timeouts) is
/// fixed in [`crate::pool`].
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
}

impl DbConfig {
    /// Environment variable consulted by [`Self::from_env`].
    pub const ENV_VAR: &str = "WORLDMIND_DATABASE_URL";

    /// URL used when nothing else is configured.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/worldmind";

    /// Build a config from an explicit URL.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Build a config from `WORLDMIND_DATABASE_URL`, treating an unset or
    /// empty variable as "use the default".
    pub fn from_env() -> Self {
        match env::var(Self::ENV_VAR) {
            Ok(url) if !url.trim().is_empty() => Self::new(url),
            _ => Self::new(Self::DEFAULT_URL),
        }
    }

    /// The database name this URL points at.
    ///
    /// Looks at the path segment after the authority, ignoring any query
    /// string. A URL with no path segment (`postgresql://host:5432`) has
    /// no name.
    pub fn database_name(&self) -> Option<&str> {
        let after_scheme = self
            .database_url
            .split_once("://")
            .map_or(self.database_url.as_str(), |(_, rest)| rest);

        let (authority_and_path, _query) = match after_scheme.split_once('?') {
            Some(parts) => parts,
            None => (after_scheme, ""),
        };

        let (_authority, path) = authority_and_path.split_once('/')?;
        let name = path.trim_end_matches('/');
        (!name.is_empty()).then_some(name)
    }

    /// Rewrite the URL to target a different database on the same server,
    /// preserving any query string.
    pub fn with_database(&self, name: &str) -> String {
        let url = &self.database_url;
        let query = url.split_once('?').map(|(_, q)| q);

        // Base is everything up to the path segment (if any).
        let authority_start = url.find("://").map(|pos| pos + 3).unwrap_or(0);
        let base_end = url[authority_start..]
            .find(['/', '?'])
            .map(|pos| authority_start + pos)
            .unwrap_or(url.len());

        match query {
            Some(q) => format!("{}/{name}?{q}", &url[..base_end]),
            None => format!("{}/{name}", &url[..base_end]),
        }
    }

    /// URL for the server's `postgres` administrative database, used to
    /// issue `CREATE DATABASE` before the target exists.
    pub fn maintenance_url(&self) -> String {
        self.with_database("postgres")
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
