//! Storage configuration.

use serde::Deserialize;
use std::time::Duration;

use super::duration;

const DEFAULT_PATH: &str = "escrow_fill.db";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite storage settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file, or ":memory:".
    pub path: Option<String>,
    /// Maximum number of connections in the pool.
    pub max_connections: Option<u32>,
    /// How long a writer waits on a locked database.
    #[serde(default, with = "duration")]
    pub busy_timeout: Duration,
}

impl StorageConfig {
    pub fn path(&self) -> String {
        self.path.clone().unwrap_or_else(|| DEFAULT_PATH.to_string())
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    pub fn busy_timeout(&self) -> Duration {
        duration::or_default(self.busy_timeout, DEFAULT_BUSY_TIMEOUT)
    }
}
