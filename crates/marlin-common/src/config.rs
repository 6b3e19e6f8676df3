//! Configuration structures for MarlinDB.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Server configuration for a MarlinDB instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port number to listen on.
    pub port: u16,
    /// Number of logical databases selectable with SELECT.
    pub databases: usize,
    /// RDB snapshot configuration.
    pub snapshot: SnapshotConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            databases: 16,
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Returns the `host:port` address to bind the listener to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Location of the RDB snapshot loaded at startup.
///
/// Both fields must be set for a snapshot to be loaded; a missing file is
/// not an error (the server simply starts empty).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Directory in which the snapshot file resides.
    pub dir: Option<PathBuf>,
    /// Name of the snapshot file.
    pub dbfilename: Option<String>,
}

impl SnapshotConfig {
    /// Returns the full path of the snapshot file, if both parts are configured.
    pub fn path(&self) -> Option<PathBuf> {
        match (&self.dir, &self.dbfilename) {
            (Some(dir), Some(name)) => Some(dir.join(name)),
            _ => None,
        }
    }

    /// Returns the configured directory as a display string (for CONFIG GET).
    pub fn dir_str(&self) -> String {
        self.dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_default()
    }

    /// Returns the configured filename (for CONFIG GET).
    pub fn dbfilename_str(&self) -> String {
        self.dbfilename.clone().unwrap_or_default()
    }
}
