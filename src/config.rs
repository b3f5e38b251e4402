use crate::error::ServerResult;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Engine tuning knobs for a server instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    // Listening socket
    pub backlog: u32,

    // Connection settings
    pub read_buffer_size: usize,
    pub nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: 1024,
            read_buffer_size: 16 * 1024, // 16 KB
            nodelay: true,
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen backlog
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the per-read buffer size for connections
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Enable or disable TCP_NODELAY on accepted sockets
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ServerResult<Self> {
        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_json_file<P: AsRef<Path>>(&self, path: P) -> ServerResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::new();
        assert_eq!(config.backlog, 1024);
        assert_eq!(config.read_buffer_size, 16 * 1024);
        assert!(config.nodelay);
    }

    #[test]
    fn json_round_trip() {
        let dir = std::env::temp_dir().join("event-server-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let config = ServerConfig::new().with_backlog(64).with_nodelay(false);
        config.save_to_json_file(&path).unwrap();

        let loaded = ServerConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded.backlog, 64);
        assert!(!loaded.nodelay);
    }
}
