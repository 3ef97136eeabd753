//! Bus configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for the transport layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Max wire line length in bytes; longer frames drop the connection
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// Socket path override; defaults to the runtime dir
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

fn default_max_line_bytes() -> usize {
    1024 * 1024 // 1MB
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
            socket_path: None,
        }
    }
}

impl BusConfig {
    /// Resolve the socket path, falling back to the platform default.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(crate::transport::default_socket_path)
    }

    /// Use a specific socket path (for tests and multi-pool setups).
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BusConfig::default();
        assert_eq!(config.max_line_bytes, 1024 * 1024);
        assert!(config.socket_path.is_none());
    }

    #[test]
    fn test_socket_path_override() {
        let config = BusConfig::default().with_socket_path("/tmp/x/bus.sock");
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/x/bus.sock"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: BusConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_line_bytes, 1024 * 1024);
    }
}
