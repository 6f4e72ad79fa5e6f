//! Shim configuration loading.
//!
//! The configuration document is YAML, enumerating the network-namespace
//! paths to register and optionally overriding the rendezvous socket path.
//!
//! ```yaml
//! workloads:
//!   - /proc/1234/ns/net
//!   - /proc/5678/ns/net
//! socket_path: /var/run/ztunnel/ztunnel.sock
//! ```

use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::protocol::listener::DEFAULT_SOCKET_PATH;

/// Parsed shim configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Network-namespace paths to register, in registration order.
    pub workloads: Vec<PathBuf>,

    /// Rendezvous socket path the proxy connects to.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {}: {}", .path.display(), .source)]
    Read {
        /// The configuration path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The configuration file is not a valid document.
    #[error("failed to parse config file {}: {}", .path.display(), .source)]
    Parse {
        /// The configuration path.
        path: PathBuf,
        /// Underlying parse error.
        source: serde_yaml::Error,
    },

    /// The document lists no workloads.
    ///
    /// A shim with nothing to register has nothing to do; this is a startup
    /// error rather than a silently idle process.
    #[error("config lists no workloads to register")]
    NoWorkloads,
}

impl Config {
    /// Load and validate a configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or
    /// lists no workloads.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if config.workloads.is_empty() {
            return Err(ConfigError::NoWorkloads);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_workloads_in_order() {
        let file = write_config(
            "workloads:\n  - /proc/1234/ns/net\n  - /proc/5678/ns/net\n",
        );

        let config = Config::load(file.path()).unwrap();
        assert_eq!(
            config.workloads,
            vec![
                PathBuf::from("/proc/1234/ns/net"),
                PathBuf::from("/proc/5678/ns/net"),
            ]
        );
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_socket_path_override() {
        let file = write_config(
            "workloads:\n  - /proc/1/ns/net\nsocket_path: /tmp/custom.sock\n",
        );

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/custom.sock"));
    }

    #[test]
    fn test_empty_workload_list_rejected() {
        let file = write_config("workloads: []\n");
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::NoWorkloads)
        ));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let file = write_config("workloads:\n  - /proc/1/ns/net\nreconcile: true\n");
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/shim.yaml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
