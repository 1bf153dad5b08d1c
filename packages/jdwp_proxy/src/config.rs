use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::server::ListenEndpoint;

// =============================================================================
// File config (figment-deserialized from defaults / TOML file / env vars)
// =============================================================================
//
//   proxy.toml:      port = 8600
//                    handshake_timeout_ms = 2000
//
//   env var:         JDWP_PROXY_PORT=8600

/// Tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

fn default_port() -> u16 {
    8599
}
fn default_reconnect_interval_ms() -> u64 {
    1000
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}
fn default_read_buffer_size() -> usize {
    16 * 1024
}

/// Build a figment that layers: defaults → `path` (if given) → JDWP_PROXY_* env vars.
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("JDWP_PROXY_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub endpoint: ListenEndpoint,
    /// Minimum spacing between a follower's attempts to reach the leader
    pub reconnect_interval: Duration,
    /// Budget for a debugger to send its request and handshake
    pub handshake_timeout: Duration,
    pub read_buffer_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

impl ProxyConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            endpoint: ListenEndpoint::loopback(fc.port),
            reconnect_interval: Duration::from_millis(fc.reconnect_interval_ms),
            handshake_timeout: Duration::from_millis(fc.handshake_timeout_ms),
            read_buffer_size: fc.read_buffer_size,
        }
    }

    /// Resolve the layered config. A missing file is treated as empty.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc: FileConfig = load_config(path)
            .extract()
            .context("Failed to load proxy configuration")?;
        Ok(Self::from_file(&fc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_config_defaults() {
        let d = FileConfig::default();
        assert_eq!(d.port, 8599);
        assert_eq!(d.reconnect_interval_ms, 1000);
        assert_eq!(d.handshake_timeout_ms, 5000);
        assert_eq!(d.read_buffer_size, 16 * 1024);
    }

    #[test]
    fn test_proxy_config_from_file() {
        let fc = FileConfig {
            port: 9000,
            reconnect_interval_ms: 250,
            ..Default::default()
        };
        let pc = ProxyConfig::from_file(&fc);
        assert_eq!(pc.endpoint, ListenEndpoint::loopback(9000));
        assert_eq!(pc.reconnect_interval, Duration::from_millis(250));
        assert_eq!(pc.handshake_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 8700\nhandshake_timeout_ms = 1500").unwrap();

        let fc: FileConfig = load_config(Some(file.path())).extract().unwrap();
        assert_eq!(fc.port, 8700);
        assert_eq!(fc.handshake_timeout_ms, 1500);
        assert_eq!(fc.reconnect_interval_ms, 1000);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let pc = ProxyConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(pc.endpoint.port(), 8599);
    }

    #[test]
    fn test_bad_value_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = \"not a port\"").unwrap();
        assert!(ProxyConfig::load(Some(file.path())).is_err());
    }
}
