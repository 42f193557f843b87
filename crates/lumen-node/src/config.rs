//! Node configuration.
//!
//! Loaded from a TOML file named on the command line. Every field has a
//! default so a minimal deployment can start from an empty file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config {path}: {source}")]
    Io {
        /// The offending path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("cannot parse config {path}: {source}")]
    Parse {
        /// The offending path.
        path: String,
        /// The underlying parse error.
        #[source]
        source: toml::de::Error,
    },
}

/// One membership roster entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Hex-encoded 32-byte node reference (its verifying key).
    pub reference: String,

    /// Roles the node's certificate permits.
    #[serde(default)]
    pub roles: Vec<String>,

    /// Whether the node is active. Defaults to true.
    #[serde(default = "default_true")]
    pub active: bool,
}

/// The node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the JSON-RPC front-end listens on.
    #[serde(default = "default_rpc_listen")]
    pub rpc_listen: SocketAddr,

    /// Path of the SQLite ledger file.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// Path of the node's secret key file. A missing file is generated on
    /// first start.
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,

    /// Roles this node runs with.
    #[serde(default = "default_roles")]
    pub roles: Vec<String>,

    /// Deadline for a waiting contract call.
    #[serde(default = "default_call_timeout")]
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Deadline for one jet-fetch round against peers.
    #[serde(default = "default_fetch_timeout")]
    #[serde(with = "humantime_serde")]
    pub jet_fetch_timeout: Duration,

    /// Cap on open requests per object.
    #[serde(default = "default_pending_limit")]
    pub pending_limit: usize,

    /// The per-pulse membership roster. Static here; a gossip membership
    /// service would replace this section.
    #[serde(default)]
    pub roster: Vec<RosterEntry>,
}

fn default_rpc_listen() -> SocketAddr {
    "127.0.0.1:19101".parse().expect("valid default address")
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("lumen-data/ledger.db")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("lumen-data/node.key")
}

fn default_roles() -> Vec<String> {
    vec!["light_executor".to_owned()]
}

const fn default_call_timeout() -> Duration {
    Duration::from_secs(25)
}

const fn default_fetch_timeout() -> Duration {
    Duration::from_secs(5)
}

const fn default_pending_limit() -> usize {
    1000
}

const fn default_true() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_listen: default_rpc_listen(),
            storage_path: default_storage_path(),
            key_file: default_key_file(),
            roles: default_roles(),
            call_timeout: default_call_timeout(),
            jet_fetch_timeout: default_fetch_timeout(),
            pending_limit: default_pending_limit(),
            roster: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Loads the configuration from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg: NodeConfig = toml::from_str("").expect("parse");
        assert_eq!(cfg.rpc_listen, default_rpc_listen());
        assert_eq!(cfg.call_timeout, Duration::from_secs(25));
        assert_eq!(cfg.pending_limit, 1000);
        assert_eq!(cfg.roles, vec!["light_executor".to_owned()]);
        assert!(cfg.roster.is_empty());
    }

    #[test]
    fn durations_accept_humantime() {
        let cfg: NodeConfig = toml::from_str(
            r#"
            call_timeout = "10s"
            jet_fetch_timeout = "750ms"
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.call_timeout, Duration::from_secs(10));
        assert_eq!(cfg.jet_fetch_timeout, Duration::from_millis(750));
    }

    #[test]
    fn roster_entries_parse() {
        let cfg: NodeConfig = toml::from_str(
            r#"
            [[roster]]
            reference = "aa"
            roles = ["light_executor", "heavy_executor"]

            [[roster]]
            reference = "bb"
            active = false
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.roster.len(), 2);
        assert!(cfg.roster[0].active);
        assert!(!cfg.roster[1].active);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = NodeConfig::load(Path::new("/nonexistent/lumen.toml"))
            .expect_err("must fail");
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
