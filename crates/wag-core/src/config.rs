//! Node configuration file.
//!
//! A single JSON file read once at startup. The clustering section names
//! this node and its static peer list; everything else seeds the
//! configuration plane on first run and is ignored on later restarts.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::entities::Acl;
use crate::settings::Oidc;
use crate::settings::Pam;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unable to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The peer map names this node; starting would trample the peer entry.
    #[error("clustering.peers contains the same name ({name}) as this node")]
    SelfInPeers { name: String },

    #[error("clustering.name must be set")]
    MissingNodeName,
}

/// Static cluster membership for the embedded store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusteringConfig {
    /// This node's name; must not appear in `peers`.
    pub name: String,
    /// Address this node's store listens on for peer traffic.
    pub listen_address: String,
    /// Name to address map of every *other* cluster node.
    #[serde(default)]
    pub peers: BTreeMap<String, String>,
    /// Directory holding the store's on-disk state
    /// (`<database_location>/<name>.wag-node.etcd`).
    pub database_location: PathBuf,
}

impl ClusteringConfig {
    /// Store directory for this node.
    pub fn store_dir(&self) -> PathBuf {
        self.database_location.join(format!("{}.wag-node.etcd", self.name))
    }
}

/// Authenticator seed settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthenticatorsConfig {
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub domain_url: String,
    #[serde(default)]
    pub default_method: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub oidc: Oidc,
    #[serde(default)]
    pub pam: Pam,
}

/// ACL and group seed data.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AclsConfig {
    #[serde(default)]
    pub policies: BTreeMap<String, Acl>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub clustering: ClusteringConfig,

    /// Path of the legacy embedded SQL database, imported once if present.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default = "default_lockout")]
    pub lockout: u32,
    #[serde(default = "default_inactivity")]
    pub session_inactivity_timeout_minutes: i64,
    #[serde(default = "default_lifetime")]
    pub max_session_lifetime_minutes: i64,

    #[serde(default)]
    pub help_mail: String,
    #[serde(default)]
    pub external_address: String,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default = "default_wg_filename")]
    pub download_config_file_name: String,
    #[serde(default)]
    pub check_updates: bool,

    #[serde(default)]
    pub authenticators: AuthenticatorsConfig,
    #[serde(default)]
    pub acls: AclsConfig,
}

fn default_lockout() -> u32 {
    5
}

fn default_inactivity() -> i64 {
    10
}

fn default_lifetime() -> i64 {
    60 * 4
}

fn default_wg_filename() -> String {
    "wg0.conf".to_string()
}

impl Config {
    /// Load and sanity-check a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clustering.name.is_empty() {
            return Err(ConfigError::MissingNodeName);
        }
        if self.clustering.peers.contains_key(&self.clustering.name) {
            return Err(ConfigError::SelfInPeers {
                name: self.clustering.name.clone(),
            });
        }
        Ok(())
    }

    /// Store directory for this node,
    /// `<database_location>/<name>.wag-node.etcd`.
    pub fn store_dir(&self) -> PathBuf {
        self.clustering.store_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            clustering: ClusteringConfig {
                name: "node1".into(),
                listen_address: "127.0.0.1:4780".into(),
                peers: BTreeMap::new(),
                database_location: PathBuf::from("/var/lib/wag"),
            },
            ..Config::default()
        }
    }

    #[test]
    fn self_in_peer_map_is_rejected() {
        let mut config = minimal();
        config
            .clustering
            .peers
            .insert("node1".into(), "127.0.0.1:4781".into());
        assert!(matches!(config.validate(), Err(ConfigError::SelfInPeers { .. })));
    }

    #[test]
    fn store_dir_layout() {
        let config = minimal();
        assert_eq!(config.store_dir(), PathBuf::from("/var/lib/wag/node1.wag-node.etcd"));
    }

    #[test]
    fn defaults_fill_in() {
        let config: Config = serde_json::from_str(
            r#"{"clustering":{"name":"a","listen_address":"127.0.0.1:1","database_location":"/tmp"}}"#,
        )
        .unwrap();
        assert_eq!(config.lockout, 5);
        assert_eq!(config.download_config_file_name, "wg0.conf");
        assert_eq!(config.max_session_lifetime_minutes, 240);
    }
}
