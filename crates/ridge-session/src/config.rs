//! Session configuration.
//!
//! Two surfaces: the enumerated key→string [`Config::insert`] map that
//! embedded hosts drive, and a TOML file with env-var overrides.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $RIDGE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ridge/config.toml
//!   3. ~/.config/ridge/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use ridge_proto::core::{
    what, DEFAULT_BATCH_SIZE, DEFAULT_LEASE_MS, DEFAULT_SCOUT_LOCATOR, DEFAULT_SN_RESOLUTION,
};

/// How this session participates in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Connect to a router and let it do the routing.
    #[default]
    Client,
    /// Talk to other peers directly, unicast or multicast.
    Peer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    /// Endpoints to dial at open.
    pub connect: Vec<String>,
    /// Endpoints to accept sessions on.
    pub listen: Vec<String>,
    /// Scouting budget in milliseconds.
    pub scouting_timeout_ms: u64,
    /// Mask of roles scouting looks for (router=1, peer=2, client=4).
    pub scouting_what: u8,
    /// Multicast locator scouting talks to.
    pub scout_locator: String,
    /// Optional credentials, forwarded to the links.
    pub user: Option<String>,
    pub password: Option<String>,

    /// Lease announced to peers, in milliseconds.
    pub lease_ms: u64,
    /// Proposed maximum batch size in bytes.
    pub batch_size: u16,
    /// Proposed sequence-number resolution.
    pub sn_resolution: u64,
    /// Per-peer, per-channel defragmentation budget in bytes. 0 = unlimited.
    pub defrag_budget: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            connect: Vec::new(),
            listen: Vec::new(),
            scouting_timeout_ms: 3_000,
            scouting_what: what::ROUTER | what::PEER,
            scout_locator: DEFAULT_SCOUT_LOCATOR.to_string(),
            user: None,
            password: None,
            lease_ms: DEFAULT_LEASE_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            sn_resolution: DEFAULT_SN_RESOLUTION,
            defrag_budget: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot insert {key}={value}")]
    InsertFailed { key: String, value: String },

    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),

    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

impl Config {
    /// Set one of the enumerated string keys.
    ///
    /// Recognized: `mode`, `connect`, `listen`, `scouting.timeout`,
    /// `scouting.what`, `user`, `password`.
    pub fn insert(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let fail = || ConfigError::InsertFailed {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "mode" => {
                self.mode = match value {
                    "client" => Mode::Client,
                    "peer" => Mode::Peer,
                    _ => return Err(fail()),
                };
            }
            "connect" => {
                self.connect = split_endpoints(value);
            }
            "listen" => {
                self.listen = split_endpoints(value);
            }
            "scouting.timeout" => {
                self.scouting_timeout_ms = value.parse().map_err(|_| fail())?;
            }
            "scouting.what" => {
                self.scouting_what = value.parse().map_err(|_| fail())?;
            }
            "user" => {
                self.user = Some(value.to_string());
            }
            "password" => {
                self.password = Some(value.to_string());
            }
            _ => return Err(fail()),
        }
        Ok(())
    }

    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("RIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply RIDGE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RIDGE_MODE") {
            let _ = self.insert("mode", &v);
        }
        if let Ok(v) = std::env::var("RIDGE_CONNECT") {
            let _ = self.insert("connect", &v);
        }
        if let Ok(v) = std::env::var("RIDGE_LISTEN") {
            let _ = self.insert("listen", &v);
        }
        if let Ok(v) = std::env::var("RIDGE_SCOUTING_TIMEOUT") {
            let _ = self.insert("scouting.timeout", &v);
        }
    }
}

fn split_endpoints(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("ridge")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_recognizes_every_spec_key() {
        let mut c = Config::default();
        c.insert("mode", "peer").unwrap();
        c.insert("connect", "tcp/10.0.0.1:7447,udp/10.0.0.2:7447")
            .unwrap();
        c.insert("listen", "tcp/0.0.0.0:7447").unwrap();
        c.insert("scouting.timeout", "500").unwrap();
        c.insert("scouting.what", "3").unwrap();
        c.insert("user", "alice").unwrap();
        c.insert("password", "secret").unwrap();

        assert_eq!(c.mode, Mode::Peer);
        assert_eq!(c.connect.len(), 2);
        assert_eq!(c.listen, vec!["tcp/0.0.0.0:7447".to_string()]);
        assert_eq!(c.scouting_timeout_ms, 500);
        assert_eq!(c.scouting_what, 3);
        assert_eq!(c.user.as_deref(), Some("alice"));
    }

    #[test]
    fn insert_rejects_unknown_keys_and_bad_values() {
        let mut c = Config::default();
        assert!(c.insert("mode", "gateway").is_err());
        assert!(c.insert("scouting.timeout", "soon").is_err());
        assert!(c.insert("no.such.key", "1").is_err());
    }

    #[test]
    fn default_has_sane_transport_parameters() {
        let c = Config::default();
        assert_eq!(c.lease_ms, DEFAULT_LEASE_MS);
        assert_eq!(c.sn_resolution, DEFAULT_SN_RESOLUTION);
        assert!(c.connect.is_empty() && c.listen.is_empty());
    }

    #[test]
    fn toml_round_trips() {
        let mut c = Config::default();
        c.insert("mode", "peer").unwrap();
        c.insert("connect", "tcp/10.0.0.1:7447").unwrap();
        let text = toml::to_string(&c).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.mode, Mode::Peer);
        assert_eq!(back.connect, c.connect);
    }
}
