//! Server settings

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use store_common::error::ConfigurationError;
use tracing::warn;

use crate::storage::InstanceSetup;
use crate::trigger::TriggerSetting;

pub const DEFAULT_CONFIG_PATH: &str = "./mkts.yml";

/// Environment override prefix, e.g. `MKTS__REPLICATION__MASTER_HOST`
pub const ENV_PREFIX: &str = "MKTS";

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Storage root
    #[serde(default = "default_root_directory")]
    pub root_directory: PathBuf,
    /// Primary HTTP listener (`/rpc`, `/ws`, `/metrics`)
    #[serde(default = "default_listen_url")]
    pub listen_url: String,
    /// Dedicated query/write RPC listener; unset or empty serves RPC on
    /// `/rpc` of the primary listener only
    #[serde(default)]
    pub grpc_listen_url: Option<String>,
    #[serde(default = "default_msg_size")]
    pub grpc_max_send_msg_size: usize,
    #[serde(default = "default_msg_size")]
    pub grpc_max_recv_msg_size: usize,
    /// Optional `/heartbeat` listener
    #[serde(default)]
    pub utilities_url: Option<String>,
    /// Pause between closing the readiness gate and the durability wait
    #[serde(default, deserialize_with = "crate::config::duration::deserialize")]
    pub stop_grace_period: Duration,
    #[serde(default)]
    pub replication: ReplicationSettings,
    #[serde(default = "default_true")]
    pub init_catalog: bool,
    #[serde(default = "default_true")]
    pub init_wal_cache: bool,
    #[serde(default = "default_true")]
    pub background_sync: bool,
    #[serde(default)]
    pub wal_bypass: bool,
    #[serde(default)]
    pub triggers: Vec<TriggerSetting>,
    /// Interval of the uptime background worker
    #[serde(
        default = "default_uptime_interval",
        deserialize_with = "crate::config::duration::deserialize"
    )]
    pub uptime_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Port the master's replication service listens on
    #[serde(default = "default_replication_port")]
    pub listen_port: u16,
    /// `host:port` of the master; non-empty makes this server a replica
    /// unless `enabled` is also set
    #[serde(default)]
    pub master_host: String,
    /// Delay between reconnect attempts to the master
    #[serde(
        default = "default_retry_interval",
        deserialize_with = "crate::config::duration::deserialize"
    )]
    pub retry_interval: Duration,
    #[serde(default = "default_max_msg_size")]
    pub max_send_msg_size: usize,
    #[serde(default = "default_max_msg_size")]
    pub max_recv_msg_size: usize,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_port: default_replication_port(),
            master_host: String::new(),
            retry_interval: default_retry_interval(),
            max_send_msg_size: default_max_msg_size(),
            max_recv_msg_size: default_max_msg_size(),
        }
    }
}

fn default_root_directory() -> PathBuf {
    PathBuf::from("data")
}

fn default_listen_url() -> String {
    "0.0.0.0:5993".to_string()
}

fn default_msg_size() -> usize {
    1024 * 1024 * 1024
}

fn default_max_msg_size() -> usize {
    64 * 1024 * 1024
}

fn default_replication_port() -> u16 {
    5996
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_uptime_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

impl ServerSettings {
    /// Load `path` and apply `MKTS__` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigurationError::FileNotFound(path.display().to_string()));
        }

        let settings: ServerSettings = Config::builder()
            .add_source(File::from(path).required(true))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigurationError::Parse(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would only fail later, after listeners are built
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.listen_addr()?;
        self.grpc_listen_addr()?;
        self.utilities_addr()?;
        if self.grpc_max_send_msg_size == 0 || self.grpc_max_recv_msg_size == 0 {
            return Err(ConfigurationError::invalid(
                "grpc_max_send_msg_size",
                "message size limits must be positive",
            ));
        }
        if self.replication.enabled && !self.replication.master_host.trim().is_empty() {
            warn!(
                master_host = %self.replication.master_host,
                "Replication enabled, ignoring master_host and starting as master"
            );
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigurationError> {
        parse_addr("listen_url", &self.listen_url)
    }

    pub fn grpc_listen_addr(&self) -> Result<Option<SocketAddr>, ConfigurationError> {
        self.grpc_listen_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .map(|url| parse_addr("grpc_listen_url", url))
            .transpose()
    }

    pub fn utilities_addr(&self) -> Result<Option<SocketAddr>, ConfigurationError> {
        self.utilities_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .map(|url| parse_addr("utilities_url", url))
            .transpose()
    }

    pub fn replication_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.replication.listen_port))
    }

    /// Storage toggles from these settings
    pub fn instance_setup(&self) -> InstanceSetup {
        InstanceSetup {
            root_dir: self.root_directory.clone(),
            replication_sender: None,
            init_catalog: self.init_catalog,
            init_wal_cache: self.init_wal_cache,
            background_sync: self.background_sync,
            wal_bypass: self.wal_bypass,
        }
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr, ConfigurationError> {
    let trimmed = value
        .trim_start_matches("http://")
        .trim_start_matches("tcp://");
    trimmed
        .parse()
        .map_err(|e| ConfigurationError::invalid(field, format!("'{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_yaml(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_from_minimal_file() {
        let file = write_yaml("root_directory: /tmp/mktsdb\n");
        let settings = ServerSettings::load(file.path()).unwrap();
        assert_eq!(settings.root_directory, PathBuf::from("/tmp/mktsdb"));
        assert_eq!(settings.listen_addr().unwrap().port(), 5993);
        assert_eq!(settings.grpc_listen_addr().unwrap(), None);
        assert!(settings.init_catalog);
        assert!(!settings.wal_bypass);
        assert!(!settings.replication.enabled);
        assert_eq!(settings.stop_grace_period, Duration::ZERO);
    }

    #[test]
    fn test_full_file() {
        let file = write_yaml(
            r#"
listen_url: 127.0.0.1:6000
grpc_listen_url: 127.0.0.1:6001
utilities_url: 127.0.0.1:6002
stop_grace_period: 5s
replication:
  master_host: 10.0.0.1:5996
triggers:
  - module: ondiskagg.so
    on: "*/1Min/OHLCV"
    config:
      filter: nasdaq
      destinations: [5Min, 1D]
"#,
        );
        let settings = ServerSettings::load(file.path()).unwrap();
        assert_eq!(settings.stop_grace_period, Duration::from_secs(5));
        assert_eq!(settings.replication.master_host, "10.0.0.1:5996");
        assert_eq!(settings.utilities_addr().unwrap().unwrap().port(), 6002);
        assert_eq!(settings.grpc_listen_addr().unwrap().unwrap().port(), 6001);
        assert_eq!(settings.triggers.len(), 1);
        assert_eq!(settings.triggers[0].config.destinations, vec!["5Min", "1D"]);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ServerSettings::load("/nonexistent/mkts.yml"),
            Err(ConfigurationError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_bad_listen_url_is_rejected() {
        let file = write_yaml("listen_url: not-an-address\n");
        assert!(matches!(
            ServerSettings::load(file.path()),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_empty_grpc_listen_url_means_none() {
        let file = write_yaml("grpc_listen_url: \"\"\n");
        let settings = ServerSettings::load(file.path()).unwrap();
        assert_eq!(settings.grpc_listen_addr().unwrap(), None);

        let file = write_yaml("grpc_listen_url: nowhere\n");
        assert!(ServerSettings::load(file.path()).is_err());
    }

    #[test]
    fn test_enabled_master_with_master_host_loads() {
        let file = write_yaml("replication:\n  enabled: true\n  master_host: 10.0.0.1:5996\n");
        let settings = ServerSettings::load(file.path()).unwrap();
        assert_eq!(
            crate::replication::ReplicationRole::from_settings(&settings.replication),
            crate::replication::ReplicationRole::Master
        );
    }
}
