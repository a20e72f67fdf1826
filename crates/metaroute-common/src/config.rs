//! Configuration types for metaroute
//!
//! The daemon and the administration tool read one TOML file. Every field
//! has a default so a partial (or missing) file is valid; command line
//! arguments are merged on top by the binaries.

use crate::error::{Error, Result};
use crate::types::{
    DEFAULT_MLT_PATH, DEFAULT_PEER_PORT, DEFAULT_RECEIVE_STAGING_PATH, DEFAULT_STAGING_PATH,
    Server,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub mlt: MltConfig,
    #[serde(default)]
    pub peers: PeerConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub exports: ExportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the defaults; a file that exists but does not
    /// parse is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Listen addresses of the peer channel server and the lookup service.
    ///
    /// With variable ports a server's registered port is where its peers
    /// dial it, so the peer server binds that port (on the host of
    /// `node.listen`) and the lookup service needs `node.lookup_listen` on
    /// another port. Otherwise peers use `node.listen` and lookups default to
    /// the registered port.
    pub fn listen_addresses(&self) -> Result<(String, String)> {
        let node = &self.node;
        if !self.peers.variable_ports {
            let lookup = node
                .lookup_listen
                .clone()
                .unwrap_or_else(|| format!("0.0.0.0:{}", node.port));
            return Ok((node.listen.clone(), lookup));
        }

        let host = node
            .listen
            .rsplit_once(':')
            .map_or(node.listen.as_str(), |(host, _)| host);
        let peer = format!("{host}:{}", node.port);
        let lookup = node.lookup_listen.clone().ok_or_else(|| {
            Error::Configuration(
                "peers.variable_ports needs node.lookup_listen on a port other than node.port"
                    .to_string(),
            )
        })?;
        let lookup_port = lookup
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok());
        if lookup_port == Some(node.port) {
            return Err(Error::Configuration(format!(
                "node.lookup_listen {lookup} collides with the peer port {}",
                node.port
            )));
        }
        Ok((peer, lookup))
    }
}

/// Identity of this metadata server
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address published in the routing table
    #[serde(default = "default_address")]
    pub address: String,
    /// Metadata service port published in the routing table
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen address for peer traffic. With `peers.variable_ports` only
    /// its host is used and the port is `port`.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen address for client lookups, `0.0.0.0:<port>` when unset
    #[serde(default)]
    pub lookup_listen: Option<String>,
}

impl NodeConfig {
    #[must_use]
    pub fn server(&self) -> Server {
        Server::new(self.address.clone(), self.port)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            listen: default_listen(),
            lookup_listen: None,
        }
    }
}

/// Routing table file locations
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MltConfig {
    #[serde(default = "default_mlt_path")]
    pub path: PathBuf,
    #[serde(default = "default_staging_path")]
    pub staging_path: PathBuf,
    #[serde(default = "default_receive_staging_path")]
    pub receive_staging_path: PathBuf,
}

impl Default for MltConfig {
    fn default() -> Self {
        Self {
            path: default_mlt_path(),
            staging_path: default_staging_path(),
            receive_staging_path: default_receive_staging_path(),
        }
    }
}

/// Outbound channel settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Key peers by `address:port` instead of the bare address
    #[serde(default)]
    pub variable_ports: bool,
    /// Port appended to bare addresses when dialling
    #[serde(default = "default_peer_port")]
    pub default_port: u16,
    /// Optional whitespace separated list of peers to connect at startup
    #[serde(default)]
    pub ip_config: Option<PathBuf>,
    /// Largest frame accepted or sent on a channel
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl PeerConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            variable_ports: false,
            default_port: default_peer_port(),
            ip_config: None,
            max_frame_len: default_max_frame_len(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Replication daemon settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// How often the staging path is checked
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pause after a push before the staging file is removed
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Wait this long for peer acknowledgements instead of the grace period
    #[serde(default)]
    pub ack_timeout_ms: Option<u64>,
    /// Keep a staging file that failed to load as `<name>.failed`
    #[serde(default)]
    pub retain_failed_staging: bool,
}

impl ReplicationConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    #[must_use]
    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            grace_period_ms: default_grace_period_ms(),
            ack_timeout_ms: None,
            retain_failed_staging: false,
        }
    }
}

/// Exported filesystem configuration regenerated after migrations
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Where the export blocks are written; regeneration is off when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Address of the co-located privileged process told to reload them
    #[serde(default)]
    pub privileged_peer: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Read the peer list file: addresses separated by any whitespace.
pub fn read_ip_config(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text.split_whitespace().map(str::to_string).collect())
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    1337
}

fn default_listen() -> String {
    format!("0.0.0.0:{DEFAULT_PEER_PORT}")
}

fn default_mlt_path() -> PathBuf {
    PathBuf::from(DEFAULT_MLT_PATH)
}

fn default_staging_path() -> PathBuf {
    PathBuf::from(DEFAULT_STAGING_PATH)
}

fn default_receive_staging_path() -> PathBuf {
    PathBuf::from(DEFAULT_RECEIVE_STAGING_PATH)
}

const fn default_peer_port() -> u16 {
    DEFAULT_PEER_PORT
}

const fn default_max_frame_len() -> usize {
    64 * 1024 * 1024 // 64 MB
}

const fn default_connect_timeout_ms() -> u64 {
    5000
}

const fn default_poll_interval_ms() -> u64 {
    2000
}

const fn default_grace_period_ms() -> u64 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mlt.path, PathBuf::from("/etc/mlt"));
        assert_eq!(config.mlt.staging_path, PathBuf::from("/tmp/temp_mlt"));
        assert_eq!(config.peers.default_port, 49152);
        assert!(!config.peers.variable_ports);
        assert_eq!(config.replication.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.replication.grace_period(), Duration::from_secs(3));
        assert!(config.replication.ack_timeout().is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            [node]
            address = "10.0.0.5"

            [replication]
            ack_timeout_ms = 1500
            "#,
        )
        .unwrap();
        assert_eq!(config.node.server(), Server::new("10.0.0.5", 1337));
        assert_eq!(config.replication.ack_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.logging.level, "info");
        assert!(config.exports.path.is_none());
    }

    #[test]
    fn test_export_section() {
        let config = Config::from_toml(
            r#"
            [exports]
            path = "/etc/ganesha/exports.conf"
            privileged_peer = "127.0.0.1:7000"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.exports.path,
            Some(PathBuf::from("/etc/ganesha/exports.conf"))
        );
        assert_eq!(config.exports.privileged_peer.as_deref(), Some("127.0.0.1:7000"));
    }

    #[test]
    fn test_listen_addresses_fixed_ports() {
        let mut config = Config::default();
        assert_eq!(
            config.listen_addresses().unwrap(),
            ("0.0.0.0:49152".to_string(), "0.0.0.0:1337".to_string())
        );
        config.node.lookup_listen = Some("127.0.0.1:8000".to_string());
        assert_eq!(config.listen_addresses().unwrap().1, "127.0.0.1:8000");
    }

    #[test]
    fn test_listen_addresses_variable_ports() {
        let mut config = Config::from_toml(
            r#"
            [node]
            address = "10.0.0.2"
            port = 50002
            listen = "10.0.0.2:49152"

            [peers]
            variable_ports = true
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.listen_addresses(),
            Err(Error::Configuration(_))
        ));

        config.node.lookup_listen = Some("0.0.0.0:50002".to_string());
        assert!(matches!(
            config.listen_addresses(),
            Err(Error::Configuration(_))
        ));

        config.node.lookup_listen = Some("0.0.0.0:1337".to_string());
        let (peer, lookup) = config.listen_addresses().unwrap();
        assert_eq!(peer, "10.0.0.2:50002");
        assert_eq!(lookup, "0.0.0.0:1337");
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.node.listen, "0.0.0.0:49152");
    }

    #[test]
    fn test_load_malformed_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[node\naddress = ").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_read_ip_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip.config");
        std::fs::write(&path, "10.0.0.1\n10.0.0.2   10.0.0.3\n\n").unwrap();
        assert_eq!(
            read_ip_config(&path).unwrap(),
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );
    }
}
