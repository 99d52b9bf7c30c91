//! Agent configuration
//!
//! Settings come from a YAML file, with `MESHTUN_*` environment variables
//! filling in any field the file leaves empty. Validation happens once,
//! after merging; a bad configuration is fatal at startup.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors. All of them abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("error parsing {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("environment variable {name} has unusable value {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("missing required option: {0}")]
    Missing(&'static str),

    #[error(
        "invalid prefix lengths (common {common}, region {region}, datacenter {datacenter}): \
         need common < 24, common < datacenter <= 32, datacenter - common <= 10"
    )]
    InvalidPrefixLengths { common: u8, region: u8, datacenter: u8 },

    #[error("vpn_endpoint_start_port {0} leaves no room for 1024 per-endpoint ports")]
    InvalidStartPort(u16),

    #[error("public_ip_address is not an IPv4 address: {0}")]
    InvalidPublicIp(String),

    #[error("failed to list network interfaces: {0}")]
    ListInterfaces(nix::Error),

    #[error("network interface {0} not found")]
    InterfaceNotFound(String),

    #[error("network interface {0} has no IPv4 address")]
    InterfaceNoIpv4(String),
}

/// Everything the agent needs to run on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Cluster-unique node name.
    pub node_name: String,
    /// Interface whose first IPv4 address is our private bind address.
    pub local_interface: String,
    /// Public IPv4 address advertised to gossip peers.
    pub public_ip_address: String,
    pub gossip_port: u16,
    /// Pool key sealing gossip traffic; empty disables sealing.
    pub gossip_encryption_key: String,
    pub data_dir: PathBuf,
    pub common_prefix_length: u8,
    pub region_prefix_length: u8,
    pub datacenter_prefix_length: u8,
    pub vpn_endpoint_start_port: u16,
    /// Pre-shared tunnel key file, identical on every endpoint.
    pub vpn_key_file: PathBuf,
    /// Seed peers ("host:port") contacted at startup.
    pub initial_peers: Vec<String>,
    pub openvpn_path: PathBuf,
    /// Indirection for launching openvpn; null to launch directly.
    pub launcher_path: Option<PathBuf>,
    /// Accept tunnel datagrams from any source address. Development only.
    pub allow_float: bool,
    pub reconcile_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_name: String::new(),
            local_interface: String::new(),
            public_ip_address: String::new(),
            gossip_port: 0,
            gossip_encryption_key: String::new(),
            data_dir: PathBuf::from("/var/lib/meshtun"),
            common_prefix_length: 0,
            region_prefix_length: 0,
            datacenter_prefix_length: 0,
            vpn_endpoint_start_port: 0,
            vpn_key_file: PathBuf::new(),
            initial_peers: Vec::new(),
            openvpn_path: PathBuf::from("/usr/sbin/openvpn"),
            launcher_path: Some(PathBuf::from("/usr/bin/sudo")),
            allow_float: false,
            reconcile_interval_secs: 10,
        }
    }
}

impl Config {
    /// Load, merge with the environment, and validate. With no file every
    /// setting must come from the environment.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Fill empty fields from `MESHTUN_*` environment variables. A value in
    /// the file always wins over the environment.
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }
        fn parsed<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
            match var(name) {
                None => Ok(None),
                Some(value) => value
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidEnv { name, value }),
            }
        }

        if self.node_name.is_empty() {
            if let Some(v) = var("MESHTUN_NODE_NAME") {
                self.node_name = v;
            }
        }
        if self.local_interface.is_empty() {
            if let Some(v) = var("MESHTUN_INTERFACE") {
                self.local_interface = v;
            }
        }
        if self.public_ip_address.is_empty() {
            if let Some(v) = var("MESHTUN_PUBLIC_IP") {
                self.public_ip_address = v;
            }
        }
        if self.gossip_port == 0 {
            if let Some(v) = parsed("MESHTUN_GOSSIP_PORT")? {
                self.gossip_port = v;
            }
        }
        if self.gossip_encryption_key.is_empty() {
            if let Some(v) = var("MESHTUN_GOSSIP_KEY") {
                self.gossip_encryption_key = v;
            }
        }
        if let Some(v) = var("MESHTUN_DATA_DIR") {
            if self.data_dir == Config::default().data_dir {
                self.data_dir = PathBuf::from(v);
            }
        }
        if self.common_prefix_length == 0 {
            if let Some(v) = parsed("MESHTUN_COMMON_PREFIX_LEN")? {
                self.common_prefix_length = v;
            }
        }
        if self.region_prefix_length == 0 {
            if let Some(v) = parsed("MESHTUN_REGION_PREFIX_LEN")? {
                self.region_prefix_length = v;
            }
        }
        if self.datacenter_prefix_length == 0 {
            if let Some(v) = parsed("MESHTUN_DC_PREFIX_LEN")? {
                self.datacenter_prefix_length = v;
            }
        }
        if self.vpn_endpoint_start_port == 0 {
            if let Some(v) = parsed("MESHTUN_START_PORT")? {
                self.vpn_endpoint_start_port = v;
            }
        }
        if self.vpn_key_file.as_os_str().is_empty() {
            if let Some(v) = var("MESHTUN_VPN_KEY_FILE") {
                self.vpn_key_file = PathBuf::from(v);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.is_empty() {
            return Err(ConfigError::Missing("node_name"));
        }
        if self.local_interface.is_empty() {
            return Err(ConfigError::Missing("local_interface"));
        }
        if self.public_ip_address.is_empty() {
            return Err(ConfigError::Missing("public_ip_address"));
        }
        self.public_ip()?;
        if self.gossip_port == 0 {
            return Err(ConfigError::Missing("gossip_port"));
        }
        if self.vpn_key_file.as_os_str().is_empty() {
            return Err(ConfigError::Missing("vpn_key_file"));
        }

        let (c, r, d) = (
            self.common_prefix_length,
            self.region_prefix_length,
            self.datacenter_prefix_length,
        );
        if c >= 24 || c >= d || d > 32 || d - c > 10 || r > 32 {
            return Err(ConfigError::InvalidPrefixLengths {
                common: c,
                region: r,
                datacenter: d,
            });
        }

        let start = self.vpn_endpoint_start_port;
        if start == 0 || u32::from(start) + 0x3ff > 65535 {
            return Err(ConfigError::InvalidStartPort(start));
        }

        Ok(())
    }

    pub fn public_ip(&self) -> Result<Ipv4Addr, ConfigError> {
        self.public_ip_address
            .parse()
            .map_err(|_| ConfigError::InvalidPublicIp(self.public_ip_address.clone()))
    }
}
