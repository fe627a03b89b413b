//! Branch configuration loading.
//!
//! JSON is the sole config source — either an explicit `serde_json::Value`
//! or a file path.  Every field has a documented default; `validate` is run
//! by `Branch::create` and rejects out-of-range values with explicit
//! messages.
//!
//! # Defaults
//! - `name = "<pid>@<hostname>"`, `path = "/<name>"`
//! - advertising on `239.255.42.99:13531` every 1.0 s
//! - session timeout 3.0 s (heartbeats at half that)
//! - transmit/receive queues 35000 bytes each

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Lower bound for both queue sizes; also the receive buffer size every
/// session allocates, so any message a conforming peer sends fits.
pub const MIN_QUEUE_SIZE: usize = 35_000;
/// Upper bound for both queue sizes.
pub const MAX_QUEUE_SIZE: usize = 10_000_000;
/// Maximum accepted info-message body during the handshake.
pub const MAX_INFO_BODY_SIZE: usize = 65_536;

pub const DEFAULT_ADV_ADDRESS: &str = "239.255.42.99";
pub const DEFAULT_ADV_PORT: u16 = 13531;

// ---------------------------------------------------------------------------
// Config type (deserialized from JSON)
// ---------------------------------------------------------------------------

/// Top-level branch configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BranchConfig {
    /// Branch name; defaults to `<pid>@<hostname>`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Network name; branches only talk within one network.  Defaults to
    /// the hostname.
    #[serde(default)]
    pub network_name: Option<String>,
    /// Cleartext password; hashed before it ever crosses a socket.
    #[serde(default)]
    pub network_password: String,
    /// Hierarchical path of the branch; defaults to `/<name>`.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_adv_address")]
    pub advertising_address: String,
    #[serde(default = "default_adv_port")]
    pub advertising_port: u16,
    /// Interface addresses used for sending beacons and joining the
    /// multicast group.
    #[serde(default = "default_adv_interfaces")]
    pub advertising_interfaces: Vec<String>,
    /// Beacon interval in seconds; -1 disables advertising entirely.
    #[serde(default = "default_adv_interval")]
    pub advertising_interval: f64,
    /// Session timeout in seconds.  Peers heartbeat at half this value.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Participate in the mesh without appearing in peer broadcasts.
    #[serde(default)]
    pub ghost_mode: bool,
    #[serde(default = "default_queue_size")]
    pub tx_queue_size: usize,
    #[serde(default = "default_queue_size")]
    pub rx_queue_size: usize,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// TCP port to accept peer connections on; 0 lets the OS choose.
    #[serde(default)]
    pub listen_port: u16,
}

fn default_adv_address() -> String {
    DEFAULT_ADV_ADDRESS.to_owned()
}

fn default_adv_port() -> u16 {
    DEFAULT_ADV_PORT
}

fn default_adv_interfaces() -> Vec<String> {
    vec!["127.0.0.1".to_owned()]
}

fn default_adv_interval() -> f64 {
    1.0
}

fn default_timeout() -> f64 {
    3.0
}

fn default_queue_size() -> usize {
    MIN_QUEUE_SIZE
}

fn default_listen_address() -> String {
    "0.0.0.0".to_owned()
}

impl Default for BranchConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("empty config is valid")
    }
}

impl BranchConfig {
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_json_str(&text)
    }

    /// Check all value ranges.  Called by `Branch::create`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.name {
            if name.is_empty() {
                return Err(ConfigError::InvalidValue("name must not be empty".to_owned()));
            }
        }
        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidValue(format!(
                    "path must be absolute, got '{path}'"
                )));
            }
        }
        if self.timeout < 0.001 {
            return Err(ConfigError::InvalidValue(format!(
                "timeout must be at least 0.001 s, got {}",
                self.timeout
            )));
        }
        if self.advertising_interval != -1.0 && self.advertising_interval < 0.001 {
            return Err(ConfigError::InvalidValue(format!(
                "advertising_interval must be at least 0.001 s (or -1 to disable), got {}",
                self.advertising_interval
            )));
        }
        for (label, size) in
            [("tx_queue_size", self.tx_queue_size), ("rx_queue_size", self.rx_queue_size)]
        {
            if !(MIN_QUEUE_SIZE..=MAX_QUEUE_SIZE).contains(&size) {
                return Err(ConfigError::InvalidValue(format!(
                    "{label} must be within {MIN_QUEUE_SIZE}..={MAX_QUEUE_SIZE}, got {size}"
                )));
            }
        }
        self.advertising_address.parse::<std::net::IpAddr>().map_err(|_| {
            ConfigError::InvalidValue(format!(
                "advertising_address is not an IP address: '{}'",
                self.advertising_address
            ))
        })?;
        Ok(())
    }

    pub fn resolved_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}@{}", std::process::id(), hostname()))
    }

    pub fn resolved_network_name(&self) -> String {
        self.network_name.clone().unwrap_or_else(hostname)
    }

    pub fn resolved_path(&self) -> String {
        self.path.clone().unwrap_or_else(|| format!("/{}", self.resolved_name()))
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    pub fn advertising_interval_duration(&self) -> Option<Duration> {
        if self.advertising_interval == -1.0 {
            None
        } else {
            Some(Duration::from_secs_f64(self.advertising_interval))
        }
    }
}

/// Best-effort hostname; branches only use it for display and defaults.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_owned())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Read(String),
    #[error("could not parse config: {0}")]
    Parse(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}
