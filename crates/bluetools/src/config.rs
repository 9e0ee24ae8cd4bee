//! Configuration for the HCI controller and the L2CAP client/server.
//!
//! Values are read from a TOML file. Every field has a default, so an empty
//! file (or no file at all) yields [`Config::default`].

use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::gap::KnownDevicePolicy;
use crate::hci::constants::GIAC_LAP;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "BLUETOOLS_CONFIG";

/// Top level configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// `env_logger` filter used by the CLI when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    #[serde(default)]
    pub hci: HciConfig,

    #[serde(default)]
    pub l2cap: L2capConfig,
}

/// HCI controller settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HciConfig {
    /// Timeout for a single command/response exchange
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Poll timeout between two LE advertising reports
    #[serde(default = "default_le_poll_timeout_ms")]
    pub le_poll_timeout_ms: u64,

    /// Inquiry access code used by classic inquiries
    #[serde(default = "default_inquiry_lap")]
    pub inquiry_lap: u32,

    #[serde(default)]
    pub known_device_policy: KnownDevicePolicy,
}

/// L2CAP client/server defaults
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct L2capConfig {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Poll timeout in milliseconds; absent means wait forever
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: Option<u64>,

    /// Requests served per connection; absent means unlimited
    #[serde(default)]
    pub max_requests: Option<usize>,

    #[serde(default = "default_psm")]
    pub psm: u16,
}

fn default_log_filter() -> String {
    "info".to_string()
}

const fn default_command_timeout_ms() -> u64 {
    3000
}

const fn default_le_poll_timeout_ms() -> u64 {
    5000
}

const fn default_inquiry_lap() -> u32 {
    GIAC_LAP
}

const fn default_buffer_capacity() -> usize {
    1024
}

const fn default_max_clients() -> usize {
    1
}

const fn default_poll_timeout_ms() -> Option<u64> {
    Some(10_000)
}

const fn default_psm() -> u16 {
    0x1001
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            hci: HciConfig::default(),
            l2cap: L2capConfig::default(),
        }
    }
}

impl Default for HciConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            le_poll_timeout_ms: default_le_poll_timeout_ms(),
            inquiry_lap: default_inquiry_lap(),
            known_device_policy: KnownDevicePolicy::default(),
        }
    }
}

impl Default for L2capConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            max_clients: default_max_clients(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_requests: None,
            psm: default_psm(),
        }
    }
}

impl HciConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// LE commands get twice the regular command timeout
    pub fn le_command_timeout(&self) -> Duration {
        self.command_timeout() * 2
    }

    pub fn le_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.le_poll_timeout_ms)
    }
}

impl L2capConfig {
    pub fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout_ms.map(Duration::from_millis)
    }
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Loads configuration from `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Loads the file named by `BLUETOOLS_CONFIG`, or the defaults when unset
    pub fn from_env() -> Result<Self> {
        match Self::env_path() {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    fn env_path() -> Option<PathBuf> {
        env::var_os(CONFIG_ENV).map(PathBuf::from)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Writes the configuration to `path`, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}
