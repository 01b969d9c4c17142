//! SkyMesh Configuration System
//!
//! Loads configuration from a YAML file; every field has a default so an
//! empty file (or no file) yields a working repeater. The structure mirrors
//! the tunables of the stack:
//!
//! ```yaml
//! radio:
//!   freq: 915.0
//!   sf: 10
//! node:
//!   name: "repeater"
//!   admin_password: "h^(kl@#)"
//! limits:
//!   max_contacts: 32
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// LoRa modem parameters (`radio.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Carrier frequency in MHz.
    #[serde(default = "default_freq")]
    pub freq: f32,
    /// Bandwidth in kHz.
    #[serde(default = "default_bw")]
    pub bw: f32,
    /// Spreading factor.
    #[serde(default = "default_sf")]
    pub sf: u8,
    /// Coding rate denominator (4/x).
    #[serde(default = "default_cr")]
    pub cr: u8,
    /// Transmit power in dBm.
    #[serde(default = "default_tx_power")]
    pub tx_power: i8,
    /// Sync word (private-network default).
    #[serde(default = "default_sync_word")]
    pub sync_word: u8,
    /// Preamble length in symbols.
    #[serde(default = "default_preamble")]
    pub preamble_len: u16,
    /// TCXO reference voltage.
    #[serde(default = "default_tcxo")]
    pub tcxo_voltage: f32,
}

fn default_freq() -> f32 {
    915.0
}
fn default_bw() -> f32 {
    250.0
}
fn default_sf() -> u8 {
    10
}
fn default_cr() -> u8 {
    5
}
fn default_tx_power() -> i8 {
    20
}
fn default_sync_word() -> u8 {
    0x12
}
fn default_preamble() -> u16 {
    8
}
fn default_tcxo() -> f32 {
    1.6
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            freq: default_freq(),
            bw: default_bw(),
            sf: default_sf(),
            cr: default_cr(),
            tx_power: default_tx_power(),
            sync_word: default_sync_word(),
            preamble_len: default_preamble(),
            tcxo_voltage: default_tcxo(),
        }
    }
}

/// Node identity and advertisement settings (`node.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Advertised friendly name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Advertised latitude in degrees.
    #[serde(default)]
    pub lat: f64,
    /// Advertised longitude in degrees.
    #[serde(default)]
    pub lon: f64,
    /// Admin password for anonymous login requests.
    #[serde(default = "default_password")]
    pub admin_password: String,
    /// Transmit duty-cycle cap as a fraction of wall time.
    #[serde(default = "default_airtime_factor")]
    pub airtime_factor: f32,
    /// Directory for the identity store.
    #[serde(default = "default_identity_dir")]
    pub identity_dir: PathBuf,
}

fn default_name() -> String {
    "repeater".to_string()
}
fn default_password() -> String {
    "h^(kl@#)".to_string()
}
fn default_airtime_factor() -> f32 {
    1.0
}
fn default_identity_dir() -> PathBuf {
    PathBuf::from("identity")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            lat: 0.0,
            lon: 0.0,
            admin_password: default_password(),
            airtime_factor: default_airtime_factor(),
            identity_dir: default_identity_dir(),
        }
    }
}

/// Bounded table capacities (`limits.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Packet pool slots.
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    /// Recently-seen packet hashes retained for duplicate suppression.
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,
    /// Pending-ACK entries.
    #[serde(default = "default_ack_capacity")]
    pub ack_capacity: usize,
}

fn default_pool_capacity() -> usize {
    crate::packet::POOL_CAPACITY
}
fn default_seen_capacity() -> usize {
    64
}
fn default_ack_capacity() -> usize {
    16
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            pool_capacity: default_pool_capacity(),
            seen_capacity: default_seen_capacity(),
            ack_capacity: default_ack_capacity(),
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// LoRa modem parameters (`radio.*`).
    #[serde(default)]
    pub radio: RadioConfig,

    /// Node settings (`node.*`).
    #[serde(default)]
    pub node: NodeConfig,

    /// Table capacities (`limits.*`).
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Config {
    /// Create a configuration with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a single YAML file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }
}
