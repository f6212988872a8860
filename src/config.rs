// src/config.rs

//! Manages daemon configuration: loading, validation, and defaults.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Controls which challenge-response hashes the OTA receiver will offer.
///
/// A client that advertises SHA-256 support is always authenticated with
/// SHA-256; the policy only decides what happens for clients that do not.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthCompat {
    /// Offer MD5 challenge-response to clients without SHA-256 support.
    /// This is a deprecated compatibility mode kept so old flashing tools
    /// keep working; it is logged as such whenever it is used.
    #[default]
    AllowMd5Fallback,
    /// Refuse clients that do not advertise SHA-256 support.
    Sha256Strict,
}

/// Configuration for the OTA firmware receiver.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OtaConfig {
    #[serde(default = "default_ota_port")]
    pub port: u16,
    /// Optional password for the OTA challenge-response authentication.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub auth_compat: AuthCompat,
    /// OTA wire protocol version. Version 2 adds per-block acknowledgments.
    #[serde(default = "default_ota_version")]
    pub version: u8,
    /// Directory where received firmware images are staged.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            port: default_ota_port(),
            password: None,
            auth_compat: AuthCompat::default(),
            version: default_ota_version(),
            staging_dir: default_staging_dir(),
        }
    }
}

fn default_ota_port() -> u16 {
    3232
}
fn default_ota_version() -> u8 {
    2
}
fn default_staging_dir() -> String {
    "emberlink_data/ota".to_string()
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_name")]
    name: String,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_api_port")]
    api_port: u16,
    /// Optional password clients must present in their connect request.
    password: Option<String>,
    /// Optional pre-shared encryption key (32 bytes, hex-encoded).
    noise_psk: Option<String>,
    #[serde(default = "default_log_level")]
    log_level: String,
    /// Reboot the device if no API client connects within this window.
    /// Zero disables the reboot timer.
    #[serde(with = "humantime_serde", default = "default_reboot_timeout")]
    reboot_timeout: Duration,
    /// How long outbound messages may sit in a connection's batch buffer
    /// before being flushed to the socket.
    #[serde(with = "humantime_serde", default = "default_batch_delay")]
    batch_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_keepalive_interval")]
    keepalive_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_keepalive_timeout")]
    keepalive_timeout: Duration,
    #[serde(default = "default_data_dir")]
    data_dir: String,
    #[serde(default)]
    ota: OtaConfig,
}

fn default_name() -> String {
    "emberlink".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    6053
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_reboot_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_batch_delay() -> Duration {
    Duration::from_millis(100)
}
fn default_keepalive_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_keepalive_timeout() -> Duration {
    Duration::from_secs(90)
}
fn default_data_dir() -> String {
    "emberlink_data".to_string()
}

/// The validated daemon configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub name: String,
    pub host: String,
    pub api_port: u16,
    pub password: Option<String>,
    /// Pre-shared encryption key, decoded from hex. Frame encryption itself
    /// is owned by an external transport layer; the daemon only stores and
    /// persists the key.
    pub noise_psk: Option<Vec<u8>>,
    pub log_level: String,
    pub reboot_timeout: Duration,
    pub batch_delay: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub data_dir: String,
    pub ota: OtaConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            host: default_host(),
            api_port: default_api_port(),
            password: None,
            noise_psk: None,
            log_level: default_log_level(),
            reboot_timeout: default_reboot_timeout(),
            batch_delay: default_batch_delay(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_timeout: default_keepalive_timeout(),
            data_dir: default_data_dir(),
            ota: OtaConfig::default(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let noise_psk = match &raw.noise_psk {
            Some(hex_key) => {
                let key = hex::decode(hex_key)
                    .map_err(|e| anyhow!("noise_psk is not valid hex: {e}"))?;
                if key.len() != 32 {
                    return Err(anyhow!(
                        "noise_psk must be 32 bytes, got {} bytes",
                        key.len()
                    ));
                }
                Some(key)
            }
            None => None,
        };

        let config = Config {
            name: raw.name,
            host: raw.host,
            api_port: raw.api_port,
            password: raw.password,
            noise_psk,
            log_level: raw.log_level,
            reboot_timeout: raw.reboot_timeout,
            batch_delay: raw.batch_delay,
            keepalive_interval: raw.keepalive_interval,
            keepalive_timeout: raw.keepalive_timeout,
            data_dir: raw.data_dir,
            ota: raw.ota,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            return Err(anyhow!("api_port must not be 0"));
        }
        if self.ota.port == 0 {
            return Err(anyhow!("ota.port must not be 0"));
        }
        if self.api_port == self.ota.port {
            return Err(anyhow!(
                "api_port and ota.port must differ (both set to {})",
                self.api_port
            ));
        }
        if !matches!(self.ota.version, 1 | 2) {
            return Err(anyhow!(
                "ota.version must be 1 or 2, got {}",
                self.ota.version
            ));
        }
        if self.batch_delay > Duration::from_secs(5) {
            return Err(anyhow!("batch_delay larger than 5s defeats keepalive"));
        }
        if let Some(password) = &self.password {
            if password.is_empty() {
                return Err(anyhow!("password must not be empty when set"));
            }
        }
        if let Some(password) = &self.ota.password {
            if password.is_empty() {
                return Err(anyhow!("ota.password must not be empty when set"));
            }
        }
        Ok(())
    }
}
