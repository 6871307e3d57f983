//! Configuration file support for shake-stream.
//!
//! Loads settings from `~/.config/shake-stream/config.toml` on Linux
//! (or platform-appropriate location on other OSes).

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calibration::INVENTORY_HOST;
use crate::merge::{DEFAULT_MAX_GAP, GapFill, MergeOptions, OverlapPolicy};
use crate::session::{ChannelSelection, DEFAULT_NETWORK, DEFAULT_STATION, SessionParams};
use crate::source::{DEFAULT_PORT, DEFAULT_TIMEOUT};

/// Deserialize `"all"`, `"EHZ,ENE"` or `["EHZ", "ENE"]` into a selection.
fn deserialize_channels<'de, D>(deserializer: D) -> Result<ChannelSelection, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }

    match Raw::deserialize(deserializer)? {
        Raw::One(s) => s.parse().map_err(serde::de::Error::custom),
        Raw::Many(list) => ChannelSelection::from_list(list).map_err(serde::de::Error::custom),
    }
}

/// Deserialize a gap fill given as a keyword or an integer.
fn deserialize_fill<'de, D>(deserializer: D) -> Result<GapFill, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Count(i32),
        Keyword(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Count(v) => Ok(GapFill::Value(v)),
        Raw::Keyword(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// UDP port the Shake forwards data to.
    pub port: u16,

    /// Network code.
    pub network: String,

    /// Station code; the placeholder disables inventory lookup.
    pub station: String,

    /// Packet receive and inventory fetch timeout in seconds.
    pub timeout: u64,

    /// Channels to keep.
    #[serde(deserialize_with = "deserialize_channels")]
    pub channels: ChannelSelection,

    /// How merges resolve overlapping samples.
    pub overlap: OverlapPolicy,

    /// How merges fill gaps.
    #[serde(deserialize_with = "deserialize_fill")]
    pub fill: GapFill,

    /// Seconds of data to keep per channel (0 = unlimited).
    pub retention: u64,

    /// Widest gap, in seconds, a merge bridges and a packet's start time may
    /// jump from the feed.
    pub max_gap: u64,

    /// FDSN web service to fetch inventories from.
    pub inventory_host: String,

    /// Print a report every N seconds.
    pub stats_interval: u64,

    /// Enable Prometheus metrics HTTP endpoint.
    pub metrics_enabled: bool,

    /// Port for Prometheus metrics HTTP endpoint.
    pub metrics_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            network: DEFAULT_NETWORK.to_string(),
            station: DEFAULT_STATION.to_string(),
            timeout: DEFAULT_TIMEOUT.as_secs(),
            channels: ChannelSelection::All,
            overlap: OverlapPolicy::default(),
            fill: GapFill::default(),
            retention: 0,
            max_gap: DEFAULT_MAX_GAP.as_secs(),
            inventory_host: INVENTORY_HOST.to_string(),
            stats_interval: 30,
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from the default config file location.
    ///
    /// Returns default config if the file doesn't exist.
    /// Returns an error if the file exists but is malformed.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Config::default()),
        }
    }

    /// Load configuration from an explicit path, which must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid TOML in config file: {}", path.display()))
    }

    /// Returns the path to the config file.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("shake-stream/config.toml"))
    }

    /// Session parameters described by this config.
    pub fn session_params(&self) -> SessionParams {
        SessionParams {
            network: self.network.clone(),
            station: self.station.clone(),
            channels: self.channels.clone(),
        }
    }

    /// Merge options described by this config.
    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            overlap: self.overlap,
            fill: self.fill,
            max_gap: Duration::from_secs(self.max_gap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8888);
        assert_eq!(config.station, "Z0000");
        assert_eq!(config.network, "AM");
        assert_eq!(config.timeout, 10);
        assert_eq!(config.channels, ChannelSelection::All);
        assert_eq!(config.merge_options(), MergeOptions::default());
        assert!(!config.metrics_enabled);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
            station = "R0000"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.station, "R0000");
        // Other fields should use defaults
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.inventory_host, INVENTORY_HOST);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            port = 18001
            network = "AM"
            station = "R3BCF"
            timeout = 30
            channels = ["ehz", "ENE"]
            overlap = "later"
            fill = "interpolate"
            retention = 600
            max_gap = 3600
            inventory_host = "http://localhost:8080"
            stats_interval = 60
            metrics_enabled = true
            metrics_port = 9091
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.port, 18001);
        assert_eq!(config.station, "R3BCF");
        assert_eq!(config.timeout, 30);
        assert_eq!(
            config.channels,
            ChannelSelection::Only(vec!["EHZ".into(), "ENE".into()])
        );
        assert_eq!(config.overlap, OverlapPolicy::PreferLater);
        assert_eq!(config.fill, GapFill::Interpolate);
        assert_eq!(config.retention, 600);
        assert_eq!(config.merge_options().max_gap, Duration::from_secs(3600));
        assert_eq!(config.inventory_host, "http://localhost:8080");
        assert!(config.metrics_enabled);
        assert_eq!(config.metrics_port, 9091);
    }

    #[test]
    fn test_channels_as_string() {
        let config: Config = toml::from_str(r#"channels = "all""#).unwrap();
        assert_eq!(config.channels, ChannelSelection::All);

        let config: Config = toml::from_str(r#"channels = "EHZ,HDF""#).unwrap();
        assert_eq!(
            config.channels,
            ChannelSelection::Only(vec!["EHZ".into(), "HDF".into()])
        );
    }

    #[test]
    fn test_fill_as_integer() {
        let config: Config = toml::from_str("fill = 0").unwrap();
        assert_eq!(config.fill, GapFill::Value(0));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(toml::from_str::<Config>(r#"fill = "sometimes""#).is_err());
        assert!(toml::from_str::<Config>(r#"overlap = "first""#).is_err());
        assert!(toml::from_str::<Config>("channels = []").is_err());
    }

    #[test]
    fn test_session_params() {
        let config: Config = toml::from_str(r#"station = "R0000""#).unwrap();
        let params = config.session_params();
        assert_eq!(params.station, "R0000");
        assert_eq!(params.network, "AM");
    }
}
