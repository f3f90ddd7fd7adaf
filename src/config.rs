use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub udp: UdpConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Address the packet-forwarder socket binds to
    pub bind: String,
    /// Accept uplink records even when the gateway flagged their CRC invalid
    pub skip_crc_check: bool,
    /// Cap on concurrently processed datagrams; reception blocks when hit
    pub max_inflight_datagrams: usize,
    /// How often the registry sweep runs, seconds
    pub cleanup_interval_secs: u64,
    /// How long a gateway may stay silent before eviction, seconds
    pub gateway_retention_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1700".to_string(),
            skip_crc_check: false,
            max_inflight_datagrams: 64,
            cleanup_interval_secs: 60,
            gateway_retention_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
