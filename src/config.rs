use std::{collections::HashMap, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::fs;

use crate::central::{CHARACTERISTIC_UUID, SERVICE_UUID};

pub const DEFAULT_PEER: &str = "AB:2B:00:02:C7:9D (public)";
pub const DEFAULT_ENDPOINT: &str =
    "https://cs4640.cs.virginia.edu/xtz3mx/pourpro-test/?command=increment-product-on-scan";

/// Read a json config file, every missing field falls back to its default.
pub async fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let file = fs::read(path)
        .await
        .with_context(|| format!("failed to read config file `{}`", path.display()))?;
    serde_json::from_slice(&file).context("failed to parse config")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SerialConfig {
    pub path: String,
    pub baud: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            path: "/dev/ttyUSB0".to_string(),
            baud: 115200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    pub serial: SerialConfig,
    /// Advertised address -> human readable label.
    pub peers: HashMap<String, String>,
    pub service_uuid: u16,
    pub characteristic_uuid: u16,
    pub uplink_queue: usize,
    pub write_timeout_ms: u64,
    pub rescan_interval_ms: u64,
}

impl Default for CentralConfig {
    fn default() -> Self {
        let mut peers = HashMap::new();
        peers.insert(DEFAULT_PEER.to_string(), "barcode scanner".to_string());
        CentralConfig {
            serial: SerialConfig::default(),
            peers,
            service_uuid: SERVICE_UUID,
            characteristic_uuid: CHARACTERISTIC_UUID,
            uplink_queue: 16,
            write_timeout_ms: 1000,
            rescan_interval_ms: 5000,
        }
    }
}

impl CentralConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub serial: SerialConfig,
    pub endpoint: String,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub cooldown_ms: u64,
    pub poll_timeout_ms: u64,
    pub frame_gap_ms: u64,
    /// Only count 2xx responses as delivered.
    pub strict_status: bool,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        UplinkConfig {
            serial: SerialConfig {
                path: "/dev/ttyS2".to_string(),
                ..SerialConfig::default()
            },
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout_ms: 10_000,
            max_attempts: 3,
            backoff_ms: 500,
            cooldown_ms: 1000,
            poll_timeout_ms: 100,
            frame_gap_ms: 20,
            strict_status: false,
        }
    }
}

impl UplinkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn frame_gap(&self) -> Duration {
        Duration::from_millis(self.frame_gap_ms)
    }
}
