use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::link::Address;
use crate::uhid::ForwardMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Remote addresses to maintain sessions for, one session per address.
    pub devices: Vec<String>,

    /// Overrides the default per-user state directory.
    pub state_dir: Option<PathBuf>,

    pub buttons: ButtonsConfig,
    pub uhid: UhidConfig,
    pub connection: ConnectionConfig,
    pub activity: ActivityConfig,
}

impl Config {
    pub fn device_addresses(&self) -> Result<Vec<Address>, ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevicesConfigured);
        }

        self.devices
            .iter()
            .map(|text| {
                Address::parse(text).map_err(|reason| ConfigError::BadAddress {
                    address: text.clone(),
                    reason,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ButtonsConfig {
    pub debounce_ms: u64,

    pub log_button_presses: bool,

    /// Canonical button code (hex string, "0x01"…) to the program run when
    /// that button fires. Codes without an entry are a no-op.
    pub actions: BTreeMap<String, String>,

    /// Program run when an active link ends.
    pub link_ended_action: Option<String>,
}

impl ButtonsConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for ButtonsConfig {
    fn default() -> Self {
        ButtonsConfig {
            debounce_ms: 200,
            log_button_presses: true,
            actions: BTreeMap::new(),
            link_ended_action: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UhidConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub vendor_id: u32,
    pub product_id: u32,
    pub version: u32,
    pub forward_mode: ForwardMode,
}

impl Default for UhidConfig {
    fn default() -> Self {
        UhidConfig {
            enabled: true,
            path: PathBuf::from("/dev/uhid"),
            vendor_id: 0x1234,
            product_id: 0x5678,
            version: 0x0001,
            forward_mode: ForwardMode::Passthrough,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    /// Deadline for raw link establishment. Running it out means the remote
    /// is absent, not that something failed.
    pub connect_timeout_secs: u64,

    /// Deadline for the whole establishment phase (connect through
    /// subscribe). Never applied while a session is active.
    pub establish_timeout_secs: u64,

    /// Base delay between cycles while the host shows recent user input.
    pub reconnect_delay_secs: u64,

    /// Delay between cycles once the host has been idle past the activity
    /// threshold.
    pub idle_reconnect_delay_secs: u64,

    /// Consecutive establishment timeouts before the extra recovery delay
    /// kicks in (the radio may be asleep and need time).
    pub timeout_escalation_threshold: u32,

    /// Grace period for a radio's own shutdown before it is dropped anyway.
    pub cleanup_timeout_secs: u64,

    /// Grace period for sessions to tear down on daemon shutdown.
    pub shutdown_grace_secs: u64,
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn establish_timeout(&self) -> Duration {
        Duration::from_secs(self.establish_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn idle_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.idle_reconnect_delay_secs)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            connect_timeout_secs: 30,
            establish_timeout_secs: 90,
            reconnect_delay_secs: 5,
            idle_reconnect_delay_secs: 30,
            timeout_escalation_threshold: 3,
            cleanup_timeout_secs: 5,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivityConfig {
    /// The host counts as idle once no configured input node has been touched
    /// for this long.
    pub idle_threshold_secs: u64,

    pub input_nodes: Vec<PathBuf>,
}

impl ActivityConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        ActivityConfig {
            idle_threshold_secs: 120,
            input_nodes: vec![PathBuf::from("/dev/input")],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let parsed: Config = serde_json::from_str(r#"{"devices": ["AA:BB:CC:DD:EE:FF"]}"#).unwrap();
        assert_eq!(parsed.connection.connect_timeout_secs, 30);
        assert_eq!(parsed.buttons.debounce_ms, 200);
        assert_eq!(parsed.uhid.forward_mode, ForwardMode::Passthrough);
        assert_eq!(parsed.device_addresses().unwrap().len(), 1);
    }

    #[test]
    fn no_devices_is_a_config_error() {
        let config = Config::default();
        assert!(matches!(config.device_addresses(), Err(ConfigError::NoDevicesConfigured)));
    }

    #[test]
    fn bad_address_is_a_config_error() {
        let parsed: Config = serde_json::from_str(r#"{"devices": ["not-an-address"]}"#).unwrap();
        assert!(matches!(parsed.device_addresses(), Err(ConfigError::BadAddress { .. })));
    }
}
