//! Host registry and testbed settings for the Wi-Fi testbed
//!
//! This crate provides the data model shared by the lifecycle library and the
//! CLI: which nodes exist, how to reach them, whether commands on them need
//! elevation, and the timing constants used while provisioning radios.
//! Inventories are plain JSON files so they can be checked in next to the
//! experiment that uses them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Cannot read inventory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid inventory JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid inventory: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, InventoryError>;

fn default_true() -> bool {
    true
}

/// One testbed node reachable through the remote executor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Name used on the command line and in result files
    pub name: String,
    /// Network address; the name is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Login user; the executor's default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Privileged commands are wrapped in `sudo` on this host
    #[serde(default = "default_true")]
    pub requires_elevation: bool,
}

impl Host {
    /// Ad-hoc host that needs elevation for privileged commands
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
            user: None,
            port: None,
            requires_elevation: true,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_elevation(mut self, requires_elevation: bool) -> Self {
        self.requires_elevation = requires_elevation;
        self
    }

    /// Address the executor connects to
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }

    /// `user@address` destination for ssh
    pub fn ssh_destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.address()),
            None => self.address().to_string(),
        }
    }
}

/// Timing and path constants used while provisioning radios
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestbedSettings {
    /// Upper bound for a single remote command
    pub command_timeout_secs: u64,
    /// Pause after killing a stale daemon before starting a new one
    pub settle_secs: u64,
    /// Remote directory holding daemon configs, pid files and logs
    pub run_dir: String,
    /// Interval between connectivity checks
    pub poll_interval_secs: u64,
    /// Budget for a station to reach its access point
    pub connect_timeout_secs: u64,
    /// Budget for a host to come back after a reboot
    pub reboot_timeout_secs: u64,
    /// /24 network stations get their derived address from
    pub station_subnet: String,
    /// Wireless driver stack, loaded in this order and unloaded in reverse
    pub driver_modules: Vec<String>,
    /// Extra `-o` options passed to ssh
    pub ssh_options: Vec<String>,
}

impl Default for TestbedSettings {
    fn default() -> Self {
        Self {
            command_timeout_secs: 60,
            settle_secs: 2,
            run_dir: "/tmp".to_string(),
            poll_interval_secs: 1,
            connect_timeout_secs: 30,
            reboot_timeout_secs: 300,
            station_subnet: "10.1.1.0".to_string(),
            driver_modules: [
                "cfg80211",
                "mac80211",
                "ath",
                "ath9k_hw",
                "ath9k_common",
                "ath9k",
            ]
            .iter()
            .map(|m| m.to_string())
            .collect(),
            ssh_options: vec![
                "BatchMode=yes".to_string(),
                "ConnectTimeout=10".to_string(),
            ],
        }
    }
}

impl TestbedSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_secs(self.reboot_timeout_secs)
    }
}

/// Registered hosts plus the settings that apply to all of them
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub settings: TestbedSettings,
}

impl Inventory {
    /// Load and validate an inventory file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let inventory: Inventory = serde_json::from_str(content)?;
        inventory.validate()?;
        Ok(inventory)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<()> {
        for (i, host) in self.hosts.iter().enumerate() {
            if host.name.trim().is_empty() {
                return Err(InventoryError::Invalid(format!(
                    "host #{} has an empty name",
                    i
                )));
            }
            if self.hosts[..i].iter().any(|h| h.name == host.name) {
                return Err(InventoryError::Invalid(format!(
                    "host '{}' is listed twice",
                    host.name
                )));
            }
        }
        if self.settings.command_timeout_secs == 0 {
            return Err(InventoryError::Invalid(
                "command_timeout_secs cannot be zero".to_string(),
            ));
        }
        if self.settings.poll_interval_secs == 0 {
            return Err(InventoryError::Invalid(
                "poll_interval_secs cannot be zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Registered host, or an ad-hoc one carrying the default capabilities
    pub fn resolve_host(&self, name: &str) -> Host {
        self.host(name).cloned().unwrap_or_else(|| Host::new(name))
    }

    /// Resolve a comma separated host list, skipping empty entries
    pub fn resolve_hosts(&self, names: &str) -> Vec<Host> {
        names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(|n| self.resolve_host(n))
            .collect()
    }
}

/// A channel configuration an access point can be brought up with
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioPreset {
    pub name: String,
    pub channel: u8,
    pub description: String,
}

/// Defaults used when an access point is started without explicit settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApDefaults {
    pub ssid: String,
    pub channel: u8,
    pub ip: String,
}

impl Default for ApDefaults {
    fn default() -> Self {
        Self {
            ssid: "experiment".to_string(),
            channel: 1,
            ip: "10.1.1.1".to_string(),
        }
    }
}

/// Built-in presets
pub struct Presets;

impl Presets {
    pub fn radio_presets() -> Vec<RadioPreset> {
        vec![
            RadioPreset {
                name: "2.4ghz".to_string(),
                channel: 1,
                description: "802.11g on channel 1".to_string(),
            },
            RadioPreset {
                name: "5ghz".to_string(),
                channel: 48,
                description: "802.11a on channel 48".to_string(),
            },
        ]
    }

    pub fn radio_preset(name: &str) -> Option<RadioPreset> {
        Self::radio_presets().into_iter().find(|p| p.name == name)
    }

    pub fn ap_defaults() -> ApDefaults {
        ApDefaults::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_destination() {
        let host = Host::new("nuc4");
        assert_eq!(host.ssh_destination(), "nuc4");
        assert!(host.requires_elevation);

        let host = Host::new("nuc4").with_address("10.0.0.4").with_user("exp");
        assert_eq!(host.ssh_destination(), "exp@10.0.0.4");
    }

    #[test]
    fn test_inventory_defaults_from_minimal_json() {
        let inventory = Inventory::from_json(r#"{"hosts": [{"name": "nuc4"}]}"#).unwrap();
        assert_eq!(inventory.hosts.len(), 1);
        assert!(inventory.hosts[0].requires_elevation);
        assert_eq!(inventory.settings, TestbedSettings::default());
        assert_eq!(inventory.settings.driver_modules.last().unwrap(), "ath9k");
    }

    #[test]
    fn test_inventory_partial_settings() {
        let inventory = Inventory::from_json(
            r#"{
                "hosts": [{"name": "ap", "requires_elevation": false}],
                "settings": {"settle_secs": 5}
            }"#,
        )
        .unwrap();
        assert!(!inventory.hosts[0].requires_elevation);
        assert_eq!(inventory.settings.settle(), Duration::from_secs(5));
        assert_eq!(inventory.settings.command_timeout_secs, 60);
        assert_eq!(inventory.settings.reboot_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_inventory_rejects_duplicates() {
        let result = Inventory::from_json(r#"{"hosts": [{"name": "a"}, {"name": "a"}]}"#);
        assert!(matches!(result, Err(InventoryError::Invalid(_))));
    }

    #[test]
    fn test_inventory_rejects_zero_timeout() {
        let result = Inventory::from_json(r#"{"settings": {"command_timeout_secs": 0}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_hosts_falls_back_to_ad_hoc() {
        let inventory = Inventory {
            hosts: vec![Host::new("nuc4").with_elevation(false)],
            settings: TestbedSettings::default(),
        };
        let hosts = inventory.resolve_hosts("nuc4, nuc10,,");
        assert_eq!(hosts.len(), 2);
        assert!(!hosts[0].requires_elevation);
        assert!(hosts[1].requires_elevation);
        assert_eq!(hosts[1].name, "nuc10");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testbed.json");
        let inventory = Inventory {
            hosts: vec![Host::new("nuc12").with_port(2222)],
            settings: TestbedSettings::default(),
        };
        std::fs::write(&path, inventory.to_json().unwrap()).unwrap();

        let loaded = Inventory::load(&path).unwrap();
        assert_eq!(loaded.hosts, inventory.hosts);

        let missing = Inventory::load(&dir.path().join("missing.json"));
        assert!(matches!(missing, Err(InventoryError::Io { .. })));
    }

    #[test]
    fn test_presets() {
        let presets = Presets::radio_presets();
        assert_eq!(presets.len(), 2);
        assert_eq!(Presets::radio_preset("5ghz").unwrap().channel, 48);
        assert!(Presets::radio_preset("60ghz").is_none());
        assert_eq!(Presets::ap_defaults().ip, "10.1.1.1");
    }
}
