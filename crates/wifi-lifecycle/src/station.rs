//! Station control through wpa_supplicant

use crate::error::{Result, WifiError};
use crate::exec::CommandSpec;
use crate::types::{DaemonHandle, DaemonKind, VirtualInterface};
use crate::Testbed;
use inventory::Host;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationConfig {
    pub ssid: String,
    pub passphrase: Option<String>,
    /// Derived from the host name when unset, see [`derive_station_ip`]
    pub ip: Option<Ipv4Addr>,
}

impl StationConfig {
    pub fn new(ssid: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            passphrase: None,
            ip: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_ip(mut self, ip: Ipv4Addr) -> Self {
        self.ip = Some(ip);
        self
    }
}

/// Station address inside `subnet` picked from a stable hash of `hostname`
///
/// The host part covers the full 0-255 range, so collisions with the access
/// point or between stations are possible and left to the caller.
pub fn derive_station_ip(hostname: &str, subnet: Ipv4Addr) -> Ipv4Addr {
    let digest = Sha256::digest(hostname.as_bytes());
    let [a, b, c, _] = subnet.octets();
    Ipv4Addr::new(a, b, c, digest[0])
}

/// Whether `ip` can be given to a station next to an access point on `ap_ip`
///
/// Rejects the access point's own address plus the network and broadcast
/// addresses of the /24.
pub fn usable_station_ip(ip: Ipv4Addr, ap_ip: Ipv4Addr) -> bool {
    let host_part = ip.octets()[3];
    ip != ap_ip && host_part != 0 && host_part != 255
}

pub fn render_wpa_supplicant_conf(interface: &str, config: &StationConfig) -> String {
    let mut conf = String::new();
    conf.push_str(&format!("# {}\n", interface));
    conf.push_str("ctrl_interface=/var/run/wpa_supplicant\n");
    conf.push_str("network={\n");
    conf.push_str(&format!("    ssid=\"{}\"\n", config.ssid));
    match &config.passphrase {
        Some(passphrase) => conf.push_str(&format!("    psk=\"{}\"\n", passphrase)),
        None => conf.push_str("    key_mgmt=NONE\n"),
    }
    conf.push_str("}\n");
    conf
}

impl Testbed {
    /// Start wpa_supplicant on `interface` and give it an address
    ///
    /// Association is not checked here; use
    /// [`Testbed::wait_for_connectivity`] to confirm the link.
    pub async fn connect(
        &self,
        host: &Host,
        interface: &VirtualInterface,
        config: &StationConfig,
    ) -> Result<DaemonHandle> {
        let ip = self.station_ip(host, config)?;

        let kind = DaemonKind::WpaSupplicant;
        let paths = kind.paths(&self.settings().run_dir, &interface.radio_id, &interface.name);

        if self.kill_matching(host, &kind.pid_pattern(&paths.pid_file)).await {
            tokio::time::sleep(self.settings().settle()).await;
        }

        self.reset_interface(host, &interface.name).await;
        self.best_effort(host, CommandSpec::new("rfkill unblock wifi").sudo())
            .await;

        let conf = render_wpa_supplicant_conf(&interface.name, config);
        self.executor.upload(host, &paths.config_file, &conf).await?;

        self.best_effort(
            host,
            CommandSpec::new(format!(
                "wpa_supplicant -B -c {} -D nl80211 -i {} -P {} -f {}",
                paths.config_file, interface.name, paths.pid_file, paths.log_file
            ))
            .sudo(),
        )
        .await;

        self.assign_address(host, &interface.name, ip).await;

        info!(host = %host.name, "Station {} joining '{}' as {}", interface.name, config.ssid, ip);

        Ok(DaemonHandle {
            kind,
            host: host.name.clone(),
            interface: interface.name.clone(),
            radio_id: interface.radio_id.clone(),
            pid_file: paths.pid_file,
            log_file: paths.log_file,
            config_file: paths.config_file,
        })
    }

    /// Address `connect` gives `host`: the configured one or the derived one
    pub fn station_ip(&self, host: &Host, config: &StationConfig) -> Result<Ipv4Addr> {
        match config.ip {
            Some(ip) => Ok(ip),
            None => Ok(derive_station_ip(&host.name, self.station_subnet()?)),
        }
    }

    fn station_subnet(&self) -> Result<Ipv4Addr> {
        let subnet = &self.settings().station_subnet;
        subnet
            .parse()
            .map_err(|_| WifiError::InvalidArgument(format!("invalid station subnet '{}'", subnet)))
    }
}
