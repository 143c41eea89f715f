//! Access point control through hostapd

use crate::error::{Result, WifiError};
use crate::exec::{CommandSpec, ExecError};
use crate::types::{DaemonHandle, DaemonKind, MacAddr, VirtualInterface};
use crate::Testbed;
use inventory::Host;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tracing::info;

/// Address given to an access point when none is configured
pub const DEFAULT_AP_IP: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 1);

/// Highest channel number in the 2.4 GHz band
const MAX_2GHZ_CHANNEL: u8 = 14;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwMode {
    /// 2.4 GHz
    G,
    /// 5 GHz
    A,
}

impl HwMode {
    pub fn for_channel(channel: u8) -> Self {
        if channel <= MAX_2GHZ_CHANNEL {
            HwMode::G
        } else {
            HwMode::A
        }
    }
}

impl fmt::Display for HwMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HwMode::G => f.write_str("g"),
            HwMode::A => f.write_str("a"),
        }
    }
}

impl FromStr for HwMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "g" => Ok(HwMode::G),
            "a" => Ok(HwMode::A),
            other => Err(format!("unsupported hw mode '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub channel: u8,
    /// Derived from the channel when unset
    pub hw_mode: Option<HwMode>,
    /// Open network when unset
    pub passphrase: Option<String>,
    /// Derived from the interface MAC when unset
    pub bssid: Option<MacAddr>,
    pub ip: Ipv4Addr,
}

impl AccessPointConfig {
    pub fn new(ssid: impl Into<String>, channel: u8) -> Self {
        Self {
            ssid: ssid.into(),
            channel,
            hw_mode: None,
            passphrase: None,
            bssid: None,
            ip: DEFAULT_AP_IP,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_bssid(mut self, bssid: MacAddr) -> Self {
        self.bssid = Some(bssid);
        self
    }

    pub fn with_hw_mode(mut self, hw_mode: HwMode) -> Self {
        self.hw_mode = Some(hw_mode);
        self
    }

    pub fn with_ip(mut self, ip: Ipv4Addr) -> Self {
        self.ip = ip;
        self
    }

    pub fn hw_mode(&self) -> HwMode {
        self.hw_mode
            .unwrap_or_else(|| HwMode::for_channel(self.channel))
    }
}

/// BSSID advertised by an access point on an interface with address `mac`
pub fn derive_bssid(mac: MacAddr) -> MacAddr {
    mac.locally_administered()
}

pub fn render_hostapd_conf(interface: &str, config: &AccessPointConfig, bssid: MacAddr) -> String {
    let mut conf = String::new();
    conf.push_str(&format!("interface={}\n", interface));
    conf.push_str("driver=nl80211\n");
    conf.push_str(&format!("ssid={}\n", config.ssid));
    conf.push_str(&format!("hw_mode={}\n", config.hw_mode()));
    conf.push_str(&format!("channel={}\n", config.channel));
    conf.push_str(&format!("bssid={}\n", bssid));

    if let Some(passphrase) = &config.passphrase {
        conf.push_str("wpa=2\n");
        conf.push_str(&format!("wpa_passphrase={}\n", passphrase));
        conf.push_str("wpa_key_mgmt=WPA-PSK\nrsn_pairwise=CCMP\n");
    }

    conf.push_str("auth_algs=1\nmacaddr_acl=0\n");
    conf
}

impl Testbed {
    /// Start hostapd on `interface`
    ///
    /// Kills a previous hostapd writing the same pid file, uploads a fresh
    /// config and resets the interface before launching. A failed launch is
    /// returned as [`WifiError::DaemonStart`]; every other step only warns.
    pub async fn start_access_point(
        &self,
        host: &Host,
        interface: &VirtualInterface,
        config: &AccessPointConfig,
    ) -> Result<DaemonHandle> {
        let kind = DaemonKind::Hostapd;
        let paths = kind.paths(&self.settings().run_dir, &interface.radio_id, &interface.name);

        let bssid = match config.bssid {
            Some(bssid) => bssid,
            None => derive_bssid(self.interface_mac(host, interface).await?),
        };

        if self.kill_matching(host, &kind.pid_pattern(&paths.pid_file)).await {
            tokio::time::sleep(self.settings().settle()).await;
        }

        let conf = render_hostapd_conf(&interface.name, config, bssid);
        self.executor.upload(host, &paths.config_file, &conf).await?;

        self.reset_interface(host, &interface.name).await;

        let launch = format!(
            "hostapd -tB -P {} -f {} {}",
            paths.pid_file, paths.log_file, paths.config_file
        );
        match self.exec(host, CommandSpec::new(launch).sudo()).await {
            Ok(_) => {}
            Err(WifiError::Exec(ExecError::NonZero { status, stderr, .. })) => {
                return Err(WifiError::DaemonStart {
                    interface: interface.name.clone(),
                    status,
                    stderr,
                });
            }
            Err(e) => return Err(e),
        }

        self.assign_address(host, &interface.name, config.ip).await;
        self.best_effort(host, CommandSpec::new("sysctl -w net.ipv4.ip_forward=1").sudo().show())
            .await;

        info!(
            host = %host.name,
            "Access point '{}' on {} (channel {}, bssid {})",
            config.ssid, interface.name, config.channel, bssid
        );

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

    async fn interface_mac(&self, host: &Host, interface: &VirtualInterface) -> Result<MacAddr> {
        if let Some(mac) = interface.mac {
            return Ok(mac);
        }
        self.link_state(host, &interface.name)
            .await?
            .mac
            .ok_or_else(|| WifiError::Parse(format!("no hardware address for {}", interface.name)))
    }
}
