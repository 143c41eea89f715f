//! Radio and interface discovery
//!
//! Radios are listed from the `/sys/class/ieee80211` symlinks, which carry
//! both the canonical `phyN` name and the bus location of the device, so a
//! radio can be addressed by either. Interfaces come from `iw dev`.

use crate::error::{Result, WifiError};
use crate::exec::CommandSpec;
use crate::types::{InterfaceMode, MacAddr, RadioDevice, Role, VirtualInterface};
use crate::Testbed;
use futures::stream::{self, Stream, TryStreamExt};
use inventory::Host;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

pub const RADIO_LISTING_COMMAND: &str = "ls -alh /sys/class/ieee80211/";

/// Exit status of `iw` when the named device does not exist (-ENODEV)
pub const NO_SUCH_DEVICE_STATUS: i32 = 237;

static WIPHY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"wiphy (\d+)").unwrap());
static TYPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*type (.+?)\s*$").unwrap());
static ADDR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"addr ([0-9a-fA-F:]{17})").unwrap());

/// Details of one interface from `iw dev <if> info`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub radio_id: String,
    pub mode: InterfaceMode,
    pub mac: Option<MacAddr>,
}

impl InterfaceInfo {
    pub fn into_virtual(self, role: Role) -> VirtualInterface {
        VirtualInterface {
            name: self.name,
            radio_id: self.radio_id,
            mode: self.mode,
            role,
            mac: self.mac,
        }
    }
}

// Only symlink entries name radios; `total`, `.` and `..` do not.
fn radio_lines(listing: &str) -> impl Iterator<Item = &str> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| line.contains("ieee80211/"))
}

fn last_segment(line: &str) -> String {
    line.rsplit('/').next().unwrap_or(line).trim().to_string()
}

/// Parse the radio listing into devices, in listing order
pub fn parse_radio_listing(listing: &str) -> Vec<RadioDevice> {
    radio_lines(listing)
        .map(|line| {
            let segments: Vec<&str> = line.split('/').collect();
            let bus_address = segments
                .iter()
                .position(|s| *s == "ieee80211")
                .filter(|&i| i > 0)
                .map(|i| segments[i - 1].to_string());
            RadioDevice {
                radio_id: last_segment(line),
                bus_address,
            }
        })
        .collect()
}

/// Radio id of the first listing line containing `hint`
///
/// Substring matching means an ambiguous hint (`phy1` vs `phy10`) silently
/// resolves to whichever radio is listed first.
pub fn resolve_in_listing(listing: &str, hint: &str) -> Option<String> {
    radio_lines(listing)
        .find(|line| line.contains(hint))
        .map(last_segment)
}

/// Names of all interfaces in `iw dev` output
pub fn parse_interface_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("Interface"))
        .filter_map(|line| line.split_whitespace().last())
        .map(str::to_string)
        .collect()
}

/// Parse `iw dev <name> info`
pub fn parse_interface_info(name: &str, output: &str) -> Result<InterfaceInfo> {
    let index = WIPHY_RE
        .captures(output)
        .and_then(|c| c.get(1))
        .ok_or_else(|| WifiError::Parse(format!("no wiphy in info for {}", name)))?;

    let mode = output
        .lines()
        .find_map(|line| TYPE_RE.captures(line))
        .and_then(|c| c.get(1))
        .map(|m| InterfaceMode::from_iw(m.as_str()))
        .unwrap_or(InterfaceMode::Unknown);

    let mac = ADDR_RE
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());

    Ok(InterfaceInfo {
        name: name.to_string(),
        radio_id: format!("phy{}", index.as_str()),
        mode,
        mac,
    })
}

impl Testbed {
    async fn radio_listing(&self, host: &Host) -> Result<String> {
        let output = self
            .exec(host, CommandSpec::new(RADIO_LISTING_COMMAND))
            .await?;
        Ok(output.stdout)
    }

    /// All radios present on the host
    pub async fn list_radios(&self, host: &Host) -> Result<Vec<RadioDevice>> {
        let listing = self.radio_listing(host).await?;
        Ok(parse_radio_listing(&listing))
    }

    /// Canonical radio id for a radio name or bus address
    pub async fn resolve_radio(&self, host: &Host, hint: &str) -> Result<String> {
        let listing = self.radio_listing(host).await?;
        let radio = resolve_in_listing(&listing, hint)
            .ok_or_else(|| WifiError::DeviceNotFound(hint.to_string()))?;
        debug!(host = %host.name, "Resolved radio hint '{}' to {}", hint, radio);
        Ok(radio)
    }

    /// Query `iw dev <name> info`
    pub async fn interface_info(&self, host: &Host, name: &str) -> Result<InterfaceInfo> {
        let command = CommandSpec::new(format!("iw dev {} info", name));
        match self.exec(host, command).await {
            Ok(output) => parse_interface_info(name, &output.stdout),
            Err(WifiError::Exec(e)) if e.status() == Some(NO_SUCH_DEVICE_STATUS) => {
                Err(WifiError::NoSuchInterface(name.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Names of the interfaces currently present
    pub async fn interface_names(&self, host: &Host) -> Result<Vec<String>> {
        let output = self.exec(host, CommandSpec::new("iw dev")).await?;
        Ok(parse_interface_names(&output.stdout))
    }

    /// Lazily enumerate interfaces, querying each one as it is reached
    ///
    /// Every call starts over from a fresh `iw dev`. Interfaces that vanish
    /// between the listing and their info query are skipped.
    pub fn interfaces<'a>(
        &'a self,
        host: &'a Host,
    ) -> impl Stream<Item = Result<VirtualInterface>> + Send + 'a {
        stream::once(self.interface_names(host))
            .map_ok(|names| stream::iter(names.into_iter().map(Ok::<String, WifiError>)))
            .try_flatten()
            .try_filter_map(move |name| async move {
                match self.interface_info(host, &name).await {
                    Ok(info) => Ok(Some(info.into_virtual(Role::Unassigned))),
                    Err(WifiError::NoSuchInterface(name)) => {
                        debug!(host = %host.name, "Interface {} vanished during listing", name);
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            })
    }

    pub async fn list_interfaces(&self, host: &Host) -> Result<Vec<VirtualInterface>> {
        self.interfaces(host).try_collect().await
    }

    /// Interfaces bound to one radio
    pub async fn radio_interfaces(&self, host: &Host, radio_id: &str) -> Result<Vec<VirtualInterface>> {
        self.interfaces(host)
            .try_filter(|iface| futures::future::ready(iface.radio_id == radio_id))
            .try_collect()
            .await
    }

    /// Dump `iw phy <r> info` and bus location of every radio
    pub async fn radio_info(&self, host: &Host) -> Result<Vec<(RadioDevice, String)>> {
        let radios = self.list_radios(host).await?;
        let mut result = Vec::with_capacity(radios.len());
        for radio in radios {
            let output = self
                .exec(host, CommandSpec::new(format!("iw phy {} info", radio.radio_id)))
                .await?;
            info!(
                host = %host.name,
                "{} at {}",
                radio.radio_id,
                radio.bus_address.as_deref().unwrap_or("unknown bus")
            );
            result.push((radio, output.stdout));
        }
        Ok(result)
    }
}
