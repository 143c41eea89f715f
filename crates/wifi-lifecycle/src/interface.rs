//! Virtual interface lifecycle
//!
//! [`Testbed::acquire`] is the entry point of the per-radio state machine:
//! it leaves the radio with exactly one fresh managed interface, or binds to
//! an interface that already exists.

use crate::cleanup::TeardownScope;
use crate::error::{Result, WifiError};
use crate::exec::CommandSpec;
use crate::types::{InterfaceMode, MacAddr, Role, VirtualInterface};
use crate::Testbed;
use inventory::Host;
use std::net::Ipv4Addr;
use tracing::info;

/// Which interface to hand out
///
/// Exactly one of `radio_hint` and `interface_name` must be set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcquireRequest {
    /// Radio name or bus address; the radio is wiped and gets a new interface
    pub radio_hint: Option<String>,
    /// Existing interface to bind to as is
    pub interface_name: Option<String>,
    pub role: Role,
}

impl AcquireRequest {
    pub fn on_radio(hint: impl Into<String>, role: Role) -> Self {
        Self {
            radio_hint: Some(hint.into()),
            interface_name: None,
            role,
        }
    }

    pub fn existing(name: impl Into<String>, role: Role) -> Self {
        Self {
            radio_hint: None,
            interface_name: Some(name.into()),
            role,
        }
    }
}

/// Interface name generated for `role` on `radio_id`
pub fn generated_name(radio_id: &str, role: Role) -> String {
    format!("{}{}", radio_id, role.suffix())
}

/// Interface name used when creating interfaces in bulk: mode prefix plus radio index
pub fn bulk_name(radio_id: &str, mode: InterfaceMode) -> String {
    let index: String = radio_id
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{}{}", mode.name_prefix(), index)
}

/// Administrative state and hardware address from `ip link show`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkState {
    pub up: bool,
    pub mac: Option<MacAddr>,
}

/// Parse `ip link show dev <if>`
pub fn parse_link_state(output: &str) -> Option<LinkState> {
    let first = output.lines().next()?;
    let flags_start = first.find('<')?;
    let flags_end = first[flags_start..].find('>')? + flags_start;
    let up = first[flags_start + 1..flags_end]
        .split(',')
        .any(|flag| flag == "UP");

    let mac = output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("link/ether "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|mac| mac.parse().ok());

    Some(LinkState { up, mac })
}

impl Testbed {
    /// Hand out an interface for `request.role`
    ///
    /// With a radio hint the radio is resolved, torn down and given a new
    /// managed interface named after the radio and role. With an interface
    /// name the interface must already exist and its radio is looked up.
    pub async fn acquire(&self, host: &Host, request: &AcquireRequest) -> Result<VirtualInterface> {
        match (&request.radio_hint, &request.interface_name) {
            (Some(_), Some(_)) => Err(WifiError::InvalidArgument(
                "radio hint and interface name are mutually exclusive".to_string(),
            )),
            (None, None) => Err(WifiError::InvalidArgument(
                "either a radio hint or an interface name is required".to_string(),
            )),
            (Some(hint), None) => {
                let radio_id = self.resolve_radio(host, hint).await?;
                self.teardown(host, &TeardownScope::Radio(radio_id.clone()))
                    .await;

                let name = generated_name(&radio_id, request.role);
                self.create_interface_named(host, &radio_id, &name, InterfaceMode::Managed)
                    .await?;

                info!(host = %host.name, "Acquired {} on {} for {:?}", name, radio_id, request.role);
                Ok(VirtualInterface {
                    name,
                    radio_id,
                    mode: InterfaceMode::Managed,
                    role: request.role,
                    mac: None,
                })
            }
            (None, Some(name)) => {
                let info = self.interface_info(host, name).await?;
                info!(host = %host.name, "Bound existing {} on {}", info.name, info.radio_id);
                Ok(info.into_virtual(request.role))
            }
        }
    }

    /// Create `name` on `radio_id` in `mode`
    pub async fn create_interface_named(
        &self,
        host: &Host,
        radio_id: &str,
        name: &str,
        mode: InterfaceMode,
    ) -> Result<()> {
        let iw_type = mode.iw_type().ok_or_else(|| {
            WifiError::InvalidArgument(format!("interfaces cannot be created in {} mode", mode))
        })?;
        self.exec(
            host,
            CommandSpec::new(format!(
                "iw phy {} interface add {} type {}",
                radio_id, name, iw_type
            ))
            .sudo(),
        )
        .await?;
        Ok(())
    }

    /// Create the [`bulk_name`] interface of `mode` on `radio_id`
    pub async fn create_interface(
        &self,
        host: &Host,
        radio_id: &str,
        mode: InterfaceMode,
    ) -> Result<VirtualInterface> {
        let name = bulk_name(radio_id, mode);
        self.create_interface_named(host, radio_id, &name, mode)
            .await?;
        Ok(VirtualInterface {
            name,
            radio_id: radio_id.to_string(),
            mode,
            role: Role::Unassigned,
            mac: None,
        })
    }

    /// Create one interface per radio and mode, named by [`bulk_name`]
    ///
    /// `radios` defaults to every radio on the host.
    pub async fn create_interfaces(
        &self,
        host: &Host,
        radios: Option<Vec<String>>,
        modes: &[InterfaceMode],
    ) -> Result<Vec<VirtualInterface>> {
        let radios = match radios {
            Some(radios) => radios,
            None => self
                .list_radios(host)
                .await?
                .into_iter()
                .map(|r| r.radio_id)
                .collect(),
        };

        let mut created = Vec::new();
        for radio_id in &radios {
            for &mode in modes {
                created.push(self.create_interface(host, radio_id, mode).await?);
            }
        }
        Ok(created)
    }

    pub async fn link_state(&self, host: &Host, interface: &str) -> Result<LinkState> {
        let output = self
            .exec(host, CommandSpec::new(format!("ip link show dev {}", interface)))
            .await?;
        parse_link_state(&output.stdout)
            .ok_or_else(|| WifiError::Parse(format!("no link state for {}", interface)))
    }

    pub async fn set_link(&self, host: &Host, interface: &str, up: bool) -> Result<()> {
        let state = if up { "up" } else { "down" };
        self.exec(
            host,
            CommandSpec::new(format!("ip link set {} {}", interface, state)).sudo(),
        )
        .await?;
        Ok(())
    }

    /// Bring an interface back to a blank managed state before a daemon takes it
    pub async fn reset_interface(&self, host: &Host, interface: &str) {
        for command in [
            format!("ip link set {} down", interface),
            format!("ip addr flush dev {}", interface),
            format!("iw dev {} set type managed", interface),
        ] {
            self.best_effort(host, CommandSpec::new(command).sudo()).await;
        }
    }

    /// Assign `ip`/24 to the interface
    pub async fn assign_address(&self, host: &Host, interface: &str, ip: Ipv4Addr) {
        self.best_effort(
            host,
            CommandSpec::new(format!("ip addr add {}/24 dev {}", ip, interface)).sudo(),
        )
        .await;
    }
}
