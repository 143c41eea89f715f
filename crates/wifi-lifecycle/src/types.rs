//! Core types shared by the provisioning modules

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// 48-bit hardware address
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

/// First octet of generated access point BSSIDs (locally administered)
pub const LOCALLY_ADMINISTERED_OCTET: u8 = 0x02;

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Same address with the first octet replaced by the locally administered marker
    pub fn locally_administered(&self) -> MacAddr {
        let mut octets = self.0;
        octets[0] = LOCALLY_ADMINISTERED_OCTET;
        MacAddr(octets)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(format!("invalid MAC address '{}'", s));
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(format!("invalid MAC address '{}'", s));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid MAC address '{}'", s))?;
        }
        Ok(MacAddr(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Operating mode of a virtual interface as reported by `iw`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceMode {
    Managed,
    Monitor,
    Ibss,
    Mesh,
    Wds,
    /// Set by hostapd once it owns the interface
    Ap,
    Unknown,
}

impl InterfaceMode {
    /// Type argument for `iw ... interface add`, for modes that can be created
    pub fn iw_type(&self) -> Option<&'static str> {
        match self {
            InterfaceMode::Managed => Some("managed"),
            InterfaceMode::Monitor => Some("monitor"),
            InterfaceMode::Ibss => Some("ibss"),
            InterfaceMode::Mesh => Some("mesh"),
            InterfaceMode::Wds => Some("wds"),
            InterfaceMode::Ap | InterfaceMode::Unknown => None,
        }
    }

    /// Prefix of interfaces created in bulk for this mode
    pub fn name_prefix(&self) -> &'static str {
        match self {
            InterfaceMode::Managed => "w",
            InterfaceMode::Ibss | InterfaceMode::Monitor => "i",
            InterfaceMode::Mesh => "s",
            InterfaceMode::Wds => "d",
            InterfaceMode::Ap => "a",
            InterfaceMode::Unknown => "x",
        }
    }

    /// Parse the `type` field of `iw dev <if> info`
    pub fn from_iw(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "managed" => InterfaceMode::Managed,
            "monitor" => InterfaceMode::Monitor,
            "ibss" => InterfaceMode::Ibss,
            "mesh" | "mesh point" => InterfaceMode::Mesh,
            "wds" => InterfaceMode::Wds,
            "ap" => InterfaceMode::Ap,
            _ => InterfaceMode::Unknown,
        }
    }
}

impl fmt::Display for InterfaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterfaceMode::Managed => "managed",
            InterfaceMode::Monitor => "monitor",
            InterfaceMode::Ibss => "ibss",
            InterfaceMode::Mesh => "mesh",
            InterfaceMode::Wds => "wds",
            InterfaceMode::Ap => "ap",
            InterfaceMode::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl FromStr for InterfaceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match InterfaceMode::from_iw(s) {
            InterfaceMode::Unknown => Err(format!("unknown interface mode '{}'", s)),
            mode => Ok(mode),
        }
    }
}

/// What an interface is being used for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Ap,
    Station,
    Scan,
    Unassigned,
}

impl Role {
    /// Suffix appended to the radio id when generating an interface name
    pub fn suffix(&self) -> &'static str {
        match self {
            Role::Ap => "_ap",
            Role::Station => "_sta",
            Role::Scan => "_scan",
            Role::Unassigned => "w",
        }
    }
}

/// One physical radio on a host
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioDevice {
    /// Canonical name, e.g. `phy0`
    pub radio_id: String,
    /// Bus location, e.g. `0000:03:00.0`
    pub bus_address: Option<String>,
}

/// A network interface bound to one radio
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualInterface {
    pub name: String,
    pub radio_id: String,
    pub mode: InterfaceMode,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddr>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonKind {
    Hostapd,
    WpaSupplicant,
}

impl DaemonKind {
    pub fn program(&self) -> &'static str {
        match self {
            DaemonKind::Hostapd => "hostapd",
            DaemonKind::WpaSupplicant => "wpa_supplicant",
        }
    }

    /// File name stem of configs, pid files and logs
    fn file_stem(&self) -> &'static str {
        match self {
            DaemonKind::Hostapd => "hostapd",
            DaemonKind::WpaSupplicant => "wpasup",
        }
    }

    /// Paths used by a daemon bound to `interface` on `radio_id`
    ///
    /// The radio id is part of every path so radio-wide teardown can find the
    /// daemon by pattern even when the interface name does not mention it.
    pub fn paths(&self, run_dir: &str, radio_id: &str, interface: &str) -> DaemonPaths {
        let run_dir = run_dir.trim_end_matches('/');
        let base = format!("{}/{}-{}-{}", run_dir, self.file_stem(), radio_id, interface);
        DaemonPaths {
            config_file: format!("{}.conf", base),
            pid_file: format!("{}.pid", base),
            log_file: format!("{}.log", base),
        }
    }

    /// `pkill -f` pattern matching every daemon of this kind on `radio_id`
    pub fn radio_pattern(&self, radio_id: &str) -> String {
        format!("{}.*/{}-{}-", self.process_pattern(), self.file_stem(), radio_id)
    }

    /// `pkill -f` pattern matching the daemon writing `pid_file`
    pub fn pid_pattern(&self, pid_file: &str) -> String {
        format!("{}.*{}", self.process_pattern(), pid_file)
    }

    /// `pkill -f` pattern matching every daemon of this kind
    ///
    /// `[h]ostapd` still matches hostapd but not the shell running pkill.
    pub fn process_pattern(&self) -> String {
        let program = self.program();
        format!("[{}]{}", &program[..1], &program[1..])
    }
}

impl fmt::Display for DaemonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonPaths {
    pub config_file: String,
    pub pid_file: String,
    pub log_file: String,
}

/// A daemon started on a host
///
/// For stations this means "daemon started", not "associated".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonHandle {
    pub kind: DaemonKind,
    pub host: String,
    pub interface: String,
    pub radio_id: String,
    pub pid_file: String,
    pub log_file: String,
    pub config_file: String,
}
