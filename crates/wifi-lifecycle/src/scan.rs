//! Network scanning with `iw dev <if> scan`

use crate::error::Result;
use crate::exec::CommandSpec;
use crate::types::MacAddr;
use crate::Testbed;
use inventory::Host;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

static BSS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"BSS (?P<bssid>(?:[0-9a-f]{2}:?){6})\(on (?P<dev>[^)\s]+)\)").unwrap()
});

/// One network seen by one scanning interface
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub bssid: MacAddr,
    pub ssid: String,
    pub frequency_mhz: Option<u32>,
    pub signal_dbm: Option<f64>,
    pub scanner_host: String,
    pub scanner_interface: String,
}

#[derive(Default)]
struct PartialRecord {
    bssid: Option<MacAddr>,
    interface: String,
    ssid: Option<String>,
    frequency_mhz: Option<u32>,
    signal_dbm: Option<f64>,
}

impl PartialRecord {
    fn finish(self, host: &str) -> Option<ScanRecord> {
        Some(ScanRecord {
            bssid: self.bssid?,
            ssid: self.ssid?,
            frequency_mhz: self.frequency_mhz,
            signal_dbm: self.signal_dbm,
            scanner_host: host.to_string(),
            scanner_interface: self.interface,
        })
    }
}

/// Parse `iw dev <if> scan` output captured on `host`
///
/// A record is emitted when the next `BSS` header or the end of the output
/// is reached, and only if an `SSID` line was seen for it. Hidden networks
/// report an empty ssid and are kept.
pub fn parse_scan_output(output: &str, host: &str) -> Vec<ScanRecord> {
    let mut records = Vec::new();
    let mut current: Option<PartialRecord> = None;

    for line in output.lines().map(str::trim) {
        if let Some(caps) = BSS_RE.captures(line) {
            if let Some(record) = current.take().and_then(|r| r.finish(host)) {
                records.push(record);
            }
            current = Some(PartialRecord {
                bssid: caps["bssid"].parse().ok(),
                interface: caps["dev"].to_string(),
                ..PartialRecord::default()
            });
            continue;
        }

        let Some(record) = current.as_mut() else {
            continue;
        };
        if let Some(freq) = line.strip_prefix("freq:") {
            record.frequency_mhz = freq
                .trim()
                .split('.')
                .next()
                .and_then(|mhz| mhz.parse().ok());
        } else if let Some(signal) = line.strip_prefix("signal:") {
            record.signal_dbm = signal
                .split_whitespace()
                .next()
                .and_then(|dbm| dbm.parse().ok());
        } else if let Some(ssid) = line.strip_prefix("SSID:") {
            record.ssid = Some(ssid.trim().to_string());
        }
    }

    if let Some(record) = current.and_then(|r| r.finish(host)) {
        records.push(record);
    }
    records
}

/// Sort records by ssid, keeping scan order within one ssid
pub fn sort_by_ssid(records: &mut [ScanRecord]) {
    records.sort_by(|a, b| a.ssid.cmp(&b.ssid));
}

impl Testbed {
    /// Scan from `interface`, or from every interface on the host
    ///
    /// Interfaces that were down are brought up for the scan and put back
    /// down afterwards. A failed scan counts as no networks.
    pub async fn scan(&self, host: &Host, interface: Option<&str>) -> Result<Vec<ScanRecord>> {
        let interfaces = match interface {
            Some(name) => vec![name.to_string()],
            None => self.interface_names(host).await?,
        };

        let mut records = Vec::new();
        for name in &interfaces {
            records.extend(self.scan_interface(host, name).await);
        }
        sort_by_ssid(&mut records);

        info!(host = %host.name, "Scan found {} network(s) on {} interface(s)", records.len(), interfaces.len());
        Ok(records)
    }

    async fn scan_interface(&self, host: &Host, interface: &str) -> Vec<ScanRecord> {
        let was_up = match self.link_state(host, interface).await {
            Ok(state) => state.up,
            Err(e) => {
                warn!(host = %host.name, "Skipping scan on {}: {}", interface, e);
                return Vec::new();
            }
        };

        if !was_up {
            self.set_link_or_warn(host, interface, true).await;
        }

        let output = self
            .best_effort(host, CommandSpec::new(format!("iw dev {} scan", interface)).sudo())
            .await;

        if !was_up {
            self.set_link_or_warn(host, interface, false).await;
        }

        match output {
            Some(output) if output.success() => parse_scan_output(&output.stdout, &host.name),
            _ => Vec::new(),
        }
    }

    async fn set_link_or_warn(&self, host: &Host, interface: &str, up: bool) {
        if let Err(e) = self.set_link(host, interface, up).await {
            warn!(host = %host.name, "Could not set {} {}: {}", interface, if up { "up" } else { "down" }, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::testing::{samples, ScriptedExecutor};
    use inventory::TestbedSettings;
    use std::sync::Arc;

    #[test]
    fn test_parse_sample_scan() {
        let records = parse_scan_output(samples::SCAN, "nuc5");
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.bssid.to_string(), "02:0e:8e:30:9c:17");
        assert_eq!(first.ssid, "experiment");
        assert_eq!(first.frequency_mhz, Some(2412));
        assert_eq!(first.signal_dbm, Some(-41.0));
        assert_eq!(first.scanner_host, "nuc5");
        assert_eq!(first.scanner_interface, "phy1_sta");

        let second = &records[1];
        assert_eq!(second.ssid, "lab-uplink");
        assert_eq!(second.frequency_mhz, Some(5240));
    }

    #[test]
    fn test_record_without_ssid_is_dropped() {
        let output = "\
BSS 02:00:00:00:00:01(on wlan0)
\tfreq: 2412
\tsignal: -50.00 dBm
BSS 02:00:00:00:00:02(on wlan0)
\tSSID: second
BSS 02:00:00:00:00:03(on wlan0)
\tfreq: 5180
";
        let records = parse_scan_output(output, "h");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ssid, "second");
        assert_eq!(records[0].bssid.to_string(), "02:00:00:00:00:02");
    }

    #[test]
    fn test_fields_do_not_bleed_between_blocks() {
        let output = "\
BSS 02:00:00:00:00:01(on wlan0)
\tfreq: 2412
\tsignal: -50.00 dBm
\tSSID: first
BSS 02:00:00:00:00:02(on wlan0)
\tSSID: second
";
        let records = parse_scan_output(output, "h");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].frequency_mhz, None);
        assert_eq!(records[1].signal_dbm, None);
    }

    #[test]
    fn test_hyphenated_interface_names() {
        let output = "\
BSS 02:00:00:00:00:01(on wlan0-1)
\tfreq: 2412
\tSSID: a
BSS 02:00:00:00:00:02(on wlan0-1) -- associated
\tfreq: 5180
\tSSID: b
";
        let records = parse_scan_output(output, "h");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].scanner_interface, "wlan0-1");
        assert_eq!(records[0].frequency_mhz, Some(2412));
        assert_eq!(records[1].bssid.to_string(), "02:00:00:00:00:02");
        assert_eq!(records[1].frequency_mhz, Some(5180));
    }

    #[test]
    fn test_hidden_network_and_fractional_frequency() {
        let output = "BSS 02:00:00:00:00:09(on wlan1)\n\tfreq: 5745.0\n\tSSID: \n";
        let records = parse_scan_output(output, "h");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ssid, "");
        assert_eq!(records[0].frequency_mhz, Some(5745));
        assert!(parse_scan_output("", "h").is_empty());
        assert!(parse_scan_output("\tSSID: orphan\n", "h").is_empty());
    }

    #[tokio::test]
    async fn test_scan_restores_down_interface() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor
            .on("ip link show dev phy1_sta", CommandOutput::ok(samples::IP_LINK_DOWN))
            .on("iw dev phy1_sta scan", CommandOutput::ok(samples::SCAN));
        let testbed = Testbed::new(executor.clone(), TestbedSettings::default());

        let records = testbed
            .scan(&Host::new("nuc5"), Some("phy1_sta"))
            .await
            .unwrap();
        let ssids: Vec<_> = records.iter().map(|r| r.ssid.as_str()).collect();
        assert_eq!(ssids, vec!["experiment", "lab-uplink"]);

        let up = executor.position("ip link set phy1_sta up").unwrap();
        let scan = executor.position("iw dev phy1_sta scan").unwrap();
        let down = executor.position("ip link set phy1_sta down").unwrap();
        assert!(up < scan && scan < down);
    }

    #[tokio::test]
    async fn test_scan_when_link_cannot_be_raised() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor
            .on("ip link show dev phy1_sta", CommandOutput::ok(samples::IP_LINK_DOWN))
            .on("ip link set phy1_sta", CommandOutput::failed(2, "RTNETLINK answers: Operation not possible due to RF-kill"))
            .on("iw dev phy1_sta scan", CommandOutput::ok(samples::SCAN));
        let testbed = Testbed::new(executor.clone(), TestbedSettings::default());

        let records = testbed
            .scan(&Host::new("nuc5"), Some("phy1_sta"))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(executor.count("ip link set phy1_sta"), 2);
    }

    #[tokio::test]
    async fn test_scan_all_interfaces_sorted_and_tolerant() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor
            .on("iw dev", CommandOutput::ok(samples::IW_DEV))
            .on("ip link show", CommandOutput::ok(samples::IP_LINK_UP))
            .on("iw dev phy1_sta scan", CommandOutput::ok(samples::SCAN))
            .on("iw dev phy0_ap scan", CommandOutput::failed(240, "Device or resource busy"));
        let testbed = Testbed::new(executor.clone(), TestbedSettings::default());

        let records = testbed.scan(&Host::new("nuc5"), None).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(executor.count("ip link set"), 0);

        executor.on(
            "iw dev phy0_ap scan",
            CommandOutput::ok("BSS 02:00:00:00:00:07(on phy0_ap)\n\tSSID: aaa\n"),
        );
        let records = testbed.scan(&Host::new("nuc5"), None).await.unwrap();
        let ssids: Vec<_> = records.iter().map(|r| r.ssid.as_str()).collect();
        assert_eq!(ssids, vec!["aaa", "experiment", "lab-uplink"]);
    }
}
