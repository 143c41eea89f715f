//! Exporters for scan results and file naming of experiment outputs

use crate::error::Result;
use crate::scan::ScanRecord;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// Trait for exporting scan records in different output formats
#[async_trait]
pub trait ScanExporter: Send + Sync {
    fn export(&self, records: &[ScanRecord]) -> Result<String>;

    async fn export_to_file(&self, records: &[ScanRecord], path: &Path) -> Result<()> {
        let content = self.export(records)?;
        let mut file = File::create(path).await?;
        file.write_all(content.as_bytes()).await?;
        Ok(())
    }
}

/// Fixed-width table for terminals
pub struct TableExporter;

#[async_trait]
impl ScanExporter for TableExporter {
    fn export(&self, records: &[ScanRecord]) -> Result<String> {
        let mut output = format!(
            "{:<17} {:<10} {:<5} {:<12} {:<10} {}\n",
            "BSSID", "dev", "freq", "signal", "sta", "ssid"
        );
        for record in records {
            output.push_str(&format!(
                "{:<17} {:<10} {:<5} {:<12} {:<10} {}\n",
                record.bssid.to_string(),
                record.scanner_interface,
                opt(record.frequency_mhz),
                record
                    .signal_dbm
                    .map_or(String::new(), |dbm| format!("{:.2} dBm", dbm)),
                record.scanner_host,
                record.ssid,
            ));
        }
        Ok(output)
    }
}

/// One CSV row per record, with a header
pub struct CsvExporter {
    include_headers: bool,
}

impl CsvExporter {
    pub fn new() -> Self {
        Self {
            include_headers: true,
        }
    }

    pub fn without_headers() -> Self {
        Self {
            include_headers: false,
        }
    }
}

impl Default for CsvExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanExporter for CsvExporter {
    fn export(&self, records: &[ScanRecord]) -> Result<String> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());

        if self.include_headers {
            writer.write_record([
                "bssid",
                "ssid",
                "frequency_mhz",
                "signal_dbm",
                "scanner_host",
                "scanner_interface",
            ])?;
        }
        for record in records {
            writer.write_record([
                record.bssid.to_string(),
                record.ssid.clone(),
                opt(record.frequency_mhz),
                opt(record.signal_dbm),
                record.scanner_host.clone(),
                record.scanner_interface.clone(),
            ])?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

pub struct JsonExporter {
    pretty: bool,
}

impl JsonExporter {
    pub fn new() -> Self {
        Self { pretty: false }
    }

    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl Default for JsonExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanExporter for JsonExporter {
    fn export(&self, records: &[ScanRecord]) -> Result<String> {
        let result = if self.pretty {
            serde_json::to_string_pretty(records)?
        } else {
            serde_json::to_string(records)?
        };
        Ok(result)
    }
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map_or(String::new(), |v| v.to_string())
}

/// Keep only the records advertising `ssid`
pub fn filter_by_ssid(records: Vec<ScanRecord>, ssid: &str) -> Vec<ScanRecord> {
    records.into_iter().filter(|r| r.ssid == ssid).collect()
}

pub fn scan_file_name(at: DateTime<Local>) -> String {
    format!("scan_{}.csv", at.format(TIMESTAMP_FORMAT))
}

pub fn iperf_file_name(ap: &str, sta: &str, at: DateTime<Local>) -> String {
    format!("iperf_{}_{}_{}.json", at.format(TIMESTAMP_FORMAT), ap, sta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn records() -> Vec<ScanRecord> {
        vec![
            ScanRecord {
                bssid: "02:0e:8e:30:9c:17".parse().unwrap(),
                ssid: "experiment".into(),
                frequency_mhz: Some(2412),
                signal_dbm: Some(-41.0),
                scanner_host: "nuc5".into(),
                scanner_interface: "phy1_sta".into(),
            },
            ScanRecord {
                bssid: "64:66:b3:54:2a:10".parse().unwrap(),
                ssid: "lab, uplink".into(),
                frequency_mhz: None,
                signal_dbm: None,
                scanner_host: "nuc6".into(),
                scanner_interface: "phy0_scan".into(),
            },
        ]
    }

    #[test]
    fn test_table_export() {
        let table = TableExporter.export(&records()).unwrap();
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("BSSID"));
        assert!(lines[1].starts_with("02:0e:8e:30:9c:17 phy1_sta   2412  -41.00 dBm"));
        assert!(lines[1].ends_with(" experiment"));
    }

    #[test]
    fn test_csv_export_quotes_and_blanks() {
        let csv = CsvExporter::new().export(&records()).unwrap();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "bssid,ssid,frequency_mhz,signal_dbm,scanner_host,scanner_interface"
        );
        assert_eq!(lines[1], "02:0e:8e:30:9c:17,experiment,2412,-41,nuc5,phy1_sta");
        assert_eq!(lines[2], "64:66:b3:54:2a:10,\"lab, uplink\",,,nuc6,phy0_scan");

        let bare = CsvExporter::without_headers().export(&records()).unwrap();
        assert_eq!(bare.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_export_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.json");
        JsonExporter::pretty()
            .export_to_file(&records(), &path)
            .await
            .unwrap();
        let back: Vec<ScanRecord> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, records());
    }

    #[test]
    fn test_filter_and_file_names() {
        let only = filter_by_ssid(records(), "experiment");
        assert_eq!(only.len(), 1);

        let at = Local.with_ymd_and_hms(2024, 3, 7, 10, 12, 5).unwrap();
        assert_eq!(scan_file_name(at), "scan_2024-03-07T10-12-05.csv");
        assert_eq!(
            iperf_file_name("nuc4", "nuc5", at),
            "iperf_2024-03-07T10-12-05_nuc4_nuc5.json"
        );
    }
}
