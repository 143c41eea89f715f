//! Throughput measurement with iperf3
//!
//! The server runs as a daemon on the access point host, the client on a
//! station. Reports are iperf3's own JSON; unknown fields are preserved so a
//! saved report can be re-read by other tools.

use crate::error::{Result, WifiError};
use crate::exec::CommandSpec;
use crate::Testbed;
use inventory::Host;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Offered load for UDP tests
pub const UDP_BANDWIDTH: &str = "100m";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Traffic {
    Udp,
    Tcp,
}

impl fmt::Display for Traffic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Traffic::Udp => f.write_str("udp"),
            Traffic::Tcp => f.write_str("tcp"),
        }
    }
}

impl FromStr for Traffic {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Traffic::Udp),
            "tcp" => Ok(Traffic::Tcp),
            other => Err(format!("unknown traffic type '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IperfStream {
    pub start: f64,
    pub end: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lost_packets: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IperfInterval {
    pub streams: Vec<IperfStream>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `iperf3 --json` output
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IperfReport {
    #[serde(default)]
    pub intervals: Vec<IperfInterval>,
    /// Server side of the test, present with `--get-server-output`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_output_json: Option<Box<IperfReport>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Aggregate of one client run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IperfSummary {
    pub intervals: usize,
    pub mean_bits_per_second: f64,
    pub total_bytes: u64,
    /// Only known for UDP tests with server output
    pub lost_packets: Option<u64>,
    pub mean_jitter_ms: Option<f64>,
}

impl IperfReport {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// First stream of every interval
    pub fn samples(&self) -> impl Iterator<Item = &IperfStream> {
        self.intervals.iter().filter_map(|i| i.streams.first())
    }

    pub fn summary(&self) -> IperfSummary {
        let samples: Vec<_> = self.samples().collect();
        let total_bytes = samples.iter().map(|s| s.bytes).sum();
        let mean_bits_per_second = mean(samples.iter().map(|s| s.bits_per_second));

        let server: Vec<_> = self
            .server_output_json
            .as_deref()
            .map(|server| server.samples().collect())
            .unwrap_or_default();
        let lost: Vec<u64> = server.iter().filter_map(|s| s.lost_packets).collect();
        let jitter: Vec<f64> = server.iter().filter_map(|s| s.jitter_ms).collect();

        IperfSummary {
            intervals: samples.len(),
            mean_bits_per_second: mean_bits_per_second.unwrap_or(0.0),
            total_bytes,
            lost_packets: (!lost.is_empty()).then(|| lost.iter().sum()),
            mean_jitter_ms: mean(jitter.into_iter()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

impl Testbed {
    /// Start an iperf3 server daemon on `host`, replacing any running one
    pub async fn start_iperf_server(&self, host: &Host) -> Result<()> {
        self.stop_iperf(host).await;
        self.exec(host, CommandSpec::new("iperf3 --daemon --json --server"))
            .await?;
        info!(host = %host.name, "iperf3 server started");
        Ok(())
    }

    pub async fn stop_iperf(&self, host: &Host) {
        self.best_effort(host, CommandSpec::new("pkill iperf3")).await;
    }

    /// Run an iperf3 client against `server_ip` for `duration`
    ///
    /// The command timeout of the executor must exceed `duration`.
    pub async fn run_iperf_client(
        &self,
        host: &Host,
        server_ip: &str,
        traffic: Traffic,
        duration: Duration,
    ) -> Result<IperfReport> {
        self.stop_iperf(host).await;

        let mut command = format!(
            "iperf3 --client {} -t {} --json --get-server-output",
            server_ip,
            duration.as_secs().max(1)
        );
        if traffic == Traffic::Udp {
            command.push_str(&format!(" -u -b {}", UDP_BANDWIDTH));
        }

        // iperf3 exits nonzero on failure but still prints a JSON error
        let output = self.exec(host, CommandSpec::new(command).warn()).await?;
        let report = IperfReport::from_json(&output.stdout)?;
        if let Some(error) = report.error.clone() {
            return Err(WifiError::Iperf(error));
        }

        let summary = report.summary();
        info!(
            host = %host.name,
            "iperf3 {} to {}: {:.1} Mbit/s over {} interval(s)",
            traffic,
            server_ip,
            summary.mean_bits_per_second / 1e6,
            summary.intervals
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::testing::ScriptedExecutor;
    use inventory::TestbedSettings;
    use std::sync::Arc;

    const UDP_REPORT: &str = r#"{
        "start": {"version": "iperf 3.9"},
        "intervals": [
            {"streams": [{"socket": 5, "start": 0, "end": 1.0, "seconds": 1.0, "bytes": 12500000, "bits_per_second": 100000000.0, "packets": 8633, "omitted": false}],
             "sum": {"start": 0, "end": 1.0}},
            {"streams": [{"socket": 5, "start": 1.0, "end": 2.0, "seconds": 1.0, "bytes": 7500000, "bits_per_second": 60000000.0, "packets": 5180, "omitted": false}],
             "sum": {"start": 1.0, "end": 2.0}}
        ],
        "end": {},
        "server_output_json": {
            "intervals": [
                {"streams": [{"socket": 5, "start": 0, "end": 1.0, "bytes": 12000000, "bits_per_second": 96000000.0, "jitter_ms": 0.2, "lost_packets": 3, "packets": 8633}]},
                {"streams": [{"socket": 5, "start": 1.0, "end": 2.0, "bytes": 7000000, "bits_per_second": 56000000.0, "jitter_ms": 0.4, "lost_packets": 7, "packets": 5180}]}
            ]
        }
    }"#;

    #[test]
    fn test_summary_of_udp_report() {
        let report = IperfReport::from_json(UDP_REPORT).unwrap();
        let summary = report.summary();
        assert_eq!(summary.intervals, 2);
        assert_eq!(summary.total_bytes, 20_000_000);
        assert!((summary.mean_bits_per_second - 80_000_000.0).abs() < 1e-6);
        assert_eq!(summary.lost_packets, Some(10));
        assert!((summary.mean_jitter_ms.unwrap() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_summary_without_server_output() {
        let summary = IperfReport::default().summary();
        assert_eq!(summary.intervals, 0);
        assert_eq!(summary.mean_bits_per_second, 0.0);
        assert_eq!(summary.lost_packets, None);
        assert_eq!(summary.mean_jitter_ms, None);
    }

    #[test]
    fn test_unknown_fields_survive() {
        let report = IperfReport::from_json(UDP_REPORT).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["start"]["version"], "iperf 3.9");
        assert_eq!(json["intervals"][0]["streams"][0]["socket"], 5);
    }

    #[tokio::test]
    async fn test_client_command_and_errors() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("iperf3 --client", CommandOutput::ok(UDP_REPORT));
        let testbed = Testbed::new(executor.clone(), TestbedSettings::default());
        let host = Host::new("nuc5");

        let report = testbed
            .run_iperf_client(&host, "10.1.1.1", Traffic::Udp, Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(report.intervals.len(), 2);
        assert_eq!(
            executor.count("iperf3 --client 10.1.1.1 -t 20 --json --get-server-output -u -b 100m"),
            1
        );
        assert!(executor.position("pkill iperf3").unwrap() < executor.position("--client").unwrap());

        executor.on(
            "iperf3 --client",
            CommandOutput {
                status: Some(1),
                stdout: r#"{"start": {}, "intervals": [], "error": "unable to connect to server: Connection refused"}"#.into(),
                stderr: String::new(),
            },
        );
        let err = testbed
            .run_iperf_client(&host, "10.1.1.1", Traffic::Tcp, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, WifiError::Iperf(ref msg) if msg.contains("Connection refused")));
    }

    #[tokio::test]
    async fn test_save_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iperf.json");
        let report = IperfReport::from_json(UDP_REPORT).unwrap();
        report.save(&path).await.unwrap();
        let back = IperfReport::from_json(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.summary(), report.summary());
    }
}
