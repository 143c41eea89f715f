//! End-to-end lifecycle flows against a scripted testbed
//!
//! These tests drive the public API the way the CLI does: acquire an
//! interface, bind a role to it, verify, and tear everything down.

use std::sync::Arc;
use std::time::Duration;
use wifi_lifecycle::device::RADIO_LISTING_COMMAND;
use wifi_lifecycle::testing::{samples, ScriptedExecutor};
use wifi_lifecycle::{
    AccessPointConfig, AcquireRequest, CommandOutput, DaemonKind, Host, PollConfig, Role,
    StationConfig, TeardownScope, Testbed, TestbedSettings, WifiError,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("wifi_lifecycle=debug")
        .try_init();
}

fn scripted_testbed() -> (Arc<ScriptedExecutor>, Testbed) {
    let executor = Arc::new(ScriptedExecutor::new());
    executor
        .on(RADIO_LISTING_COMMAND, CommandOutput::ok(samples::RADIO_LISTING))
        .on("iw dev", CommandOutput::ok(samples::IW_DEV))
        .on("iw dev phy0_ap info", CommandOutput::ok(samples::IW_INFO_PHY0))
        .on("iw dev phy1_sta info", CommandOutput::ok(samples::IW_INFO_PHY1))
        .on("ip link show", CommandOutput::ok(samples::IP_LINK_DOWN))
        .on("pkill", CommandOutput::failed(1, ""));
    let settings = TestbedSettings {
        settle_secs: 0,
        ..TestbedSettings::default()
    };
    (executor.clone(), Testbed::new(executor, settings))
}

#[tokio::test]
async fn test_access_point_and_station_round_trip() {
    init_logging();
    let (executor, testbed) = scripted_testbed();
    let ap_host = Host::new("nuc4");
    let sta_host = Host::new("nuc5").with_elevation(false);

    let ap_iface = testbed
        .acquire(&ap_host, &AcquireRequest::on_radio("phy0", Role::Ap))
        .await
        .unwrap();
    assert_eq!(ap_iface.name, "phy0_ap");

    let ap = testbed
        .start_access_point(&ap_host, &ap_iface, &AccessPointConfig::new("experiment", 48))
        .await
        .unwrap();
    assert_eq!(ap.kind, DaemonKind::Hostapd);
    let conf = executor.uploaded("hostapd-phy0-phy0_ap.conf").unwrap();
    assert!(conf.contains("hw_mode=a\n"));
    assert!(conf.contains("bssid=02:0e:8e:30:9c:17\n"));

    let sta_iface = testbed
        .acquire(&sta_host, &AcquireRequest::on_radio("0000:03:00.0", Role::Station))
        .await
        .unwrap();
    assert_eq!(sta_iface.name, "phy1_sta");

    let sta = testbed
        .connect(&sta_host, &sta_iface, &StationConfig::new("experiment"))
        .await
        .unwrap();
    assert_eq!(sta.kind, DaemonKind::WpaSupplicant);
    assert_eq!(sta.host, "nuc5");

    let poll = PollConfig::new(Duration::from_millis(5), Duration::from_millis(50));
    testbed
        .wait_for_connectivity(&sta_host, "10.1.1.1", &poll)
        .await
        .unwrap();

    // Hosts without elevation never run commands through sudo
    assert!(executor
        .recorded()
        .iter()
        .filter(|c| c.host == "nuc5")
        .all(|c| !c.privileged));
    assert!(executor
        .recorded()
        .iter()
        .filter(|c| c.host == "nuc4" && c.command.starts_with("hostapd"))
        .all(|c| c.privileged));

    for (host, handle) in [(&ap_host, &ap), (&sta_host, &sta)] {
        testbed.stop_daemon(host, handle).await;
        testbed
            .teardown(host, &TeardownScope::Radio(handle.radio_id.clone()))
            .await;
    }
    assert_eq!(executor.count("rm -f '/tmp/hostapd-phy0-phy0_ap.pid'"), 1);
    assert_eq!(executor.count("rm -f '/tmp/wpasup-phy1-phy1_sta.pid'"), 1);
}

#[tokio::test]
async fn test_failed_access_point_leaves_radio_for_teardown() {
    init_logging();
    let (executor, testbed) = scripted_testbed();
    executor.on("hostapd -tB", CommandOutput::failed(1, "nl80211: Could not configure driver mode"));
    let host = Host::new("nuc4");

    let iface = testbed
        .acquire(&host, &AcquireRequest::on_radio("phy0", Role::Ap))
        .await
        .unwrap();
    let err = testbed
        .start_access_point(&host, &iface, &AccessPointConfig::new("experiment", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, WifiError::DaemonStart { .. }));
    assert!(err.to_string().contains("phy0_ap"));

    let report = testbed
        .teardown(&host, &TeardownScope::Radio("phy0".into()))
        .await;
    assert_eq!(report.removed_interfaces, vec!["phy0_ap".to_string()]);
}

#[tokio::test]
async fn test_station_without_access_point_times_out() {
    init_logging();
    let (executor, testbed) = scripted_testbed();
    executor.on("ping", CommandOutput::failed(1, "Destination Host Unreachable"));
    let host = Host::new("nuc5");

    let iface = testbed
        .acquire(&host, &AcquireRequest::existing("phy1_sta", Role::Station))
        .await
        .unwrap();
    testbed
        .connect(&host, &iface, &StationConfig::new("missing"))
        .await
        .unwrap();

    let poll = PollConfig::new(Duration::from_millis(5), Duration::from_millis(30));
    match testbed.wait_for_connectivity(&host, "10.1.1.1", &poll).await {
        Err(WifiError::ConnectionFailed { host, target, waited }) => {
            assert_eq!(host, "nuc5");
            assert_eq!(target, "10.1.1.1");
            assert_eq!(waited, Duration::from_millis(30));
        }
        other => panic!("expected ConnectionFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_scan_sees_access_point_bssid() {
    init_logging();
    let (executor, testbed) = scripted_testbed();
    executor.on("iw dev phy1_sta scan", CommandOutput::ok(samples::SCAN));
    let host = Host::new("nuc5");

    let iface = testbed
        .acquire(&host, &AcquireRequest::existing("phy1_sta", Role::Scan))
        .await
        .unwrap();
    let records = testbed.scan(&host, Some(&iface.name)).await.unwrap();

    let ours = records.iter().find(|r| r.ssid == "experiment").unwrap();
    assert_eq!(ours.bssid.to_string(), "02:0e:8e:30:9c:17");
    assert_eq!(ours.scanner_host, "nuc5");
}
