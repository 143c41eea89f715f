//! CLI command implementations for the Wi-Fi testbed
//!
//! Every command resolves its hosts through the inventory and fans out over
//! them concurrently; one `Testbed` is shared by all hosts.

use crate::Target;
use anyhow::{bail, Context as _, Result};
use chrono::Local;
use futures::future::join_all;
use inventory::{Host, Inventory, Presets, RadioPreset};
use serde::Serialize;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use wifi_lifecycle::ap::DEFAULT_AP_IP;
use wifi_lifecycle::measurement::Traffic;
use wifi_lifecycle::report::{
    filter_by_ssid, iperf_file_name, scan_file_name, CsvExporter, ScanExporter, TableExporter,
};
use wifi_lifecycle::scan::sort_by_ssid;
use wifi_lifecycle::station::usable_station_ip;
use wifi_lifecycle::{
    AccessPointConfig, AcquireRequest, InterfaceMode, LocalExecutor, PollConfig, Role,
    ScanRecord, StationConfig, TeardownScope, Testbed, WifiError,
};

/// Inventory plus the testbed used to reach its hosts
pub struct Context {
    pub inventory: Inventory,
    pub testbed: Testbed,
}

impl Context {
    pub fn load(path: Option<&Path>, local: bool) -> Result<Self> {
        let inventory = match path {
            Some(path) => Inventory::load(path)
                .with_context(|| format!("Failed to load inventory {}", path.display()))?,
            None => Inventory::default(),
        };

        let settings = inventory.settings.clone();
        let testbed = if local {
            Testbed::new(Arc::new(LocalExecutor::from_settings(&settings)), settings)
        } else {
            Testbed::over_ssh(settings)
        };
        Ok(Self { inventory, testbed })
    }

    pub fn hosts(&self, names: &str) -> Result<Vec<Host>> {
        let hosts = self.inventory.resolve_hosts(names);
        if hosts.is_empty() {
            bail!("No hosts given");
        }
        Ok(hosts)
    }
}

impl Target {
    pub fn request(&self, role: Role) -> AcquireRequest {
        AcquireRequest {
            radio_hint: self.phy.clone(),
            interface_name: self.interface.clone(),
            role,
        }
    }
}

/// Run `op` on every host concurrently, keeping results in host order
async fn on_hosts<'a, T, F, Fut>(hosts: &'a [Host], op: F) -> Vec<(&'a Host, wifi_lifecycle::Result<T>)>
where
    F: Fn(&'a Host) -> Fut,
    Fut: Future<Output = wifi_lifecycle::Result<T>>,
{
    join_all(hosts.iter().map(|host| {
        let fut = op(host);
        async move { (host, fut.await) }
    }))
    .await
}

/// Log per-host failures and fail if there were any
fn check_failures<T>(results: &[(&Host, wifi_lifecycle::Result<T>)]) -> Result<()> {
    let failed: Vec<_> = results
        .iter()
        .filter_map(|(host, result)| result.as_ref().err().map(|e| (host, e)))
        .collect();
    for (host, e) in &failed {
        error!("{}: {}", host.name, e);
    }
    if !failed.is_empty() {
        bail!("{} of {} host(s) failed", failed.len(), results.len());
    }
    Ok(())
}

/// Refuse a derived station address the access point or the /24 already uses
fn check_station_ip(ip: Ipv4Addr, ap_ip: Ipv4Addr) -> wifi_lifecycle::Result<()> {
    if usable_station_ip(ip, ap_ip) {
        return Ok(());
    }
    Err(WifiError::InvalidArgument(format!(
        "derived station address {} is unusable next to access point {}, pass --ip",
        ip, ap_ip
    )))
}

fn parse_ip(value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .with_context(|| format!("Invalid IPv4 address '{}'", value))
}

/// Implementation of the 'list' command - shows inventory hosts, settings and presets
pub async fn cmd_list(ctx: &Context) -> Result<()> {
    println!("Hosts:");
    println!("======");
    if ctx.inventory.hosts.is_empty() {
        println!("  (none registered, host names are used as ssh destinations)");
    }
    for host in &ctx.inventory.hosts {
        println!(
            "  {:<12} {:<24} {}",
            host.name,
            host.ssh_destination(),
            if host.requires_elevation { "sudo" } else { "root" }
        );
    }

    let settings = &ctx.inventory.settings;
    println!("\nSettings:");
    println!("  command timeout   {}s", settings.command_timeout_secs);
    println!("  settle time       {}s", settings.settle_secs);
    println!("  run directory     {}", settings.run_dir);
    println!("  station subnet    {}/24", settings.station_subnet);
    println!("  driver modules    {}", settings.driver_modules.join(" "));

    println!("\nRadio presets:");
    for preset in Presets::radio_presets() {
        println!("  {:<10} - {}", preset.name, preset.description);
    }

    let defaults = Presets::ap_defaults();
    println!("\nAccess point defaults:");
    println!(
        "  ssid {}, channel {}, address {}",
        defaults.ssid, defaults.channel, defaults.ip
    );

    Ok(())
}

/// Implementation of the 'radios' command
pub async fn cmd_radios(ctx: &Context, hosts: &str, details: bool) -> Result<()> {
    let hosts = ctx.hosts(hosts)?;
    let testbed = &ctx.testbed;

    if details {
        let results = on_hosts(&hosts, |host| testbed.radio_info(host)).await;
        for (host, result) in &results {
            if let Ok(radios) = result {
                for (radio, info) in radios {
                    println!(
                        "{}: {} ({})",
                        host.name,
                        radio.radio_id,
                        radio.bus_address.as_deref().unwrap_or("-")
                    );
                    for line in info.lines() {
                        println!("    {}", line);
                    }
                }
            }
        }
        return check_failures(&results);
    }

    let results = on_hosts(&hosts, |host| testbed.list_radios(host)).await;
    for (host, result) in &results {
        if let Ok(radios) = result {
            for radio in radios {
                println!(
                    "{:<12} {:<6} {}",
                    host.name,
                    radio.radio_id,
                    radio.bus_address.as_deref().unwrap_or("-")
                );
            }
        }
    }
    check_failures(&results)
}

/// Implementation of the 'resolve' command
pub async fn cmd_resolve(ctx: &Context, hosts: &str, hint: &str) -> Result<()> {
    let hosts = ctx.hosts(hosts)?;
    let testbed = &ctx.testbed;
    let results = on_hosts(&hosts, |host| testbed.resolve_radio(host, hint)).await;
    for (host, result) in &results {
        if let Ok(radio) = result {
            println!("{}: {} -> {}", host.name, hint, radio);
        }
    }
    check_failures(&results)
}

/// Implementation of the 'interfaces' command
pub async fn cmd_interfaces(ctx: &Context, hosts: &str) -> Result<()> {
    let hosts = ctx.hosts(hosts)?;
    let testbed = &ctx.testbed;
    let results = on_hosts(&hosts, |host| testbed.list_interfaces(host)).await;
    for (host, result) in &results {
        if let Ok(interfaces) = result {
            for iface in interfaces {
                println!(
                    "{:<12} {:<12} {:<6} {:<8} {}",
                    host.name,
                    iface.name,
                    iface.radio_id,
                    iface.mode.to_string(),
                    iface.mac.map_or("-".to_string(), |m| m.to_string())
                );
            }
        }
    }
    check_failures(&results)
}

/// Implementation of the 'ap' command - acquires an interface and starts hostapd on it
pub async fn cmd_ap(
    ctx: &Context,
    host: &str,
    target: &Target,
    ssid: String,
    channel: u8,
    passphrase: Option<String>,
    ip: &str,
) -> Result<()> {
    let host = ctx.inventory.resolve_host(host);
    let mut config = AccessPointConfig::new(ssid, channel).with_ip(parse_ip(ip)?);
    if let Some(passphrase) = passphrase {
        config = config.with_passphrase(passphrase);
    }

    let iface = ctx.testbed.acquire(&host, &target.request(Role::Ap)).await?;
    let handle = ctx
        .testbed
        .start_access_point(&host, &iface, &config)
        .await?;

    println!(
        "{}: access point '{}' on {} channel {} ({}), log {}",
        host.name,
        config.ssid,
        handle.interface,
        config.channel,
        config.hw_mode(),
        handle.log_file
    );
    Ok(())
}

/// Implementation of the 'connect' command - starts wpa_supplicant on every host
pub async fn cmd_connect(
    ctx: &Context,
    hosts: &str,
    target: &Target,
    ssid: String,
    passphrase: Option<String>,
    ip: Option<String>,
    wait_for: Option<String>,
) -> Result<()> {
    let hosts = ctx.hosts(hosts)?;
    if ip.is_some() && hosts.len() > 1 {
        bail!("--ip can only be used with a single host");
    }

    let mut config = StationConfig::new(ssid);
    if let Some(passphrase) = passphrase {
        config = config.with_passphrase(passphrase);
    }
    if let Some(ip) = ip {
        config = config.with_ip(parse_ip(&ip)?);
    }

    let testbed = &ctx.testbed;
    let config = &config;
    let request = &target.request(Role::Station);
    let wait_for = wait_for.as_deref();
    let poll = &PollConfig::from_settings(testbed.settings());

    let results = on_hosts(&hosts, |host| async move {
        if config.ip.is_none() {
            check_station_ip(testbed.station_ip(host, config)?, DEFAULT_AP_IP)?;
        }
        let iface = testbed.acquire(host, request).await?;
        let handle = testbed.connect(host, &iface, config).await?;
        if let Some(target) = wait_for {
            if let Err(e) = testbed.wait_for_connectivity(host, target, poll).await {
                warn!(host = %host.name, "Stopping {} on {}", handle.kind, handle.interface);
                testbed.stop_daemon(host, &handle).await;
                if request.radio_hint.is_some() {
                    testbed
                        .teardown(host, &TeardownScope::Radio(iface.radio_id.clone()))
                        .await;
                }
                return Err(e);
            }
        }
        Ok::<_, WifiError>(handle)
    })
    .await;

    for (host, result) in &results {
        if let Ok(handle) = result {
            println!("{}: station on {} joining '{}'", host.name, handle.interface, config.ssid);
        }
    }
    check_failures(&results)
}

/// Implementation of the 'scan' command
pub async fn cmd_scan(
    ctx: &Context,
    hosts: &str,
    interface: Option<String>,
    ssid: Option<String>,
    output_dir: Option<PathBuf>,
) -> Result<()> {
    let hosts = ctx.hosts(hosts)?;
    let testbed = &ctx.testbed;
    let interface = interface.as_deref();

    let results = on_hosts(&hosts, |host| testbed.scan(host, interface)).await;
    let mut records: Vec<ScanRecord> = results
        .iter()
        .filter_map(|(_, result)| result.as_ref().ok())
        .flatten()
        .cloned()
        .collect();
    if let Some(ssid) = &ssid {
        records = filter_by_ssid(records, ssid);
    }
    sort_by_ssid(&mut records);

    print!("{}", TableExporter.export(&records)?);

    if let Some(dir) = output_dir {
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(scan_file_name(Local::now()));
        CsvExporter::new().export_to_file(&records, &path).await?;
        info!("Wrote {} record(s) to {}", records.len(), path.display());
    }

    check_failures(&results)
}

/// Implementation of the 'teardown' command
pub async fn cmd_teardown(
    ctx: &Context,
    hosts: &str,
    phy: Option<String>,
    reload_driver: bool,
) -> Result<()> {
    let hosts = ctx.hosts(hosts)?;
    let testbed = &ctx.testbed;
    let phy = phy.as_deref();

    let results = on_hosts(&hosts, |host| async move {
        let scope = match phy {
            Some(hint) => TeardownScope::Radio(testbed.resolve_radio(host, hint).await?),
            None => TeardownScope::Host { reload_driver },
        };
        Ok::<_, WifiError>(testbed.teardown(host, &scope).await)
    })
    .await;

    for (host, result) in &results {
        if let Ok(report) = result {
            println!(
                "{}: removed [{}], stopped [{}]{}",
                host.name,
                report.removed_interfaces.join(", "),
                report
                    .killed
                    .iter()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                if report.driver_reloaded { ", driver reloaded" } else { "" }
            );
        }
    }
    check_failures(&results)
}

/// Implementation of the 'kernel' command
pub async fn cmd_kernel(ctx: &Context, hosts: &str, switch: Option<&str>) -> Result<()> {
    let hosts = ctx.hosts(hosts)?;
    let testbed = &ctx.testbed;

    let Some(release) = switch else {
        let results = on_hosts(&hosts, |host| testbed.kernels(host)).await;
        for (host, result) in &results {
            if let Ok(kernels) = result {
                for kernel in kernels {
                    println!("{:<12} {:<10} {}", host.name, kernel.version, kernel.release);
                }
            }
        }
        return check_failures(&results);
    };

    let settings = testbed.settings();
    let poll = &PollConfig::new(settings.poll_interval(), settings.reboot_timeout());
    let results = on_hosts(&hosts, |host| testbed.switch_kernel(host, release, poll)).await;
    for (host, result) in &results {
        if let Ok(running) = result {
            println!("{}: running {}", host.name, running);
        }
    }
    check_failures(&results)
}

/// Options of the 'speed-test' command
#[derive(Clone, Debug)]
pub struct SpeedTest {
    pub ap: String,
    pub sta: String,
    pub phy: String,
    pub ssid: String,
    pub channel: u8,
    pub duration: u64,
    pub traffic: Traffic,
    pub output_dir: PathBuf,
    pub setup: bool,
    pub teardown: bool,
}

/// Implementation of the 'speed-test' command - iperf3 between an access point and a station
pub async fn cmd_speed_test(ctx: &Context, opts: SpeedTest) -> Result<()> {
    let testbed = &ctx.testbed;
    if opts.duration >= testbed.settings().command_timeout_secs {
        bail!(
            "Duration {}s must be shorter than the command timeout ({}s)",
            opts.duration,
            testbed.settings().command_timeout_secs
        );
    }

    let ap = ctx.inventory.resolve_host(&opts.ap);
    let sta = ctx.inventory.resolve_host(&opts.sta);
    let ap_ip = DEFAULT_AP_IP.to_string();
    let clean = TeardownScope::Host {
        reload_driver: false,
    };

    if opts.setup {
        let sta_config = StationConfig::new(&opts.ssid);
        check_station_ip(testbed.station_ip(&sta, &sta_config)?, DEFAULT_AP_IP)?;

        futures::join!(testbed.teardown(&ap, &clean), testbed.teardown(&sta, &clean));

        let ap_iface = testbed
            .acquire(&ap, &AcquireRequest::on_radio(opts.phy.as_str(), Role::Ap))
            .await?;
        testbed
            .start_access_point(&ap, &ap_iface, &AccessPointConfig::new(&opts.ssid, opts.channel))
            .await?;

        let sta_iface = testbed
            .acquire(&sta, &AcquireRequest::on_radio(opts.phy.as_str(), Role::Station))
            .await?;
        testbed.connect(&sta, &sta_iface, &sta_config).await?;
        let poll = PollConfig::from_settings(testbed.settings());
        if let Err(e) = testbed.wait_for_connectivity(&sta, &ap_ip, &poll).await {
            error!("{} never reached {}, tearing down both hosts", sta.name, ap.name);
            futures::join!(testbed.teardown(&ap, &clean), testbed.teardown(&sta, &clean));
            return Err(e.into());
        }
    }

    testbed.start_iperf_server(&ap).await?;
    let report = testbed
        .run_iperf_client(&sta, &ap_ip, opts.traffic, Duration::from_secs(opts.duration))
        .await?;

    let summary = report.summary();
    println!(
        "{} -> {}: {:.2} Mbit/s, {} bytes in {} interval(s)",
        sta.name,
        ap.name,
        summary.mean_bits_per_second / 1e6,
        summary.total_bytes,
        summary.intervals
    );
    if let (Some(lost), Some(jitter)) = (summary.lost_packets, summary.mean_jitter_ms) {
        println!("  lost packets {}, jitter {:.3} ms", lost, jitter);
    }

    tokio::fs::create_dir_all(&opts.output_dir).await?;
    let path = opts
        .output_dir
        .join(iperf_file_name(&ap.name, &sta.name, Local::now()));
    report.save(&path).await?;
    info!("Saved report to {}", path.display());

    if opts.teardown {
        futures::join!(testbed.stop_iperf(&ap), testbed.stop_iperf(&sta));
        futures::join!(testbed.teardown(&ap, &clean), testbed.teardown(&sta, &clean));
    }

    Ok(())
}

/// Resolve a comma separated preset list
fn resolve_presets(names: &str) -> Result<Vec<RadioPreset>> {
    let presets: Vec<RadioPreset> = names
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|name| {
            Presets::radio_preset(name).with_context(|| format!("Unknown radio preset: {}", name))
        })
        .collect::<Result<_>>()?;
    if presets.is_empty() {
        bail!("No radio presets given");
    }
    Ok(presets)
}

/// One row of a sweep result file
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SweepRow {
    pub ap_host: Option<String>,
    pub ap_radio: Option<String>,
    pub channel: Option<u8>,
    pub bssid: String,
    pub ssid: String,
    pub frequency_mhz: Option<u32>,
    pub signal_dbm: Option<f64>,
    pub scanner_host: String,
    pub scanner_interface: String,
}

/// Turn scan records into sweep rows, attributing those with the swept ssid to the access point
fn sweep_rows(
    records: Vec<ScanRecord>,
    ap_host: &str,
    ap_radio: &str,
    preset: &RadioPreset,
    ssid: &str,
    show_all: bool,
) -> Vec<SweepRow> {
    records
        .into_iter()
        .filter(|r| show_all || r.ssid == ssid)
        .map(|r| {
            let ours = r.ssid == ssid;
            SweepRow {
                ap_host: ours.then(|| ap_host.to_string()),
                ap_radio: ours.then(|| ap_radio.to_string()),
                channel: ours.then_some(preset.channel),
                bssid: r.bssid.to_string(),
                ssid: r.ssid,
                frequency_mhz: r.frequency_mhz,
                signal_dbm: r.signal_dbm,
                scanner_host: r.scanner_host,
                scanner_interface: r.scanner_interface,
            }
        })
        .collect()
}

fn write_sweep_csv(rows: &[SweepRow], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Give a radio its plain managed interface back after it served as access point
async fn restore_radio(testbed: &Testbed, host: &Host, radio: &str) {
    testbed
        .teardown(host, &TeardownScope::Radio(radio.to_string()))
        .await;
    if let Err(e) = testbed
        .create_interface(host, radio, InterfaceMode::Managed)
        .await
    {
        warn!("{}: could not recreate managed interface on {}: {}", host.name, radio, e);
    }
}

/// Implementation of the 'sweep' command - scans every radio/preset access point from the other hosts
pub async fn cmd_sweep(
    ctx: &Context,
    hosts: &str,
    presets: &str,
    ssid: &str,
    show_all: bool,
    output_dir: &Path,
) -> Result<()> {
    let hosts = ctx.hosts(hosts)?;
    if hosts.len() < 2 {
        bail!("A sweep needs at least two hosts");
    }
    let presets = resolve_presets(presets)?;
    let testbed = &ctx.testbed;

    let clean = &TeardownScope::Host {
        reload_driver: false,
    };
    join_all(hosts.iter().map(|host| testbed.teardown(host, clean))).await;

    let radios = on_hosts(&hosts, |host| async move {
        let radios: Vec<String> = testbed
            .list_radios(host)
            .await?
            .into_iter()
            .map(|r| r.radio_id)
            .collect();
        testbed
            .create_interfaces(host, Some(radios.clone()), &[InterfaceMode::Managed])
            .await?;
        Ok::<_, WifiError>(radios)
    })
    .await;
    check_failures(&radios)?;

    let mut rows = Vec::new();
    for (server, server_radios) in &radios {
        let Ok(server_radios) = server_radios else {
            continue;
        };
        let scanners: Vec<Host> = hosts
            .iter()
            .filter(|h| h.name != server.name)
            .cloned()
            .collect();

        for radio in server_radios {
            for preset in &presets {
                info!("Access point on {} {} ({})", server.name, radio, preset.name);

                let started: wifi_lifecycle::Result<_> = async {
                    let iface = testbed
                        .acquire(server, &AcquireRequest::on_radio(radio.as_str(), Role::Ap))
                        .await?;
                    testbed
                        .start_access_point(server, &iface, &AccessPointConfig::new(ssid, preset.channel))
                        .await
                }
                .await;
                if let Err(e) = started {
                    warn!("Cannot set up access point on {} {}: {}", server.name, radio, e);
                    restore_radio(testbed, server, radio).await;
                    continue;
                }

                let scans = on_hosts(&scanners, |host| testbed.scan(host, None)).await;
                for (scanner, result) in scans {
                    match result {
                        Ok(records) => {
                            rows.extend(sweep_rows(records, &server.name, radio, preset, ssid, show_all))
                        }
                        Err(e) => warn!("Scan from {} failed: {}", scanner.name, e),
                    }
                }

                restore_radio(testbed, server, radio).await;
            }
        }
    }

    tokio::fs::create_dir_all(output_dir).await?;
    let path = output_dir.join(scan_file_name(Local::now()));
    write_sweep_csv(&rows, &path)?;
    println!("Wrote {} row(s) to {}", rows.len(), path.display());
    Ok(())
}
