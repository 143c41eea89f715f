//! Wi-Fi testbed CLI tool
//!
//! Provisions radios on testbed nodes over ssh: access points, stations,
//! scans and teardown, plus the throughput and scan sweep experiments built
//! on top of them.

mod commands;

use anyhow::Result;
use clap::{ArgGroup, Args, Parser, Subcommand};
use commands::{
    cmd_ap, cmd_connect, cmd_interfaces, cmd_kernel, cmd_list, cmd_radios, cmd_resolve,
    cmd_scan, cmd_speed_test, cmd_sweep, cmd_teardown, Context,
};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use wifi_lifecycle::measurement::Traffic;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Inventory file (JSON) with hosts and testbed settings
    #[arg(short, long, global = true)]
    inventory: Option<PathBuf>,

    /// Run commands on this machine instead of over ssh
    #[arg(long, global = true)]
    local: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Which interface an operation works on
#[derive(Args, Clone, Debug)]
#[command(group(ArgGroup::new("target").required(true).args(["phy", "interface"])))]
pub struct Target {
    /// Radio name or PCI bus address; the radio gets a fresh interface
    #[arg(long)]
    pub phy: Option<String>,

    /// Existing interface to use as is
    #[arg(long)]
    pub interface: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List inventory hosts, settings and radio presets
    List,

    /// Show the radios of each host
    Radios {
        /// Comma separated host list
        #[arg(short = 'H', long)]
        hosts: String,

        /// Include `iw phy` capabilities
        #[arg(long)]
        details: bool,
    },

    /// Resolve a radio name or bus address to a radio id
    Resolve {
        #[arg(short = 'H', long)]
        hosts: String,

        /// Substring of the radio listing, e.g. `phy1` or `03:00`
        hint: String,
    },

    /// List wireless interfaces with their radio and mode
    Interfaces {
        #[arg(short = 'H', long)]
        hosts: String,
    },

    /// Start an access point
    Ap {
        #[arg(short = 'H', long)]
        host: String,

        #[command(flatten)]
        target: Target,

        #[arg(long, default_value = "experiment")]
        ssid: String,

        #[arg(long, default_value_t = 1)]
        channel: u8,

        /// WPA2 passphrase; open network when omitted
        #[arg(long)]
        passphrase: Option<String>,

        /// Access point address (/24)
        #[arg(long, default_value = "10.1.1.1")]
        ip: String,
    },

    /// Connect stations to an access point
    Connect {
        #[arg(short = 'H', long)]
        hosts: String,

        #[command(flatten)]
        target: Target,

        #[arg(long, default_value = "experiment")]
        ssid: String,

        #[arg(long)]
        passphrase: Option<String>,

        /// Station address; derived from the host name when omitted
        #[arg(long)]
        ip: Option<String>,

        /// Wait until this address answers pings
        #[arg(long)]
        wait_for: Option<String>,
    },

    /// Scan for networks
    Scan {
        #[arg(short = 'H', long)]
        hosts: String,

        /// Scan only from this interface
        #[arg(long)]
        interface: Option<String>,

        /// Only report networks with this ssid
        #[arg(long)]
        ssid: Option<String>,

        /// Also write the results as CSV to this directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Remove interfaces and daemons
    Teardown {
        #[arg(short = 'H', long)]
        hosts: String,

        /// Only this radio; every radio when omitted
        #[arg(long, conflicts_with = "reload_driver")]
        phy: Option<String>,

        /// Reload the radio driver modules afterwards
        #[arg(long)]
        reload_driver: bool,
    },

    /// List installed kernels or reboot hosts into another one
    Kernel {
        #[arg(short = 'H', long)]
        hosts: String,

        /// Release to boot into, e.g. `4.15.0-20-generic`
        #[arg(long)]
        switch: Option<String>,
    },

    /// Measure throughput between an access point and a station with iperf3
    SpeedTest {
        #[arg(long)]
        ap: String,

        #[arg(long)]
        sta: String,

        /// Radio used on both hosts
        #[arg(long, default_value = "phy0")]
        phy: String,

        #[arg(long, default_value = "experiment")]
        ssid: String,

        #[arg(long, default_value_t = 11)]
        channel: u8,

        /// Test duration in seconds
        #[arg(short = 't', long, default_value_t = 20)]
        duration: u64,

        #[arg(long, default_value = "udp")]
        traffic: Traffic,

        /// Directory for the iperf3 report
        #[arg(long, default_value = "data")]
        output_dir: PathBuf,

        /// Keep the existing network instead of setting it up
        #[arg(long)]
        no_setup: bool,

        /// Tear the network down afterwards
        #[arg(long)]
        teardown: bool,
    },

    /// Bring up an access point on every radio and preset in turn and scan it from the other hosts
    Sweep {
        #[arg(short = 'H', long)]
        hosts: String,

        /// Comma separated radio presets
        #[arg(long, default_value = "2.4ghz,5ghz")]
        presets: String,

        #[arg(long, default_value = "experiment")]
        ssid: String,

        /// Keep networks other than the swept access point
        #[arg(long)]
        show_all: bool,

        #[arg(long, default_value = "data")]
        output_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let ctx = Context::load(cli.inventory.as_deref(), cli.local)?;

    match cli.command {
        Commands::List => {
            cmd_list(&ctx).await?;
        }
        Commands::Radios { hosts, details } => {
            cmd_radios(&ctx, &hosts, details).await?;
        }
        Commands::Resolve { hosts, hint } => {
            cmd_resolve(&ctx, &hosts, &hint).await?;
        }
        Commands::Interfaces { hosts } => {
            cmd_interfaces(&ctx, &hosts).await?;
        }
        Commands::Ap {
            host,
            target,
            ssid,
            channel,
            passphrase,
            ip,
        } => {
            cmd_ap(&ctx, &host, &target, ssid, channel, passphrase, &ip).await?;
        }
        Commands::Connect {
            hosts,
            target,
            ssid,
            passphrase,
            ip,
            wait_for,
        } => {
            cmd_connect(&ctx, &hosts, &target, ssid, passphrase, ip, wait_for).await?;
        }
        Commands::Scan {
            hosts,
            interface,
            ssid,
            output_dir,
        } => {
            cmd_scan(&ctx, &hosts, interface, ssid, output_dir).await?;
        }
        Commands::Teardown {
            hosts,
            phy,
            reload_driver,
        } => {
            cmd_teardown(&ctx, &hosts, phy, reload_driver).await?;
        }
        Commands::Kernel { hosts, switch } => {
            cmd_kernel(&ctx, &hosts, switch.as_deref()).await?;
        }
        Commands::SpeedTest {
            ap,
            sta,
            phy,
            ssid,
            channel,
            duration,
            traffic,
            output_dir,
            no_setup,
            teardown,
        } => {
            cmd_speed_test(
                &ctx,
                commands::SpeedTest {
                    ap,
                    sta,
                    phy,
                    ssid,
                    channel,
                    duration,
                    traffic,
                    output_dir,
                    setup: !no_setup,
                    teardown,
                },
            )
            .await?;
        }
        Commands::Sweep {
            hosts,
            presets,
            ssid,
            show_all,
            output_dir,
        } => {
            cmd_sweep(&ctx, &hosts, &presets, &ssid, show_all, &output_dir).await?;
        }
    }

    Ok(())
}
