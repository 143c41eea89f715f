//! Radio and host teardown
//!
//! Every step here is best-effort: failures are logged and the remaining
//! steps still run, so teardown is safe to repeat on an already clean host.

use crate::exec::{shell_quote, CommandSpec};
use crate::types::{DaemonHandle, DaemonKind, VirtualInterface};
use crate::Testbed;
use inventory::Host;
use tracing::{debug, info, warn};

/// What to tear down
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TeardownScope {
    /// Interfaces and daemons bound to one radio
    Radio(String),
    /// Every wireless interface and daemon on the host
    Host { reload_driver: bool },
}

/// What a teardown removed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub removed_interfaces: Vec<String>,
    pub killed: Vec<DaemonKind>,
    pub driver_reloaded: bool,
}

const DAEMONS: [DaemonKind; 2] = [DaemonKind::Hostapd, DaemonKind::WpaSupplicant];

impl Testbed {
    pub async fn teardown(&self, host: &Host, scope: &TeardownScope) -> TeardownReport {
        let mut report = TeardownReport::default();

        for kind in DAEMONS {
            let pattern = match scope {
                TeardownScope::Radio(radio_id) => kind.radio_pattern(radio_id),
                TeardownScope::Host { .. } => kind.process_pattern(),
            };
            if self.kill_matching(host, &pattern).await {
                report.killed.push(kind);
            }
        }

        let interfaces = match self.list_interfaces(host).await {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!(host = %host.name, "Could not enumerate interfaces for teardown: {}", e);
                Vec::new()
            }
        };

        let doomed = interfaces.into_iter().filter(|iface| match scope {
            TeardownScope::Radio(radio_id) => &iface.radio_id == radio_id,
            TeardownScope::Host { .. } => true,
        });
        for VirtualInterface { name, .. } in doomed {
            if self.delete_interface(host, &name).await {
                report.removed_interfaces.push(name);
            }
        }

        if let TeardownScope::Host { reload_driver: true } = scope {
            report.driver_reloaded = self.reload_driver(host).await;
        }

        info!(
            host = %host.name,
            "Teardown of {:?}: removed {:?}, killed {:?}",
            scope, report.removed_interfaces, report.killed
        );
        report
    }

    pub async fn delete_interface(&self, host: &Host, interface: &str) -> bool {
        self.best_effort(
            host,
            CommandSpec::new(format!("iw dev {} del", interface)).sudo(),
        )
        .await
        .map(|output| output.success())
        .unwrap_or(false)
    }

    /// Unload the radio driver stack in reverse dependency order, then load it again
    ///
    /// Unloading may fail for modules that were not loaded. Returns whether
    /// every module loaded again.
    pub async fn reload_driver(&self, host: &Host) -> bool {
        let modules = &self.settings().driver_modules;
        for module in modules.iter().rev() {
            self.best_effort(host, CommandSpec::new(format!("rmmod -f {}", module)).sudo())
                .await;
        }
        let mut loaded = true;
        for module in modules {
            let output = self
                .best_effort(host, CommandSpec::new(format!("modprobe {}", module)).sudo())
                .await;
            loaded &= output.map(|o| o.success()).unwrap_or(false);
        }
        loaded
    }

    /// Stop the daemon behind `handle`; a daemon that already exited is fine
    pub async fn stop_daemon(&self, host: &Host, handle: &DaemonHandle) -> bool {
        let killed = self
            .kill_matching(host, &handle.kind.pid_pattern(&handle.pid_file))
            .await;
        self.best_effort(
            host,
            CommandSpec::new(format!("rm -f {}", shell_quote(&handle.pid_file))).sudo(),
        )
        .await;
        killed
    }

    /// `pkill -f` the processes matching `pattern`, returning whether any were found
    pub(crate) async fn kill_matching(&self, host: &Host, pattern: &str) -> bool {
        let output = self
            .best_effort(
                host,
                CommandSpec::new(format!("pkill -f {}", shell_quote(pattern))).sudo(),
            )
            .await;
        let killed = output.map(|o| o.success()).unwrap_or(false);
        debug!(host = %host.name, pattern, killed, "pkill");
        killed
    }
}
