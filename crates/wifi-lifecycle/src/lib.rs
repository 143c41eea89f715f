//! Wi-Fi interface lifecycle management for testbed nodes
//!
//! This crate drives the radios of remote nodes through `iw`, `ip`,
//! `hostapd` and `wpa_supplicant`: it resolves physical radios, recreates
//! virtual interfaces, binds access point or station roles to them, scans for
//! networks and tears everything down again between experiment runs.
//!
//! All state lives on the hosts. Every operation takes the host explicitly
//! and re-queries it; nothing about devices or interfaces is cached here.
//! Operations on the same radio must be serialized by the caller.

pub mod ap;
pub mod cleanup;
pub mod device;
pub mod error;
pub mod exec;
pub mod interface;
pub mod kernel;
pub mod measurement;
pub mod poll;
pub mod report;
pub mod scan;
pub mod station;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use ap::{AccessPointConfig, HwMode};
pub use cleanup::{TeardownReport, TeardownScope};
pub use error::{Result, WifiError};
pub use exec::{
    CommandOutput, CommandSpec, ExecError, LocalExecutor, RemoteExecutor, SshExecutor,
};
pub use interface::AcquireRequest;
pub use kernel::Kernel;
pub use measurement::{IperfReport, IperfSummary, Traffic};
pub use poll::PollConfig;
pub use scan::ScanRecord;
pub use station::StationConfig;
pub use types::{
    DaemonHandle, DaemonKind, InterfaceMode, MacAddr, RadioDevice, Role, VirtualInterface,
};

pub use inventory::{Host, Inventory, TestbedSettings};

use std::sync::Arc;
use tracing::warn;

/// Entry point for all radio operations
///
/// Holds the executor used to reach hosts and the settings controlling
/// timing and remote paths. It keeps no per-host state, so one `Testbed`
/// can drive many hosts concurrently.
#[derive(Clone)]
pub struct Testbed {
    executor: Arc<dyn RemoteExecutor>,
    settings: TestbedSettings,
}

impl Testbed {
    pub fn new(executor: Arc<dyn RemoteExecutor>, settings: TestbedSettings) -> Self {
        Self { executor, settings }
    }

    /// Testbed reaching hosts over ssh
    pub fn over_ssh(settings: TestbedSettings) -> Self {
        let executor = Arc::new(SshExecutor::from_settings(&settings));
        Self::new(executor, settings)
    }

    pub fn settings(&self) -> &TestbedSettings {
        &self.settings
    }

    pub fn executor(&self) -> &dyn RemoteExecutor {
        self.executor.as_ref()
    }

    pub(crate) async fn exec(&self, host: &Host, spec: CommandSpec) -> Result<CommandOutput> {
        Ok(self.executor.execute(host, &spec).await?)
    }

    /// Run a cleanup step whose failure must not stop the caller
    ///
    /// Returns `None` when the command could not be run at all.
    pub(crate) async fn best_effort(&self, host: &Host, spec: CommandSpec) -> Option<CommandOutput> {
        match self.executor.execute(host, &spec.warn()).await {
            Ok(output) => Some(output),
            Err(e) => {
                warn!(host = %host.name, "Best-effort step failed: {}", e);
                None
            }
        }
    }
}
