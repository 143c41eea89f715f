//! Installed kernels and switching the kernel a host boots into

use crate::error::{Result, WifiError};
use crate::exec::CommandSpec;
use crate::poll::{poll_until, PollConfig};
use crate::Testbed;
use inventory::Host;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const KERNEL_LISTING_COMMAND: &str = "ls -1 /boot/vmlinuz-*";

const IMAGE_PREFIX: &str = "/boot/vmlinuz-";

/// A kernel image installed under /boot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kernel {
    /// Numeric part of the release, e.g. `4.15.0`
    pub version: String,
    /// Full release as `uname -r` reports it, e.g. `4.15.0-20-generic`
    pub release: String,
}

impl Kernel {
    fn sort_key(&self) -> Vec<u32> {
        self.version
            .split('.')
            .filter_map(|part| part.parse().ok())
            .collect()
    }
}

/// Parse the /boot image listing, oldest version first
///
/// Lines that are not versioned kernel images are skipped.
pub fn parse_kernel_listing(output: &str) -> Vec<Kernel> {
    let mut kernels: Vec<Kernel> = output
        .lines()
        .filter_map(|line| line.trim().strip_prefix(IMAGE_PREFIX))
        .filter_map(|release| {
            let version = release.split('-').next()?;
            let numeric = !version.is_empty()
                && version
                    .split('.')
                    .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()));
            numeric.then(|| Kernel {
                version: version.to_string(),
                release: release.to_string(),
            })
        })
        .collect();
    kernels.sort_by(|a, b| {
        a.sort_key()
            .cmp(&b.sort_key())
            .then_with(|| a.release.cmp(&b.release))
    });
    kernels
}

impl Testbed {
    pub async fn kernels(&self, host: &Host) -> Result<Vec<Kernel>> {
        let output = self
            .exec(host, CommandSpec::new(KERNEL_LISTING_COMMAND))
            .await?;
        Ok(parse_kernel_listing(&output.stdout))
    }

    /// Point the boot links at `release`, reboot and wait for the host to return
    ///
    /// Returns the release the host runs afterwards.
    pub async fn switch_kernel(
        &self,
        host: &Host,
        release: &str,
        poll: &PollConfig,
    ) -> Result<String> {
        let kernels = self.kernels(host).await?;
        if !kernels.iter().any(|k| k.release == release) {
            return Err(WifiError::InvalidArgument(format!(
                "kernel {} is not installed on {}",
                release, host.name
            )));
        }

        // The previous links may be missing on a fresh install
        for link in ["/vmlinuz", "/initrd.img"] {
            self.best_effort(host, CommandSpec::new(format!("mv {} {}.old", link, link)).sudo())
                .await;
        }
        for (image, link) in [("vmlinuz", "/vmlinuz"), ("initrd.img", "/initrd.img")] {
            self.exec(
                host,
                CommandSpec::new(format!("ln -fs boot/{}-{} {}", image, release, link)).sudo(),
            )
            .await?;
        }

        info!(host = %host.name, "Rebooting into {}", release);
        // The connection usually drops before reboot returns
        self.best_effort(host, CommandSpec::new("reboot").sudo()).await;

        let what = format!("{} to go down", host.name);
        if let Err(e) = poll_until(poll, &what, move || async move {
            !self.succeeds(host, "true").await
        })
        .await
        {
            warn!(host = %host.name, "{}", e);
        }
        self.wait_for_host(host, poll).await?;

        let running = self
            .exec(host, CommandSpec::new("uname -r"))
            .await?
            .stdout
            .trim()
            .to_string();
        if running != release {
            warn!(host = %host.name, "Booted {} instead of {}", running, release);
        } else {
            info!(host = %host.name, "Running {}", running);
        }
        Ok(running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::testing::ScriptedExecutor;
    use inventory::TestbedSettings;
    use std::sync::Arc;
    use std::time::Duration;

    const LISTING: &str = "\
/boot/vmlinuz-4.15.0-20-generic
/boot/vmlinuz-4.4.0-116-generic
/boot/vmlinuz-4.10.0-42-generic
/boot/vmlinuz-rescue
";

    fn fast() -> PollConfig {
        PollConfig::new(Duration::from_millis(5), Duration::from_millis(60))
    }

    fn scripted() -> (Arc<ScriptedExecutor>, Testbed) {
        let executor = Arc::new(ScriptedExecutor::new());
        executor
            .on(KERNEL_LISTING_COMMAND, CommandOutput::ok(LISTING))
            .on("uname -r", CommandOutput::ok("4.10.0-42-generic\n"));
        let testbed = Testbed::new(executor.clone(), TestbedSettings::default());
        (executor, testbed)
    }

    #[test]
    fn test_parse_kernel_listing_sorts_numerically() {
        let kernels = parse_kernel_listing(LISTING);
        let releases: Vec<_> = kernels.iter().map(|k| k.release.as_str()).collect();
        assert_eq!(
            releases,
            ["4.4.0-116-generic", "4.10.0-42-generic", "4.15.0-20-generic"]
        );
        assert_eq!(kernels[0].version, "4.4.0");
        assert!(parse_kernel_listing("ls: cannot access '/boot/vmlinuz-*'\n").is_empty());
    }

    #[tokio::test]
    async fn test_switch_kernel_waits_for_reboot() {
        let (executor, testbed) = scripted();
        // later rules match first: up, then down twice, then up again
        executor
            .once("true", CommandOutput::failed(255, "Connection refused"))
            .once("true", CommandOutput::failed(255, "Connection refused"))
            .once("true", CommandOutput::ok(""));
        let host = Host::new("nuc4");

        let running = testbed
            .switch_kernel(&host, "4.10.0-42-generic", &fast())
            .await
            .unwrap();
        assert_eq!(running, "4.10.0-42-generic");

        let moved = executor.position("mv /vmlinuz /vmlinuz.old").unwrap();
        let linked = executor
            .position("ln -fs boot/vmlinuz-4.10.0-42-generic /vmlinuz")
            .unwrap();
        let initrd = executor
            .position("ln -fs boot/initrd.img-4.10.0-42-generic /initrd.img")
            .unwrap();
        let reboot = executor.position("reboot").unwrap();
        let first_check = executor.position("true").unwrap();
        let uname = executor.position("uname -r").unwrap();
        assert!(moved < linked && linked < initrd && initrd < reboot);
        assert!(reboot < first_check && first_check < uname);
        // one check while still up, two while down, one once back
        assert_eq!(executor.count("true"), 4);
    }

    #[tokio::test]
    async fn test_switch_kernel_rejects_unknown_release() {
        let (executor, testbed) = scripted();
        let err = testbed
            .switch_kernel(&Host::new("nuc4"), "5.0.0-1-generic", &fast())
            .await
            .unwrap_err();
        assert!(matches!(err, WifiError::InvalidArgument(_)));
        assert_eq!(executor.count("ln -fs"), 0);
        assert_eq!(executor.count("reboot"), 0);
    }

    #[tokio::test]
    async fn test_switch_kernel_times_out_when_host_stays_down() {
        let (executor, testbed) = scripted();
        executor.on("true", CommandOutput::failed(255, "No route to host"));

        let err = testbed
            .switch_kernel(&Host::new("nuc4"), "4.15.0-20-generic", &fast())
            .await
            .unwrap_err();
        assert!(matches!(err, WifiError::TimeoutExceeded(..)));
        assert_eq!(executor.count("uname -r"), 0);
    }
}
