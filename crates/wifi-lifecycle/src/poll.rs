//! Bounded polling for conditions that settle asynchronously on a host

use crate::error::{Result, WifiError};
use crate::Testbed;
use inventory::{Host, TestbedSettings};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn from_settings(settings: &TestbedSettings) -> Self {
        Self::new(settings.poll_interval(), settings.connect_timeout())
    }
}

/// Re-run `check` every `config.interval` until it returns true
///
/// Fails with [`WifiError::TimeoutExceeded`] once `config.timeout` has passed.
/// `check` always runs at least once.
pub async fn poll_until<F, Fut>(config: &PollConfig, what: &str, mut check: F) -> Result<u32>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + config.timeout;
    let mut attempts = 0;
    loop {
        attempts += 1;
        if check().await {
            debug!("{} after {} attempt(s)", what, attempts);
            return Ok(attempts);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(WifiError::TimeoutExceeded(config.timeout, what.to_string()));
        }
        tokio::time::sleep(config.interval.min(deadline - now)).await;
    }
}

impl Testbed {
    /// Wait until `host` can ping `target`
    ///
    /// This is how a station's association is confirmed.
    pub async fn wait_for_connectivity(
        &self,
        host: &Host,
        target: &str,
        poll: &PollConfig,
    ) -> Result<()> {
        let ping = format!("ping -c 1 -W 1 {}", target);
        let command = ping.as_str();
        let what = format!("{} to reach {}", host.name, target);
        match poll_until(poll, &what, move || self.succeeds(host, command)).await {
            Ok(_) => {
                info!(host = %host.name, "Reached {}", target);
                Ok(())
            }
            Err(WifiError::TimeoutExceeded(waited, _)) => Err(WifiError::ConnectionFailed {
                host: host.name.clone(),
                target: target.to_string(),
                waited,
            }),
            Err(e) => Err(e),
        }
    }

    /// Wait until `host` accepts commands again, e.g. after a reboot
    pub async fn wait_for_host(&self, host: &Host, poll: &PollConfig) -> Result<()> {
        let what = format!("{} to accept commands", host.name);
        poll_until(poll, &what, move || self.succeeds(host, "true")).await?;
        Ok(())
    }

    // Runs without `execute` so expected failures are not logged as warnings
    pub(crate) async fn succeeds(&self, host: &Host, command: &str) -> bool {
        matches!(self.executor.run(host, command, false).await, Ok(output) if output.success())
    }
}
