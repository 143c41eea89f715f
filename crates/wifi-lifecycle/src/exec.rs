//! Remote command execution
//!
//! Every operation in this crate talks to a node through [`RemoteExecutor`].
//! The trait only knows how to run a command string and upload a file; the
//! failure policy (raise vs warn) and the privilege decision live in
//! [`RemoteExecutor::execute`] so all executors share them.

use async_trait::async_trait;
use inventory::{Host, TestbedSettings};
use std::process::{Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("`{command}` on {host} timed out after {timeout:?}")]
    Timeout {
        host: String,
        command: String,
        timeout: Duration,
    },

    #[error("`{command}` on {host} exited with status {status:?}: {stderr}")]
    NonZero {
        host: String,
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Upload of {path} to {host} failed: {reason}")]
    Upload {
        host: String,
        path: String,
        reason: String,
    },
}

impl ExecError {
    /// Exit status of the remote command, if it ran to completion
    pub fn status(&self) -> Option<i32> {
        match self {
            ExecError::NonZero { status, .. } => *status,
            _ => None,
        }
    }
}

/// A command plus the policy it is run with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    /// Needs root on hosts that require elevation
    pub privileged: bool,
    /// Nonzero exit is logged and returned instead of raised
    pub warn_only: bool,
    /// Output is captured silently rather than logged
    pub hide: bool,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            privileged: false,
            warn_only: false,
            hide: true,
        }
    }

    pub fn sudo(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn warn(mut self) -> Self {
        self.warn_only = true;
        self
    }

    pub fn show(mut self) -> Self {
        self.hide = false;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Capability to run commands on and copy files to testbed nodes
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` on `host` and report how it exited, without judging it
    async fn run(
        &self,
        host: &Host,
        command: &str,
        privileged: bool,
    ) -> Result<CommandOutput, ExecError>;

    /// Write `contents` to `remote_path` on `host`
    async fn upload(&self, host: &Host, remote_path: &str, contents: &str)
        -> Result<(), ExecError>;

    /// Run a command applying its privilege and failure policy
    async fn execute(&self, host: &Host, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let privileged = spec.privileged && host.requires_elevation;
        debug!(host = %host.name, privileged, "Running: {}", spec.command);

        let output = self.run(host, &spec.command, privileged).await?;

        if !spec.hide && !output.stdout.is_empty() {
            info!(host = %host.name, "{}", output.stdout.trim_end());
        }

        if output.success() {
            return Ok(output);
        }

        if spec.warn_only {
            warn!(
                host = %host.name,
                status = ?output.status,
                "Ignoring failure of `{}`: {}",
                spec.command,
                output.stderr.trim()
            );
            return Ok(output);
        }

        Err(ExecError::NonZero {
            host: host.name.clone(),
            command: spec.command.clone(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Quote a string for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn elevate(command: &str, privileged: bool) -> String {
    if privileged {
        format!("sudo -n sh -c {}", shell_quote(command))
    } else {
        command.to_string()
    }
}

async fn output_with_timeout(
    mut cmd: Command,
    host: &Host,
    command: &str,
    program: &str,
    timeout: Duration,
) -> Result<Output, ExecError> {
    cmd.kill_on_drop(true).stdin(Stdio::null());
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => result.map_err(|source| ExecError::Spawn {
            program: program.to_string(),
            source,
        }),
        Err(_) => Err(ExecError::Timeout {
            host: host.name.clone(),
            command: command.to_string(),
            timeout,
        }),
    }
}

/// Executes commands through the system `ssh` client
#[derive(Clone, Debug)]
pub struct SshExecutor {
    options: Vec<String>,
    timeout: Duration,
}

impl SshExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            options: Vec::new(),
            timeout,
        }
    }

    pub fn from_settings(settings: &TestbedSettings) -> Self {
        Self {
            options: settings.ssh_options.clone(),
            timeout: settings.command_timeout(),
        }
    }

    fn command(&self, host: &Host) -> Command {
        let mut cmd = Command::new("ssh");
        for option in &self.options {
            cmd.arg("-o").arg(option);
        }
        if let Some(port) = host.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(host.ssh_destination());
        cmd
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(
        &self,
        host: &Host,
        command: &str,
        privileged: bool,
    ) -> Result<CommandOutput, ExecError> {
        let mut cmd = self.command(host);
        cmd.arg(elevate(command, privileged));
        let output = output_with_timeout(cmd, host, command, "ssh", self.timeout).await?;
        Ok(output.into())
    }

    async fn upload(
        &self,
        host: &Host,
        remote_path: &str,
        contents: &str,
    ) -> Result<(), ExecError> {
        debug!(host = %host.name, "Uploading {} ({} bytes)", remote_path, contents.len());

        let mut cmd = self.command(host);
        cmd.arg(format!("cat > {}", shell_quote(remote_path)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: "ssh".to_string(),
            source,
        })?;

        let upload_failed = |reason: String| ExecError::Upload {
            host: host.name.clone(),
            path: remote_path.to_string(),
            reason,
        };

        let transfer = async {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(contents.as_bytes())
                    .await
                    .map_err(|e| upload_failed(e.to_string()))?;
            }
            child
                .wait_with_output()
                .await
                .map_err(|e| upload_failed(e.to_string()))
        };

        let output = tokio::time::timeout(self.timeout, transfer)
            .await
            .map_err(|_| ExecError::Timeout {
                host: host.name.clone(),
                command: format!("upload {}", remote_path),
                timeout: self.timeout,
            })??;

        if !output.status.success() {
            return Err(upload_failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

/// Executes commands on the machine running this process
///
/// Useful when a node drives its own radios; the host argument only labels
/// log lines and results.
#[derive(Clone, Debug)]
pub struct LocalExecutor {
    timeout: Duration,
}

impl LocalExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn from_settings(settings: &TestbedSettings) -> Self {
        Self::new(settings.command_timeout())
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn run(
        &self,
        host: &Host,
        command: &str,
        privileged: bool,
    ) -> Result<CommandOutput, ExecError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(elevate(command, privileged));
        let output = output_with_timeout(cmd, host, command, "sh", self.timeout).await?;
        Ok(output.into())
    }

    async fn upload(
        &self,
        host: &Host,
        remote_path: &str,
        contents: &str,
    ) -> Result<(), ExecError> {
        debug!(host = %host.name, "Writing {}", remote_path);
        tokio::fs::write(remote_path, contents)
            .await
            .map_err(|e| ExecError::Upload {
                host: host.name.clone(),
                path: remote_path.to_string(),
                reason: e.to_string(),
            })
    }
}
