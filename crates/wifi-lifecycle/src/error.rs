//! Error types for radio provisioning

use crate::exec::ExecError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WifiError {
    #[error("Could not find radio matching '{0}'")]
    DeviceNotFound(String),

    #[error("No such interface ({0})")]
    NoSuchInterface(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Access point daemon failed to start on {interface} (exit status {status:?}): {stderr}")]
    DaemonStart {
        interface: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("{host} did not reach {target} within {waited:?}")]
    ConnectionFailed {
        host: String,
        target: String,
        waited: Duration,
    },

    #[error("Timed out after {0:?} waiting for {1}")]
    TimeoutExceeded(Duration, String),

    #[error("iperf3 reported an error: {0}")]
    Iperf(String),

    #[error("Unexpected tool output: {0}")]
    Parse(String),

    #[error("Remote command failed: {0}")]
    Exec(#[from] ExecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, WifiError>;
