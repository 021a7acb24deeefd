use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// Transport and startup failures.
#[derive(Debug, Error)]
pub enum ServoError {
    #[error("optimization service unavailable: {last}")]
    ServerUnavailable { last: String },
    #[error("failed to read auth token from {path:?}: {source}")]
    AuthToken {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no service URL: provide --url, or an account via --account / OPTUNE_ACCOUNT")]
    MissingAccount,
}

/// Failures raised while running a driver subprocess or interpreting its
/// response.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to spawn driver (binary={binary:?}): {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("internal error: missing stdin pipe")]
    MissingStdin,
    #[error("internal error: missing stdout pipe")]
    MissingStdout,
    #[error("internal error: missing stderr pipe")]
    MissingStderr,
    #[error("failed to encode driver request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed reading driver output: {0}")]
    Read(#[source] io::Error),
    #[error("driver stdout was not valid JSON: {source}: `{line}`")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("driver produced no I/O for {timeout:?}")]
    IoTimeout { timeout: Duration },
    #[error("failed waiting for driver: {0}")]
    Wait(#[source] io::Error),
    #[error("internal error: driver I/O task failed: {0}")]
    Join(String),
    #[error("driver reported status {status}: {}", .message.as_deref().unwrap_or("(no message)"))]
    Failed {
        status: String,
        message: Option<String>,
        reason: Option<String>,
    },
    #[error("measurement produced no metrics")]
    EmptyMetrics,
}
