#![forbid(unsafe_code)]
//! Long-running optimization agent.
//!
//! The agent polls a remote optimization service for commands (describe the
//! application, adjust its settings, measure its performance, sleep),
//! executes each one by driving a local driver executable over pipes, and
//! posts the result back. Drivers speak a line-oriented JSON protocol on
//! stdout: any number of interim `{"progress": …}` records followed by one
//! final response object. Progress is relayed to the service as it arrives,
//! and the service's reply to a progress post is the channel through which
//! it can cancel the in-flight operation.
//!
//! The loop is strictly sequential: one command, one driver subprocess, one
//! result at a time. It runs until a signal asks it to stop (`SIGUSR1`) or
//! restart (`SIGHUP`).

mod agent;
mod api;
mod config;
mod driver;
mod error;
mod ops;
mod progress;

pub use agent::{request_stop, stop_requested, Agent, StopMode};
pub use api::{ApiClient, Retries};
pub use config::{Config, Opts, StderrVerbosity, DEFAULT_RETRY_DELAY};
pub use driver::{
    DriverInput, DriverOutcome, DriverRunner, ProgressFlow, ProgressSink, DRIVER_EXIT_TIMEOUT,
};
pub use error::{DriverError, ServoError};
pub use progress::ProgressReporter;

#[cfg(test)]
mod tests;
