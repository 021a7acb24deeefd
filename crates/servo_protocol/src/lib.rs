#![forbid(unsafe_code)]
//! Wire vocabulary shared by the servo agent and its tests.
//!
//! Two protocols meet in the agent and both are defined here:
//! - the **service protocol**: `{event, param}` envelopes posted to the
//!   optimization service and the `{cmd, param}` commands it hands back, and
//! - the **driver protocol**: one JSON object per stdout line, where a
//!   `progress` key marks an interim record and any other object is the
//!   driver's final response.
//!
//! Everything the agent treats as opaque stays a [`serde_json::Value`].

mod command;
mod driver;
mod event;

pub use command::{sleep_duration, Command, CommandKind, DEFAULT_SLEEP};
pub use driver::{DriverInfo, DriverLine, ProgressRecord};
pub use event::{reply_requests_cancel, status_of, EventKind, CANCEL_STATUS, NODATA_STATUS, OK_STATUS};
