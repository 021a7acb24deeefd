use super::*;

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use servo_protocol::EventKind;

mod support;
use support::*;
