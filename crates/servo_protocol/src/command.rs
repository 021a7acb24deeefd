use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

/// Sleep length used when a SLEEP command carries no parsable duration.
pub const DEFAULT_SLEEP: Duration = Duration::from_secs(120);

/// The service-originated directives the agent knows how to execute.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CommandKind {
    Describe,
    Measure,
    Adjust,
    Sleep,
}

impl CommandKind {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "DESCRIBE" => Some(CommandKind::Describe),
            "MEASURE" => Some(CommandKind::Measure),
            "ADJUST" => Some(CommandKind::Adjust),
            "SLEEP" => Some(CommandKind::Sleep),
            _ => None,
        }
    }
}

/// A lenient view over a `WHATS_NEXT` reply.
///
/// The raw `cmd` token is kept so unknown commands can be logged and skipped
/// instead of failing deserialization.
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub param: Value,
}

impl Command {
    pub fn from_reply(reply: Value) -> Self {
        serde_json::from_value(reply).unwrap_or(Command { cmd: None, param: Value::Null })
    }

    pub fn kind(&self) -> Option<CommandKind> {
        self.cmd.as_deref().and_then(CommandKind::from_token)
    }
}

/// Reads `param.duration` as whole seconds; any shape mismatch falls back to
/// [`DEFAULT_SLEEP`].
pub fn sleep_duration(param: &Value) -> Duration {
    param
        .get("duration")
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SLEEP)
}
