use serde_json::Value;

/// Driver/service status token for a successful operation.
pub const OK_STATUS: &str = "ok";
/// Status reported when a driver produced no final response line.
pub const NODATA_STATUS: &str = "nodata";
/// Status in a service reply that requests the in-flight operation stop.
pub const CANCEL_STATUS: &str = "cancel";

/// Agent-originated event names, as they appear on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EventKind {
    Hello,
    Goodbye,
    WhatsNext,
    Description,
    Measurement,
    Adjustment,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Hello => "HELLO",
            EventKind::Goodbye => "GOODBYE",
            EventKind::WhatsNext => "WHATS_NEXT",
            EventKind::Description => "DESCRIPTION",
            EventKind::Measurement => "MEASUREMENT",
            EventKind::Adjustment => "ADJUSTMENT",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `status` field of a response object, defaulting to [`NODATA_STATUS`]
/// when absent or not a string.
pub fn status_of(value: &Value) -> &str {
    value
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or(NODATA_STATUS)
}

/// Whether a service reply asks the agent to cancel the running operation.
pub fn reply_requests_cancel(reply: &Value) -> bool {
    reply.get("status").and_then(Value::as_str) == Some(CANCEL_STATUS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_defaults_to_nodata() {
        assert_eq!(status_of(&json!({})), NODATA_STATUS);
        assert_eq!(status_of(&json!({"status": 3})), NODATA_STATUS);
        assert_eq!(status_of(&json!({"status": "ok"})), OK_STATUS);
    }

    #[test]
    fn cancel_is_recognized_only_on_exact_status() {
        assert!(reply_requests_cancel(&json!({"status": "cancel", "reason": "user stop"})));
        assert!(!reply_requests_cancel(&json!({"status": "ok"})));
        assert!(!reply_requests_cancel(&json!({"reason": "cancel"})));
    }
}
