use std::{future::Future, pin::Pin, time::Instant};

use serde_json::{json, Value};
use tracing::{info, warn};

use servo_protocol::{reply_requests_cancel, EventKind, ProgressRecord};

use crate::{
    api::{ApiClient, Retries},
    driver::{ProgressFlow, ProgressSink},
};

/// Relays a driver's progress records to the optimization service.
///
/// Progress is best-effort: one retry, and a failed post never stalls the
/// driver. A reply with `status: "cancel"` is the service's only way to
/// stop an in-flight operation, and surfaces as [`ProgressFlow::Cancel`].
///
/// A reporter with no operation event is a no-op, for operations whose
/// progress the service has no use for.
pub struct ProgressReporter<'a> {
    api: &'a mut ApiClient,
    operation: Option<EventKind>,
    started: Instant,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(api: &'a mut ApiClient, operation: Option<EventKind>, started: Instant) -> Self {
        ProgressReporter { api, operation, started }
    }
}

impl ProgressSink for ProgressReporter<'_> {
    fn report<'a>(
        &'a mut self,
        record: &'a ProgressRecord,
    ) -> Pin<Box<dyn Future<Output = ProgressFlow> + Send + 'a>> {
        Box::pin(async move {
            let Some(operation) = self.operation else {
                return ProgressFlow::Continue;
            };

            let mut param = json!({
                "progress": record.progress,
                "runtime": self.started.elapsed().as_secs(),
            });
            insert_opt(&mut param, "message", record.message.as_deref().map(Value::from));
            insert_opt(&mut param, "stage", record.stage.as_deref().map(Value::from));
            insert_opt(&mut param, "stageprogress", record.stageprogress.map(Value::from));
            insert_opt(&mut param, "time_remain", record.time_remain.map(Value::from));

            match self.api.post(operation, param, Retries::Limit(1)).await {
                Ok(reply) if reply_requests_cancel(&reply) => {
                    let reason = reply.get("reason").and_then(Value::as_str).unwrap_or("(none)");
                    info!(operation = %operation, reason, "service cancelled the operation");
                    ProgressFlow::Cancel
                }
                Ok(_) => ProgressFlow::Continue,
                Err(err) => {
                    warn!(operation = %operation, %err, "progress report failed; continuing");
                    ProgressFlow::Continue
                }
            }
        })
    }
}

fn insert_opt(param: &mut Value, key: &str, value: Option<Value>) {
    if let (Some(object), Some(value)) = (param.as_object_mut(), value) {
        object.insert(key.to_string(), value);
    }
}
