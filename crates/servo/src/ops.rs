use std::{path::Path, time::Instant};

use serde_json::{json, Map, Value};
use tracing::debug;

use servo_protocol::EventKind;

use crate::{
    agent::Agent,
    driver::{DriverInput, DriverRunner},
    error::DriverError,
    progress::ProgressReporter,
};

/// Legacy alias: services predating the `perf` metric still expect it to
/// mirror `requests throughput`.
const THROUGHPUT_METRIC: &str = "requests throughput";
const PERF_METRIC: &str = "perf";

impl Agent {
    fn runner(&self, binary: &Path) -> DriverRunner {
        DriverRunner::new(
            binary.to_path_buf(),
            self.config.app_id.clone(),
            self.config.io_timeout,
            self.config.stderr_verbosity,
        )
    }

    /// Preflight check: feeds the command's param to the environment driver
    /// and fails unless it reports ok.
    pub(crate) async fn environment(&mut self, param: &Value) -> Result<Value, DriverError> {
        let runner = self.runner(&self.config.environment_driver);
        runner
            .run(DriverInput::Payload(param.clone()), None)
            .await?
            .into_result()
    }

    /// Combines the adjust driver's `--query` view of the application with
    /// the measure driver's `--describe` metric catalog.
    pub(crate) async fn describe(&mut self) -> Result<Value, DriverError> {
        let query = self
            .runner(&self.config.adjust_driver)
            .run(DriverInput::Flag("--query"), None)
            .await?
            .into_descriptor()?;
        let catalog = self
            .runner(&self.config.measure_driver)
            .run(DriverInput::Flag("--describe"), None)
            .await?
            .into_descriptor()?;

        let mut metrics = catalog.get("metrics").cloned().unwrap_or_else(|| json!({}));
        if let (Some(metrics), Some(extra)) = (
            metrics.as_object_mut(),
            query.get("metrics").and_then(Value::as_object),
        ) {
            for (name, value) in extra {
                metrics.insert(name.clone(), value.clone());
            }
        }
        alias_perf(&mut metrics);

        let mut descriptor = json!({
            "application": query.get("application").cloned().unwrap_or_else(|| json!({})),
            "measurement": { "metrics": metrics },
        });
        if let Some(expr) = &self.config.perf_expr {
            descriptor["optimization"] = json!({ "perf": expr });
        }
        Ok(descriptor)
    }

    /// Runs the measure driver with the service's request, streaming its
    /// progress back as MEASUREMENT events.
    pub(crate) async fn measure(&mut self, param: &Value) -> Result<Value, DriverError> {
        let runner = self.runner(&self.config.measure_driver);
        let mut reporter =
            ProgressReporter::new(&mut self.api, Some(EventKind::Measurement), Instant::now());
        let response = runner
            .run(DriverInput::Payload(param.clone()), Some(&mut reporter))
            .await?
            .into_result()?;

        let mut metrics = response.get("metrics").cloned().unwrap_or(Value::Null);
        if !matches!(&metrics, Value::Object(map) if !map.is_empty()) {
            return Err(DriverError::EmptyMetrics);
        }
        alias_perf(&mut metrics);

        let mut result = json!({ "metrics": metrics });
        if let Some(annotations) = response.get("annotations") {
            result["annotations"] = annotations.clone();
        }
        Ok(result)
    }

    /// Merges the requested state with its control section, hands the
    /// result to the adjust driver, and returns the driver's response.
    pub(crate) async fn adjust(&mut self, param: &Value) -> Result<Value, DriverError> {
        let mut payload = match param.get("state").and_then(Value::as_object) {
            Some(state) => state.clone(),
            None => Map::new(),
        };
        if let Some(control) = param.get("control") {
            payload.insert("control".to_string(), control.clone());
        }

        let runner = self.runner(&self.config.adjust_driver);
        let mut reporter =
            ProgressReporter::new(&mut self.api, Some(EventKind::Adjustment), Instant::now());
        let mut response = runner
            .run(DriverInput::Payload(Value::Object(payload)), Some(&mut reporter))
            .await?
            .into_result()?;

        if let Some(object) = response.as_object_mut() {
            if !object.contains_key("state") {
                if let Some(state) = param.get("state") {
                    debug!("adjust driver returned no state; echoing the requested one");
                    object.insert("state".to_string(), state.clone());
                }
            }
        }
        Ok(response)
    }
}

/// Mirrors `requests throughput` as `perf` when the latter is absent.
pub(crate) fn alias_perf(metrics: &mut Value) {
    let Some(map) = metrics.as_object_mut() else { return };
    if map.contains_key(PERF_METRIC) {
        return;
    }
    if let Some(value) = map.get(THROUGHPUT_METRIC).cloned() {
        map.insert(PERF_METRIC.to_string(), value);
    }
}

/// The JSON posted to the service when an operation fails: a driver's own
/// status/message/reason verbatim, or a generic `failed` envelope.
pub(crate) fn failure_param(err: &DriverError) -> Value {
    match err {
        DriverError::Failed { status, message, reason } => {
            let mut param = json!({ "status": status });
            if let Some(message) = message {
                param["message"] = json!(message);
            }
            if let Some(reason) = reason {
                param["reason"] = json!(reason);
            }
            param
        }
        other => json!({ "status": "failed", "message": other.to_string() }),
    }
}
