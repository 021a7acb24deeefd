use serde::Deserialize;
use serde_json::Value;

/// Interim record streamed by a driver before its final response.
///
/// `progress` is the only discriminating field; everything else is optional
/// and forwarded to the service when present.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressRecord {
    pub progress: u64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub stageprogress: Option<u64>,
    #[serde(default)]
    pub time_remain: Option<u64>,
}

/// Classification of one driver stdout line.
#[derive(Debug, Clone)]
pub enum DriverLine {
    Progress(ProgressRecord),
    Final(Value),
}

impl DriverLine {
    /// Parses a single stdout line.
    ///
    /// Returns `Ok(None)` for blank lines; any other line must be one
    /// complete JSON object. An object with a `progress` key is an interim
    /// record, anything else is a final response.
    pub fn parse(line: &str) -> Result<Option<DriverLine>, serde_json::Error> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            return Ok(None);
        }

        let value: Value = serde_json::from_str(line)?;
        if value.get("progress").is_some() {
            let record: ProgressRecord = serde_json::from_value(value)?;
            Ok(Some(DriverLine::Progress(record)))
        } else {
            Ok(Some(DriverLine::Final(value)))
        }
    }
}

/// Metadata printed by `driver --info <app_id>`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DriverInfo {
    #[serde(default)]
    pub has_cancel: bool,
}
