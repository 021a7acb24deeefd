use std::sync::atomic::{AtomicU8, Ordering};

use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    time,
};
use tracing::{debug, info, warn};

use servo_protocol::{sleep_duration, Command, CommandKind, EventKind, OK_STATUS};

use crate::{
    api::{ApiClient, Retries},
    config::Config,
    error::ServoError,
    ops::failure_param,
};

const GOODBYE_RETRIES: u32 = 3;

const STOP_NONE: u8 = 0;
const STOP_EXIT: u8 = 1;
const STOP_RESTART: u8 = 2;

/// Written by signal listeners, read by the command loop at iteration
/// boundaries. The transition away from "keep running" is monotonic: the
/// first request wins.
static STOP_FLAG: AtomicU8 = AtomicU8::new(STOP_NONE);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StopMode {
    Exit,
    Restart,
}

pub fn request_stop(mode: StopMode) {
    let value = match mode {
        StopMode::Exit => STOP_EXIT,
        StopMode::Restart => STOP_RESTART,
    };
    let _ = STOP_FLAG.compare_exchange(STOP_NONE, value, Ordering::SeqCst, Ordering::SeqCst);
}

pub fn stop_requested() -> Option<StopMode> {
    match STOP_FLAG.load(Ordering::SeqCst) {
        STOP_EXIT => Some(StopMode::Exit),
        STOP_RESTART => Some(StopMode::Restart),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn clear_stop() {
    STOP_FLAG.store(STOP_NONE, Ordering::SeqCst);
}

/// The agent: asks the service what to do next, runs the matching driver,
/// and posts the result, forever.
pub struct Agent {
    pub(crate) config: Config,
    pub(crate) api: ApiClient,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        let api = ApiClient::new(config.url.clone(), config.token.clone(), config.retry_delay);
        Agent { config, api }
    }

    pub async fn hello(&mut self) -> Result<(), ServoError> {
        let identifier = format!("{}/{}", self.config.agent, env!("CARGO_PKG_VERSION"));
        info!(agent = identifier, app_id = self.config.app_id, "announcing");
        self.api
            .post(EventKind::Hello, json!({ "agent": identifier }), Retries::Forever)
            .await?;
        Ok(())
    }

    /// Best-effort farewell; a service that cannot be reached within a few
    /// retries does not hold up shutdown.
    pub async fn goodbye(&mut self) {
        if let Err(err) = self
            .api
            .post(EventKind::Goodbye, Value::Null, Retries::Limit(GOODBYE_RETRIES))
            .await
        {
            warn!(%err, "could not deliver GOODBYE");
        }
    }

    /// The command loop. Returns only when a stop was requested; individual
    /// command failures are posted to the service and never break the loop.
    pub async fn run(&mut self) -> Result<StopMode, ServoError> {
        loop {
            if let Some(mode) = stop_requested() {
                info!(?mode, "stop requested; leaving the command loop");
                return Ok(mode);
            }

            let reply = self
                .api
                .post(EventKind::WhatsNext, Value::Null, Retries::Forever)
                .await?;
            let command = Command::from_reply(reply);

            let Some(token) = command.cmd.as_deref() else {
                warn!("service reply carried no command; waiting before asking again");
                time::sleep(self.config.retry_delay).await;
                continue;
            };
            let Some(kind) = command.kind() else {
                warn!(cmd = token, "unknown command; skipping");
                continue;
            };

            debug!(cmd = token, "dispatching");
            match kind {
                CommandKind::Sleep => {
                    if self.config.interactive {
                        debug!("interactive mode; ignoring SLEEP");
                    } else {
                        let duration = sleep_duration(&command.param);
                        info!(seconds = duration.as_secs(), "sleeping as instructed");
                        time::sleep(duration).await;
                    }
                }
                kind => self.dispatch(kind, &command.param).await?,
            }

            self.pause().await;
        }
    }

    /// Runs one DESCRIBE/MEASURE/ADJUST command end to end: environment
    /// preflight when requested, the operation itself, and the result post.
    async fn dispatch(&mut self, kind: CommandKind, param: &Value) -> Result<(), ServoError> {
        let event = match kind {
            CommandKind::Describe => EventKind::Description,
            CommandKind::Measure => EventKind::Measurement,
            CommandKind::Adjust => EventKind::Adjustment,
            CommandKind::Sleep => unreachable!("SLEEP is handled by the loop"),
        };

        let wants_environment = param
            .pointer("/control/environment")
            .is_some_and(|env| !env.is_null());
        if wants_environment {
            if let Err(err) = self.environment(param).await {
                warn!(%err, "environment preflight failed; not running the command");
                let mut result = failure_param(&err);
                result["status"] = json!("environment-mismatch");
                self.api.post(event, result, Retries::Forever).await?;
                return Ok(());
            }
        }

        let outcome = match kind {
            CommandKind::Describe => self.describe().await.map(|descriptor| {
                json!({ "status": OK_STATUS, "descriptor": descriptor })
            }),
            CommandKind::Measure => self.measure(param).await.map(|mut result| {
                result["status"] = json!(OK_STATUS);
                result
            }),
            CommandKind::Adjust => self.adjust(param).await,
            CommandKind::Sleep => unreachable!("SLEEP is handled by the loop"),
        };

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                warn!(event = %event, %err, "operation failed");
                failure_param(&err)
            }
        };
        self.api.post(event, result, Retries::Forever).await?;
        Ok(())
    }

    async fn pause(&self) {
        if self.config.interactive {
            print!("servo> press Enter for the next command: ");
            let _ = std::io::Write::flush(&mut std::io::stdout());
            let mut line = String::new();
            let _ = BufReader::new(tokio::io::stdin()).read_line(&mut line).await;
        } else if let Some(delay) = self.config.delay {
            time::sleep(delay).await;
        }
    }
}
