use std::{
    future::Future,
    path::PathBuf,
    pin::Pin,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::mpsc,
    time,
};
use tracing::{debug, warn};

use servo_protocol::{status_of, DriverInfo, DriverLine, ProgressRecord, NODATA_STATUS, OK_STATUS};

use crate::{config::StderrVerbosity, error::DriverError};

/// How long a driver gets to exit after closing its pipes before it is
/// killed.
pub const DRIVER_EXIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest slice written to a driver's stdin in one call; the conservative
/// atomic-pipe-write size, so a slow reader never observes a torn request.
const STDIN_CHUNK: usize = 512;

/// Hard cap on stderr folded into a failure message, marker included.
const STDERR_CAP: usize = 2 * 1024 * 1024;
const TRUNCATION_MARKER: &str = "\n... (truncated)";

/// What a driver is invoked with: a JSON request fed to stdin, or a query
/// flag (`--describe` / `--query`) with no stdin at all.
#[derive(Debug, Clone)]
pub enum DriverInput {
    Payload(Value),
    Flag(&'static str),
}

/// Outcome of delivering one progress record to the service.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProgressFlow {
    Continue,
    Cancel,
}

/// Receives interim records as the driver emits them.
///
/// The method returns a boxed future so the runner can hold the sink as a
/// trait object while the sink performs async work; the agent's sink posts
/// each record to the optimization service.
pub trait ProgressSink: Send {
    fn report<'a>(
        &'a mut self,
        record: &'a ProgressRecord,
    ) -> Pin<Box<dyn Future<Output = ProgressFlow> + Send + 'a>>;
}

/// A driver invocation's final response paired with the exit status, before
/// any ok/failure policy is applied.
#[derive(Debug, Clone)]
pub struct DriverOutcome {
    pub response: Value,
    pub exit: ExitStatus,
}

impl DriverOutcome {
    /// Accepts the response only on a clean exit with `status == "ok"`;
    /// anything else becomes a structured [`DriverError::Failed`] carrying
    /// the driver's own status, message, and reason.
    pub fn into_result(self) -> Result<Value, DriverError> {
        if self.exit.success() && status_of(&self.response) == OK_STATUS {
            return Ok(self.response);
        }
        Err(self.into_failure())
    }

    /// Accepts the response on any clean exit. Query-form invocations
    /// (`--describe`, `--query`) print bare descriptors with no `status`
    /// field, so only the exit code carries the verdict.
    pub fn into_descriptor(self) -> Result<Value, DriverError> {
        if self.exit.success() {
            return Ok(self.response);
        }
        Err(self.into_failure())
    }

    fn into_failure(self) -> DriverError {
        let status = match status_of(&self.response) {
            OK_STATUS => "failed".to_string(),
            other => other.to_string(),
        };
        DriverError::Failed {
            status,
            message: self
                .response
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            reason: self
                .response
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

enum PipeEvent {
    Stdout(String),
    Stderr(Vec<u8>),
    ReadFailed(std::io::Error),
}

/// Runs one driver executable for one application.
///
/// The wire contract: `--info` prints one JSON metadata object; a run
/// invocation streams zero or more progress lines and at most one final
/// response line on stdout, with free-form diagnostics on stderr.
pub struct DriverRunner {
    binary: PathBuf,
    app_id: String,
    io_timeout: Option<Duration>,
    exit_timeout: Duration,
    stderr_verbosity: StderrVerbosity,
}

impl DriverRunner {
    pub fn new(
        binary: PathBuf,
        app_id: String,
        io_timeout: Option<Duration>,
        stderr_verbosity: StderrVerbosity,
    ) -> Self {
        DriverRunner {
            binary,
            app_id,
            io_timeout,
            exit_timeout: DRIVER_EXIT_TIMEOUT,
            stderr_verbosity,
        }
    }

    pub fn with_exit_timeout(mut self, timeout: Duration) -> Self {
        self.exit_timeout = timeout;
        self
    }

    /// Runs `<binary> --info <app_id>` to completion and parses its stdout.
    ///
    /// Output that does not parse degrades to the defaults: losing
    /// cooperative cancel support is recoverable, losing the operation is
    /// not.
    pub async fn probe_info(&self) -> Result<DriverInfo, DriverError> {
        let output = Command::new(&self.binary)
            .arg("--info")
            .arg(&self.app_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| DriverError::Spawn { binary: self.binary.clone(), source })?;

        match serde_json::from_slice(&output.stdout) {
            Ok(info) => Ok(info),
            Err(err) => {
                debug!(binary = ?self.binary, %err, "unusable --info output; assuming no cancel support");
                Ok(DriverInfo::default())
            }
        }
    }

    /// Spawns the driver, feeds it the input, relays progress records to
    /// the sink, and returns the final response with the exit status.
    pub async fn run(
        &self,
        input: DriverInput,
        mut progress: Option<&mut dyn ProgressSink>,
    ) -> Result<DriverOutcome, DriverError> {
        let info = self.probe_info().await?;

        let mut command = Command::new(&self.binary);
        if let DriverInput::Flag(flag) = &input {
            command.arg(flag);
        }
        command
            .arg(&self.app_id)
            .stdin(if matches!(input, DriverInput::Payload(_)) {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|source| DriverError::Spawn { binary: self.binary.clone(), source })?;

        let stdin_task = match &input {
            DriverInput::Payload(request) => {
                let stdin = child.stdin.take().ok_or(DriverError::MissingStdin)?;
                let bytes = serde_json::to_vec(request).map_err(DriverError::Encode)?;
                Some(tokio::spawn(write_request(stdin, bytes)))
            }
            DriverInput::Flag(_) => None,
        };

        let stdout = child.stdout.take().ok_or(DriverError::MissingStdout)?;
        let stderr = child.stderr.take().ok_or(DriverError::MissingStderr)?;

        let (tx, mut rx) = mpsc::channel(16);
        let stdout_task = tokio::spawn(forward_stdout(stdout, tx.clone()));
        let stderr_task = tokio::spawn(forward_stderr(stderr, tx));

        let mut stderr_buf: Vec<u8> = Vec::new();
        let mut final_response: Option<Value> = None;
        let mut cancelled = false;

        // Both reader tasks hold a sender; the channel closing is the
        // double-EOF condition.
        loop {
            let event = match self.io_timeout {
                Some(timeout) => match time::timeout(timeout, rx.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        warn!(binary = ?self.binary, ?timeout, "no driver I/O within the idle timeout; killing it");
                        let _ = child.kill().await;
                        return Err(DriverError::IoTimeout { timeout });
                    }
                },
                None => rx.recv().await,
            };
            let Some(event) = event else { break };

            match event {
                PipeEvent::Stdout(line) => match DriverLine::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(DriverLine::Progress(record))) => {
                        if let Some(sink) = progress.as_deref_mut() {
                            if sink.report(&record).await == ProgressFlow::Cancel && !cancelled {
                                cancelled = true;
                                self.cancel_child(&mut child, info.has_cancel);
                            }
                        }
                    }
                    Ok(Some(DriverLine::Final(value))) => {
                        if final_response.is_some() {
                            debug!(binary = ?self.binary, "driver sent more than one final response; keeping the last");
                        }
                        final_response = Some(value);
                    }
                    Err(source) => {
                        let _ = child.kill().await;
                        return Err(DriverError::Decode { line, source });
                    }
                },
                PipeEvent::Stderr(chunk) => stderr_buf.extend_from_slice(&chunk),
                PipeEvent::ReadFailed(source) => {
                    let _ = child.kill().await;
                    return Err(DriverError::Read(source));
                }
            }
        }

        stdout_task.await.map_err(|err| DriverError::Join(err.to_string()))?;
        stderr_task.await.map_err(|err| DriverError::Join(err.to_string()))?;
        if let Some(task) = stdin_task {
            // The driver has closed its side; whatever it did not consume
            // no longer matters.
            task.abort();
            if let Ok(Err(source)) = task.await {
                warn!(binary = ?self.binary, %source, "driver exited before consuming its request");
            }
        }

        let exit = match time::timeout(self.exit_timeout, child.wait()).await {
            Ok(result) => result.map_err(DriverError::Wait)?,
            Err(_) => {
                warn!(binary = ?self.binary, "driver did not exit after closing its pipes; killing it");
                child.kill().await.map_err(DriverError::Wait)?;
                child.wait().await.map_err(DriverError::Wait)?
            }
        };

        let response = self.postprocess(final_response, exit, &stderr_buf);
        Ok(DriverOutcome { response, exit })
    }

    fn cancel_child(&self, child: &mut Child, has_cancel: bool) {
        match child.id() {
            Some(pid) if has_cancel => {
                debug!(binary = ?self.binary, pid, "operation cancelled; sending SIGUSR1");
                if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGUSR1) {
                    warn!(binary = ?self.binary, %err, "could not signal driver; killing it");
                    let _ = child.start_kill();
                }
            }
            _ => {
                debug!(binary = ?self.binary, "operation cancelled; driver has no cancel support, killing it");
                let _ = child.start_kill();
            }
        }
    }

    fn postprocess(&self, response: Option<Value>, exit: ExitStatus, stderr: &[u8]) -> Value {
        let mut response = response.unwrap_or_else(|| json!({ "status": NODATA_STATUS }));
        if exit.success() {
            return response;
        }

        if let Some(object) = response.as_object_mut() {
            object
                .entry("status")
                .or_insert_with(|| Value::String("failed".to_string()));
            if let Some(diagnostics) = format_stderr(stderr, self.stderr_verbosity) {
                let message = object
                    .entry("message")
                    .or_insert_with(|| Value::String(String::new()));
                if let Value::String(message) = message {
                    if !message.is_empty() {
                        message.push('\n');
                    }
                    message.push_str(&diagnostics);
                }
            }
        }
        response
    }
}

async fn write_request(mut stdin: ChildStdin, bytes: Vec<u8>) -> Result<(), std::io::Error> {
    for chunk in bytes.chunks(STDIN_CHUNK) {
        if let Err(source) = stdin.write_all(chunk).await {
            if source.kind() == std::io::ErrorKind::BrokenPipe {
                return Ok(());
            }
            return Err(source);
        }
    }
    if let Err(source) = stdin.shutdown().await {
        if source.kind() != std::io::ErrorKind::BrokenPipe {
            return Err(source);
        }
    }
    Ok(())
}

async fn forward_stdout(stdout: ChildStdout, tx: mpsc::Sender<PipeEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(PipeEvent::Stdout(line)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(source) => {
                let _ = tx.send(PipeEvent::ReadFailed(source)).await;
                return;
            }
        }
    }
}

async fn forward_stderr(mut stderr: ChildStderr, tx: mpsc::Sender<PipeEvent>) {
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => {
                if tx.send(PipeEvent::Stderr(chunk[..n].to_vec())).await.is_err() {
                    return;
                }
            }
            Err(source) => {
                let _ = tx.send(PipeEvent::ReadFailed(source)).await;
                return;
            }
        }
    }
}

/// Renders captured stderr for inclusion in a failure message.
pub(crate) fn format_stderr(bytes: &[u8], verbosity: StderrVerbosity) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    match verbosity {
        StderrVerbosity::None => None,
        StderrVerbosity::Minimal => {
            let text = String::from_utf8_lossy(bytes);
            let kept: Vec<&str> = text.lines().take(2).collect();
            Some(kept.join("\n"))
        }
        StderrVerbosity::All => {
            let keep = STDERR_CAP - TRUNCATION_MARKER.len();
            if bytes.len() > keep {
                let mut text = String::from_utf8_lossy(&bytes[..keep]).into_owned();
                text.push_str(TRUNCATION_MARKER);
                Some(text)
            } else {
                Some(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }
}
