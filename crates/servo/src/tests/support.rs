use std::fs as std_fs;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    task::JoinHandle,
};

use servo_protocol::ProgressRecord;

use crate::{Config, ProgressFlow, ProgressSink, StderrVerbosity};

/// Tests that touch the process-wide stop flag must not overlap.
fn stop_flag_mutex() -> &'static Mutex<()> {
    static MUTEX: OnceLock<Mutex<()>> = OnceLock::new();
    MUTEX.get_or_init(|| Mutex::new(()))
}

pub(super) async fn serial_guard() -> tokio::sync::MutexGuard<'static, ()> {
    stop_flag_mutex().lock().await
}

pub(super) fn write_fake_driver(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    std_fs::write(&path, script).unwrap();
    let mut perms = std_fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std_fs::set_permissions(&path, perms).unwrap();
    path
}

/// A driver script that answers `--info` with the given metadata and runs
/// `body` otherwise.
pub(super) fn driver_script_with_info(info: &str, body: &str) -> String {
    format!("#!/bin/sh\nif [ \"$1\" = \"--info\" ]; then\n  echo '{info}'\n  exit 0\nfi\n{body}\n")
}

pub(super) fn driver_script(body: &str) -> String {
    driver_script_with_info(r#"{"has_cancel":false}"#, body)
}

pub(super) fn test_config(url: &str, driver_dir: &Path) -> Config {
    Config {
        app_id: "app1".to_string(),
        url: url.to_string(),
        agent: "servo".to_string(),
        token: None,
        interactive: false,
        delay: None,
        retry_delay: Duration::from_millis(20),
        io_timeout: None,
        stderr_verbosity: StderrVerbosity::All,
        perf_expr: None,
        adjust_driver: driver_dir.join("adjust"),
        measure_driver: driver_dir.join("measure"),
        environment_driver: driver_dir.join("environment"),
    }
}

/// Records every progress record it sees; optionally requests cancellation
/// once a given number of records has arrived.
pub(super) struct CollectSink {
    pub records: Vec<ProgressRecord>,
    cancel_at: Option<usize>,
}

impl CollectSink {
    pub(super) fn new() -> Self {
        CollectSink { records: Vec::new(), cancel_at: None }
    }

    pub(super) fn cancel_at(count: usize) -> Self {
        CollectSink { records: Vec::new(), cancel_at: Some(count) }
    }
}

impl ProgressSink for CollectSink {
    fn report<'a>(
        &'a mut self,
        record: &'a ProgressRecord,
    ) -> Pin<Box<dyn Future<Output = ProgressFlow> + Send + 'a>> {
        Box::pin(async move {
            self.records.push(record.clone());
            if self.cancel_at == Some(self.records.len()) {
                ProgressFlow::Cancel
            } else {
                ProgressFlow::Continue
            }
        })
    }
}

/// One scripted reply of the stub optimization service.
pub(super) enum StubReply {
    /// 200 with this JSON body.
    Json(Value),
    /// An error status with an empty body.
    Status(u16),
    /// 200 with a body that is not JSON.
    Garbage,
    /// 200 with this JSON body, and the process stop flag raised just
    /// before responding, so the command loop winds down deterministically.
    JsonThenStop(Value),
}

#[derive(Debug, Clone)]
pub(super) struct RecordedRequest {
    pub headers: String,
    pub body: Value,
}

/// A one-connection-per-reply HTTP/1.1 stub standing in for the
/// optimization service.
pub(super) struct StubService {
    pub url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    _serve: JoinHandle<()>,
}

impl StubService {
    pub(super) async fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests.lock().await.clone()
    }
}

pub(super) async fn stub_service(replies: Vec<StubReply>) -> StubService {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&requests);

    let serve = tokio::spawn(async move {
        for reply in replies {
            let Ok((mut socket, _)) = listener.accept().await else { return };
            if let Some(request) = read_request(&mut socket).await {
                recorded.lock().await.push(request);
            }

            let (status_line, payload) = match &reply {
                StubReply::Json(value) | StubReply::JsonThenStop(value) => {
                    ("200 OK".to_string(), value.to_string())
                }
                StubReply::Status(code) => (format!("{code} Error"), String::new()),
                StubReply::Garbage => ("200 OK".to_string(), "pong".to_string()),
            };
            if matches!(&reply, StubReply::JsonThenStop(_)) {
                crate::request_stop(crate::StopMode::Exit);
            }

            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                payload.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    StubService { url, requests, _serve: serve }
}

async fn read_request(socket: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    })?;

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body = serde_json::from_slice(&buf[header_end..header_end + content_length]).ok()?;
    Some(RecordedRequest { headers, body })
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
