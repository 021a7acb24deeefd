use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::time;
use tracing::{debug, warn};

use servo_protocol::EventKind;

use crate::error::ServoError;

/// Delay before the very first retry of the very first `WHATS_NEXT`, so a
/// freshly (re)started agent picks up its pending command quickly.
const FIRST_WHATS_NEXT_RETRY: Duration = Duration::from_secs(1);

/// Retry budget for one post.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Retries {
    /// Never give up; used for the command loop, which must not lose
    /// commands over a flaky network.
    Forever,
    /// At most this many retries after the initial attempt.
    Limit(u32),
}

/// JSON event client for the optimization service.
///
/// Every exchange is a POST of `{event, param}` to one URL; the reply body
/// is JSON. Connection errors, non-2xx statuses, and non-JSON bodies are
/// all retried within the given [`Retries`] budget.
pub struct ApiClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    retry_delay: Duration,
    fast_first_retry: bool,
}

#[derive(Debug, Error)]
enum PostFailure {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("service returned {0}")]
    Status(reqwest::StatusCode),
    #[error("service reply was not JSON: {0}")]
    Body(#[source] reqwest::Error),
}

impl ApiClient {
    pub fn new(url: String, token: Option<String>, retry_delay: Duration) -> Self {
        ApiClient {
            http: reqwest::Client::new(),
            url,
            token,
            retry_delay,
            fast_first_retry: true,
        }
    }

    /// Posts one event and returns the service's JSON reply.
    pub async fn post(
        &mut self,
        event: EventKind,
        param: Value,
        retries: Retries,
    ) -> Result<Value, ServoError> {
        let body = json!({ "event": event.as_str(), "param": param });
        let mut attempt: u32 = 0;

        loop {
            match self.try_post(&body).await {
                Ok(reply) => {
                    debug!(event = %event, "posted");
                    if event == EventKind::WhatsNext {
                        self.fast_first_retry = false;
                    }
                    if event == EventKind::Description {
                        // The server restarts its session after a
                        // description; a fresh connection pool keeps the
                        // next request off the stale connection.
                        self.http = reqwest::Client::new();
                    }
                    return Ok(reply);
                }
                Err(cause) => {
                    if let Retries::Limit(limit) = retries {
                        if attempt >= limit {
                            return Err(ServoError::ServerUnavailable { last: cause.to_string() });
                        }
                    }
                    let delay = if event == EventKind::WhatsNext && self.fast_first_retry {
                        self.fast_first_retry = false;
                        FIRST_WHATS_NEXT_RETRY
                    } else {
                        self.retry_delay
                    };
                    warn!(event = %event, attempt, ?delay, %cause, "post failed; retrying");
                    time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn try_post(&self, body: &Value) -> Result<Value, PostFailure> {
        let mut request = self.http.post(&self.url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(PostFailure::Request)?;
        let status = response.status();
        if !status.is_success() {
            return Err(PostFailure::Status(status));
        }
        response.json().await.map_err(PostFailure::Body)
    }
}
