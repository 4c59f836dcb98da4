use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

const TRANSIENT_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

const TRANSIENT_MESSAGES: [&str; 8] = [
    "timeout",
    "timed out",
    "connection reset",
    "econnreset",
    "connection refused",
    "rate limit",
    "temporarily unavailable",
    "service unavailable",
];

/// Non-success HTTP response from a model or storage backend.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },
}

impl RemoteError {
    pub fn status(service: &str, status: u16, body: String) -> Self {
        RemoteError::Status {
            service: service.to_string(),
            status,
            body,
        }
    }
}

/// Whether `err` (or anything in its cause chain) looks like a failure that
/// may succeed if repeated.
pub fn is_transient(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(RemoteError::Status { status, .. }) = cause.downcast_ref::<RemoteError>() {
            return TRANSIENT_STATUSES.contains(status);
        }
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            if e.is_timeout() || e.is_connect() {
                return true;
            }
            if let Some(status) = e.status() {
                return TRANSIENT_STATUSES.contains(&status.as_u16());
            }
        }
        if let Some(e) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            if matches!(e.kind(), TimedOut | ConnectionReset | ConnectionAborted | BrokenPipe) {
                return true;
            }
        }
    }

    let message = format!("{:#}", err).to_lowercase();
    TRANSIENT_MESSAGES.iter().any(|needle| message.contains(needle))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, config.initial_backoff_ms, config.max_backoff_ms)
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::new(0, 0, 0)
    }

    /// Retry a future with exponential backoff. Only transient errors are
    /// retried; anything else is returned on first failure.
    pub async fn retry<F, Fut, T>(&self, operation_name: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let mut backoff = self.initial_backoff;

        loop {
            match f().await {
                Ok(result) => {
                    if attempt > 0 {
                        info!(
                            operation = operation_name,
                            attempts = attempt + 1,
                            "Operation succeeded after retries"
                        );
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if !is_transient(&e) {
                        return Err(e);
                    }

                    attempt += 1;
                    if attempt > self.max_retries {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %e,
                            "Operation failed after max retries"
                        );
                        return Err(e);
                    }

                    let delay = with_jitter(backoff);
                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        max_retries = self.max_retries,
                        backoff_ms = delay.as_millis(),
                        error = %e,
                        "Operation failed, retrying"
                    );

                    sleep(delay).await;

                    backoff = std::cmp::min(backoff * 2, self.max_backoff);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Adds up to 25% random delay so concurrent callers do not retry in lockstep.
fn with_jitter(backoff: Duration) -> Duration {
    let cap = backoff.as_millis() as u64 / 4;
    if cap == 0 {
        return backoff;
    }
    let extra = rand::thread_rng().gen_range(0..=cap);
    backoff + Duration::from_millis(extra)
}
