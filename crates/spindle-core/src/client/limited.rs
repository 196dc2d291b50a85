use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{CircuitBreaker, CircuitState, TokenBucket};
use crate::config::ClientConfig;
use crate::domain::Payload;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: Payload,
}

impl Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            body: Payload::Null,
        }
    }

    pub fn with_body(mut self, body: Payload) -> Self {
        self.body = body;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub body: Payload,
}

/// Failure reported by the upstream.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct UpstreamError {
    /// Worth retrying (timeouts, 5xx, throttling).
    pub retryable: bool,
    pub message: String,
}

impl UpstreamError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

/// The dependency behind the client (an HTTP API, in practice).
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, request: &Request) -> Result<Response, UpstreamError>;
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("circuit is open")]
    CircuitOpen,

    #[error("rate limit reached")]
    RateLimited,

    #[error("upstream failed after {attempts} attempt(s): {message}")]
    Upstream { message: String, attempts: u32 },
}

/// Client that puts a token bucket, a circuit breaker and bounded retries in
/// front of an [`Upstream`].
pub struct RateLimitedClient<U> {
    upstream: U,
    bucket: TokenBucket,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    max_retries: u32,
}

impl<U: Upstream> RateLimitedClient<U> {
    pub fn new(upstream: U, config: &ClientConfig) -> Self {
        Self {
            upstream,
            bucket: TokenBucket::new(config.burst, config.rate_per_sec),
            breaker: CircuitBreaker::new(
                config.failure_threshold,
                config.cooldown(),
                config.half_open_max_calls,
            ),
            retry: config.retry.policy(),
            max_retries: config.max_retries,
        }
    }

    /// Send `request`, waiting for rate-limit tokens as needed.
    pub async fn call(&self, request: &Request) -> Result<Response, ClientError> {
        self.send(request, true).await
    }

    /// Like [`call`](Self::call), but fails with `RateLimited` instead of waiting.
    pub async fn try_call(&self, request: &Request) -> Result<Response, ClientError> {
        self.send(request, false).await
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    async fn send(&self, request: &Request, wait: bool) -> Result<Response, ClientError> {
        let mut retries = 0;
        let mut last_error: Option<String> = None;
        loop {
            // breaker slot first, so a refused call spends no token
            let Some(permit) = self.breaker.allow() else {
                return Err(refusal(ClientError::CircuitOpen, last_error, retries));
            };
            if wait {
                self.bucket.acquire().await;
            } else if !self.bucket.try_acquire() {
                return Err(refusal(ClientError::RateLimited, last_error, retries));
            }

            match self.upstream.send(request).await {
                Ok(response) => {
                    permit.success();
                    return Ok(response);
                }
                // the upstream answered; a rejected request says nothing about its health
                Err(e) if !e.retryable => {
                    permit.success();
                    return Err(ClientError::Upstream {
                        message: e.message,
                        attempts: retries + 1,
                    });
                }
                Err(e) => {
                    permit.failure();
                    if retries >= self.max_retries || self.breaker.state() == CircuitState::Open {
                        return Err(ClientError::Upstream {
                            message: e.message,
                            attempts: retries + 1,
                        });
                    }
                    let delay: Duration = self.retry.next_delay(retries);
                    tracing::warn!(
                        path = %request.path,
                        attempt = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "upstream call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                    last_error = Some(e.message);
                }
            }
        }
    }
}

/// A refusal after failed attempts reports the last upstream error instead.
fn refusal(fallback: ClientError, last_error: Option<String>, attempts: u32) -> ClientError {
    match last_error {
        Some(message) => ClientError::Upstream { message, attempts },
        None => fallback,
    }
}
