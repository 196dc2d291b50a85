//! Rate-limited, circuit-breaking client for calling a flaky dependency.
//!
//! Independent of the processor; task handlers are the expected callers.

mod breaker;
mod bucket;
mod limited;

pub use breaker::{CircuitBreaker, CircuitState, Permit};
pub use bucket::TokenBucket;
pub use limited::{ClientError, RateLimitedClient, Request, Response, Upstream, UpstreamError};
