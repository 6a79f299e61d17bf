//! Outbound side of the ingestion engine: rate limiting, retrying fetches
//! and the HTTP transport they run over.

pub mod fetch;
pub mod http;
pub mod rate_limiter;

pub use fetch::{
    FailureClass, FetchClient, FetchError, FetchRequest, Fetched, RawResponse, RetryPolicy,
    Transport, TransportError,
};
pub use http::HttpTransport;
pub use rate_limiter::{RateLimitError, RateLimiter};
