//! HTTP middleware adapter.
//!
//! [`RateLimitLayer`] wraps any axum/tower service, derives an identifier
//! and cost from each request, and answers rejected requests with 429.

mod identity;
mod layer;
mod response;
mod server;

pub use identity::{client_ip, AuthenticatedUser, IdentifierFn, KeyStrategy, API_KEY_HEADER};
pub use layer::{CostFn, FailureMode, RateLimitLayer, RateLimitService};
pub use response::{
    apply_rate_limit_headers, too_many_requests, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
pub use server::HttpServer;
