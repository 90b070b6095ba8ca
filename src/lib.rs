//! Gatekeeper - Rate Limiting Engine
//!
//! This crate implements admission control for HTTP services. A
//! [`RateLimiter`](ratelimit::RateLimiter) decides whether a request may
//! proceed using a fixed window, an exact sliding log, or a points budget,
//! with counters kept in a [`Store`](store::Store) that is either
//! process-local or shared through Redis. The [`http`] module adapts those
//! decisions to axum/tower services.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
