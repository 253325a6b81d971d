//! Admission control for the Conductor coordination core.
//!
//! # Main types
//!
//! - [`RateLimiter`] — Sliding-window rate limiter keyed by agent or submitter id.

/// Sliding-window rate limiting.
pub mod rate_limit;

pub use rate_limit::RateLimiter;
