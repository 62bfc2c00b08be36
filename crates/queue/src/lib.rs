//! Keel work queue: a deduplicating FIFO with delayed adds and per-item
//! exponential backoff, shared by a pool of workers.
//!
//! An item is never handed to two workers at once. Adding an item that is
//! already queued is a no-op; adding one that is being processed marks it
//! dirty so it is queued exactly once more when the worker calls `done`.

#![forbid(unsafe_code)]

mod queue;
mod rate_limiter;

pub use queue::WorkQueue;
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialRateLimiter, MaxOfRateLimiter, RateLimiter,
};
