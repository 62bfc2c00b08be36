//! Keel controller: turns cache notifications into work-queue keys, drains
//! the queue with a pool of workers, and drives each SampleResource's status
//! toward its spec.
//!
//! Flow: cache callback -> [`EnqueueHandler`] -> [`keel_queue::WorkQueue`] ->
//! worker -> [`Reconciler::reconcile`] -> forget on success, rate-limited
//! requeue on error or panic.

#![forbid(unsafe_code)]

mod adapter;
mod config;
mod controller;
mod reconcile;
mod worker;

pub use adapter::EnqueueHandler;
pub use config::{ConfigError, ControllerConfig};
pub use controller::{Controller, ControllerError};
pub use reconcile::{
    ReconcileError, Reconciler, SampleReconciler, SkipReason, SyncOutcome, MESSAGE_SYNCED, REASON_INVALID_SPEC,
    REASON_SYNCED,
};
pub use worker::{process_item, run_worker};
