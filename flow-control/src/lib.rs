// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Rate-shaping primitives for bursty event streams.
//!
//! The crate exposes:
//! - [`Throttler`]: token-bucket regulator with a background refill task.
//! - [`Debouncer`] / [`DebouncerByKey`]: collapse trigger bursts into at most
//!   one leading and/or trailing emission per quiet window.
//! - [`Coalescer`] / [`CoalescerByKey`]: fold values arriving inside a sliding
//!   window into a single accumulator, emitted at window close.
//!
//! Every type is safe for concurrent callers. Background tasks (refill, timer
//! expirations, idle eviction) run on Tokio and exit promptly when the
//! construction-time [`CancellationToken`] fires; cancellation is silent and
//! never runs stop-mode callbacks. Constructors and trigger paths must
//! therefore be called from within a Tokio runtime.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod coalesce;
pub mod coalesce_by_key;
pub mod debounce;
pub mod debounce_by_key;
pub mod error;
pub mod throttler;

pub use coalesce::{CoalesceConfig, Coalescer};
pub use coalesce_by_key::{CoalesceKeyConfig, CoalescerByKey};
pub use debounce::{DebounceConfig, Debouncer};
pub use debounce_by_key::{DebounceKeyConfig, DebouncerByKey};
pub use error::{AcquireError, ConfigError};
pub use throttler::{Throttler, ThrottlerConfig};

/// What an explicit `stop()` does with state that is still pending.
///
/// Only `stop()` consults this; cancelling the construction-time token tears
/// background tasks down without flushing or calling back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopMode {
    /// Drop pending state silently.
    #[default]
    Noop,
    /// Flush pending state through the normal emission path.
    Flush,
    /// Skip the flush but hand the pending value to the `on_stop` callback.
    CallbackOnly,
    /// Flush, then hand the same pre-flush value to `on_stop`.
    FlushAndCallback,
}
