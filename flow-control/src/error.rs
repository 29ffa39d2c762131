// Copyright (c) James Kassemi, SC, US. All rights reserved.

use thiserror::Error;

/// Construction-time validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("interval must be greater than zero")]
    NonPositiveInterval,
    #[error("wait must be greater than zero")]
    NonPositiveWait,
    #[error("max_wait must be greater than zero when set")]
    NonPositiveMaxWait,
    #[error("window must be greater than zero")]
    NonPositiveWindow,
    #[error("idle_ttl must be greater than zero when set")]
    NonPositiveIdleTtl,
}

/// Why a blocking [`Throttler::acquire`](crate::Throttler::acquire) gave up.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcquireError {
    #[error("throttler stopped")]
    Stopped,
    #[error("acquire canceled")]
    Canceled,
}
