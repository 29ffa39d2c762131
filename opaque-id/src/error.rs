// Copyright (c) James Kassemi, SC, US. All rights reserved.

use thiserror::Error;

/// Codec failures. Callers match on identity; validation errors never reveal
/// more than these categories.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid token length")]
    InvalidLength,
    #[error("version mismatch")]
    VersionMismatch,
    #[error("invalid base62 character")]
    InvalidBase62Char,
    #[error("MAC verification failed")]
    MacVerification,
    #[error("bad config: {0}")]
    BadConfig(&'static str),
}
