// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Deterministic, authenticated tokens for 64-bit identifiers.
//!
//! A [`Codec`] maps a `u64` to a fixed-length printable token: a keyed,
//! invertible bit-permutation scrambles the value, and an HMAC-derived pad
//! binds a version character, an optional domain label, and an optional kind
//! byte. Tokens are stable across processes sharing a secret, unforgeable
//! without it, and verified in constant time. This is not a general cipher;
//! it protects exactly one `u64`.
//!
//! [`MultiCodec`] layers key rotation on top, and [`Id`] integrates with
//! text, JSON, and SQL through a process-global default codec installed via
//! [`set_default_codec`] at startup.

pub mod codec;
pub mod error;
pub mod id;
pub mod multi;

pub use codec::{Codec, CodecConfig, DEFAULT_ALPHABET, TOKEN_BODY_LEN};
pub use error::CodecError;
pub use id::{default_codec, set_default_codec, Id, IdError, NullId};
pub use multi::MultiCodec;
