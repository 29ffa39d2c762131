// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! The `Id` wrapper and its serialization surfaces.
//!
//! All string-form operations go through a process-global default codec,
//! installed once at startup with [`set_default_codec`]. Numeric surfaces
//! (JSON numbers, SQL integers) work without it.

use std::fmt;
use std::ptr;
use std::str::FromStr;
use std::sync::atomic::{AtomicPtr, Ordering};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::codec::Codec;
use crate::error::CodecError;

// Pointers stored here are leaked boxes and are never freed: readers may
// hold a reference for the rest of the process, and replacement only
// happens at configuration time.
static DEFAULT_CODEC: AtomicPtr<Codec> = AtomicPtr::new(ptr::null_mut());

/// Installs the process-global default codec used by [`Id`]'s text, JSON,
/// and SQL surfaces. Call once at startup, before any `Id` is serialized;
/// test fixtures may swap it.
pub fn set_default_codec(codec: Codec) {
    let leaked = Box::into_raw(Box::new(codec));
    DEFAULT_CODEC.swap(leaked, Ordering::AcqRel);
}

/// The installed default codec, if any. Reads are wait-free.
pub fn default_codec() -> Option<&'static Codec> {
    let ptr = DEFAULT_CODEC.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        // Safety: non-null values in the cell are leaked boxes with 'static
        // lifetime; see the cell invariant above.
        Some(unsafe { &*ptr })
    }
}

#[cfg(test)]
fn clear_default_codec() {
    DEFAULT_CODEC.swap(ptr::null_mut(), Ordering::AcqRel);
}

/// Errors from [`Id`]'s string-form surfaces.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    /// No default codec installed; string-form operations need one.
    #[error("no default codec configured (call set_default_codec at startup)")]
    NoDefaultCodec,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A 64-bit identifier rendered externally as an opaque token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u64);

impl Id {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Decodes a trimmed token via the default codec.
    pub fn parse(token: &str) -> Result<Self, IdError> {
        token.parse()
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Id> for u64 {
    fn from(id: Id) -> Self {
        id.0
    }
}

impl fmt::Display for Id {
    /// The encoded token when a default codec is installed, otherwise the
    /// debug-style fallback `Id(<decimal>)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match default_codec() {
            Some(codec) => f.write_str(&codec.encode(self.0)),
            None => write!(f, "Id({})", self.0),
        }
    }
}

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let codec = default_codec().ok_or(IdError::NoDefaultCodec)?;
        Ok(Self(codec.decode(s.trim())?))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let codec = default_codec()
            .ok_or_else(|| serde::ser::Error::custom(IdError::NoDefaultCodec))?;
        serializer.serialize_str(&codec.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(IdVisitor)
    }
}

struct IdVisitor;

impl<'de> Visitor<'de> for IdVisitor {
    type Value = Id;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an encoded id string, an unsigned integer, or null")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Id, E> {
        Ok(Id(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Id, E> {
        u64::try_from(value)
            .map(Id)
            .map_err(|_| E::custom("id number must be non-negative"))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Id, E> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Ok(Id(0));
        }
        trimmed.parse().map_err(E::custom)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Id, E> {
        Ok(Id(0))
    }

    fn visit_none<E: de::Error>(self) -> Result<Id, E> {
        Ok(Id(0))
    }
}

/// An `Id` that may be SQL NULL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NullId {
    pub id: Id,
    pub valid: bool,
}

impl NullId {
    pub const fn some(id: Id) -> Self {
        Self { id, valid: true }
    }

    pub const fn none() -> Self {
        Self {
            id: Id::new(0),
            valid: false,
        }
    }
}

impl From<Option<Id>> for NullId {
    fn from(value: Option<Id>) -> Self {
        match value {
            Some(id) => Self::some(id),
            None => Self::none(),
        }
    }
}

impl From<NullId> for Option<Id> {
    fn from(value: NullId) -> Self {
        value.valid.then_some(value.id)
    }
}

#[cfg(feature = "rusqlite")]
mod sql {
    use rusqlite::types::{
        FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef,
    };

    use super::{Id, NullId};

    fn parse_base10(bytes: &[u8]) -> FromSqlResult<Id> {
        let text = std::str::from_utf8(bytes).map_err(|err| FromSqlError::Other(Box::new(err)))?;
        text.trim()
            .parse::<u64>()
            .map(Id)
            .map_err(|err| FromSqlError::Other(Box::new(err)))
    }

    impl ToSql for Id {
        /// Stored as the raw 64-bit value bit-cast to SQL INTEGER.
        fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
            Ok(ToSqlOutput::Owned(Value::Integer(self.0 as i64)))
        }
    }

    impl FromSql for Id {
        fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
            match value {
                ValueRef::Integer(v) => Ok(Id(v as u64)),
                ValueRef::Text(bytes) | ValueRef::Blob(bytes) => parse_base10(bytes),
                ValueRef::Null => Ok(Id(0)),
                ValueRef::Real(_) => Err(FromSqlError::InvalidType),
            }
        }
    }

    impl ToSql for NullId {
        fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
            if self.valid {
                self.id.to_sql()
            } else {
                Ok(ToSqlOutput::Owned(Value::Null))
            }
        }
    }

    impl FromSql for NullId {
        fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
            match value {
                ValueRef::Null => Ok(NullId::none()),
                other => Id::column_result(other).map(NullId::some),
            }
        }
    }
}
