// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Key rotation across an ordered set of codecs.

use crate::codec::Codec;
use crate::error::CodecError;

/// Current codec plus the older codecs still allowed to decode.
///
/// Encoding always uses the current codec. Decoding tries the current codec
/// first and then each older codec in order; the version character and MAC
/// key tie every token to exactly one codec, so at most one will accept.
pub struct MultiCodec {
    current: Codec,
    old: Vec<Codec>,
}

impl MultiCodec {
    pub fn new(current: Codec, old: Vec<Codec>) -> Self {
        Self { current, old }
    }

    pub fn current(&self) -> &Codec {
        &self.current
    }

    pub fn encode(&self, id: u64) -> String {
        self.current.encode(id)
    }

    /// Decodes against the rotation set. When every codec rejects the token
    /// the error is [`CodecError::MacVerification`]; per-codec failure
    /// details are deliberately not surfaced.
    pub fn decode(&self, token: &str) -> Result<u64, CodecError> {
        if let Ok(id) = self.current.decode(token) {
            return Ok(id);
        }
        for codec in &self.old {
            if let Ok(id) = codec.decode(token) {
                return Ok(id);
            }
        }
        Err(CodecError::MacVerification)
    }
}
