// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! The token codec: keyed permutation, base-62 body, HMAC padding.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::CodecError;

type HmacSha256 = Hmac<Sha256>;

/// Default 62-character token alphabet.
pub const DEFAULT_ALPHABET: &str =
    "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Fixed width of the base-62 body; 62^11 > 2^64, so every `u64` fits.
pub const TOKEN_BODY_LEN: usize = 11;

const ALPHABET_SIZE: usize = 62;

/// Configuration for [`Codec`].
///
/// `mac_len` must be set explicitly; there is no safe universal default for
/// how much of the token to spend on authentication.
pub struct CodecConfig {
    secret: Vec<u8>,
    version: u8,
    mac_len: usize,
    alphabet: Option<String>,
    domain: Vec<u8>,
    kind: Option<u8>,
}

impl CodecConfig {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            version: 0,
            mac_len: 0,
            alphabet: None,
            domain: Vec::new(),
            kind: None,
        }
    }

    /// Token version, `0..62`. Becomes the first character of every token.
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Number of pad characters appended to the body.
    pub fn with_mac_len(mut self, mac_len: usize) -> Self {
        self.mac_len = mac_len;
        self
    }

    /// Replacement alphabet; at least 62 ASCII characters, first 62 used.
    pub fn with_alphabet(mut self, alphabet: impl Into<String>) -> Self {
        self.alphabet = Some(alphabet.into());
        self
    }

    /// Deployment discriminator mixed into the MAC (not the permutation).
    pub fn with_domain(mut self, domain: impl Into<Vec<u8>>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Default namespace byte mixed into the MAC; overridable per call with
    /// the `*_with_kind` operations.
    pub fn with_kind(mut self, kind: u8) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn build(self) -> Result<Codec, CodecError> {
        Codec::from_config(self)
    }

    /// Builds the codec, panicking on bad config. For startup wiring where a
    /// misconfigured codec must not be survivable.
    pub fn must_build(self) -> Codec {
        match self.build() {
            Ok(codec) => codec,
            Err(err) => panic!("opaque-id codec config rejected: {err}"),
        }
    }
}

/// Encoder/decoder for one `(secret, version, domain, kind)` tuple.
///
/// Immutable after construction and safe to share. Two codecs built from the
/// same secret produce identical tokens for identical inputs; the version,
/// domain, and kind bind the MAC padding but never alter the permutation.
pub struct Codec {
    version: u8,
    mac_len: usize,
    alphabet: Vec<u8>,
    rev: [i8; 256],
    k1: u64,
    k2: u64,
    k3: u64,
    k4: u64,
    mac_key: [u8; 32],
    domain: Vec<u8>,
    kind: Option<u8>,
}

impl Codec {
    /// Convenience constructor for a pre-derived 32-byte key used as the
    /// secret, with the default alphabet and no domain or kind.
    pub fn from_key(key: [u8; 32], version: u8, mac_len: usize) -> Result<Self, CodecError> {
        CodecConfig::new(key.to_vec())
            .with_version(version)
            .with_mac_len(mac_len)
            .build()
    }

    fn from_config(config: CodecConfig) -> Result<Self, CodecError> {
        if config.mac_len == 0 {
            return Err(CodecError::BadConfig("mac_len must be greater than zero"));
        }
        if config.version as usize >= ALPHABET_SIZE {
            return Err(CodecError::BadConfig("version must be less than 62"));
        }
        let alphabet = config
            .alphabet
            .unwrap_or_else(|| DEFAULT_ALPHABET.to_string());
        if alphabet.len() < ALPHABET_SIZE {
            return Err(CodecError::BadConfig(
                "alphabet must have at least 62 characters",
            ));
        }
        if !alphabet.is_ascii() {
            return Err(CodecError::BadConfig("alphabet must be ASCII"));
        }
        let alphabet = alphabet.into_bytes();

        // Key schedule: master = SHA-256(secret); subkeys and MAC key are
        // labeled re-hashes of the master, so the whole codec is a pure
        // function of the secret.
        let master: [u8; 32] = Sha256::digest(&config.secret).into();
        let k_raw = derive_labeled(&master, b'K');
        let mac_key = derive_labeled(&master, b'M');

        let mut rev = [-1i8; 256];
        for (index, &byte) in alphabet.iter().take(ALPHABET_SIZE).enumerate() {
            rev[byte as usize] = index as i8;
        }

        Ok(Self {
            version: config.version,
            mac_len: config.mac_len,
            alphabet,
            rev,
            k1: be64(&k_raw[0..8]),
            k2: be64(&k_raw[8..16]),
            k3: be64(&k_raw[16..24]),
            k4: be64(&k_raw[24..32]),
            mac_key,
            domain: config.domain,
            kind: config.kind,
        })
    }

    /// Total token length: version char + body + pad.
    pub fn token_len(&self) -> usize {
        1 + TOKEN_BODY_LEN + self.mac_len
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Encodes `id` with the codec's configured kind.
    pub fn encode(&self, id: u64) -> String {
        self.encode_with_kind(id, self.kind)
    }

    /// Encodes `id`, overriding the configured kind for this token.
    pub fn encode_with_kind(&self, id: u64, kind: Option<u8>) -> String {
        let enc = self.permute(id);
        let mut token = Vec::with_capacity(self.token_len());
        token.push(self.alphabet[self.version as usize]);
        token.extend_from_slice(&self.base62_encode_fixed(enc));
        token.extend_from_slice(&self.mac_pad(enc, kind));
        String::from_utf8(token).expect("alphabet is ASCII")
    }

    /// Decodes a token back to the identifier, verifying length, version,
    /// body characters, and the MAC pad (in constant time), in that order.
    pub fn decode(&self, token: &str) -> Result<u64, CodecError> {
        self.decode_with_kind(token, self.kind)
    }

    /// Decodes with an explicit kind; a token minted under a different kind
    /// fails MAC verification.
    pub fn decode_with_kind(&self, token: &str, kind: Option<u8>) -> Result<u64, CodecError> {
        let bytes = token.as_bytes();
        if bytes.len() != self.token_len() {
            return Err(CodecError::InvalidLength);
        }
        if self.rev[bytes[0] as usize] != self.version as i8 {
            return Err(CodecError::VersionMismatch);
        }
        let enc = self.base62_decode_fixed(&bytes[1..1 + TOKEN_BODY_LEN])?;
        let expected = self.mac_pad(enc, kind);
        if !constant_time_eq(&bytes[1 + TOKEN_BODY_LEN..], &expected) {
            return Err(CodecError::MacVerification);
        }
        Ok(self.unpermute(enc))
    }

    /// Full verification without returning the identifier.
    pub fn validate(&self, token: &str) -> Result<(), CodecError> {
        self.decode(token).map(|_| ())
    }

    /// Decodes with panic on failure. For tests and startup assertions.
    pub fn must_decode(&self, token: &str) -> u64 {
        match self.decode(token) {
            Ok(id) => id,
            Err(err) => panic!("opaque-id token rejected: {err}"),
        }
    }

    /// Returns the raw permuted body after length and base-62 checks only —
    /// no version or MAC verification. Diagnostics aid; the result is still
    /// scrambled and unauthenticated.
    pub fn decode_body_only(&self, token: &str) -> Result<u64, CodecError> {
        let bytes = token.as_bytes();
        if bytes.len() < 1 + TOKEN_BODY_LEN {
            return Err(CodecError::InvalidLength);
        }
        self.base62_decode_fixed(&bytes[1..1 + TOKEN_BODY_LEN])
    }

    fn permute(&self, x: u64) -> u64 {
        let mut x = x ^ self.k1;
        x = x.rotate_left(17);
        x = x.wrapping_add(self.k2);
        x = x.rotate_left(31);
        x ^= self.k3;
        x.wrapping_add(self.k4)
    }

    fn unpermute(&self, x: u64) -> u64 {
        let mut x = x.wrapping_sub(self.k4);
        x ^= self.k3;
        x = x.rotate_right(31);
        x = x.wrapping_sub(self.k2);
        x = x.rotate_right(17);
        x ^ self.k1
    }

    fn base62_encode_fixed(&self, mut value: u64) -> [u8; TOKEN_BODY_LEN] {
        let mut body = [0u8; TOKEN_BODY_LEN];
        for slot in body.iter_mut().rev() {
            *slot = self.alphabet[(value % 62) as usize];
            value /= 62;
        }
        body
    }

    fn base62_decode_fixed(&self, body: &[u8]) -> Result<u64, CodecError> {
        if body.len() != TOKEN_BODY_LEN {
            return Err(CodecError::InvalidLength);
        }
        let mut value: u64 = 0;
        for &byte in body {
            let digit = self.rev[byte as usize];
            if digit < 0 {
                return Err(CodecError::InvalidBase62Char);
            }
            value = value.wrapping_mul(62).wrapping_add(digit as u64);
        }
        Ok(value)
    }

    // MAC input: domain (when non-empty), kind (when present), the version
    // character, and the big-endian permuted body. The digest is squeezed
    // into alphabet characters through a 6-bit reservoir; values 62 and 63
    // map to 60 and 61. The bias is part of the token format — changing it
    // breaks every issued token.
    fn mac_pad(&self, encrypted: u64, kind: Option<u8>) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .expect("HMAC accepts any key length");
        if !self.domain.is_empty() {
            mac.update(&self.domain);
        }
        if let Some(kind) = kind {
            mac.update(&[kind]);
        }
        mac.update(&[self.alphabet[self.version as usize]]);
        mac.update(&encrypted.to_be_bytes());
        let sum = mac.finalize().into_bytes();

        let mut pad = Vec::with_capacity(self.mac_len);
        let mut bitbuf: u64 = 0;
        let mut bits: u32 = 0;
        let mut src = 0;
        while pad.len() < self.mac_len {
            while bits < 6 && src < sum.len() {
                bitbuf = (bitbuf << 8) | u64::from(sum[src]);
                bits += 8;
                src += 1;
            }
            if bits < 6 {
                bitbuf <<= 6 - bits;
                bits = 6;
            }
            bits -= 6;
            let mut value = ((bitbuf >> bits) & 0x3f) as usize;
            if value >= ALPHABET_SIZE {
                value -= 2;
            }
            pad.push(self.alphabet[value]);
        }
        pad
    }
}

fn derive_labeled(master: &[u8; 32], label: u8) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(master);
    hasher.update([label]);
    hasher.finalize().into()
}

fn be64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes(bytes.try_into().expect("8-byte window"))
}

// Data-independent byte equality; a short-circuiting compare would leak how
// much of the pad matched.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}
