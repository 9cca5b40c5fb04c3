//! Envelope Module
//!
//! The unit stored per key: an optional absolute expiry plus an optional
//! payload body. See [`wire`] for the byte layout.

mod wire;

use std::fmt;

pub use wire::{EnvelopeHeader, EXPIRY_LEN, FLAGS_LEN, LENGTH_PREFIX_LEN};

// == Envelope Flags ==
/// Presence bits written as the first byte of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EnvelopeFlags(u8);

impl EnvelopeFlags {
    pub const NONE: Self = Self(0);
    pub const HAS_EXPIRY: Self = Self(0b01);
    pub const HAS_BODY: Self = Self(0b10);

    const ALL: u8 = Self::HAS_EXPIRY.0 | Self::HAS_BODY.0;

    /// Parses a flag byte, rejecting unknown bits.
    pub fn from_bits(bits: u8) -> Option<Self> {
        (bits & !Self::ALL == 0).then_some(Self(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl std::ops::BitOr for EnvelopeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for EnvelopeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Self::HAS_EXPIRY), self.contains(Self::HAS_BODY)) {
            (false, false) => f.write_str("NONE"),
            (true, false) => f.write_str("HAS_EXPIRY"),
            (false, true) => f.write_str("HAS_BODY"),
            (true, true) => f.write_str("HAS_EXPIRY|HAS_BODY"),
        }
    }
}

// == Envelope ==
/// One stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<T> {
    /// Absolute expiry in Unix milliseconds, None = never expires
    pub expiry: Option<i64>,
    /// The application value, None when absent or skipped because expired
    pub body: Option<T>,
}

impl<T> Envelope<T> {
    pub fn new(body: Option<T>, expiry: Option<i64>) -> Self {
        Self { expiry, body }
    }

    /// An envelope that never expires.
    pub fn persistent(body: T) -> Self {
        Self::new(Some(body), None)
    }

    // == Has Expired ==
    /// True once `now` is strictly past the expiry. Never true without one.
    pub fn has_expired(&self, now: i64) -> bool {
        has_expired(self.expiry, now)
    }

    pub fn into_body(self) -> Option<T> {
        self.body
    }
}

pub(crate) fn has_expired(expiry: Option<i64>, now: i64) -> bool {
    matches!(expiry, Some(expiry) if now > expiry)
}
