//! Envelope wire format
//!
//! ```text
//! | flags | expiry | body length | body bytes  |
//! |  1B   |   8B   |     4B      | length B    |
//! ```
//!
//! `expiry` is present iff `HAS_EXPIRY`, the length prefix and body iff
//! `HAS_BODY`. Integers are little-endian and signed. A record always
//! consumes exactly the bytes its header announces, so records written back
//! to back decode independently.

use bytes::{Buf, BufMut, BytesMut};

use super::{has_expired, Envelope, EnvelopeFlags};
use crate::codec::PayloadCodec;
use crate::error::{EnvelopeError, Result};

pub const FLAGS_LEN: usize = 1;
pub const EXPIRY_LEN: usize = 8;
pub const LENGTH_PREFIX_LEN: usize = 4;

// == Envelope Header ==
/// Everything in a record except the body itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub flags: EnvelopeFlags,
    pub expiry: Option<i64>,
    /// Body length in bytes, present iff `HAS_BODY`
    pub body_len: Option<usize>,
}

impl EnvelopeHeader {
    /// Reads the header and leaves `buf` positioned at the body.
    ///
    /// Also checks that the announced body is fully present, so the caller
    /// can skip or consume it without further bounds checks.
    pub fn read<B: Buf>(buf: &mut B) -> std::result::Result<Self, EnvelopeError> {
        ensure_remaining(buf, FLAGS_LEN)?;
        let bits = buf.get_u8();
        let flags = EnvelopeFlags::from_bits(bits).ok_or(EnvelopeError::UnknownFlags(bits))?;

        let expiry = if flags.contains(EnvelopeFlags::HAS_EXPIRY) {
            ensure_remaining(buf, EXPIRY_LEN)?;
            Some(buf.get_i64_le())
        } else {
            None
        };

        let body_len = if flags.contains(EnvelopeFlags::HAS_BODY) {
            ensure_remaining(buf, LENGTH_PREFIX_LEN)?;
            let len = buf.get_i32_le();
            let len = usize::try_from(len).map_err(|_| EnvelopeError::NegativeLength(len))?;
            ensure_remaining(buf, len)?;
            Some(len)
        } else {
            None
        };

        Ok(Self {
            flags,
            expiry,
            body_len,
        })
    }

    /// Reads the header of a complete record without consuming it.
    pub fn peek(record: &[u8]) -> std::result::Result<Self, EnvelopeError> {
        let mut cursor = record;
        Self::read(&mut cursor)
    }

    pub fn has_expired(&self, now: i64) -> bool {
        has_expired(self.expiry, now)
    }

    /// Total size of the record this header belongs to.
    pub fn record_len(&self) -> usize {
        FLAGS_LEN
            + self.expiry.map_or(0, |_| EXPIRY_LEN)
            + self.body_len.map_or(0, |len| LENGTH_PREFIX_LEN + len)
    }
}

fn ensure_remaining<B: Buf>(buf: &B, needed: usize) -> std::result::Result<(), EnvelopeError> {
    if buf.remaining() < needed {
        return Err(EnvelopeError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

impl<T> Envelope<T> {
    // == Encode ==
    /// Appends this envelope to `buf` and returns the flags written.
    pub fn encode(
        &self,
        buf: &mut BytesMut,
        codec: &dyn PayloadCodec<T>,
        now: i64,
    ) -> Result<EnvelopeFlags> {
        Self::encode_parts(buf, self.body.as_ref(), self.expiry, codec, now)
    }

    /// Appends an envelope built from borrowed parts.
    ///
    /// The body is only written when present and not already expired at
    /// `now`; a stale value degrades to an expiry-only record and the codec
    /// is never invoked for it. On error `buf` is restored to its prior length.
    pub fn encode_parts(
        buf: &mut BytesMut,
        body: Option<&T>,
        expiry: Option<i64>,
        codec: &dyn PayloadCodec<T>,
        now: i64,
    ) -> Result<EnvelopeFlags> {
        let record_start = buf.len();
        let body = body.filter(|_| !has_expired(expiry, now));

        let mut flags = EnvelopeFlags::NONE;
        flags.set(EnvelopeFlags::HAS_EXPIRY, expiry.is_some());
        flags.set(EnvelopeFlags::HAS_BODY, body.is_some());

        buf.put_u8(flags.bits());
        if let Some(expiry) = expiry {
            buf.put_i64_le(expiry);
        }

        if let Some(body) = body {
            // Reserve the length prefix, stream the body, then patch the length in.
            let len_pos = buf.len();
            buf.put_i32_le(0);
            let body_start = buf.len();

            let written = {
                let mut writer = (&mut *buf).writer();
                codec.encode(body, &mut writer)
            };
            if let Err(e) = written {
                buf.truncate(record_start);
                return Err(e.into());
            }

            let body_len = buf.len() - body_start;
            let Ok(len) = i32::try_from(body_len) else {
                buf.truncate(record_start);
                return Err(EnvelopeError::BodyTooLarge(body_len).into());
            };
            buf[len_pos..body_start].copy_from_slice(&len.to_le_bytes());
        }

        Ok(flags)
    }

    /// Encodes into a fresh buffer.
    pub fn to_bytes(&self, codec: &dyn PayloadCodec<T>, now: i64) -> Result<bytes::Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf, codec, now)?;
        Ok(buf.freeze())
    }

    // == Decode ==
    /// Reads one envelope from `buf`.
    ///
    /// When the record has already expired at `now` its body is skipped
    /// without invoking the codec and left absent. Exactly the bytes of this
    /// record are consumed either way.
    pub fn decode<B: Buf>(buf: &mut B, codec: &dyn PayloadCodec<T>, now: i64) -> Result<Self> {
        let header = EnvelopeHeader::read(buf)?;

        let body = match header.body_len {
            None => None,
            Some(len) if header.has_expired(now) => {
                buf.advance(len);
                None
            }
            Some(len) => {
                let bytes = buf.copy_to_bytes(len);
                Some(codec.decode(&bytes)?)
            }
        };

        Ok(Self {
            expiry: header.expiry,
            body,
        })
    }
}
