//! Pass-through codecs for payloads that already are bytes or text.

use std::io::Write;

use super::PayloadCodec;
use crate::error::CodecError;

/// Stores `Vec<u8>` payloads verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl PayloadCodec<Vec<u8>> for RawCodec {
    fn name(&self) -> &str {
        "raw"
    }

    fn encode(&self, value: &Vec<u8>, out: &mut dyn Write) -> Result<(), CodecError> {
        out.write_all(value).map_err(|e| CodecError::encode("raw", e))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }
}

/// Stores `String` payloads as their UTF-8 bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8Codec;

impl PayloadCodec<String> for Utf8Codec {
    fn name(&self) -> &str {
        "utf8"
    }

    fn encode(&self, value: &String, out: &mut dyn Write) -> Result<(), CodecError> {
        out.write_all(value.as_bytes())
            .map_err(|e| CodecError::encode("utf8", e))
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::decode("utf8", e))
    }
}
