//! JSON payload codec (serde_json).

use std::io::Write;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::PayloadCodec;
use crate::error::CodecError;

const NAME: &str = "json";

/// Encodes payloads as UTF-8 JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<T> PayloadCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn name(&self) -> &str {
        NAME
    }

    fn encode(&self, value: &T, mut out: &mut dyn Write) -> Result<(), CodecError> {
        serde_json::to_writer(&mut out, value).map_err(|e| CodecError::encode(NAME, e))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::decode(NAME, e))
    }
}
