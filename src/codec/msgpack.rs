//! MessagePack payload codec (rmp-serde).

use std::io::Write;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::PayloadCodec;
use crate::error::CodecError;

const NAME: &str = "msgpack";

/// Encodes payloads as MessagePack with named struct fields, so records stay
/// readable after fields are reordered.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessagePackCodec;

impl<T> PayloadCodec<T> for MessagePackCodec
where
    T: Serialize + DeserializeOwned,
{
    fn name(&self) -> &str {
        NAME
    }

    fn encode(&self, value: &T, mut out: &mut dyn Write) -> Result<(), CodecError> {
        let mut serializer = rmp_serde::Serializer::new(&mut out).with_struct_map();
        value
            .serialize(&mut serializer)
            .map_err(|e| CodecError::encode(NAME, e))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        rmp_serde::from_slice(bytes).map_err(|e| CodecError::decode(NAME, e))
    }
}
