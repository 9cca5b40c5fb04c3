//! Codec Module
//!
//! Pluggable payload serialization. A cache resolves exactly one codec by name
//! from a [`CodecRegistry`] when it is built.

mod json;
mod msgpack;
mod raw;

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::io::Write;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, CodecError, Result};

pub use json::JsonCodec;
pub use msgpack::MessagePackCodec;
pub use raw::{RawCodec, Utf8Codec};

// == Payload Codec ==
/// Converts an application value to and from the envelope body.
///
/// `encode` streams into the writer; it does not need to know its output size
/// up front. `decode(encode(v))` must yield a value equal to `v`.
pub trait PayloadCodec<T>: Send + Sync {
    /// Name the codec is registered under.
    fn name(&self) -> &str;

    fn encode(&self, value: &T, out: &mut dyn Write) -> std::result::Result<(), CodecError>;

    fn decode(&self, bytes: &[u8]) -> std::result::Result<T, CodecError>;
}

// == Codec Registry ==
/// Name to codec lookup for one payload type.
pub struct CodecRegistry<T> {
    codecs: HashMap<String, Arc<dyn PayloadCodec<T>>>,
}

impl<T> CodecRegistry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registers a codec under its own name, replacing any previous one.
    pub fn register<C>(mut self, codec: C) -> Self
    where
        C: PayloadCodec<T> + 'static,
    {
        self.codecs
            .insert(codec.name().to_string(), Arc::new(codec));
        self
    }

    /// Looks up the codec registered under `name`.
    ///
    /// Fails with [`CacheError::Config`] when nothing is registered there.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn PayloadCodec<T>>> {
        self.codecs.get(name).cloned().ok_or_else(|| {
            CacheError::Config(format!("no codec registered under `{}`", name))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.codecs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl<T> CodecRegistry<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Registry with the serde-based codecs: `json` and `msgpack`.
    pub fn with_defaults() -> Self {
        Self::new().register(JsonCodec).register(MessagePackCodec)
    }
}

impl<T> Default for CodecRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for CodecRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.names())
            .finish()
    }
}
