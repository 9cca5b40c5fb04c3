//! Error types for the cache
//!
//! Provides unified error handling using thiserror. Each layer has its own
//! error enum; everything converges on [`CacheError`] at the facade.

use thiserror::Error;

// == Codec Error ==
/// Failure inside a payload codec.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The value could not be written to the body stream
    #[error("Failed to encode payload with `{codec}` codec: {source}")]
    Encode {
        codec: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The body bytes could not be turned back into a value
    #[error("Failed to decode payload with `{codec}` codec: {source}")]
    Decode {
        codec: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl CodecError {
    pub fn encode(
        codec: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Encode {
            codec: codec.into(),
            source: source.into(),
        }
    }

    pub fn decode(
        codec: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Decode {
            codec: codec.into(),
            source: source.into(),
        }
    }
}

// == Envelope Error ==
/// A stored record that does not follow the envelope layout.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Fewer bytes remain than the header announced
    #[error("Envelope truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// The body length prefix is negative
    #[error("Envelope body length is negative: {0}")]
    NegativeLength(i32),

    /// The body does not fit in the 4-byte length prefix
    #[error("Envelope body of {0} bytes exceeds the length prefix range")]
    BodyTooLarge(usize),

    /// Flag bits outside HAS_EXPIRY | HAS_BODY are set
    #[error("Unknown envelope flags: {0:#04x}")]
    UnknownFlags(u8),
}

// == Engine Error ==
/// Failure reported by the underlying key-value engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Backing storage I/O failure
    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine has been closed
    #[error("Engine is closed")]
    Closed,

    /// A checkpoint file could not be parsed
    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// A key or value is too long for the checkpoint length prefix
    #[error("Record of {0} bytes exceeds the checkpoint length prefix range")]
    RecordTooLarge(usize),

    /// Engine options were rejected at open time
    #[error("Invalid engine options: {0}")]
    InvalidOptions(String),
}

// == Cache Error Enum ==
/// Unified error type for the cache facade.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The cache could not be built from its configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Empty key, non-positive expiry and similar caller mistakes
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The cache has been closed
    #[error("Cache is closed")]
    Closed,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Corrupt record: {0}")]
    Envelope(#[from] EnvelopeError),

    /// A GetOrAdd value factory failed; the store was not modified
    #[error("Value factory failed: {0}")]
    Factory(#[source] anyhow::Error),
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_converts_into_cache_error() {
        let err: CacheError = EngineError::Closed.into();
        assert!(matches!(err, CacheError::Engine(EngineError::Closed)));
        assert_eq!(err.to_string(), "Engine is closed");
    }

    #[test]
    fn test_error_messages_are_capitalised() {
        let messages = [
            EngineError::Closed.to_string(),
            EngineError::RecordTooLarge(1).to_string(),
            EnvelopeError::UnknownFlags(0xf0).to_string(),
            CodecError::encode("json", "boom").to_string(),
            CacheError::Closed.to_string(),
        ];
        for message in messages {
            let first = message.chars().next().unwrap();
            assert!(first.is_uppercase(), "{message}");
        }
    }

    #[test]
    fn test_codec_error_keeps_codec_name() {
        let source = serde_json::from_slice::<u32>(b"not json").unwrap_err();
        let err = CodecError::decode("json", source);
        assert!(err.to_string().contains("`json`"));
    }

    #[test]
    fn test_factory_error_display() {
        let err = CacheError::Factory(anyhow::anyhow!("backend down"));
        assert_eq!(err.to_string(), "Value factory failed: backend down");
    }
}
