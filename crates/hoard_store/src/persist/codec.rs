//! Value codecs
//!
//! Stored records are text. [`JsonCodec`] is the default; [`FnCodec`] wraps a
//! pair of closures for custom encodings.

use crate::error::CodecError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Converts values to and from their stored text form
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<String, CodecError>;
    fn decode(&self, text: &str) -> Result<T, CodecError>;
}

/// serde_json encoding
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec {
    fn encode(&self, value: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode(&self, text: &str) -> Result<T, CodecError> {
        Ok(serde_json::from_str(text)?)
    }
}

type EncodeFn<T> = dyn Fn(&T) -> Result<String, CodecError> + Send + Sync;
type DecodeFn<T> = dyn Fn(&str) -> Result<T, CodecError> + Send + Sync;

/// Codec built from an encode/decode closure pair
pub struct FnCodec<T> {
    encode: Box<EncodeFn<T>>,
    decode: Box<DecodeFn<T>>,
}

impl<T> FnCodec<T> {
    pub fn new<E, D>(encode: E, decode: D) -> Self
    where
        E: Fn(&T) -> Result<String, CodecError> + Send + Sync + 'static,
        D: Fn(&str) -> Result<T, CodecError> + Send + Sync + 'static,
    {
        Self {
            encode: Box::new(encode),
            decode: Box::new(decode),
        }
    }
}

impl<T> Codec<T> for FnCodec<T> {
    fn encode(&self, value: &T) -> Result<String, CodecError> {
        (self.encode)(value)
    }

    fn decode(&self, text: &str) -> Result<T, CodecError> {
        (self.decode)(text)
    }
}

/// Shared codec handle
pub type SharedCodec<T> = Arc<dyn Codec<T>>;
