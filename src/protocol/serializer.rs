//! Message serializers
//!
//! The connection core only moves bytes. A [`Serializer`] turns application
//! messages into payload frames and back; clients and servers are generic
//! over it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;

use super::CodecError;

/// Converts between application messages and payload bytes
pub trait Serializer: Send + Sync + 'static {
    /// The application message type
    type Message: Send + 'static;

    fn serialize(&self, message: &Self::Message) -> Result<Vec<u8>, CodecError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Message, CodecError>;
}

/// Identity serializer: messages are plain byte buffers
#[derive(Debug, Clone, Copy, Default)]
pub struct RawBytes;

impl Serializer for RawBytes {
    type Message = Vec<u8>;

    fn serialize(&self, message: &Vec<u8>) -> Result<Vec<u8>, CodecError> {
        Ok(message.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }
}

/// Compact binary encoding of any serde type
pub struct Bincode<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Bincode<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Bincode<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Bincode<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Bincode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Bincode")
    }
}

impl<T> Serializer for Bincode<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Message = T;

    fn serialize(&self, message: &T) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(message)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// JSON encoding of any serde type, for peers that want readable payloads
pub struct Json<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Json<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Json<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Json<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Json")
    }
}

impl<T> Serializer for Json<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Message = T;

    fn serialize(&self, message: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(message)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
