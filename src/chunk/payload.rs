//! Chunk: the atomic unit of data moved through streams.

use bytes::Bytes;

use super::Encoding;
use crate::config::Mode;
use crate::error::{Result, StreamError};

/// Data carried by a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<T> {
    /// Raw bytes.
    Bytes(Bytes),
    /// Text, interpreted through the chunk encoding when normalized.
    Text(String),
    /// Arbitrary value (object mode only).
    Value(T),
}

/// A unit of data plus an optional encoding tag.
///
/// In binary mode chunks are normalized to [`Payload::Bytes`] before they
/// enter a queue. In object mode a chunk is one logical item of size 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<T = ()> {
    payload: Payload<T>,
    encoding: Option<Encoding>,
}

impl<T> Chunk<T> {
    /// Byte chunk.
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Self {
            payload: Payload::Bytes(data.into()),
            encoding: None,
        }
    }

    /// Text chunk using the stream default encoding.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload: Payload::Text(text.into()),
            encoding: None,
        }
    }

    /// Text chunk with an explicit encoding.
    pub fn text_with(text: impl Into<String>, encoding: Encoding) -> Self {
        Self {
            payload: Payload::Text(text.into()),
            encoding: Some(encoding),
        }
    }

    /// Object chunk.
    pub fn value(value: T) -> Self {
        Self {
            payload: Payload::Value(value),
            encoding: None,
        }
    }

    /// Borrow the payload.
    #[inline]
    pub fn payload(&self) -> &Payload<T> {
        &self.payload
    }

    /// Take the payload.
    #[inline]
    pub fn into_payload(self) -> Payload<T> {
        self.payload
    }

    /// Encoding tag.
    #[inline]
    pub fn encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    /// Bytes, if this is a byte chunk.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Text, if this is a text chunk.
    pub fn as_text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Value, if this is an object chunk.
    pub fn as_value(&self) -> Option<&T> {
        match &self.payload {
            Payload::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Take the bytes, if this is a byte chunk.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self.payload {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Take the value, if this is an object chunk.
    pub fn into_value(self) -> Option<T> {
        match self.payload {
            Payload::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Length in bytes of a byte or text payload (0 for values).
    pub fn byte_len(&self) -> usize {
        match &self.payload {
            Payload::Bytes(b) => b.len(),
            Payload::Text(s) => s.len(),
            Payload::Value(_) => 0,
        }
    }

    /// Whether a byte or text payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        !matches!(self.payload, Payload::Value(_)) && self.byte_len() == 0
    }

    /// Size of this chunk for watermark accounting.
    #[inline]
    pub fn size(&self, mode: Mode) -> usize {
        match mode {
            Mode::Binary => self.byte_len(),
            Mode::Object => 1,
        }
    }

    /// Normalize for entry into a queue of the given mode.
    ///
    /// Binary mode encodes text into bytes (chunk tag first, then the
    /// stream default, then UTF-8) and rejects values. Object mode keeps
    /// the chunk untouched.
    pub fn normalize(self, mode: Mode, default_encoding: Option<Encoding>) -> Result<Self> {
        if mode == Mode::Object {
            return Ok(self);
        }
        match self.payload {
            Payload::Bytes(_) => Ok(Self {
                payload: self.payload,
                encoding: None,
            }),
            Payload::Text(text) => {
                let encoding = self
                    .encoding
                    .or(default_encoding)
                    .unwrap_or(Encoding::Utf8);
                Ok(Self {
                    payload: Payload::Bytes(encoding.encode(&text)?),
                    encoding: None,
                })
            }
            Payload::Value(_) => Err(StreamError::InvalidChunk(
                "binary streams accept only bytes or text".to_string(),
            )),
        }
    }
}

impl<T> From<Bytes> for Chunk<T> {
    fn from(data: Bytes) -> Self {
        Chunk::bytes(data)
    }
}

impl<T> From<&'static [u8]> for Chunk<T> {
    fn from(data: &'static [u8]) -> Self {
        Chunk::bytes(Bytes::from_static(data))
    }
}

impl<T> From<String> for Chunk<T> {
    fn from(text: String) -> Self {
        Chunk::text(text)
    }
}
