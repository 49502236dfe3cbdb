//! Text encodings for chunk normalization and decoding.
//!
//! [`Encoding::encode`] turns text into bytes (used when a text chunk enters
//! a binary stream). [`Decoder`] turns a byte stream back into text without
//! splitting multi-byte sequences across chunk boundaries.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

/// Supported text encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// UTF-8 text.
    Utf8,
    /// One byte per character (code points above 255 are truncated).
    Latin1,
    /// Lowercase hexadecimal, two characters per byte.
    Hex,
    /// Standard base64 with padding.
    Base64,
}

impl Encoding {
    /// Canonical name.
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Latin1 => "latin1",
            Encoding::Hex => "hex",
            Encoding::Base64 => "base64",
        }
    }

    /// Encode text into bytes.
    pub fn encode(self, text: &str) -> Result<Bytes> {
        match self {
            Encoding::Utf8 => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Encoding::Latin1 => Ok(text
                .chars()
                .map(|c| c as u32 as u8)
                .collect::<Vec<u8>>()
                .into()),
            Encoding::Hex => hex::decode(text)
                .map(Bytes::from)
                .map_err(|e| StreamError::InvalidChunk(format!("invalid hex text: {}", e))),
            Encoding::Base64 => STANDARD
                .decode(text)
                .map(Bytes::from)
                .map_err(|e| StreamError::InvalidChunk(format!("invalid base64 text: {}", e))),
        }
    }

    /// Decode a complete byte sequence into text.
    pub fn decode(self, bytes: &[u8]) -> String {
        let mut decoder = Decoder::new(self);
        let mut text = decoder.write(bytes);
        text.push_str(&decoder.end());
        text
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = StreamError;

    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "latin1" | "binary" => Ok(Encoding::Latin1),
            "hex" => Ok(Encoding::Hex),
            "base64" => Ok(Encoding::Base64),
            _ => Err(StreamError::UnknownEncoding(name.to_string())),
        }
    }
}

/// Streaming bytes-to-text decoder.
///
/// Incomplete input at the end of a chunk (a partial UTF-8 sequence, or a
/// base64 group shorter than three bytes) is carried over to the next
/// [`write`](Decoder::write) and flushed by [`end`](Decoder::end).
#[derive(Debug, Clone)]
pub struct Decoder {
    encoding: Encoding,
    carry: Vec<u8>,
}

impl Decoder {
    /// Create a decoder for the given encoding.
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            carry: Vec::new(),
        }
    }

    /// Encoding of this decoder.
    #[inline]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Number of bytes held back for the next write.
    #[inline]
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    /// Decode the next piece of input.
    pub fn write(&mut self, bytes: &[u8]) -> String {
        match self.encoding {
            Encoding::Utf8 => {
                self.carry.extend_from_slice(bytes);
                let keep = incomplete_utf8_tail(&self.carry);
                let complete = self.carry.len() - keep;
                let text = String::from_utf8_lossy(&self.carry[..complete]).into_owned();
                self.carry.drain(..complete);
                text
            }
            Encoding::Base64 => {
                self.carry.extend_from_slice(bytes);
                let complete = self.carry.len() - self.carry.len() % 3;
                let text = STANDARD.encode(&self.carry[..complete]);
                self.carry.drain(..complete);
                text
            }
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Encoding::Hex => hex::encode(bytes),
        }
    }

    /// Flush carried input.
    pub fn end(&mut self) -> String {
        if self.carry.is_empty() {
            return String::new();
        }
        let rest = std::mem::take(&mut self.carry);
        match self.encoding {
            Encoding::Utf8 => String::from_utf8_lossy(&rest).into_owned(),
            Encoding::Base64 => STANDARD.encode(&rest),
            Encoding::Latin1 => rest.iter().map(|&b| b as char).collect(),
            Encoding::Hex => hex::encode(&rest),
        }
    }
}

/// Length of a trailing, not yet complete UTF-8 sequence.
fn incomplete_utf8_tail(data: &[u8]) -> usize {
    for back in 1..=data.len().min(3) {
        let byte = data[data.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}
