//! Payload codecs
//!
//! Every envelope names the codec its payload was written with, so a server
//! can talk to JSON and Postcard clients at the same time and always answers
//! in the codec of the request.
//!
//! # Codec IDs
//!
//! - `1`: JSON (serde_json)
//! - `2`: Postcard (compact binary)

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{ProtocolError, Result};

/// Codec identifier for JSON payloads
pub const JSON_CODEC_ID: u8 = 1;

/// Codec identifier for Postcard payloads
pub const POSTCARD_CODEC_ID: u8 = 2;

/// Serializes and deserializes message payloads
pub trait Codec: Send + Sync {
    /// Returns the codec ID written into envelopes
    fn id(&self) -> u8;

    /// Returns a human-readable name for this codec
    fn name(&self) -> &'static str;

    /// Encodes a serializable message into bytes
    fn encode<T: Serialize>(&self, message: &T) -> Result<Bytes>;

    /// Decodes bytes into a deserializable message
    fn decode<T: DeserializeOwned>(&self, bytes: &Bytes) -> Result<T>;
}

/// JSON codec, readable on the wire and easy to inspect from browser tooling
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn id(&self) -> u8 {
        JSON_CODEC_ID
    }

    fn name(&self) -> &'static str {
        "JSON"
    }

    fn encode<T: Serialize>(&self, message: &T) -> Result<Bytes> {
        let vec = serde_json::to_vec(message)
            .map_err(|e| ProtocolError::CodecError(format!("JSON encode failed: {}", e)))?;
        Ok(Bytes::from(vec))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &Bytes) -> Result<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::CodecError(format!("JSON decode failed: {}", e)))
    }
}

/// Postcard codec, for large snapshots and histories
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    fn id(&self) -> u8 {
        POSTCARD_CODEC_ID
    }

    fn name(&self) -> &'static str {
        "Postcard"
    }

    fn encode<T: Serialize>(&self, message: &T) -> Result<Bytes> {
        let vec = postcard::to_allocvec(message)
            .map_err(|e| ProtocolError::CodecError(format!("Postcard encode failed: {}", e)))?;
        Ok(Bytes::from(vec))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &Bytes) -> Result<T> {
        postcard::from_bytes(bytes)
            .map_err(|e| ProtocolError::CodecError(format!("Postcard decode failed: {}", e)))
    }
}

/// All codecs a peer understands, selected by the envelope's codec ID
#[derive(Debug, Clone, Copy)]
pub enum CodecType {
    Json(JsonCodec),
    Postcard(PostcardCodec),
}

impl CodecType {
    /// Looks up a codec by its ID
    pub fn from_id(codec_id: u8) -> Result<Self> {
        match codec_id {
            JSON_CODEC_ID => Ok(CodecType::Json(JsonCodec)),
            POSTCARD_CODEC_ID => Ok(CodecType::Postcard(PostcardCodec)),
            _ => Err(ProtocolError::CodecError(format!(
                "Unknown codec ID: {}",
                codec_id
            ))),
        }
    }

    /// Returns the codec ID
    pub fn id(&self) -> u8 {
        match self {
            CodecType::Json(c) => c.id(),
            CodecType::Postcard(c) => c.id(),
        }
    }

    /// Returns the codec name
    pub fn name(&self) -> &'static str {
        match self {
            CodecType::Json(c) => c.name(),
            CodecType::Postcard(c) => c.name(),
        }
    }

    /// Encodes a message using the selected codec
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Bytes> {
        match self {
            CodecType::Json(c) => c.encode(message),
            CodecType::Postcard(c) => c.encode(message),
        }
    }

    /// Decodes a message using the selected codec
    pub fn decode<T: DeserializeOwned>(&self, bytes: &Bytes) -> Result<T> {
        match self {
            CodecType::Json(c) => c.decode(bytes),
            CodecType::Postcard(c) => c.decode(bytes),
        }
    }
}

impl Default for CodecType {
    fn default() -> Self {
        CodecType::Json(JsonCodec)
    }
}
