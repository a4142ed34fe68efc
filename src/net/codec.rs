//! Frame codec
//!
//! Four message representations share one byte stream:
//! - `stream`: raw bytes, no framing, whatever is buffered is one frame
//! - `bytes`: native-order u32 total length (payload + 4) then the payload
//! - `string`: UTF-8 text terminated by a single NUL byte
//! - `json`: serialized JSON text terminated by a single NUL byte
//!
//! The length header is written in native byte order and is not normalized
//! to network order.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;
use crate::net::buffer::ReceiveBuffer;

/// Default maximum encoded frame size (512 KiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024;

/// Size of the `bytes` length header
pub const SIZE_PREFIX_LEN: usize = 4;

/// Delimiter of `string` and `json` frames
pub const TERMINATOR: u8 = 0;

/// How frames are laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Stream,
    Bytes,
    String,
    Json,
}

impl DataType {
    /// Parse a `data_type` option value, case-insensitively
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "stream" => Some(DataType::Stream),
            "bytes" => Some(DataType::Bytes),
            "string" => Some(DataType::String),
            "json" => Some(DataType::Json),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Stream => "stream",
            DataType::Bytes => "bytes",
            DataType::String => "string",
            DataType::Json => "json",
        }
    }

    /// Whether `bytes` frames carry the length header under this data type
    pub fn uses_size_prefix(&self) -> bool {
        !matches!(self, DataType::Stream)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One application-level message
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Stream(Bytes),
    Bytes(Bytes),
    String(String),
    Json(Value),
}

impl Frame {
    /// The data type this frame is encoded as
    pub fn data_type(&self) -> DataType {
        match self {
            Frame::Stream(_) => DataType::Stream,
            Frame::Bytes(_) => DataType::Bytes,
            Frame::String(_) => DataType::String,
            Frame::Json(_) => DataType::Json,
        }
    }

    /// Raw payload of `stream` and `bytes` frames
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::Stream(bytes) | Frame::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Frame::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Frame::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Frame::String(text.to_string())
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::String(text)
    }
}

impl From<Value> for Frame {
    fn from(value: Value) -> Self {
        Frame::Json(value)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Frame::Bytes(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Frame {
    fn from(bytes: &[u8]) -> Self {
        Frame::Bytes(Bytes::copy_from_slice(bytes))
    }
}

/// A frame pulled out of a receive buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub frame: Frame,
    /// Payload bytes the frame occupied on the wire, framing excluded
    pub size: usize,
}

/// Encoder/decoder bound to a session's data type
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    data_type: DataType,
    size_prefix: bool,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(data_type: DataType, max_frame_size: usize) -> Self {
        Self {
            data_type,
            size_prefix: data_type.uses_size_prefix(),
            max_frame_size,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn size_prefix(&self) -> bool {
        self.size_prefix
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame into its complete wire form.
    ///
    /// Nothing is produced unless the whole frame fits the size bound.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes, CodecError> {
        match frame {
            Frame::Stream(payload) => {
                self.check_size(payload.len(), 0)?;
                Ok(payload.clone())
            }
            Frame::Bytes(payload) if self.size_prefix => {
                self.check_size(payload.len(), SIZE_PREFIX_LEN)?;
                let total = payload.len() + SIZE_PREFIX_LEN;
                let mut out = BytesMut::with_capacity(total);
                out.put_slice(&(total as u32).to_ne_bytes());
                out.put_slice(payload);
                Ok(out.freeze())
            }
            Frame::Bytes(payload) => {
                self.check_size(payload.len(), 0)?;
                Ok(payload.clone())
            }
            Frame::String(text) => self.encode_terminated(text.as_bytes()),
            Frame::Json(value) => {
                let text =
                    serde_json::to_string(value).map_err(|e| CodecError::Json(e.to_string()))?;
                self.encode_terminated(text.as_bytes())
            }
        }
    }

    /// Extract the next complete frame, if one is buffered.
    ///
    /// Returns `Ok(None)` while more bytes are needed. Errors for which
    /// [`CodecError::is_fatal`] holds leave the buffer unusable and the
    /// connection must be dropped; a JSON parse error has already consumed
    /// its frame.
    pub fn decode(&self, buf: &mut ReceiveBuffer) -> Result<Option<Decoded>, CodecError> {
        match self.data_type {
            DataType::Stream => {
                if !buf.has_remaining() {
                    return Ok(None);
                }
                let payload = buf.take_all();
                let size = payload.len();
                Ok(Some(Decoded {
                    frame: Frame::Stream(payload),
                    size,
                }))
            }
            DataType::Bytes => {
                let Some(total) = buf.peek_u32_ne() else {
                    return Ok(None);
                };
                let total_len = total as usize;
                if total_len < SIZE_PREFIX_LEN {
                    return Err(CodecError::InvalidLength(total));
                }
                if total_len > self.max_frame_size {
                    return Err(CodecError::FrameTooLarge {
                        size: total_len,
                        max: self.max_frame_size,
                    });
                }
                if buf.remaining() < total_len {
                    return Ok(None);
                }
                buf.skip(SIZE_PREFIX_LEN);
                let payload = buf.take(total_len - SIZE_PREFIX_LEN);
                let size = payload.len();
                Ok(Some(Decoded {
                    frame: Frame::Bytes(payload),
                    size,
                }))
            }
            DataType::String | DataType::Json => {
                let Some(end) = buf.find(TERMINATOR, self.max_frame_size) else {
                    if buf.remaining() >= self.max_frame_size {
                        return Err(CodecError::FrameTooLarge {
                            size: buf.remaining(),
                            max: self.max_frame_size,
                        });
                    }
                    return Ok(None);
                };
                let payload = buf.take(end);
                buf.skip(1);

                let text = String::from_utf8_lossy(&payload);
                let frame = if self.data_type == DataType::Json {
                    let value: Value =
                        serde_json::from_str(&text).map_err(|e| CodecError::Json(e.to_string()))?;
                    Frame::Json(value)
                } else {
                    Frame::String(text.into_owned())
                };
                Ok(Some(Decoded { frame, size: end }))
            }
        }
    }

    fn encode_terminated(&self, text: &[u8]) -> Result<Bytes, CodecError> {
        self.check_size(text.len(), 1)?;
        if text.contains(&TERMINATOR) {
            return Err(CodecError::EmbeddedTerminator);
        }
        let mut out = BytesMut::with_capacity(text.len() + 1);
        out.put_slice(text);
        out.put_u8(TERMINATOR);
        Ok(out.freeze())
    }

    fn check_size(&self, payload_len: usize, overhead: usize) -> Result<(), CodecError> {
        if payload_len == 0 {
            return Err(CodecError::EmptyPayload);
        }
        let size = payload_len + overhead;
        if size > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

impl CodecError {
    /// Whether the receive buffer can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CodecError::Json(_))
    }
}
