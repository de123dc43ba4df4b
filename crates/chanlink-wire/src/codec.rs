//! Record serialization and stream framing.
//!
//! A frame on the wire is `escape(compress?(serialize(message))) ++ delimiter`.
//!
//! Escaping replaces the delimiter's first byte and the escape byte itself by
//! two-byte sequences, so an escaped body can never contain the delimiter and
//! the reader may split the stream on it blindly. Uncompressed JSON never
//! contains either byte, which keeps the JSON-lines format identical to the
//! legacy `{"type": .., "data": ..}\n` shape.

use crate::error::{WireError, WireResult};
use crate::message::{Message, Meta};
use base64::Engine as _;
use bytes::{Buf, Bytes, BytesMut};
use chanlink_types::{TransportConfig, WireFormat};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::warn;

/// Record separator for the binary format.
pub const BINARY_DELIMITER: &[u8] = b"\0\0\0";

/// Record separator for the JSON-lines format.
pub const JSON_DELIMITER: &[u8] = b"\n";

pub use chanlink_types::config::MAX_FRAME_SIZE;

const ESCAPE: u8 = 0x01;
const ESCAPED_RESERVED: u8 = 0x02;
const ESCAPED_ESCAPE: u8 = 0x03;

/// Escape `body` so that it contains neither `reserved` nor a bare escape byte.
pub fn escape(body: &[u8], reserved: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / 16);
    for &b in body {
        if b == reserved {
            out.extend_from_slice(&[ESCAPE, ESCAPED_RESERVED]);
        } else if b == ESCAPE {
            out.extend_from_slice(&[ESCAPE, ESCAPED_ESCAPE]);
        } else {
            out.push(b);
        }
    }
    out
}

/// Reverse [`escape`].
pub fn unescape(body: &[u8], reserved: u8) -> WireResult<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter();
    while let Some(&b) = iter.next() {
        if b == reserved {
            return Err(WireError::Decode("unescaped delimiter byte".to_string()));
        }
        if b != ESCAPE {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(&ESCAPED_RESERVED) => out.push(reserved),
            Some(&ESCAPED_ESCAPE) => out.push(ESCAPE),
            Some(other) => {
                return Err(WireError::Decode(format!(
                    "invalid escape sequence 0x01 0x{other:02x}"
                )))
            }
            None => return Err(WireError::Decode("dangling escape byte".to_string())),
        }
    }
    Ok(out)
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// JSON-lines record shape.
#[derive(Debug, Serialize, Deserialize)]
struct JsonRecord {
    #[serde(rename = "type")]
    channel: String,
    data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<String>,
    #[serde(default, rename = "ackRequired", skip_serializing_if = "is_false")]
    ack_required: bool,
    /// `data` holds base64 because the payload was not valid UTF-8.
    #[serde(default, skip_serializing_if = "is_false")]
    base64: bool,
}

impl From<&Message> for JsonRecord {
    fn from(msg: &Message) -> Self {
        let (data, base64) = match std::str::from_utf8(&msg.data) {
            Ok(text) => (text.to_string(), false),
            Err(_) => (
                base64::engine::general_purpose::STANDARD.encode(&msg.data),
                true,
            ),
        };
        Self {
            channel: msg.channel.clone(),
            data,
            meta: msg.meta.as_tag().map(str::to_string),
            ack_required: msg.ack_required,
            base64,
        }
    }
}

impl TryFrom<JsonRecord> for Message {
    type Error = WireError;

    fn try_from(record: JsonRecord) -> Result<Self, Self::Error> {
        let meta = match record.meta.as_deref() {
            None => Meta::None,
            Some(tag) => Meta::from_tag(tag)
                .ok_or_else(|| WireError::Decode(format!("unknown meta tag '{tag}'")))?,
        };
        let data = if record.base64 {
            base64::engine::general_purpose::STANDARD
                .decode(record.data.as_bytes())
                .map_err(|e| WireError::Decode(e.to_string()))?
                .into()
        } else {
            Bytes::from(record.data)
        };
        Ok(Message {
            channel: record.channel,
            data,
            meta,
            ack_required: record.ack_required,
        })
    }
}

/// Turns messages into frames and records back into messages.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    format: WireFormat,
    compression: bool,
    max_frame: usize,
}

impl Codec {
    pub fn new(format: WireFormat, compression: bool) -> Self {
        Self {
            format,
            compression,
            max_frame: MAX_FRAME_SIZE,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.wire_format, config.compression).with_max_frame(config.max_frame_bytes)
    }

    /// Largest escaped record this codec writes or accepts.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame.max(1);
        self
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn delimiter(&self) -> &'static [u8] {
        match self.format {
            WireFormat::Binary => BINARY_DELIMITER,
            WireFormat::JsonLines => JSON_DELIMITER,
        }
    }

    /// A decoder splitting on this codec's delimiter.
    pub fn frame_decoder(&self) -> FrameDecoder {
        FrameDecoder::new(self.delimiter()).with_max_frame(self.max_frame)
    }

    /// Encode a message into a complete frame, delimiter included.
    ///
    /// Fails with [`WireError::MessageTooLarge`] when the escaped record
    /// exceeds the frame cap, since the peer would refuse it.
    pub fn encode(&self, msg: &Message) -> WireResult<Vec<u8>> {
        let mut body = self.serialize(msg)?;
        if self.compression {
            body = compress(&body)?;
        }
        let delimiter = self.delimiter();
        let mut frame = escape(&body, delimiter[0]);
        if frame.len() > self.max_frame {
            return Err(WireError::MessageTooLarge {
                size: frame.len(),
                max: self.max_frame,
            });
        }
        frame.extend_from_slice(delimiter);
        Ok(frame)
    }

    /// Decode one record (a frame without its delimiter).
    pub fn decode(&self, record: &[u8]) -> WireResult<Message> {
        let mut body = unescape(record, self.delimiter()[0])?;
        if self.compression {
            body = decompress(&body)?;
        }
        self.deserialize(&body)
    }

    fn serialize(&self, msg: &Message) -> WireResult<Vec<u8>> {
        match self.format {
            WireFormat::Binary => {
                rmp_serde::to_vec_named(msg).map_err(|e| WireError::Encode(e.to_string()))
            }
            WireFormat::JsonLines => serde_json::to_vec(&JsonRecord::from(msg))
                .map_err(|e| WireError::Encode(e.to_string())),
        }
    }

    fn deserialize(&self, body: &[u8]) -> WireResult<Message> {
        match self.format {
            WireFormat::Binary => {
                rmp_serde::from_slice(body).map_err(|e| WireError::Decode(e.to_string()))
            }
            WireFormat::JsonLines => {
                let record: JsonRecord =
                    serde_json::from_slice(body).map_err(|e| WireError::Decode(e.to_string()))?;
                Message::try_from(record)
            }
        }
    }
}

fn compress(body: &[u8]) -> WireResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    Ok(encoder.finish()?)
}

fn decompress(body: &[u8]) -> WireResult<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(body)
        .read_to_end(&mut out)
        .map_err(|e| WireError::Decode(format!("zlib: {e}")))?;
    Ok(out)
}

/// Accumulates stream bytes and yields complete records.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    delimiter: &'static [u8],
    max_frame: usize,
    /// Prefix of `buf` already known to hold no delimiter.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new(delimiter: &'static [u8]) -> Self {
        Self {
            buf: BytesMut::new(),
            delimiter,
            max_frame: MAX_FRAME_SIZE,
            scanned: 0,
        }
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Append bytes read from the socket.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete record. Empty records are skipped.
    ///
    /// A record larger than the frame cap, complete or still arriving, is an
    /// error: the buffer is discarded and the stream cannot be resynchronized.
    pub fn next_record(&mut self) -> WireResult<Option<Bytes>> {
        loop {
            // A delimiter may straddle the old scan boundary.
            let start = self.scanned.saturating_sub(self.delimiter.len() - 1);
            let Some(pos) = find(&self.buf[start..], self.delimiter).map(|p| p + start) else {
                self.scanned = self.buf.len();
                if self.buf.len() > self.max_frame + self.delimiter.len() {
                    return Err(self.oversized(self.buf.len()));
                }
                return Ok(None);
            };
            if pos > self.max_frame {
                return Err(self.oversized(pos));
            }
            let record = self.buf.split_to(pos).freeze();
            self.buf.advance(self.delimiter.len());
            self.scanned = 0;
            if !record.is_empty() {
                return Ok(Some(record));
            }
        }
    }

    fn oversized(&mut self, size: usize) -> WireError {
        warn!(
            size,
            max = self.max_frame,
            "CL: record exceeds frame cap"
        );
        self.buf.clear();
        self.scanned = 0;
        WireError::MessageTooLarge {
            size,
            max: self.max_frame,
        }
    }

    /// Bytes held after the last delimiter.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
