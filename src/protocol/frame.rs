//! Frame codec: one message in, one wire frame out, and back.
//!
//! Wire format (integers big-endian):
//!
//! ```text
//! offset 0   u32 serialized_size   size of the uncompressed payload
//! offset 4   u32 compressed_size   size of the body that follows;
//!                                  == serialized_size means "stored raw"
//! offset 8   [u8; 32] digest       BLAKE3 of the uncompressed payload
//! offset 40  body
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::message::Message;
use crate::error::FrameError;

/// Fixed header length: two sizes and the digest.
pub const HEADER_SIZE: usize = 4 + 4 + DIGEST_SIZE;

pub const DIGEST_SIZE: usize = 32;

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// zstd level used for payload compression
pub const COMPRESSION_LEVEL: i32 = 3;

pub type Digest = [u8; DIGEST_SIZE];

// =============================================================================
// Primitives
// =============================================================================

pub fn digest(data: &[u8]) -> Digest {
    *blake3::hash(data).as_bytes()
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    zstd::bulk::compress(data, COMPRESSION_LEVEL)
        .map_err(|e| FrameError::Decompress(format!("compression failed: {}", e)))
}

pub fn decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>, FrameError> {
    let out = zstd::bulk::decompress(data, expected_size)
        .map_err(|e| FrameError::Decompress(e.to_string()))?;
    if out.len() != expected_size {
        return Err(FrameError::Decompress(format!(
            "expected {} bytes, got {}",
            expected_size,
            out.len()
        )));
    }
    Ok(out)
}

// =============================================================================
// Header
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub serialized_size: u32,
    pub compressed_size: u32,
    pub digest: Digest,
}

impl FrameHeader {
    /// Body stored raw rather than compressed.
    pub fn is_raw(&self) -> bool {
        self.compressed_size == self.serialized_size
    }

    /// Number of body bytes that follow the header.
    pub fn body_len(&self) -> usize {
        self.compressed_size as usize
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.serialized_size);
        buf.put_u32(self.compressed_size);
        buf.put_slice(&self.digest);
    }

    /// Parse and validate a header from exactly [`HEADER_SIZE`] bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Truncated("frame header"));
        }
        let mut b = &bytes[..HEADER_SIZE];
        let serialized_size = b.get_u32();
        let compressed_size = b.get_u32();
        let mut digest = [0u8; DIGEST_SIZE];
        b.copy_to_slice(&mut digest);

        for size in [serialized_size, compressed_size] {
            if size as usize > MAX_FRAME_SIZE {
                return Err(FrameError::TooLarge {
                    size: size as usize,
                    max: MAX_FRAME_SIZE,
                });
            }
        }

        Ok(Self {
            serialized_size,
            compressed_size,
            digest,
        })
    }
}

// =============================================================================
// Encode / decode
// =============================================================================

/// Encode one message as a complete frame.
///
/// The compressed body is used only when it is strictly smaller than the
/// payload; otherwise the payload is stored raw and both sizes are equal.
pub fn encode(msg: &Message) -> Result<Bytes, FrameError> {
    let payload = msg.to_payload()?;
    encode_payload(&payload)
}

pub fn encode_payload(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let digest = digest(payload);
    let compressed = compress(payload)?;
    let body: &[u8] = if compressed.len() < payload.len() {
        &compressed
    } else {
        payload
    };

    let header = FrameHeader {
        serialized_size: payload.len() as u32,
        compressed_size: body.len() as u32,
        digest,
    };

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    header.write(&mut buf);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Recover the verified, uncompressed payload of one frame.
pub fn open_body(header: &FrameHeader, body: Bytes) -> Result<Bytes, FrameError> {
    if body.len() != header.body_len() {
        return Err(FrameError::Truncated("frame body"));
    }

    let payload = if header.is_raw() {
        body
    } else {
        Bytes::from(decompress(&body, header.serialized_size as usize)?)
    };

    let actual = digest(&payload);
    if actual != header.digest {
        return Err(FrameError::Corrupted {
            expected: hex::encode(header.digest),
            actual: hex::encode(actual),
        });
    }
    Ok(payload)
}

/// Decode one frame's body into a message, verifying the digest first.
pub fn decode(header: &FrameHeader, body: Bytes) -> Result<Message, FrameError> {
    let payload = open_body(header, body)?;
    Message::from_payload(payload)
}

/// Decode a buffer holding exactly one complete frame.
pub fn decode_frame(frame: &[u8]) -> Result<Message, FrameError> {
    let header = FrameHeader::parse(frame)?;
    let body = &frame[HEADER_SIZE..];
    if body.len() != header.body_len() {
        return Err(FrameError::Truncated("frame body"));
    }
    decode(&header, Bytes::copy_from_slice(body))
}
