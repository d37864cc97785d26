//! Wire protocol between agents and the collector.
//!
//! # Layers
//!
//! ```text
//! bytes from socket -> StreamDecoder -> FrameHeader + body -> Message
//! Message -> payload -> digest + (maybe) compress -> frame -> socket
//! ```
//!
//! One frame carries exactly one message. Frames are self-delimiting, so a
//! TCP stream can be cut at arbitrary points and reassembled.

pub mod decoder;
pub mod frame;
pub mod message;

pub use decoder::StreamDecoder;
pub use frame::{
    decode, decode_frame, encode, FrameHeader, DIGEST_SIZE, HEADER_SIZE, MAX_FRAME_SIZE,
};
pub use message::{Body, Envelope, Event, LogLevel, LogPackage, Message, Operation};
