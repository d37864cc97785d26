//! Incremental stream decoder.
//!
//! Consumes byte chunks exactly as the socket hands them over and emits a
//! FIFO of fully reassembled messages. Frame boundaries may fall anywhere:
//! inside the header, inside the body, or on a chunk boundary, and a single
//! chunk may carry any number of frames.
//!
//! The first frame error poisons the decoder; the stream's byte alignment
//! can no longer be trusted, so later `feed` calls are refused.

use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use super::frame::{self, FrameHeader, HEADER_SIZE};
use super::message::Message;
use crate::error::FrameError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHeader,
    AwaitingBody(FrameHeader),
    Failed,
}

struct Inner {
    state: State,
    /// Bytes received but not yet consumed by a complete header or body
    buf: BytesMut,
    ready: VecDeque<Message>,
}

impl Inner {
    /// Bytes still required before the current frame-local step completes.
    fn needed(&self) -> usize {
        match self.state {
            State::AwaitingHeader => HEADER_SIZE.saturating_sub(self.buf.len()),
            State::AwaitingBody(header) => header.body_len().saturating_sub(self.buf.len()),
            State::Failed => 0,
        }
    }

    fn step(&mut self) -> Result<bool, FrameError> {
        match self.state {
            State::AwaitingHeader => {
                if self.buf.len() < HEADER_SIZE {
                    return Ok(false);
                }
                let header_bytes = self.buf.split_to(HEADER_SIZE);
                let header = FrameHeader::parse(&header_bytes)?;
                self.state = State::AwaitingBody(header);
                Ok(true)
            }
            State::AwaitingBody(header) => {
                if self.buf.len() < header.body_len() {
                    return Ok(false);
                }
                let body = self.buf.split_to(header.body_len()).freeze();
                let msg = frame::decode(&header, body)?;
                self.ready.push_back(msg);
                self.state = State::AwaitingHeader;
                Ok(true)
            }
            State::Failed => Err(FrameError::Poisoned),
        }
    }
}

/// Per-connection frame reassembler. Shareable across threads; every state
/// mutation happens under one lock.
pub struct StreamDecoder {
    inner: Mutex<Inner>,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::AwaitingHeader,
                buf: BytesMut::new(),
                ready: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Lock poisoning is ignored; `feed` marks stream failure itself.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feed one chunk. Returns how many messages this call completed.
    ///
    /// On error the decoder is poisoned and no further messages are
    /// produced; messages completed earlier in the same chunk stay queued.
    pub fn feed(&self, chunk: &[u8]) -> Result<usize, FrameError> {
        let mut inner = self.lock();
        if inner.state == State::Failed {
            return Err(FrameError::Poisoned);
        }

        inner.buf.extend_from_slice(chunk);
        let before = inner.ready.len();

        loop {
            match inner.step() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    inner.state = State::Failed;
                    inner.buf.clear();
                    return Err(e);
                }
            }
        }

        Ok(inner.ready.len() - before)
    }

    /// Pop the oldest decoded message.
    pub fn dequeue(&self) -> Option<Message> {
        self.lock().ready.pop_front()
    }

    /// Number of decoded messages waiting to be dequeued.
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Bytes required before the next header or body can be processed.
    pub fn needed(&self) -> usize {
        self.lock().needed()
    }

    /// Bytes buffered for the frame currently being assembled.
    pub fn buffered(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.lock().state == State::Failed
    }

    /// Drop all buffered bytes and undelivered messages.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = State::AwaitingHeader;
        inner.buf.clear();
        inner.ready.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, OsKind};
    use crate::protocol::message::{Body, Event, LogLevel};

    fn sender() -> Identity {
        Identity::new("host-c", OsKind::Windows, "10.0.22631", "cafebabe")
    }

    fn log_message(count: u64, base: u64) -> Message {
        let events = (0..count)
            .map(|i| Event {
                xml: format!("<Event><System><EventRecordID>{}</EventRecordID></System></Event>", base + i),
                format: format!("synthetic event {}", base + i),
                timestamp: "2026-10-19T09:30:00Z".to_string(),
                provider: "Microsoft-Windows-Kernel-General".to_string(),
                level: LogLevel::from_numeric((i % 5 + 1) as u32),
                record_id: base + i,
            })
            .collect();
        Message::log(&sender(), events, count == 30)
    }

    fn drain(decoder: &StreamDecoder) -> Vec<Message> {
        std::iter::from_fn(|| decoder.dequeue()).collect()
    }

    #[test]
    fn test_whole_frame() {
        let msg = Message::connect(&sender());
        let decoder = StreamDecoder::new();

        assert_eq!(decoder.feed(&frame::encode(&msg).unwrap()).unwrap(), 1);
        assert_eq!(drain(&decoder), vec![msg]);
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.needed(), HEADER_SIZE);
    }

    #[test]
    fn test_empty_log_package_yields_one_message() {
        let msg = Message::log(&sender(), Vec::new(), false);
        let decoder = StreamDecoder::new();
        decoder.feed(&frame::encode(&msg).unwrap()).unwrap();

        assert_eq!(decoder.ready_len(), 1);
        match decoder.dequeue().unwrap().body {
            Body::Log(log) => assert_eq!(log.events.len(), 0),
            other => panic!("Expected Log, got {:?}", other),
        }
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let msg = log_message(75, 1000);
        let bytes = frame::encode(&msg).unwrap();
        let decoder = StreamDecoder::new();

        for (i, b) in bytes.iter().enumerate() {
            decoder.feed(std::slice::from_ref(b)).unwrap();
            if i + 1 < bytes.len() {
                assert_eq!(decoder.ready_len(), 0, "message completed early at byte {}", i);
            }
        }
        assert_eq!(decoder.ready_len(), 1);
        assert_eq!(decoder.dequeue().unwrap(), msg);
    }

    #[test]
    fn test_every_split_point() {
        let msg = log_message(3, 7);
        let bytes = frame::encode(&msg).unwrap();

        for k in 0..=bytes.len() {
            let decoder = StreamDecoder::new();
            decoder.feed(&bytes[..k]).unwrap();
            decoder.feed(&bytes[k..]).unwrap();
            assert_eq!(drain(&decoder), vec![msg.clone()], "split at {}", k);
        }
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let a = log_message(60, 1);
        let b = log_message(90, 61);
        let mut joined = frame::encode(&a).unwrap().to_vec();
        joined.extend_from_slice(&frame::encode(&b).unwrap());

        let decoder = StreamDecoder::new();
        assert_eq!(decoder.feed(&joined).unwrap(), 2);
        assert_eq!(drain(&decoder), vec![a.clone(), b.clone()]);

        let decoder = StreamDecoder::new();
        for byte in &joined {
            decoder.feed(std::slice::from_ref(byte)).unwrap();
        }
        assert_eq!(drain(&decoder), vec![a, b]);
    }

    #[test]
    fn test_split_inside_header_tracks_needed() {
        let msg = Message::query_last_event(&sender());
        let bytes = frame::encode(&msg).unwrap();
        let decoder = StreamDecoder::new();

        decoder.feed(&bytes[..10]).unwrap();
        assert_eq!(decoder.needed(), HEADER_SIZE - 10);

        decoder.feed(&bytes[10..HEADER_SIZE]).unwrap();
        assert_eq!(decoder.needed(), bytes.len() - HEADER_SIZE);

        decoder.feed(&bytes[HEADER_SIZE..]).unwrap();
        assert_eq!(decoder.ready_len(), 1);
    }

    #[test]
    fn test_corrupt_payload_poisons_decoder() {
        let good = Message::connect(&sender());
        let bad = log_message(10, 500);
        let mut bytes = frame::encode(&good).unwrap().to_vec();
        let mut bad_frame = frame::encode(&bad).unwrap().to_vec();
        let idx = HEADER_SIZE + bad_frame.len() / 3;
        bad_frame[idx] ^= 0xFF;
        bytes.extend_from_slice(&bad_frame);

        let decoder = StreamDecoder::new();
        let err = decoder.feed(&bytes).unwrap_err();
        assert!(err.is_connection_fatal());
        assert!(decoder.is_poisoned());

        // The frame completed before the corrupt one is still delivered.
        assert_eq!(drain(&decoder), vec![good]);
        assert!(matches!(decoder.feed(&[0u8]), Err(FrameError::Poisoned)));
    }

    #[test]
    fn test_shared_across_threads() {
        use std::sync::Arc;

        let msgs: Vec<Message> = (0..20).map(|i| log_message(5, i * 5)).collect();
        let mut bytes = Vec::new();
        for m in &msgs {
            bytes.extend_from_slice(&frame::encode(m).unwrap());
        }

        let decoder = Arc::new(StreamDecoder::new());
        let reader = {
            let decoder = Arc::clone(&decoder);
            std::thread::spawn(move || {
                for chunk in bytes.chunks(97) {
                    decoder.feed(chunk).unwrap();
                }
            })
        };

        let mut received = Vec::new();
        while received.len() < msgs.len() {
            match decoder.dequeue() {
                Some(m) => received.push(m),
                None => std::thread::yield_now(),
            }
        }
        reader.join().unwrap();
        assert_eq!(received, msgs);
    }
}
