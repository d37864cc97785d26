//! Message model: a closed set of variants behind a uniform envelope.
//!
//! Payload layout (all multi-byte integers big-endian, strings are
//! `u32` length + UTF-8):
//!
//! ```text
//! op:u8 | id:i32 | timestamp | description | client_name | os_kind:u8
//!       | os_version | machine_id | variant fields
//! ```
//!
//! Envelope fields are written and parsed uniformly; each variant only
//! contributes its own trailing fields.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::FrameError;
use crate::identity::{Identity, OsKind};

static NEXT_ID: AtomicI32 = AtomicI32::new(0);

/// Next process-unique message id. Never negative; `-1` is reserved on the
/// wire for "sender did not assign an id".
pub fn next_id() -> i32 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed) & i32::MAX
}

/// Sender-local wall clock, RFC 3339.
pub fn local_timestamp() -> String {
    chrono::Local::now().to_rfc3339()
}

// =============================================================================
// Operation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    None = 0,
    CheckVersion = 1,
    UpdateLog = 2,
    QueryLastEvent = 3,
    ReturnLastEvent = 4,
    AcceptLastEvent = 5,
    Connect = 6,
    Refuse = 7,
}

impl Operation {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::None),
            1 => Some(Self::CheckVersion),
            2 => Some(Self::UpdateLog),
            3 => Some(Self::QueryLastEvent),
            4 => Some(Self::ReturnLastEvent),
            5 => Some(Self::AcceptLastEvent),
            6 => Some(Self::Connect),
            7 => Some(Self::Refuse),
            _ => None,
        }
    }
}

// =============================================================================
// Log level
// =============================================================================

/// Event severity. The numeric form is derived, so the two never drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Fatal,
    Error,
    Warning,
    Info,
    Verbose,
}

impl LogLevel {
    pub fn numeric(self) -> u8 {
        match self {
            LogLevel::Fatal => 1,
            LogLevel::Error => 2,
            LogLevel::Warning => 3,
            LogLevel::Info => 4,
            LogLevel::Verbose => 5,
        }
    }

    /// Total: anything outside 1..=5 is treated as verbose.
    pub fn from_numeric(level: u32) -> Self {
        match level {
            1 => LogLevel::Fatal,
            2 => LogLevel::Error,
            3 => LogLevel::Warning,
            4 => LogLevel::Info,
            _ => LogLevel::Verbose,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Fatal => "fatal",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Verbose => "verbose",
        }
    }
}

// =============================================================================
// Event
// =============================================================================

/// One captured log record.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Event {
    /// Raw structured entry as captured
    pub xml: String,

    /// Human-readable rendering
    #[serde(default)]
    pub format: String,

    pub timestamp: String,

    pub provider: String,

    pub level: LogLevel,

    /// Monotonically increasing per client; the resume point
    pub record_id: u64,
}

impl Event {
    fn write(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        put_str(buf, &self.xml)?;
        put_str(buf, &self.format)?;
        put_str(buf, &self.timestamp)?;
        put_str(buf, &self.provider)?;
        buf.put_u8(self.level.numeric());
        buf.put_u64(self.record_id);
        Ok(())
    }

    fn read(r: &mut PayloadReader) -> Result<Self, FrameError> {
        Ok(Self {
            xml: r.get_str("event xml")?,
            format: r.get_str("event format")?,
            timestamp: r.get_str("event timestamp")?,
            provider: r.get_str("event provider")?,
            level: LogLevel::from_numeric(r.get_u8("event level")? as u32),
            record_id: r.get_u64("event record id")?,
        })
    }
}

// =============================================================================
// Envelope and variants
// =============================================================================

/// Fields common to every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: i32,
    pub timestamp: String,
    pub description: String,
    pub sender: Identity,
}

/// A batch of events.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogPackage {
    pub events: Vec<Event>,
    /// Set on full batches: the sender waits for an accept before sending more
    pub need_accept: bool,
}

impl LogPackage {
    pub fn first_record_id(&self) -> Option<u64> {
        self.events.first().map(|e| e.record_id)
    }

    pub fn last_record_id(&self) -> Option<u64> {
        self.events.last().map(|e| e.record_id)
    }

    /// Description text summarizing the record-id range carried.
    pub fn summary(&self) -> String {
        match (self.first_record_id(), self.last_record_id()) {
            (Some(first), Some(last)) => {
                format!("LogPackage. Event RecordID from {} to {}.", first, last)
            }
            _ => "LogPackage. No events.".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Connect,
    Log(LogPackage),
    QueryLastEvent,
    ReturnLastEvent { last_event_id: u64 },
    AcceptLastEvent { last_event_id: u64 },
    Refuse { refused_id: i32, reason: String },
}

impl Body {
    pub fn operation(&self) -> Operation {
        match self {
            Body::Connect => Operation::Connect,
            Body::Log(_) => Operation::UpdateLog,
            Body::QueryLastEvent => Operation::QueryLastEvent,
            Body::ReturnLastEvent { .. } => Operation::ReturnLastEvent,
            Body::AcceptLastEvent { .. } => Operation::AcceptLastEvent,
            Body::Refuse { .. } => Operation::Refuse,
        }
    }

    fn default_description(&self) -> String {
        match self {
            Body::Connect => "Connect".to_string(),
            Body::Log(log) => log.summary(),
            Body::QueryLastEvent => "QueryLastEventPackage".to_string(),
            Body::ReturnLastEvent { .. } => "ReturnLastEventPackage".to_string(),
            Body::AcceptLastEvent { .. } => "AcceptLastEventPackage".to_string(),
            Body::Refuse { .. } => "Refuse package".to_string(),
        }
    }

    fn write_fields(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        match self {
            Body::Connect | Body::QueryLastEvent => {}
            Body::Log(log) => {
                buf.put_u8(log.need_accept as u8);
                let count = u32::try_from(log.events.len()).map_err(|_| FrameError::TooLarge {
                    size: log.events.len(),
                    max: u32::MAX as usize,
                })?;
                buf.put_u32(count);
                for event in &log.events {
                    event.write(buf)?;
                }
            }
            Body::ReturnLastEvent { last_event_id } | Body::AcceptLastEvent { last_event_id } => {
                buf.put_u64(*last_event_id);
            }
            Body::Refuse { refused_id, reason } => {
                buf.put_i32(*refused_id);
                put_str(buf, reason)?;
            }
        }
        Ok(())
    }

    /// The single dispatch from operation tag to variant.
    fn read_fields(op: Operation, r: &mut PayloadReader) -> Result<Self, FrameError> {
        match op {
            Operation::Connect => Ok(Body::Connect),
            Operation::UpdateLog => {
                let need_accept = r.get_u8("log need_accept")? != 0;
                let count = r.get_u32("log event count")? as usize;
                // Each event takes at least 4 strings + level + record id.
                if count > r.remaining() / 25 {
                    return Err(FrameError::Malformed(format!(
                        "log claims {} events in {} bytes",
                        count,
                        r.remaining()
                    )));
                }
                let mut events = Vec::with_capacity(count);
                for _ in 0..count {
                    events.push(Event::read(r)?);
                }
                Ok(Body::Log(LogPackage {
                    events,
                    need_accept,
                }))
            }
            Operation::QueryLastEvent => Ok(Body::QueryLastEvent),
            Operation::ReturnLastEvent => Ok(Body::ReturnLastEvent {
                last_event_id: r.get_u64("last event id")?,
            }),
            Operation::AcceptLastEvent => Ok(Body::AcceptLastEvent {
                last_event_id: r.get_u64("last event id")?,
            }),
            Operation::Refuse => Ok(Body::Refuse {
                refused_id: r.get_i32("refused id")?,
                reason: r.get_str("refuse reason")?,
            }),
            Operation::None | Operation::CheckVersion => Err(FrameError::UnsupportedOperation(op)),
        }
    }
}

/// A decoded or to-be-encoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub envelope: Envelope,
    pub body: Body,
}

impl Message {
    /// Build a message from `sender` with a fresh id and the current time.
    pub fn new(sender: &Identity, body: Body) -> Self {
        Self {
            envelope: Envelope {
                id: next_id(),
                timestamp: local_timestamp(),
                description: body.default_description(),
                sender: sender.clone(),
            },
            body,
        }
    }

    pub fn connect(sender: &Identity) -> Self {
        Self::new(sender, Body::Connect)
    }

    pub fn log(sender: &Identity, events: Vec<Event>, need_accept: bool) -> Self {
        Self::new(
            sender,
            Body::Log(LogPackage {
                events,
                need_accept,
            }),
        )
    }

    pub fn query_last_event(sender: &Identity) -> Self {
        Self::new(sender, Body::QueryLastEvent)
    }

    pub fn return_last_event(sender: &Identity, last_event_id: u64) -> Self {
        Self::new(sender, Body::ReturnLastEvent { last_event_id })
    }

    pub fn accept_last_event(sender: &Identity, last_event_id: u64) -> Self {
        Self::new(sender, Body::AcceptLastEvent { last_event_id })
    }

    pub fn refuse(sender: &Identity, refused_id: i32, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut msg = Self::new(
            sender,
            Body::Refuse {
                refused_id,
                reason: reason.clone(),
            },
        );
        msg.envelope.description = reason;
        msg
    }

    pub fn id(&self) -> i32 {
        self.envelope.id
    }

    pub fn operation(&self) -> Operation {
        self.body.operation()
    }

    pub fn sender(&self) -> &Identity {
        &self.envelope.sender
    }

    /// Serialize envelope and variant fields into the canonical payload.
    ///
    /// A log package always carries its record-id summary as description;
    /// an empty timestamp is stamped with the current local time.
    pub fn to_payload(&self) -> Result<Bytes, FrameError> {
        let env = &self.envelope;
        let mut buf = BytesMut::with_capacity(self.size_hint());

        buf.put_u8(self.operation() as u8);
        buf.put_i32(env.id);
        if env.timestamp.is_empty() {
            put_str(&mut buf, &local_timestamp())?;
        } else {
            put_str(&mut buf, &env.timestamp)?;
        }
        match &self.body {
            Body::Log(log) => put_str(&mut buf, &log.summary())?,
            _ => put_str(&mut buf, &env.description)?,
        }
        put_str(&mut buf, &env.sender.client_name)?;
        buf.put_u8(env.sender.os_kind.as_u8());
        put_str(&mut buf, &env.sender.os_version)?;
        put_str(&mut buf, &env.sender.machine_id)?;

        self.body.write_fields(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse a canonical payload back into a message.
    pub fn from_payload(payload: Bytes) -> Result<Self, FrameError> {
        let mut r = PayloadReader { buf: payload };

        let tag = r.get_u8("operation tag")?;
        let op = Operation::from_u8(tag).ok_or(FrameError::UnknownOperation(tag))?;

        let id = r.get_i32("message id")?;
        let timestamp = r.get_str("timestamp")?;
        let description = r.get_str("description")?;
        let client_name = r.get_str("client name")?;
        let os_kind = OsKind::from_u8(r.get_u8("os kind")?);
        let os_version = r.get_str("os version")?;
        let machine_id = r.get_str("machine id")?;

        let body = Body::read_fields(op, &mut r)?;

        if r.remaining() != 0 {
            return Err(FrameError::Malformed(format!(
                "{} trailing bytes after {:?} payload",
                r.remaining(),
                op
            )));
        }

        Ok(Self {
            envelope: Envelope {
                id: if id == -1 { next_id() } else { id },
                timestamp,
                description,
                sender: Identity {
                    client_name,
                    os_kind,
                    os_version,
                    machine_id,
                },
            },
            body,
        })
    }

    fn size_hint(&self) -> usize {
        let env = &self.envelope;
        let mut n = 1
            + 4
            + 1
            + 4 * 5
            + env.timestamp.len().max(32)
            + env.description.len()
            + env.sender.client_name.len()
            + env.sender.os_version.len()
            + env.sender.machine_id.len();
        if let Body::Log(log) = &self.body {
            n += 64 + 5;
            for e in &log.events {
                n += 16 + 9 + e.xml.len() + e.format.len() + e.timestamp.len() + e.provider.len();
            }
        }
        n
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), FrameError> {
    let len = u32::try_from(s.len()).map_err(|_| FrameError::TooLarge {
        size: s.len(),
        max: u32::MAX as usize,
    })?;
    buf.put_u32(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Bounds-checked cursor over a payload.
struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &'static str) -> Result<(), FrameError> {
        if self.buf.remaining() < n {
            return Err(FrameError::Truncated(what));
        }
        Ok(())
    }

    fn get_u8(&mut self, what: &'static str) -> Result<u8, FrameError> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn get_u32(&mut self, what: &'static str) -> Result<u32, FrameError> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    fn get_i32(&mut self, what: &'static str) -> Result<i32, FrameError> {
        self.need(4, what)?;
        Ok(self.buf.get_i32())
    }

    fn get_u64(&mut self, what: &'static str) -> Result<u64, FrameError> {
        self.need(8, what)?;
        Ok(self.buf.get_u64())
    }

    fn get_str(&mut self, what: &'static str) -> Result<String, FrameError> {
        let len = self.get_u32(what)? as usize;
        self.need(len, what)?;
        String::from_utf8(self.buf.copy_to_bytes(len).to_vec())
            .map_err(|_| FrameError::Malformed(format!("invalid UTF-8 in {}", what)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Identity {
        Identity::new("host-a", OsKind::Windows, "10.0.19045", "f00dfeed")
    }

    fn event(rid: u64) -> Event {
        Event {
            xml: format!("<Event><RecordID>{}</RecordID></Event>", rid),
            format: "The service entered the running state.".to_string(),
            timestamp: "2026-10-19T08:00:00Z".to_string(),
            provider: "Service Control Manager".to_string(),
            level: LogLevel::Info,
            record_id: rid,
        }
    }

    #[test]
    fn test_operation_from_u8() {
        assert_eq!(Operation::from_u8(6), Some(Operation::Connect));
        assert_eq!(Operation::from_u8(2), Some(Operation::UpdateLog));
        assert_eq!(Operation::from_u8(7), Some(Operation::Refuse));
        assert_eq!(Operation::from_u8(8), None);
        assert_eq!(Operation::from_u8(0xFF), None);
    }

    #[test]
    fn test_log_level_mapping_is_total_and_exact() {
        for level in [
            LogLevel::Fatal,
            LogLevel::Error,
            LogLevel::Warning,
            LogLevel::Info,
            LogLevel::Verbose,
        ] {
            assert_eq!(LogLevel::from_numeric(level.numeric() as u32), level);
        }
        assert_eq!(LogLevel::from_numeric(0), LogLevel::Verbose);
        assert_eq!(LogLevel::from_numeric(42), LogLevel::Verbose);
    }

    #[test]
    fn test_log_payload_roundtrip() {
        let msg = Message::log(&sender(), vec![event(10), event(11), event(12)], true);
        let decoded = Message::from_payload(msg.to_payload().unwrap()).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(
            decoded.envelope.description,
            "LogPackage. Event RecordID from 10 to 12."
        );
    }

    #[test]
    fn test_refuse_roundtrip() {
        let msg = Message::refuse(&sender(), 77, "database disconnected");
        let decoded = Message::from_payload(msg.to_payload().unwrap()).unwrap();

        assert_eq!(decoded, msg);
        match decoded.body {
            Body::Refuse { refused_id, reason } => {
                assert_eq!(refused_id, 77);
                assert_eq!(reason, "database disconnected");
            }
            other => panic!("Expected Refuse, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_timestamp_is_stamped() {
        let mut msg = Message::connect(&sender());
        msg.envelope.timestamp.clear();
        let decoded = Message::from_payload(msg.to_payload().unwrap()).unwrap();
        assert!(!decoded.envelope.timestamp.is_empty());
    }

    #[test]
    fn test_unassigned_id_gets_local_id() {
        let mut msg = Message::query_last_event(&sender());
        msg.envelope.id = -1;
        let decoded = Message::from_payload(msg.to_payload().unwrap()).unwrap();
        assert!(decoded.id() >= 0);
    }

    #[test]
    fn test_unsupported_and_unknown_tags() {
        let payload = Message::connect(&sender()).to_payload().unwrap();

        let mut check_version = payload.to_vec();
        check_version[0] = Operation::CheckVersion as u8;
        match Message::from_payload(Bytes::from(check_version)) {
            Err(FrameError::UnsupportedOperation(Operation::CheckVersion)) => {}
            other => panic!("Expected UnsupportedOperation, got {:?}", other),
        }

        let mut unknown = payload.to_vec();
        unknown[0] = 0x42;
        match Message::from_payload(Bytes::from(unknown)) {
            Err(FrameError::UnknownOperation(0x42)) => {}
            other => panic!("Expected UnknownOperation, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_and_trailing_payloads() {
        let payload = Message::accept_last_event(&sender(), 31).to_payload().unwrap();

        let truncated = payload.slice(..payload.len() - 3);
        assert!(matches!(
            Message::from_payload(truncated),
            Err(FrameError::Truncated(_))
        ));

        let mut trailing = payload.to_vec();
        trailing.push(0);
        assert!(matches!(
            Message::from_payload(Bytes::from(trailing)),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_ids_are_monotonic() {
        let a = Message::connect(&sender()).id();
        let b = Message::connect(&sender()).id();
        assert!(b > a);
    }
}
