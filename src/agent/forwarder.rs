//! Agent-side resume and backpressure protocol, without I/O.
//!
//! ```text
//! Disconnected --on_connected--> AwaitingConnectAck --Connect--> AwaitingResumePoint
//!      ^                                                              |
//!      +---------------- on_disconnect (any state) <----- Streaming <-+ ReturnLastEvent
//! ```
//!
//! No LogPackage is produced until the collector has told us where to
//! resume. A full batch (`need_accept`) blocks further batches until the
//! collector accepts it; shorter tail batches do not block but stay
//! unacknowledged until a later accept covers them.

use std::collections::VecDeque;

use super::source::EventSource;
use crate::error::Result;
use crate::identity::Identity;
use crate::protocol::{Body, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Disconnected,
    AwaitingConnectAck,
    AwaitingResumePoint,
    Streaming,
}

/// Batches sent and not yet covered by an accept. Consecutive tail
/// batches share one entry, so `first_msg..=last_msg` may span several
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlight {
    first_msg: i32,
    last_msg: i32,
    first: u64,
    last: u64,
    need_accept: bool,
}

impl InFlight {
    fn covers_msg(&self, msg_id: i32) -> bool {
        (self.first_msg..=self.last_msg).contains(&msg_id)
    }
}

pub struct Forwarder {
    identity: Identity,
    batch_cap: usize,
    state: ForwarderState,
    /// Next record id to fetch; unknown until the collector answers
    next: Option<u64>,
    /// Everything below this id is durably stored on the collector
    acked: u64,
    in_flight: VecDeque<InFlight>,
    /// The last handshake message was refused and should be resent
    handshake_refused: bool,
}

impl Forwarder {
    pub fn new(identity: Identity, batch_cap: usize) -> Self {
        Self {
            identity,
            batch_cap: batch_cap.max(1),
            state: ForwarderState::Disconnected,
            next: None,
            acked: 0,
            in_flight: VecDeque::new(),
            handshake_refused: false,
        }
    }

    pub fn state(&self) -> ForwarderState {
        self.state
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Next record id that will be fetched, once known.
    pub fn resume_point(&self) -> Option<u64> {
        self.next
    }

    /// Collector-confirmed low-water mark.
    pub fn acked(&self) -> u64 {
        self.acked
    }

    /// A needs-accept batch is outstanding.
    pub fn is_blocked(&self) -> bool {
        self.in_flight.iter().any(|b| b.need_accept)
    }

    /// Unacknowledged entries; runs of tail batches count once.
    pub fn unacked_batches(&self) -> usize {
        self.in_flight.len()
    }

    /// Transport is up: start the handshake.
    pub fn on_connected(&mut self) -> Message {
        self.reset();
        self.state = ForwarderState::AwaitingConnectAck;
        Message::connect(&self.identity)
    }

    /// Transport lost: forget everything the collector has not confirmed.
    /// The next connection re-derives the resume point.
    pub fn on_disconnect(&mut self) {
        if !self.in_flight.is_empty() {
            tracing::info!(
                batches = self.in_flight.len(),
                acked = self.acked,
                "dropping unacknowledged batches on disconnect"
            );
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.state = ForwarderState::Disconnected;
        self.next = None;
        self.in_flight.clear();
        self.handshake_refused = false;
    }

    /// React to one message from the collector; returns messages to send.
    pub fn on_message(&mut self, msg: &Message) -> Vec<Message> {
        match (&msg.body, self.state) {
            (Body::Connect, ForwarderState::AwaitingConnectAck) => {
                tracing::info!("collector acknowledged connect, querying resume point");
                self.state = ForwarderState::AwaitingResumePoint;
                vec![Message::query_last_event(&self.identity)]
            }
            (Body::ReturnLastEvent { last_event_id }, ForwarderState::AwaitingResumePoint) => {
                tracing::info!(resume_from = last_event_id, "resume point received");
                self.next = Some(*last_event_id);
                self.acked = *last_event_id;
                self.state = ForwarderState::Streaming;
                Vec::new()
            }
            (Body::AcceptLastEvent { last_event_id }, ForwarderState::Streaming) => {
                self.on_accept(*last_event_id);
                Vec::new()
            }
            (Body::Refuse { refused_id, reason }, _) => {
                self.on_refuse(*refused_id, reason);
                Vec::new()
            }
            (body, state) => {
                tracing::warn!(op = ?body.operation(), ?state, "ignoring unexpected message");
                Vec::new()
            }
        }
    }

    fn on_accept(&mut self, last_event_id: u64) {
        self.acked = self.acked.max(last_event_id);
        while let Some(front) = self.in_flight.front() {
            if front.last < last_event_id {
                self.in_flight.pop_front();
            } else {
                break;
            }
        }
        // Never fetch below what the collector has confirmed.
        if let Some(next) = self.next {
            self.next = Some(next.max(last_event_id));
        }
        tracing::debug!(acked = self.acked, pending = self.in_flight.len(), "batch accepted");
    }

    fn on_refuse(&mut self, refused_id: i32, reason: &str) {
        match self.state {
            ForwarderState::AwaitingConnectAck | ForwarderState::AwaitingResumePoint => {
                tracing::warn!(refused_id, reason, state = ?self.state, "handshake refused, will retry");
                self.handshake_refused = true;
            }
            ForwarderState::Streaming => {
                match self.in_flight.iter().position(|b| b.covers_msg(refused_id)) {
                    Some(idx) => {
                        // Resend the refused entry and everything after it.
                        let first = self.in_flight[idx].first;
                        self.in_flight.truncate(idx);
                        self.next = Some(first);
                        tracing::warn!(refused_id, reason, resend_from = first, "batch refused");
                    }
                    None => tracing::warn!(refused_id, reason, "refusal for unknown message"),
                }
            }
            ForwarderState::Disconnected => {}
        }
    }

    /// Periodic retry of a refused handshake step.
    pub fn on_tick(&mut self) -> Option<Message> {
        if !self.handshake_refused {
            return None;
        }
        self.handshake_refused = false;
        match self.state {
            ForwarderState::AwaitingConnectAck => Some(Message::connect(&self.identity)),
            ForwarderState::AwaitingResumePoint => Some(Message::query_last_event(&self.identity)),
            _ => None,
        }
    }

    /// Build the next batch, if sending is allowed and the source has
    /// anything past the resume point.
    pub fn next_batch(&mut self, source: &dyn EventSource) -> Result<Option<Message>> {
        if self.state != ForwarderState::Streaming || self.is_blocked() {
            return Ok(None);
        }
        let Some(next) = self.next else {
            return Ok(None);
        };

        let events = source.fetch(next, self.batch_cap)?;
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return Ok(None);
        };
        let (first, last) = (first.record_id, last.record_id);

        let need_accept = events.len() >= self.batch_cap;
        let msg = Message::log(&self.identity, events, need_accept);

        match self.in_flight.back_mut() {
            Some(tail) if !need_accept && !tail.need_accept && tail.last_msg < msg.id() => {
                tail.last_msg = msg.id();
                tail.last = last;
            }
            _ => self.in_flight.push_back(InFlight {
                first_msg: msg.id(),
                last_msg: msg.id(),
                first,
                last,
                need_accept,
            }),
        }
        self.next = last.checked_add(1);
        if self.next.is_none() {
            tracing::warn!(last, "record id space exhausted, nothing more to send");
        }

        tracing::debug!(first, last, need_accept, "sending batch");
        Ok(Some(msg))
    }
}
