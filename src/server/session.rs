//! Per-peer protocol state on the collector.
//!
//! A session owns its decoder and the sending half of its outbound queue.
//! It decides what each message needs ([`Step`]) but never calls the store
//! itself; the dispatcher runs store work on the pool and feeds the
//! outcome back through [`Session::complete`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::channel::{JobOutcome, OutboundSender, SessionId};
use super::worker::Job;
use crate::error::{FrameError, StoreError};
use crate::identity::Identity;
use crate::protocol::{frame, Body, Message, StreamDecoder};
use crate::store::ClientRecord;

pub const REASON_DB_DISCONNECTED: &str = "database disconnected";
pub const REASON_DB_EXCEPTION: &str = "database exception";
pub const REASON_INTERNAL: &str = "internal exception";
pub const REASON_UNIDENTIFIED: &str = "client not identified";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No Connect handled yet
    Unidentified,
    /// Client record resolved
    Identified,
    /// At least one query or insert completed
    Active,
}

/// What the dispatcher should do with one handled message.
#[derive(Debug)]
pub enum Step {
    Reply(Message),
    Submit(Job),
    Close(String),
    Ignore,
}

pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    state: SessionState,
    decoder: StreamDecoder,
    outbound: OutboundSender,
    /// Identity stamped on replies
    local: Arc<Identity>,
    client: Option<ClientRecord>,
    /// Highest record id known to be stored for this client
    watermark: u64,
    /// A store job is in flight; further messages wait in the decoder
    busy: bool,
    /// The stream failed; only already decoded messages are still handled
    closing: bool,
    reader: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(
        id: SessionId,
        peer: SocketAddr,
        outbound: OutboundSender,
        local: Arc<Identity>,
    ) -> Self {
        Self {
            id,
            peer,
            state: SessionState::Unidentified,
            decoder: StreamDecoder::new(),
            outbound,
            local,
            client: None,
            watermark: 0,
            busy: false,
            closing: false,
            reader: None,
        }
    }

    pub fn attach_reader(&mut self, reader: JoinHandle<()>) {
        self.reader = Some(reader);
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client(&self) -> Option<&ClientRecord> {
        self.client.as_ref()
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Stop reading from the peer. Messages decoded before this point are
    /// still handled; the dispatcher drops the session once they are done.
    pub fn begin_close(&mut self) {
        self.closing = true;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    /// Feed bytes from the socket. Returns how many messages completed.
    pub fn feed(&self, chunk: &[u8]) -> Result<usize, FrameError> {
        self.decoder.feed(chunk)
    }

    /// Next decoded message, unless a store job is in flight.
    pub fn next_message(&self) -> Option<Message> {
        if self.busy {
            return None;
        }
        self.decoder.dequeue()
    }

    /// Encode and queue a reply. A closed writer is not an error here;
    /// the reader reports the disconnect.
    pub fn send(&self, msg: &Message) -> Result<(), FrameError> {
        let bytes = frame::encode(msg)?;
        tracing::debug!(
            session = self.id,
            peer = %self.peer,
            op = ?msg.operation(),
            bytes = bytes.len(),
            "queue reply"
        );
        if self.outbound.send(bytes).is_err() {
            tracing::debug!(session = self.id, "writer closed, reply dropped");
        }
        Ok(())
    }

    fn refuse(&self, refused_id: i32, reason: &str) -> Step {
        tracing::warn!(session = self.id, peer = %self.peer, refused_id, reason, "refusing message");
        Step::Reply(Message::refuse(&self.local, refused_id, reason))
    }

    fn refuse_store_error(&self, refused_id: i32, err: &StoreError) -> Step {
        tracing::error!(session = self.id, refused_id, error = %err, "store call failed");
        if err.is_disconnect() {
            self.refuse(refused_id, REASON_DB_DISCONNECTED)
        } else {
            self.refuse(refused_id, REASON_DB_EXCEPTION)
        }
    }

    /// Decide how to answer one inbound message.
    pub fn handle(&mut self, msg: Message, store_up: bool) -> Step {
        let request_id = msg.id();

        if !store_up {
            return self.refuse(request_id, REASON_DB_DISCONNECTED);
        }

        match msg.body {
            Body::Connect => {
                let identity = msg.envelope.sender;
                tracing::info!(
                    session = self.id,
                    peer = %self.peer,
                    client = %identity.client_name,
                    os = identity.os_kind.as_str(),
                    os_version = %identity.os_version,
                    "client connecting"
                );
                Step::Submit(Job::Identify {
                    request_id,
                    identity,
                })
            }
            Body::QueryLastEvent => match &self.client {
                Some(client) => Step::Submit(Job::QueryLastRecord {
                    request_id,
                    client: client.clone(),
                }),
                None => self.refuse(request_id, REASON_UNIDENTIFIED),
            },
            Body::Log(package) => match &self.client {
                Some(client) => {
                    tracing::info!(
                        session = self.id,
                        client_id = client.id,
                        events = package.events.len(),
                        need_accept = package.need_accept,
                        "received events"
                    );
                    Step::Submit(Job::Insert {
                        request_id,
                        client: client.clone(),
                        package,
                    })
                }
                None => self.refuse(request_id, REASON_UNIDENTIFIED),
            },
            // Replies flow collector -> agent only.
            Body::ReturnLastEvent { .. } | Body::AcceptLastEvent { .. } | Body::Refuse { .. } => {
                self.refuse(request_id, REASON_INTERNAL)
            }
        }
    }

    /// Apply a finished store job.
    pub fn complete(&mut self, request_id: i32, outcome: JobOutcome) -> Step {
        self.busy = false;

        match outcome {
            JobOutcome::Identified(Ok(record)) => {
                tracing::info!(
                    session = self.id,
                    peer = %self.peer,
                    client_id = record.id,
                    name = %record.name,
                    "client identified"
                );
                self.client = Some(record);
                self.state = SessionState::Identified;
                Step::Reply(Message::connect(&self.local))
            }
            JobOutcome::Identified(Err(e)) if e.is_disconnect() => {
                self.refuse_store_error(request_id, &e)
            }
            JobOutcome::Identified(Err(e)) => {
                Step::Close(format!("client resolution failed: {}", e))
            }
            JobOutcome::LastRecordId(Ok(last)) => {
                self.watermark = last;
                self.state = SessionState::Active;
                match last.checked_add(1) {
                    Some(next) => Step::Reply(Message::return_last_event(&self.local, next)),
                    None => self.refuse(request_id, REASON_INTERNAL),
                }
            }
            JobOutcome::LastRecordId(Err(e)) => self.refuse_store_error(request_id, &e),
            JobOutcome::Inserted {
                result: Ok(count),
                need_accept,
                last_record_id,
            } => {
                if let Some(last) = last_record_id {
                    self.watermark = last;
                }
                self.state = SessionState::Active;
                tracing::info!(
                    session = self.id,
                    client_id = self.client.as_ref().map(|c| c.id),
                    events = count,
                    watermark = self.watermark,
                    "stored events"
                );
                if !need_accept {
                    return Step::Ignore;
                }
                // No id follows u64::MAX to acknowledge with.
                match self.watermark.checked_add(1) {
                    Some(next) => Step::Reply(Message::accept_last_event(&self.local, next)),
                    None => self.refuse(request_id, REASON_INTERNAL),
                }
            }
            JobOutcome::Inserted { result: Err(e), .. } => self.refuse_store_error(request_id, &e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::OsKind;
    use crate::protocol::{Event, LogLevel, Operation};
    use crate::server::channel::outbound_channel;

    fn collector() -> Arc<Identity> {
        Arc::new(Identity::new("collector", OsKind::Linux, "Debian 12", "c0ffee"))
    }

    fn agent() -> Identity {
        Identity::new("ws-01", OsKind::Windows, "10.0.19045", "ab12")
    }

    fn record() -> ClientRecord {
        ClientRecord {
            id: 3,
            name: "ws-01".into(),
            os_kind: OsKind::Windows,
            os_version: "10.0.19045".into(),
            machine_id: "ab12".into(),
            registered_at: "2026-10-19T00:00:00Z".into(),
            last_seen: "2026-10-19T00:00:00Z".into(),
        }
    }

    fn session() -> Session {
        let (tx, _rx) = outbound_channel();
        Session::new(1, "127.0.0.1:40000".parse().unwrap(), tx, collector())
    }

    fn identified() -> Session {
        let mut s = session();
        s.complete(1, JobOutcome::Identified(Ok(record())));
        s
    }

    fn log(n: u64, need_accept: bool) -> Message {
        let events = (1..=n)
            .map(|rid| Event {
                xml: "<Event/>".into(),
                format: String::new(),
                timestamp: "t".into(),
                provider: "p".into(),
                level: LogLevel::Info,
                record_id: rid,
            })
            .collect();
        Message::log(&agent(), events, need_accept)
    }

    fn expect_reply(step: Step) -> Message {
        match step {
            Step::Reply(msg) => msg,
            other => panic!("Expected Reply, got {:?}", other),
        }
    }

    fn expect_refusal(step: Step) -> (i32, String) {
        match expect_reply(step).body {
            Body::Refuse { refused_id, reason } => (refused_id, reason),
            other => panic!("Expected Refuse, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_submits_identify() {
        let mut s = session();
        let msg = Message::connect(&agent());
        let id = msg.id();

        match s.handle(msg, true) {
            Step::Submit(Job::Identify {
                request_id,
                identity,
            }) => {
                assert_eq!(request_id, id);
                assert_eq!(identity, agent());
            }
            other => panic!("Expected Identify job, got {:?}", other),
        }

        let ack = expect_reply(s.complete(id, JobOutcome::Identified(Ok(record()))));
        assert_eq!(ack.operation(), Operation::Connect);
        assert_eq!(s.state(), SessionState::Identified);
        assert_eq!(s.client().map(|c| c.id), Some(3));
    }

    #[test]
    fn test_store_down_refuses_without_state_change() {
        let mut s = session();
        let msg = Message::connect(&agent());
        let id = msg.id();

        let (refused_id, reason) = expect_refusal(s.handle(msg, false));
        assert_eq!(refused_id, id);
        assert_eq!(reason, REASON_DB_DISCONNECTED);
        assert_eq!(s.state(), SessionState::Unidentified);
    }

    #[test]
    fn test_query_before_connect_refused() {
        let mut s = session();
        let (_, reason) = expect_refusal(s.handle(Message::query_last_event(&agent()), true));
        assert_eq!(reason, REASON_UNIDENTIFIED);

        let (_, reason) = expect_refusal(s.handle(log(3, false), true));
        assert_eq!(reason, REASON_UNIDENTIFIED);
    }

    #[test]
    fn test_query_last_event_returns_next_id() {
        let mut s = identified();
        let query = Message::query_last_event(&agent());
        let id = query.id();
        assert!(matches!(
            s.handle(query, true),
            Step::Submit(Job::QueryLastRecord { .. })
        ));

        let reply = expect_reply(s.complete(id, JobOutcome::LastRecordId(Ok(41))));
        assert_eq!(reply.body, Body::ReturnLastEvent { last_event_id: 42 });
        assert_eq!(s.state(), SessionState::Active);
        assert_eq!(s.watermark(), 41);
    }

    #[test]
    fn test_full_batch_accepted_after_insert() {
        let mut s = identified();
        let msg = log(30, true);
        let id = msg.id();
        assert!(matches!(s.handle(msg, true), Step::Submit(Job::Insert { .. })));

        let reply = expect_reply(s.complete(
            id,
            JobOutcome::Inserted {
                result: Ok(30),
                need_accept: true,
                last_record_id: Some(30),
            },
        ));
        assert_eq!(reply.body, Body::AcceptLastEvent { last_event_id: 31 });
    }

    #[test]
    fn test_tail_batch_not_acknowledged() {
        let mut s = identified();
        let step = s.complete(
            9,
            JobOutcome::Inserted {
                result: Ok(4),
                need_accept: false,
                last_record_id: Some(4),
            },
        );
        assert!(matches!(step, Step::Ignore));
        assert_eq!(s.watermark(), 4);
    }

    #[test]
    fn test_max_record_id_refused_without_overflow() {
        let mut s = identified();
        let (refused_id, reason) = expect_refusal(s.complete(
            12,
            JobOutcome::Inserted {
                result: Ok(1),
                need_accept: true,
                last_record_id: Some(u64::MAX),
            },
        ));
        assert_eq!((refused_id, reason.as_str()), (12, REASON_INTERNAL));
        assert_eq!(s.watermark(), u64::MAX);

        let (_, reason) = expect_refusal(s.complete(13, JobOutcome::LastRecordId(Ok(u64::MAX))));
        assert_eq!(reason, REASON_INTERNAL);
    }

    #[test]
    fn test_insert_failures_refused() {
        let mut s = identified();
        let (refused_id, reason) = expect_refusal(s.complete(
            77,
            JobOutcome::Inserted {
                result: Err(StoreError::Backend("disk full".into())),
                need_accept: true,
                last_record_id: Some(30),
            },
        ));
        assert_eq!((refused_id, reason.as_str()), (77, REASON_DB_EXCEPTION));
        assert_eq!(s.watermark(), 0);

        let (_, reason) = expect_refusal(s.complete(
            78,
            JobOutcome::Inserted {
                result: Err(StoreError::Disconnected),
                need_accept: false,
                last_record_id: None,
            },
        ));
        assert_eq!(reason, REASON_DB_DISCONNECTED);
    }

    #[test]
    fn test_identify_failure_closes() {
        let mut s = session();
        let step = s.complete(
            1,
            JobOutcome::Identified(Err(StoreError::Backend("bad row".into()))),
        );
        assert!(matches!(step, Step::Close(_)));

        let (_, reason) = expect_refusal(s.complete(1, JobOutcome::Identified(Err(StoreError::Disconnected))));
        assert_eq!(reason, REASON_DB_DISCONNECTED);
    }

    #[test]
    fn test_unexpected_operation_refused() {
        let mut s = identified();
        let stray = Message::accept_last_event(&agent(), 10);
        let id = stray.id();
        let (refused_id, reason) = expect_refusal(s.handle(stray, true));
        assert_eq!((refused_id, reason.as_str()), (id, REASON_INTERNAL));
        assert_eq!(s.state(), SessionState::Identified);
    }

    #[test]
    fn test_busy_session_holds_messages() {
        let mut s = identified();
        let mut bytes = frame::encode(&Message::query_last_event(&agent())).unwrap().to_vec();
        bytes.extend_from_slice(&frame::encode(&log(2, false)).unwrap());
        assert_eq!(s.feed(&bytes).unwrap(), 2);

        s.set_busy(true);
        assert!(s.next_message().is_none());

        s.set_busy(false);
        assert_eq!(s.next_message().unwrap().operation(), Operation::QueryLastEvent);
        assert_eq!(s.next_message().unwrap().operation(), Operation::UpdateLog);
        assert!(s.next_message().is_none());
    }

    #[test]
    fn test_send_queues_encoded_frame() {
        let (tx, mut rx) = outbound_channel();
        let s = Session::new(2, "127.0.0.1:40001".parse().unwrap(), tx, collector());
        let reply = Message::return_last_event(&collector(), 42);

        s.send(&reply).unwrap();
        let bytes = rx.try_recv().unwrap();
        assert_eq!(frame::decode_frame(&bytes).unwrap(), reply);
    }
}
