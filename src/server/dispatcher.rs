//! The collector reactor.
//!
//! One task owns every session. Sockets are split on accept: a reader task
//! forwards raw chunks to the reactor and a writer task drains the
//! session's outbound queue. Store work goes to the worker pool and comes
//! back as events, so nothing on this task ever blocks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use super::channel::{
    outbound_channel, JobDone, OutboundReceiver, ReactorEvent, ReactorReceiver, ReactorSender,
    SessionId, READ_CHUNK_SIZE,
};
use super::session::{Session, Step};
use super::worker::WorkerPool;
use crate::error::{Error, Result};
use crate::identity::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct Dispatcher {
    listener: TcpListener,
    local: Arc<Identity>,
    pool: WorkerPool,
    events_tx: ReactorSender,
    events_rx: ReactorReceiver,
    sessions: HashMap<SessionId, Session>,
    next_session: SessionId,
    store_up: bool,
    /// Set when a store re-check fails; returned from `run`
    fatal: Option<Error>,
}

impl Dispatcher {
    pub fn new(
        listener: TcpListener,
        local: Identity,
        pool: WorkerPool,
        events_tx: ReactorSender,
        events_rx: ReactorReceiver,
    ) -> Self {
        Self {
            listener,
            local: Arc::new(local),
            pool,
            events_tx,
            events_rx,
            sessions: HashMap::new(),
            next_session: 1,
            store_up: true,
            fatal: None,
        }
    }

    /// Run until a shutdown event or a failed store re-check.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            addr = ?self.listener.local_addr().ok(),
            workers = self.pool.threads(),
            "collector reactor running"
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.on_accept(stream, peer),
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                Some(event) = self.events_rx.recv() => {
                    if self.on_event(event) == Flow::Stop {
                        break;
                    }
                }
            }
        }

        self.teardown();
        match self.fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_session;
        self.next_session += 1;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(session = id, error = %e, "set_nodelay failed");
        }
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = outbound_channel();

        tokio::spawn(write_loop(id, write_half, out_rx));
        let reader = tokio::spawn(read_loop(id, read_half, self.events_tx.clone()));

        let mut session = Session::new(id, peer, out_tx, Arc::clone(&self.local));
        session.attach_reader(reader);
        self.sessions.insert(id, session);

        tracing::info!(session = id, peer = %peer, sessions = self.sessions.len(), "accepted connection");
    }

    fn on_event(&mut self, event: ReactorEvent) -> Flow {
        match event {
            ReactorEvent::Chunk { session, data } => {
                let Some(s) = self.sessions.get_mut(&session) else {
                    return Flow::Continue;
                };
                if s.is_closing() {
                    return Flow::Continue;
                }
                if let Err(e) = s.feed(&data) {
                    tracing::warn!(
                        session,
                        peer = %s.peer(),
                        error = %e,
                        corruption = e.is_corruption(),
                        "frame error, closing connection after queued messages"
                    );
                    s.begin_close();
                }
                self.drain(session);
                self.close_if_finished(session);
            }
            ReactorEvent::Closed { session, error } => {
                if let Some(s) = self.sessions.remove(&session) {
                    match error {
                        Some(e) => tracing::warn!(session, peer = %s.peer(), error = %e, "connection error"),
                        None => tracing::info!(session, peer = %s.peer(), "peer disconnected"),
                    }
                }
            }
            ReactorEvent::JobDone(done) => self.on_job_done(done),
            ReactorEvent::CheckStore => {
                tracing::info!("checking store connectivity");
                self.pool.check_store();
            }
            ReactorEvent::StoreChecked(Ok(())) => {
                if !self.store_up {
                    tracing::info!("store connection restored");
                }
                self.store_up = true;
                self.drain_all();
            }
            ReactorEvent::StoreChecked(Err(e)) => {
                tracing::error!(error = %e, "store reconnect failed, stopping collector");
                self.fatal = Some(Error::Store(e));
                return Flow::Stop;
            }
            ReactorEvent::Shutdown => {
                tracing::info!(sessions = self.sessions.len(), "shutdown requested");
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn on_job_done(&mut self, done: JobDone) {
        let JobDone {
            session,
            request_id,
            outcome,
        } = done;

        if outcome.store_disconnected() && self.store_up {
            tracing::error!("store disconnected, refusing all messages until it recovers");
            self.store_up = false;
        }

        let Some(s) = self.sessions.get_mut(&session) else {
            tracing::debug!(session, request_id, "session gone, dropping job completion");
            return;
        };
        let step = s.complete(request_id, outcome);
        if self.apply(session, step) == Flow::Continue {
            self.drain(session);
            self.close_if_finished(session);
        }
    }

    /// Handle queued messages for one session, in decode order, until it
    /// runs dry or a store job is in flight.
    fn drain(&mut self, session: SessionId) {
        loop {
            let Some(s) = self.sessions.get_mut(&session) else {
                return;
            };
            let Some(msg) = s.next_message() else {
                return;
            };
            let step = s.handle(msg, self.store_up);
            if self.apply(session, step) == Flow::Stop {
                return;
            }
        }
    }

    fn drain_all(&mut self) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.drain(id);
        }
    }

    /// Carry out a session's decision. `Stop` means the session is gone.
    fn apply(&mut self, session: SessionId, step: Step) -> Flow {
        let Some(s) = self.sessions.get_mut(&session) else {
            return Flow::Stop;
        };
        match step {
            Step::Reply(msg) => {
                if let Err(e) = s.send(&msg) {
                    tracing::error!(session, error = %e, "failed to encode reply");
                    self.close(session);
                    return Flow::Stop;
                }
            }
            Step::Submit(job) => {
                s.set_busy(true);
                self.pool.submit(session, job);
            }
            Step::Close(reason) => {
                tracing::warn!(session, peer = %s.peer(), reason = %reason, "closing session");
                self.close(session);
                return Flow::Stop;
            }
            Step::Ignore => {}
        }
        Flow::Continue
    }

    /// Drop a session: the reader is aborted, and the writer flushes what is
    /// already queued and then shuts the socket down.
    fn close(&mut self, session: SessionId) {
        if let Some(s) = self.sessions.remove(&session) {
            tracing::info!(session, peer = %s.peer(), "session closed");
        }
    }

    /// Drop a closing session once its last store job has answered.
    fn close_if_finished(&mut self, session: SessionId) {
        let finished = self
            .sessions
            .get(&session)
            .is_some_and(|s| s.is_closing() && !s.is_busy());
        if finished {
            self.close(session);
        }
    }

    fn teardown(&mut self) {
        let count = self.sessions.len();
        for (id, s) in self.sessions.drain() {
            tracing::debug!(session = id, peer = %s.peer(), "closing session on shutdown");
        }
        self.events_rx.close();
        tracing::info!(sessions = count, "collector reactor stopped");
    }
}

async fn read_loop(session: SessionId, mut reader: OwnedReadHalf, events: ReactorSender) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    loop {
        buf.reserve(READ_CHUNK_SIZE);
        let event = match reader.read_buf(&mut buf).await {
            Ok(0) => ReactorEvent::Closed {
                session,
                error: None,
            },
            Ok(_) => ReactorEvent::Chunk {
                session,
                data: buf.split().freeze(),
            },
            Err(e) => ReactorEvent::Closed {
                session,
                error: Some(e.to_string()),
            },
        };
        let done = matches!(event, ReactorEvent::Closed { .. });
        if events.send(event).is_err() || done {
            return;
        }
    }
}

async fn write_loop(session: SessionId, mut writer: OwnedWriteHalf, mut outbound: OutboundReceiver) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!(session, error = %e, "write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
