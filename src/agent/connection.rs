//! TCP driver for the forwarder: connect, handshake, stream, reconnect.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::forwarder::Forwarder;
use super::source::EventSource;
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::protocol::{frame, Body, Message, StreamDecoder};

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Why one connection ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Stopped,
    Lost,
}

/// Exponential reconnect delay, doubling up to a cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following one is doubled.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

pub struct AgentConnection<S: EventSource> {
    server: String,
    poll_interval: Duration,
    backoff: Backoff,
    forwarder: Forwarder,
    source: S,
}

impl<S: EventSource> AgentConnection<S> {
    pub fn new(config: &AgentConfig, identity: Identity, source: S) -> Self {
        Self {
            server: config.server_addr(),
            poll_interval: config.poll_interval(),
            backoff: Backoff::new(
                Duration::from_millis(config.reconnect.initial_ms),
                Duration::from_millis(config.reconnect.max_ms),
            ),
            forwarder: Forwarder::new(identity, config.batch.max_events),
            source,
        }
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    /// Forward events until `stop` flips to true, reconnecting as needed.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *stop.borrow() {
                return Ok(());
            }

            match TcpStream::connect(&self.server).await {
                Ok(stream) => {
                    tracing::info!(server = %self.server, "connected to collector");
                    self.backoff.reset();
                    let end = self.serve(stream, &mut stop).await;
                    self.forwarder.on_disconnect();
                    match end {
                        Ok(SessionEnd::Stopped) => return Ok(()),
                        Ok(SessionEnd::Lost) => {
                            tracing::warn!(server = %self.server, "connection lost")
                        }
                        Err(e @ Error::Source(_)) => return Err(e),
                        Err(e) => tracing::warn!(server = %self.server, error = %e, "connection failed"),
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %self.server, error = %e, "connect failed");
                }
            }

            let delay = self.backoff.next_delay();
            tracing::info!(delay_ms = delay.as_millis() as u64, "reconnecting after delay");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = stop.changed() => {
                    // Dropped stop sender also means stop.
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn serve(
        &mut self,
        stream: TcpStream,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        let decoder = StreamDecoder::new();
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let hello = self.forwarder.on_connected();
        send(&mut writer, &hello).await?;

        loop {
            buf.reserve(READ_CHUNK_SIZE);
            tokio::select! {
                read = reader.read_buf(&mut buf) => {
                    if read? == 0 {
                        return Ok(SessionEnd::Lost);
                    }
                    decoder.feed(&buf.split())?;
                    while let Some(msg) = decoder.dequeue() {
                        for reply in self.forwarder.on_message(&msg) {
                            send(&mut writer, &reply).await?;
                        }
                        // Progress messages unblock sending; refusals wait for the next poll.
                        if matches!(msg.body, Body::ReturnLastEvent { .. } | Body::AcceptLastEvent { .. }) {
                            self.pump(&mut writer).await?;
                        }
                    }
                }
                _ = poll.tick() => {
                    if let Some(retry) = self.forwarder.on_tick() {
                        send(&mut writer, &retry).await?;
                    }
                    self.pump(&mut writer).await?;
                }
                _ = stop.changed() => {
                    tracing::info!("agent stopping");
                    let _ = writer.shutdown().await;
                    return Ok(SessionEnd::Stopped);
                }
            }
        }
    }

    /// Send batches until the source is drained or an accept is pending.
    async fn pump(&mut self, writer: &mut (impl AsyncWriteExt + Unpin)) -> Result<()> {
        loop {
            let Some(batch) = self.forwarder.next_batch(&self.source)? else {
                return Ok(());
            };
            send(writer, &batch).await?;
        }
    }
}

async fn send(writer: &mut (impl AsyncWriteExt + Unpin), msg: &Message) -> Result<()> {
    let bytes = frame::encode(msg)?;
    writer.write_all(&bytes).await?;
    tracing::debug!(op = ?msg.operation(), id = msg.id(), bytes = bytes.len(), "sent");
    Ok(())
}
