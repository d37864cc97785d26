//! Event and channel types for the collector reactor.
//!
//! Everything that happens off the reactor task (socket reads, worker
//! completions, signals) reaches the reactor as a [`ReactorEvent`] on one
//! unbounded channel. The channel wakes the reactor; it is never polled.
//!
//! ```text
//! reader task ---Chunk/Closed---+
//! worker pool ---JobDone--------+--> reactor --> outbound queue --> writer task
//! signals -------Shutdown/...---+
//! ```

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::store::ClientRecord;

/// Read buffer size for socket reader tasks
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

pub type SessionId = u64;

// =============================================================================
// Job outcomes: worker pool -> reactor
// =============================================================================

/// Result of one store job, tagged with the message it answers.
#[derive(Debug)]
pub struct JobDone {
    pub session: SessionId,

    /// Envelope id of the message that caused the job
    pub request_id: i32,

    pub outcome: JobOutcome,
}

#[derive(Debug)]
pub enum JobOutcome {
    Identified(Result<ClientRecord, StoreError>),

    LastRecordId(Result<u64, StoreError>),

    Inserted {
        result: Result<usize, StoreError>,
        need_accept: bool,
        /// Highest record id in the batch, if it had events
        last_record_id: Option<u64>,
    },
}

impl JobOutcome {
    /// Whether the job observed a store outage.
    pub fn store_disconnected(&self) -> bool {
        let err = match self {
            JobOutcome::Identified(r) => r.as_ref().err(),
            JobOutcome::LastRecordId(r) => r.as_ref().err(),
            JobOutcome::Inserted { result, .. } => result.as_ref().err(),
        };
        err.is_some_and(StoreError::is_disconnect)
    }
}

// =============================================================================
// Reactor events
// =============================================================================

#[derive(Debug)]
pub enum ReactorEvent {
    /// Bytes read from a session's socket, in arrival order
    Chunk { session: SessionId, data: Bytes },

    /// Reader reached EOF (`error: None`) or failed
    Closed {
        session: SessionId,
        error: Option<String>,
    },

    /// A store job finished on the worker pool
    JobDone(JobDone),

    /// Re-check store connectivity (recoverable transport error signal)
    CheckStore,

    /// Result of a connectivity re-check
    StoreChecked(Result<(), StoreError>),

    /// Graceful stop
    Shutdown,
}

// =============================================================================
// Channel types
// =============================================================================

pub type ReactorSender = mpsc::UnboundedSender<ReactorEvent>;

pub type ReactorReceiver = mpsc::UnboundedReceiver<ReactorEvent>;

/// Create the reactor's inbound event queue.
pub fn reactor_channel() -> (ReactorSender, ReactorReceiver) {
    mpsc::unbounded_channel()
}

/// Encoded frames waiting to be written to one session's socket.
pub type OutboundSender = mpsc::UnboundedSender<Bytes>;

pub type OutboundReceiver = mpsc::UnboundedReceiver<Bytes>;

/// Unbounded; a slow peer grows only its own queue.
pub fn outbound_channel() -> (OutboundSender, OutboundReceiver) {
    mpsc::unbounded_channel()
}
