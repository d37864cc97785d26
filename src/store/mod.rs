//! Persistence collaborator for the collector.
//!
//! The dispatcher never touches a store from the reactor thread: every call
//! below is blocking and runs on the worker pool (or once at startup).
//! Individual calls are atomic from the caller's point of view.

pub mod keyspace;
pub mod memory;

use std::thread;
use std::time::Duration;

use crate::error::StoreError;
use crate::identity::{Identity, OsKind};
use crate::protocol::Event;

pub use keyspace::FjallStore;
pub use memory::MemoryStore;

/// The identity a client registers under. Keyed by machine fingerprint.
pub type ClientIdentity = Identity;

/// A registered agent, as the store knows it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ClientRecord {
    pub id: u64,
    pub name: String,
    pub os_kind: OsKind,
    pub os_version: String,
    pub machine_id: String,
    pub registered_at: String,
    pub last_seen: String,
}

impl ClientRecord {
    fn register(id: u64, identity: &ClientIdentity) -> Self {
        let now = chrono::Local::now().to_rfc3339();
        Self {
            id,
            name: identity.client_name.clone(),
            os_kind: identity.os_kind,
            os_version: identity.os_version.clone(),
            machine_id: identity.machine_id.clone(),
            registered_at: now.clone(),
            last_seen: now,
        }
    }

    /// Refresh last-seen and OS version on reconnect.
    fn touch(&mut self, identity: &ClientIdentity) {
        if self.os_version != identity.os_version {
            tracing::info!(
                client_id = self.id,
                machine_id = %self.machine_id,
                from = %self.os_version,
                to = %identity.os_version,
                "client OS version changed"
            );
            self.os_version = identity.os_version.clone();
        }
        self.last_seen = chrono::Local::now().to_rfc3339();
    }
}

pub trait Store: Send + Sync {
    /// Open the backend. Idempotent when already connected.
    fn connect(&self) -> Result<(), StoreError>;

    /// Re-establish the backend after an outage.
    fn reconnect(&self) -> Result<(), StoreError>;

    fn is_connected(&self) -> bool;

    /// Find the client by machine fingerprint, registering it on first
    /// contact and refreshing OS version and last-seen otherwise.
    fn lookup_or_register_client(&self, identity: &ClientIdentity)
        -> Result<ClientRecord, StoreError>;

    /// Highest stored record id for the client, 0 when none.
    fn last_record_id(&self, client: &ClientRecord) -> Result<u64, StoreError>;

    /// Persist a batch atomically: on error nothing from the batch is kept.
    fn insert_events(&self, client: &ClientRecord, events: &[Event]) -> Result<usize, StoreError>;
}

/// Connect with exponential backoff: waits `base * 2^n` after the n-th
/// failure, giving up after `attempts` tries.
pub fn connect_with_backoff(
    store: &dyn Store,
    attempts: u32,
    base: Duration,
) -> Result<(), StoreError> {
    let attempts = attempts.max(1);
    let mut last = String::new();

    for attempt in 0..attempts {
        match store.connect() {
            Ok(()) => {
                tracing::info!(attempt = attempt + 1, "connected to store");
                return Ok(());
            }
            Err(e) => {
                last = e.to_string();
                tracing::warn!(attempt = attempt + 1, attempts, error = %e, "store connect failed");
                if attempt + 1 < attempts {
                    thread::sleep(base.saturating_mul(1u32 << attempt.min(16)));
                }
            }
        }
    }

    tracing::error!(attempts, error = %last, "giving up on store connection");
    Err(StoreError::ConnectFailed { attempts, last })
}

/// Severity text stored alongside each event.
pub fn severity_name(level_numeric: u8) -> &'static str {
    match level_numeric {
        1 => "fatal",
        2 => "error",
        3 => "warning",
        4 => "info",
        5 => "verbose",
        _ => "others",
    }
}
