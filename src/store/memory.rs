//! In-memory store for tests and `--ephemeral` collectors.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{ClientIdentity, ClientRecord, Store};
use crate::error::StoreError;
use crate::protocol::Event;

#[derive(Default)]
struct Tables {
    clients: HashMap<String, ClientRecord>,
    /// (client id, record id) -> event
    events: BTreeMap<(u64, u64), Event>,
    next_client_id: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    connected: AtomicBool,
    /// Number of upcoming inserts to fail with a backend error
    failing_inserts: AtomicUsize,
    insert_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that is already connected.
    pub fn connected() -> Self {
        let store = Self::new();
        store.connected.store(true, Ordering::SeqCst);
        store
    }

    /// Simulate an outage or its recovery.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make the next `n` inserts fail without storing anything.
    pub fn fail_next_inserts(&self, n: usize) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn events_for(&self, client_id: u64) -> Vec<Event> {
        self.tables()
            .events
            .range((client_id, 0)..=(client_id, u64::MAX))
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.tables().clients.len()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Disconnected)
        }
    }
}

impl Store for MemoryStore {
    fn connect(&self) -> Result<(), StoreError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn reconnect(&self) -> Result<(), StoreError> {
        self.connect()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn lookup_or_register_client(
        &self,
        identity: &ClientIdentity,
    ) -> Result<ClientRecord, StoreError> {
        self.ensure_connected()?;
        let mut tables = self.tables();

        if let Some(record) = tables.clients.get_mut(&identity.machine_id) {
            record.touch(identity);
            return Ok(record.clone());
        }

        tables.next_client_id += 1;
        let record = ClientRecord::register(tables.next_client_id, identity);
        tables
            .clients
            .insert(identity.machine_id.clone(), record.clone());
        tracing::info!(client_id = record.id, machine_id = %record.machine_id, "registered new client");
        Ok(record)
    }

    fn last_record_id(&self, client: &ClientRecord) -> Result<u64, StoreError> {
        self.ensure_connected()?;
        Ok(self
            .tables()
            .events
            .range((client.id, 0)..=(client.id, u64::MAX))
            .next_back()
            .map(|((_, rid), _)| *rid)
            .unwrap_or(0))
    }

    fn insert_events(&self, client: &ClientRecord, events: &[Event]) -> Result<usize, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()?;

        let failing = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Backend("injected insert failure".into()));
        }

        let mut tables = self.tables();
        if !tables
            .clients
            .get(&client.machine_id)
            .is_some_and(|known| known.id == client.id)
        {
            return Err(StoreError::UnknownClient(client.id));
        }
        for event in events {
            tables
                .events
                .insert((client.id, event.record_id), event.clone());
        }
        Ok(events.len())
    }
}
