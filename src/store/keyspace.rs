//! Persistent store on an embedded fjall keyspace.
//!
//! # Layout
//!
//! ```text
//! clients  machine_id                      -> bincode ClientRecord
//! events   client_id:u64 BE | record_id:u64 BE -> bincode StoredEvent
//! meta     "client_seq"                    -> u64 BE, last allocated client id
//! ```
//!
//! Event keys sort by record id within a client, so the last key under a
//! client prefix is that client's highest stored record id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::{Deserialize, Serialize};

use super::{severity_name, ClientIdentity, ClientRecord, Store};
use crate::error::StoreError;
use crate::protocol::Event;

const CLIENT_SEQ_KEY: &str = "client_seq";
const EVENT_KEY_LEN: usize = 16;

/// One event row as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub record_id: u64,
    pub severity: String,
    pub level: u8,
    pub timestamp: String,
    pub provider: String,
    pub message: String,
    pub xml: String,
    pub received_at: String,
}

impl StoredEvent {
    fn from_event(event: &Event, received_at: &str) -> Self {
        let level = event.level.numeric();
        Self {
            record_id: event.record_id,
            severity: severity_name(level).to_string(),
            level,
            timestamp: event.timestamp.clone(),
            provider: event.provider.clone(),
            message: event.format.clone(),
            xml: event.xml.clone(),
            received_at: received_at.to_string(),
        }
    }
}

fn event_key(client_id: u64, record_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(EVENT_KEY_LEN);
    key.extend_from_slice(&client_id.to_be_bytes());
    key.extend_from_slice(&record_id.to_be_bytes());
    key
}

fn record_id_from_key(key: &[u8]) -> Result<u64, StoreError> {
    key.get(8..EVENT_KEY_LEN)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| StoreError::Backend(format!("malformed event key of {} bytes", key.len())))
}

#[derive(Clone)]
struct Handles {
    keyspace: Keyspace,
    clients: PartitionHandle,
    events: PartitionHandle,
    meta: PartitionHandle,
}

impl Handles {
    fn open(path: &Path) -> Result<Self, StoreError> {
        let keyspace = fjall::Config::new(path).open()?;
        let clients = keyspace.open_partition("clients", PartitionCreateOptions::default())?;
        let events = keyspace.open_partition("events", PartitionCreateOptions::default())?;
        let meta = keyspace.open_partition("meta", PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            clients,
            events,
            meta,
        })
    }

    fn load_clients(&self) -> Result<HashMap<String, ClientRecord>, StoreError> {
        let mut out = HashMap::new();
        for item in self.clients.iter() {
            let (_, value) = item?;
            let record: ClientRecord = bincode::deserialize(&value)?;
            tracing::debug!(
                client_id = record.id,
                name = %record.name,
                os = record.os_kind.as_str(),
                os_version = %record.os_version,
                "known client"
            );
            out.insert(record.machine_id.clone(), record);
        }
        Ok(out)
    }

    fn client_seq(&self) -> Result<u64, StoreError> {
        match self.meta.get(CLIENT_SEQ_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes[..]
                    .try_into()
                    .map_err(|_| StoreError::Backend("malformed client sequence".into()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }
}

pub struct FjallStore {
    path: PathBuf,
    handles: RwLock<Option<Handles>>,
    /// machine_id -> record; also serializes client registration
    clients: Mutex<HashMap<String, ClientRecord>>,
}

impl FjallStore {
    /// Create an unconnected store rooted at `path`. Nothing touches the
    /// disk until [`Store::connect`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            handles: RwLock::new(None),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events stored for a client, in record id order.
    pub fn events_for(&self, client_id: u64) -> Result<Vec<StoredEvent>, StoreError> {
        let handles = self.handles()?;
        let mut out = Vec::new();
        for item in handles.events.prefix(client_id.to_be_bytes()) {
            let (_, value) = self.check(item)?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    fn handles(&self) -> Result<Handles, StoreError> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(StoreError::Disconnected)
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, ClientRecord>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Map a backend result, dropping the handles on an outage so later
    /// calls report `Disconnected` until a reconnect succeeds.
    fn check<T>(&self, result: fjall::Result<T>) -> Result<T, StoreError> {
        result.map_err(|e| {
            let err = StoreError::from(e);
            if err.is_disconnect() {
                tracing::error!(path = %self.path.display(), "store backend poisoned, marking disconnected");
                *self.handles.write().unwrap_or_else(|e| e.into_inner()) = None;
            }
            err
        })
    }

    fn open(&self) -> Result<(), StoreError> {
        let handles = Handles::open(&self.path)?;
        let known = handles.load_clients()?;
        tracing::info!(path = %self.path.display(), clients = known.len(), "opened store");

        *self.cache() = known;
        *self.handles.write().unwrap_or_else(|e| e.into_inner()) = Some(handles);
        Ok(())
    }

    fn save_client(&self, handles: &Handles, record: &ClientRecord) -> Result<(), StoreError> {
        let value = bincode::serialize(record)?;
        self.check(handles.clients.insert(record.machine_id.as_bytes(), value))
    }
}

impl Store for FjallStore {
    fn connect(&self) -> Result<(), StoreError> {
        if self.is_connected() {
            return Ok(());
        }
        self.open()
    }

    fn reconnect(&self) -> Result<(), StoreError> {
        tracing::info!(path = %self.path.display(), "reconnecting store");
        match self.handles() {
            // Keyspace still open: re-validate it by reloading the client cache.
            Ok(handles) => {
                let known = handles.load_clients()?;
                *self.cache() = known;
                Ok(())
            }
            Err(_) => self.open(),
        }
    }

    fn is_connected(&self) -> bool {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn lookup_or_register_client(
        &self,
        identity: &ClientIdentity,
    ) -> Result<ClientRecord, StoreError> {
        let handles = self.handles()?;
        let mut cache = self.cache();

        if let Some(record) = cache.get_mut(&identity.machine_id) {
            record.touch(identity);
            let record = record.clone();
            self.save_client(&handles, &record)?;
            return Ok(record);
        }

        let id = handles.client_seq()? + 1;
        let record = ClientRecord::register(id, identity);

        let mut batch = handles.keyspace.batch();
        batch.insert(
            &handles.clients,
            record.machine_id.as_bytes(),
            bincode::serialize(&record)?,
        );
        batch.insert(&handles.meta, CLIENT_SEQ_KEY.as_bytes(), id.to_be_bytes().to_vec());
        self.check(batch.commit())?;
        self.check(handles.keyspace.persist(PersistMode::SyncAll))?;

        tracing::info!(
            client_id = id,
            name = %record.name,
            machine_id = %record.machine_id,
            "registered new client"
        );
        cache.insert(record.machine_id.clone(), record.clone());
        Ok(record)
    }

    fn last_record_id(&self, client: &ClientRecord) -> Result<u64, StoreError> {
        let handles = self.handles()?;
        match handles.events.prefix(client.id.to_be_bytes()).next_back() {
            Some(item) => {
                let (key, _) = self.check(item)?;
                record_id_from_key(&key)
            }
            None => Ok(0),
        }
    }

    fn insert_events(&self, client: &ClientRecord, events: &[Event]) -> Result<usize, StoreError> {
        let handles = self.handles()?;
        if !self
            .cache()
            .get(&client.machine_id)
            .is_some_and(|known| known.id == client.id)
        {
            return Err(StoreError::UnknownClient(client.id));
        }
        let received_at = chrono::Local::now().to_rfc3339();

        let mut batch = handles.keyspace.batch();
        for event in events {
            let row = StoredEvent::from_event(event, &received_at);
            batch.insert(
                &handles.events,
                event_key(client.id, event.record_id),
                bincode::serialize(&row)?,
            );
        }
        self.check(batch.commit())?;
        self.check(handles.keyspace.persist(PersistMode::SyncData))?;

        tracing::debug!(client_id = client.id, events = events.len(), "inserted events");
        Ok(events.len())
    }
}
