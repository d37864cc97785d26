//! Log-capture collaborators.
//!
//! An [`EventSource`] answers one question: which events with
//! `record_id >= after` are available right now? The answer is finite,
//! ordered by record id, and possibly empty. Waiting for more is the
//! caller's job.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::protocol::Event;

pub trait EventSource: Send {
    /// Up to `max` events with `record_id >= after`, ascending.
    fn fetch(&self, after: u64, max: usize) -> Result<Vec<Event>>;
}

/// Lets a caller keep appending to a source the agent is reading.
impl<T: EventSource + Sync + ?Sized> EventSource for Arc<T> {
    fn fetch(&self, after: u64, max: usize) -> Result<Vec<Event>> {
        (**self).fetch(after, max)
    }
}

// =============================================================================
// In-memory source
// =============================================================================

/// Events appended by the caller; used by tests and demos.
#[derive(Default)]
pub struct MemorySource {
    events: Mutex<Vec<Event>>,
}

impl MemorySource {
    pub fn new(events: Vec<Event>) -> Self {
        let source = Self::default();
        source.extend(events);
        source
    }

    /// Add events, keeping record id order.
    pub fn extend(&self, more: impl IntoIterator<Item = Event>) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.extend(more);
        events.sort_by_key(|e| e.record_id);
        events.dedup_by_key(|e| e.record_id);
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSource for MemorySource {
    fn fetch(&self, after: u64, max: usize) -> Result<Vec<Event>> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let start = events.partition_point(|e| e.record_id < after);
        Ok(events[start..].iter().take(max).cloned().collect())
    }
}

// =============================================================================
// JSON-lines source
// =============================================================================

/// Newline-delimited JSON events, one [`Event`] object per line.
///
/// The file is re-read on every fetch, so lines appended by another
/// process are picked up on the next poll. Blank lines are skipped; a line
/// that does not parse is an error naming its line number.
pub struct JsonLinesSource {
    path: PathBuf,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<Event>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            // Nothing captured yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut events = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(line).map_err(|e| {
                Error::Source(format!("{}:{}: {}", self.path.display(), idx + 1, e))
            })?;
            events.push(event);
        }
        Ok(events)
    }
}

impl EventSource for JsonLinesSource {
    fn fetch(&self, after: u64, max: usize) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = self
            .read_all()?
            .into_iter()
            .filter(|e| e.record_id >= after)
            .collect();
        events.sort_by_key(|e| e.record_id);
        events.dedup_by_key(|e| e.record_id);
        events.truncate(max);
        Ok(events)
    }
}
