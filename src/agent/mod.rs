//! Forwarding agent: reads captured events from a source and ships them to
//! the collector, resuming where the collector's durable state ends.

pub mod connection;
pub mod forwarder;
pub mod source;

pub use connection::{AgentConnection, Backoff};
pub use forwarder::{Forwarder, ForwarderState};
pub use source::{EventSource, JsonLinesSource, MemorySource};
