//! logship: event-log forwarding over a framed, digest-checked TCP protocol.
//!
//! Agents ([`agent`]) capture events and stream them to a collector
//! ([`server`]), which persists them through a [`store::Store`] and
//! acknowledges full batches so agents can resume after a restart.

pub mod agent;
pub mod config;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod server;
pub mod store;

pub use error::{Error, Result};
pub use identity::{Identity, OsKind};
pub use protocol::{Body, Event, LogLevel, Message};
