use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::Operation;

/// Errors raised while framing, unframing or parsing a message.
///
/// Every variant is connection-fatal: once a frame fails, the byte
/// alignment of the stream can no longer be trusted.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("digest mismatch: header {expected}, payload {actual}")]
    Corrupted { expected: String, actual: String },

    #[error("frame size {size} exceeds maximum allowed size {max}")]
    TooLarge { size: usize, max: usize },

    #[error("{0} truncated")]
    Truncated(&'static str),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("unknown operation tag {0:#04x}")]
    UnknownOperation(u8),

    #[error("operation {0:?} has no message variant")]
    UnsupportedOperation(Operation),

    #[error("decoder stopped after an earlier frame error")]
    Poisoned,
}

impl FrameError {
    pub fn is_connection_fatal(&self) -> bool {
        // No codec error is recoverable within a stream.
        true
    }

    /// Digest and header failures, as opposed to payload parse failures.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            FrameError::Corrupted { .. }
                | FrameError::TooLarge { .. }
                | FrameError::Decompress(_)
        )
    }
}

/// Errors surfaced by a [`crate::store::Store`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store is disconnected")]
    Disconnected,

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store record encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("unknown client #{0}")]
    UnknownClient(u64),

    #[error("could not connect to store after {attempts} attempts: {last}")]
    ConnectFailed { attempts: u32, last: String },
}

impl StoreError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, StoreError::Disconnected | StoreError::ConnectFailed { .. })
    }
}

impl From<fjall::Error> for StoreError {
    fn from(err: fjall::Error) -> Self {
        match err {
            fjall::Error::Poisoned => StoreError::Disconnected,
            other => StoreError::Backend(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("event source error: {0}")]
    Source(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FrameError::UnknownOperation(0x2a);
        assert_eq!(err.to_string(), "unknown operation tag 0x2a");

        let err = StoreError::ConnectFailed {
            attempts: 5,
            last: "refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "could not connect to store after 5 attempts: refused"
        );
    }

    #[test]
    fn test_frame_error_classification() {
        let corrupted = FrameError::Corrupted {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(corrupted.is_corruption());
        assert!(corrupted.is_connection_fatal());

        let unknown = FrameError::UnknownOperation(9);
        assert!(!unknown.is_corruption());
        assert!(unknown.is_connection_fatal());
    }

    #[test]
    fn test_store_error_disconnect() {
        assert!(StoreError::Disconnected.is_disconnect());
        assert!(!StoreError::Backend("x".into()).is_disconnect());
        assert!(!StoreError::UnknownClient(3).is_disconnect());
    }
}
