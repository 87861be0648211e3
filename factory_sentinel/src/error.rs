// THEORY:
// Every failure the sentinel can meet belongs to exactly one of these classes,
// and each class has a fixed recovery rule:
//
// - `ConfigurationError`: fatal, raised only at startup (or when the selector
//   finds itself with nothing to call). Halts the loop.
// - `DecodeError`: a backend answered but its text is not a verdict. Recovered
//   as "no verdict this attempt". Never triggers failover.
// - `BackendError`: transport, auth, quota or not-found from one backend.
//   Recovered by failing over to the next candidate for the same frame.
// - `ChannelError`: speech or notification send failure. Absorbed.
// - `PersistenceError`: a state file could not be written. Logged, never fatal.
// - `FrameError`: the frame source could not yield a frame. The iteration is
//   skipped.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("backend catalog is empty")]
    EmptyCatalog,
    #[error("no viable classifier backend ({tried} candidates probed)")]
    NoViableBackend { tried: usize },
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("reply is not well-formed JSON: {0}")]
    NotStructured(#[from] serde_json::Error),
    #[error("reply is JSON but not an object")]
    NotAnObject,
    #[error("reply has no status field")]
    MissingStatus,
    #[error("unknown status value {0:?}")]
    UnknownStatus(String),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("quota exhausted: {0}")]
    Quota(String),
    #[error("backend not found: {0}")]
    NotFound(String),
    #[error("backend rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("backend returned no text")]
    EmptyReply,
    #[error("operation not supported by this classifier")]
    Unsupported,
}

/// Why the selector produced no reply for a frame.
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("all {attempts} backend attempts failed, last error: {last}")]
    Exhausted { attempts: usize, last: BackendError },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("speech engine failed: {0}")]
    Speech(String),
    #[error("notification transport failed: {0}")]
    Notification(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame source i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not decode frame: {0}")]
    Decode(#[from] image::ImageError),
    #[error("frame source has no frames")]
    Empty,
    #[error("frame source failed: {0}")]
    Device(String),
}

/// Umbrella error for callers that only need to know something went wrong.
#[derive(Debug, Error)]
pub enum SentinelError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}
