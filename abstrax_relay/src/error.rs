// Error types for the relay.
//
// Malformed client tokens are not errors (the codec skips them) and session
// send failures never surface beyond the hub, which evicts the session. What
// remains are snapshot failures, reported back to the session that asked for
// the save, and startup failures, reported by the binary before it exits.

use std::io;
use std::path::PathBuf;

/// Snapshot persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The requested name contains no allowed characters.
    #[error("snapshot name {0:?} is empty after sanitization")]
    InvalidName(String),

    /// Writing or reading the snapshot file failed.
    #[error("snapshot {name:?}: {source}")]
    Persistence {
        name: String,
        #[source]
        source: io::Error,
    },

    /// No snapshot with this name exists.
    #[error("snapshot {0:?} not found")]
    NotFound(String),
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config: read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config: parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config: invalid sink address {0:?}")]
    InvalidSink(String),
}

/// Failures that prevent the relay from starting.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("bind {what}: {source}")]
    Bind {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("restore: {0}")]
    Restore(#[from] SnapshotError),
}
