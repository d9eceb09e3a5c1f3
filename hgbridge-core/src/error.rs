//! Error taxonomy for the bridge
//!
//! Every variant that concerns a specific revision carries its identifier
//! (as hex) so user-visible reports can name the offending object.

use crate::id::{GitId, HgId};

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur while decoding, translating or committing history
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Corrupt delta for revision {id}: {message}")]
    CorruptDelta { id: HgId, message: String },

    #[error("Hash mismatch for revision {expected}: content hashes to {actual}")]
    HashMismatch { expected: HgId, actual: HgId },

    #[error("Unsupported mode for {path} in {object}: {mode}")]
    UnsupportedMode {
        object: String,
        path: String,
        mode: String,
    },

    #[error("Mapping conflict: {hg} -> {git} clashes with recorded {existing}")]
    Conflict {
        hg: HgId,
        git: GitId,
        existing: String,
    },

    #[error("Missing parent {parent} while translating {child}")]
    MissingParent { child: String, parent: String },

    #[error("Malformed bundle: {0}")]
    MalformedBundle(String),

    #[error("Malformed {kind} object {id}: {message}")]
    MalformedObject {
        kind: &'static str,
        id: String,
        message: String,
    },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Ambiguous identifier prefix: {0}")]
    AmbiguousId(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Index write failed after {objects} objects were written: {source}")]
    PartialCommit {
        objects: usize,
        #[source]
        source: Box<BridgeError>,
    },

    #[error("Batch cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BridgeError {
    /// Short, stable name of the error kind for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::CorruptDelta { .. } => "CorruptDeltaError",
            BridgeError::HashMismatch { .. } => "HashMismatchError",
            BridgeError::UnsupportedMode { .. } => "UnsupportedModeError",
            BridgeError::Conflict { .. } => "ConflictError",
            BridgeError::MissingParent { .. } => "MissingParentError",
            BridgeError::MalformedBundle(_) => "MalformedBundleError",
            BridgeError::MalformedObject { .. } => "MalformedObjectError",
            BridgeError::NotFound(_) => "NotFoundError",
            BridgeError::InvalidId(_) => "InvalidIdError",
            BridgeError::AmbiguousId(_) => "AmbiguousIdError",
            BridgeError::Transport(_) => "TransportError",
            BridgeError::PartialCommit { .. } => "PartialCommitError",
            BridgeError::Cancelled(_) => "CancelledError",
            BridgeError::Io(_) => "IoError",
            BridgeError::Serialization(_) => "SerializationError",
        }
    }

    /// Whether objects were durably written before the failure, so that
    /// only the index write needs retrying.
    pub fn objects_written(&self) -> bool {
        matches!(self, BridgeError::PartialCommit { .. })
    }

    /// Transport failures are retried by re-entering discovery.
    pub fn is_transport(&self) -> bool {
        matches!(self, BridgeError::Transport(_))
    }

    pub(crate) fn malformed(
        kind: &'static str,
        id: impl ToString,
        message: impl Into<String>,
    ) -> Self {
        BridgeError::MalformedObject {
            kind,
            id: id.to_string(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Serialization(e.to_string())
    }
}
