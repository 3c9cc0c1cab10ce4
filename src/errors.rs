//! Replicated Storage Backend Error Hierarchy
//!
//! Defines error types for the replicated key-value backend, categorized by
//! recoverability: backend errors are caller-recoverable, storage errors are
//! fatal for the local replica.

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller-recoverable backend contract violations
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Persistence engine failures; fatal for the local replica
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    /// Unrecoverable failures requiring the replica to halt
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// Whether the local replica must stop serving traffic.
    ///
    /// Apply-path and persistence failures risk divergence between replicas,
    /// so they can never be retried in place.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_) | Error::Storage(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Command rejected before submission; retry with a smaller payload
    #[error("Command of {size} bytes exceeds the {limit} bytes limit")]
    CommandTooLarge { size: usize, limit: usize },

    /// Write attempted on a non-leader replica
    #[error("Not cluster leader (known leader: {leader_hint:?})")]
    NotLeader { leader_hint: Option<String> },

    /// Operation attempted before bootstrap/setup completed
    #[error("Cluster bootstrap not completed")]
    NotReady,

    /// Bootstrap attempted against non-fresh local state
    #[error("Cluster is already bootstrapped")]
    AlreadyBootstrapped,

    /// Operation interrupted by shutdown or a caller-supplied cancellation
    #[error("Operation cancelled")]
    Cancelled,

    /// Forwarding a write to the current leader failed
    #[error("Forwarding to leader failed: {0}")]
    ForwardingFailed(String),

    /// Address resolution found no entry for a cluster member
    #[error("No address known for peer {0}")]
    UnknownPeer(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failures during store/snapshot operations
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Serialization failures for persisted data
    #[error(transparent)]
    BincodeError(#[from] bincode::Error),

    /// Embedded database errors
    #[error("Embedded database error: {0}")]
    DbError(String),

    /// Snapshot creation/restoration failures
    #[error("Snapshot operation failed: {0}")]
    Snapshot(String),

    /// Checksum or format validation failures
    #[error("Data corruption detected at {location}")]
    DataCorruption { location: String },

    /// Error type for value conversion operations
    #[error("Value convert failed")]
    Convert(#[from] ConvertError),
}

/// Error type for value conversion operations
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// This occurs when the input byte slice length doesn't match the required 8 bytes.
    #[error("invalid byte length: expected 8 bytes, received {0} bytes")]
    InvalidLength(usize),
}

// ============== Conversion Implementations ============== //
impl From<ConvertError> for Error {
    fn from(e: ConvertError) -> Self {
        Error::Storage(StorageError::Convert(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(StorageError::IoError(err))
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Storage(StorageError::BincodeError(err))
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        StorageError::DbError(err.to_string()).into()
    }
}
