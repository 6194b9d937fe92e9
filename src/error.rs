// ABOUTME: Typed error kinds for the extraction engine
// ABOUTME: Each kind carries a remediation hint and a retry classification

use thiserror::Error;

/// Result alias used across the library.
pub type Result<T, E = SourceError> = std::result::Result<T, E>;

/// Errors surfaced by the extraction engine.
///
/// `Display` carries only the failure; [`SourceError::remediation`] is the
/// operator hint, appended once wherever the error is reported.
///
/// Configuration and permission errors abort the sync before any record is
/// emitted. Decode and network errors are scoped to the log connection that
/// produced them.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Missing or mismatched slot, publication, catalog or config value
    #[error("configuration error: {message}")]
    Config { message: String, hint: String },

    /// Insufficient rights for an operation the sync depends on
    #[error("permission error: {message}")]
    Permission { message: String, hint: String },

    /// The replication slot already has an active consumer
    #[error("replication slot '{slot}' is in use by another consumer")]
    SlotBusy { slot: String },

    /// Structurally malformed log frame
    #[error("decode error: {0}")]
    Decode(String),

    /// Connection drop, timeout or refused connect
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Persisted state that cannot be parsed
    #[error("state is corrupt: {0}")]
    StateCorrupt(String),

    /// The sync was cancelled between checkpoints
    #[error("sync cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SourceError {
    pub fn config(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            hint: hint.into(),
        }
    }

    pub fn permission(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Permission {
            message: message.into(),
            hint: hint.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientNetwork(message.into())
    }

    /// Whether the reconnect loop may retry after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::TransientNetwork(_) => true,
            SourceError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::TimedOut
            ),
            SourceError::Database(e) => e.is_closed() || e.code().is_none(),
            _ => false,
        }
    }

    /// A specific remediation hint for operators.
    pub fn remediation(&self) -> String {
        match self {
            SourceError::Config { hint, .. } | SourceError::Permission { hint, .. } => hint.clone(),
            SourceError::SlotBusy { slot } => format!(
                "check pg_replication_slots for an active_pid on '{}' and stop that consumer; it is never preempted",
                slot
            ),
            SourceError::Decode(_) => {
                "verify the slot uses the pgoutput plugin and the server is PostgreSQL 10+".to_string()
            }
            SourceError::TransientNetwork(_) => {
                "check network reachability of the source; the sync resumes from the last checkpoint"
                    .to_string()
            }
            SourceError::StateCorrupt(_) => {
                "remove or repair the persisted state to force a first sync".to_string()
            }
            SourceError::Cancelled => "re-run the sync; it resumes from the last checkpoint".to_string(),
            SourceError::Database(_) => "inspect the database error above".to_string(),
            SourceError::Io(_) => "check file permissions and disk space".to_string(),
            SourceError::Serialization(_) => "inspect the payload that failed to serialize".to_string(),
        }
    }

    /// The error followed by its hint, as shown in logs and LOG messages.
    pub fn report(&self) -> String {
        format!("{} (fix: {})", self, self.remediation())
    }
}
