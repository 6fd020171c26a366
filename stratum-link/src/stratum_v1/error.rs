//! Error types for Stratum v1 protocol.

use thiserror::Error;
use uuid::Uuid;

/// Stratum protocol errors.
#[derive(Error, Debug)]
pub enum StratumError {
    /// JSON parsing or serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid message format received from the peer
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Outbound connection attempt failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Socket has no local address (never connected, or already torn down)
    #[error("Socket is not connected")]
    NotConnected,

    /// Gated send attempted before the worker was authorized
    #[error("Send refused: {0}")]
    UnauthorizedSend(MiningError),

    /// Transport reported an error while writing or flushing
    #[error("Write failed on connection {connection}: {source}")]
    TransportWrite {
        connection: Uuid,
        #[source]
        source: std::io::Error,
    },

    /// Connection closed before the operation completed
    #[error("Connection lost")]
    Disconnected,

    /// Invalid URL format
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Convenient Result type for Stratum operations.
pub type StratumResult<T> = Result<T, StratumError>;

/// Conventional Stratum error classifications.
///
/// Pools report these as `[code, "message", null]` in the `error` member of
/// a response. The client uses the same vocabulary for locally detected
/// protocol errors so consumers see one taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MiningError {
    Other,
    JobNotFound,
    DuplicateShare,
    LowDifficultyShare,
    UnauthorizedWorker,
    NotSubscribed,
}

impl MiningError {
    pub fn code(self) -> i64 {
        match self {
            MiningError::Other => 20,
            MiningError::JobNotFound => 21,
            MiningError::DuplicateShare => 22,
            MiningError::LowDifficultyShare => 23,
            MiningError::UnauthorizedWorker => 24,
            MiningError::NotSubscribed => 25,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            MiningError::Other => "Other/Unknown",
            MiningError::JobNotFound => "Job not found",
            MiningError::DuplicateShare => "Duplicate share",
            MiningError::LowDifficultyShare => "Low difficulty share",
            MiningError::UnauthorizedWorker => "Unauthorized worker",
            MiningError::NotSubscribed => "Not subscribed",
        }
    }

    /// Look up a classification by its wire code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            20 => Some(MiningError::Other),
            21 => Some(MiningError::JobNotFound),
            22 => Some(MiningError::DuplicateShare),
            23 => Some(MiningError::LowDifficultyShare),
            24 => Some(MiningError::UnauthorizedWorker),
            25 => Some(MiningError::NotSubscribed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MiningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}
