//! Error types for the snowtor engine.
//!
//! Errors are grouped by the layer that produces them: transport, link,
//! circuit, relay-cell layer, directory, and circuit manager. Classification
//! helpers tell callers whether a failure is fatal for the client or just
//! for the circuit/attempt that produced it.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Main error type for the snowtor engine.
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Transport =====
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out")]
    Timeout,

    // ===== Cell codec =====
    #[error("Short read: stream ended mid-cell ({0} bytes missing)")]
    ShortRead(usize),

    #[error("Unknown cell command: {0}")]
    UnknownCommand(u8),

    // ===== Link =====
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid certificate: {0}")]
    InvalidCert(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Unexpected cell: expected {expected}, got {got}")]
    UnexpectedCell { expected: String, got: String },

    // ===== Circuit =====
    #[error("Circuit destroyed: reason={reason} ({})", reason_name(.reason))]
    Destroyed { reason: u8 },

    #[error("Circuit extend failed: {0}")]
    ExtendFailed(String),

    #[error("Circuit truncate failed: {0}")]
    TruncateFailed(String),

    #[error("Stream open failed: {0}")]
    OpenFailed(String),

    #[error("Stream ids exhausted on circuit")]
    StreamIdExhausted,

    #[error("ntor auth tag mismatch")]
    InvalidNtorAuth,

    // ===== Relay cell layer =====
    #[error("Relay cell not recognized by any hop")]
    UnrecognizedCell,

    #[error("Relay cell digest mismatch")]
    DigestMismatch,

    #[error("Relay cell digest replayed")]
    ReplayDetected,

    #[error("Flow-control window underflow")]
    WindowUnderflow,

    #[error("Stream closed: {0}")]
    StreamClosed(String),

    // ===== Directory =====
    #[error("Consensus is stale (past fresh-until)")]
    ConsensusStale,

    #[error("Consensus has expired (past valid-until)")]
    ConsensusExpired,

    #[error("Consensus diff applies to an unknown base: {0}")]
    DiffBaseUnknown(String),

    #[error("Consensus diff result hash mismatch")]
    DiffHashMismatch,

    #[error("Too few valid authority signatures: got {got}, need {need}")]
    SignatureQuorumNotMet { got: usize, need: usize },

    #[error("Authority certificate expired: {0}")]
    CertificateExpired(String),

    #[error("Microdesc body hash mismatch for {0}")]
    MicrodescHashMismatch(String),

    #[error("304 Not Modified but no cached consensus remains valid")]
    NotModifiedNoBase,

    #[error("Directory error: {0}")]
    Directory(String),

    // ===== Circuit manager =====
    #[error("No circuit creation configured (buffer size is 0)")]
    NoCreationConfigured,

    #[error("Circuit build backoff in effect for {0}ms")]
    BackoffInEffect(u64),

    #[error("All {0} circuit build attempts failed")]
    AllAttemptsExhausted(usize),

    // ===== Glue =====
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TorError {
    /// Whether this error is fatal for the whole client rather than for the
    /// circuit or attempt that produced it.
    ///
    /// Cryptographic failures on a link mean the path cannot be trusted;
    /// everything else is retried with fresh relays or a fresh document.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TorError::InvalidCert(_) | TorError::InvalidSignature(_) | TorError::InvalidNtorAuth
        )
    }

    /// Whether the circuit builder may retry this failure with a different
    /// path.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::ConnectFailed(_)
                | TorError::Closed
                | TorError::Timeout
                | TorError::Destroyed { .. }
                | TorError::ExtendFailed(_)
                | TorError::TruncateFailed(_)
                | TorError::OpenFailed(_)
                | TorError::ProtocolViolation(_)
                | TorError::UnexpectedCell { .. }
                | TorError::ShortRead(_)
        )
    }
}

fn reason_name(reason: &u8) -> &'static str {
    destroy_reason_name(*reason)
}

/// Name for a DESTROY reason code, per tor-spec §5.4.
pub fn destroy_reason_name(reason: u8) -> &'static str {
    match reason {
        0 => "NONE",
        1 => "PROTOCOL",
        2 => "INTERNAL",
        3 => "REQUESTED",
        4 => "HIBERNATING",
        5 => "RESOURCELIMIT",
        6 => "CONNECTFAILED",
        7 => "OR_IDENTITY",
        8 => "CHANNEL_CLOSED",
        9 => "FINISHED",
        10 => "TIMEOUT",
        11 => "DESTROYED",
        12 => "NOSUCHSERVICE",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors() {
        assert!(TorError::InvalidCert("bad chain".into()).is_fatal());
        assert!(TorError::InvalidSignature("cross-cert".into()).is_fatal());
        assert!(TorError::InvalidNtorAuth.is_fatal());

        assert!(!TorError::Timeout.is_fatal());
        assert!(!TorError::Destroyed { reason: 10 }.is_fatal());
    }

    #[test]
    fn retryable_errors() {
        assert!(TorError::ConnectFailed("refused".into()).is_retryable());
        assert!(TorError::ExtendFailed("no EXTENDED2".into()).is_retryable());
        assert!(!TorError::InvalidNtorAuth.is_retryable());
        assert!(!TorError::SignatureQuorumNotMet { got: 1, need: 3 }.is_retryable());
    }

    #[test]
    fn destroy_reason_names() {
        assert_eq!(destroy_reason_name(1), "PROTOCOL");
        assert_eq!(destroy_reason_name(10), "TIMEOUT");
        assert_eq!(destroy_reason_name(200), "UNKNOWN");
        let err = TorError::Destroyed { reason: 8 };
        assert!(err.to_string().contains("CHANNEL_CLOSED"));
    }
}
