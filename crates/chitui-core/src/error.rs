// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for the ChitUI relay.

use thiserror::Error;

use crate::types::ConnectionState;

/// Top-level error type for all relay operations.
#[derive(Debug, Error)]
pub enum ChituiError {
    // -- Codec / routing --
    #[error("malformed SDCP frame: {0}")]
    MalformedFrame(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("printer {0} is already registered")]
    DuplicateIdentity(String),

    // -- Session / command --
    #[error("printer {0} is not connected")]
    SessionNotConnected(String),

    #[error("command {command} to {device_id} timed out after {timeout_ms} ms")]
    CommandTimeout {
        device_id: String,
        command: String,
        timeout_ms: u64,
    },

    #[error("protocol mismatch: expected {expected} response, got {actual}")]
    ProtocolMismatch { expected: String, actual: String },

    #[error("printer {0} was removed")]
    SessionRemoved(String),

    #[error("printer {device_id} reported error code {code}")]
    PrinterRejected { device_id: String, code: i64 },

    #[error("invalid connection transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    // -- Network --
    #[error("transport error: {0}")]
    Transport(String),

    #[error("printer discovery failed: {0}")]
    Discovery(String),

    // -- Transfer --
    #[error("upload failed: {0}")]
    Upload(String),

    #[error("unsupported file type: {0}")]
    UnsupportedFile(String),

    #[error("another upload is already in progress")]
    UploadInProgress,

    #[error("USB gadget is not enabled")]
    GadgetUnavailable,

    // -- Storage / persistence --
    #[error("settings error: {0}")]
    Settings(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChituiError {
    /// Whether a caller-side retry has a chance of succeeding.
    ///
    /// The dispatcher never retries on its own; callers that do (listing
    /// refreshes, reconnects) consult this before scheduling another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::CommandTimeout { .. }
            | Self::SessionNotConnected(_)
            | Self::Transport(_)
            | Self::Discovery(_)
            | Self::UploadInProgress => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ChituiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_transient() {
        let err = ChituiError::CommandTimeout {
            device_id: "abc".into(),
            command: "ListFiles".into(),
            timeout_ms: 5000,
        };
        assert!(err.is_transient());
    }

    #[test]
    fn protocol_errors_are_permanent() {
        let err = ChituiError::ProtocolMismatch {
            expected: "FileList".into(),
            actual: "CommandAck".into(),
        };
        assert!(!err.is_transient());
        assert!(!ChituiError::SessionRemoved("abc".into()).is_transient());
    }

    #[test]
    fn io_kind_drives_classification() {
        let reset = ChituiError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        let denied = ChituiError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(reset.is_transient());
        assert!(!denied.is_transient());
    }
}
