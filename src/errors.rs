// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Every failure the engine can surface falls into one of six kinds. The
// propagation policy differs per kind:
//
//   TransientIo    — logged, subsystem keeps running (retry is implicit)
//   DataInvalid    — debug-logged and skipped, never propagates
//   LeaseConflict  — fatal at startup, graceful non-zero exit
//   CommandInvalid — answered on the response channel when a correlation id
//                    exists, dropped silently otherwise
//   StateInvalid   — raised to the caller; recovery paths reset to idle
//   Fatal          — process exits non-zero after releasing the lease
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Cache / WebSocket / REST / notifier hiccup. Never crashes the process.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// Unparseable message, NaN indicator, insufficient bars.
    #[error("invalid data: {0}")]
    DataInvalid(String),

    /// Another live instance already owns the exchange lease.
    #[error("lease conflict: {0}")]
    LeaseConflict(String),

    /// Command failed schema validation or expired in transit.
    #[error("invalid command: {0}")]
    CommandInvalid(String),

    /// Illegal connection-state transition.
    #[error("illegal state transition: {0}")]
    StateInvalid(String),

    /// Unrecoverable boot or credential error.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
