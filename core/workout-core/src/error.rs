//! Error types for the coordination core.
//!
//! Channel failures are recovered inside the sync layer and never reach the
//! state machine; they exist as a type so transports can report them.

use std::path::PathBuf;

use workout_sync_protocol::LifecycleState;

// ═══════════════════════════════════════════════════════════════════════════════
// Core Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors surfaced by coordinator intents and setup.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Cannot {intent} a workout that is {state:?}")]
    InvalidTransition {
        intent: &'static str,
        state: LifecycleState,
    },

    #[error("No remote workout is available to join")]
    NothingToJoin,

    #[error("Coordinator is no longer running")]
    CoordinatorStopped,

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Home directory not found")]
    HomeDirNotFound,

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience type alias for Results using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Channel Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a single send attempt did not reach the peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("peer is not reachable")]
    Unreachable,

    #[error("peer did not reply within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("peer device is not paired")]
    NotPaired,

    #[error("link rejected envelope: {0}")]
    Rejected(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Persistence Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Reported by the persistence collaborator when a finished session could not
/// be stored. The session is already torn down when this is observed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to persist workout {session_id}: {message}")]
pub struct FinalizeError {
    pub session_id: String,
    pub message: String,
}
