//! Error types for the gattlink session engine
//!
//! Codec errors describe bytes or text that do not match the device format,
//! transport errors are whatever the radio link reports back through the
//! [`TransportPort`](crate::transport::TransportPort), and session errors are
//! the synchronous rejections of the [`CommandSession`](crate::session::CommandSession)
//! facade.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Codec Errors
// ----------------------------------------------------------------------------

/// Failure to turn raw bytes or operator text into a device value
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecError {
    #[error("Expected {expected} fields, got {actual}")]
    FieldCountMismatch { expected: usize, actual: usize },

    #[error("Field {index} ({name}) value {value:?} is outside {min}..={max}")]
    FieldOutOfRange {
        index: usize,
        name: String,
        value: String,
        min: u32,
        max: u32,
    },

    #[error("Hex string must have an even number of characters (got {length})")]
    OddLength { length: usize },

    #[error("Invalid hex character {character:?} at position {position}")]
    InvalidHexDigit { character: char, position: usize },
}

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Errors reported by a transport port implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Descriptor {descriptor} not found on characteristic {characteristic}")]
    DescriptorNotFound { characteristic: Uuid, descriptor: Uuid },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Bluetooth adapter not available")]
    AdapterNotAvailable,

    #[error("{0}")]
    Other(String),
}

// ----------------------------------------------------------------------------
// Session Errors
// ----------------------------------------------------------------------------

/// Synchronous rejections from the command session facade
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(CodecError),

    #[error("Invalid value: {0}")]
    InvalidValue(CodecError),

    #[error("Session closed")]
    Closed,
}

/// An intent that is not valid in the current connection state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Invalid transition from {from_state} on intent {intent}")]
    InvalidTransition {
        from_state: &'static str,
        intent: &'static str,
    },
}

/// Result alias for transport port calls
pub type TransportResult<T> = std::result::Result<T, TransportError>;
