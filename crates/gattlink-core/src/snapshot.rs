//! Published session state and transient session events

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::CodecError;
use crate::profile::DevicePayload;
use crate::transport::ConnectionState;

/// Name and address of the peripheral, fixed for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    pub address: String,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

// ----------------------------------------------------------------------------
// Session Snapshot
// ----------------------------------------------------------------------------

/// Immutable view of a session, republished after every applied change
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub identity: DeviceIdentity,
    pub state: ConnectionState,
    /// Last command characteristic value that decoded cleanly
    pub payload: Option<DevicePayload>,
    /// Bytes of the last command characteristic value, decoded or not
    pub raw_value: Option<Vec<u8>>,
    /// Why `raw_value` did not decode, if it did not
    pub decode_advisory: Option<CodecError>,
    /// A write is waiting for its verifying read
    pub verifying: bool,
    /// Last values read from other characteristics
    pub characteristic_values: BTreeMap<Uuid, Vec<u8>>,
    /// Last values read from descriptors, keyed by (characteristic, descriptor)
    pub descriptor_values: BTreeMap<(Uuid, Uuid), Vec<u8>>,
    /// Characteristics with notifications enabled
    pub notifying: BTreeSet<Uuid>,
}

impl SessionSnapshot {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            state: ConnectionState::Disconnected,
            payload: None,
            raw_value: None,
            decode_advisory: None,
            verifying: false,
            characteristic_values: BTreeMap::new(),
            descriptor_values: BTreeMap::new(),
            notifying: BTreeSet::new(),
        }
    }

    /// Raw command value as lossy UTF-8, for display when it did not decode
    pub fn raw_text(&self) -> Option<String> {
        self.raw_value
            .as_ref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }
}

// ----------------------------------------------------------------------------
// Session Events
// ----------------------------------------------------------------------------

/// Transport operation named in a failure event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Connect,
    AutoRead,
    Write,
    ReadDescriptor,
    WriteDescriptor,
    EnableNotifications,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Connect => "Connect",
            Operation::AutoRead => "Auto-read",
            Operation::Write => "Write",
            Operation::ReadDescriptor => "Descriptor read",
            Operation::WriteDescriptor => "Descriptor write",
            Operation::EnableNotifications => "Enable notifications",
        };
        f.write_str(name)
    }
}

/// Fire-and-forget notification for whoever is listening right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// A payload failed profile validation before reaching the transport
    InvalidPayload { message: String },
    /// The transport rejected an operation
    TransportFailure { operation: Operation, message: String },
    /// A write succeeded but none of its verifying reads did
    VerificationExhausted {
        characteristic: Uuid,
        attempts: u8,
        message: String,
    },
}

impl SessionEvent {
    pub fn transport_failure(operation: Operation, message: impl Into<String>) -> Self {
        SessionEvent::TransportFailure {
            operation,
            message: message.into(),
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::InvalidPayload { message } => write!(f, "Invalid payload: {}", message),
            SessionEvent::TransportFailure { operation, message } => {
                write!(f, "{} failed: {}", operation, message)
            }
            SessionEvent::VerificationExhausted { message, .. } => {
                write!(f, "Write failed: {}", message)
            }
        }
    }
}
