//! Error types for BLE transport

use gattlink_core::TransportError;
use thiserror::Error;
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the BLE transport
#[derive(Error, Debug)]
pub enum BleTransportError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Failed to access BLE adapter: {0}")]
    Adapter(String),

    #[error("No device with address {address} found within {timeout_ms}ms")]
    DeviceNotFound { address: String, timeout_ms: u64 },

    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    #[error("Connection timed out after {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Descriptor {descriptor} not found on characteristic {characteristic}")]
    DescriptorNotFound { characteristic: Uuid, descriptor: Uuid },

    #[error("Failed to read: {0}")]
    ReadFailed(String),

    #[error("Failed to write: {0}")]
    WriteFailed(String),

    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    #[error("Failed to get BLE event stream: {0}")]
    EventStreamFailed(String),
}

impl From<BleTransportError> for TransportError {
    fn from(err: BleTransportError) -> Self {
        match err {
            BleTransportError::AdapterNotAvailable => TransportError::AdapterNotAvailable,
            BleTransportError::NotConnected => TransportError::NotConnected,
            BleTransportError::ConnectionTimeout { timeout_ms } => TransportError::Timeout {
                duration_ms: timeout_ms,
            },
            BleTransportError::CharacteristicNotFound(uuid) => {
                TransportError::CharacteristicNotFound(uuid)
            }
            BleTransportError::DescriptorNotFound {
                characteristic,
                descriptor,
            } => TransportError::DescriptorNotFound {
                characteristic,
                descriptor,
            },
            BleTransportError::DeviceNotFound { .. }
            | BleTransportError::ConnectionFailed(_)
            | BleTransportError::ServiceDiscoveryFailed(_) => {
                TransportError::ConnectionFailed(err.to_string())
            }
            other => TransportError::Other(other.to_string()),
        }
    }
}
