//! Transport Port Trait Definition
//!
//! The session engine never talks to a radio stack directly. Everything it
//! needs from the link is expressed by [`TransportPort`]; the BLE
//! implementation lives in the `gattlink-ble` crate and tests supply a
//! scripted mock.

use std::fmt;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::TransportResult;

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Link state of the single peripheral a session controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn state_name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

/// A value pushed by the peripheral on a characteristic with notifications enabled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicUpdate {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

/// Stream of link state reports
pub type ConnectionStateStream = BoxStream<'static, ConnectionState>;

/// Stream of notification values
pub type NotificationStream = BoxStream<'static, CharacteristicUpdate>;

// ----------------------------------------------------------------------------
// Transport Port Trait
// ----------------------------------------------------------------------------

/// Capabilities the session engine needs from the underlying radio link
///
/// A port serves exactly one session. Results of the async calls are the only
/// error surface; link state changes arrive separately through
/// [`connection_states`](TransportPort::connection_states), and the stack is
/// free to report the same state more than once.
#[async_trait]
pub trait TransportPort: Send + Sync + 'static {
    /// Establish a link to the peripheral at `address`
    async fn connect(&self, address: &str) -> TransportResult<()>;

    /// Tear the link down, best-effort
    async fn disconnect(&self);

    async fn read_characteristic(&self, uuid: Uuid) -> TransportResult<Vec<u8>>;

    async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> TransportResult<()>;

    async fn read_descriptor(&self, characteristic: Uuid, descriptor: Uuid)
        -> TransportResult<Vec<u8>>;

    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> TransportResult<()>;

    async fn enable_notifications(&self, characteristic: Uuid) -> TransportResult<()>;

    /// Ongoing stream of link state reports
    ///
    /// Called once per session, before the first connect.
    fn connection_states(&self) -> ConnectionStateStream;

    /// Values pushed by the peripheral after notifications were enabled
    fn notifications(&self) -> NotificationStream {
        stream::empty().boxed()
    }
}
