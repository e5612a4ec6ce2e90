//! Device session engine for a single BLE command characteristic
//!
//! This crate holds everything about talking to the device that does not
//! depend on a particular radio stack: the command codec, device profiles,
//! the connection state machine, and the write-then-verify session that
//! callers drive the device with.
//!
//! ## Architecture
//!
//! - [`codec`] - Comma separated payload encoding and operator hex input
//! - [`profile`] - Device variants as data: field names and valid ranges
//! - [`transport`] - The [`TransportPort`] trait a radio stack implements
//! - [`machine`] - Pure connection and retry state machine
//! - [`session`] - [`CommandSession`], the async facade around the machine
//! - [`config`] - Session configuration and the target identifiers
//! - [`snapshot`] - Published state and transient events
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gattlink_core::{CommandSession, DeviceIdentity, DevicePayload, SessionConfig, TransportPort};
//!
//! # async fn example(port: Arc<dyn TransportPort>) -> Result<(), Box<dyn std::error::Error>> {
//! let session = CommandSession::start(
//!     port,
//!     DeviceIdentity::new("LED strip", "AA:BB:CC:DD:EE:FF"),
//!     SessionConfig::default(),
//! );
//!
//! let mut events = session.subscribe_events();
//! session.write_command(DevicePayload::new(vec![50, 80, 255, 0, 128]))?;
//!
//! if let Ok(event) = events.recv().await {
//!     println!("{}", event);
//! }
//!
//! session.close().await;
//! # Ok(())
//! # }
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod codec;
pub mod config;
pub mod errors;
pub mod machine;
pub mod profile;
pub mod session;
pub mod snapshot;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use codec::{decode, encode, encode_hex, DescriptorValue};
pub use config::{SessionConfig, TARGET_CHARACTERISTIC_UUID, TARGET_SERVICE_UUID};
pub use errors::{CodecError, SessionError, TransitionError, TransportError, TransportResult};
pub use machine::{SessionMachine, VERIFY_SCHEDULE};
pub use profile::{DevicePayload, FieldSpec, Profile};
pub use session::CommandSession;
pub use snapshot::{DeviceIdentity, Operation, SessionEvent, SessionSnapshot};
pub use transport::{CharacteristicUpdate, ConnectionState, TransportPort};
