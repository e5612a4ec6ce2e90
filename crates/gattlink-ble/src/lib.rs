//! Bluetooth Low Energy transport port for gattlink
//!
//! This crate provides [`BtleplugTransport`], an implementation of the
//! `TransportPort` trait from `gattlink-core` on top of btleplug.
//!
//! ## Architecture
//!
//! - [`config`] - Transport configuration and settings
//! - [`error`] - Error types specific to BLE transport
//! - [`transport`] - Adapter selection and the transport itself
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gattlink_ble::{BleTransportConfig, BtleplugTransport};
//! use gattlink_core::{CommandSession, DeviceIdentity, SessionConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = BtleplugTransport::new(BleTransportConfig::default()).await?;
//! let session = CommandSession::start(
//!     Arc::new(transport),
//!     DeviceIdentity::new("LED strip", "AA:BB:CC:DD:EE:FF"),
//!     SessionConfig::default(),
//! );
//! session.turn_off()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod transport;

// Public API exports
pub use config::BleTransportConfig;
pub use error::BleTransportError;
pub use transport::{get_adapter, BtleplugTransport};

// Re-export the port trait for convenience
pub use gattlink_core::TransportPort;
