//! Session configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::profile::Profile;

// ----------------------------------------------------------------------------
// Target Identity
// ----------------------------------------------------------------------------

/// Service that hosts the command characteristic
pub const TARGET_SERVICE_UUID: Uuid = Uuid::from_u128(0xdea420e6_c951_4807_b874_5b5b8ed6769d);

/// Command characteristic the auto-read and write/verify protocol apply to
pub const TARGET_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x4568c4b2_e8a4_43dd_b903_b43b1892adf0);

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for a command session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Service hosting the command characteristic
    pub service_uuid: Uuid,
    /// Characteristic targeted by the auto-read and write/verify protocol
    pub characteristic_uuid: Uuid,
    /// Pause after a `Connected` report before the initial read
    pub settle_delay: Duration,
    /// Field layout of the command payload
    pub profile: Profile,
    /// Buffer size of the session event broadcast channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: TARGET_SERVICE_UUID,
            characteristic_uuid: TARGET_CHARACTERISTIC_UUID,
            settle_delay: Duration::from_millis(1000),
            profile: Profile::default(),
            event_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the command characteristic
    pub fn with_characteristic(mut self, uuid: Uuid) -> Self {
        self.characteristic_uuid = uuid;
        self
    }

    /// Set the service hosting the command characteristic
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_uuid = uuid;
        self
    }

    /// Set settle delay
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set payload profile
    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    /// Set event channel capacity
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
