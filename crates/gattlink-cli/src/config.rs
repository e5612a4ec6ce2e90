//! gattlink CLI Configuration Management
//!
//! Configuration is layered with figment, lowest priority first:
//! - Default values
//! - Configuration file (`gattlink.toml`, or the `--config` path)
//! - Environment variables (`GATTLINK_*`, nested keys separated by `__`,
//!   e.g. `GATTLINK_DEVICE__ADDRESS`)
//! - Command line arguments

use anyhow::Context;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use gattlink_ble::BleTransportConfig;
use gattlink_core::{DeviceIdentity, Profile, SessionConfig};

use crate::error::{CliError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "gattlink.toml";

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

/// The device a session is opened against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Display name; the radio stack does not need it
    pub name: String,
    pub address: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "device".to_string(),
            address: None,
        }
    }
}

/// Complete configuration for the gattlink CLI
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub session: SessionConfig,
    pub ble: BleTransportConfig,
}

/// Values given on the command line, applied over every other layer
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub address: Option<String>,
    pub name: Option<String>,
    pub profile: Option<String>,
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration with the standard priority order
    pub fn load(path: Option<&str>, overrides: &CliOverrides) -> Result<Self> {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.unwrap_or(DEFAULT_CONFIG_FILE)))
            .merge(Env::prefixed("GATTLINK_").split("__"));

        if let Some(address) = &overrides.address {
            figment = figment.merge(("device.address", address));
        }
        if let Some(name) = &overrides.name {
            figment = figment.merge(("device.name", name));
        }
        if let Some(name) = &overrides.profile {
            let profile = Profile::by_name(name)
                .ok_or_else(|| CliError::Config(format!("Unknown profile: {}", name)))?;
            figment = figment.merge(("session.profile", profile));
        }

        let config: AppConfig = figment
            .extract()
            .context("Failed to load configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.session.profile.fields.is_empty() {
            return Err(CliError::Config("Profile must have at least one field".into()));
        }

        if let Some(spec) = self.session.profile.fields.iter().find(|f| f.min > f.max) {
            return Err(CliError::Config(format!(
                "Field {} has an empty range {}..={}",
                spec.name, spec.min, spec.max
            )));
        }

        if self.ble.scan_timeout.is_zero() || self.ble.connection_timeout.is_zero() {
            return Err(CliError::Config("BLE timeouts must be greater than 0".into()));
        }

        Ok(())
    }

    /// Identity of the configured device; fails when no address is set
    pub fn identity(&self) -> Result<DeviceIdentity> {
        let address = self.device.address.as_deref().ok_or_else(|| {
            CliError::Config("No device address; pass --address or set device.address".into())
        })?;
        Ok(DeviceIdentity::new(self.device.name.clone(), address))
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
