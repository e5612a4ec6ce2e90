//! Device profiles and the payloads they describe
//!
//! A [`Profile`] is plain data: the ordered list of fields a device variant
//! exchanges and the inclusive range each field may take. Supporting a new
//! device variant means adding a profile, not new parsing code.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::CodecError;

// ----------------------------------------------------------------------------
// Field Specification
// ----------------------------------------------------------------------------

/// One named field with its inclusive valid range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub min: u32,
    pub max: u32,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, min: u32, max: u32) -> Self {
        Self {
            name: name.into(),
            min,
            max,
        }
    }

    pub fn contains(&self, value: u32) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

// ----------------------------------------------------------------------------
// Profile
// ----------------------------------------------------------------------------

/// Field arity and per-field ranges for one device variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl Profile {
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Five-field LED strip: speed, brightness, red, green, blue
    pub fn rgb_strip() -> Self {
        Self::new(
            "rgb-strip",
            vec![
                FieldSpec::new("speed", 0, 100),
                FieldSpec::new("brightness", 0, 100),
                FieldSpec::new("red", 0, 255),
                FieldSpec::new("green", 0, 255),
                FieldSpec::new("blue", 0, 255),
            ],
        )
    }

    /// Ten-field controller with two colour triples and an effect pattern
    pub fn dual_rgb() -> Self {
        Self::new(
            "dual-rgb",
            vec![
                FieldSpec::new("mode", 0, 2),
                FieldSpec::new("speed", 0, 100),
                FieldSpec::new("brightness", 0, 100),
                FieldSpec::new("red", 0, 255),
                FieldSpec::new("green", 0, 255),
                FieldSpec::new("blue", 0, 255),
                FieldSpec::new("red2", 0, 255),
                FieldSpec::new("green2", 0, 255),
                FieldSpec::new("blue2", 0, 255),
                FieldSpec::new("pattern", 0, 6),
            ],
        )
    }

    /// All built-in profiles
    pub fn builtin() -> Vec<Self> {
        vec![Self::rgb_strip(), Self::dual_rgb()]
    }

    /// Look up a built-in profile by name
    pub fn by_name(name: &str) -> Option<Self> {
        Self::builtin().into_iter().find(|p| p.name == name)
    }

    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    /// Check that a payload has this profile's arity and every field is in range
    pub fn validate(&self, payload: &DevicePayload) -> Result<(), CodecError> {
        if payload.len() != self.arity() {
            return Err(CodecError::FieldCountMismatch {
                expected: self.arity(),
                actual: payload.len(),
            });
        }

        for (index, (spec, value)) in self.fields.iter().zip(payload.fields()).enumerate() {
            if !spec.contains(*value) {
                return Err(CodecError::FieldOutOfRange {
                    index,
                    name: spec.name.clone(),
                    value: value.to_string(),
                    min: spec.min,
                    max: spec.max,
                });
            }
        }

        Ok(())
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::rgb_strip()
    }
}

// ----------------------------------------------------------------------------
// Device Payload
// ----------------------------------------------------------------------------

/// Ordered field values exchanged with the command characteristic
///
/// A payload on its own carries no ranges; it is well-formed only with respect
/// to a [`Profile`], see [`Profile::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevicePayload(Vec<u32>);

impl DevicePayload {
    pub fn new(fields: Vec<u32>) -> Self {
        Self(fields)
    }

    /// All-zero payload of the given arity, which the devices treat as "off"
    pub fn zeroed(arity: usize) -> Self {
        Self(vec![0; arity])
    }

    pub fn fields(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<u32> {
        self.0
    }
}

impl From<Vec<u32>> for DevicePayload {
    fn from(fields: Vec<u32>) -> Self {
        Self(fields)
    }
}

impl fmt::Display for DevicePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", value)?;
        }
        Ok(())
    }
}
