//! Command codec
//!
//! The command characteristic carries UTF-8 text of comma separated decimal
//! fields, e.g. `50,80,255,0,128`. Descriptors take arbitrary bytes which the
//! operator supplies either as text or as a hex string.

use serde::{Deserialize, Serialize};

use crate::errors::CodecError;
use crate::profile::{DevicePayload, Profile};

const FIELD_DELIMITER: char = ',';

// ----------------------------------------------------------------------------
// Payload Encoding
// ----------------------------------------------------------------------------

/// Decode characteristic bytes into a payload that is well-formed for `profile`
///
/// Nothing is returned unless every field parses and lies in range.
pub fn decode(bytes: &[u8], profile: &Profile) -> Result<DevicePayload, CodecError> {
    let text = String::from_utf8_lossy(bytes);
    let parts: Vec<&str> = text.split(FIELD_DELIMITER).collect();

    if parts.len() != profile.arity() {
        return Err(CodecError::FieldCountMismatch {
            expected: profile.arity(),
            actual: parts.len(),
        });
    }

    let mut fields = Vec::with_capacity(parts.len());
    for (index, (spec, part)) in profile.fields.iter().zip(parts).enumerate() {
        let raw = part.trim();
        match parse_field(raw) {
            Some(value) if spec.contains(value) => fields.push(value),
            _ => {
                return Err(CodecError::FieldOutOfRange {
                    index,
                    name: spec.name.clone(),
                    value: raw.to_string(),
                    min: spec.min,
                    max: spec.max,
                })
            }
        }
    }

    Ok(DevicePayload::new(fields))
}

/// Plain decimal digits only; `str::parse` would also take a leading `+`
fn parse_field(raw: &str) -> Option<u32> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

/// Render a payload as comma separated decimals, no trailing delimiter
pub fn encode(payload: &DevicePayload) -> Vec<u8> {
    payload.to_string().into_bytes()
}

// ----------------------------------------------------------------------------
// Hex Input
// ----------------------------------------------------------------------------

/// Parse operator hex input such as `"02 00"` into bytes
///
/// Whitespace anywhere in the input is ignored.
pub fn encode_hex(text: &str) -> Result<Vec<u8>, CodecError> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();

    let length = cleaned.chars().count();
    if length % 2 != 0 {
        return Err(CodecError::OddLength { length });
    }

    if let Some((position, character)) = cleaned
        .chars()
        .enumerate()
        .find(|(_, c)| !c.is_ascii_hexdigit())
    {
        return Err(CodecError::InvalidHexDigit {
            character,
            position,
        });
    }

    hex::decode(&cleaned).map_err(|e| match e {
        hex::FromHexError::InvalidHexCharacter { c, index } => CodecError::InvalidHexDigit {
            character: c,
            position: index,
        },
        _ => CodecError::OddLength { length },
    })
}

// ----------------------------------------------------------------------------
// Descriptor Values
// ----------------------------------------------------------------------------

/// A descriptor value as entered by the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptorValue {
    /// Sent as its UTF-8 bytes
    Text(String),
    /// Parsed with [`encode_hex`]
    Hex(String),
}

impl DescriptorValue {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            DescriptorValue::Text(text) => Ok(text.as_bytes().to_vec()),
            DescriptorValue::Hex(text) => encode_hex(text),
        }
    }
}
