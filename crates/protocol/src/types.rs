//! Lowcar device and parameter types
//!
//! These are the values that flow between the wire codec, the parameter
//! catalog and the parameter store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum number of parameters a device may expose (one bit each in a u32 mask)
pub const MAX_PARAMS: usize = 32;

/// Identity reported by a device in its SubscriptionResponse
///
/// `type` selects the catalog entry, `year` is the hardware revision year and
/// `uid` is the random id flashed onto the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Device type code (catalog key)
    pub device_type: u16,
    /// Year of manufacture / revision
    pub year: u8,
    /// Unique id
    pub uid: u64,
}

impl DeviceIdentity {
    /// Size of the identity block inside a SubscriptionResponse payload
    pub const ENCODED_LEN: usize = 11;

    pub fn new(device_type: u16, year: u8, uid: u64) -> Self {
        Self {
            device_type,
            year,
            uid,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type={} year={} uid={:#018x}",
            self.device_type, self.year, self.uid
        )
    }
}

/// Declared type of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Int,
    Float,
    Bool,
}

impl ParamType {
    /// Encoded size in a DeviceWrite / DeviceData payload
    pub fn wire_size(self) -> usize {
        match self {
            ParamType::Int | ParamType::Float => 4,
            ParamType::Bool => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Bool => "bool",
        }
    }
}

/// A single parameter value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Int(i32),
    Float(f32),
    Bool(bool),
}

impl ParamValue {
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::Int(_) => ParamType::Int,
            ParamValue::Float(_) => ParamType::Float,
            ParamValue::Bool(_) => ParamType::Bool,
        }
    }
}

/// Parameter values keyed by parameter index (ordinal in the catalog)
pub type ParamValues = BTreeMap<u8, ParamValue>;

/// Bit mask with bit `i` set for every parameter index present in `values`
pub fn mask_of(values: &ParamValues) -> u32 {
    values
        .keys()
        .filter(|&&index| (index as usize) < MAX_PARAMS)
        .fold(0u32, |mask, &index| mask | (1 << index))
}

/// Iterate the set bit indices of a parameter mask in ascending order
pub fn mask_indices(mask: u32) -> impl Iterator<Item = u8> {
    (0..MAX_PARAMS as u8).filter(move |index| mask & (1 << index) != 0)
}
