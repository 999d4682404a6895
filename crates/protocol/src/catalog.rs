//! Device parameter catalog
//!
//! The catalog maps a device type code to the device's parameter list. A
//! parameter's position in the list is its ordinal: bit `i` of every
//! parameter mask on the wire refers to `params[i]`.
//!
//! Codec functions never reach for a global table; callers pass a
//! [`DeviceCatalog`] so tests can supply their own devices.
//!
//! # Catalog file
//!
//! ```toml
//! [[device]]
//! type = 0
//! name = "LimitSwitch"
//! params = [
//!     { name = "switch0", type = "bool", read = true },
//!     { name = "switch1", type = "bool", read = true },
//! ]
//! ```

use crate::error::{ProtocolError, Result};
use crate::types::{MAX_PARAMS, ParamType, mask_indices};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Lookup service for device descriptions
pub trait DeviceCatalog: Send + Sync {
    /// Find the descriptor for a device type
    fn lookup(&self, device_type: u16) -> Option<&DeviceDescriptor>;

    /// Find the descriptor or fail with [`ProtocolError::UnknownDevice`]
    fn require(&self, device_type: u16) -> Result<&DeviceDescriptor> {
        self.lookup(device_type)
            .ok_or(ProtocolError::UnknownDevice(device_type))
    }
}

/// One parameter of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Device reports this parameter in DeviceData
    #[serde(default)]
    pub read: bool,
    /// Parameter may be written with DeviceWrite
    #[serde(default)]
    pub write: bool,
}

impl ParamDescriptor {
    pub fn new(name: &str, param_type: ParamType, read: bool, write: bool) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            read,
            write,
        }
    }
}

/// All parameters of one device type, in ordinal order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    #[serde(rename = "type")]
    pub device_type: u16,
    pub name: String,
    pub params: Vec<ParamDescriptor>,
}

impl DeviceDescriptor {
    /// Descriptor of parameter `index`
    pub fn param(&self, index: u8) -> Option<&ParamDescriptor> {
        self.params.get(index as usize)
    }

    /// Ordinal of the parameter called `name`
    pub fn index_of(&self, name: &str) -> Option<u8> {
        self.params
            .iter()
            .position(|p| p.name == name)
            .map(|i| i as u8)
    }

    /// Build a parameter mask from names
    ///
    /// `encode_params(["switch2", "switch1"])` on a limit switch gives `0b110`.
    pub fn encode_params<S: AsRef<str>>(&self, names: &[S]) -> Result<u32> {
        names.iter().try_fold(0u32, |mask, name| {
            let name = name.as_ref();
            let index = self
                .index_of(name)
                .ok_or_else(|| ProtocolError::UnknownParameter {
                    device_type: self.device_type,
                    name: name.to_string(),
                })?;
            Ok(mask | (1 << index))
        })
    }

    /// Names of the parameters selected by `mask`, in ordinal order
    ///
    /// Bits beyond the device's parameter count are ignored.
    pub fn decode_params(&self, mask: u32) -> Vec<&str> {
        mask_indices(mask)
            .filter_map(|index| self.param(index))
            .map(|p| p.name.as_str())
            .collect()
    }

    pub fn readable(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name && p.read)
    }

    pub fn writable(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name && p.write)
    }

    pub fn param_type(&self, name: &str) -> Option<ParamType> {
        self.params
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.param_type)
    }

    /// Payload size of a DeviceData message carrying every parameter
    pub fn data_payload_size(&self) -> usize {
        4 + self
            .params
            .iter()
            .map(|p| p.param_type.wire_size())
            .sum::<usize>()
    }

    /// Mask with a bit for every parameter the device declares
    pub fn full_mask(&self) -> u32 {
        match self.params.len() {
            0 => 0,
            n if n >= MAX_PARAMS => u32::MAX,
            n => (1u32 << n) - 1,
        }
    }

    /// Mask of the parameters a host may write
    pub fn writable_mask(&self) -> u32 {
        self.params
            .iter()
            .take(MAX_PARAMS)
            .enumerate()
            .filter(|(_, p)| p.write)
            .fold(0, |mask, (index, _)| mask | (1 << index))
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "device")]
    devices: Vec<DeviceDescriptor>,
}

/// Catalog backed by an in-memory table
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    devices: HashMap<u16, DeviceDescriptor>,
}

impl StaticCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog of the standard lowcar devices
    pub fn builtin() -> Self {
        use ParamType::{Bool, Float, Int};

        let ro = |name: &str, ty| ParamDescriptor::new(name, ty, true, false);
        let rw = |name: &str, ty| ParamDescriptor::new(name, ty, true, true);

        let mut catalog = Self::new();
        catalog.insert(DeviceDescriptor {
            device_type: 0,
            name: "LimitSwitch".into(),
            params: vec![ro("switch0", Bool), ro("switch1", Bool), ro("switch2", Bool)],
        });
        catalog.insert(DeviceDescriptor {
            device_type: 1,
            name: "LineFollower".into(),
            params: vec![ro("left", Float), ro("center", Float), ro("right", Float)],
        });
        catalog.insert(DeviceDescriptor {
            device_type: 2,
            name: "Potentiometer".into(),
            params: vec![ro("pot0", Float), ro("pot1", Float), ro("pot2", Float)],
        });
        catalog.insert(DeviceDescriptor {
            device_type: 3,
            name: "Encoder".into(),
            params: vec![ro("rotation", Int)],
        });
        catalog.insert(DeviceDescriptor {
            device_type: 4,
            name: "BatteryBuzzer".into(),
            params: vec![
                ro("is_unsafe", Bool),
                ro("calibrated", Bool),
                ro("v_cell1", Float),
                ro("v_cell2", Float),
                ro("v_cell3", Float),
                ro("v_batt", Float),
            ],
        });
        catalog.insert(DeviceDescriptor {
            device_type: 5,
            name: "TeamFlag".into(),
            params: vec![
                rw("mode", Bool),
                rw("blue", Bool),
                rw("yellow", Bool),
                rw("led1", Bool),
                rw("led2", Bool),
                rw("led3", Bool),
                rw("led4", Bool),
            ],
        });
        catalog.insert(DeviceDescriptor {
            device_type: 7,
            name: "ServoControl".into(),
            params: vec![rw("servo0", Float), rw("servo1", Float)],
        });
        catalog.insert(DeviceDescriptor {
            device_type: 12,
            name: "PolarBear".into(),
            params: vec![rw("duty_cycle", Float), ro("current", Float), rw("deadband", Float)],
        });
        catalog.insert(DeviceDescriptor {
            device_type: 13,
            name: "KoalaBear".into(),
            params: vec![
                rw("velocity_a", Float),
                rw("deadband_a", Float),
                rw("invert_a", Bool),
                rw("pid_enabled_a", Bool),
                rw("pid_kp_a", Float),
                rw("pid_ki_a", Float),
                rw("pid_kd_a", Float),
                ro("enc_a", Int),
                rw("velocity_b", Float),
                rw("deadband_b", Float),
                rw("invert_b", Bool),
                rw("pid_enabled_b", Bool),
                rw("pid_kp_b", Float),
                rw("pid_ki_b", Float),
                rw("pid_kd_b", Float),
                ro("enc_b", Int),
            ],
        });
        catalog
    }

    /// Parse a catalog from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: CatalogFile =
            toml::from_str(text).map_err(|e| ProtocolError::Catalog(e.to_string()))?;

        let mut catalog = Self::new();
        for device in file.devices {
            if device.params.len() > MAX_PARAMS {
                return Err(ProtocolError::Catalog(format!(
                    "device {} declares {} parameters (max {})",
                    device.name,
                    device.params.len(),
                    MAX_PARAMS
                )));
            }
            if catalog.devices.contains_key(&device.device_type) {
                return Err(ProtocolError::Catalog(format!(
                    "duplicate device type {}",
                    device.device_type
                )));
            }
            catalog.insert(device);
        }
        Ok(catalog)
    }

    /// Load a catalog file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::Catalog(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Add or replace a device description
    pub fn insert(&mut self, device: DeviceDescriptor) {
        self.devices.insert(device.device_type, device);
    }

    /// Type code for a device name
    pub fn device_type_of(&self, name: &str) -> Option<u16> {
        self.devices
            .values()
            .find(|d| d.name == name)
            .map(|d| d.device_type)
    }

    /// Device name for a type code
    pub fn device_name(&self, device_type: u16) -> Option<&str> {
        self.devices.get(&device_type).map(|d| d.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceCatalog for StaticCatalog {
    fn lookup(&self, device_type: u16) -> Option<&DeviceDescriptor> {
        self.devices.get(&device_type)
    }
}
