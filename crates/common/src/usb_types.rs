//! USB identity shared by discovery, the relays and the event bridge

use std::fmt;

/// Where a device is plugged in and what it claims to be
///
/// Two physically distinct boards of the same model on the same port
/// (unplug one, plug the other) share an identity; discovery counts
/// identities rather than assuming they are unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsbIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub device_address: u8,
}

impl UsbIdentity {
    pub fn new(vendor_id: u16, product_id: u16, bus_number: u8, device_address: u8) -> Self {
        Self {
            vendor_id,
            product_id,
            bus_number,
            device_address,
        }
    }

    /// Short `bus-address` label, used in thread names
    pub fn port_label(&self) -> String {
        format!("{}-{}", self.bus_number, self.device_address)
    }
}

impl fmt::Display for UsbIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:03}:{:03} {:04x}:{:04x}",
            self.bus_number, self.device_address, self.vendor_id, self.product_id
        )
    }
}
