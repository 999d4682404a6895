//! USB port abstraction used by the relays
//!
//! A relay needs exclusive access to a device while it claims an interface
//! ([`UsbPort`]) and shared access once its sender and receiver threads are
//! running ([`UsbLink`]). Bulk transfers only need `&self`, so the claimed
//! port is wrapped in an `Arc` for the active phase.

use std::time::Duration;

/// Endpoint address bit for the IN (device to host) direction
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Transfer type bits of `bmAttributes`
pub const TRANSFER_TYPE_MASK: u8 = 0x03;

/// `bmAttributes` transfer type value for bulk endpoints
pub const TRANSFER_TYPE_BULK: u8 = 0x02;

/// Endpoint of an interface's first alternate setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    /// `bEndpointAddress`
    pub address: u8,
    /// `bmAttributes`
    pub attributes: u8,
}

impl EndpointInfo {
    pub fn new(address: u8, attributes: u8) -> Self {
        Self {
            address,
            attributes,
        }
    }

    pub fn is_bulk(&self) -> bool {
        self.attributes & TRANSFER_TYPE_MASK == TRANSFER_TYPE_BULK
    }

    pub fn is_in(&self) -> bool {
        self.address & ENDPOINT_DIR_IN != 0
    }
}

/// Interface number plus the endpoints of its first alternate setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub number: u8,
    pub endpoints: Vec<EndpointInfo>,
}

/// The claimed interface and its bulk endpoint pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndpoints {
    pub interface: u8,
    /// Bulk IN endpoint (device to host)
    pub receive: u8,
    /// Bulk OUT endpoint (host to device)
    pub send: u8,
}

/// Pick a bulk IN / bulk OUT pair from an interface's endpoints
///
/// Interfaces with fewer than two endpoints are rejected outright.
pub fn select_bulk_endpoints(interface: &InterfaceInfo) -> Option<BulkEndpoints> {
    if interface.endpoints.len() < 2 {
        return None;
    }

    let mut bulk = interface.endpoints.iter().filter(|ep| ep.is_bulk());
    let receive = bulk.clone().find(|ep| ep.is_in())?;
    let send = bulk.find(|ep| !ep.is_in())?;

    Some(BulkEndpoints {
        interface: interface.number,
        receive: receive.address,
        send: send.address,
    })
}

/// Transfers on an open device, shared by the sender and receiver threads
pub trait UsbLink: Send + Sync {
    /// Bulk OUT transfer; returns the number of bytes written
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration)
    -> Result<usize, rusb::Error>;

    /// Bulk IN transfer; returns the number of bytes read
    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    /// Whether the device still answers on the bus
    fn is_present(&self) -> bool;
}

/// An open device the relay owns exclusively during setup and teardown
pub trait UsbPort: UsbLink + Sized + 'static {
    /// Interfaces of the active configuration
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>, rusb::Error>;

    fn claim_interface(&mut self, interface: u8) -> Result<(), rusb::Error>;

    fn release_interface(&mut self, interface: u8) -> Result<(), rusb::Error>;
}
