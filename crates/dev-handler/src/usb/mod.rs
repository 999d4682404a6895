//! USB subsystem
//!
//! - [`port`]: the port traits the relays are written against
//! - [`device`]: the libusb implementation of those traits
//! - [`transfers`]: framed message transfers over bulk endpoints
//! - [`discovery`]: the polling loop that starts relays for new devices

pub mod device;
pub mod discovery;
pub mod port;
pub mod transfers;

pub use device::RusbPort;
pub use discovery::{
    DeviceSource, DiscoveryDiff, DiscoveryPoller, DiscoveryTracker, RusbSource, diff_identities,
    list_devices, spawn_discovery,
};
pub use port::{BulkEndpoints, EndpointInfo, InterfaceInfo, UsbLink, UsbPort, select_bulk_endpoints};
pub use transfers::{FrameWait, TransferError, read_chunk, send_message, wait_for_frame};
