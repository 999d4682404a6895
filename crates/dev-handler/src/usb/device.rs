//! rusb-backed [`UsbPort`]
//!
//! Wraps an opened `DeviceHandle` and remembers which interfaces it claimed
//! so that kernel drivers can be reattached when the port is dropped.

use super::port::{EndpointInfo, InterfaceInfo, UsbLink, UsbPort};
use rusb::{Context, Device, DeviceHandle, TransferType, UsageType};
use std::time::Duration;
use tracing::{debug, warn};

/// An opened lowcar device
pub struct RusbPort {
    device: Device<Context>,
    handle: DeviceHandle<Context>,
    /// Interfaces we detached a kernel driver from
    detached: Vec<u8>,
}

impl RusbPort {
    /// Open a device for relaying
    pub fn open(device: Device<Context>) -> Result<Self, rusb::Error> {
        let handle = device.open()?;
        debug!(
            "Opened device bus={} addr={}",
            device.bus_number(),
            device.address()
        );

        Ok(Self {
            device,
            handle,
            detached: Vec::new(),
        })
    }

    fn detach_kernel_driver(&mut self, interface: u8) {
        match self.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match self.handle.detach_kernel_driver(interface) {
                    Ok(()) => self.detached.push(interface),
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {}
            // NotSupported on platforms without kernel drivers
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }
    }
}

/// `bmAttributes` transfer type bits for an endpoint
fn endpoint_attributes(transfer_type: TransferType, usage_type: UsageType) -> u8 {
    let transfer = match transfer_type {
        TransferType::Control => 0x00,
        TransferType::Isochronous => 0x01,
        TransferType::Bulk => 0x02,
        TransferType::Interrupt => 0x03,
    };
    let usage = match usage_type {
        UsageType::Data => 0x00,
        UsageType::Feedback => 0x10,
        UsageType::FeedbackData => 0x20,
        UsageType::Reserved => 0x30,
    };
    transfer | usage
}

impl UsbLink for RusbPort {
    fn write_bulk(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.handle.write_bulk(endpoint, data, timeout)
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.handle.read_bulk(endpoint, buf, timeout)
    }

    fn is_present(&self) -> bool {
        // GET_CONFIGURATION round trip; fails with NoDevice once unplugged
        !matches!(
            self.handle.active_configuration(),
            Err(rusb::Error::NoDevice)
        )
    }
}

impl UsbPort for RusbPort {
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>, rusb::Error> {
        let config = self.device.active_config_descriptor()?;

        Ok(config
            .interfaces()
            .map(|interface| {
                let endpoints = interface
                    .descriptors()
                    .next()
                    .map(|alt| {
                        alt.endpoint_descriptors()
                            .map(|ep| {
                                EndpointInfo::new(
                                    ep.address(),
                                    endpoint_attributes(ep.transfer_type(), ep.usage_type()),
                                )
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                InterfaceInfo {
                    number: interface.number(),
                    endpoints,
                }
            })
            .collect())
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), rusb::Error> {
        self.detach_kernel_driver(interface);
        self.handle.claim_interface(interface)?;
        debug!("Claimed interface {}", interface);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), rusb::Error> {
        self.handle.release_interface(interface)?;
        debug!("Released interface {}", interface);
        Ok(())
    }
}

impl Drop for RusbPort {
    fn drop(&mut self) {
        // Restore kernel control of anything we took over
        for interface in self.detached.drain(..) {
            if let Err(e) = self.handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }
        debug!(
            "Closed device bus={} addr={}",
            self.device.bus_number(),
            self.device.address()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_attributes() {
        assert_eq!(endpoint_attributes(TransferType::Bulk, UsageType::Data), 0x02);
        assert_eq!(
            endpoint_attributes(TransferType::Interrupt, UsageType::Data),
            0x03
        );
        let bulk = EndpointInfo::new(0x81, endpoint_attributes(TransferType::Bulk, UsageType::Data));
        assert!(bulk.is_bulk() && bulk.is_in());
    }
}
