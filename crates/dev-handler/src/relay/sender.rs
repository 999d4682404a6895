//! Sender thread: host to device traffic
//!
//! Each cycle, in order:
//! 1. forward pending command writes from the store as a DeviceWrite,
//! 2. send a HeartbeatRequest when one is due and none is outstanding,
//! 3. answer a HeartbeatRequest flagged by the receiver.
//!
//! Transfer failures are logged and the loop carries on; the supervisor
//! decides when the device is gone.

use super::RelayServices;
use super::context::RelayContext;
use crate::usb::{UsbLink, send_message};
use common::{Requester, Stream};
use protocol::{DeviceDescriptor, Message, ParamValues};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Sender<L: UsbLink + ?Sized> {
    ctx: Arc<RelayContext>,
    link: Arc<L>,
    device: Arc<DeviceDescriptor>,
    services: RelayServices,
    heartbeat_id: u8,
}

impl<L: UsbLink + ?Sized> Sender<L> {
    pub fn new(
        ctx: Arc<RelayContext>,
        link: Arc<L>,
        device: Arc<DeviceDescriptor>,
        services: RelayServices,
    ) -> Self {
        Self {
            ctx,
            link,
            device,
            services,
            heartbeat_id: 0,
        }
    }

    /// Thread body
    pub fn run(mut self) {
        if !self.ctx.wait_for_start() {
            debug!("Sender cancelled before start");
            return;
        }
        debug!("Sender started");

        while !self.ctx.is_cancelled() {
            let mut busy = self.forward_pending_writes();

            if self.ctx.is_cancelled() {
                break;
            }
            if self.ctx.heartbeat_due(self.services.timing.heartbeat_interval) {
                self.send_heartbeat_request();
                busy = true;
            }

            if self.ctx.is_cancelled() {
                break;
            }
            if let Some(id) = self.ctx.take_heartbeat_request() {
                self.send(&Message::heartbeat_response(id));
                busy = true;
            }

            if !busy && !self.ctx.pause(self.services.timing.idle_wait) {
                break;
            }
        }
        debug!("Sender stopped");
    }

    /// Returns whether anything was sent
    fn forward_pending_writes(&self) -> bool {
        let Some(slot) = self.ctx.slot() else {
            return false;
        };
        let store = &self.services.store;

        let pending = store.pending_writes().for_slot(slot);
        if pending == 0 {
            return false;
        }

        let values = match store.read(slot, Requester::DevHandler, Stream::Command, pending) {
            Ok(values) => values,
            Err(e) => {
                warn!("Failed to read pending writes from slot {}: {}", slot, e);
                return false;
            }
        };

        let writable = self.device.writable_mask();
        if pending & !writable != 0 {
            debug!(
                "Dropping writes to read-only parameters of {}: {:#x}",
                self.device.name,
                pending & !writable
            );
        }
        let values: ParamValues = values
            .into_iter()
            .filter(|(index, _)| writable & (1 << index) != 0)
            .collect();
        if values.is_empty() {
            return false;
        }

        match Message::device_write(&self.device, &values) {
            Ok(message) => {
                self.send(&message);
                true
            }
            Err(e) => {
                warn!("Could not encode DeviceWrite for {}: {}", self.device.name, e);
                false
            }
        }
    }

    fn send_heartbeat_request(&mut self) {
        // Outstanding from here on, even if the transfer fails
        self.ctx.mark_heartbeat_sent();
        let message = Message::heartbeat_request(self.heartbeat_id);
        self.heartbeat_id = self.heartbeat_id.wrapping_add(1);
        self.send(&message);
    }

    fn send(&self, message: &Message) {
        let Some(endpoints) = self.ctx.endpoints() else {
            return;
        };
        if let Err(e) = send_message(
            &*self.link,
            endpoints.send,
            message,
            self.services.checksum,
            self.services.timing.transfer_timeout,
        ) {
            warn!("Failed to send {:?}: {}", message.kind(), e);
        }
    }
}
