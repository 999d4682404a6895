//! Receiver thread: device to host traffic

use super::RelayServices;
use super::context::RelayContext;
use crate::usb::{UsbLink, read_chunk};
use common::{DEVICE_LOG_TARGET, Requester, Stream};
use protocol::{DeviceDescriptor, FrameDecoder, Message, MessageKind, decode_param_values};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

pub struct Receiver<L: UsbLink + ?Sized> {
    ctx: Arc<RelayContext>,
    link: Arc<L>,
    device: Arc<DeviceDescriptor>,
    services: RelayServices,
    decoder: FrameDecoder,
}

impl<L: UsbLink + ?Sized> Receiver<L> {
    /// `decoder` carries over any bytes read after the handshake frame
    pub fn new(
        ctx: Arc<RelayContext>,
        link: Arc<L>,
        device: Arc<DeviceDescriptor>,
        services: RelayServices,
        decoder: FrameDecoder,
    ) -> Self {
        Self {
            ctx,
            link,
            device,
            services,
            decoder,
        }
    }

    /// Thread body
    pub fn run(mut self) {
        if !self.ctx.wait_for_start() {
            debug!("Receiver cancelled before start");
            return;
        }
        debug!("Receiver started");

        let Some(endpoints) = self.ctx.endpoints() else {
            warn!("Receiver started without endpoints");
            return;
        };

        while !self.ctx.is_cancelled() {
            self.drain_frames();

            if let Err(e) = read_chunk(
                &*self.link,
                endpoints.receive,
                &mut self.decoder,
                self.services.timing.transfer_timeout,
            ) {
                debug!("Bulk read failed: {}", e);
                if !self.ctx.pause(self.services.timing.idle_wait) {
                    break;
                }
            }
        }

        let metrics = self.decoder.metrics();
        debug!(
            "Receiver stopped: {} frames, {} checksum failures, {} malformed",
            metrics.frames_accepted, metrics.checksum_failures, metrics.malformed_frames
        );
    }

    fn drain_frames(&mut self) {
        while let Some(frame) = self.decoder.next_frame() {
            match frame {
                Ok(message) => self.dispatch(message),
                Err(e) => trace!("Dropped frame: {}", e),
            }
        }
    }

    fn dispatch(&self, message: Message) {
        match message.kind() {
            MessageKind::HeartbeatRequest => {
                self.ctx.flag_heartbeat_request(message.heartbeat_id());
            }
            MessageKind::HeartbeatResponse => {
                self.ctx.clear_heartbeat_outstanding();
            }
            MessageKind::DeviceData => self.store_device_data(&message),
            MessageKind::Log => {
                info!(
                    target: DEVICE_LOG_TARGET,
                    device = %self.device.name,
                    uid = self.ctx.identity().map(|id| id.uid).unwrap_or_default(),
                    "{}",
                    message.log_text()
                );
            }
            MessageKind::Error => {
                warn!(
                    target: DEVICE_LOG_TARGET,
                    device = %self.device.name,
                    uid = self.ctx.identity().map(|id| id.uid).unwrap_or_default(),
                    "device error {:#04x}",
                    message.error_code().unwrap_or_default()
                );
            }
            other => debug!("Ignoring unexpected {:?} from device", other),
        }
    }

    fn store_device_data(&self, message: &Message) {
        let Some(slot) = self.ctx.slot() else {
            return;
        };

        match decode_param_values(&self.device, message) {
            Ok((mask, values)) => {
                if let Err(e) =
                    self.services
                        .store
                        .write(slot, Requester::DevHandler, Stream::Data, mask, &values)
                {
                    warn!("Failed to store data for slot {}: {}", slot, e);
                }
            }
            Err(e) => debug!("Dropped DeviceData: {}", e),
        }
    }
}
