//! Relay supervisor: the per-device connection state machine
//!
//! ```text
//! OPENING -> CLAIMING_INTERFACE -> DISCOVERING_ENDPOINTS -> HANDSHAKING -> ACTIVE -> TEARDOWN
//! ```
//!
//! Any failure before ACTIVE jumps straight to TEARDOWN. In ACTIVE the
//! supervisor watches two things: that the device is still on the bus, and
//! that no HeartbeatRequest has been outstanding for longer than the
//! heartbeat timeout.

use super::RelayServices;
use super::context::{RelayContext, RelayPhase};
use super::receiver::Receiver;
use super::sender::Sender;
use crate::usb::{
    BulkEndpoints, FrameWait, TransferError, UsbLink, UsbPort, select_bulk_endpoints,
    send_message, wait_for_frame,
};
use common::{RelayEvent, SlotIndex, StoreError, UsbIdentity};
use protocol::{
    DeviceDescriptor, DeviceIdentity, FrameDecoder, Message, MessageKind, ProtocolError,
    SubscriptionResponse,
};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Upper bound on the liveness polling period
const MONITOR_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to send Ping: {0}")]
    Ping(TransferError),

    #[error("read failed: {0}")]
    Read(rusb::Error),

    #[error("no SubscriptionResponse within {0:?}")]
    Timeout(Duration),

    #[error("corrupt response: {0}")]
    Corrupt(ProtocolError),

    #[error("expected SubscriptionResponse, got {0:?}")]
    WrongKind(MessageKind),

    #[error("malformed SubscriptionResponse: {0}")]
    Malformed(ProtocolError),

    #[error("unknown device type {0}")]
    UnknownDevice(u16),
}

/// Why a relay stopped
#[derive(Debug, Error)]
pub enum TeardownReason {
    #[error("could not open device: {0}")]
    OpenFailed(rusb::Error),

    #[error("could not read interfaces: {0}")]
    Descriptor(rusb::Error),

    #[error("no interface with a bulk IN/OUT endpoint pair")]
    NoUsableInterface,

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("parameter store rejected device: {0}")]
    StoreRejected(StoreError),

    #[error("could not spawn relay thread: {0}")]
    SpawnFailed(String),

    #[error("device disconnected")]
    Disconnected,

    #[error("no HeartbeatResponse for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("relay cancelled")]
    Cancelled,
}

/// Final report of a relay
#[derive(Debug)]
pub struct RelayExit {
    pub usb: UsbIdentity,
    pub identity: Option<DeviceIdentity>,
    pub reason: TeardownReason,
}

/// Drives one device from open to teardown
pub struct Supervisor {
    ctx: Arc<RelayContext>,
    services: RelayServices,
}

struct Workers {
    sender: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(ctx: Arc<RelayContext>, services: RelayServices) -> Self {
        Self { ctx, services }
    }

    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    /// Run the state machine to completion on the calling thread
    ///
    /// `open` performs the OPENING step, so an unopenable device is reported
    /// like every other failure.
    pub fn run<P, F>(self, open: F) -> RelayExit
    where
        P: UsbPort,
        F: FnOnce() -> Result<P, rusb::Error>,
    {
        let usb = self.ctx.usb();
        self.ctx.set_phase(RelayPhase::Opening);
        debug!("Opening {}", usb);

        let reason = match open() {
            Ok(port) => self.run_opened(port),
            Err(e) => TeardownReason::OpenFailed(e),
        };
        self.finish(reason)
    }

    fn run_opened<P: UsbPort>(&self, mut port: P) -> TeardownReason {
        let endpoints = match self.claim_bulk_interface(&mut port) {
            Ok(endpoints) => endpoints,
            Err(reason) => {
                self.ctx.set_phase(RelayPhase::Teardown);
                return reason;
            }
        };
        self.ctx.set_endpoints(endpoints);

        self.ctx.set_phase(RelayPhase::Handshaking);
        let (identity, device, decoder) = match self.handshake(&port, &endpoints) {
            Ok(result) => result,
            Err(e) => {
                self.ctx.set_phase(RelayPhase::Teardown);
                release(&mut port, endpoints.interface);
                return e.into();
            }
        };
        self.ctx.set_identity(identity);

        let slot = match self.services.store.connect(identity) {
            Ok(slot) => slot,
            Err(e) => {
                self.ctx.set_phase(RelayPhase::Teardown);
                release(&mut port, endpoints.interface);
                return TeardownReason::StoreRejected(e);
            }
        };
        self.ctx.set_slot(slot);

        let port = Arc::new(port);
        let mut workers = Workers {
            sender: None,
            receiver: None,
        };
        let reason = match self.spawn_workers(&port, device, decoder, &mut workers) {
            Ok(()) => {
                self.ctx.set_phase(RelayPhase::Active);
                self.ctx.start();
                info!(
                    "{} active: {} in slot {}",
                    self.ctx.usb(),
                    identity,
                    slot
                );
                self.services.events.emit(RelayEvent::RelayActive {
                    usb: self.ctx.usb(),
                    device: identity,
                    slot,
                });
                self.monitor(&*port)
            }
            Err(reason) => reason,
        };

        self.ctx.set_phase(RelayPhase::Teardown);
        self.ctx.cancel();
        join_worker("sender", workers.sender.take());
        join_worker("receiver", workers.receiver.take());

        if self.ctx.is_started() && !matches!(reason, TeardownReason::Disconnected) {
            self.send_disable(&*port, &endpoints);
        }

        match Arc::try_unwrap(port) {
            Ok(mut port) => release(&mut port, endpoints.interface),
            Err(_) => warn!("Port still shared at teardown, interface left claimed"),
        }
        self.disconnect_store(slot);
        reason
    }

    /// CLAIMING_INTERFACE and DISCOVERING_ENDPOINTS
    ///
    /// Interfaces are tried in order; one is kept only if its first alternate
    /// setting has a bulk IN and a bulk OUT endpoint.
    fn claim_bulk_interface<P: UsbPort>(
        &self,
        port: &mut P,
    ) -> Result<BulkEndpoints, TeardownReason> {
        self.ctx.set_phase(RelayPhase::ClaimingInterface);
        let interfaces = port.interfaces().map_err(TeardownReason::Descriptor)?;

        for interface in &interfaces {
            self.ctx.set_phase(RelayPhase::ClaimingInterface);
            if let Err(e) = port.claim_interface(interface.number) {
                debug!("Could not claim interface {}: {}", interface.number, e);
                continue;
            }

            self.ctx.set_phase(RelayPhase::DiscoveringEndpoints);
            match select_bulk_endpoints(interface) {
                Some(endpoints) => {
                    debug!(
                        "Using interface {} (in {:#04x}, out {:#04x})",
                        endpoints.interface, endpoints.receive, endpoints.send
                    );
                    return Ok(endpoints);
                }
                None => {
                    debug!("Interface {} has no bulk pair", interface.number);
                    release(port, interface.number);
                }
            }
        }

        Err(TeardownReason::NoUsableInterface)
    }

    /// HANDSHAKING: Ping, then expect a SubscriptionResponse
    ///
    /// Returns the reported identity, the device's catalog entry and the
    /// decoder, which may already hold bytes that followed the response.
    fn handshake<L: UsbLink>(
        &self,
        link: &L,
        endpoints: &BulkEndpoints,
    ) -> Result<(DeviceIdentity, Arc<DeviceDescriptor>, FrameDecoder), HandshakeError> {
        let timing = &self.services.timing;
        send_message(
            link,
            endpoints.send,
            &Message::ping(),
            self.services.checksum,
            timing.transfer_timeout,
        )
        .map_err(HandshakeError::Ping)?;

        let mut decoder = FrameDecoder::new(self.services.checksum);
        let deadline = Instant::now() + timing.handshake_timeout;
        let message = match wait_for_frame(
            link,
            endpoints.receive,
            &mut decoder,
            deadline,
            timing.transfer_timeout,
        )
        .map_err(HandshakeError::Read)?
        {
            FrameWait::Message(message) => message,
            FrameWait::Corrupt(e) => return Err(HandshakeError::Corrupt(e)),
            FrameWait::Expired => return Err(HandshakeError::Timeout(timing.handshake_timeout)),
        };

        if message.kind() != MessageKind::SubscriptionResponse {
            return Err(HandshakeError::WrongKind(message.kind()));
        }
        let response = SubscriptionResponse::parse(&message).map_err(HandshakeError::Malformed)?;
        let identity = response.identity;

        let device = self
            .services
            .catalog
            .lookup(identity.device_type)
            .cloned()
            .ok_or(HandshakeError::UnknownDevice(identity.device_type))?;

        debug!("Handshake complete: {} ({})", identity, device.name);
        Ok((identity, Arc::new(device), decoder))
    }

    fn spawn_workers<P: UsbPort>(
        &self,
        port: &Arc<P>,
        device: Arc<DeviceDescriptor>,
        decoder: FrameDecoder,
        workers: &mut Workers,
    ) -> Result<(), TeardownReason> {
        let label = self.ctx.usb().port_label();

        let sender = Sender::new(
            Arc::clone(&self.ctx),
            Arc::clone(port),
            Arc::clone(&device),
            self.services.clone(),
        );
        workers.sender = Some(
            thread::Builder::new()
                .name(format!("sender-{}", label))
                .spawn(move || sender.run())
                .map_err(|e| TeardownReason::SpawnFailed(e.to_string()))?,
        );

        let receiver = Receiver::new(
            Arc::clone(&self.ctx),
            Arc::clone(port),
            device,
            self.services.clone(),
            decoder,
        );
        workers.receiver = Some(
            thread::Builder::new()
                .name(format!("receiver-{}", label))
                .spawn(move || receiver.run())
                .map_err(|e| TeardownReason::SpawnFailed(e.to_string()))?,
        );

        Ok(())
    }

    /// ACTIVE: block until the device is gone, silent, or the relay is cancelled
    fn monitor<L: UsbLink + ?Sized>(&self, link: &L) -> TeardownReason {
        let timeout = self.services.timing.heartbeat_timeout;
        let period = MONITOR_PERIOD.min(timeout / 4);

        loop {
            if self.ctx.is_cancelled() {
                return TeardownReason::Cancelled;
            }
            if !link.is_present() {
                return TeardownReason::Disconnected;
            }
            if let Some(age) = self.ctx.heartbeat_outstanding_for() {
                if age >= timeout {
                    return TeardownReason::HeartbeatTimeout(age);
                }
            }
            if !self.ctx.pause(period) {
                return TeardownReason::Cancelled;
            }
        }
    }

    fn send_disable<L: UsbLink + ?Sized>(&self, link: &L, endpoints: &BulkEndpoints) {
        if let Err(e) = send_message(
            link,
            endpoints.send,
            &Message::disable(),
            self.services.checksum,
            self.services.timing.transfer_timeout,
        ) {
            debug!("Could not send Disable: {}", e);
        }
    }

    fn disconnect_store(&self, slot: SlotIndex) {
        if let Err(e) = self.services.store.disconnect(slot) {
            warn!("Failed to release store slot {}: {}", slot, e);
        }
    }

    fn finish(&self, reason: TeardownReason) -> RelayExit {
        self.ctx.set_phase(RelayPhase::Stopped);
        let usb = self.ctx.usb();
        let identity = self.ctx.identity();

        match &reason {
            TeardownReason::Disconnected | TeardownReason::Cancelled => {
                info!("{} stopped: {}", usb, reason)
            }
            TeardownReason::OpenFailed(_) | TeardownReason::NoUsableInterface => {
                debug!("{} not relayed: {}", usb, reason)
            }
            TeardownReason::SpawnFailed(_) => error!("{} stopped: {}", usb, reason),
            _ => warn!("{} stopped: {}", usb, reason),
        }

        self.services.events.emit(RelayEvent::RelayStopped {
            usb,
            device: identity,
            reason: reason.to_string(),
        });

        RelayExit {
            usb,
            identity,
            reason,
        }
    }
}

fn release<P: UsbPort>(port: &mut P, interface: u8) {
    if let Err(e) = port.release_interface(interface) {
        debug!("Failed to release interface {}: {}", interface, e);
    }
}

fn join_worker(name: &str, handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            error!("{} thread panicked", name);
        }
    }
}
