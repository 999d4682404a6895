//! Test utilities for the device handler
//!
//! [`MockDevice`] stands in for a lowcar board on the bus: tests push bytes
//! the device "sends", inspect the frames the host wrote, and can have the
//! mock answer Pings and HeartbeatRequests on its own. [`MockBus`] feeds
//! mock devices to the discovery poller.

use crate::config::RelayTiming;
use crate::relay::RelayServices;
use crate::usb::{DeviceSource, EndpointInfo, InterfaceInfo, UsbLink, UsbPort};
use common::test_utils::create_subscription_response;
use common::{EventSink, MemoryStore, UsbIdentity};
use protocol::{
    ChecksumMode, DeviceIdentity, Message, MessageKind, StaticCatalog, SubscriptionResponse,
    decode_frame, encode_frame,
};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Timing short enough for tests, with a heartbeat timeout well above the
/// interval so a responsive mock never trips it
pub fn fast_timing() -> RelayTiming {
    RelayTiming {
        transfer_timeout: Duration::from_millis(20),
        handshake_timeout: Duration::from_millis(200),
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(400),
        idle_wait: Duration::from_millis(5),
    }
}

/// Relay services over `store`, the builtin catalog and [`fast_timing`]
pub fn test_services(store: Arc<MemoryStore>, events: EventSink) -> RelayServices {
    RelayServices {
        catalog: Arc::new(StaticCatalog::builtin()),
        store,
        events,
        timing: fast_timing(),
        checksum: ChecksumMode::Xor,
    }
}

#[derive(Default)]
struct MockInner {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    unplugged: bool,
    claimed: Vec<u8>,
    released: Vec<u8>,
    ping_reply: Option<Vec<u8>>,
    answer_heartbeats: bool,
    fail_writes: bool,
    checksum: ChecksumMode,
}

impl MockInner {
    /// React to a frame the host wrote, like firmware would
    fn respond(&mut self, frame: &[u8]) {
        let Ok(message) = decode_frame(frame, self.checksum) else {
            return;
        };
        match message.kind() {
            MessageKind::Ping => {
                if let Some(reply) = self.ping_reply.clone() {
                    self.inbound.push_back(reply);
                }
            }
            MessageKind::HeartbeatRequest if self.answer_heartbeats => {
                let response = Message::heartbeat_response(message.heartbeat_id());
                if let Ok(reply) = encode_frame(&response, self.checksum) {
                    self.inbound.push_back(reply);
                }
            }
            _ => {}
        }
    }
}

struct MockState {
    interfaces: Vec<InterfaceInfo>,
    inner: Mutex<MockInner>,
    readable: Condvar,
}

/// Handle to a simulated lowcar board
///
/// Clones share the same device.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<MockState>,
}

impl MockDevice {
    /// Bulk OUT endpoint of [`MockDevice::lowcar`]
    pub const SEND_ENDPOINT: u8 = 0x02;
    /// Bulk IN endpoint of [`MockDevice::lowcar`]
    pub const RECEIVE_ENDPOINT: u8 = 0x83;

    pub fn new(interfaces: Vec<InterfaceInfo>) -> Self {
        Self {
            state: Arc::new(MockState {
                interfaces,
                inner: Mutex::new(MockInner::default()),
                readable: Condvar::new(),
            }),
        }
    }

    /// CDC-style layout: a control interface with one interrupt endpoint,
    /// then a data interface with the bulk pair
    pub fn lowcar() -> Self {
        Self::new(vec![
            InterfaceInfo {
                number: 0,
                endpoints: vec![EndpointInfo::new(0x81, 0x03)],
            },
            InterfaceInfo {
                number: 1,
                endpoints: vec![
                    EndpointInfo::new(Self::SEND_ENDPOINT, 0x02),
                    EndpointInfo::new(Self::RECEIVE_ENDPOINT, 0x02),
                ],
            },
        ])
    }

    /// A lowcar board that completes the handshake as `identity`
    pub fn responsive(identity: DeviceIdentity) -> Self {
        let device = Self::lowcar();
        device.respond_to_ping(&create_subscription_response(identity));
        device.answer_heartbeats(true);
        device
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.state.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn port(&self) -> MockPort {
        MockPort {
            state: Arc::clone(&self.state),
        }
    }

    pub fn set_checksum(&self, mode: ChecksumMode) {
        self.lock().checksum = mode;
    }

    /// Queue one bulk IN transfer worth of bytes
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.lock().inbound.push_back(bytes.to_vec());
        self.state.readable.notify_all();
    }

    /// Queue a framed message
    pub fn push_message(&self, message: &Message) {
        let mode = self.lock().checksum;
        if let Ok(frame) = encode_frame(message, mode) {
            self.push_bytes(&frame);
        }
    }

    /// Reply to every Ping with these raw bytes
    pub fn reply_to_ping(&self, bytes: Vec<u8>) {
        self.lock().ping_reply = Some(bytes);
    }

    /// Reply to every Ping with a framed SubscriptionResponse
    pub fn respond_to_ping(&self, response: &SubscriptionResponse) {
        let mode = self.lock().checksum;
        if let Ok(frame) = encode_frame(&Message::subscription_response(response), mode) {
            self.reply_to_ping(frame);
        }
    }

    pub fn answer_heartbeats(&self, enabled: bool) {
        self.lock().answer_heartbeats = enabled;
    }

    /// Make every bulk OUT transfer fail with an I/O error
    pub fn fail_writes(&self, enabled: bool) {
        self.lock().fail_writes = enabled;
    }

    /// Raw frames written by the host, one per transfer
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// Written frames that decode, in order
    pub fn sent_messages(&self) -> Vec<Message> {
        let inner = self.lock();
        inner
            .written
            .iter()
            .filter_map(|frame| decode_frame(frame, inner.checksum).ok())
            .collect()
    }

    pub fn sent_kinds(&self) -> Vec<MessageKind> {
        self.sent_messages().iter().map(Message::kind).collect()
    }

    pub fn unplug(&self) {
        self.lock().unplugged = true;
        self.state.readable.notify_all();
    }

    pub fn is_plugged(&self) -> bool {
        !self.lock().unplugged
    }

    /// Interfaces claimed so far, in order
    pub fn claimed(&self) -> Vec<u8> {
        self.lock().claimed.clone()
    }

    /// Interfaces released so far, in order
    pub fn released(&self) -> Vec<u8> {
        self.lock().released.clone()
    }
}

/// Open port on a [`MockDevice`]
pub struct MockPort {
    state: Arc<MockState>,
}

impl MockPort {
    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.state.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UsbLink for MockPort {
    fn write_bulk(
        &self,
        _endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        let mut inner = self.lock();
        if inner.unplugged {
            return Err(rusb::Error::NoDevice);
        }
        if inner.fail_writes {
            return Err(rusb::Error::Io);
        }

        inner.written.push(data.to_vec());
        inner.respond(data);
        drop(inner);
        self.state.readable.notify_all();
        Ok(data.len())
    }

    fn read_bulk(
        &self,
        _endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();

        loop {
            if inner.unplugged {
                return Err(rusb::Error::NoDevice);
            }
            if let Some(mut chunk) = inner.inbound.pop_front() {
                let len = chunk.len().min(buf.len());
                buf[..len].copy_from_slice(&chunk[..len]);
                if len < chunk.len() {
                    inner.inbound.push_front(chunk.split_off(len));
                }
                return Ok(len);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(rusb::Error::Timeout);
            }
            inner = self
                .state
                .readable
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn is_present(&self) -> bool {
        !self.lock().unplugged
    }
}

impl UsbPort for MockPort {
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>, rusb::Error> {
        if self.lock().unplugged {
            return Err(rusb::Error::NoDevice);
        }
        Ok(self.state.interfaces.clone())
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), rusb::Error> {
        let mut inner = self.lock();
        if inner.unplugged {
            return Err(rusb::Error::NoDevice);
        }
        if !self.state.interfaces.iter().any(|i| i.number == interface) {
            return Err(rusb::Error::NotFound);
        }
        inner.claimed.push(interface);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), rusb::Error> {
        self.lock().released.push(interface);
        Ok(())
    }
}

/// Simulated bus for the discovery poller
#[derive(Clone, Default)]
pub struct MockBus {
    devices: Arc<Mutex<Vec<(UsbIdentity, MockDevice)>>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(UsbIdentity, MockDevice)>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attach(&self, usb: UsbIdentity, device: MockDevice) {
        self.lock().push((usb, device));
    }

    /// Remove a device from the bus and unplug it
    pub fn detach(&self, usb: UsbIdentity) -> Option<MockDevice> {
        let mut devices = self.lock();
        let pos = devices.iter().position(|(id, _)| *id == usb)?;
        let (_, device) = devices.remove(pos);
        device.unplug();
        Some(device)
    }
}

impl DeviceSource for MockBus {
    type Device = MockDevice;
    type Port = MockPort;

    fn enumerate(&self) -> Result<Vec<(UsbIdentity, Self::Device)>, rusb::Error> {
        Ok(self.lock().clone())
    }

    fn open(device: Self::Device) -> Result<Self::Port, rusb::Error> {
        if device.is_plugged() {
            Ok(device.port())
        } else {
            Err(rusb::Error::NoDevice)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_splits_large_chunk() {
        let device = MockDevice::lowcar();
        let port = device.port();
        device.push_bytes(&[1, 2, 3, 4, 5]);

        let mut buf = [0u8; 3];
        assert_eq!(port.read_bulk(0x83, &mut buf, Duration::from_millis(10)), Ok(3));
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(port.read_bulk(0x83, &mut buf, Duration::from_millis(10)), Ok(2));
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(
            port.read_bulk(0x83, &mut buf, Duration::from_millis(10)),
            Err(rusb::Error::Timeout)
        );
    }

    #[test]
    fn test_answers_ping() {
        let identity = DeviceIdentity::new(12, 20, 7);
        let device = MockDevice::responsive(identity);
        let port = device.port();
        let ping = encode_frame(&Message::ping(), ChecksumMode::Xor).unwrap();
        port.write_bulk(0x02, &ping, Duration::from_millis(10)).unwrap();

        let mut buf = [0u8; 64];
        let len = port.read_bulk(0x83, &mut buf, Duration::from_millis(10)).unwrap();
        let reply = decode_frame(&buf[..len], ChecksumMode::Xor).unwrap();
        assert_eq!(SubscriptionResponse::parse(&reply).unwrap().identity, identity);
    }

    #[test]
    fn test_unknown_interface_not_claimed() {
        let device = MockDevice::lowcar();
        let mut port = device.port();
        assert_eq!(port.claim_interface(5), Err(rusb::Error::NotFound));
        assert!(port.claim_interface(1).is_ok());
        assert_eq!(device.claimed(), vec![1]);
    }
}
