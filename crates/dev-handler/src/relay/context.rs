//! State shared by a device's supervisor, sender and receiver threads
//!
//! Flags are atomics; the start/cancel gate is a mutex + condvar so that
//! waiting threads sleep instead of spinning. Write-once values (endpoints,
//! identity, slot) are `OnceLock`s populated by the supervisor before it
//! opens the gate.

use crate::usb::BulkEndpoints;
use common::{SlotIndex, UsbIdentity};
use protocol::DeviceIdentity;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

/// Supervisor state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayPhase {
    Opening = 0,
    ClaimingInterface = 1,
    DiscoveringEndpoints = 2,
    Handshaking = 3,
    Active = 4,
    Teardown = 5,
    Stopped = 6,
}

impl RelayPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RelayPhase::Opening,
            1 => RelayPhase::ClaimingInterface,
            2 => RelayPhase::DiscoveringEndpoints,
            3 => RelayPhase::Handshaking,
            4 => RelayPhase::Active,
            5 => RelayPhase::Teardown,
            _ => RelayPhase::Stopped,
        }
    }
}

impl fmt::Display for RelayPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayPhase::Opening => "OPENING",
            RelayPhase::ClaimingInterface => "CLAIMING_INTERFACE",
            RelayPhase::DiscoveringEndpoints => "DISCOVERING_ENDPOINTS",
            RelayPhase::Handshaking => "HANDSHAKING",
            RelayPhase::Active => "ACTIVE",
            RelayPhase::Teardown => "TEARDOWN",
            RelayPhase::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct Gate {
    started: bool,
    cancelled: bool,
}

/// Per-device relay state
#[derive(Debug)]
pub struct RelayContext {
    usb: UsbIdentity,
    epoch: Instant,
    phase: AtomicU8,
    gate: Mutex<Gate>,
    gate_changed: Condvar,
    cancelled: AtomicBool,
    endpoints: OnceLock<BulkEndpoints>,
    identity: OnceLock<DeviceIdentity>,
    slot: OnceLock<SlotIndex>,
    /// Millis (see [`RelayContext::now_millis`]) of the outstanding
    /// HeartbeatRequest, 0 when none is outstanding
    heartbeat_outstanding: AtomicU64,
    /// Millis of the last HeartbeatRequest sent, 0 before the first
    heartbeat_last_sent: AtomicU64,
    heartbeat_requested: AtomicBool,
    heartbeat_request_id: AtomicU8,
}

impl RelayContext {
    pub fn new(usb: UsbIdentity) -> Self {
        Self {
            usb,
            epoch: Instant::now(),
            phase: AtomicU8::new(RelayPhase::Opening as u8),
            gate: Mutex::new(Gate::default()),
            gate_changed: Condvar::new(),
            cancelled: AtomicBool::new(false),
            endpoints: OnceLock::new(),
            identity: OnceLock::new(),
            slot: OnceLock::new(),
            heartbeat_outstanding: AtomicU64::new(0),
            heartbeat_last_sent: AtomicU64::new(0),
            heartbeat_requested: AtomicBool::new(false),
            heartbeat_request_id: AtomicU8::new(0),
        }
    }

    pub fn usb(&self) -> UsbIdentity {
        self.usb
    }

    pub fn phase(&self) -> RelayPhase {
        RelayPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: RelayPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn endpoints(&self) -> Option<BulkEndpoints> {
        self.endpoints.get().copied()
    }

    pub(crate) fn set_endpoints(&self, endpoints: BulkEndpoints) {
        if self.endpoints.set(endpoints).is_err() {
            warn!("Endpoints already set for {}, keeping the first value", self.usb);
        }
    }

    /// Identity reported in the handshake
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity.get().copied()
    }

    pub(crate) fn set_identity(&self, identity: DeviceIdentity) {
        if self.identity.set(identity).is_err() {
            warn!("Identity already set for {}, keeping the first value", self.usb);
        }
    }

    /// Store slot, once the store accepted the device
    pub fn slot(&self) -> Option<SlotIndex> {
        self.slot.get().copied()
    }

    pub(crate) fn set_slot(&self, slot: SlotIndex) {
        if self.slot.set(slot).is_err() {
            warn!("Slot already set for {}, keeping the first value", self.usb);
        }
    }

    fn lock_gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release the sender and receiver
    pub(crate) fn start(&self) {
        self.lock_gate().started = true;
        self.gate_changed.notify_all();
    }

    pub fn is_started(&self) -> bool {
        self.lock_gate().started
    }

    /// Ask every thread of this relay to stop
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.lock_gate().cancelled = true;
        self.gate_changed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Block until the relay is started or cancelled
    ///
    /// Returns `true` when work may begin.
    pub fn wait_for_start(&self) -> bool {
        let gate = self.lock_gate();
        let gate = self
            .gate_changed
            .wait_while(gate, |g| !g.started && !g.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        gate.started && !gate.cancelled
    }

    /// Sleep for `duration` unless cancelled first
    ///
    /// Returns `false` if the relay was cancelled.
    pub fn pause(&self, duration: Duration) -> bool {
        let gate = self.lock_gate();
        let (gate, _) = self
            .gate_changed
            .wait_timeout_while(gate, duration, |g| !g.cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        !gate.cancelled
    }

    /// Milliseconds since the context was created, offset by one so that 0
    /// can mean "never"
    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    /// Whether a HeartbeatRequest should be sent now
    ///
    /// True when none is outstanding and `interval` has passed since the
    /// previous one (or none was ever sent).
    pub fn heartbeat_due(&self, interval: Duration) -> bool {
        if self.heartbeat_outstanding.load(Ordering::Acquire) != 0 {
            return false;
        }
        let last = self.heartbeat_last_sent.load(Ordering::Acquire);
        last == 0 || self.now_millis().saturating_sub(last) >= interval.as_millis() as u64
    }

    /// Record that a HeartbeatRequest is being sent
    pub fn mark_heartbeat_sent(&self) {
        let now = self.now_millis();
        self.heartbeat_last_sent.store(now, Ordering::Release);
        self.heartbeat_outstanding.store(now, Ordering::Release);
    }

    /// A HeartbeatResponse arrived
    pub fn clear_heartbeat_outstanding(&self) {
        self.heartbeat_outstanding.store(0, Ordering::Release);
    }

    /// Age of the outstanding HeartbeatRequest, if any
    pub fn heartbeat_outstanding_for(&self) -> Option<Duration> {
        match self.heartbeat_outstanding.load(Ordering::Acquire) {
            0 => None,
            sent => Some(Duration::from_millis(
                self.now_millis().saturating_sub(sent),
            )),
        }
    }

    /// The device sent a HeartbeatRequest that needs answering
    pub fn flag_heartbeat_request(&self, heartbeat_id: u8) {
        self.heartbeat_request_id
            .store(heartbeat_id, Ordering::Release);
        self.heartbeat_requested.store(true, Ordering::Release);
    }

    /// Take the pending HeartbeatRequest, returning its id
    pub fn take_heartbeat_request(&self) -> Option<u8> {
        self.heartbeat_requested
            .swap(false, Ordering::AcqRel)
            .then(|| self.heartbeat_request_id.load(Ordering::Acquire))
    }
}
