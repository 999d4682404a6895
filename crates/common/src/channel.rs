//! Async channel bridge between the Tokio runtime and the discovery thread

use crate::store::SlotIndex;
use crate::usb_types::UsbIdentity;
use async_channel::{Receiver, Sender, bounded};
use protocol::DeviceIdentity;
use tracing::debug;

/// Commands from the Tokio runtime to the discovery thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerCommand {
    /// Stop polling, tear down every relay and exit
    Shutdown,
}

/// Lifecycle events reported by discovery and the relays
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A new USB device showed up and a relay is being started for it
    DeviceAttached { usb: UsbIdentity },

    /// A tracked USB device disappeared from the bus
    DeviceDetached { usb: UsbIdentity },

    /// Handshake completed and the device is live in the store
    RelayActive {
        usb: UsbIdentity,
        device: DeviceIdentity,
        slot: SlotIndex,
    },

    /// A relay finished; `reason` is a human readable teardown cause
    RelayStopped {
        usb: UsbIdentity,
        device: Option<DeviceIdentity>,
        reason: String,
    },
}

/// Handle for the Tokio runtime (async)
#[derive(Clone)]
pub struct HandlerBridge {
    cmd_tx: Sender<HandlerCommand>,
    event_rx: Receiver<RelayEvent>,
}

impl HandlerBridge {
    /// Send a command to the discovery thread
    pub async fn send_command(&self, cmd: HandlerCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from discovery or a relay
    pub async fn recv_event(&self) -> crate::Result<RelayEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the discovery thread (blocking)
pub struct PollerLink {
    cmd_rx: Receiver<HandlerCommand>,
    events: EventSink,
}

impl PollerLink {
    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<HandlerCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Whether the runtime side has gone away
    pub fn is_orphaned(&self) -> bool {
        self.cmd_rx.is_closed()
    }

    /// Event sink to hand to relay threads
    pub fn events(&self) -> EventSink {
        self.events.clone()
    }
}

/// Cloneable sender for [`RelayEvent`]s used from blocking threads
///
/// Events are best effort: once the runtime side has shut down they are
/// dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<Sender<RelayEvent>>,
}

impl EventSink {
    /// Sink that discards every event
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Send an event (blocking while the channel is full)
    pub fn emit(&self, event: RelayEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.send_blocking(event) {
                debug!("Dropping relay event: {}", e);
            }
        }
    }
}

impl From<Sender<RelayEvent>> for EventSink {
    fn from(tx: Sender<RelayEvent>) -> Self {
        Self { tx: Some(tx) }
    }
}

/// Create the channel bridge between Tokio and the discovery thread
///
/// Returns (HandlerBridge for Tokio, PollerLink for the discovery thread)
pub fn create_handler_bridge() -> (HandlerBridge, PollerLink) {
    let (cmd_tx, cmd_rx) = bounded(16);
    let (event_tx, event_rx) = bounded(256);

    (
        HandlerBridge { cmd_tx, event_rx },
        PollerLink {
            cmd_rx,
            events: EventSink::from(event_tx),
        },
    )
}
