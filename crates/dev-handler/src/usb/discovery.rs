//! USB discovery poller
//!
//! Polls the bus, diffs the set of attached devices against the previous
//! poll and starts a relay for every new device. Devices are compared by
//! [`UsbIdentity`] as a multiset, so the poller knows exactly which device
//! left and still notices an arrival when another device left in the same
//! period.
//!
//! Devices already attached when discovery starts are recorded but never
//! opened; only devices that arrive afterwards get a relay. Hubs are never
//! relayed when `skip_hubs` is set.
//!
//! The poller never waits on a relay while polling; relays report their own
//! end and are reaped on later iterations.

use super::device::RusbPort;
use super::port::UsbPort;
use crate::config::{UsbFilter, UsbSettings};
use crate::relay::{RelayContext, RelayExit, RelayServices, Supervisor};
use common::{HandlerCommand, PollerLink, RelayEvent, UsbIdentity};
use rusb::{Context, Device, UsbContext};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// USB device class code for hubs
const HUB_CLASS: u8 = 0x09;

/// Devices that appeared and disappeared between two polls
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryDiff {
    pub arrived: Vec<UsbIdentity>,
    pub departed: Vec<UsbIdentity>,
}

impl DiscoveryDiff {
    pub fn is_empty(&self) -> bool {
        self.arrived.is_empty() && self.departed.is_empty()
    }
}

fn count(identities: &[UsbIdentity]) -> HashMap<UsbIdentity, usize> {
    let mut counts = HashMap::new();
    for identity in identities {
        *counts.entry(*identity).or_insert(0) += 1;
    }
    counts
}

/// Multiset difference between two polls
///
/// Output lists are sorted so that results are deterministic.
pub fn diff_identities(previous: &[UsbIdentity], current: &[UsbIdentity]) -> DiscoveryDiff {
    let before = count(previous);
    let after = count(current);

    let mut diff = DiscoveryDiff::default();
    for (identity, &now) in &after {
        let was = before.get(identity).copied().unwrap_or(0);
        diff.arrived
            .extend(std::iter::repeat_n(*identity, now.saturating_sub(was)));
    }
    for (identity, &was) in &before {
        let now = after.get(identity).copied().unwrap_or(0);
        diff.departed
            .extend(std::iter::repeat_n(*identity, was.saturating_sub(now)));
    }

    diff.arrived.sort();
    diff.departed.sort();
    diff
}

/// The set of devices seen by the previous poll
#[derive(Debug, Default)]
pub struct DiscoveryTracker {
    tracked: Vec<UsbIdentity>,
}

impl DiscoveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff `current` against the tracked set, then track `current`
    pub fn update(&mut self, current: &[UsbIdentity]) -> DiscoveryDiff {
        let diff = diff_identities(&self.tracked, current);
        self.tracked = current.to_vec();
        diff
    }

    pub fn tracked(&self) -> &[UsbIdentity] {
        &self.tracked
    }
}

/// Whether a device passes the configured filters
///
/// No filters means every device passes.
pub fn matches_filters(vid: u16, pid: u16, filters: &[UsbFilter]) -> bool {
    filters.is_empty() || filters.iter().any(|filter| filter.matches(vid, pid))
}

/// Whether a device descriptor's class marks a hub (root or external)
pub fn is_hub(class_code: u8) -> bool {
    class_code == HUB_CLASS
}

/// Where the poller gets devices from
pub trait DeviceSource: Send + 'static {
    type Device: Send + 'static;
    type Port: UsbPort;

    /// Devices currently attached (after filtering)
    fn enumerate(&self) -> Result<Vec<(UsbIdentity, Self::Device)>, rusb::Error>;

    /// Open a device for its relay
    fn open(device: Self::Device) -> Result<Self::Port, rusb::Error>;
}

/// [`DeviceSource`] backed by libusb
pub struct RusbSource {
    context: Context,
    filters: Vec<UsbFilter>,
    skip_hubs: bool,
}

impl RusbSource {
    pub fn new(settings: &UsbSettings) -> Result<Self, rusb::Error> {
        Ok(Self {
            context: Context::new()?,
            filters: settings.filters.clone(),
            skip_hubs: settings.skip_hubs,
        })
    }
}

impl DeviceSource for RusbSource {
    type Device = Device<Context>;
    type Port = RusbPort;

    fn enumerate(&self) -> Result<Vec<(UsbIdentity, Self::Device)>, rusb::Error> {
        let mut found = Vec::new();

        for device in self.context.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(e) => {
                    debug!(
                        "Skipping bus={} addr={}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            if self.skip_hubs && is_hub(desc.class_code()) {
                continue;
            }
            if !matches_filters(desc.vendor_id(), desc.product_id(), &self.filters) {
                continue;
            }

            let identity = UsbIdentity::new(
                desc.vendor_id(),
                desc.product_id(),
                device.bus_number(),
                device.address(),
            );
            found.push((identity, device));
        }

        Ok(found)
    }

    fn open(device: Self::Device) -> Result<Self::Port, rusb::Error> {
        RusbPort::open(device)
    }
}

/// Identities of the devices discovery would consider right now
pub fn list_devices(settings: &UsbSettings) -> Result<Vec<UsbIdentity>, rusb::Error> {
    let source = RusbSource::new(settings)?;
    let mut identities: Vec<UsbIdentity> = source
        .enumerate()?
        .into_iter()
        .map(|(identity, _)| identity)
        .collect();
    identities.sort();
    Ok(identities)
}

struct RelayHandle {
    ctx: Arc<RelayContext>,
    thread: JoinHandle<RelayExit>,
}

/// The discovery loop and the relays it started
pub struct DiscoveryPoller<S: DeviceSource> {
    source: S,
    link: PollerLink,
    services: RelayServices,
    poll_interval: Duration,
    tracker: DiscoveryTracker,
    seeded: bool,
    relays: Vec<RelayHandle>,
}

impl<S: DeviceSource> DiscoveryPoller<S> {
    pub fn new(
        source: S,
        link: PollerLink,
        services: RelayServices,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            link,
            services,
            poll_interval,
            tracker: DiscoveryTracker::new(),
            seeded: false,
            relays: Vec::new(),
        }
    }

    /// Poll until a Shutdown command arrives, then stop every relay
    pub fn run(mut self) {
        info!("Discovery started");
        if !self.seeded {
            self.seed();
        }

        loop {
            match self.link.try_recv_command() {
                Some(HandlerCommand::Shutdown) => {
                    info!("Discovery shutting down");
                    break;
                }
                None if self.link.is_orphaned() => {
                    warn!("Command channel closed, shutting down");
                    break;
                }
                None => {}
            }

            self.poll_once();
            self.reap_finished();
            thread::sleep(self.poll_interval);
        }

        self.shutdown();
        info!("Discovery stopped");
    }

    /// Record the devices attached right now without relaying them
    ///
    /// Until this succeeds, [`DiscoveryPoller::poll_once`] seeds instead of
    /// spawning.
    pub fn seed(&mut self) {
        let devices = match self.source.enumerate() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Initial USB enumeration failed: {}", e);
                return;
            }
        };

        let identities: Vec<UsbIdentity> = devices.iter().map(|(identity, _)| *identity).collect();
        for usb in &identities {
            debug!("Present at startup, not relayed: {}", usb);
        }
        if !identities.is_empty() {
            info!(
                "Ignoring {} device(s) attached before startup; replug to relay them",
                identities.len()
            );
        }
        self.tracker.update(&identities);
        self.seeded = true;
    }

    /// One enumeration + diff + spawn pass
    pub fn poll_once(&mut self) {
        if !self.seeded {
            self.seed();
            return;
        }

        let mut devices = match self.source.enumerate() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("USB enumeration failed: {}", e);
                return;
            }
        };

        let identities: Vec<UsbIdentity> = devices.iter().map(|(identity, _)| *identity).collect();
        let diff = self.tracker.update(&identities);
        if diff.is_empty() {
            return;
        }

        for usb in &diff.departed {
            info!("Device left: {}", usb);
            self.services
                .events
                .emit(RelayEvent::DeviceDetached { usb: *usb });
        }

        for usb in &diff.arrived {
            let Some(pos) = devices.iter().position(|(identity, _)| identity == usb) else {
                continue;
            };
            let (_, device) = devices.swap_remove(pos);
            info!("Device arrived: {}", usb);
            self.services
                .events
                .emit(RelayEvent::DeviceAttached { usb: *usb });
            self.spawn_relay(*usb, device);
        }
    }

    fn spawn_relay(&mut self, usb: UsbIdentity, device: S::Device) {
        let ctx = Arc::new(RelayContext::new(usb));
        let supervisor = Supervisor::new(Arc::clone(&ctx), self.services.clone());

        let spawned = thread::Builder::new()
            .name(format!("relay-{}", usb.port_label()))
            .spawn(move || supervisor.run(move || S::open(device)));

        match spawned {
            Ok(thread) => self.relays.push(RelayHandle { ctx, thread }),
            Err(e) => error!("Could not start relay for {}: {}", usb, e),
        }
    }

    /// Join relays whose supervisor has returned
    fn reap_finished(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = self
            .relays
            .drain(..)
            .partition(|relay| relay.thread.is_finished());
        self.relays = running;

        for relay in finished {
            join_relay(relay);
        }
    }

    /// Cancel every relay and wait for each to finish teardown
    fn shutdown(&mut self) {
        for relay in &self.relays {
            relay.ctx.cancel();
        }
        for relay in self.relays.drain(..) {
            join_relay(relay);
        }
    }

    /// Number of relays not yet reaped
    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }
}

fn join_relay(relay: RelayHandle) {
    let usb = relay.ctx.usb();
    match relay.thread.join() {
        Ok(exit) => debug!("Relay {} exited: {}", usb, exit.reason),
        Err(_) => error!("Relay {} panicked", usb),
    }
}

/// Start discovery on its own thread
pub fn spawn_discovery<S: DeviceSource>(
    poller: DiscoveryPoller<S>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("discovery".to_string())
        .spawn(move || poller.run())
}
