//! Per-device relay
//!
//! Every lowcar device gets three named threads:
//! - the supervisor (`relay-<bus>-<addr>`) runs the connection state machine
//!   and watches liveness and heartbeats,
//! - the sender (`sender-…`) forwards pending store writes and heartbeats,
//! - the receiver (`receiver-…`) decodes incoming frames and dispatches them.
//!
//! The three share a [`RelayContext`]. The supervisor joins the other two
//! before it releases the device.

pub mod context;
pub mod receiver;
pub mod sender;
pub mod supervisor;

pub use context::{RelayContext, RelayPhase};
pub use supervisor::{HandshakeError, RelayExit, Supervisor, TeardownReason};

use crate::config::RelayTiming;
use common::{EventSink, ParamStore};
use protocol::{ChecksumMode, DeviceCatalog};
use std::sync::Arc;

/// Everything outside the device that a relay talks to
#[derive(Clone)]
pub struct RelayServices {
    pub catalog: Arc<dyn DeviceCatalog>,
    pub store: Arc<dyn ParamStore>,
    pub events: EventSink,
    pub timing: RelayTiming,
    pub checksum: ChecksumMode,
}
