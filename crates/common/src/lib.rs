//! Common utilities for the lowcar device handler
//!
//! This crate provides functionality shared between the device handler and
//! the processes around it: the parameter store interface, USB identity
//! types, error handling, logging setup, and the async channel bridge
//! between the Tokio runtime and the blocking discovery thread.

pub mod channel;
pub mod error;
pub mod logging;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb_types;

pub use channel::{
    EventSink, HandlerBridge, HandlerCommand, PollerLink, RelayEvent, create_handler_bridge,
};
pub use error::{Error, Result, StoreError};
pub use logging::{DEVICE_LOG_TARGET, setup_logging};
pub use store::{MAX_DEVICES, MemoryStore, ParamStore, PendingWrites, Requester, SlotIndex, Stream};
pub use usb_types::UsbIdentity;
