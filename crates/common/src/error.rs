//! Common error types

use crate::store::{Requester, SlotIndex, Stream};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a parameter store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("all {0} device slots are in use")]
    NoFreeSlot(usize),

    #[error("slot {0} does not exist")]
    InvalidSlot(SlotIndex),

    #[error("no device connected in slot {0}")]
    NotConnected(SlotIndex),

    #[error("{requester:?} may not write the {stream:?} stream")]
    PermissionDenied { requester: Requester, stream: Stream },
}
