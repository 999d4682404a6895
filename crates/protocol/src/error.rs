//! Protocol error types

use crate::messages::MessageKind;
use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// Payload does not fit in the message kind's capacity
    #[error("Payload too large for {kind:?}: {size} bytes (max: {max})")]
    PayloadTooLarge {
        kind: MessageKind,
        size: usize,
        max: usize,
    },

    /// Trailing checksum byte does not match the computed checksum
    #[error("Checksum mismatch: frame carries {expected:#04x}, computed {computed:#04x}")]
    ChecksumMismatch { expected: u8, computed: u8 },

    /// Frame or message ended before all declared bytes were present
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// COBS block structure is broken (block length runs past the end)
    #[error("Malformed COBS encoding")]
    BadEncoding,

    /// First byte of a frame was not the zero delimiter
    #[error("Missing frame delimiter, found {0:#04x}")]
    MissingDelimiter(u8),

    /// Message id byte is not a known message kind
    #[error("Unknown message kind {0:#04x}")]
    UnknownKind(u8),

    /// A message of one kind was required, another arrived
    #[error("Unexpected message kind: expected {expected:?}, got {actual:?}")]
    UnexpectedKind {
        expected: MessageKind,
        actual: MessageKind,
    },

    /// Device type has no entry in the parameter catalog
    #[error("Unknown device type {0}")]
    UnknownDevice(u16),

    /// Parameter name is not defined for the device type
    #[error("Unknown parameter {name:?} for device type {device_type}")]
    UnknownParameter { device_type: u16, name: String },

    /// Parameter value does not match the catalog-declared type
    #[error("Parameter {index} expects {expected}, got {actual}")]
    TypeMismatch {
        index: u8,
        expected: &'static str,
        actual: &'static str,
    },

    /// Encoded frame would not fit the one-byte length field
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Catalog file could not be read or parsed
    #[error("Catalog error: {0}")]
    Catalog(String),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
