//! Lowcar wire protocol
//!
//! This crate defines the messages exchanged between the device handler and
//! lowcar microcontrollers over USB bulk endpoints, the per-device parameter
//! catalog, and the framing used on the wire (checksum, COBS, delimiter).
//!
//! # Example
//!
//! ```
//! use protocol::{ChecksumMode, Message, MessageKind, decode_frame, encode_frame};
//!
//! // Build a message
//! let msg = Message::heartbeat_response(7);
//!
//! // Frame it for the bulk OUT endpoint
//! let frame = encode_frame(&msg, ChecksumMode::Xor).unwrap();
//! assert_eq!(frame[0], 0x00);
//!
//! // And back
//! let decoded = decode_frame(&frame, ChecksumMode::Xor).unwrap();
//! assert_eq!(decoded.kind(), MessageKind::HeartbeatResponse);
//! assert_eq!(decoded.heartbeat_id(), 7);
//! ```
//!
//! # Parameters
//!
//! Parameter names are resolved through a [`DeviceCatalog`]:
//!
//! ```
//! use protocol::{DeviceCatalog, Message, StaticCatalog};
//!
//! let catalog = StaticCatalog::builtin();
//! let switch = catalog.require(0).unwrap();
//! let msg = Message::subscription_request(switch, &["switch0", "switch2"], 40).unwrap();
//! assert_eq!(&msg.payload()[..4], &0b101u32.to_le_bytes());
//! ```

pub mod catalog;
pub mod cobs;
pub mod codec;
pub mod error;
pub mod integrity;
pub mod messages;
pub mod types;

pub use catalog::{DeviceCatalog, DeviceDescriptor, ParamDescriptor, StaticCatalog};
pub use codec::{
    FRAME_DELIMITER, FrameDecoder, MAX_FRAME_LEN, MAX_MESSAGE_LEN, decode_frame, encode_frame,
    message_to_bytes, parse_message,
};
pub use error::{ProtocolError, Result};
pub use integrity::{ChecksumMode, IntegrityMetrics, compute_checksum, verify_checksum};
pub use messages::{
    MAX_PAYLOAD_SIZE, Message, MessageKind, SubscriptionRequest, SubscriptionResponse,
    decode_param_values, encode_param_values, parse_device_read,
};
pub use types::{
    DeviceIdentity, MAX_PARAMS, ParamType, ParamValue, ParamValues, mask_indices, mask_of,
};
