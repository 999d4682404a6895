//! Lowcar message definitions
//!
//! A message is a kind byte plus a bounded payload. Each kind has a fixed
//! payload capacity; constructors refuse payloads that exceed it.
//!
//! Payload layouts (all multi-byte fields little-endian):
//!
//! | Kind                 | Payload                                               |
//! |----------------------|-------------------------------------------------------|
//! | Ping, Disable        | empty                                                 |
//! | HeartbeatRequest/Response | 1 byte heartbeat id                              |
//! | SubscriptionRequest  | u32 param mask, u16 delay (ms)                        |
//! | SubscriptionResponse | u32 param mask, u16 delay, u16 type, u8 year, u64 uid |
//! | DeviceRead           | u32 param mask                                        |
//! | DeviceWrite/Data     | u32 param mask, then each present value by ordinal    |
//! | Log                  | NUL-terminated text                                   |
//! | Error                | 1 byte error code                                     |

use crate::catalog::DeviceDescriptor;
use crate::error::{ProtocolError, Result};
use crate::types::{DeviceIdentity, ParamType, ParamValue, ParamValues, mask_indices, mask_of};
use bytes::{Buf, BufMut, BytesMut};

/// Largest payload any message kind may carry
pub const MAX_PAYLOAD_SIZE: usize = 132;

/// Message kind, encoded as the first byte of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 0x10,
    SubscriptionRequest = 0x11,
    SubscriptionResponse = 0x12,
    DeviceRead = 0x13,
    DeviceWrite = 0x14,
    DeviceData = 0x15,
    Disable = 0x16,
    HeartbeatRequest = 0x17,
    HeartbeatResponse = 0x18,
    Log = 0x19,
    Error = 0xFF,
}

impl MessageKind {
    /// Wire id byte
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Payload capacity of this kind
    pub fn max_payload(self) -> usize {
        match self {
            MessageKind::Ping | MessageKind::Disable => 0,
            MessageKind::HeartbeatRequest
            | MessageKind::HeartbeatResponse
            | MessageKind::Error => 1,
            MessageKind::DeviceRead => 4,
            MessageKind::SubscriptionRequest => SubscriptionRequest::ENCODED_LEN,
            MessageKind::SubscriptionResponse => SubscriptionResponse::ENCODED_LEN,
            MessageKind::DeviceWrite | MessageKind::DeviceData | MessageKind::Log => {
                MAX_PAYLOAD_SIZE
            }
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(id: u8) -> Result<Self> {
        Ok(match id {
            0x10 => MessageKind::Ping,
            0x11 => MessageKind::SubscriptionRequest,
            0x12 => MessageKind::SubscriptionResponse,
            0x13 => MessageKind::DeviceRead,
            0x14 => MessageKind::DeviceWrite,
            0x15 => MessageKind::DeviceData,
            0x16 => MessageKind::Disable,
            0x17 => MessageKind::HeartbeatRequest,
            0x18 => MessageKind::HeartbeatResponse,
            0x19 => MessageKind::Log,
            0xFF => MessageKind::Error,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

/// A message ready to be serialized, or freshly parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    payload: Vec<u8>,
}

impl Message {
    /// Build a message, checking the payload against the kind's capacity
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > kind.max_payload() {
            return Err(ProtocolError::PayloadTooLarge {
                kind,
                size: payload.len(),
                max: kind.max_payload(),
            });
        }
        Ok(Self { kind, payload })
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload capacity of this message's kind
    pub fn capacity(&self) -> usize {
        self.kind.max_payload()
    }

    /// Fail with [`ProtocolError::UnexpectedKind`] unless this is `expected`
    pub fn expect_kind(&self, expected: MessageKind) -> Result<&Self> {
        if self.kind == expected {
            Ok(self)
        } else {
            Err(ProtocolError::UnexpectedKind {
                expected,
                actual: self.kind,
            })
        }
    }

    pub fn ping() -> Self {
        Self {
            kind: MessageKind::Ping,
            payload: Vec::new(),
        }
    }

    pub fn disable() -> Self {
        Self {
            kind: MessageKind::Disable,
            payload: Vec::new(),
        }
    }

    /// The heartbeat id is echoed back by the peer; it is currently unused
    pub fn heartbeat_request(heartbeat_id: u8) -> Self {
        Self {
            kind: MessageKind::HeartbeatRequest,
            payload: vec![heartbeat_id],
        }
    }

    pub fn heartbeat_response(heartbeat_id: u8) -> Self {
        Self {
            kind: MessageKind::HeartbeatResponse,
            payload: vec![heartbeat_id],
        }
    }

    /// Ask a device to stream the named parameters every `delay_ms`
    pub fn subscription_request<S: AsRef<str>>(
        device: &DeviceDescriptor,
        params: &[S],
        delay_ms: u16,
    ) -> Result<Self> {
        let request = SubscriptionRequest {
            params: device.encode_params(params)?,
            delay_ms,
        };
        Self::new(MessageKind::SubscriptionRequest, request.encode())
    }

    pub fn subscription_response(response: &SubscriptionResponse) -> Self {
        Self {
            kind: MessageKind::SubscriptionResponse,
            payload: response.encode(),
        }
    }

    /// Ask a device to report the named parameters once
    pub fn device_read<S: AsRef<str>>(device: &DeviceDescriptor, params: &[S]) -> Result<Self> {
        let mask = device.encode_params(params)?;
        Self::new(MessageKind::DeviceRead, mask.to_le_bytes().to_vec())
    }

    /// Write parameter values to a device
    pub fn device_write(device: &DeviceDescriptor, values: &ParamValues) -> Result<Self> {
        Self::new(MessageKind::DeviceWrite, encode_param_values(device, values)?)
    }

    /// Parameter values reported by a device
    pub fn device_data(device: &DeviceDescriptor, values: &ParamValues) -> Result<Self> {
        Self::new(MessageKind::DeviceData, encode_param_values(device, values)?)
    }

    /// Text log line; stored NUL-terminated like the firmware expects
    pub fn log(text: &str) -> Result<Self> {
        let mut payload = Vec::with_capacity(text.len() + 1);
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);
        Self::new(MessageKind::Log, payload)
    }

    pub fn error(code: u8) -> Self {
        Self {
            kind: MessageKind::Error,
            payload: vec![code],
        }
    }

    /// Heartbeat id of a heartbeat message (0 when absent)
    pub fn heartbeat_id(&self) -> u8 {
        self.payload.first().copied().unwrap_or(0)
    }

    /// Error code of an Error message
    pub fn error_code(&self) -> Option<u8> {
        match self.kind {
            MessageKind::Error => self.payload.first().copied(),
            _ => None,
        }
    }

    /// Log text up to the first NUL, decoded lossily
    pub fn log_text(&self) -> String {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }
}

/// SubscriptionRequest payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub params: u32,
    pub delay_ms: u16,
}

impl SubscriptionRequest {
    pub const ENCODED_LEN: usize = 6;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_u32_le(self.params);
        buf.put_u16_le(self.delay_ms);
        buf.to_vec()
    }

    pub fn parse(message: &Message) -> Result<Self> {
        message.expect_kind(MessageKind::SubscriptionRequest)?;
        let mut buf = message.payload();
        ensure_remaining(buf, Self::ENCODED_LEN)?;
        Ok(Self {
            params: buf.get_u32_le(),
            delay_ms: buf.get_u16_le(),
        })
    }
}

/// SubscriptionResponse payload: the device's handshake answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionResponse {
    pub params: u32,
    pub delay_ms: u16,
    pub identity: DeviceIdentity,
}

impl SubscriptionResponse {
    /// u32 mask + u16 delay + 11-byte identity block
    pub const ENCODED_LEN: usize = 4 + 2 + DeviceIdentity::ENCODED_LEN;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_u32_le(self.params);
        buf.put_u16_le(self.delay_ms);
        buf.put_u16_le(self.identity.device_type);
        buf.put_u8(self.identity.year);
        buf.put_u64_le(self.identity.uid);
        buf.to_vec()
    }

    /// Structured, bounds-checked parse of a SubscriptionResponse message
    pub fn parse(message: &Message) -> Result<Self> {
        message.expect_kind(MessageKind::SubscriptionResponse)?;
        let mut buf = message.payload();
        ensure_remaining(buf, Self::ENCODED_LEN)?;

        let params = buf.get_u32_le();
        let delay_ms = buf.get_u16_le();
        let device_type = buf.get_u16_le();
        let year = buf.get_u8();
        let uid = buf.get_u64_le();

        Ok(Self {
            params,
            delay_ms,
            identity: DeviceIdentity {
                device_type,
                year,
                uid,
            },
        })
    }
}

/// Mask carried by a DeviceRead message
pub fn parse_device_read(message: &Message) -> Result<u32> {
    message.expect_kind(MessageKind::DeviceRead)?;
    let mut buf = message.payload();
    ensure_remaining(buf, 4)?;
    Ok(buf.get_u32_le())
}

/// Serialize parameter values as `mask | value...` in ordinal order
pub fn encode_param_values(device: &DeviceDescriptor, values: &ParamValues) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(device.data_payload_size());
    buf.put_u32_le(mask_of(values));

    for (&index, value) in values {
        let param = device
            .param(index)
            .ok_or_else(|| ProtocolError::UnknownParameter {
                device_type: device.device_type,
                name: format!("#{}", index),
            })?;
        match (param.param_type, value) {
            (ParamType::Int, ParamValue::Int(v)) => buf.put_i32_le(*v),
            (ParamType::Float, ParamValue::Float(v)) => buf.put_f32_le(*v),
            (ParamType::Bool, ParamValue::Bool(v)) => buf.put_u8(u8::from(*v)),
            (expected, actual) => {
                return Err(ProtocolError::TypeMismatch {
                    index,
                    expected: expected.name(),
                    actual: actual.param_type().name(),
                });
            }
        }
    }

    Ok(buf.to_vec())
}

/// Decode a DeviceWrite or DeviceData payload into `(mask, values)`
pub fn decode_param_values(device: &DeviceDescriptor, message: &Message) -> Result<(u32, ParamValues)> {
    if !matches!(message.kind(), MessageKind::DeviceWrite | MessageKind::DeviceData) {
        return Err(ProtocolError::UnexpectedKind {
            expected: MessageKind::DeviceData,
            actual: message.kind(),
        });
    }

    let mut buf = message.payload();
    ensure_remaining(buf, 4)?;
    let mask = buf.get_u32_le();

    let mut values = ParamValues::new();
    for index in mask_indices(mask) {
        let param = device
            .param(index)
            .ok_or_else(|| ProtocolError::UnknownParameter {
                device_type: device.device_type,
                name: format!("#{}", index),
            })?;
        ensure_remaining(buf, param.param_type.wire_size())?;
        let value = match param.param_type {
            ParamType::Int => ParamValue::Int(buf.get_i32_le()),
            ParamType::Float => ParamValue::Float(buf.get_f32_le()),
            ParamType::Bool => ParamValue::Bool(buf.get_u8() != 0),
        };
        values.insert(index, value);
    }

    Ok((mask, values))
}

fn ensure_remaining(buf: &[u8], needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            expected: needed,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DeviceCatalog, StaticCatalog};

    #[test]
    fn test_kind_ids_roundtrip() {
        let kinds = [
            MessageKind::Ping,
            MessageKind::SubscriptionRequest,
            MessageKind::SubscriptionResponse,
            MessageKind::DeviceRead,
            MessageKind::DeviceWrite,
            MessageKind::DeviceData,
            MessageKind::Disable,
            MessageKind::HeartbeatRequest,
            MessageKind::HeartbeatResponse,
            MessageKind::Log,
            MessageKind::Error,
        ];
        for kind in kinds {
            assert_eq!(MessageKind::try_from(kind.id()).unwrap(), kind);
        }
        assert_eq!(MessageKind::Ping.id(), 0x10);
        assert_eq!(MessageKind::Error.id(), 0xFF);
        assert_eq!(
            MessageKind::try_from(0x42),
            Err(ProtocolError::UnknownKind(0x42))
        );
    }

    #[test]
    fn test_capacity_enforced() {
        let result = Message::new(MessageKind::Ping, vec![1]);
        assert!(matches!(
            result,
            Err(ProtocolError::PayloadTooLarge { size: 1, max: 0, .. })
        ));
        assert!(Message::new(MessageKind::DeviceRead, vec![0; 4]).is_ok());
        assert!(Message::new(MessageKind::DeviceRead, vec![0; 5]).is_err());
    }

    #[test]
    fn test_log_limits() {
        assert!(Message::log(&"a".repeat(131)).is_ok());
        assert!(matches!(
            Message::log(&"a".repeat(132)),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
        let msg = Message::log("motor stalled").unwrap();
        assert_eq!(msg.len(), 14);
        assert_eq!(msg.log_text(), "motor stalled");
    }

    #[test]
    fn test_subscription_response_layout() {
        let response = SubscriptionResponse {
            params: 0x0000_0007,
            delay_ms: 40,
            identity: DeviceIdentity::new(0x000D, 20, 0x0102_0304_0506_0708),
        };
        let msg = Message::subscription_response(&response);
        let payload = msg.payload();
        assert_eq!(payload.len(), 17);
        assert_eq!(&payload[0..4], &[7, 0, 0, 0]);
        assert_eq!(&payload[4..6], &[40, 0]);
        assert_eq!(&payload[6..8], &[0x0D, 0x00]);
        assert_eq!(payload[8], 20);
        assert_eq!(&payload[9..17], &[8, 7, 6, 5, 4, 3, 2, 1]);

        assert_eq!(SubscriptionResponse::parse(&msg).unwrap(), response);
    }

    #[test]
    fn test_subscription_response_short_payload() {
        let msg = Message::new(MessageKind::SubscriptionResponse, vec![0; 10]).unwrap();
        assert!(matches!(
            SubscriptionResponse::parse(&msg),
            Err(ProtocolError::Truncated { expected: 17, actual: 10 })
        ));
    }

    #[test]
    fn test_subscription_response_wrong_kind() {
        assert!(matches!(
            SubscriptionResponse::parse(&Message::ping()),
            Err(ProtocolError::UnexpectedKind { .. })
        ));
    }

    #[test]
    fn test_subscription_request() {
        let catalog = StaticCatalog::builtin();
        let line = catalog.require(1).unwrap();
        let msg = Message::subscription_request(line, &["right", "left"], 25).unwrap();
        let parsed = SubscriptionRequest::parse(&msg).unwrap();
        assert_eq!(parsed.params, 0b101);
        assert_eq!(parsed.delay_ms, 25);
    }

    #[test]
    fn test_device_read() {
        let catalog = StaticCatalog::builtin();
        let pot = catalog.require(2).unwrap();
        let msg = Message::device_read(pot, &["pot1"]).unwrap();
        assert_eq!(parse_device_read(&msg).unwrap(), 0b10);
    }

    #[test]
    fn test_param_values_encoding() {
        let catalog = StaticCatalog::builtin();
        let koala = catalog.require(13).unwrap();

        let mut values = ParamValues::new();
        values.insert(0, ParamValue::Float(0.5));
        values.insert(2, ParamValue::Bool(true));
        values.insert(7, ParamValue::Int(-3));

        let msg = Message::device_write(koala, &values).unwrap();
        let payload = msg.payload();
        assert_eq!(&payload[0..4], &0b1000_0101u32.to_le_bytes());
        assert_eq!(&payload[4..8], &0.5f32.to_le_bytes());
        assert_eq!(payload[8], 1);
        assert_eq!(&payload[9..13], &(-3i32).to_le_bytes());
        assert_eq!(payload.len(), 13);

        let (mask, decoded) = decode_param_values(koala, &msg).unwrap();
        assert_eq!(mask, 0b1000_0101);
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_param_values_type_mismatch() {
        let catalog = StaticCatalog::builtin();
        let switch = catalog.require(0).unwrap();
        let mut values = ParamValues::new();
        values.insert(1, ParamValue::Float(1.0));
        assert!(matches!(
            Message::device_write(switch, &values),
            Err(ProtocolError::TypeMismatch { index: 1, expected: "bool", actual: "float" })
        ));
    }

    #[test]
    fn test_param_values_truncated() {
        let catalog = StaticCatalog::builtin();
        let line = catalog.require(1).unwrap();
        // Mask claims all three floats, only one present
        let mut payload = 0b111u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&1.0f32.to_le_bytes());
        let msg = Message::new(MessageKind::DeviceData, payload).unwrap();
        assert!(matches!(
            decode_param_values(line, &msg),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_param_values_unknown_bit() {
        let catalog = StaticCatalog::builtin();
        let encoder = catalog.require(3).unwrap();
        let mut payload = 0b10u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&[0; 4]);
        let msg = Message::new(MessageKind::DeviceData, payload).unwrap();
        assert!(matches!(
            decode_param_values(encoder, &msg),
            Err(ProtocolError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn test_error_and_heartbeat_accessors() {
        assert_eq!(Message::error(0xFD).error_code(), Some(0xFD));
        assert_eq!(Message::ping().error_code(), None);
        assert_eq!(Message::heartbeat_request(9).heartbeat_id(), 9);
        assert_eq!(Message::heartbeat_response(0).heartbeat_id(), 0);
    }
}
