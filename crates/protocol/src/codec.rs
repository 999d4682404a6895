//! Message serialization and wire framing
//!
//! # Message bytes
//! ```text
//! [id: u8][payload_len: u8][payload: payload_len bytes][checksum: u8]
//! ```
//!
//! # Frame format
//! ```text
//! [0x00 delimiter][encoded_len: u8][COBS(message bytes): encoded_len bytes]
//! ```
//!
//! The delimiter is the only zero byte in a frame, so a reader that lost
//! sync can skip forward to the next `0x00` and resume.

use crate::cobs;
use crate::error::{ProtocolError, Result};
use crate::integrity::{ChecksumMode, IntegrityMetrics, compute_checksum};
use crate::messages::{MAX_PAYLOAD_SIZE, Message, MessageKind};
use bytes::{Buf, BytesMut};

/// Byte that starts every frame
pub const FRAME_DELIMITER: u8 = 0x00;

/// id byte + payload length byte
pub const HEADER_LEN: usize = 2;

/// Largest serialized message (header + payload + checksum)
pub const MAX_MESSAGE_LEN: usize = HEADER_LEN + MAX_PAYLOAD_SIZE + 1;

/// Largest encoded body the one-byte length field can describe
pub const MAX_ENCODED_LEN: usize = u8::MAX as usize;

/// Largest complete frame on the wire
pub const MAX_FRAME_LEN: usize = HEADER_LEN + cobs::max_encoded_len(MAX_MESSAGE_LEN);

/// Serialize a message to `id | len | payload | checksum`
pub fn message_to_bytes(message: &Message, mode: ChecksumMode) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + message.len() + 1);
    bytes.push(message.kind().id());
    bytes.push(message.len() as u8);
    bytes.extend_from_slice(message.payload());
    let checksum = compute_checksum(&bytes, mode);
    bytes.push(checksum);
    bytes
}

/// Parse `id | len | payload | checksum` back into a message
///
/// A short buffer yields [`ProtocolError::Truncated`]; a complete buffer
/// whose last byte disagrees with the computed checksum yields
/// [`ProtocolError::ChecksumMismatch`]. The checksum is verified before the
/// id is interpreted.
pub fn parse_message(bytes: &[u8], mode: ChecksumMode) -> Result<Message> {
    if bytes.len() < HEADER_LEN + 1 {
        return Err(ProtocolError::Truncated {
            expected: HEADER_LEN + 1,
            actual: bytes.len(),
        });
    }

    let payload_len = bytes[1] as usize;
    let body_len = HEADER_LEN + payload_len;
    if bytes.len() < body_len + 1 {
        return Err(ProtocolError::Truncated {
            expected: body_len + 1,
            actual: bytes.len(),
        });
    }

    let received = bytes[body_len];
    let computed = compute_checksum(&bytes[..body_len], mode);
    if received != computed {
        return Err(ProtocolError::ChecksumMismatch {
            expected: received,
            computed,
        });
    }

    let kind = MessageKind::try_from(bytes[0])?;
    Message::new(kind, bytes[HEADER_LEN..body_len].to_vec())
}

/// Encode a message into a complete wire frame
///
/// # Example
/// ```
/// use protocol::{ChecksumMode, Message, decode_frame, encode_frame};
///
/// let frame = encode_frame(&Message::heartbeat_request(0), ChecksumMode::Xor).unwrap();
/// assert_eq!(frame, vec![0x00, 0x05, 0x03, 0x17, 0x01, 0x02, 0x16]);
///
/// let decoded = decode_frame(&frame, ChecksumMode::Xor).unwrap();
/// assert_eq!(decoded, Message::heartbeat_request(0));
/// ```
pub fn encode_frame(message: &Message, mode: ChecksumMode) -> Result<Vec<u8>> {
    let encoded = cobs::encode(&message_to_bytes(message, mode));
    if encoded.len() > MAX_ENCODED_LEN {
        return Err(ProtocolError::FrameTooLarge {
            size: encoded.len(),
            max: MAX_ENCODED_LEN,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + encoded.len());
    frame.push(FRAME_DELIMITER);
    frame.push(encoded.len() as u8);
    frame.extend_from_slice(&encoded);
    Ok(frame)
}

/// Decode one complete wire frame
pub fn decode_frame(frame: &[u8], mode: ChecksumMode) -> Result<Message> {
    if frame.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            expected: HEADER_LEN,
            actual: frame.len(),
        });
    }
    if frame[0] != FRAME_DELIMITER {
        return Err(ProtocolError::MissingDelimiter(frame[0]));
    }

    let encoded_len = frame[1] as usize;
    if frame.len() < HEADER_LEN + encoded_len {
        return Err(ProtocolError::Truncated {
            expected: HEADER_LEN + encoded_len,
            actual: frame.len(),
        });
    }

    let bytes = cobs::decode(&frame[HEADER_LEN..HEADER_LEN + encoded_len])?;
    parse_message(&bytes, mode)
}

/// Incremental frame extractor for a byte stream
///
/// Bulk reads hand over whatever the device has queued: half a frame, two
/// frames, or noise. Feed every chunk to [`FrameDecoder::extend`] and drain
/// [`FrameDecoder::next_frame`] until it returns `None`.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    mode: ChecksumMode,
    metrics: IntegrityMetrics,
}

impl FrameDecoder {
    pub fn new(mode: ChecksumMode) -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_FRAME_LEN * 2),
            mode,
            metrics: IntegrityMetrics::new(),
        }
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partially received frame
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn metrics(&self) -> &IntegrityMetrics {
        &self.metrics
    }

    /// Extract the next frame
    ///
    /// Returns `None` when more bytes are needed, `Some(Err(_))` for a frame
    /// that was complete but unusable (it is consumed either way).
    pub fn next_frame(&mut self) -> Option<Result<Message>> {
        loop {
            let Some(start) = self.buffer.iter().position(|&b| b == FRAME_DELIMITER) else {
                self.metrics.record_stray_bytes(self.buffer.len());
                self.buffer.clear();
                return None;
            };
            if start > 0 {
                self.metrics.record_stray_bytes(start);
                self.buffer.advance(start);
            }

            if self.buffer.len() < HEADER_LEN {
                return None;
            }

            let encoded_len = self.buffer[1] as usize;
            if encoded_len == 0 {
                // Back-to-back delimiters; the second one starts the frame
                self.buffer.advance(1);
                continue;
            }

            let available = self.buffer.len() - HEADER_LEN;
            let visible = available.min(encoded_len);
            if let Some(cut) = self.buffer[HEADER_LEN..HEADER_LEN + visible]
                .iter()
                .position(|&b| b == FRAME_DELIMITER)
            {
                // A new frame began before this one finished
                self.buffer.advance(HEADER_LEN + cut);
                self.metrics.record_malformed();
                return Some(Err(ProtocolError::Truncated {
                    expected: encoded_len,
                    actual: cut,
                }));
            }

            if available < encoded_len {
                return None;
            }

            let frame = self.buffer.split_to(HEADER_LEN + encoded_len);
            let result = decode_frame(&frame, self.mode);
            match &result {
                Ok(_) => self.metrics.record_accepted(),
                Err(ProtocolError::ChecksumMismatch { .. }) => {
                    self.metrics.record_checksum_failure()
                }
                Err(_) => self.metrics.record_malformed(),
            }
            return Some(result);
        }
    }
}
