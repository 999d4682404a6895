//! Framed message transfers over bulk endpoints
//!
//! Every transfer is bounded by the configured per-transfer timeout. A read
//! timeout is not an error: it just means the device had nothing to say.

use super::port::UsbLink;
use protocol::{ChecksumMode, FrameDecoder, Message, ProtocolError, encode_frame};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

/// Size of one bulk IN read (high-speed bulk max packet size)
pub const READ_CHUNK_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
}

impl TransferError {
    /// Whether the failure means the device is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransferError::Usb(e) if is_disconnect(e))
    }
}

/// Whether a rusb error means the device left the bus
pub fn is_disconnect(err: &rusb::Error) -> bool {
    matches!(err, rusb::Error::NoDevice | rusb::Error::NotFound)
}

/// Frame and send one message on the bulk OUT endpoint
pub fn send_message<L: UsbLink + ?Sized>(
    link: &L,
    endpoint: u8,
    message: &Message,
    mode: ChecksumMode,
    timeout: Duration,
) -> Result<(), TransferError> {
    let frame = encode_frame(message, mode)?;
    let written = link.write_bulk(endpoint, &frame, timeout)?;
    if written != frame.len() {
        return Err(TransferError::ShortWrite {
            written,
            expected: frame.len(),
        });
    }
    trace!("Sent {:?} ({} bytes)", message.kind(), written);
    Ok(())
}

/// Read one chunk from the bulk IN endpoint into `decoder`
///
/// Returns the number of bytes received; a timeout yields `Ok(0)`.
pub fn read_chunk<L: UsbLink + ?Sized>(
    link: &L,
    endpoint: u8,
    decoder: &mut FrameDecoder,
    timeout: Duration,
) -> Result<usize, rusb::Error> {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    match link.read_bulk(endpoint, &mut buf, timeout) {
        Ok(len) => {
            decoder.extend(&buf[..len]);
            Ok(len)
        }
        Err(rusb::Error::Timeout) => Ok(0),
        Err(e) => Err(e),
    }
}

/// Outcome of waiting for a single frame
#[derive(Debug)]
pub enum FrameWait {
    /// A frame decoded cleanly
    Message(Message),
    /// A complete frame arrived but could not be used
    Corrupt(ProtocolError),
    /// Nothing arrived before the deadline
    Expired,
}

/// Read until the first complete frame or until `deadline`
///
/// Stray bytes before a delimiter are skipped. Each read is bounded by
/// `transfer_timeout` and by the time left until the deadline.
pub fn wait_for_frame<L: UsbLink + ?Sized>(
    link: &L,
    endpoint: u8,
    decoder: &mut FrameDecoder,
    deadline: Instant,
    transfer_timeout: Duration,
) -> Result<FrameWait, rusb::Error> {
    loop {
        match decoder.next_frame() {
            Some(Ok(message)) => return Ok(FrameWait::Message(message)),
            Some(Err(e)) => return Ok(FrameWait::Corrupt(e)),
            None => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(FrameWait::Expired);
        }
        let timeout = transfer_timeout.min(deadline - now);
        read_chunk(link, endpoint, decoder, timeout)?;
    }
}
