//! Jensen packet framing.
//!
//! Wire format, big-endian:
//!
//! ```text
//! 2 bytes   sync marker 0x12 0x34
//! 2 bytes   command id
//! 4 bytes   sequence number
//! 4 bytes   body length N
//! N bytes   body
//! ```
//!
//! [`Framing`] owns the sequence counter and the partial-frame buffer.
//! It knows how to assign a sequence to an outgoing request and how to
//! decode complete frames out of a byte stream that may arrive in
//! arbitrary-sized reads. It deliberately does *not* decide when a
//! multi-frame stream is "done" — that's left entirely to the consumer
//! (file-list parser, streaming engine), which decides termination
//! however suits it: a declared count, an empty-body sentinel, or its
//! own timeout.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error::TransportError;
use crate::transport::Transport;

pub const SYNC_MARKER: [u8; 2] = [0x12, 0x34];
const HEADER_LEN: usize = 12;
/// Bytes we'll discard hunting for a valid sync marker before giving up.
/// Past this, the stream is considered unrecoverably desynced.
const MAX_RESYNC_DISCARD: usize = 4096;

#[derive(Error, Debug, Clone)]
pub enum FramingError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("no response received within the timeout")]
    Timeout,
    #[error("sync marker not found after discarding {0} bytes")]
    Desync(usize),
    #[error("unexpected response command id {got:#06x}, expected {expected:#06x}")]
    UnexpectedResponse { expected: u16, got: u16 },
}

/// A decoded frame, request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command_id: u16,
    pub sequence: u32,
    pub body: Vec<u8>,
}

/// Encode a single packet for the wire.
pub fn encode(command_id: u16, sequence: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&SYNC_MARKER);
    out.extend_from_slice(&command_id.to_be_bytes());
    out.extend_from_slice(&sequence.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Attempts to pull one complete frame out of `buf`, discarding bytes
/// in front of it that don't start a valid sync marker. Returns `Ok(None)`
/// if `buf` doesn't yet contain a complete frame.
pub fn try_decode(buf: &mut VecDeque<u8>) -> Result<Option<Frame>, FramingError> {
    let mut discarded = 0usize;

    loop {
        if buf.len() < 2 {
            return Ok(None);
        }
        if buf[0] != SYNC_MARKER[0] || buf[1] != SYNC_MARKER[1] {
            buf.pop_front();
            discarded += 1;
            if discarded > MAX_RESYNC_DISCARD {
                return Err(FramingError::Desync(discarded));
            }
            continue;
        }
        break;
    }

    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let header: Vec<u8> = buf.iter().take(HEADER_LEN).copied().collect();
    let command_id = u16::from_be_bytes([header[2], header[3]]);
    let sequence = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let length = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;

    if buf.len() < HEADER_LEN + length {
        return Ok(None);
    }

    for _ in 0..HEADER_LEN {
        buf.pop_front();
    }
    let body: Vec<u8> = buf.drain(..length).collect();

    Ok(Some(Frame {
        command_id,
        sequence,
        body,
    }))
}

/// Drives a [`Transport`], assigning sequence numbers to outgoing
/// requests and decoding complete frames from the inbound byte stream.
pub struct Framing<T: Transport> {
    transport: T,
    sequence: u32,
    buffer: VecDeque<u8>,
    read_chunk: usize,
}

impl<T: Transport> Framing<T> {
    pub fn new(transport: T) -> Self {
        let read_chunk = transport.max_packet_size().max(64) as usize;
        Self {
            transport,
            sequence: 0,
            buffer: VecDeque::new(),
            read_chunk,
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Zeroes the sequence counter and drops any buffered partial frame.
    /// Part of the recovery ladder's soft-reset step — it does not
    /// touch the transport itself.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
        self.buffer.clear();
    }

    /// Writes `body` as a request for `command_id`, assigning and
    /// returning the sequence number used. Sequence wraps at 32 bits.
    pub fn send_request(&mut self, command_id: u16, body: &[u8]) -> Result<u32, FramingError> {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        let packet = encode(command_id, sequence, body);
        self.transport.write(&packet, Duration::from_secs(5))?;
        Ok(sequence)
    }

    /// Attempts to receive one complete frame before `deadline`,
    /// reading from the transport as needed. Returns `Ok(None)` on
    /// timeout (not an error at this layer — the caller decides whether
    /// a timeout is terminal or retriable).
    pub fn receive_until(&mut self, deadline: Instant) -> Result<Option<Frame>, FramingError> {
        loop {
            if let Some(frame) = try_decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let remaining = deadline - now;
            let read_timeout = remaining.min(Duration::from_millis(200));

            let chunk = self.transport.read(self.read_chunk, read_timeout)?;
            if !chunk.is_empty() {
                self.buffer.extend(chunk);
            }
        }
    }

    /// Sends `body` as a single-response request for `command_id` and
    /// blocks for the matching response. Frames with a mismatched
    /// sequence are logged and dropped (the correlator's contract); a
    /// matching sequence with a different command id is a protocol
    /// error since single-response commands never change command id
    /// mid-flight.
    pub fn send_and_receive(
        &mut self,
        command_id: u16,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, FramingError> {
        let sequence = self.send_request(command_id, body)?;
        let deadline = Instant::now() + timeout;

        loop {
            match self.receive_until(deadline)? {
                None => return Err(FramingError::Timeout),
                Some(frame) if frame.sequence == sequence => {
                    if frame.command_id != command_id {
                        return Err(FramingError::UnexpectedResponse {
                            expected: command_id,
                            got: frame.command_id,
                        });
                    }
                    return Ok(frame.body);
                }
                Some(frame) => {
                    log::warn!(
                        "dropping frame with unmatched sequence {} (expected {})",
                        frame.sequence,
                        sequence
                    );
                }
            }
        }
    }

    pub fn flush_in(&mut self, deadline: Duration) {
        self.buffer.clear();
        self.transport.flush_in(deadline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;

    #[test]
    fn round_trip_encode_decode() {
        for (cmd, seq, body) in [
            (1u16, 0u32, vec![]),
            (0xFFFF, u32::MAX, vec![0xAB; 1024]),
            (42, 7, b"hello".to_vec()),
        ] {
            let encoded = encode(cmd, seq, &body);
            let mut buf: VecDeque<u8> = encoded.into_iter().collect();
            let frame = try_decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.command_id, cmd);
            assert_eq!(frame.sequence, seq);
            assert_eq!(frame.body, body);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn resync_skips_one_garbage_byte() {
        let mut buf: VecDeque<u8> = vec![0xFF].into_iter().collect();
        buf.extend(encode(1, 1, b"ok"));
        let frame = try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.command_id, 1);
        assert_eq!(frame.body, b"ok");
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let full = encode(1, 1, b"hello world");
        let mut buf: VecDeque<u8> = full[..full.len() - 2].to_vec().into_iter().collect();
        assert!(try_decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn sequence_correlation_matches_response_regardless_of_jitter() {
        let resp_a = encode(10, 0, b"a");
        let resp_b = encode(10, 1, b"b");
        // Device answers out of order relative to a naive FIFO assumption.
        let mut bytes = Vec::new();
        bytes.extend(resp_b.clone());
        bytes.extend(resp_a.clone());

        let transport = FakeTransport::with_inbound(vec![bytes]);
        let mut framing = Framing::new(transport);
        framing.sequence = 0;

        // First caller asked for sequence 0, should resolve to "a" even
        // though "b" (sequence 1) arrived first on the wire.
        let seq0 = framing.send_request(10, b"req-a").unwrap();
        assert_eq!(seq0, 0);
        let body = framing
            .send_and_receive_for_test(10, seq0, Duration::from_millis(100))
            .unwrap();
        assert_eq!(body, b"a");
    }

    impl<T: Transport> Framing<T> {
        fn send_and_receive_for_test(
            &mut self,
            command_id: u16,
            sequence: u32,
            timeout: Duration,
        ) -> Result<Vec<u8>, FramingError> {
            let deadline = Instant::now() + timeout;
            loop {
                match self.receive_until(deadline)? {
                    None => return Err(FramingError::Timeout),
                    Some(frame) if frame.sequence == sequence => {
                        if frame.command_id != command_id {
                            return Err(FramingError::UnexpectedResponse {
                                expected: command_id,
                                got: frame.command_id,
                            });
                        }
                        return Ok(frame.body);
                    }
                    Some(_) => continue,
                }
            }
        }
    }

    #[test]
    fn timeout_returns_typed_error_with_no_partial_data() {
        let transport = FakeTransport::new();
        let mut framing = Framing::new(transport);
        let err = framing
            .send_and_receive(1, b"req", Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, FramingError::Timeout));
    }
}
