//! Streaming engine for `StreamFile` downloads.
//!
//! A single download pulls an unknown number of response frames, all
//! sharing the request's sequence number, until either the declared
//! byte length is reached or the device signals completion with an
//! empty-body frame. An empty body seen *before* the declared length is
//! ambiguous — it may just mean the device hasn't buffered the next
//! block yet — so it gets a bounded, short-sleep retry rather than
//! being treated as EOF.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::codec::encode_name_request;
use crate::framing::{Framing, FramingError};
use crate::progress::{CancellationToken, OperationKind, ProgressEvent};
use crate::transport::Transport;

const MAX_EMPTY_BODY_RETRIES: u32 = 3;
const EMPTY_BODY_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Error, Debug, Clone)]
pub enum StreamError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("operation cancelled")]
    Cancelled,
    #[error("stream timed out after receiving {received} of {expected} bytes")]
    Timeout { received: u64, expected: u64 },
    #[error("stream ended early after {received} of {expected} declared bytes")]
    Incomplete { received: u64, expected: u64 },
    #[error("unexpected response command id {got:#06x}, expected {expected:#06x}")]
    UnexpectedResponse { expected: u16, got: u16 },
}

/// Streams one file's bytes over `framing`. `expected_length` is the
/// declared size from the file-list record; `cancel` is polled between
/// received chunks, never mid-read. On any non-`Ok` outcome the IN
/// endpoint is flushed before returning, but the flush itself can never
/// change which error is reported.
pub fn stream_file<T: Transport>(
    framing: &mut Framing<T>,
    command_id: u16,
    name: &str,
    expected_length: u64,
    overall_timeout: Duration,
    operation_id: u64,
    cancel: Option<&CancellationToken>,
    mut on_progress: impl FnMut(ProgressEvent),
) -> Result<Vec<u8>, StreamError> {
    let result = stream_file_inner(
        framing,
        command_id,
        name,
        expected_length,
        overall_timeout,
        operation_id,
        cancel,
        &mut on_progress,
    );
    if result.is_err() {
        framing.flush_in(Duration::from_millis(500));
    }
    result
}

fn stream_file_inner<T: Transport>(
    framing: &mut Framing<T>,
    command_id: u16,
    name: &str,
    expected_length: u64,
    overall_timeout: Duration,
    operation_id: u64,
    cancel: Option<&CancellationToken>,
    on_progress: &mut impl FnMut(ProgressEvent),
) -> Result<Vec<u8>, StreamError> {
    let sequence = framing.send_request(command_id, &encode_name_request(name))?;
    let deadline = Instant::now() + overall_timeout;

    on_progress(ProgressEvent::started(operation_id, OperationKind::Download));

    let mut received: Vec<u8> = Vec::with_capacity(expected_length as usize);
    let mut empty_body_retries = 0u32;

    loop {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                on_progress(ProgressEvent::cancelled(operation_id, OperationKind::Download));
                return Err(StreamError::Cancelled);
            }
        }

        let frame = match framing.receive_until(deadline)? {
            Some(frame) => frame,
            None => {
                return Err(StreamError::Timeout {
                    received: received.len() as u64,
                    expected: expected_length,
                });
            }
        };

        if frame.sequence != sequence {
            log::warn!("dropping stream frame with unmatched sequence {}", frame.sequence);
            continue;
        }
        if frame.command_id != command_id {
            return Err(StreamError::UnexpectedResponse {
                expected: command_id,
                got: frame.command_id,
            });
        }

        if frame.body.is_empty() {
            if received.len() as u64 >= expected_length {
                on_progress(ProgressEvent::completed(
                    operation_id,
                    OperationKind::Download,
                    Some(received.len() as u64),
                ));
                return Ok(received);
            }
            empty_body_retries += 1;
            if empty_body_retries > MAX_EMPTY_BODY_RETRIES {
                return Err(StreamError::Incomplete {
                    received: received.len() as u64,
                    expected: expected_length,
                });
            }
            std::thread::sleep(EMPTY_BODY_RETRY_DELAY);
            continue;
        }

        empty_body_retries = 0;
        received.extend_from_slice(&frame.body);
        let progress = if expected_length > 0 {
            received.len() as f32 / expected_length as f32
        } else {
            0.0
        };
        on_progress(ProgressEvent::advanced(
            operation_id,
            OperationKind::Download,
            progress,
            received.len() as u64,
        ));

        if received.len() as u64 >= expected_length {
            on_progress(ProgressEvent::completed(
                operation_id,
                OperationKind::Download,
                Some(received.len() as u64),
            ));
            return Ok(received);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::encode;
    use crate::transport::fake::FakeTransport;

    const CMD: u16 = 0x0006;

    #[test]
    fn completes_when_declared_length_is_reached() {
        let transport = FakeTransport::with_inbound(vec![encode(CMD, 0, b"hello")]);
        let mut framing = Framing::new(transport);
        let mut events = Vec::new();
        let result = stream_file(
            &mut framing,
            CMD,
            "f.wav",
            5,
            Duration::from_secs(1),
            1,
            None,
            |ev| events.push(ev.status),
        )
        .unwrap();
        assert_eq!(result, b"hello");
        assert!(events.last().is_some());
    }

    #[test]
    fn completes_on_empty_body_after_declared_length() {
        let transport = FakeTransport::with_inbound(vec![
            encode(CMD, 0, b"hel"),
            encode(CMD, 0, b"lo"),
            encode(CMD, 0, b""),
        ]);
        let mut framing = Framing::new(transport);
        let result = stream_file(
            &mut framing,
            CMD,
            "f.wav",
            5,
            Duration::from_secs(1),
            1,
            None,
            |_| {},
        )
        .unwrap();
        assert_eq!(result, b"hello");
    }

    #[test]
    fn empty_body_before_declared_length_retries_then_gives_up() {
        let mut inbound = vec![encode(CMD, 0, b"ab")];
        for _ in 0..(MAX_EMPTY_BODY_RETRIES + 1) {
            inbound.push(encode(CMD, 0, b""));
        }
        let transport = FakeTransport::with_inbound(inbound);
        let mut framing = Framing::new(transport);
        let err = stream_file(
            &mut framing,
            CMD,
            "f.wav",
            10,
            Duration::from_secs(1),
            1,
            None,
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, StreamError::Incomplete { received: 2, expected: 10 }));
    }

    #[test]
    fn cancellation_is_observed_between_chunks() {
        let transport = FakeTransport::with_inbound(vec![encode(CMD, 0, b"partial")]);
        let mut framing = Framing::new(transport);
        let token = CancellationToken::new();
        token.cancel();
        let err = stream_file(
            &mut framing,
            CMD,
            "f.wav",
            100,
            Duration::from_secs(1),
            1,
            Some(&token),
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, StreamError::Cancelled));
    }

    #[test]
    fn timeout_reports_bytes_received_so_far() {
        let transport = FakeTransport::with_inbound(vec![encode(CMD, 0, b"ab")]);
        let mut framing = Framing::new(transport);
        let err = stream_file(
            &mut framing,
            CMD,
            "f.wav",
            100,
            Duration::from_millis(50),
            1,
            None,
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, StreamError::Timeout { received: 2, expected: 100 }));
    }
}
