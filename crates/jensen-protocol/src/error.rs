//! Error taxonomy shared across the protocol stack.
//!
//! Every leaf module (transport, framing, codec, file-list parser,
//! streaming engine) returns its own `thiserror` enum so call sites can
//! match on the specific failure. [`ErrorKind`] is the coarser
//! classification the façade and recovery ladder actually branch on;
//! every leaf error maps to exactly one kind via [`DeviceError::kind`].

use thiserror::Error;

use crate::{
    codec::CodecError, file_list::FileListError, framing::FramingError, streaming::StreamError,
};

/// Coarse error classification used for retry/recovery decisions.
///
/// This is deliberately flatter than the leaf error enums: a caller
/// deciding whether to retry a command only needs to know "was this a
/// timeout", not which specific field failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransportTimeout,
    TransportIo,
    FramingDesync,
    FramingUnexpectedResponse,
    ProtocolDeviceError,
    OperationInProgress,
    NotFound,
    Cancelled,
    FileIo,
    RecoveryFailed,
}

/// Top-level error returned by the device façade.
///
/// Wraps a leaf error while preserving enough context (operation kind,
/// filename) for the caller to report something useful, without losing
/// the [`ErrorKind`] the recovery ladder needs.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("file list error: {0}")]
    FileList(#[from] FileListError),

    #[error("streaming error: {0}")]
    Stream(#[from] StreamError),

    #[error("device reported a non-zero result code {code} for {operation}")]
    DeviceSignalled { operation: &'static str, code: u8 },

    #[error("operation already in progress: {0}")]
    OperationInProgress(&'static str),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("host-side I/O failed: {0}")]
    FileIo(#[from] std::io::Error),

    #[error("recovery failed after exhausting the reset/reconnect ladder")]
    RecoveryFailed,

    #[error("unexpected response command id {got:#06x}, expected {expected:#06x}")]
    UnexpectedResponse { expected: u16, got: u16 },

    #[error("no device is currently connected")]
    NotConnected,
}

impl DeviceError {
    /// Coarse classification used by the recovery ladder and by callers
    /// deciding whether a failure is worth retrying.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Transport(TransportError::Timeout) => ErrorKind::TransportTimeout,
            DeviceError::Transport(_) => ErrorKind::TransportIo,
            DeviceError::Framing(FramingError::Desync(_)) => ErrorKind::FramingDesync,
            DeviceError::Framing(_) => ErrorKind::FramingUnexpectedResponse,
            DeviceError::Codec(_) => ErrorKind::ProtocolDeviceError,
            DeviceError::FileList(_) => ErrorKind::FramingDesync,
            DeviceError::Stream(StreamError::Cancelled) => ErrorKind::Cancelled,
            DeviceError::Stream(StreamError::Timeout { .. }) => ErrorKind::TransportTimeout,
            DeviceError::Stream(_) => ErrorKind::FramingUnexpectedResponse,
            DeviceError::DeviceSignalled { .. } => ErrorKind::ProtocolDeviceError,
            DeviceError::OperationInProgress(_) => ErrorKind::OperationInProgress,
            DeviceError::NotFound(_) => ErrorKind::NotFound,
            DeviceError::Cancelled => ErrorKind::Cancelled,
            DeviceError::FileIo(_) => ErrorKind::FileIo,
            DeviceError::RecoveryFailed => ErrorKind::RecoveryFailed,
            DeviceError::UnexpectedResponse { .. } => ErrorKind::FramingUnexpectedResponse,
            DeviceError::NotConnected => ErrorKind::TransportIo,
        }
    }
}

/// Errors raised by the USB transport layer.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("no HiDock device found")]
    NoDeviceFound,
    #[error("failed to open usb device: {0}")]
    OpenFailed(String),
    #[error("failed to claim interface: {0}")]
    ClaimFailed(String),
    #[error("transport timed out")]
    Timeout,
    #[error("bulk transfer failed: {0}")]
    BulkTransferFailed(String),
    #[error("device is not open")]
    NotOpen,
}
