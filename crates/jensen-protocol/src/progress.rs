//! Progress and cancellation primitives.
//!
//! These are the stable types an external collaborator (GUI, metadata
//! indexer) programs against. Nothing in this module touches USB or
//! framing; it is pure bookkeeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ErrorKind;

/// What kind of operation a [`ProgressEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    List,
    Download,
    Delete,
    Format,
    SyncTime,
    GetInfo,
    GetStorage,
    GetCurrentRecording,
    GetFileBlock,
}

/// Lifecycle status of an [`crate::device::Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// A single structured progress update.
///
/// Progress is monotonic non-decreasing within one operation; exactly
/// one terminal event is emitted per operation.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub operation_id: u64,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub progress: f32,
    pub bytes_processed: Option<u64>,
    pub error: Option<ErrorKind>,
}

impl ProgressEvent {
    pub fn started(operation_id: u64, kind: OperationKind) -> Self {
        Self {
            operation_id,
            kind,
            status: OperationStatus::InProgress,
            progress: 0.0,
            bytes_processed: None,
            error: None,
        }
    }

    pub fn advanced(operation_id: u64, kind: OperationKind, progress: f32, bytes: u64) -> Self {
        Self {
            operation_id,
            kind,
            status: OperationStatus::InProgress,
            progress: progress.clamp(0.0, 1.0),
            bytes_processed: Some(bytes),
            error: None,
        }
    }

    pub fn completed(operation_id: u64, kind: OperationKind, bytes: Option<u64>) -> Self {
        Self {
            operation_id,
            kind,
            status: OperationStatus::Completed,
            progress: 1.0,
            bytes_processed: bytes,
            error: None,
        }
    }

    pub fn cancelled(operation_id: u64, kind: OperationKind) -> Self {
        Self {
            operation_id,
            kind,
            status: OperationStatus::Cancelled,
            progress: 0.0,
            bytes_processed: None,
            error: Some(ErrorKind::Cancelled),
        }
    }

    pub fn failed(operation_id: u64, kind: OperationKind, error: ErrorKind) -> Self {
        Self {
            operation_id,
            kind,
            status: OperationStatus::Failed,
            progress: 0.0,
            bytes_processed: None,
            error: Some(error),
        }
    }
}

/// A shared, observable cancellation flag.
///
/// Cheap to clone; every clone shares the same underlying flag. Checked
/// between streaming chunks, never mid-transfer.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_shares_state_across_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn progress_event_progress_is_clamped() {
        let ev = ProgressEvent::advanced(1, OperationKind::Download, 1.5, 100);
        assert_eq!(ev.progress, 1.0);
        let ev = ProgressEvent::advanced(1, OperationKind::Download, -0.5, 0);
        assert_eq!(ev.progress, 0.0);
    }
}
