//! Audio chunker.
//!
//! Splits an oversized recording into upload-safe chunks no larger than
//! a caller-supplied byte budget, each padded with a small overlap so a
//! downstream transcriber doesn't lose words at a cut boundary. A file
//! that already fits under the budget is never copied: [`AudioChunker::plan`]
//! hands back a single chunk that references the source path directly
//! and is marked `cleanup: false` so the caller knows not to delete it.
//!
//! Interior chunk duration targets 80% of the byte cap rather than the
//! full cap, leaving headroom so each chunk stays under budget once the
//! next chunk's overlap is counted in. The target further adapts across
//! calls via a persisted size hint: if
//! the last chunk actually written came out smaller than the budget,
//! the next one is planned longer, and vice versa. If a written chunk
//! still comes out over the cap despite all that, the whole plan is
//! aborted and already-written chunks are removed — the caller can
//! retry with a smaller target.
//!
//! Segment extraction here is a raw byte-range copy of the source file
//! rather than a real audio re-encode — no audio codec crate is part of
//! this stack, and chunk boundaries are expected to land on frames the
//! device's own player tolerates. Re-encoding proper would slot in at
//! [`write_chunk`] without changing the planning logic around it.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use thiserror::Error;

use crate::progress::{CancellationToken, OperationKind, ProgressEvent};

/// Upload bitrate bounds: below 64kbps quality suffers badly,
/// above 192kbps chunks spend their byte budget on redundant bits.
const MIN_BITRATE_KBPS: u32 = 64;
const MAX_BITRATE_KBPS: u32 = 192;

/// Bounded concurrency for chunk writes.
const MAX_PARALLEL_WRITES: usize = 4;

/// Interior chunks target this fraction of the byte cap, leaving
/// headroom for the overlap padding added to both sides.
const EFFECTIVE_LIMIT_FACTOR: f64 = 0.8;

/// Floor on top of `overlap_ms` when clamping the planned chunk
/// duration, so a tiny cap/overlap combination doesn't collapse the
/// target to something no bigger than the overlap itself.
const MIN_CHUNK_OVER_OVERLAP_MS: u64 = 1000;

pub fn clamp_bitrate_kbps(kbps: u32) -> u32 {
    kbps.clamp(MIN_BITRATE_KBPS, MAX_BITRATE_KBPS)
}

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("I/O error while chunking: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunking cancelled")]
    Cancelled,
    #[error("chunk {index} came out to {actual_bytes} bytes, over the {cap} byte cap")]
    ChunkExceedsCap {
        index: usize,
        actual_bytes: usize,
        cap: usize,
    },
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    pub path: PathBuf,
    pub start_ms: u64,
    pub end_ms: u64,
    /// Whether the caller should remove this file once it's done with
    /// it. `false` for the zero-copy single-chunk case, where `path`
    /// references the original source file.
    pub cleanup: bool,
}

/// Persists the adaptive chunk-size multiplier across [`AudioChunker::plan`]
/// calls, e.g. across an entire session's worth of recordings.
pub struct AudioChunker {
    bitrate_kbps: u32,
    size_hint: Mutex<f64>,
}

impl AudioChunker {
    pub fn new(bitrate_kbps: u32) -> Self {
        Self {
            bitrate_kbps: clamp_bitrate_kbps(bitrate_kbps),
            size_hint: Mutex::new(1.0),
        }
    }

    fn bytes_per_ms(&self) -> f64 {
        (self.bitrate_kbps as f64 * 1000.0 / 8.0) / 1000.0
    }

    /// Plans and writes chunks for `input` (a file of `total_duration_ms`
    /// milliseconds) into `out_dir`, each no larger than `max_chunk_bytes`,
    /// with `overlap_ms` of backward/forward padding at interior
    /// boundaries. If `input`'s size is already at or under the cap,
    /// returns a single chunk referencing `input` directly (`cleanup:
    /// false`) without writing anything. On cancellation, or if a
    /// written chunk comes out over the cap, already-written chunk
    /// files are removed before returning the error.
    pub fn plan(
        &self,
        input: &Path,
        total_duration_ms: u64,
        max_chunk_bytes: usize,
        overlap_ms: u64,
        out_dir: &Path,
        operation_id: u64,
        cancel: Option<&CancellationToken>,
        mut on_progress: impl FnMut(ProgressEvent),
    ) -> Result<Vec<Chunk>, ChunkerError> {
        on_progress(ProgressEvent::started(operation_id, OperationKind::GetFileBlock));

        let source_bytes = std::fs::metadata(input)?.len() as usize;
        if source_bytes <= max_chunk_bytes {
            on_progress(ProgressEvent::completed(
                operation_id,
                OperationKind::GetFileBlock,
                Some(source_bytes as u64),
            ));
            return Ok(vec![Chunk {
                index: 0,
                path: input.to_path_buf(),
                start_ms: 0,
                end_ms: total_duration_ms,
                cleanup: false,
            }]);
        }

        std::fs::create_dir_all(out_dir)?;

        let bytes_per_ms = self.bytes_per_ms();
        let segments = self.plan_segments(total_duration_ms, max_chunk_bytes, overlap_ms, bytes_per_ms);

        let semaphore = Arc::new(BoundedSemaphore::new(MAX_PARALLEL_WRITES));
        let mut written: Vec<Chunk> = Vec::with_capacity(segments.len());
        let mut actual_sizes: Vec<usize> = Vec::with_capacity(segments.len());

        for (idx, segment) in segments.iter().enumerate() {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    cleanup(&written);
                    on_progress(ProgressEvent::cancelled(operation_id, OperationKind::GetFileBlock));
                    return Err(ChunkerError::Cancelled);
                }
            }

            let start_byte = (segment.start_ms as f64 * bytes_per_ms) as u64;
            let end_byte = (segment.end_ms as f64 * bytes_per_ms) as u64;
            let chunk_path = out_dir.join(format!("chunk_{idx:04}.bin"));

            let _permit = semaphore.acquire();
            let bytes_written = write_chunk(input, &chunk_path, start_byte, end_byte)?;

            written.push(Chunk {
                index: idx,
                path: chunk_path,
                start_ms: segment.start_ms,
                end_ms: segment.end_ms,
                cleanup: true,
            });

            if bytes_written > max_chunk_bytes {
                cleanup(&written);
                return Err(ChunkerError::ChunkExceedsCap {
                    index: idx,
                    actual_bytes: bytes_written,
                    cap: max_chunk_bytes,
                });
            }
            actual_sizes.push(bytes_written);

            on_progress(ProgressEvent::advanced(
                operation_id,
                OperationKind::GetFileBlock,
                (idx + 1) as f32 / segments.len().max(1) as f32,
                bytes_written as u64,
            ));
        }

        if let Some(&last) = actual_sizes.last() {
            self.update_size_hint(last, max_chunk_bytes);
        }

        on_progress(ProgressEvent::completed(operation_id, OperationKind::GetFileBlock, None));
        Ok(written)
    }

    /// Targets `EFFECTIVE_LIMIT_FACTOR` of the byte cap rather than the
    /// full cap, so a chunk spanning `chunk_ms` still has headroom
    /// below `max_chunk_bytes`. Each segment after the first starts
    /// `overlap_ms` before the previous one's end, so the overlap comes
    /// out of the step between chunks rather than padding a chunk's
    /// span beyond `chunk_ms`.
    fn plan_segments(
        &self,
        total_duration_ms: u64,
        max_chunk_bytes: usize,
        overlap_ms: u64,
        bytes_per_ms: f64,
    ) -> Vec<Segment> {
        let hint = *self.size_hint.lock().unwrap();
        let effective_limit_bytes = max_chunk_bytes as f64 * EFFECTIVE_LIMIT_FACTOR;
        let chunk_ms = ((effective_limit_bytes / bytes_per_ms) * hint)
            .max((overlap_ms + MIN_CHUNK_OVER_OVERLAP_MS) as f64) as u64;

        let mut segments = Vec::new();
        let mut start_ms = 0u64;
        while start_ms < total_duration_ms {
            let mut end_ms = (start_ms + chunk_ms).min(total_duration_ms);
            if end_ms <= start_ms {
                end_ms = (start_ms + overlap_ms + MIN_CHUNK_OVER_OVERLAP_MS).min(total_duration_ms);
            }
            segments.push(Segment { start_ms, end_ms });
            if end_ms >= total_duration_ms {
                break;
            }
            start_ms = end_ms.saturating_sub(overlap_ms);
        }
        segments
    }

    /// Adjusts the persisted multiplier toward the ratio of budget to
    /// what the last chunk actually used, damped so one outlier chunk
    /// doesn't swing future planning too hard.
    fn update_size_hint(&self, actual_bytes: usize, max_chunk_bytes: usize) {
        if actual_bytes == 0 {
            return;
        }
        let ratio = max_chunk_bytes as f64 / actual_bytes as f64;
        let mut hint = self.size_hint.lock().unwrap();
        *hint = (*hint * 0.7 + ratio * 0.3).clamp(0.25, 4.0);
    }
}

struct Segment {
    start_ms: u64,
    end_ms: u64,
}

fn write_chunk(input: &Path, out_path: &Path, start_byte: u64, end_byte: u64) -> Result<usize, std::io::Error> {
    let mut src = File::open(input)?;
    src.seek(SeekFrom::Start(start_byte))?;
    let len = end_byte.saturating_sub(start_byte) as usize;
    let mut buf = vec![0u8; len];
    let mut read_total = 0;
    while read_total < len {
        let n = src.read(&mut buf[read_total..])?;
        if n == 0 {
            break;
        }
        read_total += n;
    }
    buf.truncate(read_total);

    let mut out = File::create(out_path)?;
    out.write_all(&buf)?;
    Ok(buf.len())
}

fn cleanup(written: &[Chunk]) {
    for chunk in written {
        if chunk.cleanup {
            let _ = std::fs::remove_file(&chunk.path);
        }
    }
}

/// A counting semaphore bounding concurrent chunk writes. Plain
/// `Mutex`/`Condvar` rather than a crate dependency since this is the
/// only place in the stack that needs bounded fan-out off the main
/// thread.
struct BoundedSemaphore {
    state: Mutex<usize>,
    condvar: Condvar,
}

impl BoundedSemaphore {
    fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(permits),
            condvar: Condvar::new(),
        }
    }

    fn acquire(self: &Arc<Self>) -> SemaphorePermit {
        let mut permits = self.state.lock().unwrap();
        while *permits == 0 {
            permits = self.condvar.wait(permits).unwrap();
        }
        *permits -= 1;
        SemaphorePermit { semaphore: self.clone() }
    }
}

struct SemaphorePermit {
    semaphore: Arc<BoundedSemaphore>,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        let mut permits = self.semaphore.state.lock().unwrap();
        *permits += 1;
        self.semaphore.condvar.notify_one();
    }
}
