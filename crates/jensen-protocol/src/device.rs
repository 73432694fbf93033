//! The async device façade: the one public surface a consumer
//! (CLI, GUI, metadata indexer) programs against.
//!
//! All device I/O is blocking under the hood (USB bulk transfers,
//! [`crate::framing::Framing`]), so every method here hands the actual
//! work to [`tokio::task::spawn_blocking`] and awaits it. The façade
//! itself only ever holds a single [`Framing`] behind a mutex — there is
//! exactly one conversation with the device at a time, which is also
//! what makes the file-list-streaming exclusivity guard necessary:
//! nothing else may address the device while a chunked list is in
//! flight.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::capabilities::{self, DeviceCapability, DeviceModel};
use crate::codec::{
    self, CommandId, DeviceInfoBody, ResultCode, StorageInfoBody,
};
use crate::error::DeviceError;
use crate::file_list::{FileListParser, FileRecord};
use crate::framing::Framing;
use crate::health::{self, ConnectionStats, ConnectionStatsSnapshot, DeviceHealth};
use crate::progress::{CancellationToken, OperationKind, ProgressEvent};
use crate::streaming;
use crate::transport::{DeviceDescriptor, RusbTransport, Transport};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const FILE_LIST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(180);

struct FacadeState<T: Transport> {
    framing: Option<Framing<T>>,
    descriptor: Option<DeviceDescriptor>,
    model: DeviceModel,
    stats: ConnectionStats,
    cached_device_info: Option<DeviceInfoBody>,
    cached_storage_info: Option<StorageInfoBody>,
    file_list_streaming: bool,
}

impl<T: Transport> Default for FacadeState<T> {
    fn default() -> Self {
        Self {
            framing: None,
            descriptor: None,
            model: DeviceModel::Unknown,
            stats: ConnectionStats::default(),
            cached_device_info: None,
            cached_storage_info: None,
            file_list_streaming: false,
        }
    }
}

/// High-level, connection-oriented API over the Jensen protocol stack.
/// Generic over [`Transport`] so tests can drive it against
/// [`crate::transport::fake::FakeTransport`] instead of real hardware;
/// production code uses the default [`RusbTransport`].
pub struct DeviceFacade<T: Transport = RusbTransport> {
    state: Arc<Mutex<FacadeState<T>>>,
    next_operation_id: AtomicU64,
}

impl<T: Transport + 'static> Default for DeviceFacade<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport + 'static> DeviceFacade<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FacadeState::default())),
            next_operation_id: AtomicU64::new(1),
        }
    }

    fn next_operation_id(&self) -> u64 {
        self.next_operation_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.framing.is_some()
    }

    pub async fn get_capabilities(&self) -> Vec<DeviceCapability> {
        let model = self.state.lock().await.model;
        capabilities::get_model_capabilities(model)
    }

    pub async fn get_stats(&self) -> ConnectionStatsSnapshot {
        health::assess(&self.state.lock().await.stats, true).stats
    }

    pub async fn get_health(&self) -> DeviceHealth {
        let state = self.state.lock().await;
        let connected = state.framing.is_some();
        health::assess(&state.stats, connected)
    }

    /// Drops the current list-streaming guard and cached per-connection
    /// state without touching the transport itself — used after a
    /// caller-observed protocol error to give the next command a clean
    /// slate before deciding whether full recovery is needed.
    pub async fn reset_device_state(&self) {
        let mut state = self.state.lock().await;
        state.file_list_streaming = false;
        state.cached_device_info = None;
        state.cached_storage_info = None;
    }

    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.framing = None;
        state.descriptor = None;
        state.model = DeviceModel::Unknown;
        state.cached_device_info = None;
        state.cached_storage_info = None;
        state.file_list_streaming = false;
    }

    /// Runs `f` against the current framing layer on a blocking thread,
    /// recording the outcome in the connection stats. Returns
    /// [`DeviceError::NotConnected`] if nothing is connected.
    async fn with_framing<R, F>(&self, f: F) -> Result<R, DeviceError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Framing<T>) -> Result<R, DeviceError> + Send + 'static,
        T: Send,
    {
        let state = self.state.clone();
        let started = Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = state.blocking_lock();
            match guard.framing.as_mut() {
                Some(framing) => f(framing),
                None => Err(DeviceError::NotConnected),
            }
        })
        .await
        .expect("blocking task panicked");
        let elapsed = started.elapsed();

        let mut state = self.state.lock().await;
        match &result {
            Ok(_) => state.stats.record_success(0, elapsed),
            Err(_) => state.stats.record_failure(elapsed),
        }
        result
    }
}

impl DeviceFacade<RusbTransport> {
    pub fn discover() -> Vec<DeviceDescriptor> {
        RusbTransport::enumerate()
    }

    pub async fn connect(&self, descriptor: DeviceDescriptor, force_reset: bool) -> Result<(), DeviceError> {
        let model = capabilities::detect_device_model(descriptor.vendor_id, descriptor.product_id);
        let opened = tokio::task::spawn_blocking({
            let descriptor = descriptor.clone();
            move || RusbTransport::open(&descriptor, force_reset)
        })
        .await
        .expect("blocking task panicked")?;

        let mut state = self.state.lock().await;
        state.framing = Some(Framing::new(opened));
        state.descriptor = Some(descriptor);
        state.model = model;
        state.stats.reset();
        Ok(())
    }

    /// Recovery ladder: first try a soft reset — drop cached
    /// per-connection state and zero the sequence counter, then confirm
    /// the device still answers. If that doesn't restore a healthy
    /// state, disconnect and reconnect with a forced USB reset (errors
    /// during disconnect are ignored, since the connection is assumed
    /// dead already); recovery fails if that reconnect can't produce
    /// device info. Each step runs at most once per call.
    pub async fn recover_from_error(&self) -> bool {
        let descriptor = { self.state.lock().await.descriptor.clone() };
        let Some(descriptor) = descriptor else {
            return false;
        };

        debug_assert_eq!(health::next_recovery_step(0), health::RecoveryStep::SoftReset);
        let reset = self
            .with_framing(|framing| {
                framing.reset_sequence();
                Ok(())
            })
            .await;
        if reset.is_ok() {
            {
                let mut state = self.state.lock().await;
                state.cached_device_info = None;
                state.cached_storage_info = None;
            }
            if self.fetch_device_info().await.is_ok() {
                return true;
            }
        }

        debug_assert_eq!(
            health::next_recovery_step(1),
            health::RecoveryStep::ReconnectWithForcedReset
        );
        // `disconnect` is infallible by construction; any failure mode a
        // transport could raise here is already folded into "connect
        // fails below", so there's nothing to catch.
        self.disconnect().await;
        if self.connect(descriptor.clone(), true).await.is_err() {
            return false;
        }
        self.fetch_device_info().await.is_ok()
    }

    /// Always hits the wire, bypassing the device-info cache — used by
    /// the recovery ladder to confirm the device actually answers
    /// rather than trusting stale cached state.
    async fn fetch_device_info(&self) -> Result<DeviceInfoBody, DeviceError> {
        let info = self
            .with_framing(|framing| {
                let body = framing.send_and_receive(
                    CommandId::GetDeviceInfo.as_u16(),
                    &[],
                    DEFAULT_COMMAND_TIMEOUT,
                )?;
                Ok(codec::decode_device_info(&body)?)
            })
            .await?;
        self.state.lock().await.cached_device_info = Some(info.clone());
        Ok(info)
    }
}

impl<T: Transport + Send + 'static> DeviceFacade<T> {
    pub async fn get_device_info(&self) -> Result<DeviceInfoBody, DeviceError> {
        if let Some(cached) = self.state.lock().await.cached_device_info.clone() {
            return Ok(cached);
        }
        let info = self
            .with_framing(|framing| {
                let body = framing.send_and_receive(
                    CommandId::GetDeviceInfo.as_u16(),
                    &[],
                    DEFAULT_COMMAND_TIMEOUT,
                )?;
                Ok(codec::decode_device_info(&body)?)
            })
            .await?;
        self.state.lock().await.cached_device_info = Some(info.clone());
        Ok(info)
    }

    /// During an active file-list stream the framing layer can't take
    /// another request, so this returns the last known storage info, or
    /// a safe zeroed placeholder if none has been fetched yet — a list
    /// stream in progress must never surface as an error here.
    pub async fn get_storage_info(&self) -> Result<StorageInfoBody, DeviceError> {
        {
            let state = self.state.lock().await;
            if state.file_list_streaming {
                return Ok(state.cached_storage_info.unwrap_or(StorageInfoBody {
                    capacity_mb: 0,
                    used_mb: 0,
                    status_byte: 0,
                }));
            }
        }
        let info = self
            .with_framing(|framing| {
                let body = framing.send_and_receive(
                    CommandId::GetStorageInfo.as_u16(),
                    &[],
                    DEFAULT_COMMAND_TIMEOUT,
                )?;
                Ok(codec::decode_storage_info(&body)?)
            })
            .await?;
        self.state.lock().await.cached_storage_info = Some(info);
        Ok(info)
    }

    /// Lists recordings on the device. Holds the file-list-streaming
    /// guard for the duration so `get_storage_info`/`get_current_recording_filename`
    /// fall back to cached state instead of racing this conversation.
    pub async fn get_recordings(&self) -> Result<Vec<FileRecord>, DeviceError> {
        {
            let mut state = self.state.lock().await;
            if state.file_list_streaming {
                return Err(DeviceError::OperationInProgress("file list streaming"));
            }
            state.file_list_streaming = true;
        }

        let result = self
            .with_framing(|framing| {
                let sequence =
                    framing.send_request(CommandId::GetFileList.as_u16(), &[])?;
                let deadline = Instant::now() + FILE_LIST_TIMEOUT;
                let mut parser = FileListParser::new();

                loop {
                    match framing.receive_until(deadline)? {
                        None => break,
                        Some(frame) if frame.sequence != sequence => continue,
                        Some(frame) if frame.command_id != CommandId::GetFileList.as_u16() => {
                            return Err(DeviceError::UnexpectedResponse {
                                expected: CommandId::GetFileList.as_u16(),
                                got: frame.command_id,
                            });
                        }
                        Some(frame) if frame.body.is_empty() => break,
                        Some(frame) => {
                            parser.feed(&frame.body)?;
                            if parser.is_complete() {
                                break;
                            }
                        }
                    }
                }

                Ok(parser.finish()?)
            })
            .await;

        self.state.lock().await.file_list_streaming = false;
        result
    }

    /// Fetches the device's reported file count directly, bypassing the
    /// full file-list stream. Returns `None` while a file-list stream is
    /// active, on a mismatched response command id, or on any transport
    /// error — mirroring the original adapter's `get_file_count`, which
    /// never raises.
    pub async fn get_file_count(&self) -> Option<u32> {
        if self.state.lock().await.file_list_streaming {
            return None;
        }
        self.with_framing(|framing| {
            let body = framing.send_and_receive(
                CommandId::GetFileCount.as_u16(),
                &[],
                DEFAULT_COMMAND_TIMEOUT,
            )?;
            Ok(codec::decode_file_count(&body)?)
        })
        .await
        .ok()
    }

    /// Best-effort lookup of the filename currently being recorded, if
    /// any. Errors (including "nothing is recording") are swallowed
    /// into `None` rather than propagated, matching the original
    /// adapter's "this is advisory, never block on it" behavior.
    pub async fn get_current_recording_filename(&self) -> Option<String> {
        if self.state.lock().await.file_list_streaming {
            return None;
        }
        self.with_framing(|framing| {
            let body = framing.send_and_receive(
                CommandId::GetCurrentRecording.as_u16(),
                &[],
                DEFAULT_COMMAND_TIMEOUT,
            )?;
            Ok(codec::decode_current_recording(&body))
        })
        .await
        .ok()
        .flatten()
    }

    /// Downloads `name` (of declared `length` bytes) to `dest`,
    /// reporting progress and honoring cancellation between chunks.
    /// `stream_timeout` bounds the overall transfer; `None` falls back
    /// to [`DEFAULT_STREAM_TIMEOUT`].
    pub async fn download(
        &self,
        name: String,
        length: u64,
        dest: &Path,
        stream_timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
        on_progress: impl FnMut(ProgressEvent) + Send + 'static,
    ) -> Result<(), DeviceError> {
        let operation_id = self.next_operation_id();
        let stream_timeout = stream_timeout.unwrap_or(DEFAULT_STREAM_TIMEOUT);
        let mut on_progress = on_progress;
        let bytes = self
            .with_framing(move |framing| {
                Ok(streaming::stream_file(
                    framing,
                    CommandId::StreamFile.as_u16(),
                    &name,
                    length,
                    stream_timeout,
                    operation_id,
                    cancel.as_ref(),
                    &mut on_progress,
                )?)
            })
            .await?;
        std::fs::write(dest, bytes)?;
        Ok(())
    }

    /// Rejected with [`DeviceError::OperationInProgress`] while a file
    /// list is streaming, since the device can't field a second request
    /// mid-list.
    pub async fn delete(&self, name: String) -> Result<ResultCode, DeviceError> {
        if self.state.lock().await.file_list_streaming {
            return Err(DeviceError::OperationInProgress("file list streaming"));
        }
        self.with_framing(move |framing| {
            let body = framing.send_and_receive(
                CommandId::DeleteFile.as_u16(),
                &codec::encode_name_request(&name),
                DEFAULT_COMMAND_TIMEOUT,
            )?;
            Ok(codec::decode_result_code(&body))
        })
        .await
    }

    /// The wire exchange is a single request/response, but formatting a
    /// device is long-running from a caller's perspective, so
    /// `on_progress` fires once before the request and once with the
    /// result.
    pub async fn format_storage(
        &self,
        operation_id: u64,
        mut on_progress: impl FnMut(ProgressEvent) + Send + 'static,
    ) -> Result<ResultCode, DeviceError> {
        on_progress(ProgressEvent::started(operation_id, OperationKind::Format));
        let result = self
            .with_framing(|framing| {
                let body = framing.send_and_receive(
                    CommandId::FormatStorage.as_u16(),
                    &[],
                    Duration::from_secs(30),
                )?;
                Ok(codec::decode_result_code(&body))
            })
            .await;
        match &result {
            Ok(_) => on_progress(ProgressEvent::completed(operation_id, OperationKind::Format, None)),
            Err(e) => on_progress(ProgressEvent::failed(operation_id, OperationKind::Format, e.kind())),
        }
        result
    }

    /// Sets the device clock. `at` defaults to the host's current local
    /// time when absent.
    pub async fn sync_time(&self, at: Option<chrono::NaiveDateTime>) -> Result<(), DeviceError> {
        let dt = at.unwrap_or_else(|| chrono::Local::now().naive_local());
        self.with_framing(move |framing| {
            let body = codec::encode_device_time(&dt);
            framing.send_and_receive(
                CommandId::SetDeviceTime.as_u16(),
                &body,
                DEFAULT_COMMAND_TIMEOUT,
            )?;
            Ok(())
        })
        .await
    }

    /// Raw block read by offset/length. A response whose command id
    /// doesn't match `GetFileBlock` is treated as "nothing came back"
    /// rather than an error.
    pub async fn get_file_block(
        &self,
        name: String,
        offset: u32,
        length: u32,
    ) -> Result<Vec<u8>, DeviceError> {
        self.with_framing(move |framing| {
            let sequence = framing.send_request(
                CommandId::GetFileBlock.as_u16(),
                &codec::encode_file_block_request(offset, length, &name),
            )?;
            let deadline = Instant::now() + DEFAULT_COMMAND_TIMEOUT;
            loop {
                match framing.receive_until(deadline)? {
                    None => return Err(DeviceError::Framing(crate::framing::FramingError::Timeout)),
                    Some(frame) if frame.sequence != sequence => continue,
                    Some(frame) if frame.command_id != CommandId::GetFileBlock.as_u16() => {
                        return Ok(Vec::new());
                    }
                    Some(frame) => return Ok(frame.body),
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::encode;
    use crate::transport::fake::FakeTransport;

    async fn connected_facade(inbound: Vec<Vec<u8>>) -> DeviceFacade<FakeTransport> {
        let facade = DeviceFacade::<FakeTransport>::new();
        let mut state = facade.state.lock().await;
        state.framing = Some(Framing::new(FakeTransport::with_inbound(inbound)));
        state.model = DeviceModel::H1E;
        drop(state);
        facade
    }

    #[tokio::test]
    async fn get_device_info_is_cached_after_first_call() {
        let mut body = b"SN1".to_vec();
        body.push(0);
        body.extend_from_slice(&1u32.to_be_bytes());
        let facade = connected_facade(vec![encode(CommandId::GetDeviceInfo.as_u16(), 0, &body)]).await;

        let info = facade.get_device_info().await.unwrap();
        assert_eq!(info.serial_number, "SN1");

        // A second call must not need another device round trip: the
        // fake transport has no more inbound frames queued, so this
        // only succeeds if it read from the cache.
        let cached = facade.get_device_info().await.unwrap();
        assert_eq!(cached.serial_number, "SN1");
    }

    #[tokio::test]
    async fn not_connected_is_a_typed_error() {
        let facade = DeviceFacade::<FakeTransport>::new();
        let err = facade.get_device_info().await.unwrap_err();
        assert!(matches!(err, DeviceError::NotConnected));
    }

    #[tokio::test]
    async fn get_recordings_parses_the_full_list_and_releases_the_guard() {
        let mut list_body = vec![0xFFu8, 0xFF];
        list_body.extend_from_slice(&1u32.to_be_bytes());
        list_body.push(1); // version
        let name = b"a.wav";
        list_body.extend_from_slice(&(name.len() as u32).to_be_bytes()[1..]);
        list_body.extend_from_slice(name);
        list_body.extend_from_slice(&1000u32.to_be_bytes());
        list_body.extend_from_slice(&[0u8; 6]);
        list_body.extend_from_slice(&[0u8; 16]);

        let facade = connected_facade(vec![
            encode(CommandId::GetFileList.as_u16(), 0, &list_body),
            encode(CommandId::GetFileList.as_u16(), 0, b""),
        ])
        .await;

        let records = facade.get_recordings().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "a.wav");
        assert!(!facade.state.lock().await.file_list_streaming);
    }

    #[tokio::test]
    async fn get_capabilities_reflects_detected_model() {
        let facade = connected_facade(vec![]).await;
        let caps = facade.get_capabilities().await;
        assert!(caps.contains(&DeviceCapability::HealthMonitoring));
    }

    #[tokio::test]
    async fn get_file_count_empty_body_is_zero() {
        let facade = connected_facade(vec![encode(CommandId::GetFileCount.as_u16(), 0, b"")]).await;
        assert_eq!(facade.get_file_count().await, Some(0));
    }

    #[tokio::test]
    async fn get_file_count_is_none_while_list_streaming() {
        let facade = connected_facade(vec![]).await;
        facade.state.lock().await.file_list_streaming = true;
        assert_eq!(facade.get_file_count().await, None);
    }
}
