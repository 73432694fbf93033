//! Rust implementation of the HiDock Jensen device protocol stack: USB
//! transport, packet framing, command codec, chunked file-list parsing,
//! file streaming, health/recovery, and an async device façade, plus a
//! standalone audio chunker for oversize recordings.

pub mod capabilities;
pub mod chunker;
pub mod codec;
pub mod device;
pub mod error;
pub mod file_list;
pub mod framing;
pub mod health;
pub mod progress;
pub mod streaming;
pub mod transport;

pub use capabilities::{DeviceCapability, DeviceModel};
pub use chunker::{AudioChunker, Chunk, ChunkerError};
pub use codec::{CommandId, DeviceInfoBody, ResultCode, StorageInfoBody};
pub use device::DeviceFacade;
pub use error::{DeviceError, ErrorKind};
pub use file_list::FileRecord;
pub use health::{ConnectionStatsSnapshot, DeviceHealth, HealthStatus};
pub use progress::{CancellationToken, OperationKind, OperationStatus, ProgressEvent};
pub use transport::{DeviceDescriptor, RusbTransport};
