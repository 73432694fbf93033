//! Command codec: command ids and per-command body layouts.
//!
//! This module is the single source of truth for wire body layouts.
//! All multi-byte numeric fields are big-endian unless noted. Callers
//! never hand-encode a body themselves — they go through the `encode_*`
//! functions here, and decode responses through the matching `decode_*`.

use thiserror::Error;

/// Command ids. Names are symbolic, not the device's actual numeric
/// values (which HiDock has never published) — any assignment that is
/// internally consistent and stable works, since both sides of the
/// encode/decode boundary live in this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandId {
    GetDeviceInfo = 0x0001,
    GetStorageInfo = 0x0002,
    GetFileCount = 0x0003,
    GetFileList = 0x0004,
    GetFileBlock = 0x0005,
    StreamFile = 0x0006,
    DeleteFile = 0x0007,
    FormatStorage = 0x0008,
    SetDeviceTime = 0x0009,
    GetCurrentRecording = 0x000A,
}

impl CommandId {
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

#[derive(Error, Debug, Clone)]
pub enum CodecError {
    #[error("response body too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("response body is not valid ASCII")]
    NotAscii,
}

/// Parsed `GetDeviceInfo` response: serial number + firmware version code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfoBody {
    pub serial_number: String,
    pub version_code: u32,
}

pub fn decode_device_info(body: &[u8]) -> Result<DeviceInfoBody, CodecError> {
    let nul_pos = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    let serial_bytes = &body[..nul_pos];
    let serial_number = String::from_utf8_lossy(serial_bytes).into_owned();

    let version_start = nul_pos + 1;
    if body.len() < version_start + 4 {
        return Err(CodecError::TooShort {
            need: version_start + 4,
            got: body.len(),
        });
    }
    let version_code = u32::from_be_bytes([
        body[version_start],
        body[version_start + 1],
        body[version_start + 2],
        body[version_start + 3],
    ]);

    Ok(DeviceInfoBody {
        serial_number,
        version_code,
    })
}

/// Parsed `GetStorageInfo` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageInfoBody {
    pub capacity_mb: u32,
    pub used_mb: u32,
    pub status_byte: u8,
}

pub fn decode_storage_info(body: &[u8]) -> Result<StorageInfoBody, CodecError> {
    if body.len() < 9 {
        return Err(CodecError::TooShort { need: 9, got: body.len() });
    }
    Ok(StorageInfoBody {
        capacity_mb: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
        used_mb: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
        status_byte: body[8],
    })
}

/// `GetFileCount` response: empty body means zero.
pub fn decode_file_count(body: &[u8]) -> Result<u32, CodecError> {
    if body.is_empty() {
        return Ok(0);
    }
    if body.len() < 4 {
        return Err(CodecError::TooShort { need: 4, got: body.len() });
    }
    Ok(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
}

/// Builds the `GetFileBlock` request body: offset, length, filename.
pub fn encode_file_block_request(offset: u32, length: u32, name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + name.len());
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(name.as_bytes());
    out
}

/// Builds the `StreamFile`/`DeleteFile` request body: just the name.
pub fn encode_name_request(name: &str) -> Vec<u8> {
    name.as_bytes().to_vec()
}

/// Result of `DeleteFile`/`FormatStorage`: a single result byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    NotExists,
    Failed,
}

impl ResultCode {
    pub fn code(self) -> u8 {
        match self {
            ResultCode::Success => 0,
            ResultCode::NotExists => 1,
            ResultCode::Failed => 2,
        }
    }
}

/// Decodes a single-byte result code. An empty body is treated as
/// `Failed` (code 2) — matching the original device adapter's behavior
/// of defaulting to failure rather than panicking on a short response.
pub fn decode_result_code(body: &[u8]) -> ResultCode {
    match body.first() {
        Some(0) => ResultCode::Success,
        Some(1) => ResultCode::NotExists,
        _ => ResultCode::Failed,
    }
}

/// Encodes the 8-byte device-clock payload for `SetDeviceTime`:
/// year (u16), month, day, hour, minute, second, reserved.
pub fn encode_device_time(dt: &chrono::NaiveDateTime) -> [u8; 8] {
    use chrono::{Datelike, Timelike};
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&(dt.year() as u16).to_be_bytes());
    out[2] = dt.month() as u8;
    out[3] = dt.day() as u8;
    out[4] = dt.hour() as u8;
    out[5] = dt.minute() as u8;
    out[6] = dt.second() as u8;
    out[7] = 0;
    out
}

/// `GetCurrentRecording` response: an ASCII filename, or an empty body
/// meaning nothing is currently recording.
pub fn decode_current_recording(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(body).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_info_roundtrip() {
        let mut body = b"ABC123".to_vec();
        body.push(0);
        body.extend_from_slice(&65537u32.to_be_bytes());
        let parsed = decode_device_info(&body).unwrap();
        assert_eq!(parsed.serial_number, "ABC123");
        assert_eq!(parsed.version_code, 65537);
    }

    #[test]
    fn storage_info_derives_free_from_used_and_capacity() {
        let mut body = Vec::new();
        body.extend_from_slice(&1000u32.to_be_bytes());
        body.extend_from_slice(&400u32.to_be_bytes());
        body.push(0);
        let parsed = decode_storage_info(&body).unwrap();
        assert_eq!(parsed.capacity_mb - parsed.used_mb, 600);
    }

    #[test]
    fn file_count_empty_body_is_zero() {
        assert_eq!(decode_file_count(&[]).unwrap(), 0);
    }

    #[test]
    fn file_block_request_layout() {
        let body = encode_file_block_request(1000, 500, "test.wav");
        let expected: Vec<u8> = 1000u32
            .to_be_bytes()
            .into_iter()
            .chain(500u32.to_be_bytes())
            .chain(b"test.wav".iter().copied())
            .collect();
        assert_eq!(body, expected);
    }

    #[test]
    fn delete_result_codes() {
        assert_eq!(decode_result_code(&[0]), ResultCode::Success);
        assert_eq!(decode_result_code(&[1]), ResultCode::NotExists);
        assert_eq!(decode_result_code(&[2]), ResultCode::Failed);
        assert_eq!(decode_result_code(&[]), ResultCode::Failed);
    }

    #[test]
    fn current_recording_empty_is_none() {
        assert_eq!(decode_current_recording(&[]), None);
        assert_eq!(
            decode_current_recording(b"rec.wav"),
            Some("rec.wav".to_string())
        );
    }
}
