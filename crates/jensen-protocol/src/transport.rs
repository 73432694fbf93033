//! USB bulk transport.
//!
//! [`RusbTransport`] claims the HiDock device's bulk interface and
//! exposes raw `write`/`read`/`flush_in` over the bulk endpoints. It
//! knows nothing about Jensen framing — that's [`crate::framing`]'s job
//! — it only moves bytes.
//!
//! The [`Transport`] trait exists so the rest of the stack (framing,
//! streaming, health/recovery) can be exercised against an in-memory
//! fake without real hardware; see `transport::fake` under `#[cfg(test)]`.

use std::time::Duration;

use rusb::{Direction, GlobalContext, TransferType};

use crate::error::TransportError;

/// HiDock's USB vendor id.
pub const HIDOCK_VENDOR_ID: u16 = 0x10D6;

/// Known HiDock product ids, tried in order during discovery.
///
/// `0xAF0C`/`0xAF0D` are the H1 across hardware revisions, `0xAF0E` is
/// the P1, `0xB00D` is the H1E.
pub const HIDOCK_PRODUCT_IDS: &[u16] = &[0xAF0C, 0xAF0D, 0xAF0E, 0xB00D];

/// A USB device found during enumeration, not yet opened.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub bus_number: u8,
    pub address: u8,
}

impl DeviceDescriptor {
    /// `"vvvv:pppp"` id used to address this device in `connect(id)`.
    pub fn id(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Abstraction over bulk read/write so the upper layers can be tested
/// without a physical device attached.
pub trait Transport: Send {
    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Reads up to `max_len` bytes. A timeout is not an error here: it
    /// is reported as `Ok(vec![])`, which [`crate::framing::Framing`]
    /// treats as no data having arrived yet rather than a failure.
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Drains the IN endpoint for up to `deadline` or until two
    /// consecutive empty reads. Never surfaces an error.
    fn flush_in(&mut self, deadline: Duration) {
        let start = std::time::Instant::now();
        let mut consecutive_empty = 0;
        while start.elapsed() < deadline && consecutive_empty < 2 {
            match self.read(4096, Duration::from_millis(50)) {
                Ok(bytes) if bytes.is_empty() => consecutive_empty += 1,
                Ok(_) => consecutive_empty = 0,
                Err(_) => consecutive_empty += 1,
            }
        }
    }

    fn max_packet_size(&self) -> u16;
}

struct BulkEndpoints {
    interface_number: u8,
    in_address: u8,
    in_max_size: u16,
    out_address: u8,
}

/// An opened HiDock device, claimed and ready for bulk I/O.
pub struct RusbTransport {
    handle: rusb::DeviceHandle<GlobalContext>,
    endpoints: BulkEndpoints,
    kernel_driver_detached: bool,
}

impl RusbTransport {
    /// Enumerates every attached HiDock device. Backend errors (no
    /// libusb context, permission issues enumerating) yield an empty
    /// list rather than an error.
    pub fn enumerate() -> Vec<DeviceDescriptor> {
        let Ok(devices) = rusb::devices() else {
            return Vec::new();
        };

        let mut found = Vec::new();
        for device in devices.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() != HIDOCK_VENDOR_ID
                || !HIDOCK_PRODUCT_IDS.contains(&desc.product_id())
            {
                continue;
            }

            let serial_number = device
                .open()
                .ok()
                .and_then(|handle| handle.read_serial_number_string_ascii(&desc).ok());

            found.push(DeviceDescriptor {
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                serial_number,
                bus_number: device.bus_number(),
                address: device.address(),
            });
        }
        found
    }

    /// Opens `descriptor`, optionally issuing a USB reset first, claims
    /// the bulk interface, and locates the bulk IN/OUT endpoints.
    pub fn open(descriptor: &DeviceDescriptor, force_reset: bool) -> Result<Self, TransportError> {
        let devices = rusb::devices().map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        let device = devices
            .iter()
            .find(|d| d.bus_number() == descriptor.bus_number && d.address() == descriptor.address)
            .ok_or(TransportError::NoDeviceFound)?;

        let mut handle = device
            .open()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        if force_reset {
            let _ = handle.reset();
        }

        let mut kernel_driver_detached = false;
        let config = device
            .active_config_descriptor()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let mut endpoints = None;
        for interface in config.interfaces() {
            for interface_descriptor in interface.descriptors() {
                let mut in_info = None;
                let mut out_info = None;
                for endpoint in interface_descriptor.endpoint_descriptors() {
                    if endpoint.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match endpoint.direction() {
                        Direction::In => in_info = Some((endpoint.address(), endpoint.max_packet_size())),
                        Direction::Out => out_info = Some((endpoint.address(), endpoint.max_packet_size())),
                    }
                }

                if let (Some((in_address, in_max_size)), Some((out_address, _))) = (in_info, out_info) {
                    endpoints = Some(BulkEndpoints {
                        interface_number: interface_descriptor.interface_number(),
                        in_address,
                        in_max_size,
                        out_address,
                    });
                    break;
                }
            }
            if endpoints.is_some() {
                break;
            }
        }

        let endpoints = endpoints.ok_or_else(|| {
            TransportError::ClaimFailed("no bulk IN/OUT endpoint pair found".into())
        })?;

        if handle
            .kernel_driver_active(endpoints.interface_number)
            .unwrap_or(false)
        {
            handle
                .detach_kernel_driver(endpoints.interface_number)
                .map_err(|e| TransportError::ClaimFailed(e.to_string()))?;
            kernel_driver_detached = true;
        }

        handle
            .claim_interface(endpoints.interface_number)
            .map_err(|e| TransportError::ClaimFailed(e.to_string()))?;

        Ok(Self {
            handle,
            endpoints,
            kernel_driver_detached,
        })
    }
}

impl Transport for RusbTransport {
    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        self.handle
            .write_bulk(self.endpoints.out_address, bytes, timeout)
            .map_err(classify_rusb_error)
    }

    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; max_len];
        match self.handle.read_bulk(self.endpoints.in_address, &mut buf, timeout) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(rusb::Error::Timeout) => Ok(Vec::new()),
            Err(e) => Err(classify_rusb_error(e)),
        }
    }

    fn max_packet_size(&self) -> u16 {
        self.endpoints.in_max_size
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.endpoints.interface_number);
        if self.kernel_driver_detached {
            let _ = self.handle.attach_kernel_driver(self.endpoints.interface_number);
        }
    }
}

fn classify_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        other => TransportError::BulkTransferFailed(other.to_string()),
    }
}

#[cfg(test)]
pub mod fake {
    //! An in-memory stand-in for [`super::Transport`] used by framing,
    //! codec, streaming, and health/recovery tests.

    use std::collections::VecDeque;
    use std::time::Duration;

    use super::Transport;
    use crate::error::TransportError;

    /// Replays a fixed sequence of inbound reads and records outbound
    /// writes. Optionally fails every Nth write/read to exercise error
    /// paths.
    #[derive(Default)]
    pub struct FakeTransport {
        pub inbound: VecDeque<Vec<u8>>,
        pub outbound: Vec<Vec<u8>>,
        pub fail_next_write: bool,
        pub fail_next_read: bool,
        pub always_fail: bool,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_inbound(frames: Vec<Vec<u8>>) -> Self {
            Self {
                inbound: frames.into(),
                ..Default::default()
            }
        }

        pub fn push_inbound(&mut self, bytes: Vec<u8>) {
            self.inbound.push_back(bytes);
        }
    }

    impl Transport for FakeTransport {
        fn write(&mut self, bytes: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
            if self.always_fail {
                return Err(TransportError::BulkTransferFailed("fake failure".into()));
            }
            if self.fail_next_write {
                self.fail_next_write = false;
                return Err(TransportError::BulkTransferFailed("fake failure".into()));
            }
            self.outbound.push(bytes.to_vec());
            Ok(bytes.len())
        }

        fn read(&mut self, _max_len: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
            if self.always_fail {
                return Err(TransportError::BulkTransferFailed("fake failure".into()));
            }
            if self.fail_next_read {
                self.fail_next_read = false;
                return Err(TransportError::BulkTransferFailed("fake failure".into()));
            }
            Ok(self.inbound.pop_front().unwrap_or_default())
        }

        fn max_packet_size(&self) -> u16 {
            64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_descriptor_id_is_lowercase_hex() {
        let d = DeviceDescriptor {
            vendor_id: 0x10D6,
            product_id: 0xB00D,
            serial_number: None,
            bus_number: 1,
            address: 2,
        };
        assert_eq!(d.id(), "10d6:b00d");
    }
}
