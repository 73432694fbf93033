//! Device model detection and per-model capability tags.

use crate::transport::HIDOCK_VENDOR_ID;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceModel {
    H1,
    H1E,
    P1,
    Unknown,
}

impl DeviceModel {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceModel::H1 => "hidock-h1",
            DeviceModel::H1E => "hidock-h1e",
            DeviceModel::P1 => "hidock-p1",
            DeviceModel::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCapability {
    FileList,
    FileDownload,
    FileDelete,
    StorageInfo,
    HealthMonitoring,
    RealTimeRecording,
    TimeSync,
    Format,
}

/// Maps a vendor/product id pair to a known model, `Unknown` for any
/// other HiDock-vendor product id and anything from a different vendor.
pub fn detect_device_model(vendor_id: u16, product_id: u16) -> DeviceModel {
    if vendor_id != HIDOCK_VENDOR_ID {
        return DeviceModel::Unknown;
    }
    match product_id {
        0xAF0C | 0xAF0D => DeviceModel::H1,
        0xB00D => DeviceModel::H1E,
        0xAF0E => DeviceModel::P1,
        _ => DeviceModel::Unknown,
    }
}

/// Base capabilities every recognized or unrecognized HiDock device is
/// assumed to support: list, download, delete, storage info.
const BASE_CAPABILITIES: [DeviceCapability; 4] = [
    DeviceCapability::FileList,
    DeviceCapability::FileDownload,
    DeviceCapability::FileDelete,
    DeviceCapability::StorageInfo,
];

/// Returns the capability set for `model`. H1/H1E additionally expose
/// health monitoring; P1 additionally exposes real-time recording.
/// Time sync and format are available everywhere a device responds at
/// all, so they're folded into the base set alongside list/download.
pub fn get_model_capabilities(model: DeviceModel) -> Vec<DeviceCapability> {
    let mut caps = BASE_CAPABILITIES.to_vec();
    caps.push(DeviceCapability::TimeSync);
    caps.push(DeviceCapability::Format);
    match model {
        DeviceModel::H1 | DeviceModel::H1E => caps.push(DeviceCapability::HealthMonitoring),
        DeviceModel::P1 => caps.push(DeviceCapability::RealTimeRecording),
        DeviceModel::Unknown => {}
    }
    caps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_known_models() {
        assert_eq!(detect_device_model(HIDOCK_VENDOR_ID, 0xAF0C), DeviceModel::H1);
        assert_eq!(detect_device_model(HIDOCK_VENDOR_ID, 0xAF0D), DeviceModel::H1);
        assert_eq!(detect_device_model(HIDOCK_VENDOR_ID, 0xB00D), DeviceModel::H1E);
        assert_eq!(detect_device_model(HIDOCK_VENDOR_ID, 0xAF0E), DeviceModel::P1);
    }

    #[test]
    fn unknown_vendor_or_product_is_unknown_model() {
        assert_eq!(detect_device_model(0x1234, 0xAF0C), DeviceModel::Unknown);
        assert_eq!(detect_device_model(HIDOCK_VENDOR_ID, 0x0000), DeviceModel::Unknown);
    }

    #[test]
    fn unknown_model_still_gets_base_capabilities() {
        let caps = get_model_capabilities(DeviceModel::Unknown);
        assert!(caps.contains(&DeviceCapability::FileList));
        assert!(caps.contains(&DeviceCapability::FileDownload));
        assert!(!caps.contains(&DeviceCapability::HealthMonitoring));
        assert!(!caps.contains(&DeviceCapability::RealTimeRecording));
    }

    #[test]
    fn h1e_gets_health_monitoring_p1_gets_realtime_recording() {
        assert!(get_model_capabilities(DeviceModel::H1E).contains(&DeviceCapability::HealthMonitoring));
        assert!(get_model_capabilities(DeviceModel::P1).contains(&DeviceCapability::RealTimeRecording));
    }
}
