//! Device discovery and board identification.
//!
//! Serial endpoints come from `serialport` enumeration and are classified by
//! USB VID/PID. With the `hid` feature, Cypress HID devices are listed too,
//! either already in the bootloader or still running the application.

use crate::error::{Error, Result};

#[cfg(any(feature = "native", feature = "hid"))]
use log::trace;

#[cfg(feature = "native")]
use log::{debug, info};

/// Transport type for discovered endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TransportKind {
    /// Serial transport (UART/USB CDC).
    Serial,
    /// USB HID transport.
    Hid,
}

/// Known USB device kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceKind {
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// Cypress HID bootloader, ready for programming.
    CypressBootloader,
    /// SCSI2SD running its application; reboot it into the bootloader first.
    Scsi2sdApp,
    /// Unknown device.
    Unknown,
}

/// Cypress Semiconductor USB vendor id.
pub const CYPRESS_VID: u16 = 0x04B4;

/// Product id of the stock Cypress HID bootloader.
pub const BOOTLOADER_PID: u16 = 0xB71D;

/// Product id of the SCSI2SD application firmware.
pub const SCSI2SD_APP_PID: u16 = 0x1337;

/// Known USB VID/PID pairs.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
    (CYPRESS_VID, &[BOOTLOADER_PID], DeviceKind::CypressBootloader),
    (CYPRESS_VID, &[SCSI2SD_APP_PID], DeviceKind::Scsi2sdApp),
];

impl DeviceKind {
    /// Classify a VID/PID combination.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::CypressBootloader => "Cypress bootloader",
            Self::Scsi2sdApp => "SCSI2SD (application)",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Whether the device can accept bootloader commands right now.
    pub fn is_bootloader_ready(&self) -> bool {
        !matches!(self, Self::Scsi2sdApp | Self::Unknown)
    }

    /// Check if this device kind should be preferred during auto-selection.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::CypressBootloader | Self::Ch340 | Self::Cp210x)
    }
}

/// Discovered device endpoint information.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectedPort {
    /// Endpoint name (e.g., "/dev/ttyUSB0", "COM3" or "hid:04b4:b71d").
    pub name: String,
    /// Transport type.
    pub transport: TransportKind,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// USB release number, `bcdDevice` (HID only).
    pub release: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

/// Detect all serial endpoints with metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let mut result = Vec::new();

    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let mut detected = DetectedPort {
                    name: port_info
                        .port_name
                        .clone(),
                    transport: TransportKind::Serial,
                    device: DeviceKind::Unknown,
                    vid: None,
                    pid: None,
                    release: None,
                    manufacturer: None,
                    product: None,
                    serial: None,
                };

                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    detected.vid = Some(usb_info.vid);
                    detected.pid = Some(usb_info.pid);
                    detected.manufacturer = usb_info.manufacturer;
                    detected.product = usb_info.product;
                    detected.serial = usb_info.serial_number;
                    detected.device = DeviceKind::from_vid_pid(usb_info.vid, usb_info.pid);

                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                        port_info.port_name, usb_info.vid, usb_info.pid, detected.device
                    );
                }

                result.push(detected);
            }
        },
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
        },
    }

    result
}

/// Detect serial endpoints (serial support disabled).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Classify a HID device for discovery.
///
/// Known Cypress identities are always listed. `wanted` is the bootloader
/// identity the user configured; it is listed even when it is not a
/// Cypress product id.
pub fn classify_hid(vid: u16, pid: u16, wanted: (u16, u16)) -> Option<DeviceKind> {
    let kind = DeviceKind::from_vid_pid(vid, pid);
    if (vid, pid) == wanted && !kind.is_known() {
        Some(DeviceKind::CypressBootloader)
    } else if vid == CYPRESS_VID && kind.is_known() {
        Some(kind)
    } else {
        None
    }
}

/// Detect Cypress HID devices, in bootloader or application mode, plus any
/// device matching the `wanted` VID/PID.
#[cfg(feature = "hid")]
pub fn detect_hid_devices(wanted: (u16, u16)) -> Result<Vec<DetectedPort>> {
    let api = hidapi::HidApi::new()
        .map_err(|e| Error::Communication(std::io::Error::other(e.to_string())))?;

    let mut found: Vec<DetectedPort> = Vec::new();
    for info in api.device_list() {
        let Some(device) = classify_hid(info.vendor_id(), info.product_id(), wanted) else {
            continue;
        };
        let name = format!("hid:{:04x}:{:04x}", info.vendor_id(), info.product_id());
        // Composite devices enumerate once per interface
        if found
            .iter()
            .any(|p| p.name == name)
        {
            continue;
        }
        trace!(
            "Found HID device {:04x}:{:04x} release {:#06x}",
            info.vendor_id(),
            info.product_id(),
            info.release_number()
        );
        found.push(DetectedPort {
            name,
            transport: TransportKind::Hid,
            device,
            vid: Some(info.vendor_id()),
            pid: Some(info.product_id()),
            release: Some(info.release_number()),
            manufacturer: info
                .manufacturer_string()
                .map(str::to_string),
            product: info
                .product_string()
                .map(str::to_string),
            serial: info
                .serial_number()
                .map(str::to_string),
        });
    }
    Ok(found)
}

/// Outcome of looking for the configured HID bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidTarget<'a> {
    /// A device with the configured VID/PID is present.
    Bootloader(&'a DetectedPort),
    /// Only a SCSI2SD running its application is present.
    Application(&'a DetectedPort),
    /// Nothing usable is attached.
    Missing,
}

/// Find the device with `vid:pid`, falling back to a SCSI2SD application
/// that can be rebooted into its bootloader.
pub fn select_hid_target(devices: &[DetectedPort], vid: u16, pid: u16) -> HidTarget<'_> {
    if let Some(port) = devices
        .iter()
        .find(|d| d.vid == Some(vid) && d.pid == Some(pid))
    {
        return HidTarget::Bootloader(port);
    }
    devices
        .iter()
        .find(|d| d.device == DeviceKind::Scsi2sdApp)
        .map_or(HidTarget::Missing, HidTarget::Application)
}

/// Interface number of the SCSI2SD debug interface.
pub const SCSI2SD_DEBUG_INTERFACE: i32 = 1;

/// Vendor usage page of the SCSI2SD debug interface (firmware 3.5.2 and later).
pub const SCSI2SD_DEBUG_USAGE_PAGE: u16 = 0xFF01;

/// Debug-interface command that reboots the application into the bootloader.
const SCSI2SD_REBOOT_COMMAND: u8 = 0x01;

/// Whether a HID interface is the SCSI2SD debug interface.
pub fn is_scsi2sd_debug_interface(interface_number: i32, usage_page: u16) -> bool {
    interface_number == SCSI2SD_DEBUG_INTERFACE || usage_page == SCSI2SD_DEBUG_USAGE_PAGE
}

/// Firmware version from a SCSI2SD debug report.
///
/// Firmware older than 3.5 reports 0 and cannot reboot itself, so `None` is
/// returned for it as well as for a short report.
pub fn scsi2sd_firmware_version(report: &[u8]) -> Option<u16> {
    match report.get(62..64) {
        Some(&[hi, lo]) => Some(u16::from_be_bytes([hi, lo])).filter(|&v| v != 0),
        _ => None,
    }
}

/// Output report asking the SCSI2SD application to reboot into the bootloader.
pub fn scsi2sd_reboot_report() -> [u8; 65] {
    let mut report = [0u8; 65];
    report[1] = SCSI2SD_REBOOT_COMMAND;
    report
}

/// Pick the most likely serial bootloader endpoint.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    select_port(detect_ports())
}

/// Auto-detection needs serial support.
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::DeviceNotFound)
}

/// Choose from candidates: high-priority bridges, then any known device,
/// then the first port.
#[cfg(feature = "native")]
fn select_port(ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    if let Some(port) = ports
        .iter()
        .find(|p| p.device.is_high_priority())
    {
        info!(
            "Auto-detected {} USB-UART bridge: {}",
            port.device.name(),
            port.name
        );
        return Ok(port.clone());
    }

    if let Some(port) = ports
        .iter()
        .find(|p| p.device.is_known())
    {
        info!("Auto-detected {}: {}", port.device.name(), port.name);
        return Ok(port.clone());
    }

    if let Some(port) = ports
        .into_iter()
        .next()
    {
        info!("Using first available port: {}", port.name);
        return Ok(port);
    }

    Err(Error::DeviceNotFound)
}

/// Format a list of detected endpoints for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
        let device_info = if port.device.is_known() {
            format!(" [{}]", port.device.name())
        } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };

        let board_info = port
            .release
            .and_then(BoardInfo::from_release)
            .map(|b| format!(" {}", b.version))
            .unwrap_or_default();

        let product_info = port
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        result.push(format!(
            "{}{}{}{}",
            port.name, device_info, board_info, product_info
        ));
    }

    result
}

/// Board revision identified from the bootloader's USB release number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BoardInfo {
    /// Board description.
    pub description: &'static str,
    /// Hardware versions covered.
    pub version: &'static str,
    /// Firmware image file the board needs.
    pub firmware: &'static str,
}

const KNOWN_BOARDS: &[(u16, BoardInfo)] = &[
    (
        0x3001,
        BoardInfo {
            description: "3.5\" SCSI2SD (green)",
            version: "V3.0",
            firmware: "SCSI2SD-V3.cyacd",
        },
    ),
    (
        0x3002,
        BoardInfo {
            description: "3.5\" SCSI2SD (yellow/red) or 2.5\" SCSI2SD for Apple Powerbook",
            version: "V4.1/V4.2/V5.0",
            firmware: "SCSI2SD-V4.cyacd",
        },
    ),
];

impl BoardInfo {
    /// Look up a board by USB release number.
    pub fn from_release(release: u16) -> Option<Self> {
        KNOWN_BOARDS
            .iter()
            .find(|(known, _)| *known == release)
            .map(|(_, board)| *board)
    }

    /// Whether `path` names this board's firmware image.
    pub fn accepts_firmware(&self, path: &str) -> bool {
        path.contains(self.firmware)
    }
}
