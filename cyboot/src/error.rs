//! Error types for cyboot.
//!
//! Host-side failures and device-reported failures share one enum. A
//! transport failure is [`Error::Communication`], a non-zero status byte
//! from the bootloader is [`Error::Bootloader`]; everything else is a
//! host-detected condition.

use std::{fmt, io};
use thiserror::Error;

/// Result type for cyboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Bit set on [`Error::code`] for transport failures.
pub const COMM_ERROR_MASK: u16 = 0x2000;

/// Bit set on [`Error::code`] for device-reported failures.
pub const BOOTLOADER_ERROR_MASK: u16 = 0x4000;

/// Status byte reported by the bootloader in a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    /// Bootloader key mismatch (0x01).
    Key,
    /// Flash verification after write failed (0x02).
    Verify,
    /// Packet length invalid for the command (0x03).
    Length,
    /// Packet data invalid (0x04).
    Data,
    /// Command not recognised or not supported (0x05).
    Cmd,
    /// Wrong device (0x06).
    Device,
    /// Unsupported bootloader version (0x07).
    Version,
    /// Packet checksum mismatch (0x08).
    Checksum,
    /// Flash array out of range (0x09).
    Array,
    /// Flash row out of range (0x0A).
    Row,
    /// Flash row is write protected (0x0B).
    Protect,
    /// Application is invalid and cannot be set active (0x0C).
    App,
    /// Application is currently active (0x0D).
    Active,
    /// Unspecified device error (0x0F).
    Unknown,
    /// Status code outside the documented set.
    Other(u8),
}

impl DeviceStatus {
    /// Classify a raw, non-zero status byte.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::Key,
            0x02 => Self::Verify,
            0x03 => Self::Length,
            0x04 => Self::Data,
            0x05 => Self::Cmd,
            0x06 => Self::Device,
            0x07 => Self::Version,
            0x08 => Self::Checksum,
            0x09 => Self::Array,
            0x0A => Self::Row,
            0x0B => Self::Protect,
            0x0C => Self::App,
            0x0D => Self::Active,
            0x0F => Self::Unknown,
            other => Self::Other(other),
        }
    }

    /// Raw status byte as sent by the device.
    pub fn code(self) -> u8 {
        match self {
            Self::Key => 0x01,
            Self::Verify => 0x02,
            Self::Length => 0x03,
            Self::Data => 0x04,
            Self::Cmd => 0x05,
            Self::Device => 0x06,
            Self::Version => 0x07,
            Self::Checksum => 0x08,
            Self::Array => 0x09,
            Self::Row => 0x0A,
            Self::Protect => 0x0B,
            Self::App => 0x0C,
            Self::Active => 0x0D,
            Self::Unknown => 0x0F,
            Self::Other(code) => code,
        }
    }

    /// Short human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            Self::Key => "bootloader key mismatch",
            Self::Verify => "flash verification failed",
            Self::Length => "invalid packet length",
            Self::Data => "invalid packet data",
            Self::Cmd => "unsupported command",
            Self::Device => "wrong device",
            Self::Version => "unsupported bootloader version",
            Self::Checksum => "packet checksum mismatch",
            Self::Array => "flash array out of range",
            Self::Row => "flash row out of range",
            Self::Protect => "flash row is protected",
            Self::App => "application is invalid",
            Self::Active => "application is active",
            Self::Unknown | Self::Other(_) => "unknown device error",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {:#04x})", self.description(), self.code())
    }
}

/// Error type for cyboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The image file could not be opened or read.
    #[error("File error: {0}")]
    File(#[source] io::Error),

    /// End of the image file was reached.
    #[error("Unexpected end of file")]
    Eof,

    /// A line or packet had the wrong length.
    #[error("Length error: {0}")]
    Length(String),

    /// A line or packet contained malformed data.
    #[error("Data error: {0}")]
    Data(String),

    /// A row line did not start with the row marker.
    #[error("Command error: {0}")]
    Cmd(String),

    /// The attached device does not match the image.
    #[error(
        "Device mismatch: image targets silicon {expected_id:#010x} rev {expected_rev}, \
         device reports {actual_id:#010x} rev {actual_rev}"
    )]
    Device {
        /// Silicon ID from the image header.
        expected_id: u32,
        /// Silicon revision from the image header.
        expected_rev: u8,
        /// Silicon ID reported by the device.
        actual_id: u32,
        /// Silicon revision reported by the device.
        actual_rev: u8,
    },

    /// The bootloader version is not supported.
    #[error("Unsupported bootloader version {0:#08x}")]
    Version(u32),

    /// A row or application checksum did not match.
    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum {
        /// Expected checksum value.
        expected: u8,
        /// Checksum reported by the device.
        actual: u8,
    },

    /// Flash array id out of range.
    #[error("Flash array {0} is out of range")]
    Array(u8),

    /// Flash row outside the array's valid range.
    #[error("Row {row} of array {array} is outside the valid range {min}..={max}")]
    Row {
        /// Flash array id.
        array: u8,
        /// Requested row number.
        row: u16,
        /// First valid row.
        min: u16,
        /// Last valid row.
        max: u16,
    },

    /// The target application is active and cannot be modified.
    #[error("Application {0} is active and cannot be programmed or erased")]
    Active(u8),

    /// The target application is invalid and cannot be made active.
    #[error("Application {0} is not valid")]
    App(u8),

    /// The operation was aborted at a row boundary.
    #[error("Operation aborted")]
    Abort,

    /// Unclassified failure.
    #[error("Unknown error: {0}")]
    Unknown(String),

    /// The transport failed; the channel should be considered unusable.
    #[error("Communication error: {0}")]
    Communication(#[source] io::Error),

    /// The bootloader answered with a non-success status.
    #[error("Bootloader error: {0}")]
    Bootloader(DeviceStatus),

    /// No matching device or port was found during discovery.
    #[error("Device not found")]
    DeviceNotFound,
}

impl Error {
    /// Whether the error came from the transport itself.
    pub fn is_communication(&self) -> bool {
        matches!(self, Self::Communication(_))
    }

    /// Whether the device rejected a command it does not implement.
    pub fn is_unsupported_command(&self) -> bool {
        matches!(self, Self::Bootloader(DeviceStatus::Cmd))
    }

    /// Numeric code compatible with the classic Cypress host library.
    ///
    /// Transport failures carry [`COMM_ERROR_MASK`] and device failures
    /// carry [`BOOTLOADER_ERROR_MASK`] ORed with the status byte.
    pub fn code(&self) -> u16 {
        match self {
            Self::File(_) => 0x01,
            Self::Eof => 0x02,
            Self::Length(_) => 0x03,
            Self::Data(_) => 0x04,
            Self::Cmd(_) => 0x05,
            Self::Device { .. } => 0x06,
            Self::Version(_) => 0x07,
            Self::Checksum { .. } => 0x08,
            Self::Array(_) => 0x09,
            Self::Row { .. } => 0x0A,
            Self::Active(_) => 0x0C,
            Self::App(_) => BOOTLOADER_ERROR_MASK | u16::from(DeviceStatus::App.code()),
            Self::Unknown(_) | Self::DeviceNotFound => 0x0F,
            Self::Abort => 0xFF,
            Self::Communication(_) => COMM_ERROR_MASK,
            Self::Bootloader(status) => BOOTLOADER_ERROR_MASK | u16::from(status.code()),
        }
    }
}
