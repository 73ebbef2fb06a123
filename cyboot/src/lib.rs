//! # cyboot
//!
//! Host-side engine for Cypress PSoC bootloaders.
//!
//! This crate reprograms microcontroller flash through a bootloader that
//! speaks the Cypress packet protocol, including:
//!
//! - CYACD firmware image parsing
//! - Command/response packet codec with Sum and CRC-16 checksums
//! - A row-level [`Session`] with row-range caching and chunked writes
//! - Program, erase and verify actions with multi-application support
//!
//! ## Supported Transports
//!
//! - **Serial** (default): UART bootloaders via the `serialport` crate
//! - **USB HID**: USB bootloaders such as SCSI2SD via the `hidapi` crate
//!
//! ## Features
//!
//! - `native` (default): serial transport and port discovery
//! - `hid`: USB HID transport and HID discovery
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use cyboot::{AbortFlag, Action, ActionRequest, run_action};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let request = ActionRequest::new(Action::Program, "firmware.cyacd");
//!
//!     #[cfg(feature = "native")]
//!     {
//!         use cyboot::port::{SerialConfig, SerialTransport};
//!
//!         let transport = SerialTransport::new(SerialConfig::new("/dev/ttyUSB0", 115200));
//!         let report = run_action(
//!             &request,
//!             transport,
//!             &mut |array: u8, row: u16| println!("Row {array}:{row}"),
//!             &AbortFlag::new(),
//!         )?;
//!         println!("Programmed {} rows", report.rows);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod action;
pub mod device;
pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use {
    action::{
        AbortFlag, Action, ActionReport, ActionRequest, MultiApp, ProgressSink, run_action,
        run_action_from,
    },
    device::{BoardInfo, DetectedPort, DeviceKind, HidTarget, TransportKind},
    error::{DeviceStatus, Error, Result},
    image::{CyacdReader, FlashRow, ImageHeader, ImageSummary, app_id_from_path},
    port::{SerialConfig, Transport},
    protocol::{AppStatus, BootloaderInfo, ChecksumType, CommandFrame, Opcode, RowRange},
    session::{Session, ping, wait_for_bootloader},
};

#[cfg(feature = "native")]
pub use port::SerialTransport;

#[cfg(feature = "hid")]
pub use port::{HidTransport, hid::reboot_scsi2sd};
