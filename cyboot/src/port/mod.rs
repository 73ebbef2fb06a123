//! Transport abstraction for bootloader communication.
//!
//! The bootloader protocol only needs a blocking duplex byte channel with a
//! known maximum transfer size. Implementations:
//!
//! - **Serial** (feature `native`, default): UART bootloaders via `serialport`
//! - **USB HID** (feature `hid`): USB bootloaders via `hidapi`
//!
//! ## Architecture
//!
//! ```text
//! +------------------+
//! |  Action layer    |  program / erase / verify
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |  Session         |  row engine, row-range cache
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |  Transport trait |
//! +--------+---------+
//!          |
//!    +-----+------+
//!    v            v
//! +--------+  +--------+
//! | Serial |  |  HID   |
//! +--------+  +--------+
//! ```
//!
//! Timeouts belong to the transport; the protocol layers never retry.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cyboot::port::Transport;
//!
//! fn poke<T: Transport>(transport: &mut T) -> std::io::Result<()> {
//!     transport.open()?;
//!     transport.write(&[0x01, 0x38, 0x00, 0x00, 0xC7, 0xFF, 0x17])?;
//!
//!     let mut response = [0u8; 15];
//!     transport.read(&mut response)?;
//!     transport.close()
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(feature = "hid")]
pub mod hid;

use std::{io, time::Duration};

/// Default maximum bytes per transfer, one USB full-speed packet.
pub const DEFAULT_MAX_TRANSFER_SIZE: usize = 64;

/// Byte channel to a bootloader.
///
/// Reads and writes are whole-buffer operations: `read` fills the entire
/// buffer or fails, `write` sends the entire buffer or fails.
pub trait Transport {
    /// Open the underlying channel.
    fn open(&mut self) -> io::Result<()>;

    /// Close the channel and release its resources.
    fn close(&mut self) -> io::Result<()>;

    /// Read exactly `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// Write all of `buf`.
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Largest frame the channel carries in one write.
    fn max_transfer_size(&self) -> usize;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn open(&mut self) -> io::Result<()> {
        (**self).open()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        (**self).write(buf)
    }

    fn max_transfer_size(&self) -> usize {
        (**self).max_transfer_size()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> io::Result<()> {
        (**self).open()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        (**self).write(buf)
    }

    fn max_transfer_size(&self) -> usize {
        (**self).max_transfer_size()
    }
}

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
    /// Largest frame the bootloader accepts in one write.
    pub max_transfer_size: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(1000),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum transfer size.
    #[must_use]
    pub fn with_max_transfer_size(mut self, size: usize) -> Self {
        self.max_transfer_size = size;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
}

// Re-export the appropriate implementation based on features
#[cfg(feature = "native")]
pub use native::SerialTransport;

#[cfg(feature = "hid")]
pub use hid::HidTransport;
