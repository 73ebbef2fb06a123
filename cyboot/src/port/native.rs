//! Serial transport using the `serialport` crate.
//!
//! Covers UART bootloaders on Linux, macOS and Windows, typically reached
//! through a USB-to-UART bridge.

use {
    crate::port::{DataBits, FlowControl, Parity, SerialConfig, StopBits, Transport},
    log::trace,
    serialport::ClearBuffer,
    std::io::{self, Read, Write},
};

/// Serial port transport.
///
/// The port is opened lazily by [`Transport::open`] so a transport can be
/// built from configuration before the device is attached.
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    /// Create a closed transport for the given configuration.
    pub fn new(config: SerialConfig) -> Self {
        Self { config, port: None }
    }

    /// Port name/path this transport talks to.
    pub fn name(&self) -> &str {
        &self
            .config
            .port_name
    }

    /// Whether the port is currently open.
    pub fn is_open(&self) -> bool {
        self.port
            .is_some()
    }

    fn port_mut(&mut self) -> io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> io::Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        trace!(
            "Opening {} at {} baud",
            self.config.port_name, self.config.baud_rate
        );
        let port = serialport::new(&self.config.port_name, self.config.baud_rate)
            .timeout(self.config.timeout)
            .data_bits(
                self.config
                    .data_bits
                    .into(),
            )
            .parity(
                self.config
                    .parity
                    .into(),
            )
            .stop_bits(
                self.config
                    .stop_bits
                    .into(),
            )
            .flow_control(
                self.config
                    .flow_control
                    .into(),
            )
            .open()
            .map_err(io::Error::from)?;

        // Drop anything the bootloader sent before we attached
        port.clear(ClearBuffer::All)
            .map_err(io::Error::from)?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if self
            .port
            .take()
            .is_some()
        {
            trace!("Closed {}", self.config.port_name);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.port_mut()?
            .read_exact(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let port = self.port_mut()?;
        port.write_all(buf)?;
        port.flush()
    }

    fn max_transfer_size(&self) -> usize {
        self.config
            .max_transfer_size
    }
}

// Type conversions from our types to serialport types

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Hardware => Self::Hardware,
        }
    }
}
