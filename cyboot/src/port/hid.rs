//! USB HID transport using the `hidapi` crate.
//!
//! Each bootloader frame travels in a single 64-byte interrupt report. The
//! bootloader uses unnumbered reports, so every write is prefixed with
//! report id 0.
//!
//! [`reboot_scsi2sd`] talks to the SCSI2SD application instead: it sends the
//! reboot command on the debug interface so the board comes back up in its
//! bootloader.

use {
    crate::{
        device::{
            BOOTLOADER_PID, CYPRESS_VID, is_scsi2sd_debug_interface, scsi2sd_firmware_version,
            scsi2sd_reboot_report,
        },
        port::Transport,
    },
    hidapi::{HidApi, HidDevice},
    log::{debug, trace, warn},
    std::{io, time::Duration},
};

/// Payload bytes per HID report.
pub const HID_PACKET_SIZE: usize = 64;

/// Attempts made for each report write.
const WRITE_ATTEMPTS: usize = 3;

/// How long to wait for the periodic SCSI2SD debug report.
const DEBUG_REPORT_TIMEOUT_MS: i32 = 1000;

/// USB HID transport.
pub struct HidTransport {
    vid: u16,
    pid: u16,
    timeout: Duration,
    release_number: Option<u16>,
    device: Option<HidDevice>,
    // Keeps the hidapi context alive while the device is open
    api: Option<HidApi>,
}

impl HidTransport {
    /// Create a closed transport for the first device matching `vid:pid`.
    pub fn new(vid: u16, pid: u16) -> Self {
        Self {
            vid,
            pid,
            timeout: Duration::from_millis(1000),
            release_number: None,
            device: None,
            api: None,
        }
    }

    /// Transport for the stock Cypress bootloader.
    pub fn bootloader() -> Self {
        Self::new(CYPRESS_VID, BOOTLOADER_PID)
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// USB `bcdDevice` of the opened device.
    ///
    /// Available once [`Transport::open`] has succeeded.
    pub fn release_number(&self) -> Option<u16> {
        self.release_number
    }

    fn device(&self) -> io::Result<&HidDevice> {
        self.device
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "HID device closed"))
    }
}

impl Transport for HidTransport {
    fn open(&mut self) -> io::Result<()> {
        if self.device.is_some() {
            return Ok(());
        }

        let api = HidApi::new().map_err(hid_error)?;
        let info = api
            .device_list()
            .find(|info| info.vendor_id() == self.vid && info.product_id() == self.pid)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no HID device {:04x}:{:04x}", self.vid, self.pid),
                )
            })?;

        let release = info.release_number();
        let device = info
            .open_device(&api)
            .map_err(hid_error)?;
        debug!(
            "Opened HID device {:04x}:{:04x} (release {release:#06x})",
            self.vid, self.pid
        );

        self.release_number = Some(release);
        self.device = Some(device);
        self.api = Some(api);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.device = None;
        self.api = None;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let device = self.device()?;
        let timeout_ms = i32::try_from(
            self.timeout
                .as_millis(),
        )
        .unwrap_or(i32::MAX);

        let mut report = [0u8; HID_PACKET_SIZE];
        let n = device
            .read_timeout(&mut report, timeout_ms)
            .map_err(hid_error)?;
        trace!("HID read {n} bytes");

        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no HID report received",
            ));
        }
        if n < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("HID report has {n} bytes, expected {}", buf.len()),
            ));
        }

        buf.copy_from_slice(&report[..buf.len()]);
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let report = output_report(buf)?;
        let device = self.device()?;

        let mut last_err = None;
        for attempt in 1..=WRITE_ATTEMPTS {
            match device.write(&report) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!("HID write attempt {attempt}/{WRITE_ATTEMPTS} failed: {e}");
                    last_err = Some(e);
                },
            }
        }

        Err(last_err.map_or_else(|| io::Error::other("HID write failed"), hid_error))
    }

    fn max_transfer_size(&self) -> usize {
        HID_PACKET_SIZE
    }
}

/// Ask a SCSI2SD running its application to reboot into the bootloader.
///
/// Fails with [`io::ErrorKind::Unsupported`] when the debug interface is
/// missing or the firmware is too old to reboot itself; such a board has to
/// be power cycled by hand.
pub fn reboot_scsi2sd(vid: u16, pid: u16) -> io::Result<()> {
    let api = HidApi::new().map_err(hid_error)?;
    let info = api
        .device_list()
        .find(|info| {
            info.vendor_id() == vid
                && info.product_id() == pid
                && is_scsi2sd_debug_interface(info.interface_number(), info.usage_page())
        })
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                "SCSI2SD debug interface not found",
            )
        })?;
    let device = info
        .open_device(&api)
        .map_err(hid_error)?;

    let mut report = [0u8; HID_PACKET_SIZE];
    let n = device
        .read_timeout(&mut report, DEBUG_REPORT_TIMEOUT_MS)
        .map_err(hid_error)?;
    let version = scsi2sd_firmware_version(&report[..n]).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "SCSI2SD firmware is too old to reboot itself",
        )
    })?;

    debug!("SCSI2SD firmware {version:#06x}, requesting reboot into the bootloader");
    device
        .write(&scsi2sd_reboot_report())
        .map_err(hid_error)?;
    Ok(())
}

/// Build a zero-padded output report with report id 0.
fn output_report(buf: &[u8]) -> io::Result<[u8; HID_PACKET_SIZE + 1]> {
    if buf.len() > HID_PACKET_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "frame of {} bytes exceeds HID report size {HID_PACKET_SIZE}",
                buf.len()
            ),
        ));
    }

    let mut report = [0u8; HID_PACKET_SIZE + 1];
    report[1..=buf.len()].copy_from_slice(buf);
    Ok(report)
}

fn hid_error(e: hidapi::HidError) -> io::Error {
    io::Error::other(e.to_string())
}
