//! Bootloader session: single-row operations over a [`Transport`].
//!
//! A [`Session`] owns the transport, the packet checksum selected by the
//! image header, and a per-array cache of valid row ranges. Exclusive
//! ownership of the transport means at most one session drives a device.
//!
//! ## Lifecycle
//!
//! ```text
//! new ──► start ──► row ops ... ──► end
//!           │                        ▲
//!           └── (error) ── finish ───┘   skipped after a transport failure
//! ```

use {
    crate::{
        action::AbortFlag,
        error::{DeviceStatus, Error, Result},
        port::Transport,
        protocol::{
            AppStatus, BootloaderInfo, ChecksumType, CommandFrame, Opcode, RowRange,
            packet::{
                TRANSFER_HEADER_SIZE, parse_default_response, parse_verify_checksum,
                parse_verify_row,
            },
        },
    },
    log::{debug, info, trace, warn},
    std::{thread, time::Duration},
};

/// Flash arrays addressable by a row command.
pub const MAX_FLASH_ARRAYS: usize = 4;

/// Bootloader versions `0x01xxxx` speak this protocol.
const VERSION_FAMILY_MASK: u32 = 0x00FF_0000;
const VERSION_FAMILY: u32 = 0x0001_0000;

/// Silicon ID of the SCSI2SD bootloader, reported by [`ping`].
pub const SCSI2SD_SILICON_ID: u32 = 0x2E13_3069;

/// Silicon revision of the SCSI2SD bootloader.
pub const SCSI2SD_SILICON_REV: u8 = 0x00;

/// Reset type sent with ExitBootloader.
const EXIT_RESET_TYPE: u8 = 0x00;

/// A bootload session with one device.
pub struct Session<T: Transport> {
    transport: T,
    checksum: ChecksumType,
    rows: [Option<RowRange>; MAX_FLASH_ARRAYS],
    info: Option<BootloaderInfo>,
    open: bool,
}

impl<T: Transport> Session<T> {
    /// Create an idle session using the Sum checksum.
    pub fn new(transport: T) -> Self {
        Self::with_checksum(transport, ChecksumType::default())
    }

    /// Create an idle session with an explicit packet checksum.
    pub fn with_checksum(transport: T, checksum: ChecksumType) -> Self {
        Self {
            transport,
            checksum,
            rows: [None; MAX_FLASH_ARRAYS],
            info: None,
            open: false,
        }
    }

    /// Packet checksum in use.
    pub fn checksum_type(&self) -> ChecksumType {
        self.checksum
    }

    /// Select the packet checksum for subsequent commands.
    pub fn set_checksum_type(&mut self, checksum: ChecksumType) {
        self.checksum = checksum;
    }

    /// Identity reported by the last EnterBootloader.
    pub fn bootloader_info(&self) -> Option<BootloaderInfo> {
        self.info
    }

    /// Whether the transport was opened by [`Session::start`] and not yet
    /// released by [`Session::end`].
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Borrow the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Consume the session, returning the transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Open the transport and enter the bootloader.
    ///
    /// Fails with [`Error::Device`] when the silicon does not match and with
    /// [`Error::Version`] for an unsupported bootloader. The transport stays
    /// open on those failures so the caller can still [`end`](Self::end).
    pub fn start(&mut self, expected_id: u32, expected_rev: u8) -> Result<BootloaderInfo> {
        self.rows = [None; MAX_FLASH_ARRAYS];
        self.info = None;

        self.transport
            .open()
            .map_err(Error::Communication)?;
        self.open = true;

        let response = self.transfer(&CommandFrame::enter_bootloader())?;
        let info = BootloaderInfo::from_response(&response, self.checksum)?;
        self.info = Some(info);

        if info.silicon_id != expected_id || info.silicon_rev != expected_rev {
            return Err(Error::Device {
                expected_id,
                expected_rev,
                actual_id: info.silicon_id,
                actual_rev: info.silicon_rev,
            });
        }
        if info.version & VERSION_FAMILY_MASK != VERSION_FAMILY {
            return Err(Error::Version(info.version));
        }

        info!(
            "Entered bootloader: silicon {:#010x} rev {}, version {:#08x}",
            info.silicon_id, info.silicon_rev, info.version
        );
        Ok(info)
    }

    /// Leave the bootloader and close the transport.
    ///
    /// ExitBootloader has no response; the device resets instead. Does
    /// nothing if the session is not open.
    pub fn end(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.rows = [None; MAX_FLASH_ARRAYS];

        let request = CommandFrame::exit_bootloader(EXIT_RESET_TYPE).build(self.checksum)?;
        trace!("-> {request:02X?}");
        let written = self
            .transport
            .write(&request)
            .map_err(Error::Communication);
        let closed = self
            .transport
            .close()
            .map_err(Error::Communication);
        debug!("Session ended");
        written.and(closed)
    }

    /// End the session after an operation, honouring its outcome.
    ///
    /// After a transport failure the channel is left alone. Otherwise the
    /// session is ended; an end failure is reported only when `result` was
    /// successful, so the first error always wins.
    pub fn finish<R>(&mut self, result: Result<R>) -> Result<R> {
        if matches!(&result, Err(e) if e.is_communication()) {
            warn!("Skipping bootloader exit after communication failure");
            return result;
        }

        let ended = self.end();
        match result {
            Ok(value) => ended.map(|()| value),
            Err(e) => {
                if let Err(end_err) = ended {
                    warn!("Failed to end session cleanly: {end_err}");
                }
                Err(e)
            },
        }
    }

    /// Send one command and read its fixed-size response.
    pub fn transfer(&mut self, frame: &CommandFrame) -> Result<Vec<u8>> {
        let request = frame.build(self.checksum)?;
        trace!("-> {request:02X?}");
        self.transport
            .write(&request)
            .map_err(Error::Communication)?;

        let mut response = vec![0u8; frame.response_len()];
        self.transport
            .read(&mut response)
            .map_err(Error::Communication)?;
        trace!("<- {response:02X?}");
        Ok(response)
    }

    /// Check that `row` is programmable in `array_id`.
    ///
    /// The range of each array is fetched once and cached for the rest of
    /// the session.
    pub fn validate_row(&mut self, array_id: u8, row: u16) -> Result<()> {
        let index = usize::from(array_id);
        if index >= MAX_FLASH_ARRAYS {
            return Err(Error::Array(array_id));
        }

        let range = match self.rows[index] {
            Some(range) => range,
            None => {
                let response = self.transfer(&CommandFrame::get_flash_size(array_id))?;
                let range = RowRange::from_response(&response, self.checksum)?;
                debug!(
                    "Array {array_id}: rows {}..={}",
                    range.first, range.last
                );
                self.rows[index] = Some(range);
                range
            },
        };

        if !range.contains(row) {
            return Err(Error::Row {
                array: array_id,
                row,
                min: range.first,
                max: range.last,
            });
        }
        Ok(())
    }

    /// Program one row, streaming leading chunks with SendData when the row
    /// does not fit a single transfer.
    pub fn program_row(&mut self, array_id: u8, row: u16, data: &[u8]) -> Result<()> {
        self.validate_row(array_id, row)?;

        let max = self
            .transport
            .max_transfer_size();
        let chunk_size = max.saturating_sub(TRANSFER_HEADER_SIZE);
        let mut offset = 0;

        while data.len() - offset + TRANSFER_HEADER_SIZE > max {
            if chunk_size == 0 {
                return Err(Error::Length(format!(
                    "max transfer size {max} cannot carry row data"
                )));
            }
            let chunk = &data[offset..offset + chunk_size];
            let response = self.transfer(&CommandFrame::send_data(chunk))?;
            parse_default_response(&response, Opcode::SendData, self.checksum)?;
            offset += chunk_size;
        }

        let frame = CommandFrame::program_row(array_id, row, &data[offset..]);
        let response = self.transfer(&frame)?;
        parse_default_response(&response, Opcode::ProgramRow, self.checksum)?;
        trace!(
            "Programmed row {array_id}:{row} ({} bytes, {} chunks)",
            data.len(),
            offset / chunk_size.max(1)
        );
        Ok(())
    }

    /// Erase one row.
    pub fn erase_row(&mut self, array_id: u8, row: u16) -> Result<()> {
        self.validate_row(array_id, row)?;
        let response = self.transfer(&CommandFrame::erase_row(array_id, row))?;
        parse_default_response(&response, Opcode::EraseRow, self.checksum)
    }

    /// Compare the device's checksum of one row against `expected`.
    pub fn verify_row(&mut self, array_id: u8, row: u16, expected: u8) -> Result<()> {
        self.validate_row(array_id, row)?;
        let response = self.transfer(&CommandFrame::verify_row(array_id, row))?;
        let actual = parse_verify_row(&response, self.checksum)?;
        if actual != expected {
            return Err(Error::Checksum { expected, actual });
        }
        Ok(())
    }

    /// Ask the bootloader to validate the whole application checksum.
    pub fn verify_application(&mut self) -> Result<()> {
        let response = self.transfer(&CommandFrame::verify_checksum())?;
        if parse_verify_checksum(&response, self.checksum)? {
            Ok(())
        } else {
            Err(Error::Checksum {
                expected: 1,
                actual: 0,
            })
        }
    }

    /// Query validity and activity of a multi-application slot.
    pub fn application_status(&mut self, app_id: u8) -> Result<AppStatus> {
        let response = self.transfer(&CommandFrame::get_app_status(app_id))?;
        AppStatus::from_response(&response, self.checksum)
    }

    /// Make `app_id` the application launched on exit.
    pub fn set_active_application(&mut self, app_id: u8) -> Result<()> {
        let response = self.transfer(&CommandFrame::set_active_app(app_id))?;
        parse_default_response(&response, Opcode::SetActiveApp, self.checksum).map_err(
            |e| match e {
                Error::Bootloader(DeviceStatus::App) => Error::App(app_id),
                other => other,
            },
        )
    }

    /// Reset the device's packet parser after a framing problem.
    pub fn sync(&mut self) -> Result<()> {
        let response = self.transfer(&CommandFrame::sync())?;
        parse_default_response(&response, Opcode::Sync, self.checksum)
    }
}

/// Check that a SCSI2SD bootloader answers on `transport`.
///
/// Enters the bootloader and verifies row 0 of array 0. A checksum mismatch
/// still proves the bootloader is alive. The session is ended afterwards
/// unless the transport failed.
pub fn ping<T: Transport>(transport: T) -> Result<BootloaderInfo> {
    let mut session = Session::new(transport);
    let result = session
        .start(SCSI2SD_SILICON_ID, SCSI2SD_SILICON_REV)
        .and_then(|info| match session.verify_row(0, 0, 0) {
            Ok(()) | Err(Error::Checksum { .. }) => Ok(info),
            Err(e) => Err(e),
        });
    session.finish(result)
}

/// Poll until a bootloader answers [`ping`].
///
/// `connect` builds a fresh transport for each attempt, since a rebooting
/// device re-enumerates. The abort flag is checked before every attempt and
/// the last failure is returned once `attempts` are used up.
pub fn wait_for_bootloader<T, F>(
    mut connect: F,
    attempts: usize,
    interval: Duration,
    abort: &AbortFlag,
) -> Result<BootloaderInfo>
where
    T: Transport,
    F: FnMut() -> T,
{
    let mut last = Error::DeviceNotFound;
    for attempt in 1..=attempts {
        if abort.is_set() {
            return Err(Error::Abort);
        }
        match ping(connect()) {
            Ok(info) => {
                info!("Bootloader answered after {attempt} attempt(s)");
                return Ok(info);
            },
            Err(e) => {
                trace!("Bootloader not ready ({attempt}/{attempts}): {e}");
                last = e;
            },
        }
        if attempt < attempts {
            thread::sleep(interval);
        }
    }
    Err(last)
}
