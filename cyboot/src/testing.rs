//! In-memory bootloader used by the unit tests.
//!
//! [`SimulatedDevice`] decodes every written frame with the real codec,
//! records it, and queues the response a bootloader would send. Responses
//! shorter than the host's read are zero padded, the way a HID report is.

use {
    crate::{
        error::DeviceStatus,
        image::FlashRow,
        port::Transport,
        protocol::{
            AppStatus, BootloaderInfo, ChecksumType, CommandFrame, Opcode, RowRange,
            packet::{STATUS_SUCCESS, build_response},
        },
    },
    std::{
        collections::{BTreeMap, HashMap, VecDeque},
        io,
    },
};

/// Silicon identity used by the simulated device and test images.
pub(crate) const SILICON_ID: u32 = 0x2E13_3069;
pub(crate) const SILICON_REV: u8 = 0x00;
pub(crate) const BOOTLOADER_VERSION: u32 = 0x01_0214;

pub(crate) struct SimulatedDevice {
    pub info: BootloaderInfo,
    pub checksum: ChecksumType,
    pub max_transfer: usize,
    pub arrays: HashMap<u8, RowRange>,
    pub apps: HashMap<u8, AppStatus>,
    pub application_valid: bool,
    /// Opcodes answered with a fixed error status.
    pub reject: HashMap<Opcode, u8>,
    /// Opcode whose write breaks the channel for good.
    pub fail_on: Option<Opcode>,
    pub flash: BTreeMap<(u8, u16), Vec<u8>>,
    pub log: Vec<CommandFrame>,
    pub opened: usize,
    pub closed: usize,
    pending_data: Vec<u8>,
    response: VecDeque<u8>,
    broken: bool,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            info: BootloaderInfo {
                silicon_id: SILICON_ID,
                silicon_rev: SILICON_REV,
                version: BOOTLOADER_VERSION,
            },
            checksum: ChecksumType::Sum,
            max_transfer: 64,
            arrays: HashMap::from([(0, RowRange { first: 0, last: 255 })]),
            apps: HashMap::new(),
            application_valid: true,
            reject: HashMap::new(),
            fail_on: None,
            flash: BTreeMap::new(),
            log: Vec::new(),
            opened: 0,
            closed: 0,
            pending_data: Vec::new(),
            response: VecDeque::new(),
            broken: false,
        }
    }

    pub fn opcodes(&self) -> Vec<Opcode> {
        self.log
            .iter()
            .map(CommandFrame::opcode)
            .collect()
    }

    pub fn count(&self, opcode: Opcode) -> usize {
        self.log
            .iter()
            .filter(|frame| frame.opcode() == opcode)
            .count()
    }

    fn handle(&mut self, frame: &CommandFrame) -> (u8, Vec<u8>) {
        if let Some(&status) = self
            .reject
            .get(&frame.opcode())
        {
            return (status, Vec::new());
        }

        let data = frame.data();
        match frame.opcode() {
            Opcode::EnterBootloader => {
                self.pending_data
                    .clear();
                (STATUS_SUCCESS, self.info.to_payload())
            },
            Opcode::GetFlashSize => match self.arrays.get(&data[0]) {
                Some(range) => {
                    let mut payload = range.first.to_le_bytes().to_vec();
                    payload.extend_from_slice(&range.last.to_le_bytes());
                    (STATUS_SUCCESS, payload)
                },
                None => (DeviceStatus::Array.code(), Vec::new()),
            },
            Opcode::SendData => {
                self.pending_data
                    .extend_from_slice(data);
                (STATUS_SUCCESS, Vec::new())
            },
            Opcode::ProgramRow => {
                let (array, row) = row_address(data);
                let mut contents = std::mem::take(&mut self.pending_data);
                contents.extend_from_slice(&data[3..]);
                self.flash
                    .insert((array, row), contents);
                (STATUS_SUCCESS, Vec::new())
            },
            Opcode::EraseRow => {
                self.flash
                    .remove(&row_address(data));
                (STATUS_SUCCESS, Vec::new())
            },
            Opcode::VerifyRow => {
                let sum = self
                    .flash
                    .get(&row_address(data))
                    .map_or(0u8, |bytes| {
                        bytes
                            .iter()
                            .fold(0u8, |acc, &b| acc.wrapping_add(b))
                    });
                (STATUS_SUCCESS, vec![0u8.wrapping_sub(sum)])
            },
            Opcode::VerifyChecksum => (STATUS_SUCCESS, vec![u8::from(self.application_valid)]),
            Opcode::GetAppStatus => {
                let status = self
                    .apps
                    .get(&data[0])
                    .copied()
                    .unwrap_or(AppStatus {
                        validity: 1,
                        active: 0,
                    });
                (STATUS_SUCCESS, vec![status.validity, status.active])
            },
            Opcode::SetActiveApp => {
                let id = data[0];
                if !self
                    .apps
                    .get(&id)
                    .is_some_and(AppStatus::is_valid)
                {
                    return (DeviceStatus::App.code(), Vec::new());
                }
                for (app, status) in &mut self.apps {
                    status.active = u8::from(*app == id);
                }
                (STATUS_SUCCESS, Vec::new())
            },
            Opcode::Sync => {
                self.pending_data
                    .clear();
                (STATUS_SUCCESS, Vec::new())
            },
            Opcode::ExitBootloader => (STATUS_SUCCESS, Vec::new()),
        }
    }
}

fn row_address(data: &[u8]) -> (u8, u16) {
    (data[0], u16::from_le_bytes([data[1], data[2]]))
}

impl Transport for SimulatedDevice {
    fn open(&mut self) -> io::Result<()> {
        self.opened += 1;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed += 1;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if self.broken || self.response.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no response"));
        }
        for byte in buf.iter_mut() {
            *byte = self
                .response
                .pop_front()
                .unwrap_or(0);
        }
        self.response
            .clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel broken"));
        }
        let frame = CommandFrame::decode(buf, self.checksum)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        if buf.len() > self.max_transfer {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} byte frame exceeds {}", buf.len(), self.max_transfer),
            ));
        }
        if self.fail_on == Some(frame.opcode()) {
            self.broken = true;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel broken"));
        }

        let (status, data) = self.handle(&frame);
        self.log
            .push(frame.clone());
        if frame.opcode() != Opcode::ExitBootloader {
            self.response = build_response(status, &data, self.checksum)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
                .into();
        }
        Ok(())
    }

    fn max_transfer_size(&self) -> usize {
        self.max_transfer
    }
}

/// Row with a file checksum consistent with its contents.
pub(crate) fn flash_row(array_id: u8, row: u16, data: Vec<u8>) -> FlashRow {
    let [row_hi, row_lo] = row.to_be_bytes();
    let [size_hi, size_lo] = (data.len() as u16).to_be_bytes();
    let sum = [array_id, row_hi, row_lo, size_hi, size_lo]
        .iter()
        .chain(&data)
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    FlashRow {
        array_id,
        row,
        data,
        checksum: 0u8.wrapping_sub(sum),
    }
}

/// CYACD text for the simulated silicon.
pub(crate) fn image_text(checksum: ChecksumType, rows: &[FlashRow]) -> String {
    let header = crate::image::ImageHeader {
        silicon_id: SILICON_ID,
        silicon_rev: SILICON_REV,
        checksum_type: checksum,
    };
    let mut text = header.to_line();
    text.push('\n');
    for row in rows {
        text.push_str(&row.to_line());
        text.push('\n');
    }
    text
}
