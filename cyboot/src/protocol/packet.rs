//! Bootloader command and response frames.
//!
//! ## Frame Format
//!
//! Commands from the host and responses from the device share one layout:
//!
//! ```text
//! +-------+--------+---------+-----------+--------------+-------+
//! | Start | Code   | Length  |  Payload  |   Checksum   | Stop  |
//! +-------+--------+---------+-----------+--------------+-------+
//! | 1     | 1      | 2 (LE)  |  Length   |    2 (LE)    | 1     |
//! +-------+--------+---------+-----------+--------------+-------+
//! | 0x01  | opcode |         |           |              | 0x17  |
//! |       | status |         |           |              |       |
//! +-------+--------+---------+-----------+--------------+-------+
//! ```
//!
//! The code byte is the opcode in a command and the status in a response.
//! The checksum covers every byte before it. Multi-byte payload fields are
//! little-endian, unlike the big-endian fields of the image file.

use {
    crate::{
        error::{DeviceStatus, Error, Result},
        protocol::checksum::ChecksumType,
    },
    byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
};

/// First byte of every frame.
pub const START_BYTE: u8 = 0x01;

/// Last byte of every frame.
pub const STOP_BYTE: u8 = 0x17;

/// Size of a frame with an empty payload.
pub const BASE_CMD_SIZE: usize = 7;

/// Bytes a ProgramRow frame adds around its row data.
pub const TRANSFER_HEADER_SIZE: usize = 11;

/// Status byte of a successful response.
pub const STATUS_SUCCESS: u8 = 0x00;

/// Bootloader opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Verify the whole application checksum (0x31).
    VerifyChecksum = 0x31,
    /// Query the row range of a flash array (0x32).
    GetFlashSize = 0x32,
    /// Query validity and activity of an application (0x33).
    GetAppStatus = 0x33,
    /// Erase one flash row (0x34).
    EraseRow = 0x34,
    /// Resynchronise the bootloader's packet parser (0x35).
    Sync = 0x35,
    /// Mark an application as the one to boot (0x36).
    SetActiveApp = 0x36,
    /// Buffer part of a row ahead of ProgramRow (0x37).
    SendData = 0x37,
    /// Start a bootload session (0x38).
    EnterBootloader = 0x38,
    /// Write one flash row (0x39).
    ProgramRow = 0x39,
    /// Read back the checksum of one flash row (0x3A).
    VerifyRow = 0x3A,
    /// Leave the bootloader and reset (0x3B).
    ExitBootloader = 0x3B,
}

impl Opcode {
    /// Payload size of a successful response to this command.
    pub fn response_data_len(self) -> usize {
        match self {
            Self::EnterBootloader => 8,
            Self::GetFlashSize => 4,
            Self::GetAppStatus => 2,
            Self::VerifyRow | Self::VerifyChecksum => 1,
            Self::EraseRow
            | Self::Sync
            | Self::SetActiveApp
            | Self::SendData
            | Self::ProgramRow
            | Self::ExitBootloader => 0,
        }
    }

    /// Full size of the response frame to this command.
    pub fn response_len(self) -> usize {
        BASE_CMD_SIZE + self.response_data_len()
    }
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x31 => Self::VerifyChecksum,
            0x32 => Self::GetFlashSize,
            0x33 => Self::GetAppStatus,
            0x34 => Self::EraseRow,
            0x35 => Self::Sync,
            0x36 => Self::SetActiveApp,
            0x37 => Self::SendData,
            0x38 => Self::EnterBootloader,
            0x39 => Self::ProgramRow,
            0x3A => Self::VerifyRow,
            0x3B => Self::ExitBootloader,
            other => return Err(Error::Cmd(format!("unknown opcode {other:#04x}"))),
        })
    }
}

/// Command frame builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    opcode: Opcode,
    data: Vec<u8>,
}

impl CommandFrame {
    /// Create a frame with an explicit payload.
    pub fn new(opcode: Opcode, data: Vec<u8>) -> Self {
        Self { opcode, data }
    }

    /// EnterBootloader, no payload.
    pub fn enter_bootloader() -> Self {
        Self::new(Opcode::EnterBootloader, Vec::new())
    }

    /// ExitBootloader with the given reset type.
    pub fn exit_bootloader(reset_type: u8) -> Self {
        Self::new(Opcode::ExitBootloader, vec![reset_type])
    }

    /// ProgramRow: array id, row number and the final part of the row data.
    pub fn program_row(array_id: u8, row: u16, data: &[u8]) -> Self {
        let mut frame = Self::row_command(Opcode::ProgramRow, array_id, row);
        frame
            .data
            .extend_from_slice(data);
        frame
    }

    /// EraseRow for one row.
    pub fn erase_row(array_id: u8, row: u16) -> Self {
        Self::row_command(Opcode::EraseRow, array_id, row)
    }

    /// VerifyRow for one row.
    pub fn verify_row(array_id: u8, row: u16) -> Self {
        Self::row_command(Opcode::VerifyRow, array_id, row)
    }

    /// VerifyChecksum, no payload.
    pub fn verify_checksum() -> Self {
        Self::new(Opcode::VerifyChecksum, Vec::new())
    }

    /// GetFlashSize for one array.
    pub fn get_flash_size(array_id: u8) -> Self {
        Self::new(Opcode::GetFlashSize, vec![array_id])
    }

    /// SendData carrying a raw chunk of row data.
    pub fn send_data(chunk: &[u8]) -> Self {
        Self::new(Opcode::SendData, chunk.to_vec())
    }

    /// GetAppStatus for one application.
    pub fn get_app_status(app_id: u8) -> Self {
        Self::new(Opcode::GetAppStatus, vec![app_id])
    }

    /// SetActiveApp for one application.
    pub fn set_active_app(app_id: u8) -> Self {
        Self::new(Opcode::SetActiveApp, vec![app_id])
    }

    /// Sync, no payload.
    pub fn sync() -> Self {
        Self::new(Opcode::Sync, Vec::new())
    }

    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn row_command(opcode: Opcode, array_id: u8, row: u16) -> Self {
        let mut data = Vec::with_capacity(3);
        data.push(array_id);
        data.write_u16::<LittleEndian>(row).unwrap();
        Self::new(opcode, data)
    }

    /// Get the opcode.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Get the payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size of the response frame this command expects.
    pub fn response_len(&self) -> usize {
        self.opcode
            .response_len()
    }

    /// Build the complete frame.
    ///
    /// Fails with [`Error::Length`] when the payload does not fit the
    /// 16-bit length field.
    pub fn build(&self, checksum: ChecksumType) -> Result<Vec<u8>> {
        encode_frame(self.opcode as u8, &self.data, checksum)
    }

    /// Decode a command frame, as a device would.
    pub fn decode(buf: &[u8], checksum: ChecksumType) -> Result<Self> {
        let data = check_frame(buf, checksum)?;
        let opcode = Opcode::try_from(buf[1])?;
        Ok(Self::new(opcode, data.to_vec()))
    }
}

/// Build a response frame with the given status and payload.
pub fn build_response(status: u8, data: &[u8], checksum: ChecksumType) -> Result<Vec<u8>> {
    encode_frame(status, data, checksum)
}

#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
fn encode_frame(code: u8, data: &[u8], checksum: ChecksumType) -> Result<Vec<u8>> {
    let len = u16::try_from(data.len()).map_err(|_| {
        Error::Length(format!(
            "payload of {} bytes exceeds the {} byte frame limit",
            data.len(),
            u16::MAX
        ))
    })?;

    let mut buf = Vec::with_capacity(BASE_CMD_SIZE + data.len());
    buf.push(START_BYTE);
    buf.push(code);
    buf.write_u16::<LittleEndian>(len)
        .unwrap();
    buf.extend_from_slice(data);

    let sum = checksum.compute(&buf);
    buf.write_u16::<LittleEndian>(sum)
        .unwrap();
    buf.push(STOP_BYTE);
    Ok(buf)
}

/// Structural checks shared by commands and responses; returns the payload.
fn check_frame(buf: &[u8], checksum: ChecksumType) -> Result<&[u8]> {
    if buf.len() < BASE_CMD_SIZE {
        return Err(Error::Length(format!(
            "frame of {} bytes is shorter than {BASE_CMD_SIZE}",
            buf.len()
        )));
    }
    let declared = usize::from(u16::from_le_bytes([buf[2], buf[3]]));
    if buf[0] != START_BYTE || buf[buf.len() - 1] != STOP_BYTE {
        return Err(Error::Data("missing start or stop byte".into()));
    }
    if declared + BASE_CMD_SIZE != buf.len() {
        return Err(Error::Data(format!(
            "length field {declared} does not match frame size {}",
            buf.len()
        )));
    }
    verify_checksum(buf, checksum)?;
    Ok(&buf[4..4 + declared])
}

fn verify_checksum(buf: &[u8], checksum: ChecksumType) -> Result<()> {
    let split = buf.len() - 3;
    let expected = checksum.compute(&buf[..split]);
    let received = u16::from_le_bytes([buf[split], buf[split + 1]]);
    if expected != received {
        return Err(Error::Data(format!(
            "frame checksum {received:#06x} does not match computed {expected:#06x}"
        )));
    }
    Ok(())
}

/// Validate a response to `opcode` and return its payload.
///
/// Checks run in this order: overall size (`Length`), status byte
/// (`Bootloader`), framing and length field (`Data`), then checksum (`Data`).
pub fn parse_response(buf: &[u8], opcode: Opcode, checksum: ChecksumType) -> Result<&[u8]> {
    let data_len = opcode.response_data_len();
    let expected = BASE_CMD_SIZE + data_len;
    if buf.len() != expected {
        return Err(Error::Length(format!(
            "{opcode:?} response is {} bytes, expected {expected}",
            buf.len()
        )));
    }
    if buf[1] != STATUS_SUCCESS {
        return Err(Error::Bootloader(DeviceStatus::from_code(buf[1])));
    }
    let declared = usize::from(u16::from_le_bytes([buf[2], buf[3]]));
    if buf[0] != START_BYTE || declared != data_len || buf[expected - 1] != STOP_BYTE {
        return Err(Error::Data(format!("malformed {opcode:?} response")));
    }
    verify_checksum(buf, checksum)?;
    Ok(&buf[4..4 + data_len])
}

/// Validate a response that carries no payload.
pub fn parse_default_response(buf: &[u8], opcode: Opcode, checksum: ChecksumType) -> Result<()> {
    parse_response(buf, opcode, checksum).map(|_| ())
}

fn short_payload(_: std::io::Error) -> Error {
    Error::Data("response payload too short".into())
}

/// Identity reported by EnterBootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BootloaderInfo {
    /// Silicon ID of the device.
    pub silicon_id: u32,
    /// Silicon revision of the device.
    pub silicon_rev: u8,
    /// Bootloader version, `0x00MMmmpp`.
    pub version: u32,
}

impl BootloaderInfo {
    /// Parse an EnterBootloader response.
    pub fn from_response(buf: &[u8], checksum: ChecksumType) -> Result<Self> {
        let mut data = parse_response(buf, Opcode::EnterBootloader, checksum)?;
        let silicon_id = data
            .read_u32::<LittleEndian>()
            .map_err(short_payload)?;
        let silicon_rev = data
            .read_u8()
            .map_err(short_payload)?;
        let version = data
            .read_u24::<LittleEndian>()
            .map_err(short_payload)?;
        Ok(Self {
            silicon_id,
            silicon_rev,
            version,
        })
    }

    /// Encode as an EnterBootloader response payload.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_payload(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(8);
        data.write_u32::<LittleEndian>(self.silicon_id)
            .unwrap();
        data.push(self.silicon_rev);
        data.write_u24::<LittleEndian>(self.version)
            .unwrap();
        data
    }
}

/// Valid row range of a flash array, from GetFlashSize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRange {
    /// First programmable row.
    pub first: u16,
    /// Last programmable row.
    pub last: u16,
}

impl RowRange {
    /// Parse a GetFlashSize response.
    pub fn from_response(buf: &[u8], checksum: ChecksumType) -> Result<Self> {
        let mut data = parse_response(buf, Opcode::GetFlashSize, checksum)?;
        let first = data
            .read_u16::<LittleEndian>()
            .map_err(short_payload)?;
        let last = data
            .read_u16::<LittleEndian>()
            .map_err(short_payload)?;
        Ok(Self { first, last })
    }

    /// Whether `row` lies within the range.
    pub fn contains(&self, row: u16) -> bool {
        (self.first..=self.last).contains(&row)
    }
}

/// Application status from GetAppStatus.
///
/// The validity byte follows the bootloader's status convention: zero
/// means the application passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppStatus {
    /// Raw validity code, 0 when valid.
    pub validity: u8,
    /// Raw active flag, non-zero when active.
    pub active: u8,
}

impl AppStatus {
    /// Parse a GetAppStatus response.
    pub fn from_response(buf: &[u8], checksum: ChecksumType) -> Result<Self> {
        let data = parse_response(buf, Opcode::GetAppStatus, checksum)?;
        Ok(Self {
            validity: data[0],
            active: data[1],
        })
    }

    /// Whether the application passed validation.
    pub fn is_valid(&self) -> bool {
        self.validity == 0
    }

    /// Whether the application is the active one.
    pub fn is_active(&self) -> bool {
        self.active != 0
    }
}

/// Parse a VerifyRow response into the device's row checksum.
pub fn parse_verify_row(buf: &[u8], checksum: ChecksumType) -> Result<u8> {
    parse_response(buf, Opcode::VerifyRow, checksum).map(|data| data[0])
}

/// Parse a VerifyChecksum response into the application-valid flag.
pub fn parse_verify_checksum(buf: &[u8], checksum: ChecksumType) -> Result<bool> {
    parse_response(buf, Opcode::VerifyChecksum, checksum).map(|data| data[0] != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_bootloader_sum_vector() {
        let frame = CommandFrame::enter_bootloader().build(ChecksumType::Sum).unwrap();
        assert_eq!(frame, vec![0x01, 0x38, 0x00, 0x00, 0xC7, 0xFF, 0x17]);
    }

    #[test]
    fn test_enter_bootloader_crc_frame() {
        let frame = CommandFrame::enter_bootloader().build(ChecksumType::Crc16).unwrap();
        let crc = crate::protocol::checksum::crc16(&[0x01, 0x38, 0x00, 0x00]);
        assert_eq!(frame.len(), BASE_CMD_SIZE);
        assert_eq!(frame[4], crc as u8);
        assert_eq!(frame[5], (crc >> 8) as u8);
        assert_eq!(frame[6], STOP_BYTE);
    }

    #[test]
    fn test_row_commands_are_little_endian() {
        let frame = CommandFrame::program_row(1, 0x0203, &[0xAA, 0xBB])
            .build(ChecksumType::Sum)
            .unwrap();
        assert_eq!(frame.len(), BASE_CMD_SIZE + 3 + 2);
        assert_eq!(&frame[..9], &[0x01, 0x39, 0x05, 0x00, 0x01, 0x03, 0x02, 0xAA, 0xBB]);
        assert_eq!(frame[frame.len() - 1], STOP_BYTE);

        let frame = CommandFrame::erase_row(0, 0x0100).build(ChecksumType::Sum).unwrap();
        assert_eq!(&frame[..7], &[0x01, 0x34, 0x03, 0x00, 0x00, 0x00, 0x01]);

        let frame = CommandFrame::verify_row(3, 7).build(ChecksumType::Sum).unwrap();
        assert_eq!(&frame[..7], &[0x01, 0x3A, 0x03, 0x00, 0x03, 0x07, 0x00]);
    }

    #[test]
    fn test_single_byte_commands() {
        let cases = [
            (CommandFrame::exit_bootloader(0), 0x3B),
            (CommandFrame::get_flash_size(2), 0x32),
            (CommandFrame::get_app_status(1), 0x33),
            (CommandFrame::set_active_app(1), 0x36),
        ];
        for (frame, opcode) in cases {
            let bytes = frame.build(ChecksumType::Sum).unwrap();
            assert_eq!(bytes.len(), BASE_CMD_SIZE + 1);
            assert_eq!(bytes[1], opcode);
            assert_eq!(&bytes[2..4], &[0x01, 0x00]);
        }
        assert_eq!(
            CommandFrame::sync()
                .build(ChecksumType::Sum)
                .unwrap()
                .len(),
            BASE_CMD_SIZE
        );
        assert_eq!(
            CommandFrame::verify_checksum()
                .build(ChecksumType::Sum)
                .unwrap()
                .len(),
            BASE_CMD_SIZE
        );
    }

    #[test]
    fn test_oversized_payload_is_length_error() {
        let data = vec![0u8; usize::from(u16::MAX) + 1];
        let err = CommandFrame::send_data(&data)
            .build(ChecksumType::Sum)
            .unwrap_err();
        assert!(matches!(err, Error::Length(_)), "{err:?}");
        assert!(matches!(
            build_response(STATUS_SUCCESS, &data, ChecksumType::Crc16),
            Err(Error::Length(_))
        ));

        let max = vec![0u8; usize::from(u16::MAX)];
        let frame = CommandFrame::send_data(&max)
            .build(ChecksumType::Sum)
            .unwrap();
        assert_eq!(&frame[2..4], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_response_sizes() {
        assert_eq!(CommandFrame::enter_bootloader().response_len(), 15);
        assert_eq!(CommandFrame::get_flash_size(0).response_len(), 11);
        assert_eq!(CommandFrame::get_app_status(0).response_len(), 9);
        assert_eq!(CommandFrame::verify_row(0, 0).response_len(), 8);
        assert_eq!(CommandFrame::verify_checksum().response_len(), 8);
        assert_eq!(CommandFrame::send_data(&[1, 2, 3]).response_len(), 7);
        assert_eq!(CommandFrame::program_row(0, 0, &[]).response_len(), 7);
    }

    #[test]
    fn test_built_frames_pass_own_checksum() {
        let payloads: [&[u8]; 4] = [&[], &[0x00], &[0x12, 0x34, 0x56], &[0xFF; 200]];
        for checksum in [ChecksumType::Sum, ChecksumType::Crc16] {
            for payload in payloads {
                let frame = build_response(STATUS_SUCCESS, payload, checksum).unwrap();
                assert!(verify_checksum(&frame, checksum).is_ok());

                let command = CommandFrame::send_data(payload);
                let decoded = CommandFrame::decode(&command.build(checksum).unwrap(), checksum)
                    .expect("decode should accept its own frame");
                assert_eq!(decoded, command);
            }
        }
        let ok = build_response(STATUS_SUCCESS, &[], ChecksumType::Crc16).unwrap();
        assert!(parse_default_response(&ok, Opcode::EraseRow, ChecksumType::Crc16).is_ok());
    }

    #[test]
    fn test_parse_enter_bootloader() {
        let info = BootloaderInfo {
            silicon_id: 0x2E133069,
            silicon_rev: 0,
            version: 0x010214,
        };
        let payload = info.to_payload();
        assert_eq!(payload, vec![0x69, 0x30, 0x13, 0x2E, 0x00, 0x14, 0x02, 0x01]);

        let buf = build_response(STATUS_SUCCESS, &payload, ChecksumType::Sum).unwrap();
        let parsed = BootloaderInfo::from_response(&buf, ChecksumType::Sum).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_parse_flash_size_and_app_status() {
        let buf = build_response(0, &[0x10, 0x00, 0xFF, 0x00], ChecksumType::Sum).unwrap();
        let range = RowRange::from_response(&buf, ChecksumType::Sum).unwrap();
        assert_eq!(range, RowRange { first: 0x10, last: 0xFF });
        assert!(range.contains(0x10));
        assert!(range.contains(0xFF));
        assert!(!range.contains(0x0F));
        assert!(!range.contains(0x100));

        let buf = build_response(0, &[0x00, 0x01], ChecksumType::Sum).unwrap();
        let status = AppStatus::from_response(&buf, ChecksumType::Sum).unwrap();
        assert!(status.is_valid());
        assert!(status.is_active());
    }

    #[test]
    fn test_parse_verify_results() {
        let buf = build_response(0, &[0x5C], ChecksumType::Crc16).unwrap();
        assert_eq!(parse_verify_row(&buf, ChecksumType::Crc16).unwrap(), 0x5C);

        let buf = build_response(0, &[0x00], ChecksumType::Sum).unwrap();
        assert!(!parse_verify_checksum(&buf, ChecksumType::Sum).unwrap());
        let buf = build_response(0, &[0x01], ChecksumType::Sum).unwrap();
        assert!(parse_verify_checksum(&buf, ChecksumType::Sum).unwrap());
    }

    #[test]
    fn test_parse_wrong_size_is_length_error() {
        let buf = build_response(0, &[], ChecksumType::Sum).unwrap();
        let err = parse_verify_row(&buf, ChecksumType::Sum).unwrap_err();
        assert!(matches!(err, Error::Length(_)), "{err:?}");
    }

    #[test]
    fn test_parse_status_before_framing() {
        // Non-zero status wins even when the stop byte is also wrong
        let mut buf = build_response(0x05, &[], ChecksumType::Sum).unwrap();
        let last = buf.len() - 1;
        buf[last] = 0x00;
        let err = parse_default_response(&buf, Opcode::SendData, ChecksumType::Sum).unwrap_err();
        assert!(matches!(err, Error::Bootloader(DeviceStatus::Cmd)), "{err:?}");
    }

    #[test]
    fn test_parse_bad_framing_is_data_error() {
        let good = build_response(0, &[0x01], ChecksumType::Sum).unwrap();

        let mut bad_start = good.clone();
        bad_start[0] = 0x02;
        let mut bad_stop = good.clone();
        bad_stop[7] = 0x18;
        let mut bad_len = good.clone();
        bad_len[2] = 0x02;
        let mut bad_sum = good;
        bad_sum[5] ^= 0xFF;

        for buf in [bad_start, bad_stop, bad_len, bad_sum] {
            let err = parse_verify_row(&buf, ChecksumType::Sum).unwrap_err();
            assert!(matches!(err, Error::Data(_)), "{buf:02X?} -> {err:?}");
        }
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        let frame = encode_frame(0x40, &[], ChecksumType::Sum).unwrap();
        assert!(matches!(
            CommandFrame::decode(&frame, ChecksumType::Sum),
            Err(Error::Cmd(_))
        ));
    }
}
