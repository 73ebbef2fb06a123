//! CYACD firmware image format.
//!
//! A CYACD file is ASCII text, one record per line. The first line is the
//! header; every following line is one flash row.
//!
//! ## Header Line
//!
//! ```text
//! +----------------+-------------+-----------------+
//! | Silicon ID     | Silicon Rev | Checksum Type   |
//! +----------------+-------------+-----------------+
//! | 4 bytes (BE)   | 1 byte      | 1 byte, optional|
//! +----------------+-------------+-----------------+
//! ```
//!
//! ## Row Line
//!
//! ```text
//! +---+----------+-------------+-------------+-----------+----------+
//! | : | Array ID | Row Number  | Data Size   | Data      | Checksum |
//! +---+----------+-------------+-------------+-----------+----------+
//! |   | 1 byte   | 2 bytes (BE)| 2 bytes (BE)| Size bytes| 1 byte   |
//! +---+----------+-------------+-------------+-----------+----------+
//! ```
//!
//! Every field is written as hex pairs. Rows are streamed one
//! at a time; the image is never materialised in memory.

use {
    crate::{
        error::{Error, Result},
        protocol::checksum::ChecksumType,
    },
    byteorder::{BigEndian, ReadBytesExt, WriteBytesExt},
    log::debug,
    std::{
        collections::BTreeMap,
        fs::File,
        io::{BufRead, BufReader},
        path::Path,
    },
};

/// Marker that starts every row line.
pub const ROW_MARKER: char = ':';

/// Decoded bytes a header must carry (silicon ID and revision).
const HEADER_MIN_LEN: usize = 5;

/// Decoded bytes of a row besides its data: array, row, size, checksum.
const ROW_OVERHEAD: usize = 6;

/// Image header: target identity and packet checksum algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ImageHeader {
    /// Silicon ID the image was built for.
    pub silicon_id: u32,
    /// Silicon revision the image was built for.
    pub silicon_rev: u8,
    /// Packet checksum the bootloader expects.
    pub checksum_type: ChecksumType,
}

impl ImageHeader {
    /// Parse a header line (CR/LF already stripped).
    pub fn parse(line: &str) -> Result<Self> {
        let bytes = decode_hex(line)?;
        if bytes.len() < HEADER_MIN_LEN {
            return Err(Error::Length(format!(
                "header has {} bytes, expected at least {HEADER_MIN_LEN}",
                bytes.len()
            )));
        }

        let mut cursor = &bytes[..];
        let silicon_id = cursor
            .read_u32::<BigEndian>()
            .map_err(truncated)?;
        let silicon_rev = cursor
            .read_u8()
            .map_err(truncated)?;
        let checksum_type = cursor
            .first()
            .map_or(ChecksumType::Sum, |&b| ChecksumType::from_header_byte(b));

        Ok(Self {
            silicon_id,
            silicon_rev,
            checksum_type,
        })
    }

    /// Serialise as a header line, checksum-type byte included.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_line(&self) -> String {
        let mut bytes = Vec::with_capacity(6);
        bytes
            .write_u32::<BigEndian>(self.silicon_id)
            .unwrap();
        bytes.push(self.silicon_rev);
        bytes.push(
            self.checksum_type
                .header_byte(),
        );
        encode_hex(&bytes)
    }
}

/// One flash row record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashRow {
    /// Flash array the row belongs to.
    pub array_id: u8,
    /// Row number within the array.
    pub row: u16,
    /// Row contents.
    pub data: Vec<u8>,
    /// Row checksum from the file.
    pub checksum: u8,
}

impl FlashRow {
    /// Parse a row line (CR/LF already stripped).
    pub fn parse(line: &str) -> Result<Self> {
        if line.len() <= ROW_OVERHEAD {
            return Err(Error::Length(format!(
                "row line of {} characters is too short",
                line.len()
            )));
        }
        let Some(hex_part) = line.strip_prefix(ROW_MARKER) else {
            return Err(Error::Cmd(format!(
                "row line does not start with '{ROW_MARKER}'"
            )));
        };

        let bytes = decode_hex(hex_part)?;
        if bytes.len() < ROW_OVERHEAD {
            return Err(Error::Length(format!(
                "row has {} bytes, expected at least {ROW_OVERHEAD}",
                bytes.len()
            )));
        }

        let mut cursor = &bytes[..];
        let array_id = cursor
            .read_u8()
            .map_err(truncated)?;
        let row = cursor
            .read_u16::<BigEndian>()
            .map_err(truncated)?;
        let size = usize::from(
            cursor
                .read_u16::<BigEndian>()
                .map_err(truncated)?,
        );
        if size + ROW_OVERHEAD != bytes.len() {
            return Err(Error::Data(format!(
                "row {array_id}:{row} declares {size} data bytes but carries {}",
                bytes.len() - ROW_OVERHEAD
            )));
        }

        Ok(Self {
            array_id,
            row,
            data: cursor[..size].to_vec(),
            checksum: bytes[bytes.len() - 1],
        })
    }

    /// Serialise as a row line.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_line(&self) -> String {
        let mut bytes = Vec::with_capacity(self.data.len() + ROW_OVERHEAD);
        bytes.push(self.array_id);
        bytes
            .write_u16::<BigEndian>(self.row)
            .unwrap();
        bytes
            .write_u16::<BigEndian>(self.data.len() as u16)
            .unwrap();
        bytes.extend_from_slice(&self.data);
        bytes.push(self.checksum);
        format!("{ROW_MARKER}{}", encode_hex(&bytes))
    }

    /// Checksum the device reports for this row after programming.
    ///
    /// The file checksum also covers the row address and size while the
    /// device's covers only the data, so those bytes are added back
    /// modulo 256 to cancel them.
    pub fn device_checksum(&self) -> u8 {
        let [row_hi, row_lo] = self.row.to_be_bytes();
        let [size_hi, size_lo] = (self.data.len() as u16).to_be_bytes();
        [self.array_id, row_lo, row_hi, size_lo, size_hi]
            .iter()
            .fold(self.checksum, |acc, &b| acc.wrapping_add(b))
    }
}

fn truncated(_: std::io::Error) -> Error {
    Error::Length("record is truncated".into())
}

fn decode_hex(text: &str) -> Result<Vec<u8>> {
    hex::decode(text).map_err(|e| match e {
        hex::FromHexError::OddLength => {
            Error::Length(format!("odd number of hex digits ({})", text.len()))
        },
        other => Error::Data(other.to_string()),
    })
}

fn encode_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Line reader over a CYACD source.
pub struct CyacdReader<R> {
    reader: R,
    line: String,
    line_number: usize,
}

impl CyacdReader<BufReader<File>> {
    /// Open an image file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(Error::File)?;
        debug!("Opened image {}", path.display());
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> CyacdReader<R> {
    /// Wrap a buffered source.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_number: 0,
        }
    }

    /// Read the next line without its CR/LF terminator.
    ///
    /// Returns [`Error::Eof`] once the source is exhausted.
    pub fn read_line(&mut self) -> Result<&str> {
        self.line
            .clear();
        let n = self
            .reader
            .read_line(&mut self.line)
            .map_err(Error::File)?;
        if n == 0 {
            return Err(Error::Eof);
        }
        self.line_number += 1;
        let trimmed = self
            .line
            .trim_end_matches(['\r', '\n']);
        Ok(trimmed)
    }

    /// Read and parse the header line.
    pub fn read_header(&mut self) -> Result<ImageHeader> {
        let line = self.read_line()?;
        ImageHeader::parse(line)
    }

    /// Read and parse the next row; [`Error::Eof`] at end of image.
    pub fn read_row(&mut self) -> Result<FlashRow> {
        let line = self.read_line()?;
        FlashRow::parse(line)
    }

    /// Number of lines consumed so far.
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    /// Iterate over the remaining rows, stopping at end of file.
    pub fn rows(&mut self) -> Rows<'_, R> {
        Rows { reader: self }
    }
}

/// Iterator returned by [`CyacdReader::rows`].
pub struct Rows<'a, R> {
    reader: &'a mut CyacdReader<R>,
}

impl<R: BufRead> Iterator for Rows<'_, R> {
    type Item = Result<FlashRow>;

    fn next(&mut self) -> Option<Self::Item> {
        match self
            .reader
            .read_row()
        {
            Err(Error::Eof) => None,
            other => Some(other),
        }
    }
}

/// Application id encoded in an image file name.
///
/// Multi-application images are named `<name>_<N>.<ext>` where `N` is a
/// 1-based hex digit; the returned id is 0-based. Returns `None` when the
/// name does not follow the convention.
pub fn app_id_from_path(path: impl AsRef<Path>) -> Option<u8> {
    let name = path
        .as_ref()
        .file_name()?
        .to_str()?;
    let (_, tail) = name.rsplit_once('_')?;
    let mut chars = tail.chars();
    let digit = chars.next()?;
    if chars.next() != Some('.') {
        return None;
    }
    let value = digit.to_digit(16)?;
    // Digit 0 has no 0-based counterpart
    u8::try_from(value)
        .ok()?
        .checked_sub(1)
}

/// Whole-image statistics, gathered in one streaming pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    /// Image header.
    pub header: ImageHeader,
    /// Number of row records.
    pub row_count: usize,
    /// Total row data bytes.
    pub data_bytes: usize,
    /// Lowest and highest row seen per array.
    pub arrays: BTreeMap<u8, (u16, u16)>,
}

impl ImageSummary {
    /// Scan an image file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = CyacdReader::open(path)?;
        Self::from_reader(&mut reader)
    }

    /// Scan an already opened image from its header onwards.
    pub fn from_reader<R: BufRead>(reader: &mut CyacdReader<R>) -> Result<Self> {
        let header = reader.read_header()?;
        let mut summary = Self {
            header,
            row_count: 0,
            data_bytes: 0,
            arrays: BTreeMap::new(),
        };

        for row in reader.rows() {
            let row = row?;
            summary.row_count += 1;
            summary.data_bytes += row
                .data
                .len();
            summary
                .arrays
                .entry(row.array_id)
                .and_modify(|(lo, hi)| {
                    *lo = (*lo).min(row.row);
                    *hi = (*hi).max(row.row);
                })
                .or_insert((row.row, row.row));
        }
        Ok(summary)
    }
}
