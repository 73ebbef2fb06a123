//! Packet checksums.
//!
//! A bootloader session uses one of two algorithms, selected by the image
//! header. Both produce a 16-bit value stored low byte first in the frame.

/// Packet checksum algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ChecksumType {
    /// Two's-complement of the 16-bit byte sum.
    #[default]
    Sum,
    /// Bit-reversed CCITT CRC-16 with a final byte swap.
    Crc16,
}

impl ChecksumType {
    /// Map the header's checksum-type byte (1 selects CRC-16).
    pub fn from_header_byte(byte: u8) -> Self {
        if byte == 1 { Self::Crc16 } else { Self::Sum }
    }

    /// Byte written to an image header for this type.
    pub fn header_byte(self) -> u8 {
        match self {
            Self::Sum => 0,
            Self::Crc16 => 1,
        }
    }

    /// Compute the checksum of `data` with this algorithm.
    pub fn compute(self, data: &[u8]) -> u16 {
        match self {
            Self::Sum => sum16(data),
            Self::Crc16 => crc16(data),
        }
    }
}

/// Sum checksum: `1 + !sum` over all bytes, with 16-bit wrapping.
pub fn sum16(data: &[u8]) -> u16 {
    let sum = data
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));
    1u16.wrapping_add(!sum)
}

/// CRC-16/X-25: polynomial 0x8408 LSB first, initial value and final
/// XOR 0xFFFF.
const X25: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_IBM_SDLC);

/// CRC-16 as implemented by the device firmware.
///
/// CRC-16/X-25 with the two result bytes swapped. Empty input yields 0.
pub fn crc16(data: &[u8]) -> u16 {
    X25.checksum(data)
        .swap_bytes()
}
