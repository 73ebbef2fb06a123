//! Bootloader wire protocol: checksums and frame codec.

pub mod checksum;
pub mod packet;

// Re-export common types
pub use {
    checksum::ChecksumType,
    packet::{AppStatus, BootloaderInfo, CommandFrame, Opcode, RowRange},
};
