//! Firmware image formats.

pub mod cyacd;

pub use cyacd::{CyacdReader, FlashRow, ImageHeader, ImageSummary, app_id_from_path};
