//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod action;
pub(crate) mod completions;
pub(crate) mod image;
pub(crate) mod info;
pub(crate) mod ping;
pub(crate) mod ports;

/// Render a bootloader version `0x00MMmmpp` as `MM.mm.pp`.
pub(crate) fn format_version(version: u32) -> String {
    let [_, major, minor, patch] = version.to_be_bytes();
    format!("{major}.{minor}.{patch}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_version() {
        assert_eq!(format_version(0x01_0214), "1.2.20");
        assert_eq!(format_version(0), "0.0.0");
    }
}
