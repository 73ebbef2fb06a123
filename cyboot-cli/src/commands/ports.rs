//! Port listing command implementation.

use {
    crate::{Cli, config::Config},
    anyhow::Result,
    console::style,
    cyboot::{
        BoardInfo, DetectedPort,
        device::{auto_detect_port, detect_ports, format_port_list},
    },
};

/// Serial ports plus, when built with HID support, Cypress HID devices.
#[cfg_attr(not(feature = "hid"), allow(unused_variables))]
fn discover(cli: &Cli, config: &Config) -> Vec<DetectedPort> {
    let mut ports = detect_ports();
    ports.sort_by_key(|p| {
        !(p.device
            .is_known()
            || p.vid
                .zip(p.pid)
                .is_some_and(|(vid, pid)| {
                    config
                        .usb_device
                        .iter()
                        .any(|d| d.matches(vid, pid))
                }))
    });

    #[cfg(feature = "hid")]
    match cyboot::device::detect_hid_devices(crate::link::hid_identity(cli, config)) {
        Ok(hid) => ports.extend(hid),
        Err(e) => log::debug!("HID enumeration failed: {e}"),
    }

    ports
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let detected = discover(cli, config);

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(port_json)
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Available ports")
            .bold()
            .underlined()
    );

    if detected.is_empty() {
        eprintln!("  {}", style("No ports found").dim());
        return Ok(());
    }

    for line in format_port_list(&detected) {
        eprintln!("  {} {line}", style("•").green());
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→")
                .green()
                .bold(),
            style(&auto_port.name)
                .cyan()
                .bold()
        );
    }

    Ok(())
}

fn port_json(p: &DetectedPort) -> serde_json::Value {
    let board = p
        .release
        .and_then(BoardInfo::from_release);
    serde_json::json!({
        "name": p.name,
        "transport": p.transport,
        "device": p.device.name(),
        "known": p.device.is_known(),
        "bootloader": p.device.is_bootloader_ready(),
        "vid": p.vid,
        "pid": p.pid,
        "release": p.release,
        "board": board,
        "manufacturer": p.manufacturer,
        "product": p.product,
        "serial": p.serial,
    })
}

#[cfg(test)]
mod tests {
    use {super::*, cyboot::{DeviceKind, TransportKind}};

    #[test]
    fn test_port_json_hid_board() {
        let port = DetectedPort {
            name: "hid:04b4:b71d".to_string(),
            transport: TransportKind::Hid,
            device: DeviceKind::CypressBootloader,
            vid: Some(0x04B4),
            pid: Some(0xB71D),
            release: Some(0x3001),
            manufacturer: None,
            product: Some("Cypress USB Bootloader".to_string()),
            serial: None,
        };
        let value = port_json(&port);
        assert_eq!(value["transport"], "hid");
        assert_eq!(value["known"], true);
        assert_eq!(value["bootloader"], true);
        assert_eq!(value["pid"], 0xB71D);
        assert_eq!(value["board"]["version"], "V3.0");
        assert_eq!(value["board"]["firmware"], "SCSI2SD-V3.cyacd");
    }

    #[test]
    fn test_port_json_plain_serial() {
        let port = DetectedPort {
            name: "/dev/ttyS0".to_string(),
            transport: TransportKind::Serial,
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            release: None,
            manufacturer: None,
            product: None,
            serial: None,
        };
        let value = port_json(&port);
        assert_eq!(value["transport"], "serial");
        assert_eq!(value["known"], false);
        assert!(value["board"].is_null());
        assert!(value["vid"].is_null());
    }
}
