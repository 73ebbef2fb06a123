//! Serial port selection for UART bootloaders.
//!
//! Resolution order: explicit `--port`, the configured port, then
//! auto-detection. Detected USB-UART bridges that are built in or were
//! remembered in the configuration are preferred; with more than one
//! candidate the user is prompted, unless running non-interactively.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    cyboot::{DetectedPort, DeviceKind, TransportKind, device::detect_ports},
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

/// Result of port selection including whether it was a known device.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known/configured device.
    pub is_known: bool,
}

// Selection failures are usage errors so scripts can tell them apart (exit 2)
fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("Port selection cancelled".to_string()).into()
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name, detect_ports()));
    }

    if let Some(port_name) = &config
        .connection
        .serial
    {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name, detect_ports()));
    }

    let candidates = candidate_ports(detect_ports(), config);
    if options.non_interactive {
        return select_non_interactive_port(candidates, config);
    }

    match candidates.len() {
        0 => Err(usage_err(
            "No serial ports found. Connect the board or pass --port",
        )),
        1 => {
            let Some(port) = candidates
                .into_iter()
                .next()
            else {
                return Err(usage_err("No serial ports available"));
            };
            let is_known = is_known_device(&port, config);
            if is_known {
                info!("Auto-selected port: {} [{}]", port.name, port.device.name());
                Ok(SelectedPort { port, is_known })
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        _ => {
            ensure_interactive_terminal()?;
            select_port_interactive(candidates, config)
        },
    }
}

/// Known ports when there are any, otherwise everything, best first.
fn candidate_ports(ports: Vec<DetectedPort>, config: &Config) -> Vec<DetectedPort> {
    let has_known = ports
        .iter()
        .any(|p| is_known_device(p, config));

    let mut candidates: Vec<DetectedPort> = ports
        .into_iter()
        .filter(|p| !has_known || is_known_device(p, config))
        .collect();
    candidates.sort_by_key(|p| {
        (
            !p.device
                .is_high_priority(),
            !is_known_device(p, config),
        )
    });
    candidates
}

fn select_non_interactive_port(
    candidates: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    if candidates.len() > 1 {
        return Err(usage_err(
            "Multiple serial ports found; pass --port in non-interactive mode",
        ));
    }

    match candidates
        .into_iter()
        .next()
    {
        Some(port) => Ok(SelectedPort {
            is_known: is_known_device(&port, config),
            port,
        }),
        None => Err(usage_err("No serial ports available")),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            cancelled()
        },
        DialoguerError::IO(io_err) => usage_err(&format!("Prompt failed: {io_err}")),
    }
}

/// Find a port by name, falling back to a bare entry for unlisted ports.
fn find_port_by_name(name: &str, ports: Vec<DetectedPort>) -> SelectedPort {
    // Windows port names are case-insensitive
    let found = ports
        .into_iter()
        .find(|p| {
            p.name == name
                || p.name
                    .eq_ignore_ascii_case(name)
        });

    match found {
        Some(port) => SelectedPort {
            is_known: port
                .device
                .is_known(),
            port,
        },
        None => SelectedPort {
            port: DetectedPort {
                name: name.to_string(),
                transport: TransportKind::Serial,
                device: DeviceKind::Unknown,
                vid: None,
                pid: None,
                release: None,
                manufacturer: None,
                product: None,
                serial: None,
            },
            is_known: false,
        },
    }
}

/// Check if a port matches a known device (built in or remembered).
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port
        .device
        .is_known()
    {
        return true;
    }

    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .usb_device
            .iter()
            .any(|d| d.matches(vid, pid)),
        _ => false,
    }
}

fn port_label(port: &DetectedPort, config: &Config) -> String {
    let name = if is_known_device(port, config) {
        style(&port.name)
            .bold()
            .to_string()
    } else {
        port.name
            .clone()
    };

    let device_info = if port
        .device
        .is_known()
    {
        format!(" [{}]", style(port.device.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{device_info}{product}")
}

fn select_port_interactive(ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    // Keep labels on one line in narrow terminals
    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| {
            console::truncate_str(&port_label(p, config), max_item_width, "\u{2026}").into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the bootloader's serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    let Some(index) = selection else {
        return Err(cancelled());
    };
    let port = ports
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
    Ok(SelectedPort {
        is_known: is_known_device(&port, config),
        port,
    })
}

fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(cancelled())
    }
}

/// Offer to remember an unrecognised USB bridge for future auto-detection.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config
        .usb_device
        .iter()
        .any(|d| d.matches(vid, pid))
    {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Remember USB device {vid:04X}:{pid:04X} for auto-detection?"
        ))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }
    Ok(())
}
