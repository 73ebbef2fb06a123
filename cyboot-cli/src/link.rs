//! Resolve connection settings and open the link to the bootloader.

use {
    crate::{
        Cli, CliError,
        config::{Config, TransportChoice},
        serial::{SerialOptions, ask_remember_port, select_serial_port},
    },
    anyhow::Result,
    console::style,
    cyboot::{
        AbortFlag, SerialConfig, SerialTransport, Transport,
        device::{BOOTLOADER_PID, CYPRESS_VID},
        port::DEFAULT_MAX_TRANSFER_SIZE,
    },
    log::debug,
    std::{io::IsTerminal, path::Path},
};

#[cfg(feature = "hid")]
use {
    cyboot::{DetectedPort, HidTarget, HidTransport, device::select_hid_target},
    std::{io, time::Duration},
};

/// Default serial baud rate.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Smallest usable packet: the 7-byte frame plus room for row data.
const MIN_TRANSFER_SIZE: usize = 16;

/// Bootloader polls after rebooting a SCSI2SD application.
#[cfg(feature = "hid")]
const REBOOT_WAIT_ATTEMPTS: usize = 100;

#[cfg(feature = "hid")]
const REBOOT_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// HID bootloader VID/PID: command line (and environment), config, defaults.
pub fn hid_identity(cli: &Cli, config: &Config) -> (u16, u16) {
    let hid = &config
        .connection
        .hid;
    (
        cli.vid
            .or(hid.vid)
            .unwrap_or(CYPRESS_VID),
        cli.pid
            .or(hid.pid)
            .unwrap_or(BOOTLOADER_PID),
    )
}

/// Effective connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Selected transport.
    pub transport: TransportChoice,
    /// Serial baud rate.
    pub baud: u32,
    /// Serial max transfer size.
    pub max_transfer: usize,
    /// HID vendor id.
    pub vid: u16,
    /// HID product id.
    pub pid: u16,
}

impl Connection {
    /// Command line (and environment) first, then config, then defaults.
    pub fn resolve(cli: &Cli, config: &Config) -> Result<Self> {
        let conn = &config.connection;
        let max_transfer = match cli.max_transfer {
            Some(size) => usize::from(size),
            None => conn
                .max_transfer_size
                .unwrap_or(DEFAULT_MAX_TRANSFER_SIZE),
        };
        if max_transfer < MIN_TRANSFER_SIZE {
            return Err(CliError::Config(format!(
                "max_transfer_size {max_transfer} is below the minimum of {MIN_TRANSFER_SIZE}"
            ))
            .into());
        }

        let (vid, pid) = hid_identity(cli, config);
        Ok(Self {
            transport: cli
                .transport
                .or(conn.transport)
                .unwrap_or_default(),
            baud: cli
                .baud
                .or(conn.baud)
                .unwrap_or(DEFAULT_BAUD),
            max_transfer,
            vid,
            pid,
        })
    }
}

/// Build the transport for a run; `image` enables the board check on HID.
///
/// `abort` cancels the wait for a SCSI2SD that is rebooting into its
/// bootloader.
pub fn open_transport(
    cli: &Cli,
    config: &mut Config,
    image: Option<&Path>,
    abort: &AbortFlag,
) -> Result<Box<dyn Transport>> {
    let connection = Connection::resolve(cli, config)?;
    debug!("Connection settings: {connection:?}");

    match connection.transport {
        TransportChoice::Serial => open_serial(cli, config, &connection),
        TransportChoice::Hid => open_hid(cli, config, &connection, image, abort),
    }
}

fn open_serial(
    cli: &Cli,
    config: &mut Config,
    connection: &Connection,
) -> Result<Box<dyn Transport>> {
    let options = SerialOptions {
        port: cli
            .port
            .clone(),
        non_interactive: cli.non_interactive,
    };
    let selected = select_serial_port(&options, config)?;

    // Offer to remember unrecognised bridges, never in scripts
    if !selected.is_known && !cli.non_interactive && std::io::stdin().is_terminal() {
        ask_remember_port(&selected.port, config)?;
    }

    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            style(&selected.port.name).cyan(),
            connection.baud
        );
    }

    let serial = SerialConfig::new(selected.port.name, connection.baud)
        .with_max_transfer_size(connection.max_transfer);
    Ok(Box::new(SerialTransport::new(serial)))
}

#[cfg(feature = "hid")]
fn open_hid(
    cli: &Cli,
    config: &Config,
    connection: &Connection,
    image: Option<&Path>,
    abort: &AbortFlag,
) -> Result<Box<dyn Transport>> {
    use cyboot::BoardInfo;

    let wanted = (connection.vid, connection.pid);
    let mut devices = hid_devices(wanted);
    if let HidTarget::Application(app) = select_hid_target(&devices, connection.vid, connection.pid)
    {
        reboot_application(cli, app, connection, abort)?;
        devices = hid_devices(wanted);
    }

    let target = match select_hid_target(&devices, connection.vid, connection.pid) {
        HidTarget::Bootloader(target) => target,
        HidTarget::Application(_) => {
            return Err(CliError::Device(
                "SCSI2SD is still running its application after the reboot request".to_string(),
            )
            .into());
        },
        HidTarget::Missing => return Err(cyboot::Error::DeviceNotFound.into()),
    };

    let board = target
        .release
        .and_then(BoardInfo::from_release);
    if let Some(board) = board {
        if !cli.quiet {
            eprintln!(
                "{} Found {} ({})",
                style("ℹ").blue(),
                board.description,
                board.version
            );
        }
        if let Some(image) = image {
            check_board_image(&board, image, cli.force || config.flash.force)?;
        }
    }

    Ok(Box::new(HidTransport::new(connection.vid, connection.pid)))
}

#[cfg(feature = "hid")]
fn hid_devices(wanted: (u16, u16)) -> Vec<DetectedPort> {
    match cyboot::device::detect_hid_devices(wanted) {
        Ok(devices) => devices,
        Err(e) => {
            debug!("HID enumeration failed: {e}");
            Vec::new()
        },
    }
}

/// Reboot a SCSI2SD application and wait until its bootloader answers.
#[cfg(feature = "hid")]
fn reboot_application(
    cli: &Cli,
    app: &DetectedPort,
    connection: &Connection,
    abort: &AbortFlag,
) -> Result<()> {
    let (Some(app_vid), Some(app_pid)) = (app.vid, app.pid) else {
        return Err(cyboot::Error::DeviceNotFound.into());
    };

    if !cli.quiet {
        eprintln!(
            "{} Resetting SCSI2SD into the bootloader",
            style("🔄").cyan()
        );
    }
    match cyboot::reboot_scsi2sd(app_vid, app_pid) {
        Ok(()) => {},
        Err(e) if e.kind() == io::ErrorKind::Unsupported => {
            return Err(CliError::Device(format!(
                "SCSI2SD is running its application and cannot reset itself ({e}); \
                 reconnect the USB cable and retry"
            ))
            .into());
        },
        Err(e) => return Err(cyboot::Error::Communication(e).into()),
    }

    if !cli.quiet {
        eprintln!("{} Waiting for bootloader...", style("⏳").yellow());
    }
    let (vid, pid) = (connection.vid, connection.pid);
    match cyboot::wait_for_bootloader(
        || HidTransport::new(vid, pid),
        REBOOT_WAIT_ATTEMPTS,
        REBOOT_WAIT_INTERVAL,
        abort,
    ) {
        Ok(info) => {
            debug!("Bootloader {:#08x} is up", info.version);
            Ok(())
        },
        Err(cyboot::Error::Abort) => {
            Err(CliError::Cancelled("Waiting for the bootloader was cancelled".to_string()).into())
        },
        Err(e) => Err(anyhow::Error::new(e).context("Bootloader did not appear after the reboot")),
    }
}

#[cfg(not(feature = "hid"))]
fn open_hid(
    _cli: &Cli,
    _config: &Config,
    _connection: &Connection,
    _image: Option<&Path>,
    _abort: &AbortFlag,
) -> Result<Box<dyn Transport>> {
    Err(CliError::Usage("cyboot was built without HID support (feature `hid`)".to_string()).into())
}

/// Refuse images built for a different board unless forced.
#[cfg(feature = "hid")]
fn check_board_image(board: &cyboot::BoardInfo, image: &Path, force: bool) -> Result<()> {
    let path = image.to_string_lossy();
    if board.accepts_firmware(&path) {
        return Ok(());
    }
    if force {
        log::warn!(
            "{} does not look like {}, continuing because of --force",
            image.display(),
            board.firmware
        );
        return Ok(());
    }
    Err(CliError::Usage(format!(
        "{} expects {}, not {}; pass --force to program it anyway",
        board.description,
        board.firmware,
        image.display()
    ))
    .into())
}
