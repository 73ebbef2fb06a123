//! cyboot CLI - Command-line tool for Cypress PSoC bootloaders.
//!
//! ## Features
//!
//! - Program, erase and verify CYACD images row by row
//! - Multi-application bootloaders (application id from the file name)
//! - Serial and USB HID bootloaders
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use cyboot::{AbortFlag, Action, app_id_from_path};
use env_logger::Env;
use log::{debug, warn};
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

mod commands;
mod config;
mod link;
mod serial;

use config::{Config, TransportChoice};

/// Errors raised by the CLI itself, classified by exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation or an ambiguous choice the user must resolve.
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration.
    #[error("{0}")]
    Config(String),
    /// The device or its link is missing or misbehaving.
    #[error("{0}")]
    Device(String),
    /// The user interrupted the operation.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::Device(_) => 4,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Exit code for a library error.
fn library_exit_code(err: &cyboot::Error) -> u8 {
    match err {
        cyboot::Error::Abort => 130,
        cyboot::Error::Communication(_)
        | cyboot::Error::DeviceNotFound
        | cyboot::Error::Device { .. }
        | cyboot::Error::Version(_)
        | cyboot::Error::Bootloader(_) => 4,
        _ => 1,
    }
}

/// Map any error to the process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<CliError>() {
        return e.exit_code();
    }
    if let Some(e) = err.downcast_ref::<cyboot::Error>() {
        return library_exit_code(e);
    }
    1
}

/// cyboot - Program Cypress PSoC devices through their bootloader.
///
/// Environment variables:
///   CYBOOT_PORT              - Serial port
///   CYBOOT_BAUD              - Serial baud rate (default: 115200)
///   CYBOOT_TRANSPORT         - serial or hid
///   CYBOOT_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "cyboot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "CYBOOT_PORT")]
    port: Option<String>,

    /// Serial baud rate [default: 115200].
    #[arg(short, long, global = true, env = "CYBOOT_BAUD")]
    baud: Option<u32>,

    /// Link to the bootloader [default: serial].
    #[arg(short, long, global = true, value_enum, env = "CYBOOT_TRANSPORT")]
    transport: Option<TransportChoice>,

    /// Largest packet the bootloader accepts, in bytes [default: 64].
    #[arg(
        long,
        global = true,
        env = "CYBOOT_MAX_TRANSFER",
        value_parser = clap::value_parser!(u16).range(16..=4096)
    )]
    max_transfer: Option<u16>,

    /// USB vendor id of the HID bootloader (hex).
    #[arg(long, global = true, env = "CYBOOT_VID", value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// USB product id of the HID bootloader (hex).
    #[arg(long, global = true, env = "CYBOOT_PID", value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "CYBOOT_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Program images that do not match the detected board.
    #[arg(long, global = true, env = "CYBOOT_FORCE")]
    force: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Program an image: write and verify every row.
    Program(ActionArgs),

    /// Erase the rows an image occupies.
    Erase(ActionArgs),

    /// Verify device flash against an image.
    Verify(ActionArgs),

    /// Show information about a CYACD image.
    Info {
        /// Path to the CYACD image.
        image: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Check that a bootloader answers and show its identity.
    Ping {
        /// Output the identity as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List serial ports and bootloader devices.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Arguments shared by program, erase and verify.
#[derive(Args, Debug)]
struct ActionArgs {
    /// CYACD image (searched for in the current directory if omitted).
    image: Option<PathBuf>,

    /// Target application id (0-based), overriding the file name.
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=14))]
    app: Option<u8>,

    /// Treat the image as single-application, ignoring the file name.
    #[arg(long, conflicts_with = "app")]
    single_app: bool,

    /// Output the result as JSON to stdout.
    #[arg(long)]
    json: bool,
}

impl ActionArgs {
    /// Application id for `image`: explicit, from the file name, or none.
    fn app_id(&self, image: &Path) -> Option<u8> {
        if self.single_app {
            return None;
        }
        self.app
            .or_else(|| app_id_from_path(image))
    }
}

/// Parse a hexadecimal id (supports 0x prefix).
fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("Invalid hex id '{s}': {e}"))
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

/// Install the Ctrl-C handler: the first press stops at the next row
/// boundary, the second exits immediately.
fn install_abort_handler(abort: &AbortFlag) {
    let flag = abort.clone();
    let installed = ctrlc::set_handler(move || {
        if flag.is_set() {
            std::process::exit(130);
        }
        flag.set();
        eprintln!(
            "\n{} Interrupted, stopping after the current row (press Ctrl-C again to force)",
            style("⚠").yellow()
        );
    });
    if let Err(e) = installed {
        warn!("Failed to install Ctrl-C handler: {e}");
    }
}

fn report_error(err: &anyhow::Error) {
    let code = err
        .downcast_ref::<cyboot::Error>()
        .map(|e| format!(" (code {:#06x})", e.code()))
        .unwrap_or_default();
    eprintln!(
        "{} {err:#}{code}",
        style("Error:")
            .red()
            .bold()
    );
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Help, version and usage errors exit here with clap's codes (0 / 2)
    let cli = Cli::parse();
    init_logging(&cli);

    debug!(
        "cyboot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::from(exit_code(&e))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let abort = AbortFlag::new();

    match &cli.command {
        Commands::Program(args) => {
            install_abort_handler(&abort);
            commands::action::cmd_action(cli, &mut config, Action::Program, args, &abort)
        },
        Commands::Erase(args) => {
            install_abort_handler(&abort);
            commands::action::cmd_action(cli, &mut config, Action::Erase, args, &abort)
        },
        Commands::Verify(args) => {
            install_abort_handler(&abort);
            commands::action::cmd_action(cli, &mut config, Action::Verify, args, &abort)
        },
        Commands::Info { image, json } => commands::info::cmd_info(image, *json),
        Commands::Ping { json } => commands::ping::cmd_ping(cli, &mut config, *json, &abort),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(cli, &config, *json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    // ---- clap validation ----

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_program() {
        let cli = Cli::try_parse_from([
            "cyboot",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "57600",
            "program",
            "SCSI2SD-V4.cyacd",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, Some(57600));
        match cli.command {
            Commands::Program(args) => {
                assert_eq!(args.image, Some(PathBuf::from("SCSI2SD-V4.cyacd")));
                assert!(args.app.is_none());
                assert!(!args.single_app);
            },
            _ => panic!("expected program"),
        }
    }

    #[test]
    fn test_cli_parse_program_without_image() {
        let cli = Cli::try_parse_from(["cyboot", "program"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Program(ActionArgs { image: None, .. })
        ));
    }

    #[test]
    fn test_cli_parse_erase_and_verify() {
        let cli = Cli::try_parse_from(["cyboot", "erase", "fw.cyacd"]).unwrap();
        assert!(matches!(cli.command, Commands::Erase(_)));
        let cli = Cli::try_parse_from(["cyboot", "verify", "fw.cyacd", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Verify(ActionArgs { json: true, .. })
        ));
    }

    #[test]
    fn test_cli_app_and_single_app_conflict() {
        let result = Cli::try_parse_from([
            "cyboot",
            "program",
            "fw_2.cyacd",
            "--app",
            "1",
            "--single-app",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_app_out_of_range() {
        let result = Cli::try_parse_from(["cyboot", "program", "fw.cyacd", "--app", "15"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_info_json() {
        let cli = Cli::try_parse_from(["cyboot", "info", "fw.cyacd", "--json"]).unwrap();
        match cli.command {
            Commands::Info { image, json } => {
                assert_eq!(image, PathBuf::from("fw.cyacd"));
                assert!(json);
            },
            _ => panic!("expected info"),
        }
    }

    #[test]
    fn test_cli_parse_ping_and_list_ports() {
        let cli = Cli::try_parse_from(["cyboot", "ping"]).unwrap();
        assert!(matches!(cli.command, Commands::Ping { json: false }));
        let cli = Cli::try_parse_from(["cyboot", "list-ports", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: true }));
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["cyboot", "completions", "bash"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions { shell: Shell::Bash }
        ));
    }

    #[test]
    fn test_cli_default_values() {
        let cli = Cli::try_parse_from(["cyboot", "list-ports"]).unwrap();
        assert!(cli.baud.is_none());
        assert!(cli.transport.is_none());
        assert!(cli.max_transfer.is_none());
        assert!(cli.vid.is_none());
        assert!(!cli.quiet);
        assert!(!cli.non_interactive);
        assert!(!cli.force);
        assert!(cli.port.is_none());
        assert!(cli.config_path.is_none());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_cli_global_options() {
        let cli = Cli::try_parse_from([
            "cyboot",
            "ping",
            "--transport",
            "hid",
            "--vid",
            "0x04b4",
            "--pid",
            "B71D",
            "--max-transfer",
            "32",
            "-vv",
            "--quiet",
            "--non-interactive",
            "--force",
            "--config",
            "/tmp/cyboot.toml",
        ])
        .unwrap();
        assert_eq!(cli.transport, Some(TransportChoice::Hid));
        assert_eq!(cli.vid, Some(0x04B4));
        assert_eq!(cli.pid, Some(0xB71D));
        assert_eq!(cli.max_transfer, Some(32));
        assert_eq!(cli.verbose, 2);
        assert!(cli.quiet);
        assert!(cli.non_interactive);
        assert!(cli.force);
        assert_eq!(cli.config_path, Some(PathBuf::from("/tmp/cyboot.toml")));
    }

    #[test]
    fn test_cli_max_transfer_too_small() {
        let result = Cli::try_parse_from(["cyboot", "--max-transfer", "4", "ping"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_invalid_transport() {
        let result = Cli::try_parse_from(["cyboot", "--transport", "usb", "ping"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["cyboot"]).is_err());
    }

    // ---- application id ----

    fn action_args(app: Option<u8>, single_app: bool) -> ActionArgs {
        ActionArgs {
            image: None,
            app,
            single_app,
            json: false,
        }
    }

    #[test]
    fn test_app_id_from_file_name() {
        let args = action_args(None, false);
        assert_eq!(args.app_id(Path::new("firmware_2.cyacd")), Some(1));
        assert_eq!(args.app_id(Path::new("firmware.cyacd")), None);
    }

    #[test]
    fn test_app_id_explicit_override() {
        let args = action_args(Some(0), false);
        assert_eq!(args.app_id(Path::new("firmware_2.cyacd")), Some(0));
    }

    #[test]
    fn test_app_id_single_app() {
        let args = action_args(None, true);
        assert_eq!(args.app_id(Path::new("firmware_2.cyacd")), None);
    }

    // ---- parse_hex_u16 ----

    #[test]
    fn test_parse_hex_u16() {
        assert_eq!(parse_hex_u16("0x04B4"), Ok(0x04B4));
        assert_eq!(parse_hex_u16("b71d"), Ok(0xB71D));
        assert_eq!(parse_hex_u16(" 0X1337 "), Ok(0x1337));
        assert!(parse_hex_u16("0x10000").is_err());
        assert!(parse_hex_u16("xyz").is_err());
    }

    // ---- exit codes ----

    #[test]
    fn test_exit_code_cli_errors() {
        assert_eq!(exit_code(&CliError::Usage(String::new()).into()), 2);
        assert_eq!(exit_code(&CliError::Config(String::new()).into()), 3);
        assert_eq!(exit_code(&CliError::Device(String::new()).into()), 4);
        assert_eq!(exit_code(&CliError::Cancelled(String::new()).into()), 130);
    }

    #[test]
    fn test_exit_code_library_errors() {
        let comm = cyboot::Error::Communication(std::io::Error::other("gone"));
        assert_eq!(exit_code(&comm.into()), 4);
        assert_eq!(exit_code(&cyboot::Error::Abort.into()), 130);
        assert_eq!(exit_code(&cyboot::Error::DeviceNotFound.into()), 4);
        assert_eq!(exit_code(&cyboot::Error::Eof.into()), 1);
        assert_eq!(exit_code(&cyboot::Error::Active(1).into()), 1);
    }

    #[test]
    fn test_exit_code_survives_context() {
        let err = anyhow::Error::new(cyboot::Error::Abort).context("program failed");
        assert_eq!(exit_code(&err), 130);
    }

    #[test]
    fn test_exit_code_generic() {
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }
}
