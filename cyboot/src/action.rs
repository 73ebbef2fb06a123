//! Program, erase and verify a whole image.
//!
//! [`run_action`] streams rows from a CYACD image into a [`Session`],
//! moving through these stages:
//!
//! ```text
//! Init ──► Entered ──► Streaming ──► Finalizing ──► Exited
//!  open     start       one row       activate app   end session
//!  header   app status  per line      or verify app
//! ```
//!
//! The first error ends the run. The session is still ended unless the
//! error came from the transport, and the image is always closed.

use {
    crate::{
        error::{Error, Result},
        image::{CyacdReader, ImageHeader, app_id_from_path},
        port::Transport,
        protocol::BootloaderInfo,
        session::Session,
    },
    log::{debug, info, warn},
    std::{
        fmt,
        io::BufRead,
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
    },
};

/// First bootloader version that implements VerifyChecksum.
pub const VERIFY_APPLICATION_MIN_VERSION: u32 = 0x01_0214;

/// Operation applied to every row of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Action {
    /// Erase each row.
    Erase,
    /// Program each row, then verify it.
    Program,
    /// Verify each row against the image.
    Verify,
}

impl Action {
    /// Whether the action changes flash contents.
    pub fn modifies_flash(self) -> bool {
        !matches!(self, Self::Verify)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Erase => "erase",
            Self::Program => "program",
            Self::Verify => "verify",
        })
    }
}

/// What to do and with which image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    /// Operation to run.
    pub action: Action,
    /// CYACD image path.
    pub path: PathBuf,
    /// Target application of a multi-application bootloader.
    pub app_id: Option<u8>,
}

impl ActionRequest {
    /// Build a request, deriving the application id from the file name.
    pub fn new(action: Action, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let app_id = app_id_from_path(&path);
        Self {
            action,
            path,
            app_id,
        }
    }

    /// Override the application id.
    #[must_use]
    pub fn with_app_id(mut self, app_id: Option<u8>) -> Self {
        self.app_id = app_id;
        self
    }
}

/// Cancellation flag checked once per row.
///
/// Clones share the same flag, so one can be moved into a signal handler
/// while another is passed to [`run_action`].
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    /// Create a cleared flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the running action stop at the next row boundary.
    pub fn set(&self) {
        self.0
            .store(true, Ordering::SeqCst);
    }

    /// Whether an abort was requested.
    pub fn is_set(&self) -> bool {
        self.0
            .load(Ordering::SeqCst)
    }
}

/// Receives a notification after each completed row.
pub trait ProgressSink {
    /// Called once the row `row` of `array_id` has been processed.
    fn update(&mut self, array_id: u8, row: u16);
}

impl<F: FnMut(u8, u16)> ProgressSink for F {
    fn update(&mut self, array_id: u8, row: u16) {
        self(array_id, row);
    }
}

/// Multi-application outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case", tag = "kind"))]
pub enum MultiApp {
    /// No application id was given; the image was treated as single-app.
    NotRequested,
    /// The bootloader reported the application's status before the run.
    Supported {
        /// Application was valid.
        valid: bool,
        /// Application was active.
        active: bool,
    },
    /// The bootloader rejected GetAppStatus; it hosts a single application.
    Unsupported,
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ActionReport {
    /// Operation that ran.
    pub action: Action,
    /// Rows processed.
    pub rows: usize,
    /// Identity reported by the bootloader.
    pub bootloader: BootloaderInfo,
    /// Target application id, if any.
    pub app_id: Option<u8>,
    /// Multi-application handling.
    pub multi_app: MultiApp,
    /// Whether the bootloader validated the whole application.
    pub application_verified: bool,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Init,
    Entered,
    Streaming,
    Finalizing,
    Exited,
}

/// Run `request` against the device on `transport`.
pub fn run_action<T, P>(
    request: &ActionRequest,
    transport: T,
    progress: &mut P,
    abort: &AbortFlag,
) -> Result<ActionReport>
where
    T: Transport,
    P: ProgressSink + ?Sized,
{
    let mut reader = CyacdReader::open(&request.path)?;
    info!("{} {}", request.action, display_name(&request.path));
    run_action_from(
        request.action,
        request.app_id,
        &mut reader,
        transport,
        progress,
        abort,
    )
}

/// Run an action over an already opened image.
pub fn run_action_from<R, T, P>(
    action: Action,
    app_id: Option<u8>,
    reader: &mut CyacdReader<R>,
    transport: T,
    progress: &mut P,
    abort: &AbortFlag,
) -> Result<ActionReport>
where
    R: BufRead,
    T: Transport,
    P: ProgressSink + ?Sized,
{
    debug!("Stage {:?}", Stage::Init);
    let header = reader.read_header()?;
    let mut session = Session::with_checksum(transport, header.checksum_type);

    let result = drive(
        &mut session,
        action,
        app_id,
        &header,
        reader,
        progress,
        abort,
    );
    let result = session.finish(result);
    debug!("Stage {:?}", Stage::Exited);

    match &result {
        Ok(report) => info!("{action} finished: {} rows", report.rows),
        Err(e) => warn!("{action} failed at line {}: {e}", reader.line_number()),
    }
    result
}

fn drive<R, T, P>(
    session: &mut Session<T>,
    action: Action,
    app_id: Option<u8>,
    header: &ImageHeader,
    reader: &mut CyacdReader<R>,
    progress: &mut P,
    abort: &AbortFlag,
) -> Result<ActionReport>
where
    R: BufRead,
    T: Transport,
    P: ProgressSink + ?Sized,
{
    let bootloader = session.start(header.silicon_id, header.silicon_rev)?;
    debug!("Stage {:?}", Stage::Entered);

    let mut report = ActionReport {
        action,
        rows: 0,
        bootloader,
        app_id,
        multi_app: MultiApp::NotRequested,
        application_verified: false,
    };

    if let Some(id) = app_id {
        match session.application_status(id) {
            Ok(status) => {
                report.multi_app = MultiApp::Supported {
                    valid: status.is_valid(),
                    active: status.is_active(),
                };
                if action.modifies_flash() && status.is_active() {
                    return Err(Error::Active(id));
                }
            },
            Err(e) if e.is_unsupported_command() => {
                warn!("Bootloader does not support multiple applications, ignoring app id {id}");
                report.multi_app = MultiApp::Unsupported;
            },
            Err(e) => return Err(e),
        }
    }

    debug!("Stage {:?}", Stage::Streaming);
    loop {
        if abort.is_set() {
            return Err(Error::Abort);
        }

        let row = match reader.read_row() {
            Ok(row) => row,
            Err(Error::Eof) => break,
            Err(e) => return Err(e),
        };

        match action {
            Action::Erase => session.erase_row(row.array_id, row.row)?,
            Action::Program => {
                session.program_row(row.array_id, row.row, &row.data)?;
                session.verify_row(row.array_id, row.row, row.device_checksum())?;
            },
            Action::Verify => session.verify_row(row.array_id, row.row, row.device_checksum())?,
        }

        report.rows += 1;
        progress.update(row.array_id, row.row);
    }

    debug!("Stage {:?}", Stage::Finalizing);
    match (action, app_id) {
        (Action::Program, Some(id)) => match session.application_status(id) {
            Ok(status) if status.is_valid() => {
                session.set_active_application(id)?;
                info!("Application {id} set active");
            },
            Ok(status) => {
                return Err(Error::Checksum {
                    expected: 0,
                    actual: status.validity,
                });
            },
            Err(e) if e.is_unsupported_command() => {},
            Err(e) => return Err(e),
        },
        (Action::Program | Action::Verify, _)
            if bootloader.version >= VERIFY_APPLICATION_MIN_VERSION =>
        {
            session.verify_application()?;
            report.application_verified = true;
        },
        _ => {},
    }

    Ok(report)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            error::DeviceStatus,
            image::FlashRow,
            protocol::{AppStatus, ChecksumType, Opcode},
            testing::{SimulatedDevice, flash_row, image_text},
        },
        std::io::Cursor,
    };

    fn rows() -> Vec<FlashRow> {
        (0..4u16)
            .map(|row| {
                flash_row(
                    0,
                    row,
                    (0..100u8)
                        .map(|b| b.wrapping_mul(row as u8 + 3))
                        .collect(),
                )
            })
            .collect()
    }

    fn reader_for(text: &str) -> CyacdReader<Cursor<Vec<u8>>> {
        CyacdReader::new(Cursor::new(text.as_bytes().to_vec()))
    }

    fn run(
        device: &mut SimulatedDevice,
        action: Action,
        app_id: Option<u8>,
        text: &str,
    ) -> Result<ActionReport> {
        let mut reader = reader_for(text);
        run_action_from(
            action,
            app_id,
            &mut reader,
            device,
            &mut |_: u8, _: u16| {},
            &AbortFlag::new(),
        )
    }

    fn row_commands(device: &SimulatedDevice) -> usize {
        device.count(Opcode::GetFlashSize)
            + device.count(Opcode::ProgramRow)
            + device.count(Opcode::EraseRow)
            + device.count(Opcode::VerifyRow)
            + device.count(Opcode::SendData)
    }

    #[test]
    fn test_program_single_app() {
        let rows = rows();
        let text = image_text(ChecksumType::Sum, &rows);
        let mut device = SimulatedDevice::new();
        let mut seen = Vec::new();

        let report = {
            let mut reader = reader_for(&text);
            run_action_from(
                Action::Program,
                None,
                &mut reader,
                &mut device,
                &mut |array: u8, row: u16| seen.push((array, row)),
                &AbortFlag::new(),
            )
            .unwrap()
        };

        assert_eq!(report.rows, 4);
        assert_eq!(report.multi_app, MultiApp::NotRequested);
        assert!(report.application_verified);
        assert_eq!(seen, vec![(0, 0), (0, 1), (0, 2), (0, 3)]);
        for row in &rows {
            assert_eq!(device.flash[&(0, row.row)], row.data);
        }
        assert_eq!(device.count(Opcode::GetFlashSize), 1);
        assert_eq!(device.count(Opcode::VerifyRow), 4);
        assert_eq!(device.count(Opcode::VerifyChecksum), 1);
        assert_eq!(device.opcodes().last(), Some(&Opcode::ExitBootloader));
        assert_eq!(device.closed, 1);
    }

    #[test]
    fn test_program_with_crc16() {
        let text = image_text(ChecksumType::Crc16, &rows());
        let mut device = SimulatedDevice::new();
        device.checksum = ChecksumType::Crc16;
        let report = run(&mut device, Action::Program, None, &text).unwrap();
        assert_eq!(report.rows, 4);
    }

    #[test]
    fn test_verify_and_erase() {
        let text = image_text(ChecksumType::Sum, &rows());
        let mut device = SimulatedDevice::new();
        run(&mut device, Action::Program, None, &text).unwrap();

        let report = run(&mut device, Action::Verify, None, &text).unwrap();
        assert_eq!(report.rows, 4);
        assert_eq!(device.count(Opcode::ProgramRow), 4);

        run(&mut device, Action::Erase, None, &text).unwrap();
        assert!(device.flash.is_empty());

        let err = run(&mut device, Action::Verify, None, &text).unwrap_err();
        assert!(matches!(err, Error::Checksum { .. }));
        // Session still ended after a device-level failure
        assert_eq!(device.opcodes().last(), Some(&Opcode::ExitBootloader));
    }

    #[test]
    fn test_old_bootloader_skips_application_verify() {
        let text = image_text(ChecksumType::Sum, &rows());
        let mut device = SimulatedDevice::new();
        device.info.version = 0x01_0213;
        let report = run(&mut device, Action::Program, None, &text).unwrap();
        assert!(!report.application_verified);
        assert_eq!(device.count(Opcode::VerifyChecksum), 0);
    }

    #[test]
    fn test_erase_skips_application_verify() {
        let text = image_text(ChecksumType::Sum, &rows());
        let mut device = SimulatedDevice::new();
        run(&mut device, Action::Erase, None, &text).unwrap();
        assert_eq!(device.count(Opcode::VerifyChecksum), 0);
    }

    #[test]
    fn test_active_app_is_protected() {
        let text = image_text(ChecksumType::Sum, &rows());
        for action in [Action::Program, Action::Erase] {
            let mut device = SimulatedDevice::new();
            device.apps.insert(
                1,
                AppStatus {
                    validity: 0,
                    active: 1,
                },
            );
            let err = run(&mut device, action, Some(1), &text).unwrap_err();
            assert!(matches!(err, Error::Active(1)), "{action}: {err}");
            assert_eq!(row_commands(&device), 0, "{action}");
            assert_eq!(device.count(Opcode::ExitBootloader), 1);
        }
    }

    #[test]
    fn test_active_app_can_be_verified() {
        let text = image_text(ChecksumType::Sum, &rows());
        let mut device = SimulatedDevice::new();
        run(&mut device, Action::Program, None, &text).unwrap();
        device.apps.insert(
            1,
            AppStatus {
                validity: 0,
                active: 1,
            },
        );

        let report = run(&mut device, Action::Verify, Some(1), &text).unwrap();
        assert_eq!(
            report.multi_app,
            MultiApp::Supported {
                valid: true,
                active: true
            }
        );
        assert!(report.application_verified);
    }

    #[test]
    fn test_program_activates_application() {
        let text = image_text(ChecksumType::Sum, &rows());
        let mut device = SimulatedDevice::new();
        device.apps.insert(
            0,
            AppStatus {
                validity: 0,
                active: 0,
            },
        );

        let report = run(&mut device, Action::Program, Some(0), &text).unwrap();
        assert_eq!(
            report.multi_app,
            MultiApp::Supported {
                valid: true,
                active: false
            }
        );
        assert!(device.apps[&0].is_active());
        assert_eq!(device.count(Opcode::SetActiveApp), 1);
        // Activation replaces the whole-application verify
        assert_eq!(device.count(Opcode::VerifyChecksum), 0);
        assert!(!report.application_verified);
    }

    #[test]
    fn test_program_invalid_application_fails() {
        let text = image_text(ChecksumType::Sum, &rows());
        let mut device = SimulatedDevice::new();
        device.apps.insert(
            0,
            AppStatus {
                validity: 1,
                active: 0,
            },
        );

        let err = run(&mut device, Action::Program, Some(0), &text).unwrap_err();
        assert!(matches!(
            err,
            Error::Checksum {
                expected: 0,
                actual: 1
            }
        ));
        assert_eq!(device.count(Opcode::SetActiveApp), 0);
    }

    #[test]
    fn test_single_app_bootloader_ignores_app_id() {
        let text = image_text(ChecksumType::Sum, &rows());
        let mut device = SimulatedDevice::new();
        device
            .reject
            .insert(Opcode::GetAppStatus, DeviceStatus::Cmd.code());

        let report = run(&mut device, Action::Program, Some(0), &text).unwrap();
        assert_eq!(report.multi_app, MultiApp::Unsupported);
        assert_eq!(report.rows, 4);
        assert_eq!(device.count(Opcode::GetAppStatus), 2);
        assert_eq!(device.count(Opcode::SetActiveApp), 0);
    }

    #[test]
    fn test_app_status_other_error_fails() {
        let text = image_text(ChecksumType::Sum, &rows());
        let mut device = SimulatedDevice::new();
        device
            .reject
            .insert(Opcode::GetAppStatus, DeviceStatus::Data.code());
        let err = run(&mut device, Action::Program, Some(0), &text).unwrap_err();
        assert!(matches!(err, Error::Bootloader(DeviceStatus::Data)));
        assert_eq!(row_commands(&device), 0);
    }

    #[test]
    fn test_abort_at_row_boundary() {
        let text = image_text(ChecksumType::Sum, &rows());
        let mut device = SimulatedDevice::new();
        let abort = AbortFlag::new();
        let trigger = abort.clone();
        let mut completed = 0;

        let err = {
            let mut reader = reader_for(&text);
            run_action_from(
                Action::Program,
                None,
                &mut reader,
                &mut device,
                &mut |_: u8, _: u16| {
                    completed += 1;
                    if completed == 2 {
                        trigger.set();
                    }
                },
                &abort,
            )
            .unwrap_err()
        };

        assert!(matches!(err, Error::Abort));
        assert_eq!(completed, 2);
        assert_eq!(
            device
                .flash
                .keys()
                .copied()
                .collect::<Vec<_>>(),
            vec![(0, 0), (0, 1)]
        );
        assert_eq!(device.count(Opcode::ExitBootloader), 1);
    }

    #[test]
    fn test_communication_failure_skips_exit() {
        let text = image_text(ChecksumType::Sum, &rows());
        let mut device = SimulatedDevice::new();
        device.fail_on = Some(Opcode::ProgramRow);
        let err = run(&mut device, Action::Program, None, &text).unwrap_err();
        assert!(err.is_communication());
        assert_eq!(device.count(Opcode::ExitBootloader), 0);
        assert_eq!(device.closed, 0);
    }

    #[test]
    fn test_header_error_never_opens_transport() {
        let mut device = SimulatedDevice::new();
        let err = run(&mut device, Action::Program, None, "2E13\n").unwrap_err();
        assert!(matches!(err, Error::Length(_)));
        assert_eq!(device.opened, 0);
        assert!(device.log.is_empty());
    }

    #[test]
    fn test_device_mismatch_still_exits() {
        let text = image_text(ChecksumType::Sum, &rows());
        let mut device = SimulatedDevice::new();
        device.info.silicon_id = 0x0BAD_0BAD;
        let err = run(&mut device, Action::Program, None, &text).unwrap_err();
        assert!(matches!(err, Error::Device { .. }));
        assert_eq!(
            device.opcodes(),
            vec![Opcode::EnterBootloader, Opcode::ExitBootloader]
        );
    }

    #[test]
    fn test_malformed_row_stops_run() {
        let mut text = image_text(ChecksumType::Sum, &rows()[..1]);
        text.push_str("000000000100FF\n");
        let mut device = SimulatedDevice::new();
        let err = run(&mut device, Action::Program, None, &text).unwrap_err();
        assert!(matches!(err, Error::Cmd(_)));
        assert_eq!(device.count(Opcode::ProgramRow), 1);
        assert_eq!(device.count(Opcode::ExitBootloader), 1);
    }

    #[test]
    fn test_run_action_reads_app_id_from_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("firmware_2.cyacd");
        std::fs::write(&path, image_text(ChecksumType::Sum, &rows())).unwrap();

        let mut device = SimulatedDevice::new();
        device.apps.insert(
            1,
            AppStatus {
                validity: 0,
                active: 0,
            },
        );

        let request = ActionRequest::new(Action::Program, &path);
        assert_eq!(request.app_id, Some(1));
        let report =
            run_action(&request, &mut device, &mut |_: u8, _: u16| {}, &AbortFlag::new()).unwrap();
        assert_eq!(report.app_id, Some(1));
        assert!(device.apps[&1].is_active());

        let single = ActionRequest::new(Action::Verify, &path).with_app_id(None);
        let report =
            run_action(&single, &mut device, &mut |_: u8, _: u16| {}, &AbortFlag::new()).unwrap();
        assert_eq!(report.multi_app, MultiApp::NotRequested);
    }

    #[test]
    fn test_missing_image_is_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let request = ActionRequest::new(Action::Verify, dir.path().join("missing.cyacd"));
        let mut device = SimulatedDevice::new();
        let err = run_action(&request, &mut device, &mut |_: u8, _: u16| {}, &AbortFlag::new())
            .unwrap_err();
        assert!(matches!(err, Error::File(_)));
        assert_eq!(device.opened, 0);
    }

    #[test]
    fn test_abort_flag_is_shared() {
        let flag = AbortFlag::new();
        let other = flag.clone();
        assert!(!flag.is_set());
        other.set();
        assert!(flag.is_set());
    }
}
