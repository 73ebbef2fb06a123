//! Program, erase and verify command implementations.

use {
    super::{format_version, image::resolve_image},
    crate::{ActionArgs, Cli, CliError, config::Config, link::open_transport, use_fancy_output},
    anyhow::{Context, Result},
    console::style,
    cyboot::{
        AbortFlag, Action, ActionReport, ActionRequest, ImageSummary, MultiApp, run_action,
    },
    indicatif::{ProgressBar, ProgressStyle},
    std::path::Path,
};

fn progress_bar(quiet: bool, rows: usize) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(rows as u64);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

fn verb(action: Action) -> &'static str {
    match action {
        Action::Erase => "Erasing",
        Action::Program => "Programming",
        Action::Verify => "Verifying",
    }
}

/// Program, erase or verify an image.
pub(crate) fn cmd_action(
    cli: &Cli,
    config: &mut Config,
    action: Action,
    args: &ActionArgs,
    abort: &AbortFlag,
) -> Result<()> {
    let base = std::env::current_dir().context("failed to get current directory")?;
    let image = resolve_image(args.image.as_ref(), &base, cli.non_interactive, cli.quiet)?;

    let summary = ImageSummary::from_path(&image)
        .with_context(|| format!("Failed to load image {}", image.display()))?;
    let app_id = args.app_id(&image);

    if !cli.quiet {
        print_plan(action, &image, &summary, app_id);
    }

    let transport = open_transport(cli, config, Some(&image), abort)?;
    let request = ActionRequest::new(action, &image).with_app_id(app_id);

    let pb = progress_bar(cli.quiet, summary.row_count);
    pb.set_message(verb(action));
    let result = run_action(
        &request,
        transport,
        &mut |array: u8, row: u16| {
            pb.inc(1);
            pb.set_message(format!("{} row {array}:{row}", verb(action)));
        },
        abort,
    );

    let report = match result {
        Ok(report) => {
            pb.finish_with_message("done");
            report
        },
        Err(cyboot::Error::Abort) => {
            pb.abandon_with_message("aborted");
            return Err(CliError::Cancelled(format!("{action} aborted")).into());
        },
        Err(e) => {
            pb.abandon();
            return Err(anyhow::Error::new(e).context(format!("{action} failed")));
        },
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).unwrap_or_default()
        );
    } else if !cli.quiet {
        print_report(&report);
    }
    Ok(())
}

fn print_plan(action: Action, image: &Path, summary: &ImageSummary, app_id: Option<u8>) {
    eprintln!(
        "{} {} {} ({} rows)",
        style("📦").cyan(),
        verb(action),
        style(image.display()).bold(),
        summary.row_count
    );
    if let Some(id) = app_id {
        eprintln!("{} Target application {id}", style("ℹ").blue());
    }
}

fn print_report(report: &ActionReport) {
    eprintln!(
        "{} Bootloader {} on silicon {:#010X} rev {}",
        style("ℹ").blue(),
        format_version(report.bootloader.version),
        report.bootloader.silicon_id,
        report.bootloader.silicon_rev
    );

    match (report.multi_app, report.app_id) {
        (MultiApp::Unsupported, Some(id)) => eprintln!(
            "{} Bootloader hosts a single application; application id {id} was ignored",
            style("⚠").yellow()
        ),
        (MultiApp::Supported { valid, active }, Some(id)) => eprintln!(
            "{} Application {id} before the run: {}, {}",
            style("ℹ").blue(),
            if valid { "valid" } else { "invalid" },
            if active { "active" } else { "inactive" }
        ),
        _ => {},
    }

    if report.application_verified {
        eprintln!("{} Application checksum verified", style("✓").green());
    }
    eprintln!(
        "\n{} {} complete: {} rows",
        style("🎉")
            .green()
            .bold(),
        report.action,
        report.rows
    );
}
