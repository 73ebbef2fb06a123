//! Bootloader ping command implementation.

use {
    super::format_version,
    crate::{Cli, config::Config, link::open_transport},
    anyhow::{Context, Result},
    console::style,
    cyboot::{AbortFlag, BootloaderInfo},
};

/// Ping command implementation.
pub(crate) fn cmd_ping(
    cli: &Cli,
    config: &mut Config,
    json: bool,
    abort: &AbortFlag,
) -> Result<()> {
    let transport = open_transport(cli, config, None, abort)?;

    if !cli.quiet {
        eprintln!("{} Waiting for bootloader...", style("⏳").yellow());
    }
    let info = cyboot::ping(transport).context("Bootloader did not answer")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&ping_json(&info)).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!(
        "{} Bootloader {} on silicon {:#010X} rev {}",
        style("✓").green(),
        style(format_version(info.version)).bold(),
        info.silicon_id,
        info.silicon_rev
    );
    Ok(())
}

fn ping_json(info: &BootloaderInfo) -> serde_json::Value {
    serde_json::json!({
        "silicon_id": format!("0x{:08X}", info.silicon_id),
        "silicon_rev": info.silicon_rev,
        "version": format_version(info.version),
    })
}
