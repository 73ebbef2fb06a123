//! Image info command implementation.

use {
    anyhow::{Context, Result},
    console::style,
    cyboot::{ImageSummary, app_id_from_path},
    std::path::Path,
};

fn load_summary(image: &Path) -> Result<ImageSummary> {
    ImageSummary::from_path(image)
        .with_context(|| format!("Failed to load image {}", image.display()))
}

/// Info command implementation.
pub(crate) fn cmd_info(image: &Path, json: bool) -> Result<()> {
    let summary = load_summary(image)?;
    let app_id = app_id_from_path(image);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&info_json(&summary, app_id)).unwrap_or_default()
        );
        return Ok(());
    }

    let header = &summary.header;
    eprintln!(
        "{} {}",
        style("📦").cyan(),
        style(image.display()).bold()
    );
    eprintln!(
        "\n{}",
        style("Image Header")
            .bold()
            .underlined()
    );
    eprintln!("  Silicon ID:    {:#010X}", header.silicon_id);
    eprintln!("  Silicon rev:   {}", header.silicon_rev);
    eprintln!("  Checksum:      {:?}", header.checksum_type);
    match app_id {
        Some(id) => eprintln!("  Application:   {id}"),
        None => eprintln!("  Application:   {}", style("single").dim()),
    }

    eprintln!(
        "\n{}",
        style("Rows")
            .bold()
            .underlined()
    );
    eprintln!("  Rows:          {}", summary.row_count);
    eprintln!("  Data bytes:    {}", summary.data_bytes);
    for (array, (first, last)) in &summary.arrays {
        eprintln!(
            "  {} array {:<3} rows {first}..={last}",
            style("•").dim(),
            array
        );
    }

    Ok(())
}

fn info_json(summary: &ImageSummary, app_id: Option<u8>) -> serde_json::Value {
    let arrays: Vec<serde_json::Value> = summary
        .arrays
        .iter()
        .map(|(array, (first, last))| {
            serde_json::json!({
                "array": array,
                "first_row": first,
                "last_row": last,
            })
        })
        .collect();

    serde_json::json!({
        "silicon_id": format!("0x{:08X}", summary.header.silicon_id),
        "silicon_rev": summary.header.silicon_rev,
        "checksum_type": summary.header.checksum_type,
        "app_id": app_id,
        "row_count": summary.row_count,
        "data_bytes": summary.data_bytes,
        "arrays": arrays,
    })
}
