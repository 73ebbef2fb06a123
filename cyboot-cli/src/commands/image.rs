//! Auto-discovery and interactive selection of CYACD images.
//!
//! When the image path is omitted from `program`, `erase` or `verify`, the
//! directory tree is searched for `.cyacd` files. PSoC Creator writes them
//! below `<project>.cydsn/CortexM3/<toolchain>/{Debug,Release}`.

use {
    crate::{CliError, use_fancy_output},
    anyhow::{Context, Result},
    console::style,
    dialoguer::{Confirm, Select, theme::ColorfulTheme},
    std::{
        cmp::Ordering,
        path::{Path, PathBuf},
        time::SystemTime,
    },
};

/// Maximum directory depth when searching for images.
const MAX_SEARCH_DEPTH: usize = 6;

/// Directories to skip during search.
const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", ".svn", ".hg"];

/// Preferred directories, best first.
const PRIORITY_DIRS: &[&str] = &["release", "debug", "output", "build", "firmware"];

/// A discovered image file.
#[derive(Debug, Clone)]
pub struct ImageCandidate {
    /// Full path to the image.
    pub path: PathBuf,
    /// File size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: Option<SystemTime>,
    /// Priority score (lower = better).
    pub priority: u32,
}

impl ImageCandidate {
    /// Format file size in a human-readable way.
    pub fn human_size(&self) -> String {
        const KB: u64 = 1024;
        #[allow(clippy::cast_precision_loss)]
        if self.size >= KB {
            format!("{:.1} KB", self.size as f64 / KB as f64)
        } else {
            format!("{} B", self.size)
        }
    }

    /// Path relative to `base` for display.
    pub fn display_label(&self, base: &Path) -> String {
        let rel = self
            .path
            .strip_prefix(base)
            .unwrap_or(&self.path)
            .display();
        format!("{rel} ({})", self.human_size())
    }
}

/// Search for `.cyacd` files under `base_dir`, best candidate first.
pub fn find_images(base_dir: &Path) -> Vec<ImageCandidate> {
    let mut candidates = Vec::new();
    walk_dir(base_dir, base_dir, 0, &mut candidates);

    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| match (&b.modified, &a.modified) {
                // Newest first
                (Some(bm), Some(am)) => bm.cmp(am),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| {
                a.path
                    .components()
                    .count()
                    .cmp(
                        &b.path
                            .components()
                            .count(),
                    )
            })
    });

    candidates
}

fn walk_dir(base: &Path, dir: &Path, depth: usize, out: &mut Vec<ImageCandidate>) {
    if depth > MAX_SEARCH_DEPTH {
        return;
    }

    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            walk_dir(base, &path, depth + 1, out);
        } else if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("cyacd"))
        {
            let meta = entry
                .metadata()
                .ok();
            let size = meta
                .as_ref()
                .map_or(0, std::fs::Metadata::len);
            let modified = meta.and_then(|m| {
                m.modified()
                    .ok()
            });
            let priority = compute_priority(&path, base);
            out.push(ImageCandidate {
                path,
                size,
                modified,
                priority,
            });
        }
    }
}

/// Lower score = higher priority.
#[allow(clippy::cast_possible_truncation)] // Directory lists and path depth are tiny
fn compute_priority(path: &Path, base: &Path) -> u32 {
    let rel = path
        .strip_prefix(base)
        .unwrap_or(path);
    let components: Vec<&str> = rel
        .components()
        .filter_map(|c| {
            c.as_os_str()
                .to_str()
        })
        .collect();

    for (i, dir_name) in PRIORITY_DIRS
        .iter()
        .enumerate()
    {
        if components
            .iter()
            .any(|c| c.eq_ignore_ascii_case(dir_name))
        {
            return i as u32;
        }
    }

    PRIORITY_DIRS.len() as u32 + components.len() as u32
}

/// Use `image` when given, otherwise discover one below `base`.
///
/// # Errors
///
/// Returns a usage error when nothing is found, when several images are
/// found in non-interactive mode, or when the user cancels the prompt.
pub fn resolve_image(
    image: Option<&PathBuf>,
    base: &Path,
    non_interactive: bool,
    quiet: bool,
) -> Result<PathBuf> {
    if let Some(path) = image {
        return Ok(path.clone());
    }

    let mut candidates = find_images(base);

    if candidates.len() == 1 {
        let chosen = candidates.remove(0);
        let label = chosen.display_label(base);
        if !quiet {
            eprintln!("{} Found image {label}", style("📦").cyan());
        }
        if non_interactive {
            return Ok(chosen.path);
        }

        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Use {label}?"))
            .default(true)
            .interact()
            .context("image confirmation failed")?;
        return if confirmed {
            Ok(chosen.path)
        } else {
            Err(CliError::Cancelled("Image selection cancelled".to_string()).into())
        };
    }

    if candidates.is_empty() {
        return Err(CliError::Usage(
            "No image given and no .cyacd file found below the current directory".to_string(),
        )
        .into());
    }

    if non_interactive {
        for c in &candidates {
            eprintln!("  {}", c.display_label(base));
        }
        return Err(CliError::Usage(
            "Found multiple .cyacd images; name one explicitly in non-interactive mode"
                .to_string(),
        )
        .into());
    }

    if !quiet {
        eprintln!(
            "{} Found {} images",
            style("🔍").cyan(),
            candidates.len()
        );
    }

    let labels: Vec<String> = candidates
        .iter()
        .map(|c| c.display_label(base))
        .collect();

    let selection = if use_fancy_output() {
        Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Select an image")
            .items(&labels)
            .default(0)
            .interact_opt()
            .context("image selection failed")?
    } else {
        Select::new()
            .with_prompt("Select an image")
            .items(&labels)
            .default(0)
            .interact_opt()
            .context("image selection failed")?
    };

    match selection {
        Some(idx) => Ok(candidates
            .swap_remove(idx)
            .path),
        None => Err(CliError::Cancelled("Image selection cancelled".to_string()).into()),
    }
}
