//! `praktor backup` / `praktor restore`.
//!
//! The whole persisted state (store, bus data dir, agent workspaces)
//! lives under one data directory, so a backup is a zstd-compressed tar
//! of that tree.

use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::domain::models::config::Config;

/// Archive member name the data directory is stored under.
const ARCHIVE_ROOT: &str = "data";

pub fn backup(config: &Config, file: &Path) -> Result<()> {
    let data_dir = Path::new(&config.data_dir);
    if !data_dir.exists() {
        bail!("data directory '{}' does not exist", data_dir.display());
    }

    if let Some(parent) = file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let output = File::create(file)
        .with_context(|| format!("failed to create {}", file.display()))?;
    let encoder = zstd::stream::write::Encoder::new(output, 0)?.auto_finish();

    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(ARCHIVE_ROOT, data_dir)
        .context("failed to pack data directory")?;
    builder.finish()?;

    println!("backed up '{}' to '{}'", data_dir.display(), file.display());
    Ok(())
}

pub fn restore(config: &Config, file: &Path, overwrite: bool) -> Result<()> {
    let data_dir = Path::new(&config.data_dir);
    if data_dir.exists() {
        if !overwrite {
            bail!(
                "data directory '{}' already exists; pass --overwrite to replace it",
                data_dir.display()
            );
        }
        std::fs::remove_dir_all(data_dir)
            .with_context(|| format!("failed to remove {}", data_dir.display()))?;
    }

    let input = File::open(file)
        .with_context(|| format!("failed to open {}", file.display()))?;
    let decoder = zstd::stream::read::Decoder::new(input)?;
    let mut archive = tar::Archive::new(decoder);

    // Entries are stored under "data/"; unpack them into the configured
    // data dir regardless of its current name.
    std::fs::create_dir_all(data_dir)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let relative: std::path::PathBuf = path
            .components()
            .skip(1)
            .collect();
        if relative.as_os_str().is_empty() {
            continue;
        }
        entry.unpack(data_dir.join(relative))?;
    }

    println!("restored '{}' from '{}'", data_dir.display(), file.display());
    Ok(())
}
