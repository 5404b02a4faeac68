//! `.ipa` packaging: strip embedded frameworks, move the bundle under
//! `Payload/`, and zip it.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::ToolError;

/// Top-level directory of an `.ipa`.
pub const PAYLOAD_DIR: &str = "Payload";
pub const ARCHIVE_NAME: &str = "Payload.ipa";
const FRAMEWORKS_DIR: &str = "Frameworks";
const COMPRESSION_LEVEL: i64 = 9;

/// Remove every entry under `<bundle>/Frameworks`, keeping the directory itself.
///
/// The XCTest frameworks Xcode embeds are re-provided by the device at runtime
/// and would otherwise need signing too. A bundle without the directory is left
/// untouched.
#[instrument(skip_all, fields(bundle = %bundle.display()))]
pub fn strip_frameworks(bundle: &Path) -> Result<(), ToolError> {
    let frameworks = bundle.join(FRAMEWORKS_DIR);
    if !frameworks.is_dir() {
        debug!("no embedded frameworks");
        return Ok(());
    }
    let entries = fs::read_dir(&frameworks)
        .with_context(|| format!("read {}", frameworks.display()))
        .map_err(ToolError::packaging)?;
    let mut removed = 0usize;
    for entry in entries {
        let path = entry
            .with_context(|| format!("read {}", frameworks.display()))
            .map_err(ToolError::packaging)?
            .path();
        remove_path(&path)
            .with_context(|| format!("remove {}", path.display()))
            .map_err(ToolError::packaging)?;
        removed += 1;
    }
    debug!(removed, "stripped embedded frameworks");
    Ok(())
}

/// Move `bundle` into `dest_dir/Payload/` and zip that directory to
/// `dest_dir/Payload.ipa`.
///
/// The archive is written under a temporary name and renamed into place, so a
/// failure never leaves a truncated `Payload.ipa` behind.
#[instrument(skip_all, fields(bundle = %bundle.display(), dest = %dest_dir.display()))]
pub fn package(bundle: &Path, dest_dir: &Path) -> Result<PathBuf, ToolError> {
    let bundle_name = bundle.file_name().ok_or_else(|| {
        ToolError::Packaging(format!("bundle path {} has no name", bundle.display()))
    })?;
    if !bundle.is_dir() {
        return Err(ToolError::Packaging(format!(
            "bundle {} is not a directory",
            bundle.display()
        )));
    }

    let archive_path = dest_dir.join(ARCHIVE_NAME);
    if archive_path.is_file() {
        fs::remove_file(&archive_path)
            .with_context(|| format!("clear stale {}", archive_path.display()))
            .map_err(ToolError::packaging)?;
    }

    let payload_dir = dest_dir.join(PAYLOAD_DIR);
    stage_bundle(bundle, &payload_dir, &payload_dir.join(bundle_name))
        .map_err(ToolError::packaging)?;

    let partial_path = dest_dir.join(format!("{ARCHIVE_NAME}.partial"));
    let written = write_zip(&payload_dir, &partial_path).and_then(|()| {
        fs::rename(&partial_path, &archive_path).with_context(|| {
            format!("rename {} to {}", partial_path.display(), archive_path.display())
        })
    });
    if let Err(err) = written {
        if partial_path.exists()
            && let Err(cleanup) = fs::remove_file(&partial_path)
        {
            warn!(
                err = %cleanup,
                path = %partial_path.display(),
                "failed to remove partial archive"
            );
        }
        return Err(ToolError::packaging(err));
    }

    debug!(archive = %archive_path.display(), "packaged ipa");
    Ok(archive_path)
}

fn stage_bundle(bundle: &Path, payload_dir: &Path, staged: &Path) -> Result<()> {
    // A previous run may have left a bundle behind.
    if payload_dir.exists() {
        fs::remove_dir_all(payload_dir)
            .with_context(|| format!("clear stale {}", payload_dir.display()))?;
    }
    fs::create_dir_all(payload_dir)
        .with_context(|| format!("create {}", payload_dir.display()))?;
    fs::rename(bundle, staged)
        .with_context(|| format!("move {} to {}", bundle.display(), staged.display()))?;
    Ok(())
}

fn write_zip(payload_dir: &Path, archive_path: &Path) -> Result<()> {
    let root = payload_dir
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent", payload_dir.display()))?;
    let file = File::create(archive_path)
        .with_context(|| format!("create {}", archive_path.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let base = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(COMPRESSION_LEVEL));

    for entry in WalkDir::new(payload_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", payload_dir.display()))?;
        let path = entry.path();
        let name = archive_name(root, path)?;
        let options = base.unix_permissions(unix_mode(path)?);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            zip.add_directory(name, options)
                .with_context(|| format!("add directory {}", path.display()))?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(path)
                .with_context(|| format!("read link {}", path.display()))?;
            zip.add_symlink(name, target.to_string_lossy().into_owned(), options)
                .with_context(|| format!("add symlink {}", path.display()))?;
        } else {
            zip.start_file(name, options)
                .with_context(|| format!("add file {}", path.display()))?;
            let mut src = File::open(path).with_context(|| format!("open {}", path.display()))?;
            io::copy(&mut src, &mut zip).with_context(|| format!("compress {}", path.display()))?;
        }
    }

    let mut writer = zip.finish().context("finish zip")?;
    io::Write::flush(&mut writer).context("flush zip")?;
    Ok(())
}

/// Forward-slash path of `path` relative to `root`, e.g. `Payload/App.app/Info.plist`.
fn archive_name(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn unix_mode(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::symlink_metadata(path).with_context(|| format!("stat {}", path.display()))?;
    Ok(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn unix_mode(path: &Path) -> Result<u32> {
    let meta = fs::symlink_metadata(path).with_context(|| format!("stat {}", path.display()))?;
    Ok(if meta.is_dir() { 0o755 } else { 0o644 })
}

fn remove_path(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}
