//! Artifact extraction into a staging directory.
//!
//! Handles the archive formats release pages actually ship:
//! - **tar.gz** - GZIP-compressed tar
//! - **tar.xz** - XZ-compressed tar (GAM's macOS releases)
//! - **tar** - uncompressed
//! - **raw** - a bare executable, copied in and marked executable
//!
//! Release tarballs usually wrap everything in a top-level directory
//! (`gam/gam`, `gam/lib/...`); `strip_components` drops it so the payload
//! lands directly under the destination.
//!
//! Entries that would land outside the destination (absolute paths, `..`,
//! links pointing out) are rejected and extraction fails.

use crate::manifest::ArchiveKind;
use crate::symlink::normalize_path;
use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tar::{Archive, EntryType};
use xz2::read::XzDecoder;

/// Unpack `artifact` into `dest`, returning the number of entries written.
///
/// `cancel` is polled between entries; when set, extraction stops with an
/// error and the caller discards `dest`.
pub fn unpack(
    artifact: &Path,
    kind: ArchiveKind,
    file_name: &str,
    dest: &Path,
    strip_components: usize,
    cancel: &AtomicBool,
) -> Result<usize> {
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory: {}", dest.display()))?;

    let file = fs::File::open(artifact)
        .with_context(|| format!("Failed to open artifact: {}", artifact.display()))?;

    match kind {
        ArchiveKind::TarGz => unpack_tar(GzDecoder::new(file), dest, strip_components, cancel),
        ArchiveKind::TarXz => unpack_tar(XzDecoder::new(file), dest, strip_components, cancel),
        ArchiveKind::Tar => unpack_tar(file, dest, strip_components, cancel),
        ArchiveKind::Raw => {
            let target = dest.join(file_name);
            fs::copy(artifact, &target)
                .with_context(|| format!("Failed to copy artifact to {}", target.display()))?;
            fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
            Ok(1)
        }
    }
}

fn unpack_tar<R: Read>(
    reader: R,
    dest: &Path,
    strip_components: usize,
    cancel: &AtomicBool,
) -> Result<usize> {
    let mut archive = Archive::new(reader);
    archive.set_overwrite(true);
    let mut written = 0;

    for entry in archive.entries().context("Failed to read archive")? {
        if cancel.load(Ordering::SeqCst) {
            bail!("Extraction cancelled");
        }

        let mut entry = entry.context("Corrupt archive entry")?;
        let raw_path = entry.path()?.into_owned();
        let Some(relative) = strip_path(&raw_path, strip_components)? else {
            continue;
        };
        let target = dest.join(&relative);
        ensure_no_symlinked_parent(dest, &relative)?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        match entry.header().entry_type() {
            EntryType::Link => {
                let link = entry
                    .link_name()?
                    .ok_or_else(|| anyhow::anyhow!("Hard link without target: {}", raw_path.display()))?
                    .into_owned();
                let Some(link_relative) = strip_path(&link, strip_components)? else {
                    bail!("Hard link target outside archive root: {}", link.display());
                };
                ensure_no_symlinked_parent(dest, &link_relative)?;
                fs::hard_link(dest.join(link_relative), &target)
                    .with_context(|| format!("Failed to create hard link: {}", target.display()))?;
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()?
                    .ok_or_else(|| anyhow::anyhow!("Symlink without target: {}", raw_path.display()))?
                    .into_owned();
                let parent = target.parent().unwrap_or(dest);
                if link.is_absolute() || !normalize_path(&parent.join(&link)).starts_with(dest) {
                    bail!(
                        "Symlink escapes destination: {} -> {}",
                        relative.display(),
                        link.display()
                    );
                }
                entry
                    .unpack(&target)
                    .with_context(|| format!("Failed to extract: {}", relative.display()))?;
            }
            _ => {
                entry
                    .unpack(&target)
                    .with_context(|| format!("Failed to extract: {}", relative.display()))?;
            }
        }
        written += 1;
    }

    if written == 0 {
        bail!("Archive is empty after stripping {} components", strip_components);
    }

    Ok(written)
}

/// Drop the first `n` components; `None` if nothing remains. Errors on
/// components that climb out of the archive root.
fn strip_path(path: &Path, n: usize) -> Result<Option<PathBuf>> {
    let mut kept = PathBuf::new();
    for (index, component) in path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .enumerate()
    {
        match component {
            Component::Normal(part) => {
                if index >= n {
                    kept.push(part);
                }
            }
            _ => bail!("Archive entry escapes destination: {}", path.display()),
        }
    }
    Ok(if kept.as_os_str().is_empty() {
        None
    } else {
        Some(kept)
    })
}

/// Refuse to write through a symlinked directory inside `dest`.
fn ensure_no_symlinked_parent(dest: &Path, relative: &Path) -> Result<()> {
    let mut current = dest.to_path_buf();
    if let Some(parent) = relative.parent() {
        for component in parent.components() {
            current.push(component);
            if fs::symlink_metadata(&current)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
            {
                bail!("Archive writes through symlink: {}", current.display());
            }
        }
    }
    Ok(())
}
