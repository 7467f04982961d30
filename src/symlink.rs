//! Command activation.
//!
//! Activating a staged keg publishes its commands in `<prefix>/bin` and points
//! `<prefix>/opt/<name>` at the keg. Commands are either relative symlinks
//! (`bin/gam -> ../Cellar/gam/7.18.03/libexec/gam`) or, for packages that need
//! environment set up, small `sh` launchers that export the receipt's
//! environment and `exec` the real executable.
//!
//! Every entry is created under a temporary name next to its final path and
//! renamed over it, so a reader resolving `bin/<command>` sees either the old
//! target or the new one, never a missing file.
//!
//! Entries that keg did not create are never touched: before anything moves,
//! every planned path is checked and a foreign file, directory or symlink fails
//! the whole activation with [`KegError::LinkConflict`].

use crate::config::Layout;
use crate::error::{KegError, Result};
use crate::manifest::ActivationMode;
use crate::stage::StagedPackage;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs as unix_fs;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Second line of every launcher keg writes.
pub const LAUNCHER_MARKER: &str = "# keg-launcher:";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Normalize a path by processing `.` and `..` lexically, without touching the
/// filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !result.pop() {
                    result.push(component);
                }
            }
            _ => result.push(component),
        }
    }
    result
}

/// Who an existing path under `bin/` or `opt/` belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOwner {
    Vacant,
    Managed { package: String, version: String },
    Foreign,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    /// Symlink with the given (relative) link text.
    Symlink { target: PathBuf },
    /// Launcher script with the given contents.
    Launcher { script: String },
}

/// One published command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationLink {
    pub command: String,
    pub path: PathBuf,
    pub kind: LinkKind,
}

/// What was at a path before activation replaced it.
enum Prior {
    Absent,
    Symlink(PathBuf),
    File(Vec<u8>, u32),
}

pub struct Linker<'a> {
    layout: &'a Layout,
}

impl<'a> Linker<'a> {
    pub fn new(layout: &'a Layout) -> Self {
        Self { layout }
    }

    /// The command entries `staged` would publish.
    pub fn plan(&self, staged: &StagedPackage) -> Vec<ActivationLink> {
        let receipt = &staged.receipt;
        receipt
            .commands
            .iter()
            .map(|command| {
                let exec = staged.path.join(&command.target);
                let kind = match receipt.activation {
                    ActivationMode::Symlink => LinkKind::Symlink {
                        target: relative_to(&exec, &self.layout.bin),
                    },
                    ActivationMode::Launcher => LinkKind::Launcher {
                        script: launcher_script(
                            &staged.name,
                            &staged.version,
                            &exec,
                            &receipt.environment,
                        ),
                    },
                };
                ActivationLink {
                    command: command.name.clone(),
                    path: self.layout.bin_entry(&command.name),
                    kind,
                }
            })
            .collect()
    }

    fn opt_entry(&self, staged: &StagedPackage) -> (PathBuf, LinkKind) {
        (
            self.layout.opt_link(&staged.name),
            LinkKind::Symlink {
                target: relative_to(&staged.path, &self.layout.runtime),
            },
        )
    }

    /// Publish `staged`'s commands and opt link, replacing the previously
    /// active version of the same package.
    ///
    /// # Errors
    ///
    /// [`KegError::LinkConflict`] if any planned path holds something keg does
    /// not manage, checked before anything is changed. If placing an entry fails
    /// midway, entries already replaced are restored.
    pub fn activate(&self, staged: &StagedPackage) -> Result<Vec<ActivationLink>> {
        fs::create_dir_all(&self.layout.bin)?;
        fs::create_dir_all(&self.layout.runtime)?;

        let links = self.plan(staged);
        let mut placements: Vec<(PathBuf, LinkKind)> = links
            .iter()
            .map(|link| (link.path.clone(), link.kind.clone()))
            .collect();
        placements.push(self.opt_entry(staged));

        self.check_available(
            &staged.name,
            staged.receipt.commands.iter().map(|c| c.name.as_str()),
        )?;

        let mut applied: Vec<(PathBuf, Prior)> = Vec::new();
        for (path, kind) in &placements {
            let prior = match snapshot(path) {
                Ok(prior) => prior,
                Err(e) => {
                    self.rollback(applied);
                    return Err(e.into());
                }
            };
            if let Err(e) = place(path, kind) {
                self.rollback(applied);
                return Err(e.into());
            }
            applied.push((path.clone(), prior));
        }

        let published: HashSet<&Path> = links.iter().map(|l| l.path.as_path()).collect();
        for stale in self.managed_commands(&staged.name)? {
            if !published.contains(stale.as_path()) {
                debug!(path = %stale.display(), "removing command dropped by new version");
                remove_entry(&stale)?;
            }
        }

        debug!(package = %staged.name, version = %staged.version, commands = links.len(), "activated");
        Ok(links)
    }

    /// Fail unless every entry `name` would publish for `commands` is vacant or
    /// already owned by `name`. Touches nothing.
    pub fn check_available<'c>(
        &self,
        name: &str,
        commands: impl IntoIterator<Item = &'c str>,
    ) -> Result<()> {
        let paths = commands
            .into_iter()
            .map(|command| self.layout.bin_entry(command))
            .chain(std::iter::once(self.layout.opt_link(name)));

        for path in paths {
            match self.owner(&path) {
                EntryOwner::Vacant => {}
                EntryOwner::Managed { package, .. } if package == name => {}
                _ => return Err(KegError::LinkConflict { path }),
            }
        }
        Ok(())
    }

    /// Remove every command and the opt link belonging to `name`.
    pub fn deactivate(&self, name: &str) -> Result<Vec<PathBuf>> {
        let mut removed = self.managed_commands(name)?;
        let opt = self.layout.opt_link(name);
        if matches!(self.owner(&opt), EntryOwner::Managed { ref package, .. } if package == name) {
            removed.push(opt);
        }

        for path in &removed {
            remove_entry(path)?;
        }
        Ok(removed)
    }

    /// Whether every entry for `staged` is already in place with the exact
    /// expected contents.
    pub fn is_active(&self, staged: &StagedPackage) -> bool {
        let (opt, opt_kind) = self.opt_entry(staged);
        entry_matches(&opt, &opt_kind)
            && self
                .plan(staged)
                .iter()
                .all(|link| entry_matches(&link.path, &link.kind))
    }

    /// Classify whatever is at `path`.
    pub fn owner(&self, path: &Path) -> EntryOwner {
        let Ok(meta) = fs::symlink_metadata(path) else {
            return EntryOwner::Vacant;
        };

        if meta.file_type().is_symlink() {
            let Ok(target) = fs::read_link(path) else {
                return EntryOwner::Foreign;
            };
            let parent = path.parent().unwrap_or(Path::new("/"));
            let resolved = normalize_path(&parent.join(target));
            let Ok(relative) = resolved.strip_prefix(&self.layout.cellar) else {
                return EntryOwner::Foreign;
            };
            let mut parts = relative.components().map(|c| c.as_os_str().to_string_lossy());
            match (parts.next(), parts.next()) {
                (Some(package), Some(version)) if !version.starts_with('.') => EntryOwner::Managed {
                    package: package.to_string(),
                    version: version.to_string(),
                },
                _ => EntryOwner::Foreign,
            }
        } else if meta.is_file() {
            read_launcher_marker(path)
                .map(|(package, version)| EntryOwner::Managed { package, version })
                .unwrap_or(EntryOwner::Foreign)
        } else {
            EntryOwner::Foreign
        }
    }

    /// `bin/` entries currently owned by `name`.
    fn managed_commands(&self, name: &str) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.layout.bin) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut owned = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if matches!(self.owner(&path), EntryOwner::Managed { ref package, .. } if package == name) {
                owned.push(path);
            }
        }
        owned.sort();
        Ok(owned)
    }

    fn rollback(&self, applied: Vec<(PathBuf, Prior)>) {
        for (path, prior) in applied.into_iter().rev() {
            let restored = match prior {
                Prior::Absent => remove_entry(&path),
                Prior::Symlink(target) => place(&path, &LinkKind::Symlink { target }),
                Prior::File(bytes, mode) => place_file(&path, &bytes, mode),
            };
            if let Err(e) = restored {
                warn!("Failed to restore {}: {}", path.display(), e);
            }
        }
    }
}

/// Contents of a launcher for `exec` with `env` exported.
pub fn launcher_script(
    name: &str,
    version: &str,
    exec: &Path,
    env: &BTreeMap<String, String>,
) -> String {
    let mut script = String::from("#!/bin/sh\n");
    script.push_str(&format!("{} {} {}\n", LAUNCHER_MARKER, name, version));
    for (key, value) in env {
        script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    script.push_str(&format!(
        "exec {} \"$@\"\n",
        shell_quote(&exec.to_string_lossy())
    ));
    script
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// `(package, version)` from a launcher's marker line, if it has one.
fn read_launcher_marker(path: &Path) -> Option<(String, String)> {
    let mut head = Vec::with_capacity(512);
    fs::File::open(path)
        .ok()?
        .take(512)
        .read_to_end(&mut head)
        .ok()?;
    let text = String::from_utf8_lossy(&head);
    let line = text.lines().nth(1)?.strip_prefix(LAUNCHER_MARKER)?;
    let mut fields = line.split_whitespace();
    let package = fields.next()?.to_string();
    let version = fields.next()?.to_string();
    Some((package, version))
}

fn relative_to(target: &Path, base: &Path) -> PathBuf {
    pathdiff::diff_paths(target, base).unwrap_or_else(|| target.to_path_buf())
}

fn entry_matches(path: &Path, kind: &LinkKind) -> bool {
    match kind {
        LinkKind::Symlink { target } => fs::read_link(path).is_ok_and(|t| &t == target),
        LinkKind::Launcher { script } => {
            fs::symlink_metadata(path).is_ok_and(|m| m.is_file())
                && fs::read_to_string(path).is_ok_and(|s| &s == script)
        }
    }
}

fn snapshot(path: &Path) -> std::io::Result<Prior> {
    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Prior::Absent),
        Err(e) => Err(e),
        Ok(meta) if meta.file_type().is_symlink() => Ok(Prior::Symlink(fs::read_link(path)?)),
        Ok(meta) => Ok(Prior::File(fs::read(path)?, meta.permissions().mode())),
    }
}

/// Hidden sibling of `path` to build a replacement in.
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{}.keg-{}-{}",
        name,
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Put `kind` at `path` atomically.
fn place(path: &Path, kind: &LinkKind) -> std::io::Result<()> {
    match kind {
        LinkKind::Symlink { target } => {
            let temp = temp_sibling(path);
            unix_fs::symlink(target, &temp)?;
            rename_into_place(&temp, path)
        }
        LinkKind::Launcher { script } => place_file(path, script.as_bytes(), 0o755),
    }
}

fn place_file(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let temp = temp_sibling(path);
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(&temp)?;
    let written = file
        .write_all(contents)
        .and_then(|_| file.sync_all())
        .and_then(|_| fs::set_permissions(&temp, fs::Permissions::from_mode(mode)));
    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    rename_into_place(&temp, path)
}

fn rename_into_place(temp: &Path, path: &Path) -> std::io::Result<()> {
    fs::rename(temp, path).inspect_err(|_| {
        let _ = fs::remove_file(temp);
    })
}

fn remove_entry(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
