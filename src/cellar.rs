//! Cellar queries - reading staged packages.

use crate::config::Layout;
use crate::receipt::InstallReceipt;
use crate::symlink::normalize_path;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// A keg directory in the Cellar.
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    /// `None` for directories keg did not stage (or whose receipt is damaged).
    pub receipt: Option<InstallReceipt>,
}

impl InstalledPackage {
    pub fn from_path(name: String, version: String, path: PathBuf) -> Self {
        let receipt = InstallReceipt::read(&path).ok();
        Self {
            name,
            version,
            path,
            receipt,
        }
    }

    pub fn is_staged(&self) -> bool {
        self.receipt.is_some()
    }

    /// Kegs (`name`, directory) this package's receipt resolved its runtime
    /// dependencies to.
    pub fn pinned_kegs(&self, layout: &Layout) -> Vec<(String, String)> {
        self.receipt
            .iter()
            .flat_map(|r| &r.runtime_dependencies)
            .filter_map(|d| keg_containing(layout, &d.root))
            .collect()
    }
}

/// The keg (`name`, directory) that `path` lies in, if it is inside the Cellar.
pub fn keg_containing(layout: &Layout, path: &Path) -> Option<(String, String)> {
    let canonical = fs::canonicalize(&layout.cellar).ok();
    let relative = canonical
        .as_deref()
        .and_then(|cellar| path.strip_prefix(cellar).ok())
        .or_else(|| path.strip_prefix(&layout.cellar).ok())?;
    let mut parts = relative.components();
    let name = parts.next()?.as_os_str().to_string_lossy().to_string();
    let version = parts.next()?.as_os_str().to_string_lossy().to_string();
    Some((name, version))
}

/// Read all kegs in the Cellar. Hidden entries (staging dirs) are skipped.
pub fn list_installed(layout: &Layout) -> Result<Vec<InstalledPackage>> {
    if !layout.cellar.exists() {
        return Ok(vec![]);
    }

    let mut packages = Vec::new();

    for entry in fs::read_dir(&layout.cellar)
        .with_context(|| format!("Failed to read Cellar: {}", layout.cellar.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        packages.extend(get_installed_versions(layout, &name)?);
    }

    packages.sort_by(|a, b| a.name.cmp(&b.name).then(compare_versions(&b.version, &a.version)));
    Ok(packages)
}

/// All kegs of one package, newest first.
pub fn get_installed_versions(layout: &Layout, name: &str) -> Result<Vec<InstalledPackage>> {
    let package_dir = layout.package_dir(name);

    if !package_dir.exists() {
        return Ok(vec![]);
    }

    let mut packages = Vec::new();

    for entry in fs::read_dir(&package_dir)
        .with_context(|| format!("Failed to read {}", package_dir.display()))?
    {
        let entry = entry?;
        let version = entry.file_name().to_string_lossy().to_string();

        if version.starts_with('.') {
            continue;
        }

        packages.push(InstalledPackage::from_path(
            name.to_string(),
            version,
            entry.path(),
        ));
    }

    packages.sort_by(|a, b| compare_versions(&b.version, &a.version));
    Ok(packages)
}

/// The staged keg for `name`/`version`, if it has a valid receipt.
pub fn find_staged(layout: &Layout, name: &str, version: &str) -> Option<InstalledPackage> {
    let path = layout.keg_path(name, version);
    if !path.is_dir() {
        return None;
    }
    let pkg = InstalledPackage::from_path(name.to_string(), version.to_string(), path);
    pkg.is_staged().then_some(pkg)
}

/// Version the `opt/<name>` link currently points at.
pub fn active_version(layout: &Layout, name: &str) -> Option<String> {
    let opt = layout.opt_link(name);
    let target = fs::read_link(&opt).ok()?;
    let resolved = normalize_path(&opt.parent().unwrap_or(Path::new("/")).join(target));
    let relative = resolved.strip_prefix(layout.package_dir(name)).ok()?;
    let mut components = relative.components();
    let version = components.next()?.as_os_str().to_string_lossy().to_string();
    components.next().is_none().then_some(version)
}

/// Staged packages (other than `name` itself) with a runtime dependency that
/// resolved into one of `name`'s kegs.
pub fn dependents(layout: &Layout, name: &str) -> Result<Vec<String>> {
    let mut names: Vec<String> = list_installed(layout)?
        .into_iter()
        .filter(|pkg| {
            pkg.name != name && pkg.pinned_kegs(layout).iter().any(|(dep, _)| dep == name)
        })
        .map(|pkg| pkg.name)
        .collect();
    names.dedup();
    Ok(names)
}

/// Every keg some other package's receipt still points at.
pub fn pinned_kegs(layout: &Layout) -> Result<HashSet<(String, String)>> {
    Ok(list_installed(layout)?
        .iter()
        .flat_map(|pkg| {
            pkg.pinned_kegs(layout)
                .into_iter()
                .filter(move |(dep, _)| *dep != pkg.name)
        })
        .collect())
}

/// Compare two version strings numerically, component by component.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let a_parts: Vec<u32> = a.split(['.', '_', '-']).filter_map(|s| s.parse().ok()).collect();
    let b_parts: Vec<u32> = b.split(['.', '_', '-']).filter_map(|s| s.parse().ok()).collect();

    for i in 0..a_parts.len().max(b_parts.len()) {
        let a_part = a_parts.get(i).unwrap_or(&0);
        let b_part = b_parts.get(i).unwrap_or(&0);
        match a_part.cmp(b_part) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }

    a.cmp(b)
}
