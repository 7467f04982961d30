//! High-level installer API.
//!
//! [`Installer`] drives the whole pipeline for a manifest:
//!
//! ```text
//! select variant -> resolve dependencies -> lock -> fetch -> verify -> stage -> activate
//! ```
//!
//! Everything up to the lock is read-only, so a manifest that fails to match
//! the platform or names a missing dependency leaves the prefix untouched.
//! Link conflicts are also checked before fetching.
//!
//! # Quick Start
//!
//! ```no_run
//! use kegger::{Installer, Layout, PackageManifest, Platform, Settings};
//!
//! #[tokio::main]
//! async fn main() -> kegger::Result<()> {
//!     let installer = Installer::new(Layout::detect(), Settings::default())?;
//!     let manifest = PackageManifest::from_path("gam.json".as_ref())?;
//!
//!     let report = installer.install(&manifest, &Platform::detect()?).await?;
//!     println!("{} {}: {}", report.name, report.version, report.outcome);
//!     Ok(())
//! }
//! ```
//!
//! One `Installer` shares its HTTP client across operations; keep it around for
//! batches. [`Installer::install_many`] fetches and verifies all artifacts in
//! parallel, then stages them one by one.

use crate::cellar::{self, InstalledPackage};
use crate::config::{Layout, Settings};
use crate::error::{KegError, Result};
use crate::fetch::Fetcher;
use crate::lock::PackageLock;
use crate::manifest::{PackageManifest, VariantSpec};
use crate::platform::Platform;
use crate::stage::{self, ResolvedDependency, StageRequest, StagedPackage, Stager};
use crate::symlink::{ActivationLink, Linker};
use crate::verify::{self, VerifiedArtifact};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Scratch files older than this are considered abandoned by `cleanup`.
const STALE_SCRATCH_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// What an install did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// New keg, no previous version was active.
    Installed,
    /// New keg replaced the active version `from`.
    Upgraded { from: String },
    /// Existing keg rebuilt because its artifact or dependencies changed.
    Restaged,
    /// Keg was already staged and only needed its links.
    Relinked,
    /// Nothing to do.
    AlreadyInstalled,
}

impl fmt::Display for InstallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallOutcome::Installed => write!(f, "installed"),
            InstallOutcome::Upgraded { from } => write!(f, "upgraded from {}", from),
            InstallOutcome::Restaged => write!(f, "re-staged"),
            InstallOutcome::Relinked => write!(f, "relinked"),
            InstallOutcome::AlreadyInstalled => write!(f, "already installed"),
        }
    }
}

/// Result of an install operation
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub name: String,
    pub version: String,
    /// Path in Cellar
    pub path: PathBuf,
    pub outcome: InstallOutcome,
    pub links: Vec<ActivationLink>,
    /// Time taken (milliseconds)
    pub time_ms: u64,
}

/// Result of an uninstall operation
#[derive(Debug, Clone)]
pub struct UninstallReport {
    pub name: String,
    /// Removed versions
    pub versions: Vec<String>,
    /// Removed `bin/` and `opt/` entries
    pub unlinked: Vec<PathBuf>,
}

/// Result of a cleanup operation
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// Removed kegs (`name/version`)
    pub removed: Vec<String>,
    /// Inactive kegs kept because other packages still run against them
    pub pinned: Vec<String>,
    pub bytes_freed: u64,
    /// Errors encountered (keg, error message)
    pub errors: Vec<(String, String)>,
}

/// Installed versions of one package.
#[derive(Debug, Clone)]
pub struct PackageStatus {
    pub name: String,
    /// Newest first
    pub versions: Vec<String>,
    pub active: Option<String>,
}

/// Result of running a package's smoke test.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub name: String,
    pub version: String,
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// A manifest checked against the platform and the installed runtimes.
struct Prepared<'m> {
    manifest: &'m PackageManifest,
    variant: &'m VariantSpec,
    platform: String,
    dependencies: Vec<ResolvedDependency>,
}

/// State of the target keg before installing.
enum Existing {
    Absent,
    Current(Box<StagedPackage>),
    Stale,
}

pub struct Installer {
    layout: Layout,
    settings: Settings,
    fetcher: Fetcher,
}

impl Installer {
    pub fn new(layout: Layout, settings: Settings) -> Result<Self> {
        let fetcher = Fetcher::new(&layout, &settings)?;
        Ok(Self {
            layout,
            settings,
            fetcher,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Install `manifest` for `platform` and activate it.
    ///
    /// Installing a version that is already staged from the same artifact, with
    /// the same dependency roots, and fully linked is a no-op that fetches
    /// nothing.
    ///
    /// # Errors
    ///
    /// Any [`KegError`]; the prefix is left as it was before the call.
    pub async fn install(
        &self,
        manifest: &PackageManifest,
        platform: &Platform,
    ) -> Result<InstallReport> {
        let prepared = self.prepare(manifest, platform)?;
        self.complete(prepared, None).await
    }

    /// Install several manifests. All are checked before anything is fetched;
    /// downloads and verification run concurrently.
    ///
    /// Stops at the first staging or activation failure; packages installed
    /// before it stay installed.
    pub async fn install_many(
        &self,
        manifests: &[PackageManifest],
        platform: &Platform,
    ) -> Result<Vec<InstallReport>> {
        let prepared = manifests
            .iter()
            .map(|m| self.prepare(m, platform))
            .collect::<Result<Vec<_>>>()?;

        let downloads = prepared.iter().map(|p| async move {
            if matches!(self.existing(p), Existing::Current(_)) {
                return Ok(None);
            }
            self.fetch_verified(p).await.map(Some)
        });
        let artifacts = join_all(downloads)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        let mut reports = Vec::with_capacity(prepared.len());
        for (p, artifact) in prepared.into_iter().zip(artifacts) {
            reports.push(self.complete(p, artifact).await?);
        }
        Ok(reports)
    }

    fn prepare<'m>(&self, manifest: &'m PackageManifest, platform: &Platform) -> Result<Prepared<'m>> {
        let variant = manifest.select_variant(platform)?;
        debug!(package = %manifest.id(), url = %variant.url, "selected variant");
        let dependencies = stage::resolve_dependencies(&self.layout, manifest)?;
        Linker::new(&self.layout)
            .check_available(&manifest.name, manifest.install.commands().map(|(name, _)| name))?;

        Ok(Prepared {
            manifest,
            variant,
            platform: platform.to_string(),
            dependencies,
        })
    }

    /// Classify the kegs already built for this manifest's version. A keg that
    /// still matches wins, the active one first.
    fn existing(&self, p: &Prepared<'_>) -> Existing {
        let manifest = p.manifest;
        let kegs: Vec<StagedPackage> = cellar::get_installed_versions(&self.layout, &manifest.name)
            .unwrap_or_default()
            .into_iter()
            .filter_map(StagedPackage::from_installed)
            .filter(|staged| staged.receipt.version == manifest.version)
            .collect();
        if kegs.is_empty() {
            return Existing::Absent;
        }

        let active = cellar::active_version(&self.layout, &manifest.name);
        let mut current: Vec<StagedPackage> =
            kegs.into_iter().filter(|staged| is_current(staged, p)).collect();
        match current.iter().position(|staged| Some(&staged.version) == active.as_ref()) {
            Some(index) => Existing::Current(Box::new(current.swap_remove(index))),
            None if !current.is_empty() => Existing::Current(Box::new(current.swap_remove(0))),
            None => Existing::Stale,
        }
    }

    async fn fetch_verified(&self, p: &Prepared<'_>) -> Result<VerifiedArtifact> {
        let id = p.manifest.id();
        let fetched = self.fetcher.fetch(&id, p.variant).await?;
        verify::verify(fetched, &id).await
    }

    async fn complete(
        &self,
        p: Prepared<'_>,
        artifact: Option<VerifiedArtifact>,
    ) -> Result<InstallReport> {
        let start = Instant::now();
        let manifest = p.manifest;
        let lock = Arc::new(
            PackageLock::acquire(&self.layout, &manifest.name, self.settings.lock_timeout).await?,
        );
        let linker = Linker::new(&self.layout);
        let previous = cellar::active_version(&self.layout, &manifest.name);

        // Re-checked under the lock: another process may have finished first.
        linker.check_available(&manifest.name, manifest.install.commands().map(|(name, _)| name))?;

        let (staged, outcome, fresh) = match self.existing(&p) {
            Existing::Current(staged) => {
                if linker.is_active(&staged) {
                    info!(package = %manifest.id(), "already installed");
                    return Ok(InstallReport {
                        name: staged.name.clone(),
                        version: staged.version.clone(),
                        path: staged.path.clone(),
                        outcome: InstallOutcome::AlreadyInstalled,
                        links: linker.plan(&staged),
                        time_ms: start.elapsed().as_millis() as u64,
                    });
                }
                (*staged, InstallOutcome::Relinked, false)
            }
            state => {
                let artifact = match artifact {
                    Some(artifact) => artifact,
                    None => self.fetch_verified(&p).await?,
                };
                let request = StageRequest {
                    manifest: manifest.clone(),
                    platform: p.platform.clone(),
                    artifact,
                    dependencies: p.dependencies.clone(),
                };
                let staged = Stager::new(&self.layout, &self.settings)
                    .stage(request, lock.clone())
                    .await?;
                let outcome = match (state, previous) {
                    (Existing::Stale, _) => InstallOutcome::Restaged,
                    (_, Some(from)) => InstallOutcome::Upgraded { from },
                    _ => InstallOutcome::Installed,
                };
                (staged, outcome, true)
            }
        };

        let links = match linker.activate(&staged) {
            Ok(links) => links,
            Err(e) => {
                if fresh {
                    warn!(package = %manifest.id(), "activation failed; removing new keg");
                    if let Err(cleanup) = fs::remove_dir_all(&staged.path) {
                        warn!("Failed to remove {}: {}", staged.path.display(), cleanup);
                    }
                }
                return Err(e);
            }
        };

        info!(package = %manifest.id(), outcome = %outcome, "install complete");
        Ok(InstallReport {
            name: staged.name,
            version: staged.version,
            path: staged.path,
            outcome,
            links,
            time_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Remove every staged version of `name` and its links.
    ///
    /// # Errors
    ///
    /// [`KegError::NotInstalled`] when nothing is staged, and
    /// [`KegError::InUse`] when other packages depend on it (unless `force`).
    pub async fn uninstall(&self, name: &str, force: bool) -> Result<UninstallReport> {
        let _lock = PackageLock::acquire(&self.layout, name, self.settings.lock_timeout).await?;

        let kegs: Vec<InstalledPackage> = cellar::get_installed_versions(&self.layout, name)?
            .into_iter()
            .filter(InstalledPackage::is_staged)
            .collect();
        if kegs.is_empty() {
            return Err(KegError::NotInstalled(name.to_string()));
        }

        if !force {
            let dependents = cellar::dependents(&self.layout, name)?;
            if !dependents.is_empty() {
                return Err(KegError::InUse {
                    name: name.to_string(),
                    dependents,
                });
            }
        }

        let unlinked = Linker::new(&self.layout).deactivate(name)?;
        let mut versions = Vec::with_capacity(kegs.len());
        for keg in kegs {
            fs::remove_dir_all(&keg.path)?;
            debug!(path = %keg.path.display(), "removed keg");
            versions.push(keg.version);
        }
        let _ = fs::remove_dir(self.layout.package_dir(name));

        info!(package = %name, versions = ?versions, "uninstalled");
        Ok(UninstallReport {
            name: name.to_string(),
            versions,
            unlinked,
        })
    }

    /// Point `name`'s commands at an already staged `version`.
    pub async fn activate(&self, name: &str, version: &str) -> Result<Vec<ActivationLink>> {
        let _lock = PackageLock::acquire(&self.layout, name, self.settings.lock_timeout).await?;

        let staged = StagedPackage::load(&self.layout, name, version)
            .ok_or_else(|| KegError::NotInstalled(format!("{} {}", name, version)))?;

        for dep in &staged.receipt.runtime_dependencies {
            if !dep.root.is_dir() {
                return Err(KegError::DependencyMissing {
                    package: format!("{}-{}", name, version),
                    dependency: dep.name.clone(),
                    searched: dep.root.clone(),
                });
            }
        }

        Linker::new(&self.layout).activate(&staged)
    }

    /// Staged packages with their versions and the active one.
    pub fn list(&self) -> Result<Vec<PackageStatus>> {
        let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for pkg in cellar::list_installed(&self.layout)? {
            if pkg.is_staged() {
                by_name.entry(pkg.name).or_default().push(pkg.version);
            }
        }

        Ok(by_name
            .into_iter()
            .map(|(name, versions)| PackageStatus {
                active: cellar::active_version(&self.layout, &name),
                name,
                versions,
            })
            .collect())
    }

    /// Remove kegs that are not active (or all but the newest when nothing is
    /// active), plus abandoned scratch downloads. Kegs that another package
    /// resolved a runtime dependency to are kept.
    pub async fn cleanup(&self, only: Option<&str>) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        let statuses: Vec<PackageStatus> = self
            .list()?
            .into_iter()
            .filter(|s| only.is_none_or(|name| s.name == name))
            .collect();
        if let (Some(name), true) = (only, statuses.is_empty()) {
            return Err(KegError::NotInstalled(name.to_string()));
        }

        let pinned = cellar::pinned_kegs(&self.layout)?;
        for status in statuses {
            let _lock =
                PackageLock::acquire(&self.layout, &status.name, self.settings.lock_timeout).await?;
            let keep = cellar::active_version(&self.layout, &status.name)
                .or_else(|| status.versions.first().cloned());

            for version in status.versions.iter().filter(|v| Some(*v) != keep.as_ref()) {
                let path = self.layout.keg_path(&status.name, version);
                let label = format!("{}/{}", status.name, version);
                if pinned.contains(&(status.name.clone(), version.clone())) {
                    debug!(keg = %label, "kept: other packages depend on it");
                    report.pinned.push(label);
                    continue;
                }
                let size = dir_size(&path);
                match fs::remove_dir_all(&path) {
                    Ok(()) => {
                        debug!(keg = %label, "removed inactive keg");
                        report.removed.push(label);
                        report.bytes_freed += size;
                    }
                    Err(e) => report.errors.push((label, e.to_string())),
                }
            }
        }

        if only.is_none() {
            report.bytes_freed += self.sweep_scratch();
        }
        Ok(report)
    }

    fn sweep_scratch(&self) -> u64 {
        let Ok(entries) = fs::read_dir(&self.layout.cache) else {
            return 0;
        };
        let mut freed = 0;
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .unwrap_or_default();
            if meta.is_file() && age > STALE_SCRATCH_AGE && fs::remove_file(entry.path()).is_ok() {
                freed += meta.len();
            }
        }
        freed
    }

    /// Run the active version's smoke test through its published command.
    pub async fn test(&self, name: &str) -> Result<TestReport> {
        let version = cellar::active_version(&self.layout, name)
            .ok_or_else(|| KegError::NotInstalled(name.to_string()))?;
        let staged = StagedPackage::load(&self.layout, name, &version)
            .ok_or_else(|| KegError::NotInstalled(format!("{} {}", name, version)))?;
        let test = staged.receipt.test.clone().ok_or_else(|| {
            KegError::Other(anyhow::anyhow!("{} {} declares no test", name, version))
        })?;

        let entry = self.layout.bin_entry(&test.command);
        debug!(command = %entry.display(), args = ?test.args, "running smoke test");
        let child = tokio::process::Command::new(&entry)
            .args(&test.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.settings.test_timeout, child)
            .await
            .map_err(|_| {
                KegError::timeout(format!("running the test of {}", name), self.settings.test_timeout)
            })??;

        Ok(TestReport {
            name: name.to_string(),
            version,
            command: std::iter::once(test.command.as_str())
                .chain(test.args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" "),
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Whether `staged` was built from this artifact with these dependency roots
/// and the same wiring.
fn is_current(staged: &StagedPackage, p: &Prepared<'_>) -> bool {
    let receipt = &staged.receipt;
    let manifest = p.manifest;
    let commands_match = receipt
        .commands
        .iter()
        .map(|c| (c.name.as_str(), c.target.as_str()))
        .eq(manifest.install.commands());
    receipt.source.sha256 == p.variant.sha256
        && receipt.dependencies_match(&p.dependencies)
        && receipt.linkage == manifest.linkage
        && receipt.activation == manifest.activation_mode()
        && commands_match
}

/// Total size of regular files under `path`.
fn dir_size(path: &std::path::Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .flatten()
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}
