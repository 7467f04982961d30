//! Staging verified artifacts into the Cellar.
//!
//! A keg is built in a hidden sibling directory (`Cellar/<name>/.staging-*`)
//! and renamed to `Cellar/<name>/<version>` only once the payload is extracted,
//! dependency links are in place and the receipt is written. Anything short of
//! that (error, timeout, interrupted future) drops the staging directory, so
//! the Cellar never holds a half-written keg under a real version name.
//!
//! Published kegs are never modified. Rebuilding a version that is already
//! staged publishes a revision (`<version>_1`, `<version>_2`, ...) next to it,
//! and the old keg stays usable until `cleanup` removes it.
//!
//! # Linkage
//!
//! - [`LinkageStrategy::Bundled`]: nothing outside the payload.
//! - [`LinkageStrategy::SharedSymlink`]: each entry of the dependency's
//!   directory is symlinked into the keg.
//! - [`LinkageStrategy::EnvInjected`]: environment values are resolved against
//!   the final keg path and dependency roots and stored in the receipt for the
//!   launcher.
//!
//! Both shared strategies pin the dependency's resolved root in the receipt; if
//! the runtime is later upgraded the keg is considered stale and re-staged.

use crate::cellar::InstalledPackage;
use crate::config::{Layout, Settings};
use crate::error::{KegError, Result};
use crate::extract;
use crate::lock::PackageLock;
use crate::manifest::{
    DEP_PLACEHOLDER_PREFIX, InstallDirective, KEG_PLACEHOLDER, LinkageStrategy, PREFIX_PLACEHOLDER,
    PackageManifest,
};
use crate::receipt::{InstallReceipt, SourceInfo};
use crate::verify::VerifiedArtifact;
use anyhow::Context;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs as unix_fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const STAGING_PREFIX: &str = ".staging-";

/// A shared dependency located on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    pub name: String,
    /// Canonical path (through `opt/` links) of the dependency.
    pub root: PathBuf,
}

/// A complete keg: payload, dependency links and receipt.
#[derive(Debug, Clone)]
pub struct StagedPackage {
    pub name: String,
    /// Keg directory name: the manifest version, with `_<n>` for rebuilds.
    pub version: String,
    pub path: PathBuf,
    pub receipt: InstallReceipt,
}

impl StagedPackage {
    /// Load the keg in `Cellar/<name>/<version>` if it was fully staged.
    pub fn load(layout: &Layout, name: &str, version: &str) -> Option<Self> {
        crate::cellar::find_staged(layout, name, version).and_then(Self::from_installed)
    }

    pub fn from_installed(pkg: InstalledPackage) -> Option<Self> {
        let receipt = pkg.receipt?;
        Some(Self {
            name: pkg.name,
            version: pkg.version,
            path: pkg.path,
            receipt,
        })
    }

    /// Absolute path of a command's executable.
    pub fn executable(&self, command: &str) -> Option<PathBuf> {
        self.receipt
            .commands
            .iter()
            .find(|c| c.name == command)
            .map(|c| self.path.join(&c.target))
    }
}

/// Everything needed to build one keg.
pub struct StageRequest {
    pub manifest: PackageManifest,
    pub platform: String,
    pub artifact: VerifiedArtifact,
    pub dependencies: Vec<ResolvedDependency>,
}

/// Locate every declared dependency under the runtime root.
///
/// # Errors
///
/// [`KegError::DependencyMissing`] for the first dependency that isn't there.
pub fn resolve_dependencies(
    layout: &Layout,
    manifest: &PackageManifest,
) -> Result<Vec<ResolvedDependency>> {
    manifest
        .dependencies
        .iter()
        .map(|dep| {
            let hint = dep.lookup_name();
            let candidate = if Path::new(hint).is_absolute() {
                PathBuf::from(hint)
            } else {
                layout.runtime.join(hint)
            };
            match fs::canonicalize(&candidate) {
                Ok(root) if root.is_dir() => Ok(ResolvedDependency {
                    name: dep.name.clone(),
                    root,
                }),
                _ => Err(KegError::DependencyMissing {
                    package: manifest.id(),
                    dependency: dep.name.clone(),
                    searched: candidate,
                }),
            }
        })
        .collect()
}

/// Substitute `@@KEG@@`, `@@PREFIX@@` and `@@DEP:<name>@@` in launcher variables.
pub fn resolve_environment(
    vars: &BTreeMap<String, String>,
    keg: &Path,
    layout: &Layout,
    dependencies: &[ResolvedDependency],
) -> BTreeMap<String, String> {
    vars.iter()
        .map(|(key, value)| {
            let mut resolved = value
                .replace(KEG_PLACEHOLDER, &keg.to_string_lossy())
                .replace(PREFIX_PLACEHOLDER, &layout.prefix.to_string_lossy());
            for dep in dependencies {
                let placeholder = format!("{}{}@@", DEP_PLACEHOLDER_PREFIX, dep.name);
                resolved = resolved.replace(&placeholder, &dep.root.to_string_lossy());
            }
            (key.clone(), resolved)
        })
        .collect()
}

pub struct Stager {
    layout: Layout,
    settings: Settings,
}

/// Flags the blocking stage job to stop when the awaiting future goes away.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Stager {
    pub fn new(layout: &Layout, settings: &Settings) -> Self {
        Self {
            layout: layout.clone(),
            settings: settings.clone(),
        }
    }

    /// Build the keg for `request` under `lock`.
    ///
    /// The work runs on the blocking pool and keeps its own handle on the lock,
    /// so a timed-out job still holds the package until it has cleaned up.
    pub async fn stage(&self, request: StageRequest, lock: Arc<PackageLock>) -> Result<StagedPackage> {
        let cancel = Arc::new(AtomicBool::new(false));
        let _guard = CancelOnDrop(cancel.clone());
        let id = request.manifest.id();
        let layout = self.layout.clone();
        let flag = cancel.clone();

        let job = tokio::task::spawn_blocking(move || {
            let _lock = lock;
            stage_blocking(&layout, &request, &flag)
        });

        match tokio::time::timeout(self.settings.extract_timeout, job).await {
            Ok(joined) => joined.map_err(|e| KegError::Other(e.into()))?,
            Err(_) => {
                cancel.store(true, Ordering::SeqCst);
                Err(KegError::timeout(format!("staging {}", id), self.settings.extract_timeout))
            }
        }
    }
}

fn stage_blocking(
    layout: &Layout,
    request: &StageRequest,
    cancel: &AtomicBool,
) -> Result<StagedPackage> {
    let manifest = &request.manifest;
    let name = &manifest.name;
    let version = &manifest.version;
    let package_dir = layout.package_dir(name);

    fs::create_dir_all(&package_dir)?;
    sweep_leftovers(&package_dir);

    let plain = layout.keg_path(name, version);
    let final_path = match fs::symlink_metadata(&plain) {
        Err(e) if e.kind() == ErrorKind::NotFound => plain,
        Err(e) => return Err(e.into()),
        Ok(meta) if meta.is_dir() && InstallReceipt::read(&plain).is_ok() => {
            next_revision(&package_dir, version)?
        }
        Ok(_) => {
            return Err(KegError::StageConflict {
                package: manifest.id(),
                path: plain,
                reason: "already exists and was not staged by keg".into(),
            });
        }
    };
    let keg_version = final_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| version.clone());

    let staging = tempfile::Builder::new()
        .prefix(&format!("{}{}-", STAGING_PREFIX, version))
        .tempdir_in(&package_dir)?;
    debug!(package = %manifest.id(), dir = %staging.path().display(), "staging");

    let artifact = &request.artifact.artifact;
    for directive in manifest.install.directives() {
        match directive {
            InstallDirective::Extract {
                into,
                strip_components,
            } => {
                extract::unpack(
                    artifact.path(),
                    artifact.archive,
                    &artifact.file_name,
                    &staging.path().join(into),
                    *strip_components,
                    cancel,
                )
                .with_context(|| format!("Failed to extract {}", artifact.file_name))?;
            }
            InstallDirective::MakeExecutable { path } => {
                let target = staging.path().join(path);
                let mode = fs::metadata(&target)
                    .with_context(|| format!("Cannot make {} executable: not in payload", path))?
                    .permissions()
                    .mode();
                fs::set_permissions(&target, fs::Permissions::from_mode(mode | 0o111))?;
            }
            InstallDirective::Command { .. } => {}
        }
    }

    for (command, target) in manifest.install.commands() {
        if !staging.path().join(target).is_file() {
            return Err(anyhow::anyhow!(
                "Command {} points at {}, which the payload does not contain",
                command,
                target
            )
            .into());
        }
    }

    let environment = match &manifest.linkage {
        LinkageStrategy::Bundled => BTreeMap::new(),
        LinkageStrategy::SharedSymlink {
            dependency,
            from,
            into,
        } => {
            let dep = find_dependency(request, dependency)?;
            link_shared(manifest, &dep.root.join(from), &staging.path().join(into))?;
            BTreeMap::new()
        }
        LinkageStrategy::EnvInjected { vars } => {
            resolve_environment(vars, &final_path, layout, &request.dependencies)
        }
    };

    let variant_source = SourceInfo {
        url: artifact.url.clone(),
        sha256: request.artifact.measured.clone(),
        file_name: artifact.file_name.clone(),
    };
    let receipt = InstallReceipt::new(
        manifest,
        &request.platform,
        variant_source,
        &request.dependencies,
        environment,
    );
    receipt.write(staging.path())?;

    if cancel.load(Ordering::SeqCst) {
        return Err(anyhow::anyhow!("Staging of {} cancelled", manifest.id()).into());
    }

    #[allow(deprecated)]
    let staged_dir = staging.into_path();
    if let Err(e) = fs::rename(&staged_dir, &final_path) {
        let _ = fs::remove_dir_all(&staged_dir);
        return Err(e.into());
    }

    info!(package = %manifest.id(), path = %final_path.display(), "staged");
    Ok(StagedPackage {
        name: name.clone(),
        version: keg_version,
        path: final_path,
        receipt,
    })
}

/// First free `<version>_<n>` directory for a rebuild of `version`.
fn next_revision(package_dir: &Path, version: &str) -> Result<PathBuf> {
    for revision in 1..=u16::MAX {
        let candidate = package_dir.join(format!("{}_{}", version, revision));
        match fs::symlink_metadata(&candidate) {
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(candidate),
            Err(e) => return Err(e.into()),
            Ok(_) => continue,
        }
    }
    Err(anyhow::anyhow!("No free revision left for {} in {}", version, package_dir.display()).into())
}

fn find_dependency<'a>(request: &'a StageRequest, name: &str) -> Result<&'a ResolvedDependency> {
    request
        .dependencies
        .iter()
        .find(|d| d.name == name)
        .ok_or_else(|| KegError::DependencyMissing {
            package: request.manifest.id(),
            dependency: name.to_string(),
            searched: PathBuf::from(name),
        })
}

/// Symlink every entry of `source` into `dest`.
fn link_shared(manifest: &PackageManifest, source: &Path, dest: &Path) -> Result<()> {
    if !source.is_dir() {
        return Err(KegError::DependencyMissing {
            package: manifest.id(),
            dependency: source.display().to_string(),
            searched: source.to_path_buf(),
        });
    }
    fs::create_dir_all(dest)?;

    for entry in WalkDir::new(source)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| KegError::Other(e.into()))?;
        let link = dest.join(entry.file_name());
        if fs::symlink_metadata(&link).is_ok() {
            return Err(KegError::StageConflict {
                package: manifest.id(),
                path: link,
                reason: "is already provided by the payload".into(),
            });
        }
        unix_fs::symlink(entry.path(), &link)?;
    }
    Ok(())
}

/// Remove staging directories abandoned by a killed process.
/// Callers hold the package lock, so nothing live matches.
fn sweep_leftovers(package_dir: &Path) {
    let Ok(entries) = fs::read_dir(package_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(STAGING_PREFIX) {
            debug!(dir = %entry.path().display(), "removing abandoned staging directory");
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!("Failed to remove {}: {}", entry.path().display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::tests::tar_gz_bytes;
    use crate::fetch::FetchedArtifact;
    use crate::manifest::{ArchiveKind, Checksum};
    use crate::verify::sha256_bytes;
    use std::time::Duration;
    use tempfile::TempDir;

    const BASE: &str = r#"{
  "name": "pkg",
  "version": "1.0",
  "variants": [ { "os": "macos", "arch": "arm64", "url": "https://example.com/pkg-1.0.tar.gz",
                  "sha256": "0000000000000000000000000000000000000000000000000000000000000000" } ],
  LINKAGE
  "install": [
    { "op": "extract", "into": "libexec", "strip_components": 1 },
    { "op": "command", "name": "pkg", "target": "libexec/pkg" }
  ]
}"#;

    fn manifest(linkage: &str) -> PackageManifest {
        PackageManifest::from_json(&BASE.replace("LINKAGE", linkage), "pkg.json").unwrap()
    }

    fn verified(dir: &Path, bytes: &[u8]) -> VerifiedArtifact {
        let file = tempfile::Builder::new().suffix(".part").tempfile_in(dir).unwrap();
        fs::write(file.path(), bytes).unwrap();
        let digest = sha256_bytes(bytes);
        VerifiedArtifact {
            artifact: FetchedArtifact {
                path: file.into_temp_path(),
                url: "https://example.com/pkg-1.0.tar.gz".into(),
                declared: Checksum::try_from(digest.clone()).unwrap(),
                archive: ArchiveKind::TarGz,
                file_name: "pkg-1.0.tar.gz".into(),
                size: bytes.len() as u64,
            },
            measured: Checksum::try_from(digest).unwrap(),
        }
    }

    fn payload() -> Vec<u8> {
        tar_gz_bytes(&[
            ("pkg/pkg", b"#!/bin/sh\necho pkg\n", 0o755),
            ("pkg/share/doc", b"docs", 0o644),
        ])
    }

    async fn stage(layout: &Layout, manifest: PackageManifest, deps: Vec<ResolvedDependency>) -> Result<StagedPackage> {
        let scratch = layout.prefix.join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        let lock = PackageLock::acquire(layout, &manifest.name, Duration::from_secs(5))
            .await
            .unwrap();
        let request = StageRequest {
            manifest,
            platform: "arm64-macos-15.5".into(),
            artifact: verified(&scratch, &payload()),
            dependencies: deps,
        };
        Stager::new(layout, &Settings::default())
            .stage(request, Arc::new(lock))
            .await
    }

    fn hidden_entries(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with('.'))
            .collect()
    }

    #[tokio::test]
    async fn test_stage_bundled_package() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());

        let staged = stage(&layout, manifest(""), vec![]).await.unwrap();

        assert_eq!(staged.path, layout.keg_path("pkg", "1.0"));
        assert!(staged.path.join("libexec/pkg").is_file());
        assert!(staged.path.join("libexec/share/doc").is_file());
        assert_eq!(staged.executable("pkg"), Some(staged.path.join("libexec/pkg")));
        assert_eq!(staged.receipt.source.sha256.as_str(), sha256_bytes(&payload()));
        assert!(StagedPackage::load(&layout, "pkg", "1.0").is_some());
        assert!(hidden_entries(&layout.package_dir("pkg")).is_empty());
        assert!(fs::read_dir(layout.prefix.join("scratch")).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_stage_refuses_foreign_directory() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        let foreign = layout.keg_path("pkg", "1.0");
        fs::create_dir_all(&foreign).unwrap();
        fs::write(foreign.join("notes.txt"), "mine").unwrap();

        let err = stage(&layout, manifest(""), vec![]).await.unwrap_err();
        assert!(matches!(err, KegError::StageConflict { .. }));
        assert_eq!(fs::read_to_string(foreign.join("notes.txt")).unwrap(), "mine");
        assert!(hidden_entries(&layout.package_dir("pkg")).is_empty());
    }

    #[tokio::test]
    async fn test_stage_missing_command_target_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        let mut m = manifest("");
        m.install.0[1] = InstallDirective::Command {
            name: "pkg".into(),
            target: "libexec/nope".into(),
        };

        assert!(stage(&layout, m, vec![]).await.is_err());
        assert!(!layout.keg_path("pkg", "1.0").exists());
        assert!(hidden_entries(&layout.package_dir("pkg")).is_empty());
    }

    #[tokio::test]
    async fn test_stage_shared_symlink_links_runtime_files() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        let runtime = layout.keg_path("python", "3.13.1");
        fs::create_dir_all(runtime.join("lib/python3.13")).unwrap();
        fs::write(runtime.join("lib/libpython3.13.dylib"), "lib").unwrap();
        let deps = vec![ResolvedDependency {
            name: "python".into(),
            root: runtime.clone(),
        }];
        let m = manifest(
            r#""dependencies": [ { "name": "python" } ],
  "linkage": { "strategy": "shared_symlink", "dependency": "python", "from": "lib", "into": "libexec/lib" },"#,
        );

        let staged = stage(&layout, m, deps).await.unwrap();

        let link = staged.path.join("libexec/lib/libpython3.13.dylib");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), runtime.join("lib/libpython3.13.dylib"));
        assert!(staged.path.join("libexec/lib/python3.13").is_dir());
        assert_eq!(staged.receipt.runtime_dependencies[0].root, runtime);
    }

    #[tokio::test]
    async fn test_stage_env_injected_resolves_placeholders() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        let runtime = PathBuf::from("/runtimes/python/3.13.1");
        let deps = vec![ResolvedDependency {
            name: "python".into(),
            root: runtime.clone(),
        }];
        let m = manifest(
            r#""dependencies": [ { "name": "python" } ],
  "linkage": { "strategy": "env_injected", "vars": {
      "PYTHONHOME": "@@DEP:python@@",
      "GAM_CFG": "@@KEG@@/etc",
      "GAM_PREFIX": "@@PREFIX@@" } },"#,
        );

        let staged = stage(&layout, m, deps).await.unwrap();
        let env = &staged.receipt.environment;
        assert_eq!(env["PYTHONHOME"], runtime.to_string_lossy());
        assert_eq!(env["GAM_CFG"], format!("{}/etc", staged.path.display()));
        assert_eq!(env["GAM_PREFIX"], layout.prefix.to_string_lossy());
    }

    #[tokio::test]
    async fn test_restage_publishes_revision_and_keeps_old_keg() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        let first = stage(&layout, manifest(""), vec![]).await.unwrap();
        fs::write(first.path.join("marker"), "old").unwrap();

        let second = stage(&layout, manifest(""), vec![]).await.unwrap();
        assert_eq!(second.path, layout.keg_path("pkg", "1.0_1"));
        assert_eq!(second.version, "1.0_1");
        assert_eq!(second.receipt.version, "1.0");
        assert!(!second.path.join("marker").exists());
        assert_eq!(fs::read_to_string(first.path.join("marker")).unwrap(), "old");

        let third = stage(&layout, manifest(""), vec![]).await.unwrap();
        assert_eq!(third.version, "1.0_2");
        assert!(hidden_entries(&layout.package_dir("pkg")).is_empty());
    }

    #[tokio::test]
    async fn test_stage_timeout_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        let scratch = layout.prefix.join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        let files: Vec<(String, Vec<u8>)> = (0..4000)
            .map(|i| (format!("pkg/data/{:05}", i), vec![b'x'; 4096]))
            .chain(std::iter::once(("pkg/pkg".to_string(), b"#!/bin/sh\n".to_vec())))
            .collect();
        let entries: Vec<(&str, &[u8], u32)> =
            files.iter().map(|(p, b)| (p.as_str(), b.as_slice(), 0o755)).collect();
        let lock = PackageLock::acquire(&layout, "pkg", Duration::from_secs(5))
            .await
            .unwrap();
        let request = StageRequest {
            manifest: manifest(""),
            platform: "arm64-macos-15.5".into(),
            artifact: verified(&scratch, &tar_gz_bytes(&entries)),
            dependencies: vec![],
        };
        let settings = Settings {
            extract_timeout: Duration::from_millis(1),
            ..Settings::default()
        };

        let err = Stager::new(&layout, &settings)
            .stage(request, Arc::new(lock))
            .await
            .unwrap_err();
        assert!(matches!(err, KegError::Timeout { .. }), "{:?}", err);

        // The cancelled job cleans up once it notices the flag and releases the lock.
        PackageLock::acquire(&layout, "pkg", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(!layout.keg_path("pkg", "1.0").exists());
        assert!(hidden_entries(&layout.package_dir("pkg")).is_empty());
    }

    #[test]
    fn test_resolve_dependencies_reports_missing() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        let m = manifest(r#""dependencies": [ { "name": "python", "hint": "python@3.13" } ],"#);

        match resolve_dependencies(&layout, &m) {
            Err(KegError::DependencyMissing {
                dependency,
                searched,
                ..
            }) => {
                assert_eq!(dependency, "python");
                assert_eq!(searched, layout.runtime.join("python@3.13"));
            }
            other => panic!("expected missing dependency, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_dependencies_follows_opt_link() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        let keg = layout.keg_path("python", "3.13.1");
        fs::create_dir_all(&keg).unwrap();
        fs::create_dir_all(&layout.runtime).unwrap();
        unix_fs::symlink("../Cellar/python/3.13.1", layout.opt_link("python")).unwrap();
        let m = manifest(r#""dependencies": [ { "name": "python" } ],"#);

        let deps = resolve_dependencies(&layout, &m).unwrap();
        assert_eq!(deps[0].root, fs::canonicalize(&keg).unwrap());
    }

    #[test]
    fn test_sweep_removes_abandoned_staging() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(".staging-1.0-abc/libexec")).unwrap();
        fs::create_dir_all(temp.path().join(".staging-1.0-def")).unwrap();
        fs::create_dir_all(temp.path().join("1.0")).unwrap();

        sweep_leftovers(temp.path());
        let names: Vec<String> = fs::read_dir(temp.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["1.0"]);
    }
}
