//! Install receipts.
//!
//! Every staged keg carries an `INSTALL_RECEIPT.json` describing where it came
//! from and how it is wired up:
//!
//! ```text
//! <prefix>/Cellar/gam/7.18.03/
//!   INSTALL_RECEIPT.json     # source, digest, linkage, commands
//!   libexec/
//! ```
//!
//! The receipt is written last, inside the staging directory, before the keg is
//! renamed into place. A Cellar directory without a readable receipt is never
//! treated as a staged package.
//!
//! It also records the resolved roots of shared dependencies so a later install
//! can tell when a runtime was upgraded underneath the keg and re-stage it.

use crate::manifest::{ActivationMode, Checksum, LinkageStrategy, PackageManifest, SmokeTest};
use crate::stage::ResolvedDependency;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub url: String,
    pub sha256: Checksum,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDependency {
    pub name: String,
    /// Canonical path the dependency resolved to at staging time.
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub name: String,
    /// Executable path relative to the keg.
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    /// `keg/<version>` that staged this keg.
    pub installed_by: String,
    pub platform: String,
    pub source: SourceInfo,
    pub linkage: LinkageStrategy,
    pub activation: ActivationMode,
    #[serde(default)]
    pub runtime_dependencies: Vec<RuntimeDependency>,
    /// Fully resolved launcher environment; empty for symlinked commands.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    pub commands: Vec<CommandEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<SmokeTest>,
    pub time: i64,
}

impl InstallReceipt {
    pub fn new(
        manifest: &PackageManifest,
        platform: &str,
        source: SourceInfo,
        dependencies: &[ResolvedDependency],
        environment: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            installed_by: format!("keg/{}", env!("CARGO_PKG_VERSION")),
            platform: platform.to_string(),
            source,
            linkage: manifest.linkage.clone(),
            activation: manifest.activation_mode(),
            runtime_dependencies: dependencies
                .iter()
                .map(|d| RuntimeDependency {
                    name: d.name.clone(),
                    root: d.root.clone(),
                })
                .collect(),
            environment,
            commands: manifest
                .install
                .commands()
                .map(|(name, target)| CommandEntry {
                    name: name.to_string(),
                    target: target.to_string(),
                })
                .collect(),
            test: manifest.test.clone(),
            time: chrono::Utc::now().timestamp(),
        }
    }

    pub fn path(keg: &Path) -> PathBuf {
        keg.join(RECEIPT_FILE)
    }

    /// Read `INSTALL_RECEIPT.json` from a keg directory.
    pub fn read(keg: &Path) -> Result<Self> {
        let receipt_path = Self::path(keg);
        let contents = fs::read_to_string(&receipt_path)
            .with_context(|| format!("Failed to read receipt: {}", receipt_path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse receipt: {}", receipt_path.display()))
    }

    pub fn write(&self, keg: &Path) -> Result<()> {
        let receipt_path = Self::path(keg);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize install receipt")?;
        fs::write(&receipt_path, json)
            .with_context(|| format!("Failed to write receipt: {}", receipt_path.display()))
    }

    /// Whether the dependency roots recorded here match `current`.
    pub fn dependencies_match(&self, current: &[ResolvedDependency]) -> bool {
        self.runtime_dependencies.len() == current.len()
            && self
                .runtime_dependencies
                .iter()
                .zip(current)
                .all(|(recorded, now)| recorded.name == now.name && recorded.root == now.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn receipt() -> InstallReceipt {
        let manifest =
            PackageManifest::from_json(&crate::manifest::tests::gam_json(), "gam.json").unwrap();
        let variant = &manifest.variants[0];
        InstallReceipt::new(
            &manifest,
            "arm64-macos-15.5",
            SourceInfo {
                url: variant.url.clone(),
                sha256: variant.sha256.clone(),
                file_name: variant.file_name().to_string(),
            },
            &[ResolvedDependency {
                name: "python".into(),
                root: PathBuf::from("/p/Cellar/python/3.13.1"),
            }],
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_receipt_write_read() {
        let temp = TempDir::new().unwrap();
        let r = receipt();
        r.write(temp.path()).unwrap();
        assert!(temp.path().join(RECEIPT_FILE).exists());

        let back = InstallReceipt::read(temp.path()).unwrap();
        assert_eq!(back, r);
        assert_eq!(back.commands[0].name, "gam");
        assert!(back.installed_by.starts_with("keg/"));
        assert!(back.time > 0);
    }

    #[test]
    fn test_read_missing_receipt_fails() {
        let temp = TempDir::new().unwrap();
        assert!(InstallReceipt::read(temp.path()).is_err());
    }

    #[test]
    fn test_dependencies_match_detects_upgrade() {
        let r = receipt();
        let same = vec![ResolvedDependency {
            name: "python".into(),
            root: PathBuf::from("/p/Cellar/python/3.13.1"),
        }];
        let upgraded = vec![ResolvedDependency {
            name: "python".into(),
            root: PathBuf::from("/p/Cellar/python/3.13.2"),
        }];
        assert!(r.dependencies_match(&same));
        assert!(!r.dependencies_match(&upgraded));
        assert!(!r.dependencies_match(&[]));
    }
}
