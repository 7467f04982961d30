//! Package manifests - typed descriptions of what to fetch and how to install it.
//!
//! A manifest names a package, lists one download per platform variant with its
//! expected SHA-256, declares the shared runtimes it needs, and gives an ordered
//! install plan. Manifests are read once per install and never mutated.
//!
//! # Format
//!
//! ```json
//! {
//!   "name": "gam",
//!   "version": "7.18.03",
//!   "homepage": "https://github.com/GAM-team/GAM",
//!   "license": "Apache-2.0",
//!   "variants": [
//!     { "os": "macos", "arch": "arm64", "min_os_version": "15.5",
//!       "url": "https://.../gam-7.18.03-macos15.5-arm64.tar.xz",
//!       "sha256": "..." }
//!   ],
//!   "install": [
//!     { "op": "extract", "into": "libexec", "strip_components": 1 },
//!     { "op": "command", "name": "gam", "target": "libexec/gam" }
//!   ],
//!   "test": { "command": "gam", "args": ["version"] }
//! }
//! ```
//!
//! # Variant Selection
//!
//! Variants are evaluated in declaration order and exactly one must match the
//! platform. No match is [`KegError::PlatformUnsupported`]; several matches are
//! rejected as an ambiguous manifest rather than resolved by position.

use crate::error::{KegError, Result};
use crate::platform::{Arch, Os, OsVersion, Platform};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Component, Path};

/// Placeholder for the staged keg directory in environment values.
pub const KEG_PLACEHOLDER: &str = "@@KEG@@";
/// Placeholder for the install prefix in environment values.
pub const PREFIX_PLACEHOLDER: &str = "@@PREFIX@@";
/// Prefix of a dependency-root placeholder: `@@DEP:python@@`.
pub const DEP_PLACEHOLDER_PREFIX: &str = "@@DEP:";

/// Lowercase hex SHA-256 digest.
///
/// Accepts the `sha256:<hex>` form used by release APIs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum(String);

impl Checksum {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Checksum {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let hex = value.trim();
        let hex = hex.strip_prefix("sha256:").unwrap_or(hex).to_ascii_lowercase();
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!(
                "invalid sha256 digest {:?} (expected 64 hex characters)",
                value
            ));
        }
        Ok(Checksum(hex))
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Container format of a downloaded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveKind {
    #[serde(rename = "tar.gz")]
    TarGz,
    #[serde(rename = "tar.xz")]
    TarXz,
    #[serde(rename = "tar")]
    Tar,
    /// The artifact is the executable itself.
    #[serde(rename = "raw")]
    Raw,
}

impl ArchiveKind {
    /// Guess the format from a URL or file name.
    pub fn infer(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
        if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            ArchiveKind::TarGz
        } else if path.ends_with(".tar.xz") || path.ends_with(".txz") {
            ArchiveKind::TarXz
        } else if path.ends_with(".tar") {
            ArchiveKind::Tar
        } else {
            ArchiveKind::Raw
        }
    }
}

/// One platform-specific download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSpec {
    pub os: Os,
    pub arch: Arch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_os_version: Option<OsVersion>,
    pub url: String,
    pub sha256: Checksum,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveKind>,
}

impl VariantSpec {
    pub fn matches(&self, platform: &Platform) -> bool {
        if self.os != platform.os || self.arch != platform.arch {
            return false;
        }
        match (&self.min_os_version, &platform.os_version) {
            (None, _) => true,
            (Some(min), Some(host)) => host >= min,
            // A version floor can't be checked against an unknown host.
            (Some(_), None) => false,
        }
    }

    pub fn archive_kind(&self) -> ArchiveKind {
        self.archive.unwrap_or_else(|| ArchiveKind::infer(&self.url))
    }

    /// File name of the artifact, taken from the last URL segment.
    pub fn file_name(&self) -> &str {
        let path = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        path.rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("artifact")
    }
}

/// A shared runtime the package needs at run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub name: String,
    /// Where to find the dependency: a path relative to the runtime root
    /// (`python@3.13`) or an absolute path. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl DependencySpec {
    pub fn lookup_name(&self) -> &str {
        self.hint.as_deref().unwrap_or(&self.name)
    }
}

/// How a package reaches its dependencies at run time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum LinkageStrategy {
    /// Self-contained payload; nothing outside the keg is used.
    #[default]
    Bundled,
    /// Symlink every entry of `<dependency root>/<from>` into `<keg>/<into>`.
    SharedSymlink {
        dependency: String,
        #[serde(default)]
        from: String,
        into: String,
    },
    /// Export these variables from a generated launcher. Values may use
    /// `@@KEG@@`, `@@PREFIX@@` and `@@DEP:<name>@@`.
    EnvInjected { vars: BTreeMap<String, String> },
}

/// How commands are exposed on the shared bin path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationMode {
    Symlink,
    Launcher,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InstallDirective {
    /// Unpack the artifact under `into` (relative to the keg), dropping the
    /// first `strip_components` path components of every entry.
    Extract {
        #[serde(default)]
        into: String,
        #[serde(default)]
        strip_components: usize,
    },
    MakeExecutable { path: String },
    /// Expose `<keg>/<target>` as `bin/<name>`.
    Command { name: String, target: String },
}

/// Ordered install directives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstallPlan(pub Vec<InstallDirective>);

impl InstallPlan {
    pub fn directives(&self) -> &[InstallDirective] {
        &self.0
    }

    /// `(name, target)` of every exposed command, in plan order.
    pub fn commands(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().filter_map(|d| match d {
            InstallDirective::Command { name, target } => Some((name.as_str(), target.as_str())),
            _ => None,
        })
    }
}

/// Post-install check, e.g. `gam version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmokeTest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Inert descriptive fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    #[serde(flatten)]
    pub metadata: Metadata,
    pub variants: Vec<VariantSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencySpec>,
    #[serde(default)]
    pub linkage: LinkageStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation: Option<ActivationMode>,
    pub install: InstallPlan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<SmokeTest>,
}

impl PackageManifest {
    /// Read and validate a manifest file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let source_name = path.display().to_string();
        let text = fs::read_to_string(path)
            .map_err(|e| KegError::manifest(&source_name, format!("cannot read file: {}", e)))?;
        Self::from_json(&text, &source_name)
    }

    /// Parse and validate manifest JSON. Syntax errors carry line and column.
    pub fn from_json(text: &str, source_name: &str) -> Result<Self> {
        let manifest: Self =
            serde_json::from_str(text).map_err(|e| KegError::manifest(source_name, e.to_string()))?;
        manifest
            .validate()
            .map_err(|message| KegError::manifest(source_name, message))?;
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| KegError::Other(e.into()))
    }

    /// `<name>-<version>`, used for display and scratch file names.
    pub fn id(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    pub fn activation_mode(&self) -> ActivationMode {
        self.activation.unwrap_or(match self.linkage {
            LinkageStrategy::EnvInjected { .. } => ActivationMode::Launcher,
            LinkageStrategy::Bundled | LinkageStrategy::SharedSymlink { .. } => {
                ActivationMode::Symlink
            }
        })
    }

    /// Pick the single variant for `platform`.
    pub fn select_variant(&self, platform: &Platform) -> Result<&VariantSpec> {
        let matching: Vec<&VariantSpec> =
            self.variants.iter().filter(|v| v.matches(platform)).collect();

        match matching.as_slice() {
            [] => Err(KegError::PlatformUnsupported {
                package: self.id(),
                platform: platform.to_string(),
            }),
            [only] => Ok(only),
            many => Err(KegError::manifest(
                format!("manifest {}", self.id()),
                format!(
                    "{} variants match {}: {}",
                    many.len(),
                    platform,
                    many.iter().map(|v| v.url.as_str()).collect::<Vec<_>>().join(", ")
                ),
            )),
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        validate_identifier("name", &self.name)?;
        validate_identifier("version", &self.version)?;

        if self.variants.is_empty() {
            return Err("at least one variant is required".into());
        }

        // Any two variants for the same os and arch both match a new enough host.
        let mut targets = HashSet::new();
        for variant in &self.variants {
            if !targets.insert((variant.os, variant.arch)) {
                return Err(format!(
                    "more than one variant for {}-{} (overlapping variants are ambiguous)",
                    variant.arch.as_str(),
                    variant.os.as_str()
                ));
            }
        }

        let mut deps = HashSet::new();
        for dep in &self.dependencies {
            validate_identifier("dependency name", &dep.name)?;
            if !deps.insert(dep.name.as_str()) {
                return Err(format!("dependency {} declared twice", dep.name));
            }
        }

        let mut extracts = 0;
        let mut commands = HashSet::new();
        for directive in self.install.directives() {
            match directive {
                InstallDirective::Extract { into, .. } => {
                    extracts += 1;
                    validate_relative("extract.into", into, true)?;
                }
                InstallDirective::MakeExecutable { path } => {
                    validate_relative("make_executable.path", path, false)?;
                }
                InstallDirective::Command { name, target } => {
                    validate_identifier("command name", name)?;
                    validate_relative("command.target", target, false)?;
                    if !commands.insert(name.as_str()) {
                        return Err(format!("command {} declared twice", name));
                    }
                }
            }
        }
        if extracts == 0 {
            return Err("install plan needs an extract directive".into());
        }
        if commands.is_empty() {
            return Err("install plan needs at least one command".into());
        }

        match &self.linkage {
            LinkageStrategy::Bundled => {}
            LinkageStrategy::SharedSymlink {
                dependency,
                from,
                into,
            } => {
                if !deps.contains(dependency.as_str()) {
                    return Err(format!("linkage uses undeclared dependency {}", dependency));
                }
                validate_relative("linkage.from", from, true)?;
                validate_relative("linkage.into", into, false)?;
            }
            LinkageStrategy::EnvInjected { vars } => {
                if vars.is_empty() {
                    return Err("env_injected linkage needs at least one variable".into());
                }
                for (key, value) in vars {
                    if key.is_empty()
                        || key.starts_with(|c: char| c.is_ascii_digit())
                        || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        return Err(format!("invalid environment variable name {:?}", key));
                    }
                    for dep in dependency_placeholders(value) {
                        if !deps.contains(dep) {
                            return Err(format!("{} refers to undeclared dependency {}", key, dep));
                        }
                    }
                }
                if self.activation == Some(ActivationMode::Symlink) {
                    return Err("symlink activation cannot inject environment variables".into());
                }
            }
        }

        if let Some(test) = &self.test {
            if !commands.contains(test.command.as_str()) {
                return Err(format!("test runs unknown command {}", test.command));
            }
        }

        Ok(())
    }
}

/// Dependency names referenced by `@@DEP:<name>@@` placeholders in `value`.
pub fn dependency_placeholders(value: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut rest = value;
    while let Some(start) = rest.find(DEP_PLACEHOLDER_PREFIX) {
        let after = &rest[start + DEP_PLACEHOLDER_PREFIX.len()..];
        match after.find("@@") {
            Some(end) => {
                found.push(&after[..end]);
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    found
}

fn validate_identifier(field: &str, value: &str) -> std::result::Result<(), String> {
    if value.is_empty() {
        return Err(format!("{} must not be empty", field));
    }
    if value.starts_with('.') || value.contains(['/', '\\']) || value.chars().any(char::is_whitespace)
    {
        return Err(format!("{} {:?} is not a valid identifier", field, value));
    }
    Ok(())
}

fn validate_relative(field: &str, value: &str, allow_empty: bool) -> std::result::Result<(), String> {
    if value.is_empty() {
        return if allow_empty {
            Ok(())
        } else {
            Err(format!("{} must not be empty", field))
        };
    }
    let path = Path::new(value);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(format!("{} {:?} must stay inside the keg", field, value));
    }
    Ok(())
}
