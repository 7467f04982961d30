//! Platform detection for selecting the correct package variant.
//!
//! Variants are keyed by operating system, CPU architecture and an optional
//! minimum OS version. Release artifacts for macOS are usually built against a
//! specific SDK (`gam-7.18.03-macos15.5-arm64.tar.xz`), so the host version has
//! to be known to pick the right one.
//!
//! # Platform Strings
//!
//! Platforms render and parse as `<arch>-<os>[-<version>]`:
//! - `arm64-macos-15.5` - Apple Silicon on macOS 15.5
//! - `x86_64-macos-13.7` - Intel on macOS 13.7
//! - `x86_64-linux` - x86_64 Linux, version unknown
//!
//! Architectures use Homebrew's spelling: `arm64`, not `aarch64`.

#[cfg(target_os = "macos")]
use anyhow::Context;
use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
#[cfg(target_os = "macos")]
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Macos,
    Linux,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Arm64,
    #[serde(rename = "x86_64")]
    X86_64,
}

impl Os {
    pub fn as_str(&self) -> &'static str {
        match self {
            Os::Macos => "macos",
            Os::Linux => "linux",
        }
    }
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::X86_64 => "x86_64",
        }
    }

    /// Other names release assets commonly use for this architecture.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Arch::Arm64 => &["arm64", "aarch64"],
            Arch::X86_64 => &["x86_64", "amd64", "x64"],
        }
    }
}

impl FromStr for Os {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "macos" | "darwin" | "osx" => Ok(Os::Macos),
            "linux" => Ok(Os::Linux),
            other => Err(anyhow!("Unknown operating system: {}", other)),
        }
    }
}

impl FromStr for Arch {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            "x86_64" | "amd64" | "intel" => Ok(Arch::X86_64),
            other => Err(anyhow!("Unknown architecture: {}", other)),
        }
    }
}

/// Dotted numeric OS version (`15.5`, `13.7.1`).
///
/// Missing components compare as zero, so `15` == `15.0`.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OsVersion(Vec<u32>);

impl FromStr for OsVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("Empty OS version");
        }
        let parts = s
            .split('.')
            .map(|p| {
                p.parse::<u32>()
                    .map_err(|_| anyhow!("Invalid OS version: {}", s))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(OsVersion(parts))
    }
}

impl TryFrom<String> for OsVersion {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<OsVersion> for String {
    fn from(value: OsVersion) -> Self {
        value.to_string()
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl PartialEq for OsVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for OsVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OsVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        for i in 0..self.0.len().max(other.0.len()) {
            let a = self.0.get(i).unwrap_or(&0);
            let b = other.0.get(i).unwrap_or(&0);
            match a.cmp(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

/// The host (or an explicitly requested) platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
    pub os_version: Option<OsVersion>,
}

impl Platform {
    pub fn new(os: Os, arch: Arch, os_version: Option<OsVersion>) -> Self {
        Self {
            os,
            arch,
            os_version,
        }
    }

    /// Detect the running system.
    ///
    /// # Errors
    ///
    /// Returns an error on operating systems other than macOS and Linux, on
    /// unknown architectures, or if `sw_vers` is unavailable on macOS.
    pub fn detect() -> Result<Self> {
        let arch: Arch = std::env::consts::ARCH.parse()?;

        #[cfg(target_os = "macos")]
        {
            let version = macos_version()?;
            Ok(Self::new(Os::Macos, arch, Some(version.parse()?)))
        }

        #[cfg(target_os = "linux")]
        {
            Ok(Self::new(Os::Linux, arch, None))
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            let _ = arch;
            bail!("Unsupported platform")
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.arch.as_str(), self.os.as_str())?;
        if let Some(v) = &self.os_version {
            write!(f, "-{}", v)?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '-');
        let arch = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| anyhow!("Invalid platform: {}", s))?
            .parse()?;
        let os = parts
            .next()
            .ok_or_else(|| anyhow!("Invalid platform (expected <arch>-<os>[-<version>]): {}", s))?
            .parse()?;
        let os_version = parts.next().map(str::parse).transpose()?;
        Ok(Self::new(os, arch, os_version))
    }
}

#[cfg(target_os = "macos")]
fn macos_version() -> Result<String> {
    let output = Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .context("Failed to run sw_vers")?;

    let version = String::from_utf8(output.stdout)
        .context("Invalid UTF-8 in sw_vers output")?
        .trim()
        .to_string();

    Ok(version)
}
