//! Filesystem layout and operational limits.
//!
//! Nothing here is global: every component receives a [`Layout`] and
//! [`Settings`], which lets tests run against a throwaway prefix.
//!
//! ```text
//! <prefix>/
//!   Cellar/<name>/<version>/   staged kegs
//!   bin/                       activation entries
//!   opt/<name>                 link to the active keg (shared runtime root)
//!   var/keg/cache/             scratch downloads
//!   var/keg/locks/             per-package advisory locks
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the detected prefix.
pub const PREFIX_ENV: &str = "KEG_PREFIX";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub prefix: PathBuf,
    pub cellar: PathBuf,
    pub bin: PathBuf,
    pub runtime: PathBuf,
    pub cache: PathBuf,
    pub locks: PathBuf,
}

impl Layout {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        let prefix = prefix.into();
        Self {
            cellar: prefix.join("Cellar"),
            bin: prefix.join("bin"),
            runtime: prefix.join("opt"),
            cache: prefix.join("var/keg/cache"),
            locks: prefix.join("var/keg/locks"),
            prefix,
        }
    }

    /// `KEG_PREFIX` if set, else the Homebrew default for this architecture.
    pub fn detect() -> Self {
        if let Some(prefix) = std::env::var_os(PREFIX_ENV) {
            return Self::new(prefix);
        }

        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            Self::new("/opt/homebrew")
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            Self::new("/usr/local")
        }
    }

    pub fn keg_path(&self, name: &str, version: &str) -> PathBuf {
        self.cellar.join(name).join(version)
    }

    pub fn package_dir(&self, name: &str) -> PathBuf {
        self.cellar.join(name)
    }

    pub fn opt_link(&self, name: &str) -> PathBuf {
        self.runtime.join(name)
    }

    pub fn bin_entry(&self, command: &str) -> PathBuf {
        self.bin.join(command)
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.locks.join(format!("{}.lock", name))
    }
}

/// Timeouts and retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Total time allowed for one download attempt.
    pub fetch_timeout: Duration,
    pub connect_timeout: Duration,
    /// Attempts per download, including the first.
    pub fetch_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub extract_timeout: Duration,
    pub lock_timeout: Duration,
    pub test_timeout: Duration,
    /// Show download progress bars.
    pub progress: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            fetch_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(8),
            extract_timeout: Duration::from_secs(120),
            lock_timeout: Duration::from_secs(30),
            test_timeout: Duration::from_secs(30),
            progress: false,
        }
    }
}

impl Settings {
    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base... capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}
