//! Library interface for kegger, the `keg` package installer.
//!
//! keg installs prebuilt release artifacts described by JSON manifests into an
//! isolated Cellar and exposes their commands on a shared `bin/` path:
//!
//! - [`manifest`] parses manifests and picks the variant for a [`Platform`]
//! - [`fetch`] streams artifacts into scratch storage with retries
//! - [`verify`] checks SHA-256 digests, fail-closed
//! - [`stage`] extracts into a private directory and wires up dependencies
//! - [`symlink`] publishes commands as symlinks or launchers
//! - [`installer`] ties the pipeline together
//!
//! All roots come from an explicit [`Layout`], so every component can run
//! against a temporary prefix.

pub mod cellar;
pub mod colors;
pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod installer;
pub mod lock;
pub mod manifest;
pub mod platform;
pub mod receipt;
pub mod release;
pub mod stage;
pub mod symlink;
pub mod verify;

pub use config::{Layout, Settings};
pub use error::{KegError, Result};
pub use installer::{InstallOutcome, InstallReport, Installer};
pub use manifest::PackageManifest;
pub use platform::Platform;
pub use stage::StagedPackage;
pub use symlink::{ActivationLink, Linker, normalize_path};
