use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KegError {
    #[error("Invalid manifest {source_name}: {message}")]
    Manifest {
        source_name: String,
        message: String,
    },

    #[error("Unsupported platform {platform} for {package}")]
    PlatformUnsupported { package: String, platform: String },

    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Checksum mismatch for {package}: expected {expected}, got {actual}")]
    Integrity {
        package: String,
        expected: String,
        actual: String,
    },

    #[error("Dependency not installed: {package} requires {dependency} (looked in {})", .searched.display())]
    DependencyMissing {
        package: String,
        dependency: String,
        searched: PathBuf,
    },

    #[error("Cannot stage {package}: {} {reason}", .path.display())]
    StageConflict {
        package: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Refusing to overwrite {}: not managed by keg", .path.display())]
    LinkConflict { path: PathBuf },

    #[error("{0} is not installed")]
    NotInstalled(String),

    #[error("Cannot uninstall {name} - required by: {}", .dependents.join(", "))]
    InUse {
        name: String,
        dependents: Vec<String>,
    },

    #[error("Timed out after {}s while {what}", .after.as_secs())]
    Timeout { what: String, after: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KegError {
    pub fn manifest(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        KegError::Manifest {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn fetch(url: impl Into<String>, reason: impl ToString) -> Self {
        KegError::Fetch {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        KegError::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Process exit code for this error; distinct per error kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            KegError::Manifest { .. } => 2,
            KegError::PlatformUnsupported { .. } => 3,
            KegError::Fetch { .. } => 4,
            KegError::Integrity { .. } => 5,
            KegError::DependencyMissing { .. } => 6,
            KegError::StageConflict { .. } => 7,
            KegError::LinkConflict { .. } => 8,
            KegError::NotInstalled(_) => 9,
            KegError::InUse { .. } => 10,
            KegError::Timeout { .. } => 11,
            KegError::Io(_) | KegError::Other(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, KegError>;
