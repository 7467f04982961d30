//! SHA-256 verification of fetched artifacts.
//!
//! Verification is fail-closed: an artifact only becomes a [`VerifiedArtifact`]
//! when its measured digest equals the declared one byte for byte. On mismatch
//! the scratch file is deleted before the error is returned.

use crate::error::{KegError, Result};
use crate::fetch::FetchedArtifact;
use crate::manifest::Checksum;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// An artifact whose content matches its manifest digest.
#[derive(Debug)]
pub struct VerifiedArtifact {
    pub artifact: FetchedArtifact,
    pub measured: Checksum,
}

impl VerifiedArtifact {
    pub fn path(&self) -> &Path {
        self.artifact.path()
    }
}

/// Lowercase hex SHA-256 of a file, read in chunks.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Lowercase hex SHA-256 of an in-memory buffer.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Check `artifact` against its declared digest.
///
/// # Errors
///
/// [`KegError::Integrity`] on mismatch; the scratch file is already gone.
pub async fn verify(artifact: FetchedArtifact, package: &str) -> Result<VerifiedArtifact> {
    let actual = sha256_file(artifact.path()).await?;

    if actual.as_bytes() != artifact.declared.as_str().as_bytes() {
        let expected = artifact.declared.to_string();
        warn!(%package, %expected, %actual, "checksum mismatch; discarding download");
        if let Err(e) = artifact.path.close() {
            warn!("Failed to remove scratch file: {}", e);
        }
        return Err(KegError::Integrity {
            package: package.to_string(),
            expected,
            actual,
        });
    }

    debug!(%package, sha256 = %actual, "artifact verified");
    let measured = Checksum::try_from(actual).map_err(|e| KegError::Other(anyhow::anyhow!(e)))?;
    Ok(VerifiedArtifact { artifact, measured })
}
