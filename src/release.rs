//! Manifest generation from GitHub releases.
//!
//! Takes an existing manifest as a template (name, metadata, install plan,
//! linkage, test) and replaces its version and variants with the assets of a
//! release. For each requested architecture exactly one asset is chosen: the
//! first whose name contains the OS token, one of the architecture's names and
//! the archive suffix, e.g. `gam-7.18.03-macos15.5-arm64.tar.xz`. A version
//! glued to the OS token (`macos15.5`) becomes the variant's minimum OS
//! version, and the asset's `digest` (`sha256:<hex>`) its checksum.

use crate::error::{KegError, Result};
use crate::manifest::{ArchiveKind, Checksum, PackageManifest, VariantSpec};
use crate::platform::{Arch, Os, OsVersion};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub const GITHUB_API_BASE: &str = "https://api.github.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub digest: Option<String>,
}

/// The parts of a GitHub release document keg reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl Release {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| KegError::Other(e.into()))
    }

    /// Tag without a leading `v`.
    pub fn version(&self) -> &str {
        self.tag_name.strip_prefix('v').unwrap_or(&self.tag_name)
    }
}

/// Which assets to pick.
#[derive(Debug, Clone)]
pub struct AssetFilter {
    pub os: Os,
    pub arches: Vec<Arch>,
    pub archive: ArchiveKind,
}

impl Default for AssetFilter {
    fn default() -> Self {
        Self {
            os: Os::Macos,
            arches: vec![Arch::Arm64, Arch::X86_64],
            archive: ArchiveKind::TarXz,
        }
    }
}

/// Client for the GitHub releases API.
#[derive(Clone)]
pub struct ReleaseClient {
    client: reqwest::Client,
    api_base: String,
}

impl ReleaseClient {
    pub fn new() -> Result<Self> {
        Self::with_base(GITHUB_API_BASE)
    }

    /// Client against another API root (GitHub Enterprise, tests).
    pub fn with_base(api_base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("keg/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| KegError::Other(e.into()))?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch the latest release of `repo` (`owner/name`).
    pub async fn latest(&self, repo: &str) -> Result<Release> {
        let url = format!("{}/repos/{}/releases/latest", self.api_base, repo);
        debug!(%url, "fetching release");

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| KegError::fetch(&url, e))?;

        if !response.status().is_success() {
            return Err(KegError::fetch(&url, format!("HTTP {}", response.status())));
        }

        response
            .json::<Release>()
            .await
            .map_err(|e| KegError::fetch(&url, format!("invalid release document: {}", e)))
    }
}

/// Build a manifest for `release` from `template`.
///
/// # Errors
///
/// [`KegError::Manifest`] if a requested architecture has no matching asset or
/// an asset lacks a usable `digest`.
pub fn manifest_from_release(
    template: &PackageManifest,
    release: &Release,
    filter: &AssetFilter,
) -> Result<PackageManifest> {
    let source = format!("release {}", release.tag_name);
    let suffix = archive_suffix(filter.archive);

    let mut variants = Vec::with_capacity(filter.arches.len());
    for arch in &filter.arches {
        let mut candidates = release
            .assets
            .iter()
            .filter(|a| asset_matches(&a.name, filter.os, *arch, suffix));

        let asset = candidates.next().ok_or_else(|| {
            KegError::manifest(
                &source,
                format!(
                    "no {} {} asset ending in {}",
                    filter.os.as_str(),
                    arch.as_str(),
                    suffix
                ),
            )
        })?;
        let skipped: Vec<&str> = candidates.map(|a| a.name.as_str()).collect();
        if !skipped.is_empty() {
            warn!(chosen = %asset.name, ?skipped, "several assets match; using the first");
        }

        let digest = asset.digest.clone().ok_or_else(|| {
            KegError::manifest(&source, format!("asset {} has no digest", asset.name))
        })?;
        let sha256 = Checksum::try_from(digest)
            .map_err(|e| KegError::manifest(&source, format!("asset {}: {}", asset.name, e)))?;

        variants.push(VariantSpec {
            os: filter.os,
            arch: *arch,
            min_os_version: min_os_version(&asset.name, filter.os),
            url: asset.browser_download_url.clone(),
            sha256,
            archive: Some(filter.archive),
        });
    }

    let mut manifest = template.clone();
    manifest.version = release.version().to_string();
    manifest.variants = variants;

    // Round-trip through the validator so generated output is always loadable.
    let json = manifest.to_json()?;
    PackageManifest::from_json(&json, &source)
}

fn archive_suffix(kind: ArchiveKind) -> &'static str {
    match kind {
        ArchiveKind::TarGz => ".tar.gz",
        ArchiveKind::TarXz => ".tar.xz",
        ArchiveKind::Tar => ".tar",
        ArchiveKind::Raw => "",
    }
}

fn asset_matches(name: &str, os: Os, arch: Arch, suffix: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.contains(os.as_str())
        && arch.aliases().iter().any(|alias| name.contains(alias))
        && name.ends_with(suffix)
}

/// `15.5` from `gam-7.18.03-macos15.5-arm64.tar.xz`.
fn min_os_version(name: &str, os: Os) -> Option<OsVersion> {
    let name = name.to_ascii_lowercase();
    let start = name.find(os.as_str())? + os.as_str().len();
    let digits: String = name[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.trim_end_matches('.').parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::{ARM_SHA, INTEL_SHA, gam_json};

    fn release_json() -> String {
        format!(
            r#"{{
  "tag_name": "v7.19.00",
  "assets": [
    {{ "name": "gam-7.19.00-linux-x86_64-glibc2.35.tar.xz",
       "browser_download_url": "https://github.com/GAM-team/GAM/releases/download/v7.19.00/gam-7.19.00-linux-x86_64-glibc2.35.tar.xz",
       "digest": "sha256:{intel}" }},
    {{ "name": "gam-7.19.00-macos15.5-arm64.tar.xz",
       "browser_download_url": "https://github.com/GAM-team/GAM/releases/download/v7.19.00/gam-7.19.00-macos15.5-arm64.tar.xz",
       "digest": "sha256:{arm}" }},
    {{ "name": "gam-7.19.00-macos13.7-x86_64.tar.xz",
       "browser_download_url": "https://github.com/GAM-team/GAM/releases/download/v7.19.00/gam-7.19.00-macos13.7-x86_64.tar.xz",
       "digest": "sha256:{intel}" }},
    {{ "name": "gam-7.19.00-windows-x86_64.msi",
       "browser_download_url": "https://example.com/gam.msi" }}
  ]
}}"#,
            arm = ARM_SHA,
            intel = INTEL_SHA
        )
    }

    fn template() -> PackageManifest {
        PackageManifest::from_json(&gam_json(), "gam.json").unwrap()
    }

    #[test]
    fn test_manifest_from_release_picks_macos_assets() {
        let release = Release::from_json(&release_json()).unwrap();
        let manifest = manifest_from_release(&template(), &release, &AssetFilter::default()).unwrap();

        assert_eq!(manifest.version, "7.19.00");
        assert_eq!(manifest.variants.len(), 2);

        let arm = &manifest.variants[0];
        assert_eq!(arm.arch, Arch::Arm64);
        assert!(arm.url.ends_with("macos15.5-arm64.tar.xz"));
        assert_eq!(arm.sha256.as_str(), ARM_SHA);
        assert_eq!(arm.min_os_version.as_ref().map(|v| v.to_string()).as_deref(), Some("15.5"));

        let intel = &manifest.variants[1];
        assert_eq!(intel.arch, Arch::X86_64);
        assert!(intel.url.contains("macos13.7"));
        assert_eq!(intel.sha256.as_str(), INTEL_SHA);

        assert_eq!(manifest.install, template().install);
        assert_eq!(manifest.metadata, template().metadata);
    }

    #[test]
    fn test_missing_architecture_fails() {
        let mut release = Release::from_json(&release_json()).unwrap();
        release.assets.retain(|a| !a.name.contains("arm64"));

        let err = manifest_from_release(&template(), &release, &AssetFilter::default()).unwrap_err();
        assert!(matches!(err, KegError::Manifest { .. }));
        assert!(err.to_string().contains("arm64"));
    }

    #[test]
    fn test_asset_without_digest_fails() {
        let mut release = Release::from_json(&release_json()).unwrap();
        for asset in &mut release.assets {
            asset.digest = None;
        }
        let err = manifest_from_release(&template(), &release, &AssetFilter::default()).unwrap_err();
        assert!(err.to_string().contains("digest"));
    }

    #[test]
    fn test_linux_filter() {
        let release = Release::from_json(&release_json()).unwrap();
        let filter = AssetFilter {
            os: Os::Linux,
            arches: vec![Arch::X86_64],
            archive: ArchiveKind::TarXz,
        };
        let manifest = manifest_from_release(&template(), &release, &filter).unwrap();
        assert!(manifest.variants[0].url.contains("linux-x86_64"));
        assert!(manifest.variants[0].min_os_version.is_none());
    }

    #[test]
    fn test_min_os_version_parsing() {
        assert_eq!(
            min_os_version("gam-7.18.03-macos15.5-arm64.tar.xz", Os::Macos).map(|v| v.to_string()),
            Some("15.5".to_string())
        );
        assert!(min_os_version("gam-7.18.03-macos-arm64.tar.xz", Os::Macos).is_none());
    }

    #[tokio::test]
    async fn test_latest_release_from_api() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/repos/GAM-team/GAM/releases/latest")
            .match_header("accept", "application/vnd.github+json")
            .with_status(200)
            .with_body(release_json())
            .create_async()
            .await;

        let client = ReleaseClient::with_base(&server.url()).unwrap();
        let release = client.latest("GAM-team/GAM").await.unwrap();
        assert_eq!(release.version(), "7.19.00");
        assert_eq!(release.assets.len(), 4);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_latest_release_http_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/repos/nobody/nothing/releases/latest")
            .with_status(404)
            .create_async()
            .await;

        let client = ReleaseClient::with_base(&server.url()).unwrap();
        let err = client.latest("nobody/nothing").await.unwrap_err();
        assert!(matches!(err, KegError::Fetch { .. }));
    }
}
