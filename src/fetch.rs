//! Artifact download into scratch storage.
//!
//! Downloads stream chunk by chunk into a temporary file under the cache
//! directory; nothing is buffered whole and nothing is written near the Cellar.
//! The scratch file is owned by the returned [`FetchedArtifact`] and deleted
//! when it is dropped, so an interrupted or failed install leaves no download
//! behind.
//!
//! # Retries
//!
//! Connection errors, timeouts, `5xx`, `408` and `429` responses are retried
//! with exponential backoff up to [`Settings::fetch_attempts`]. Other `4xx`
//! responses mean the URL is unreachable and fail immediately.
//!
//! `file://` URLs are read from the local filesystem the same way, which is
//! handy for mirrors and tests.

use crate::config::{Layout, Settings};
use crate::error::{KegError, Result};
use crate::manifest::{ArchiveKind, Checksum, VariantSpec};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("keg/", env!("CARGO_PKG_VERSION"));
const COPY_BUFFER: usize = 64 * 1024;

/// A downloaded, not yet verified artifact.
#[derive(Debug)]
pub struct FetchedArtifact {
    pub path: TempPath,
    pub url: String,
    pub declared: Checksum,
    pub archive: ArchiveKind,
    /// Name of the artifact as published (last URL segment).
    pub file_name: String,
    pub size: u64,
}

impl FetchedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Outcome of a failed attempt.
#[derive(Debug)]
enum AttemptError {
    Retryable(String),
    Fatal(String),
}

pub struct Fetcher {
    client: reqwest::Client,
    settings: Settings,
    scratch: PathBuf,
}

impl Fetcher {
    pub fn new(layout: &Layout, settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| KegError::Other(e.into()))?;

        Ok(Self {
            client,
            settings: settings.clone(),
            scratch: layout.cache.clone(),
        })
    }

    /// Download `variant` for `package` into a scratch file.
    ///
    /// # Errors
    ///
    /// [`KegError::Fetch`] once the retry budget is spent or on a
    /// non-retryable response.
    pub async fn fetch(&self, package: &str, variant: &VariantSpec) -> Result<FetchedArtifact> {
        fs::create_dir_all(&self.scratch).await?;

        let attempts = self.settings.fetch_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let scratch = tempfile::Builder::new()
                .prefix(&format!(".{}-", package))
                .suffix(".part")
                .tempfile_in(&self.scratch)?;
            let (file, path) = scratch.into_parts();
            let mut file = fs::File::from_std(file);

            debug!(%package, url = %variant.url, attempt, "fetching");
            let pb = self.progress_bar(package);
            let result =
                tokio::time::timeout(self.settings.fetch_timeout, self.attempt(&variant.url, &mut file, &pb))
                    .await
                    .unwrap_or_else(|_| {
                        Err(AttemptError::Retryable(format!(
                            "timed out after {:?}",
                            self.settings.fetch_timeout
                        )))
                    });

            match result {
                Ok(size) => {
                    pb.finish_and_clear();
                    return Ok(FetchedArtifact {
                        path,
                        url: variant.url.clone(),
                        declared: variant.sha256.clone(),
                        archive: variant.archive_kind(),
                        file_name: variant.file_name().to_string(),
                        size,
                    });
                }
                Err(AttemptError::Fatal(reason)) => {
                    pb.abandon();
                    return Err(KegError::fetch(&variant.url, reason));
                }
                Err(AttemptError::Retryable(reason)) => {
                    pb.abandon();
                    // Partial download goes with `path` here.
                    drop(file);
                    drop(path);
                    last_error = reason;
                    if attempt < attempts {
                        let delay = self.settings.backoff(attempt);
                        warn!(
                            %package,
                            attempt,
                            "download failed: {}; retrying in {}ms",
                            last_error,
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(KegError::fetch(
            &variant.url,
            format!("{} (gave up after {} attempts)", last_error, attempts),
        ))
    }

    async fn attempt(
        &self,
        url: &str,
        file: &mut fs::File,
        pb: &ProgressBar,
    ) -> std::result::Result<u64, AttemptError> {
        if let Some(local) = url.strip_prefix("file://") {
            return copy_local(Path::new(local), file, pb).await;
        }

        let mut response = self.client.get(url).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let reason = format!("HTTP {}", status);
            return Err(if is_retryable_status(status) {
                AttemptError::Retryable(reason)
            } else {
                AttemptError::Fatal(reason)
            });
        }

        if let Some(total) = response.content_length() {
            pb.set_length(total);
        }

        let mut downloaded: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            file.write_all(&chunk).await.map_err(io_fatal)?;
            downloaded += chunk.len() as u64;
            pb.set_position(downloaded);
        }
        file.flush().await.map_err(io_fatal)?;

        Ok(downloaded)
    }

    fn progress_bar(&self, package: &str) -> ProgressBar {
        if !self.settings.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(format!("⬇ {}", package));
        pb
    }
}

async fn copy_local(
    source: &Path,
    file: &mut fs::File,
    pb: &ProgressBar,
) -> std::result::Result<u64, AttemptError> {
    let mut input = fs::File::open(source).await.map_err(|e| {
        AttemptError::Fatal(format!("cannot open {}: {}", source.display(), e))
    })?;
    if let Ok(meta) = input.metadata().await {
        pb.set_length(meta.len());
    }

    let mut buffer = vec![0; COPY_BUFFER];
    let mut copied: u64 = 0;
    loop {
        let n = input.read(&mut buffer).await.map_err(io_fatal)?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n]).await.map_err(io_fatal)?;
        copied += n as u64;
        pb.set_position(copied);
    }
    file.flush().await.map_err(io_fatal)?;

    Ok(copied)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn classify(error: reqwest::Error) -> AttemptError {
    if error.is_builder() {
        return AttemptError::Fatal(format!("invalid URL: {}", error));
    }
    match error.status() {
        Some(status) if !is_retryable_status(status) => AttemptError::Fatal(error.to_string()),
        _ => AttemptError::Retryable(error.to_string()),
    }
}

fn io_fatal(error: std::io::Error) -> AttemptError {
    AttemptError::Fatal(format!("write failed: {}", error))
}
