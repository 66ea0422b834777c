//! Artifact download.
//!
//! - `http(s)://` sources stream through reqwest with a progress bar and retry on
//!   transient failures (connect/timeout/5xx/429).
//! - `file://` sources are copied locally (mirrors, offline bundles, tests).
//! - When the catalog publishes a SHA-256, a mismatch deletes the artifact and fails.

use anyhow::{Context, Result};
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use super::files;
use crate::models::catalog::DownloadSource;
use crate::security::crypto;
use crate::utils::logging::mask_url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Retrieve `source` into `dest` (overwritten) and verify it.
    async fn fetch(&self, source: &DownloadSource, dest: &Path) -> Result<FetchedArtifact>;
}

#[derive(Debug, thiserror::Error)]
#[error("HTTP status {0}")]
struct HttpStatusError(u16);

fn is_transient_http_error(e: &anyhow::Error) -> bool {
    if let Some(status) = e.downcast_ref::<HttpStatusError>() {
        return status.0 == 429 || (500..600).contains(&status.0);
    }
    if let Some(re) = e.downcast_ref::<reqwest::Error>() {
        return re.is_timeout() || re.is_connect() || re.is_body() || re.is_request();
    }
    let msg = format!("{:#}", e).to_ascii_lowercase();
    msg.contains("connection reset") || msg.contains("timed out") || msg.contains("broken pipe")
}

pub struct HttpFetcher {
    client: reqwest::Client,
    retries: usize,
    show_progress: bool,
}

impl HttpFetcher {
    pub fn new(retries: usize, show_progress: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("devtools-center/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::with_client(client, retries, show_progress))
    }

    pub fn with_client(client: reqwest::Client, retries: usize, show_progress: bool) -> Self {
        Self {
            client,
            retries,
            show_progress,
        }
    }

    fn progress_bar(&self, total: Option<u64>, label: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = match total {
            Some(n) => ProgressBar::new(n),
            None => ProgressBar::new_spinner(),
        };
        if let Ok(style) = ProgressStyle::with_template(
            "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        ) {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.set_message(label.to_string());
        pb
    }

    async fn download_once(&self, url: &str, dest: &Path, label: &str) -> Result<(u64, String)> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", mask_url(url)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow::Error::new(HttpStatusError(status.as_u16()))
                .context(format!("GET {} refused", mask_url(url))));
        }

        let pb = self.progress_bar(resp.content_length(), label);
        let mut resp = resp;
        let mut out = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("create failed: {:?}", dest))?;
        let mut hasher = Sha256::new();
        let mut total: u64 = 0;

        while let Some(chunk) = resp
            .chunk()
            .await
            .with_context(|| format!("Reading body of {} failed", mask_url(url)))?
        {
            hasher.update(&chunk);
            out.write_all(&chunk)
                .await
                .with_context(|| format!("write failed: {:?}", dest))?;
            total = total.saturating_add(chunk.len() as u64);
            pb.set_position(total);
        }
        out.flush().await?;
        pb.finish_and_clear();

        Ok((total, crypto::finalize_hex(hasher)))
    }

    async fn download_with_retries(&self, url: &str, dest: &Path, label: &str) -> Result<(u64, String)> {
        let retry_strategy = ExponentialBackoff::from_millis(500)
            .factor(2)
            .max_delay(Duration::from_secs(10))
            .take(self.retries)
            .map(jitter);

        RetryIf::spawn(
            retry_strategy,
            || self.download_once(url, dest, label),
            |e: &anyhow::Error| {
                let transient = is_transient_http_error(e);
                if transient {
                    warn!(
                        "[PHASE: installation] [STEP: download] Transient download failure; will retry (url={}, err={:#})",
                        mask_url(url),
                        e
                    );
                }
                transient
            },
        )
        .await
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, source: &DownloadSource, dest: &Path) -> Result<FetchedArtifact> {
        let started = Instant::now();
        let url = url::Url::parse(&source.url)
            .with_context(|| format!("Invalid download URL {}", mask_url(&source.url)))?;
        let label = source.file_name();

        info!(
            "[PHASE: installation] [STEP: download] Fetching {} (url={}, dest={:?})",
            label,
            mask_url(&source.url),
            dest
        );

        let (bytes, sha256) = match url.scheme() {
            "file" => {
                let src = url
                    .to_file_path()
                    .map_err(|_| anyhow::anyhow!("Invalid file URL {}", source.url))?;
                files::copy_file_with_retries_and_sha256(&src, dest, &label).await?
            }
            "http" | "https" => self.download_with_retries(url.as_str(), dest, &label).await?,
            other => return Err(anyhow::anyhow!("Unsupported download scheme '{}'", other)),
        };

        if let Some(expected) = source.sha256.as_deref() {
            if let Err(e) = crypto::verify_sha256(expected, &sha256) {
                if let Err(cleanup) = files::remove_file_idempotent(dest, &label).await {
                    warn!(
                        "[PHASE: installation] [STEP: download] Failed to delete unverified {:?}: {:#}",
                        dest, cleanup
                    );
                }
                return Err(e.context(format!("{} failed verification", label)));
            }
            debug!(
                "[PHASE: installation] [STEP: download] Checksum verified ({})",
                sha256
            );
        } else {
            debug!(
                "[PHASE: installation] [STEP: download] No published checksum for {}; computed sha256={}",
                label, sha256
            );
        }

        info!(
            "[PHASE: installation] [STEP: download] Fetched {} (bytes={}, duration_ms={})",
            label,
            bytes,
            started.elapsed().as_millis()
        );

        Ok(FetchedArtifact {
            path: dest.to_path_buf(),
            bytes,
            sha256,
        })
    }
}
