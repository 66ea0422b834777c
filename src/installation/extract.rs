//! Archive extraction into a staging directory.
//!
//! - zip and tar.gz payloads
//! - a single top-level directory shared by every entry is stripped, so
//!   `android-studio/bin/studio.sh` lands at `<dest>/bin/studio.sh`
//! - entries that would escape the destination (absolute, `..`, through a symlink)
//!   are rejected
//! - unix permissions are preserved (executables stay executable)
//!
//! Extraction is blocking work; it runs on the blocking pool and checks for
//! cancellation and its deadline between entries, so callers can always await it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use log::{debug, info};
use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::models::catalog::ArchiveFormat;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractSummary {
    pub entries: usize,
    pub stripped_root: Option<String>,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Unpack `archive` into `dest` (created when missing).
    ///
    /// Returns only once no more writes into `dest` can happen, even when cancelled.
    async fn extract(
        &self,
        archive: &Path,
        format: ArchiveFormat,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExtractSummary>;
}

pub struct ArchiveExtractor {
    timeout: Duration,
}

impl ArchiveExtractor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Extractor for ArchiveExtractor {
    async fn extract(
        &self,
        archive: &Path,
        format: ArchiveFormat,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExtractSummary> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let archive_owned = archive.to_path_buf();
        let dest_owned = dest.to_path_buf();
        let cancel = cancel.clone();
        let timeout = self.timeout;

        info!(
            "[PHASE: installation] [STEP: extract] Extracting {:?} ({:?}) into {:?}",
            archive, format, dest
        );

        let summary = tokio::task::spawn_blocking(move || {
            let stop = || -> Result<()> {
                if cancel.is_cancelled() {
                    return Err(anyhow::anyhow!("Extraction cancelled"));
                }
                if Instant::now() > deadline {
                    return Err(anyhow::anyhow!(
                        "Extraction timed out after {}s",
                        timeout.as_secs()
                    ));
                }
                Ok(())
            };
            std::fs::create_dir_all(&dest_owned)
                .with_context(|| format!("create_dir_all failed: {:?}", dest_owned))?;
            match format {
                ArchiveFormat::Zip => extract_zip(&archive_owned, &dest_owned, &stop),
                ArchiveFormat::TarGz => extract_tar_gz(&archive_owned, &dest_owned, &stop),
            }
        })
        .await
        .context("Extraction task failed")??;

        info!(
            "[PHASE: installation] [STEP: extract] Extracted {} entries (stripped_root={:?}, duration_ms={})",
            summary.entries,
            summary.stripped_root,
            started.elapsed().as_millis()
        );
        Ok(summary)
    }
}

/// Archive member name -> relative path made of normal components only.
fn sanitize(name: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for comp in name.components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "Archive entry {:?} escapes the destination",
                    name
                ))
            }
        }
    }
    Ok(out)
}

/// The single top-level directory shared by all entries, if there is one.
fn common_root(listing: &[(PathBuf, bool)]) -> Option<OsString> {
    let mut root: Option<OsString> = None;
    for (path, is_dir) in listing {
        let mut comps = path.components();
        let first = match comps.next() {
            Some(Component::Normal(c)) => c.to_os_string(),
            _ => continue,
        };
        // A top-level file means there is no wrapper directory.
        if comps.next().is_none() && !is_dir {
            return None;
        }
        match &root {
            None => root = Some(first),
            Some(r) if *r == first => {}
            Some(_) => return None,
        }
    }
    root
}

fn strip_root(rel: &Path, root: Option<&OsString>) -> PathBuf {
    match root {
        Some(_) => rel.components().skip(1).collect(),
        None => rel.to_path_buf(),
    }
}

/// Refuse to write through a symlinked directory planted by an earlier entry.
fn ensure_no_symlink_ancestors(dest_root: &Path, target: &Path) -> Result<()> {
    let Some(parent) = target.parent() else {
        return Ok(());
    };
    for ancestor in parent.ancestors() {
        if ancestor == dest_root || !ancestor.starts_with(dest_root) {
            break;
        }
        if let Ok(meta) = std::fs::symlink_metadata(ancestor) {
            if meta.file_type().is_symlink() {
                return Err(anyhow::anyhow!(
                    "Archive entry {:?} would be written through symlink {:?}",
                    target,
                    ancestor
                ));
            }
        }
    }
    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create_dir_all failed: {:?}", parent))?;
    }
    Ok(())
}

fn extract_zip(
    archive: &Path,
    dest: &Path,
    stop: &dyn Fn() -> Result<()>,
) -> Result<ExtractSummary> {
    use std::os::unix::fs::PermissionsExt;

    let file = File::open(archive).with_context(|| format!("open failed: {:?}", archive))?;
    let mut zip = zip::ZipArchive::new(file).context("Not a valid zip archive")?;

    let mut listing = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip.by_index_raw(i)?;
        listing.push((sanitize(Path::new(entry.name()))?, entry.is_dir()));
    }
    let root = common_root(&listing);

    let mut count = 0usize;
    for (i, (rel, _)) in listing.iter().enumerate() {
        stop()?;
        let rel = strip_root(rel, root.as_ref());
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dest.join(&rel);
        ensure_no_symlink_ancestors(dest, &out)?;

        let mut entry = zip.by_index(i)?;
        let mode = entry.unix_mode();
        if entry.is_dir() {
            std::fs::create_dir_all(&out)
                .with_context(|| format!("create_dir_all failed: {:?}", out))?;
        } else if mode.map(|m| m & 0o170000 == 0o120000).unwrap_or(false) {
            let mut target = String::new();
            entry.read_to_string(&mut target)?;
            create_parent(&out)?;
            std::os::unix::fs::symlink(&target, &out)
                .with_context(|| format!("symlink failed: {:?} -> {}", out, target))?;
        } else {
            create_parent(&out)?;
            let mut f = File::create(&out).with_context(|| format!("create failed: {:?}", out))?;
            std::io::copy(&mut entry, &mut f)
                .with_context(|| format!("write failed: {:?}", out))?;
            if let Some(m) = mode {
                std::fs::set_permissions(&out, std::fs::Permissions::from_mode(m & 0o7777))?;
            }
        }
        count += 1;
    }

    debug!(
        "[PHASE: installation] [STEP: extract] zip done (entries={}, root={:?})",
        count, root
    );
    Ok(ExtractSummary {
        entries: count,
        stripped_root: root.map(|r| r.to_string_lossy().into_owned()),
    })
}

fn open_tar_gz(archive: &Path) -> Result<tar::Archive<GzDecoder<File>>> {
    let file = File::open(archive).with_context(|| format!("open failed: {:?}", archive))?;
    Ok(tar::Archive::new(GzDecoder::new(file)))
}

fn is_payload(kind: tar::EntryType) -> bool {
    kind.is_file() || kind.is_dir() || kind.is_symlink() || kind.is_hard_link()
}

fn extract_tar_gz(
    archive: &Path,
    dest: &Path,
    stop: &dyn Fn() -> Result<()>,
) -> Result<ExtractSummary> {
    // Pass 1: listing only, to find a shared top-level directory.
    let mut listing = Vec::new();
    let mut ar = open_tar_gz(archive)?;
    for entry in ar.entries().context("Not a valid tar.gz archive")? {
        let entry = entry.context("Corrupt tar entry")?;
        let kind = entry.header().entry_type();
        if !is_payload(kind) {
            continue;
        }
        listing.push((sanitize(&entry.path()?)?, kind.is_dir()));
    }
    let root = common_root(&listing);

    // Pass 2: unpack.
    let mut ar = open_tar_gz(archive)?;
    ar.set_preserve_permissions(true);
    ar.set_overwrite(true);
    let mut count = 0usize;
    for entry in ar.entries().context("Not a valid tar.gz archive")? {
        stop()?;
        let mut entry = entry.context("Corrupt tar entry")?;
        let kind = entry.header().entry_type();
        if !is_payload(kind) {
            continue;
        }
        let rel = strip_root(&sanitize(&entry.path()?)?, root.as_ref());
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dest.join(&rel);
        ensure_no_symlink_ancestors(dest, &out)?;
        create_parent(&out)?;

        if kind.is_hard_link() {
            let link = entry
                .link_name()?
                .ok_or_else(|| anyhow::anyhow!("Hard link {:?} has no target", rel))?;
            let target = dest.join(strip_root(&sanitize(&link)?, root.as_ref()));
            std::fs::hard_link(&target, &out)
                .with_context(|| format!("hard_link failed: {:?} -> {:?}", out, target))?;
        } else {
            entry
                .unpack(&out)
                .with_context(|| format!("unpack failed: {:?}", out))?;
        }
        count += 1;
    }

    debug!(
        "[PHASE: installation] [STEP: extract] tar.gz done (entries={}, root={:?})",
        count, root
    );
    Ok(ExtractSummary {
        entries: count,
        stripped_root: root.map(|r| r.to_string_lossy().into_owned()),
    })
}
