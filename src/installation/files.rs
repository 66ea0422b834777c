//! File helpers for the install pipeline.
//!
//! Goals:
//! - Async I/O only (tokio)
//! - Retry transient errors (busy files, slow network filesystems)
//! - Timeout every operation
//! - Removal helpers are idempotent: a missing target is success
//! - Never fail silently (log with context)

use anyhow::{Context, Result};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use crate::security::crypto;

const FS_OP_TIMEOUT: Duration = Duration::from_secs(60);
const FS_ATTEMPTS: u32 = 3;

fn is_transient_fs_error(e: &anyhow::Error) -> bool {
    let msg = format!("{:#}", e).to_ascii_lowercase();
    msg.contains("in use")
        || msg.contains("resource busy")
        || msg.contains("temporarily")
        || msg.contains("temporary")
        || msg.contains("interrupted system call")
        || msg.contains("timed out")
        || msg.contains("timeout")
}

fn is_not_found(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
}

/// Run one filesystem operation with timeout + retries on transient errors.
///
/// Backoff doubles from 200ms.
async fn with_fs_retries<T, F, Fut>(label: &str, op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 1..=FS_ATTEMPTS {
        match timeout(FS_OP_TIMEOUT, f()).await {
            Ok(Ok(v)) => {
                debug!(
                    "[PHASE: installation] [STEP: files] {} ok (label={}, attempt={}, duration_ms={})",
                    op,
                    label,
                    attempt,
                    started.elapsed().as_millis()
                );
                return Ok(v);
            }
            Ok(Err(e)) => {
                let transient = is_transient_fs_error(&e);
                warn!(
                    "[PHASE: installation] [STEP: files] {} failed (label={}, attempt={}, transient={}, err={:#})",
                    op, label, attempt, transient, e
                );
                last_err = Some(e);
                if !transient {
                    break;
                }
            }
            Err(_) => {
                warn!(
                    "[PHASE: installation] [STEP: files] {} timeout (label={}, attempt={}, timeout_s={})",
                    op,
                    label,
                    attempt,
                    FS_OP_TIMEOUT.as_secs()
                );
                last_err = Some(anyhow::anyhow!(
                    "{} timed out after {}s",
                    op,
                    FS_OP_TIMEOUT.as_secs()
                ));
            }
        }

        if attempt < FS_ATTEMPTS {
            let backoff_ms = 200_u64.saturating_mul(1_u64 << ((attempt - 1) as u32));
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} failed", op)))
}

/// Create `path` and any missing parents.
///
/// Returns the top-most directory that did not exist before the call, so a caller can
/// undo exactly what it created. `None` when `path` already existed.
pub async fn create_dir_all_tracked(path: &Path, label: &str) -> Result<Option<PathBuf>> {
    let mut first_missing: Option<PathBuf> = None;
    for ancestor in path.ancestors() {
        match tokio::fs::metadata(ancestor).await {
            Ok(_) => break,
            Err(e) if is_not_found(&e) => first_missing = Some(ancestor.to_path_buf()),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("stat failed: {:?}", ancestor)))
            }
        }
    }

    if first_missing.is_none() {
        return Ok(None);
    }

    with_fs_retries(label, "create_dir_all", || async move {
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("create_dir_all failed: {:?}", path))
    })
    .await?;

    Ok(first_missing)
}

/// Remove a directory tree. Missing is fine.
pub async fn remove_dir_all_idempotent(path: &Path, label: &str) -> Result<()> {
    with_fs_retries(label, "remove_dir_all", || async move {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("remove_dir_all failed: {:?}", path))),
        }
    })
    .await
}

/// Remove a single file. Missing is fine.
pub async fn remove_file_idempotent(path: &Path, label: &str) -> Result<()> {
    with_fs_retries(label, "remove_file", || async move {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("remove_file failed: {:?}", path))),
        }
    })
    .await
}

/// Remove whatever is at `path` (file, symlink or directory tree). Missing is fine.
///
/// Symlinks are removed themselves, never followed.
pub async fn remove_path_idempotent(path: &Path, label: &str) -> Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => remove_dir_all_idempotent(path, label).await,
        Ok(_) => remove_file_idempotent(path, label).await,
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(anyhow::Error::new(e).context(format!("stat failed: {:?}", path))),
    }
}

/// Entries directly inside `dir`, sorted by name.
pub async fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut rd = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("read_dir failed: {:?}", dir))?;
    let mut entries = Vec::new();
    while let Some(entry) = rd
        .next_entry()
        .await
        .with_context(|| format!("read_dir failed: {:?}", dir))?
    {
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

/// Empty `dir` without removing it (it may be a mount point or a symlink target).
pub async fn clear_dir(dir: &Path, label: &str) -> Result<()> {
    for entry in list_dir(dir).await? {
        remove_path_idempotent(&entry, label).await?;
    }
    Ok(())
}

/// Rename `src` to `dst` (same filesystem).
pub async fn rename_with_retries(src: &Path, dst: &Path, label: &str) -> Result<()> {
    with_fs_retries(label, "rename", || async move {
        tokio::fs::rename(src, dst)
            .await
            .with_context(|| format!("rename failed: {:?} -> {:?}", src, dst))
    })
    .await
}

/// Write `bytes` to `path` via a temp sibling + rename, so readers never see a torn file.
pub async fn write_file_atomic(path: &Path, bytes: &[u8], label: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("{:?} has no parent directory", path))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create_dir_all failed: {:?}", parent))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("{:?} has no file name", path))?
        .to_string_lossy();
    let tmp = parent.join(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4()));
    let tmp_path = tmp.as_path();

    let write_res = with_fs_retries(label, "write_tmp", || async move {
        let mut f = tokio::fs::File::create(tmp_path)
            .await
            .with_context(|| format!("create failed: {:?}", tmp_path))?;
        f.write_all(bytes).await?;
        f.flush().await?;
        f.sync_all().await?;
        Ok(())
    })
    .await;

    let res = match write_res {
        Ok(()) => rename_with_retries(&tmp, path, label).await,
        Err(e) => Err(e),
    };
    if res.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    res
}

/// Copy one file with retries + timeout, returning `(bytes_written, sha256_hex)`.
///
/// - Hash is computed over the bytes copied (source contents).
/// - Caller must create parent directory.
pub async fn copy_file_with_retries_and_sha256(
    src: &Path,
    dst: &Path,
    label: &str,
) -> Result<(u64, String)> {
    let started = Instant::now();
    debug!(
        "[PHASE: installation] [STEP: files] copy_file_with_retries_and_sha256 entered (label={}, src={:?}, dst={:?})",
        label, src, dst
    );

    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=FS_ATTEMPTS {
        let timeout_dur = match tokio::fs::metadata(src).await {
            Ok(m) => {
                // Dynamic timeout: base 60s + 1s per MiB, capped at 10 minutes.
                let mib = (m.len() / (1024 * 1024)).min(10_000);
                let secs = (60_u64).saturating_add(mib).min(600);
                Duration::from_secs(secs)
            }
            Err(_) => FS_OP_TIMEOUT,
        };

        match timeout(timeout_dur, copy_file_once_and_sha256(src, dst)).await {
            Ok(Ok((n, sha))) => {
                debug!(
                    "[PHASE: installation] [STEP: files] copy_file_with_retries_and_sha256 exit ok (label={}, bytes={}, sha256={}, attempt={}, duration_ms={})",
                    label,
                    n,
                    sha,
                    attempt,
                    started.elapsed().as_millis()
                );
                return Ok((n, sha));
            }
            Ok(Err(e)) => {
                let transient = is_transient_fs_error(&e);
                warn!(
                    "[PHASE: installation] [STEP: files] copy+sha failed (label={}, attempt={}, transient={}, src={:?}, dst={:?}, err={:#})",
                    label, attempt, transient, src, dst, e
                );
                last_err = Some(e);
                if !transient {
                    break;
                }
            }
            Err(_) => {
                warn!(
                    "[PHASE: installation] [STEP: files] copy+sha timeout (label={}, attempt={}, timeout_ms={})",
                    label,
                    attempt,
                    timeout_dur.as_millis()
                );
                last_err = Some(anyhow::anyhow!(
                    "copy+sha timed out (timeout_ms={})",
                    timeout_dur.as_millis()
                ));
            }
        }

        let backoff_ms = 200_u64.saturating_mul(1_u64 << ((attempt - 1) as u32));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("copy+sha failed")))
}

async fn copy_file_once_and_sha256(src: &Path, dst: &Path) -> Result<(u64, String)> {
    let mut src_f = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("open src failed: {:?}", src))?;
    let mut dst_f = tokio::fs::File::create(dst)
        .await
        .with_context(|| format!("create dst failed: {:?}", dst))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total: u64 = 0;

    loop {
        let n = src_f.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        dst_f.write_all(&buf[..n]).await?;
        total = total.saturating_add(n as u64);
    }
    dst_f.flush().await?;

    Ok((total, crypto::finalize_hex(hasher)))
}

/// True when `path` exists and is a regular file with an exec bit set.
pub async fn is_executable_file(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o111 != 0
        }
        _ => false,
    }
}
