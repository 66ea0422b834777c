use anyhow::{Context, Result};
use nix::unistd::{access, AccessFlags};
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

/// Expand a leading `~` / `~/` to the home directory.
pub fn expand_user(raw: &str) -> PathBuf {
    if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Make `path` absolute against the current directory and fold `.`/`..` lexically.
///
/// Symlinks are not resolved: the path may not exist yet.
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("Failed to read current directory")?
            .join(path)
    };

    let mut out = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping past the root stays at the root.
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// User-typed path -> absolute path (`~` expansion, cwd-relative, normalized).
pub fn resolve_user_path(raw: &str) -> Result<PathBuf> {
    absolutize(&expand_user(raw.trim()))
}

/// Render a catalog install-path template such as `{tools_root}/android/android-studio`.
pub fn render_template(template: &str, tools_root: &Path) -> Result<PathBuf> {
    let rendered = template.replace("{tools_root}", &tools_root.to_string_lossy());
    resolve_user_path(&rendered)
}

/// Resolve log folder (absolute path), creating it when missing.
pub fn resolve_log_folder(configured: &Path) -> Result<PathBuf> {
    let log_dir = absolutize(configured)?;
    std::fs::create_dir_all(&log_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create log folder {:?}: {}", log_dir, e))?;
    Ok(log_dir)
}

/// True when `path` is a directory without any entry. Missing paths count as empty.
pub async fn is_dir_empty(path: &Path) -> Result<bool> {
    match tokio::fs::read_dir(path).await {
        Ok(mut rd) => Ok(rd
            .next_entry()
            .await
            .with_context(|| format!("Failed to list {:?}", path))?
            .is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(anyhow::anyhow!("Failed to open {:?}: {}", path, e)),
    }
}

fn sibling_with_suffix(target: &Path, tag: &str, session: &str) -> Result<PathBuf> {
    let parent = target
        .parent()
        .ok_or_else(|| anyhow::anyhow!("{:?} has no parent directory", target))?;
    let name = target
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("{:?} has no final component", target))?
        .to_string_lossy();
    Ok(parent.join(format!(".{}.dtc-{}-{}", name, tag, session)))
}

/// Hidden sibling directory the payload is unpacked into before it is moved in place.
///
/// Same parent as the target so the final move is a rename on one filesystem.
pub fn staging_dir_for(target: &Path, session: &str) -> Result<PathBuf> {
    sibling_with_suffix(target, "staging", session)
}

/// Hidden sibling the previous contents of `target` are parked in until commit.
pub fn backup_dir_for(target: &Path, session: &str) -> Result<PathBuf> {
    sibling_with_suffix(target, "backup", session)
}

/// Hidden directory inside `target` the payload is unpacked into when the target
/// itself has to stay in place.
pub fn inner_staging_dir(target: &Path, session: &str) -> PathBuf {
    target.join(format!(".dtc-staging-{}", session))
}

/// Hidden directory inside `dir` its previous entries are parked in until commit.
pub fn inner_backup_dir(dir: &Path, session: &str) -> PathBuf {
    dir.join(format!(".dtc-backup-{}", session))
}

/// How a payload reaches its install directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Unpack next to the target, then swap whole directories by rename.
    Sibling,
    /// Unpack inside the target and move entries; the directory itself never moves.
    InPlace,
}

/// True when we may create and delete entries in `dir`.
pub fn is_writable(dir: &Path) -> bool {
    access(dir, AccessFlags::W_OK).is_ok()
}

/// True when `path` is the root of a mounted filesystem.
pub fn is_mount_point(path: &Path) -> bool {
    let Some(parent) = path.parent() else {
        return true;
    };
    match (std::fs::symlink_metadata(path), std::fs::metadata(parent)) {
        (Ok(own), Ok(up)) => own.dev() != up.dev() || own.ino() == up.ino(),
        _ => false,
    }
}

/// Pick the placement for `target`.
///
/// A renamed symlink would leave its destination untouched, a mount point can't be
/// renamed, and renaming needs a writable parent: those targets are filled in place.
pub fn placement_for(target: &Path) -> Result<Placement> {
    let meta = match std::fs::symlink_metadata(target) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Placement::Sibling),
        Err(e) => return Err(anyhow::Error::new(e).context(format!("stat failed: {:?}", target))),
    };
    if meta.file_type().is_symlink() || is_mount_point(target) {
        return Ok(Placement::InPlace);
    }
    match target.parent() {
        Some(parent) if is_writable(parent) => Ok(Placement::Sibling),
        _ => Ok(Placement::InPlace),
    }
}

/// True when `a` and `b` are the same path or one contains the other.
pub fn paths_overlap(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}
