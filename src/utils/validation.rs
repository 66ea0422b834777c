// Input validation utilities

use anyhow::Result;
use regex::Regex;
use std::path::Path;

use super::path_resolver::is_writable;

const MAX_PATH_BYTES: usize = 4096;
const MAX_COMPONENT_BYTES: usize = 255;

/// Validate a catalog identifier (category or framework id).
///
/// Ids end up in file names (`<id>.desktop`, `<id>.lock`), so only a conservative
/// lowercase charset is allowed.
pub fn validate_identifier(id: &str) -> Result<()> {
    let s = id.trim();
    if s.is_empty() {
        return Err(anyhow::anyhow!("Identifier is required"));
    }

    let ident_re = Regex::new(r"^[a-z0-9][a-z0-9._-]*$").map_err(|e| {
        anyhow::anyhow!("Internal error: failed to compile identifier regex: {}", e)
    })?;
    if !ident_re.is_match(s) || s.contains("..") {
        return Err(anyhow::anyhow!("Identifier contains invalid characters: '{}'", s));
    }

    Ok(())
}

/// Validate an absolute, normalized install path.
///
/// Returns the reason as the error message; callers turn it into a re-prompt.
pub fn validate_install_path(path: &Path) -> Result<()> {
    let s = path.to_string_lossy();
    if s.trim().is_empty() {
        return Err(anyhow::anyhow!("path is empty"));
    }

    if s.chars().any(|c| c.is_control()) {
        return Err(anyhow::anyhow!("path contains control characters"));
    }

    if !path.is_absolute() {
        return Err(anyhow::anyhow!("path isn't absolute"));
    }

    if path.parent().is_none() {
        return Err(anyhow::anyhow!("the filesystem root can't be used"));
    }

    if let Some(home) = dirs::home_dir() {
        if path == home {
            return Err(anyhow::anyhow!("the home directory can't be used"));
        }
    }

    if s.len() > MAX_PATH_BYTES {
        return Err(anyhow::anyhow!(
            "path cannot exceed {} bytes",
            MAX_PATH_BYTES
        ));
    }

    if path
        .components()
        .any(|c| c.as_os_str().len() > MAX_COMPONENT_BYTES)
    {
        return Err(anyhow::anyhow!(
            "a path component exceeds {} bytes",
            MAX_COMPONENT_BYTES
        ));
    }

    // The target itself may be a directory or missing; anything else can't hold an install.
    match std::fs::metadata(path) {
        Ok(meta) if !meta.is_dir() => {
            return Err(anyhow::anyhow!("it exists and isn't a directory"));
        }
        Ok(_) if !is_writable(path) => {
            return Err(anyhow::anyhow!("you don't have write access to it"));
        }
        Ok(_) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(anyhow::anyhow!("it can't be inspected: {}", e)),
    }

    // Nearest existing ancestor must be a directory we can create children in.
    for ancestor in path.ancestors().skip(1) {
        match std::fs::metadata(ancestor) {
            Ok(meta) if meta.is_dir() => {
                if !is_writable(ancestor) {
                    return Err(anyhow::anyhow!(
                        "you don't have write access to {}",
                        ancestor.display()
                    ));
                }
                return Ok(());
            }
            Ok(_) => {
                return Err(anyhow::anyhow!(
                    "{} exists and isn't a directory",
                    ancestor.display()
                ))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "{} can't be inspected: {}",
                    ancestor.display(),
                    e
                ))
            }
        }
    }

    Ok(())
}
