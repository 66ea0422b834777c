// Install path resolution (PATH_PENDING)
//
// Loop until a valid path is chosen or the user backs out:
// - a caller-supplied path skips the "Choose installation path" question, but goes
//   through the same validation and emptiness check; if invalid, we warn and fall back
//   to asking
// - an emptied answer silently asks again; an invalid path warns and asks again with
//   the same default
// - a path recorded for another framework, or nested with one, is invalid; so is a path
//   nested with this framework's own tracked install
// - a non-empty directory needs explicit confirmation unless it is this framework's
//   own tracked install (reinstall in place)

use log::{info, warn};
use std::path::{Path, PathBuf};

use super::session::Flow;
use crate::error::InstallError;
use crate::models::record::InstallRecord;
use crate::prompt::{answer_is, Prompt, Prompter, Reply};
use crate::utils::{path_resolver, validation};

const INSTALL_THERE_TOKENS: &[&str] = &["i", "install", "y", "yes"];

#[derive(Debug, Clone)]
pub struct PathRequest {
    pub default_path: PathBuf,
    pub custom: Option<String>,
    /// Install path currently tracked for this framework, if any.
    pub own_install: Option<PathBuf>,
    /// Records of every other framework.
    pub others: Vec<InstallRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: PathBuf,
    /// True when the directory has content that will be replaced on commit.
    pub replaces_content: bool,
}

fn check_candidate(
    path: &Path,
    own: Option<&Path>,
    others: &[InstallRecord],
) -> Result<(), InstallError> {
    let shown = path.display().to_string();
    validation::validate_install_path(path)
        .map_err(|e| InstallError::invalid_path(shown.clone(), e.to_string()))?;

    if let Some(own) = own {
        if own != path && path_resolver::paths_overlap(path, own) {
            return Err(InstallError::invalid_path(
                shown,
                format!("it overlaps the current installation in {}", own.display()),
            ));
        }
    }

    for other in others {
        if other.install_path == path {
            return Err(InstallError::invalid_path(
                shown,
                format!("it is already the installation path of {}", other.framework_id),
            ));
        }
        if path_resolver::paths_overlap(path, &other.install_path) {
            return Err(InstallError::invalid_path(
                shown,
                format!("it overlaps the installation of {}", other.framework_id),
            ));
        }
    }
    Ok(())
}

/// Resolve the install path. Filesystem errors abort; user-input errors re-prompt.
pub async fn resolve_install_path(
    prompter: &dyn Prompter,
    mut req: PathRequest,
) -> Result<Flow<ResolvedPath>, InstallError> {
    loop {
        let raw = match req.custom.take() {
            Some(custom) => {
                info!(
                    "[PHASE: install] [STEP: path] Using caller-supplied path {:?}",
                    custom
                );
                custom
            }
            None => {
                let reply = prompter
                    .ask(&Prompt::install_path(&req.default_path))
                    .await
                    .map_err(InstallError::State)?;
                match reply {
                    Reply::Answer(a) => a,
                    Reply::Cancelled => return Ok(Flow::Declined),
                    Reply::Interrupted => return Ok(Flow::Interrupted),
                }
            }
        };

        if raw.trim().is_empty() {
            continue;
        }

        let path = match path_resolver::resolve_user_path(&raw) {
            Ok(p) => p,
            Err(e) => {
                let err = InstallError::invalid_path(raw.trim(), format!("{:#}", e));
                warn!("[PHASE: install] [STEP: path] {}", err);
                prompter.warn(&err.to_string());
                continue;
            }
        };

        match check_candidate(&path, req.own_install.as_deref(), &req.others) {
            Ok(()) => {}
            Err(err) if err.is_recoverable_input() => {
                warn!("[PHASE: install] [STEP: path] {}", err);
                prompter.warn(&err.to_string());
                continue;
            }
            Err(err) => return Err(err),
        }

        if req.own_install.as_deref() == Some(path.as_path()) {
            info!(
                "[PHASE: install] [STEP: path] {:?} is this framework's own install; it will be replaced",
                path
            );
            return Ok(Flow::Proceed(ResolvedPath {
                path,
                replaces_content: true,
            }));
        }

        let empty = path_resolver::is_dir_empty(&path)
            .await
            .map_err(InstallError::Filesystem)?;
        if empty {
            return Ok(Flow::Proceed(ResolvedPath {
                path,
                replaces_content: false,
            }));
        }

        let reply = prompter
            .ask(&Prompt::non_empty_directory(&path))
            .await
            .map_err(InstallError::State)?;
        return Ok(match reply {
            Reply::Answer(a) if answer_is(&a, INSTALL_THERE_TOKENS) => {
                info!(
                    "[PHASE: install] [STEP: path] Confirmed replacing the content of {:?}",
                    path
                );
                Flow::Proceed(ResolvedPath {
                    path,
                    replaces_content: true,
                })
            }
            Reply::Answer(_) | Reply::Cancelled => Flow::Declined,
            Reply::Interrupted => Flow::Interrupted,
        });
    }
}
