// Error taxonomy for the installer core.
//
// User-input errors (InvalidPath) re-prompt. System/IO errors abort the session and
// roll back whatever the session already changed on disk.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{path} isn't a valid installation path: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("{0}")]
    UserDeclined(String),

    #[error("Installation interrupted")]
    Interrupted,

    #[error("Download failed: {0:#}")]
    Fetch(anyhow::Error),

    #[error("Extraction failed: {0:#}")]
    Extraction(anyhow::Error),

    #[error("Launcher registration failed: {0:#}")]
    LauncherRegistration(anyhow::Error),

    #[error("Filesystem operation failed: {0:#}")]
    Filesystem(anyhow::Error),

    #[error("Installed state error: {0:#}")]
    State(anyhow::Error),

    #[error("Another session is already installing or removing {0}")]
    Locked(String),

    #[error("No category named '{0}'")]
    UnknownCategory(String),

    #[error("No framework named '{framework}' in category '{category}'")]
    UnknownFramework { category: String, framework: String },

    #[error("{0} isn't installed")]
    NotInstalled(String),
}

impl InstallError {
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        InstallError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that are answered by asking again instead of aborting.
    pub fn is_recoverable_input(&self) -> bool {
        matches!(self, InstallError::InvalidPath { .. })
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("No process matching {signature:?} appeared within {}s", waited.as_secs())]
    ProcessNotFound {
        signature: Vec<String>,
        waited: Duration,
    },

    #[error("Process {pid} didn't exit within {}s", waited.as_secs())]
    Timeout { pid: u32, waited: Duration },

    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
