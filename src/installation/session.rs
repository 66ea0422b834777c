//! Install session: state, transition rules, and the compensation journal.
//!
//! Every forward step that changes something outside the session pushes its undo
//! onto the journal. Aborting unwinds the journal in reverse, so exactly the completed
//! prefix is undone. Undo actions tolerate their target already being gone.

use log::{error, info, warn};
use std::fmt;
use std::path::PathBuf;

use super::files;
use super::launcher::{LauncherRegistrar, LauncherSpec};
use crate::error::InstallError;
use crate::models::record::InstallRecord;
use crate::models::state::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Start,
    AlreadyInstalled,
    ReinstallConfirm,
    PathPending,
    LicensePending,
    Downloading,
    Extracting,
    Registering,
    Done,
    Aborted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Start => "START",
            SessionState::AlreadyInstalled => "ALREADY_INSTALLED",
            SessionState::ReinstallConfirm => "REINSTALL_CONFIRM",
            SessionState::PathPending => "PATH_PENDING",
            SessionState::LicensePending => "LICENSE_PENDING",
            SessionState::Downloading => "DOWNLOADING",
            SessionState::Extracting => "EXTRACTING",
            SessionState::Registering => "REGISTERING",
            SessionState::Done => "DONE",
            SessionState::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Aborted)
    }

    /// Human label of the step, for "<step> failed" messages.
    pub fn step_label(&self) -> &'static str {
        match self {
            SessionState::Start => "Preparation",
            SessionState::AlreadyInstalled | SessionState::ReinstallConfirm => "Reinstall check",
            SessionState::PathPending => "Installation path selection",
            SessionState::LicensePending => "License agreement",
            SessionState::Downloading => "Download",
            SessionState::Extracting => "Extraction",
            SessionState::Registering => "Launcher registration",
            SessionState::Done | SessionState::Aborted => "Finalization",
        }
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        if next == Aborted {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Start, PathPending)
                | (Start, AlreadyInstalled)
                | (AlreadyInstalled, ReinstallConfirm)
                | (ReinstallConfirm, PathPending)
                | (PathPending, LicensePending)
                | (PathPending, Downloading)
                | (LicensePending, Downloading)
                | (Downloading, Extracting)
                | (Extracting, Registering)
                | (Registering, Done)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one interactive step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow<T> {
    Proceed(T),
    Declined,
    Interrupted,
}

#[derive(Debug)]
pub enum AbortReason {
    Declined,
    Interrupted,
    Failed(InstallError),
}

#[derive(Debug)]
pub enum SessionOutcome {
    Done(InstallRecord),
    Aborted { at: SessionState, reason: AbortReason },
}

impl SessionOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, SessionOutcome::Done(_))
    }
}

// ============================================================================
// Compensation journal
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    RemoveDir(PathBuf),
    RemoveFile(PathBuf),
    /// A file, link or directory moved into an install directory.
    RemoveEntry(PathBuf),
    /// Move `parked` (a directory or a single entry) back to `original`, replacing
    /// whatever is there.
    RestoreDir { parked: PathBuf, original: PathBuf },
    UnregisterLauncher(String),
    ReregisterLauncher(LauncherSpec),
    RestoreRecord(InstallRecord),
}

impl Compensation {
    fn describe(&self) -> String {
        match self {
            Compensation::RemoveDir(p) => format!("remove directory {:?}", p),
            Compensation::RemoveFile(p) => format!("remove file {:?}", p),
            Compensation::RemoveEntry(p) => format!("remove {:?}", p),
            Compensation::RestoreDir { parked, original } => {
                format!("restore {:?} from {:?}", original, parked)
            }
            Compensation::UnregisterLauncher(id) => format!("unregister launcher {}", id),
            Compensation::ReregisterLauncher(spec) => format!("re-register launcher {}", spec.id),
            Compensation::RestoreRecord(r) => format!("restore record of {}", r.framework_id),
        }
    }

    async fn apply(
        &self,
        registrar: &dyn LauncherRegistrar,
        store: &dyn StateStore,
    ) -> anyhow::Result<()> {
        match self {
            Compensation::RemoveDir(p) => files::remove_dir_all_idempotent(p, "rollback").await,
            Compensation::RemoveFile(p) => files::remove_file_idempotent(p, "rollback").await,
            Compensation::RemoveEntry(p) => files::remove_path_idempotent(p, "rollback").await,
            Compensation::RestoreDir { parked, original } => {
                if tokio::fs::symlink_metadata(parked).await.is_err() {
                    return Ok(());
                }
                files::remove_path_idempotent(original, "rollback").await?;
                files::rename_with_retries(parked, original, "rollback").await
            }
            Compensation::UnregisterLauncher(id) => registrar.unregister(id).await,
            Compensation::ReregisterLauncher(spec) => registrar.register(spec).await.map(|_| ()),
            Compensation::RestoreRecord(r) => store.put(r.clone()).await,
        }
    }
}

#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<(SessionState, Compensation)>,
    delete_on_commit: Vec<PathBuf>,
}

impl Journal {
    pub fn push(&mut self, step: SessionState, undo: Compensation) {
        info!(
            "[PHASE: install] [STEP: journal] {} recorded undo: {}",
            step,
            undo.describe()
        );
        self.entries.push((step, undo));
    }

    /// A directory that only exists to make rollback possible; deleted after commit.
    pub fn delete_on_commit(&mut self, path: PathBuf) {
        self.delete_on_commit.push(path);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Undo everything in reverse order. Keeps going past failures and returns them.
    pub async fn rollback(
        &mut self,
        registrar: &dyn LauncherRegistrar,
        store: &dyn StateStore,
    ) -> Vec<String> {
        let mut failures = Vec::new();
        while let Some((step, undo)) = self.entries.pop() {
            match undo.apply(registrar, store).await {
                Ok(()) => info!(
                    "[PHASE: install] [STEP: rollback] Undid {} ({})",
                    undo.describe(),
                    step
                ),
                Err(e) => {
                    error!(
                        "[PHASE: install] [STEP: rollback] Failed to {} ({}): {:#}",
                        undo.describe(),
                        step,
                        e
                    );
                    failures.push(format!("{}: {:#}", undo.describe(), e));
                }
            }
        }
        // Parked directories were restored by RestoreDir entries above.
        self.delete_on_commit.clear();
        failures
    }

    /// The session reached DONE: drop the undo log and delete parked leftovers.
    pub async fn commit(&mut self) {
        self.entries.clear();
        for p in self.delete_on_commit.drain(..) {
            if let Err(e) = files::remove_dir_all_idempotent(&p, "commit_cleanup").await {
                warn!(
                    "[PHASE: install] [STEP: commit] Failed to delete {:?}: {:#}",
                    p, e
                );
            }
        }
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug)]
pub struct InstallSession {
    pub id: String,
    pub framework_id: String,
    pub chosen_path: Option<PathBuf>,
    pub license_accepted: bool,
    state: SessionState,
    history: Vec<SessionState>,
    pub journal: Journal,
}

impl InstallSession {
    pub fn new(framework_id: impl Into<String>) -> Self {
        InstallSession {
            id: uuid::Uuid::new_v4().simple().to_string(),
            framework_id: framework_id.into(),
            chosen_path: None,
            license_accepted: false,
            state: SessionState::Start,
            history: vec![SessionState::Start],
            journal: Journal::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// States visited so far, in order.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), InstallError> {
        if !self.state.can_transition_to(next) {
            error!(
                "[PHASE: install] [STEP: transition] Illegal transition {} -> {} (framework={})",
                self.state, next, self.framework_id
            );
            return Err(InstallError::State(anyhow::anyhow!(
                "illegal transition {} -> {}",
                self.state,
                next
            )));
        }
        info!(
            "[PHASE: install] [STEP: transition] {} -> {} (framework={}, session={})",
            self.state, next, self.framework_id, self.id
        );
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installation::launcher::DesktopLauncherRegistrar;
    use crate::models::state::MemoryStateStore;

    #[test]
    fn happy_path_and_reinstall_branch_are_legal() {
        let mut s = InstallSession::new("android-studio");
        for next in [
            SessionState::AlreadyInstalled,
            SessionState::ReinstallConfirm,
            SessionState::PathPending,
            SessionState::LicensePending,
            SessionState::Downloading,
            SessionState::Extracting,
            SessionState::Registering,
            SessionState::Done,
        ] {
            s.transition(next).unwrap();
        }
        assert_eq!(s.history().len(), 9);
        assert!(s.state().is_terminal());
    }

    #[test]
    fn skipping_steps_and_leaving_terminal_states_is_refused() {
        let mut s = InstallSession::new("x");
        assert!(s.transition(SessionState::Downloading).is_err());
        s.transition(SessionState::Aborted).unwrap();
        assert!(s.transition(SessionState::PathPending).is_err());
        assert!(s.transition(SessionState::Aborted).is_err());
        assert!(!SessionState::Done.can_transition_to(SessionState::Aborted));
    }

    #[test]
    fn license_step_is_optional() {
        assert!(SessionState::PathPending.can_transition_to(SessionState::Downloading));
        assert!(!SessionState::Start.can_transition_to(SessionState::LicensePending));
    }

    #[tokio::test]
    async fn rollback_runs_in_reverse_and_tolerates_missing_targets() {
        let tmp = tempfile::tempdir().unwrap();
        let registrar =
            DesktopLauncherRegistrar::new(tmp.path().join("apps"), tmp.path().join("fav.json"), false);
        let store = MemoryStateStore::new();

        let original = tmp.path().join("target");
        let parked = tmp.path().join(".target.parked");
        std::fs::create_dir_all(&parked).unwrap();
        std::fs::write(parked.join("old.txt"), b"old").unwrap();
        // Forward: new content was moved into place after the old one was parked.
        std::fs::create_dir_all(&original).unwrap();
        std::fs::write(original.join("new.txt"), b"new").unwrap();

        let mut j = Journal::default();
        j.push(
            SessionState::Registering,
            Compensation::RestoreDir {
                parked: parked.clone(),
                original: original.clone(),
            },
        );
        j.push(SessionState::Registering, Compensation::RemoveDir(original.clone()));
        j.push(
            SessionState::Downloading,
            Compensation::RemoveFile(tmp.path().join("never-created.zip")),
        );
        j.push(
            SessionState::Registering,
            Compensation::UnregisterLauncher("nothing.desktop".into()),
        );

        let failures = j.rollback(&registrar, &store).await;
        assert!(failures.is_empty(), "{:?}", failures);
        assert!(j.is_empty());
        assert!(original.join("old.txt").is_file(), "old content restored");
        assert!(!original.join("new.txt").exists());
        assert!(!parked.exists());
    }

    #[tokio::test]
    async fn entry_level_undo_restores_files_inside_a_kept_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let registrar =
            DesktopLauncherRegistrar::new(tmp.path().join("apps"), tmp.path().join("fav.json"), false);
        let store = MemoryStateStore::new();

        let dir = tmp.path().join("target");
        let backup = dir.join(".dtc-backup-s1");
        std::fs::create_dir_all(&backup).unwrap();
        std::fs::write(backup.join("notes.txt"), b"old").unwrap();
        std::fs::write(dir.join("notes.txt"), b"new").unwrap();
        std::fs::create_dir_all(dir.join("bin")).unwrap();

        let mut j = Journal::default();
        j.push(SessionState::Registering, Compensation::RemoveDir(backup.clone()));
        j.push(
            SessionState::Registering,
            Compensation::RestoreDir {
                parked: backup.join("notes.txt"),
                original: dir.join("notes.txt"),
            },
        );
        j.push(SessionState::Registering, Compensation::RemoveEntry(dir.join("bin")));

        let failures = j.rollback(&registrar, &store).await;
        assert!(failures.is_empty(), "{:?}", failures);
        assert_eq!(std::fs::read(dir.join("notes.txt")).unwrap(), b"old");
        assert!(!dir.join("bin").exists());
        assert!(!backup.exists());
        assert!(dir.is_dir(), "the directory itself is kept");
    }

    #[tokio::test]
    async fn commit_deletes_parked_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let parked = tmp.path().join(".parked");
        std::fs::create_dir_all(parked.join("x")).unwrap();

        let mut j = Journal::default();
        j.push(SessionState::Registering, Compensation::RemoveDir(tmp.path().join("t")));
        j.delete_on_commit(parked.clone());
        j.commit().await;
        assert!(j.is_empty());
        assert!(!parked.exists());
    }
}
