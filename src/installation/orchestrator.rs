//! Install orchestrator: the per-framework state machine.
//!
//! ```text
//! START -> PATH_PENDING -> LICENSE_PENDING -> DOWNLOADING -> EXTRACTING -> REGISTERING -> DONE
//!   \-> ALREADY_INSTALLED -> REINSTALL_CONFIRM -> PATH_PENDING
//! any non-terminal state -> ABORTED
//! ```
//!
//! Nothing outside the session is touched before DOWNLOADING. From there every change
//! is journaled, and an abort unwinds the journal. The payload is unpacked into a
//! staging sibling of the target; the previous install (reinstall) and the existing
//! content of the target are only moved aside inside REGISTERING, and are restored if
//! anything after that fails. The InstallRecord is written last: it is the commit point.
//!
//! Targets that can't be renamed (symlinks, mount points, directories in a read-only
//! parent) are filled in place instead: staging and backup live inside the target and
//! entries are moved one by one.

use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::extract::Extractor;
use super::fetch::{FetchedArtifact, Fetcher};
use super::files;
use super::launcher::{LauncherRegistrar, LauncherSpec};
use super::lock::FrameworkLock;
use super::paths::{resolve_install_path, PathRequest, ResolvedPath};
use super::session::{AbortReason, Compensation, Flow, InstallSession, SessionOutcome, SessionState};
use crate::config::Settings;
use crate::error::InstallError;
use crate::licensing::{Consent, LicenseGate};
use crate::models::catalog::FrameworkDescriptor;
use crate::models::record::InstallRecord;
use crate::models::state::StateStore;
use crate::prompt::{answer_is, Prompt, Prompter, Reply};
use crate::utils::path_resolver::{self, Placement};

const REINSTALL_TOKENS: &[&str] = &["y", "yes"];

/// "<step> failed: <cause>", without repeating the step for errors that already name it.
fn failure_message(at: SessionState, err: &InstallError) -> String {
    match err {
        InstallError::Fetch(_)
        | InstallError::Extraction(_)
        | InstallError::LauncherRegistration(_) => err.to_string(),
        other => format!("{} failed: {}", at.step_label(), other),
    }
}

/// Unpacked payload waiting to be moved into the target.
struct Staged {
    dir: PathBuf,
    placement: Placement,
}

pub struct Orchestrator {
    settings: Settings,
    store: Arc<dyn StateStore>,
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn Extractor>,
    registrar: Arc<dyn LauncherRegistrar>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        store: Arc<dyn StateStore>,
        fetcher: Arc<dyn Fetcher>,
        extractor: Arc<dyn Extractor>,
        registrar: Arc<dyn LauncherRegistrar>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            store,
            fetcher,
            extractor,
            registrar,
            cancel,
        }
    }

    fn lock(&self, framework_id: &str) -> Result<FrameworkLock, InstallError> {
        FrameworkLock::try_acquire(&self.settings.lock_dir(), framework_id)
            .map_err(InstallError::Filesystem)?
            .ok_or_else(|| InstallError::Locked(framework_id.to_string()))
    }

    fn check_cancel(&self) -> Result<(), InstallError> {
        if self.cancel.is_cancelled() {
            return Err(InstallError::Interrupted);
        }
        Ok(())
    }

    /// Ask a question; a cancellation signal while waiting counts as Ctrl-C.
    async fn ask(&self, prompter: &dyn Prompter, prompt: &Prompt) -> Result<Reply, InstallError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(Reply::Interrupted),
            reply = prompter.ask(prompt) => reply.map_err(InstallError::State),
        }
    }

    /// True when the recorded install is still usable: directory, executable and a
    /// pinned launcher are all there.
    async fn is_complete(
        &self,
        framework: &FrameworkDescriptor,
        record: &InstallRecord,
    ) -> Result<bool, InstallError> {
        if !tokio::fs::metadata(&record.install_path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Ok(false);
        }
        if !files::is_executable_file(&framework.executable(&record.install_path)).await {
            return Ok(false);
        }
        self.registrar
            .is_registered(&record.launcher_id)
            .await
            .map_err(InstallError::LauncherRegistration)
    }

    // ========================================================================
    // install
    // ========================================================================

    /// Run one install session for `framework`.
    ///
    /// `Err` is only returned when the session could not start (lock held, lock file
    /// unusable). Everything else ends in a [`SessionOutcome`].
    pub async fn install(
        &self,
        prompter: &dyn Prompter,
        framework: &FrameworkDescriptor,
        custom_path: Option<String>,
    ) -> Result<SessionOutcome, InstallError> {
        let _lock = self.lock(&framework.id)?;
        let mut session = InstallSession::new(&framework.id);
        info!(
            "[PHASE: install] [STEP: start] Session {} for {} ({})",
            session.id, framework.id, framework.name
        );

        let result = self
            .drive(&mut session, prompter, framework, custom_path)
            .await;

        let reason = match result {
            Ok(Flow::Proceed(record)) => {
                session.journal.commit().await;
                prompter.say("Installation done");
                info!(
                    "[PHASE: install] [STEP: done] {} installed in {:?} (session={})",
                    record.framework_id, record.install_path, session.id
                );
                return Ok(SessionOutcome::Done(record));
            }
            Ok(Flow::Declined) => AbortReason::Declined,
            Ok(Flow::Interrupted) | Err(InstallError::Interrupted) => AbortReason::Interrupted,
            Err(e) => AbortReason::Failed(e),
        };

        let at = session.state();
        match &reason {
            AbortReason::Declined => {
                info!("[PHASE: install] [STEP: abort] Declined at {}", at)
            }
            AbortReason::Interrupted => {
                warn!("[PHASE: install] [STEP: abort] Interrupted at {}", at)
            }
            AbortReason::Failed(e) => {
                let message = failure_message(at, e);
                error!("[PHASE: install] [STEP: abort] {}", message);
                prompter.warn(&message);
            }
        }

        if !session.journal.is_empty() {
            info!(
                "[PHASE: install] [STEP: rollback] Undoing {} step(s)",
                session.journal.len()
            );
        }
        let failures = session
            .journal
            .rollback(self.registrar.as_ref(), self.store.as_ref())
            .await;
        for f in &failures {
            prompter.warn(&format!("Cleanup failed: {}", f));
        }
        if let Err(e) = session.transition(SessionState::Aborted) {
            error!("[PHASE: install] [STEP: abort] {}", e);
        }
        Ok(SessionOutcome::Aborted { at, reason })
    }

    async fn drive(
        &self,
        session: &mut InstallSession,
        prompter: &dyn Prompter,
        framework: &FrameworkDescriptor,
        custom_path: Option<String>,
    ) -> Result<Flow<InstallRecord>, InstallError> {
        // START
        let previous = self
            .store
            .get(&framework.id)
            .await
            .map_err(InstallError::State)?;

        if let Some(record) = &previous {
            if self.is_complete(framework, record).await? {
                session.transition(SessionState::AlreadyInstalled)?;
                info!(
                    "[PHASE: install] [STEP: reinstall] {} is installed in {:?}",
                    framework.id, record.install_path
                );
                session.transition(SessionState::ReinstallConfirm)?;
                match self.ask(prompter, &Prompt::reinstall(&framework.name)).await? {
                    Reply::Answer(a) if answer_is(&a, REINSTALL_TOKENS) => {
                        info!("[PHASE: install] [STEP: reinstall] Reinstall confirmed");
                    }
                    Reply::Answer(_) | Reply::Cancelled => return Ok(Flow::Declined),
                    Reply::Interrupted => return Ok(Flow::Interrupted),
                }
            } else {
                warn!(
                    "[PHASE: install] [STEP: start] Record of {} points to an incomplete install in {:?}; treating as not installed",
                    framework.id, record.install_path
                );
            }
        }

        // PATH_PENDING
        session.transition(SessionState::PathPending)?;
        let default_path = match &previous {
            Some(r) => r.install_path.clone(),
            None => framework
                .default_install_path(&self.settings.tools_root)
                .map_err(InstallError::State)?,
        };
        let others = self
            .store
            .list()
            .await
            .map_err(InstallError::State)?
            .into_iter()
            .filter(|r| r.framework_id != framework.id)
            .collect();
        let request = PathRequest {
            default_path,
            custom: custom_path,
            own_install: previous.as_ref().map(|r| r.install_path.clone()),
            others,
        };
        let resolved = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Flow::Interrupted,
            r = resolve_install_path(prompter, request) => r?,
        };
        let resolved = match resolved {
            Flow::Proceed(r) => r,
            Flow::Declined => return Ok(Flow::Declined),
            Flow::Interrupted => return Ok(Flow::Interrupted),
        };
        session.chosen_path = Some(resolved.path.clone());

        // LICENSE_PENDING
        if framework.license_required {
            session.transition(SessionState::LicensePending)?;
            let text = framework.license.as_deref().unwrap_or_default();
            let consent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Consent::Interrupted,
                c = LicenseGate::present(prompter, text) => c.map_err(InstallError::State)?,
            };
            match consent {
                Consent::Accepted => session.license_accepted = true,
                Consent::Declined => return Ok(Flow::Declined),
                Consent::Interrupted => return Ok(Flow::Interrupted),
            }
        }

        // DOWNLOADING
        session.transition(SessionState::Downloading)?;
        self.check_cancel()?;
        let artifact = self.download(session, framework).await?;

        // EXTRACTING
        session.transition(SessionState::Extracting)?;
        self.check_cancel()?;
        let staged = self.extract(session, framework, &artifact, &resolved).await?;

        // REGISTERING
        session.transition(SessionState::Registering)?;
        self.check_cancel()?;
        let record = self
            .register(session, framework, previous.as_ref(), &resolved, &staged)
            .await?;

        session.transition(SessionState::Done)?;
        Ok(Flow::Proceed(record))
    }

    async fn download(
        &self,
        session: &mut InstallSession,
        framework: &FrameworkDescriptor,
    ) -> Result<FetchedArtifact, InstallError> {
        let source = &framework.download;
        let download_dir = self.settings.download_dir();
        files::create_dir_all_tracked(&download_dir, "download_dir")
            .await
            .map_err(InstallError::Fetch)?;
        let dest = download_dir.join(format!("{}-{}", session.id, source.file_name()));
        session
            .journal
            .push(SessionState::Downloading, Compensation::RemoveFile(dest.clone()));

        let timeout = self.settings.download_timeout();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(InstallError::Interrupted),
            r = tokio::time::timeout(timeout, self.fetcher.fetch(source, &dest)) => match r {
                Ok(fetched) => fetched.map_err(InstallError::Fetch),
                Err(_) => Err(InstallError::Fetch(anyhow::anyhow!(
                    "{} timed out after {}s",
                    source.file_name(),
                    timeout.as_secs()
                ))),
            },
        }
    }

    /// Unpack into the staging directory and check the payload.
    async fn extract(
        &self,
        session: &mut InstallSession,
        framework: &FrameworkDescriptor,
        artifact: &FetchedArtifact,
        resolved: &ResolvedPath,
    ) -> Result<Staged, InstallError> {
        let target = &resolved.path;
        let placement = path_resolver::placement_for(target).map_err(InstallError::Filesystem)?;
        let staging = match placement {
            Placement::Sibling => {
                let parent = target.parent().ok_or_else(|| {
                    InstallError::invalid_path(
                        target.display().to_string(),
                        "it has no parent directory",
                    )
                })?;
                if let Some(created) = files::create_dir_all_tracked(parent, "install_parent")
                    .await
                    .map_err(InstallError::Filesystem)?
                {
                    session
                        .journal
                        .push(SessionState::Extracting, Compensation::RemoveDir(created));
                }
                path_resolver::staging_dir_for(target, &session.id)
                    .map_err(InstallError::Filesystem)?
            }
            Placement::InPlace => {
                info!(
                    "[PHASE: install] [STEP: extract] {:?} can't be swapped by rename; unpacking inside it",
                    target
                );
                path_resolver::inner_staging_dir(target, &session.id)
            }
        };
        session
            .journal
            .push(SessionState::Extracting, Compensation::RemoveDir(staging.clone()));

        let format = framework
            .download
            .archive_format()
            .map_err(InstallError::Extraction)?;

        // Always awaited: the extractor stops on its own once the token is cancelled.
        let summary = self
            .extractor
            .extract(&artifact.path, format, &staging, &self.cancel)
            .await
            .map_err(|e| {
                if self.cancel.is_cancelled() {
                    InstallError::Interrupted
                } else {
                    InstallError::Extraction(e)
                }
            })?;
        info!(
            "[PHASE: install] [STEP: extract] {} entries unpacked (stripped_root={:?})",
            summary.entries, summary.stripped_root
        );

        if let Err(e) = files::remove_file_idempotent(&artifact.path, "download_cleanup").await {
            warn!(
                "[PHASE: install] [STEP: extract] Failed to delete {:?}: {:#}",
                artifact.path, e
            );
        }

        let exe = framework.executable(&staging);
        if !files::is_executable_file(&exe).await {
            return Err(InstallError::Extraction(anyhow::anyhow!(
                "{} is missing from the archive or isn't executable",
                framework.exec
            )));
        }
        Ok(Staged {
            dir: staging,
            placement,
        })
    }

    /// Move `dir` aside into a backup sibling; it comes back on rollback and is deleted
    /// on commit. Directories that can't be renamed have their entries parked instead.
    async fn park(
        &self,
        session: &mut InstallSession,
        dir: &Path,
    ) -> Result<(), InstallError> {
        if tokio::fs::symlink_metadata(dir).await.is_err() {
            return Ok(());
        }
        if path_resolver::placement_for(dir).map_err(InstallError::Filesystem)? == Placement::InPlace {
            return self.park_entries(session, dir, None).await;
        }
        let parked =
            path_resolver::backup_dir_for(dir, &session.id).map_err(InstallError::Filesystem)?;
        files::rename_with_retries(dir, &parked, "park_previous")
            .await
            .map_err(InstallError::Filesystem)?;
        session.journal.push(
            SessionState::Registering,
            Compensation::RestoreDir {
                parked: parked.clone(),
                original: dir.to_path_buf(),
            },
        );
        session.journal.delete_on_commit(parked);
        Ok(())
    }

    /// Move the entries of `dir` (except `keep`) into a backup directory inside it.
    async fn park_entries(
        &self,
        session: &mut InstallSession,
        dir: &Path,
        keep: Option<&Path>,
    ) -> Result<(), InstallError> {
        let backup = path_resolver::inner_backup_dir(dir, &session.id);
        let entries = files::list_dir(dir).await.map_err(InstallError::Filesystem)?;
        files::create_dir_all_tracked(&backup, "park_entries")
            .await
            .map_err(InstallError::Filesystem)?;
        session
            .journal
            .push(SessionState::Registering, Compensation::RemoveDir(backup.clone()));
        session.journal.delete_on_commit(backup.clone());

        for entry in entries {
            if entry == backup || keep == Some(entry.as_path()) {
                continue;
            }
            let Some(name) = entry.file_name() else {
                continue;
            };
            let parked = backup.join(name);
            files::rename_with_retries(&entry, &parked, "park_entry")
                .await
                .map_err(InstallError::Filesystem)?;
            session.journal.push(
                SessionState::Registering,
                Compensation::RestoreDir {
                    parked,
                    original: entry,
                },
            );
        }
        Ok(())
    }

    /// Move every entry of `staging` into `target`, then drop the empty staging dir.
    async fn move_entries_into(
        &self,
        session: &mut InstallSession,
        staging: &Path,
        target: &Path,
    ) -> Result<(), InstallError> {
        for entry in files::list_dir(staging).await.map_err(InstallError::Filesystem)? {
            let Some(name) = entry.file_name() else {
                continue;
            };
            let dest = target.join(name);
            files::rename_with_retries(&entry, &dest, "install_entry")
                .await
                .map_err(InstallError::Filesystem)?;
            session
                .journal
                .push(SessionState::Registering, Compensation::RemoveEntry(dest));
        }
        files::remove_dir_all_idempotent(staging, "staging_cleanup")
            .await
            .map_err(InstallError::Filesystem)
    }

    async fn register(
        &self,
        session: &mut InstallSession,
        framework: &FrameworkDescriptor,
        previous: Option<&InstallRecord>,
        resolved: &ResolvedPath,
        staged: &Staged,
    ) -> Result<InstallRecord, InstallError> {
        let target = &resolved.path;

        // Retire the previous install: record, launcher, directory.
        if let Some(prev) = previous {
            if let Some(removed) = self
                .store
                .remove(&prev.framework_id)
                .await
                .map_err(InstallError::State)?
            {
                session
                    .journal
                    .push(SessionState::Registering, Compensation::RestoreRecord(removed));
            }

            let was_registered = self
                .registrar
                .is_registered(&prev.launcher_id)
                .await
                .map_err(InstallError::LauncherRegistration)?;
            self.registrar
                .unregister(&prev.launcher_id)
                .await
                .map_err(InstallError::LauncherRegistration)?;
            if was_registered {
                let mut old_spec = LauncherSpec::for_framework(framework, &prev.install_path);
                old_spec.id = prev.launcher_id.clone();
                session
                    .journal
                    .push(SessionState::Registering, Compensation::ReregisterLauncher(old_spec));
            }

            if prev.install_path != *target {
                self.park(session, &prev.install_path).await?;
            }
        }

        // Whatever is at the target (confirmed content, an empty dir, the old install).
        match staged.placement {
            Placement::Sibling => {
                self.park(session, target).await?;
                files::rename_with_retries(&staged.dir, target, "install_payload")
                    .await
                    .map_err(InstallError::Filesystem)?;
                session
                    .journal
                    .push(SessionState::Registering, Compensation::RemoveDir(target.clone()));
            }
            Placement::InPlace => {
                self.park_entries(session, target, Some(&staged.dir)).await?;
                self.move_entries_into(session, &staged.dir, target).await?;
            }
        }
        if resolved.replaces_content {
            info!(
                "[PHASE: install] [STEP: register] Previous content of {:?} moved aside",
                target
            );
        }

        let spec = LauncherSpec::for_framework(framework, target);
        session.journal.push(
            SessionState::Registering,
            Compensation::UnregisterLauncher(spec.id.clone()),
        );
        self.registrar
            .register(&spec)
            .await
            .map_err(InstallError::LauncherRegistration)?;
        self.check_cancel()?;

        // Commit point.
        let record = InstallRecord::new(
            &framework.id,
            &framework.category_id,
            target.clone(),
            framework.download.version_tag(),
            spec.id,
        );
        self.store
            .put(record.clone())
            .await
            .map_err(InstallError::State)?;
        Ok(record)
    }

    // ========================================================================
    // remove / list
    // ========================================================================

    /// Uninstall `framework`: record first, then launcher, then directory.
    pub async fn remove(
        &self,
        prompter: &dyn Prompter,
        framework: &FrameworkDescriptor,
    ) -> Result<InstallRecord, InstallError> {
        let _lock = self.lock(&framework.id)?;
        let record = self
            .store
            .remove(&framework.id)
            .await
            .map_err(InstallError::State)?
            .ok_or_else(|| InstallError::NotInstalled(framework.name.clone()))?;
        info!(
            "[PHASE: remove] [STEP: record] Removed record of {} ({:?})",
            framework.id, record.install_path
        );

        self.registrar
            .unregister(&record.launcher_id)
            .await
            .map_err(InstallError::LauncherRegistration)?;
        let placement = path_resolver::placement_for(&record.install_path)
            .map_err(InstallError::Filesystem)?;
        let removed = match placement {
            Placement::Sibling => {
                files::remove_dir_all_idempotent(&record.install_path, "remove_install").await
            }
            // The directory (or the link to it) belongs to the user; only the install goes.
            Placement::InPlace => files::clear_dir(&record.install_path, "remove_install").await,
        };
        removed.map_err(InstallError::Filesystem)?;

        info!("[PHASE: remove] [STEP: done] {} removed", framework.id);
        prompter.say("Removal done");
        Ok(record)
    }

    /// Installed frameworks, optionally restricted to one category.
    pub async fn installed(&self, category: Option<&str>) -> Result<Vec<InstallRecord>, InstallError> {
        let records = self.store.list().await.map_err(InstallError::State)?;
        Ok(records
            .into_iter()
            .filter(|r| category.map_or(true, |c| r.category_id == c))
            .collect())
    }

    /// Record of `framework` when its install is complete.
    pub async fn installed_record(
        &self,
        framework: &FrameworkDescriptor,
    ) -> Result<InstallRecord, InstallError> {
        let record = self
            .store
            .get(&framework.id)
            .await
            .map_err(InstallError::State)?
            .ok_or_else(|| InstallError::NotInstalled(framework.name.clone()))?;
        if !self.is_complete(framework, &record).await? {
            return Err(InstallError::NotInstalled(framework.name.clone()));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::state::MemoryStateStore;
    use crate::prompt::ScriptedPrompter;
    use crate::test_support::{Fixture, TOOL_LICENSE};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PATH_Q: &str = "Choose installation path";
    const LICENSE_Q: &str = r"\[I Accept \(a\)/I don't accept \(N\)\] $";
    const NON_EMPTY_Q: &str = r"isn't an empty directory, do you want to remove its content and install there\? \[Install \(i\)/No \(N\)\] $";
    const REINSTALL_Q: &str = r"Tool is already installed on your system, do you want to reinstall it anyway\? \[Yes \(y\)/No \(N\)\] $";

    fn accept_all() -> ScriptedPrompter {
        ScriptedPrompter::new()
            .answer(PATH_Q, "")
            .answer(LICENSE_Q, "a")
    }

    /// Directory entries other than the ones we expect to exist at rest.
    fn leftovers(dir: &Path) -> Vec<String> {
        match std::fs::read_dir(dir) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| n.contains(".dtc-"))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn assert_untouched(fx: &Fixture) {
        assert!(fx.store.get("tool").await.unwrap().is_none());
        assert!(!fx.launcher_file("tool").exists());
        assert!(!fx.registrar.is_registered("tool.desktop").await.unwrap());
        assert!(!fx.settings.tools_root.exists(), "no partial directory");
    }

    async fn install_default(fx: &Fixture) -> InstallRecord {
        let p = accept_all();
        match fx
            .orchestrator()
            .install(&p, &fx.framework("tool"), None)
            .await
            .unwrap()
        {
            SessionOutcome::Done(r) => r,
            other => panic!("expected DONE, got {:?}", other),
        }
    }

    #[test]
    fn failure_messages_name_the_step_once() {
        let fetch = InstallError::Fetch(anyhow::anyhow!("timeout"));
        assert_eq!(
            failure_message(SessionState::Downloading, &fetch),
            "Download failed: timeout"
        );
        let state = InstallError::State(anyhow::anyhow!("disk full"));
        assert_eq!(
            failure_message(SessionState::Registering, &state),
            "Launcher registration failed: Installed state error: disk full"
        );
    }

    #[tokio::test]
    async fn happy_path_installs_registers_and_records() {
        let fx = Fixture::new();
        let p = accept_all();
        let outcome = fx
            .orchestrator()
            .install(&p, &fx.framework("tool"), None)
            .await
            .unwrap();
        assert!(outcome.is_done(), "{:?}", outcome);

        let target = fx.default_path("tool");
        let record = fx.store.get("tool").await.unwrap().expect("record");
        assert_eq!(record.install_path, target);
        assert_eq!(record.version_tag, "1.0");
        assert_eq!(record.category_id, "devel");
        assert!(files::is_executable_file(&target.join("bin/tool.sh")).await);
        assert!(fx.registrar.is_registered("tool.desktop").await.unwrap());
        let entry = std::fs::read_to_string(fx.launcher_file("tool")).unwrap();
        assert!(entry.contains(&format!("Exec={}", target.join("bin/tool.sh").display())));

        assert_eq!(p.remaining(), 0);
        assert!(p.output().contains(TOOL_LICENSE));
        assert!(p.output().ends_with("say: Installation done"));
        assert!(leftovers(target.parent().unwrap()).is_empty());
        assert!(std::fs::read_dir(fx.settings.download_dir()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn license_decline_aborts_without_mutation() {
        let fx = Fixture::new();
        let p = ScriptedPrompter::new()
            .answer(PATH_Q, "")
            .answer(LICENSE_Q, "");
        let outcome = fx
            .orchestrator()
            .install(&p, &fx.framework("tool"), None)
            .await
            .unwrap();
        match outcome {
            SessionOutcome::Aborted {
                at: SessionState::LicensePending,
                reason: AbortReason::Declined,
            } => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_untouched(&fx).await;
        assert!(!p.output().contains("warn:"), "declining is silent");
    }

    #[tokio::test]
    async fn frameworks_without_license_skip_the_gate() {
        let fx = Fixture::new();
        let p = ScriptedPrompter::new().answer(PATH_Q, "");
        let outcome = fx
            .orchestrator()
            .install(&p, &fx.framework("other"), None)
            .await
            .unwrap();
        assert!(outcome.is_done());
        assert_eq!(p.remaining(), 0);
    }

    #[tokio::test]
    async fn interrupt_at_each_prompt_leaves_nothing() {
        let fx = Fixture::new();
        let scripts = vec![
            (ScriptedPrompter::new().interrupt(PATH_Q), SessionState::PathPending),
            (
                ScriptedPrompter::new().answer(PATH_Q, "").interrupt(LICENSE_Q),
                SessionState::LicensePending,
            ),
            (
                ScriptedPrompter::new().answer(PATH_Q, "").answer(LICENSE_Q, "\x03"),
                SessionState::LicensePending,
            ),
        ];
        for (p, state) in scripts {
            let outcome = fx
                .orchestrator()
                .install(&p, &fx.framework("tool"), None)
                .await
                .unwrap();
            match outcome {
                SessionOutcome::Aborted {
                    at,
                    reason: AbortReason::Interrupted,
                } => assert_eq!(at, state),
                other => panic!("unexpected {:?}", other),
            }
            assert_untouched(&fx).await;
        }
    }

    #[tokio::test]
    async fn non_empty_target_decline_and_accept() {
        let fx = Fixture::new();
        let custom = fx.root.path().join("busy");
        std::fs::create_dir_all(&custom).unwrap();
        std::fs::write(custom.join("bar"), b"foo").unwrap();

        let p = ScriptedPrompter::new().answer(NON_EMPTY_Q, "");
        let outcome = fx
            .orchestrator()
            .install(&p, &fx.framework("tool"), Some(custom.display().to_string()))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SessionOutcome::Aborted {
                reason: AbortReason::Declined,
                ..
            }
        ));
        assert_eq!(std::fs::read(custom.join("bar")).unwrap(), b"foo");
        assert!(fx.store.get("tool").await.unwrap().is_none());

        let p = ScriptedPrompter::new()
            .answer(NON_EMPTY_Q, "i")
            .answer(LICENSE_Q, "a");
        let outcome = fx
            .orchestrator()
            .install(&p, &fx.framework("tool"), Some(custom.display().to_string()))
            .await
            .unwrap();
        assert!(outcome.is_done(), "{:?}", outcome);
        assert!(!custom.join("bar").exists(), "content replaced");
        assert!(custom.join("bin/tool.sh").is_file());
        assert!(leftovers(fx.root.path()).is_empty(), "{:?}", leftovers(fx.root.path()));
    }

    #[tokio::test]
    async fn custom_empty_path_goes_straight_to_license() {
        let fx = Fixture::new();
        let custom = fx.root.path().join("custom").join("place");
        let p = ScriptedPrompter::new().answer(LICENSE_Q, "accept");
        let outcome = fx
            .orchestrator()
            .install(&p, &fx.framework("tool"), Some(custom.display().to_string()))
            .await
            .unwrap();
        match outcome {
            SessionOutcome::Done(r) => assert_eq!(r.install_path, custom),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!p.output().contains(PATH_Q));
    }

    #[tokio::test]
    async fn invalid_path_reprompts_with_a_warning() {
        let fx = Fixture::new();
        let erase = "\x7f".repeat(200);
        let p = ScriptedPrompter::new()
            .answer(PATH_Q, &erase)
            .answer(PATH_Q, &format!("{}/", erase))
            .answer(PATH_Q, "")
            .answer(LICENSE_Q, "a");
        let outcome = fx
            .orchestrator()
            .install(&p, &fx.framework("tool"), None)
            .await
            .unwrap();
        assert!(outcome.is_done());
        let warnings: Vec<_> = p
            .transcript()
            .into_iter()
            .filter(|l| l.starts_with("warn:"))
            .collect();
        assert_eq!(warnings.len(), 1, "{:?}", warnings);
    }

    #[tokio::test]
    async fn reinstall_declined_changes_nothing() {
        let fx = Fixture::new();
        let before = install_default(&fx).await;
        let favs_before = std::fs::read(fx.settings.state_dir.join("favorites.json")).unwrap();

        for keys in ["", "n", "whatever"] {
            let p = ScriptedPrompter::new().answer(REINSTALL_Q, keys);
            let outcome = fx
                .orchestrator()
                .install(&p, &fx.framework("tool"), None)
                .await
                .unwrap();
            assert!(matches!(
                outcome,
                SessionOutcome::Aborted {
                    at: SessionState::ReinstallConfirm,
                    reason: AbortReason::Declined
                }
            ));
        }
        assert_eq!(fx.store.get("tool").await.unwrap(), Some(before));
        assert_eq!(
            std::fs::read(fx.settings.state_dir.join("favorites.json")).unwrap(),
            favs_before
        );
        assert!(fx.registrar.is_registered("tool.desktop").await.unwrap());
    }

    #[tokio::test]
    async fn reinstall_accepted_replaces_the_single_record() {
        let fx = Fixture::new();
        let before = install_default(&fx).await;
        std::fs::write(before.install_path.join("stale-file"), b"x").unwrap();

        let p = ScriptedPrompter::new()
            .answer(REINSTALL_Q, "y")
            .answer(PATH_Q, "")
            .answer(LICENSE_Q, "a");
        let outcome = fx
            .orchestrator()
            .install(&p, &fx.framework("tool"), None)
            .await
            .unwrap();
        assert!(outcome.is_done(), "{:?}", outcome);
        assert!(!p.output().contains("isn't an empty directory"));

        let records = fx.store.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].install_path, before.install_path);
        assert!(!before.install_path.join("stale-file").exists());
        assert!(fx.registrar.is_registered("tool.desktop").await.unwrap());
        assert!(leftovers(before.install_path.parent().unwrap()).is_empty());
    }

    #[tokio::test]
    async fn reinstall_to_a_new_path_uninstalls_the_old_one() {
        let fx = Fixture::new();
        let before = install_default(&fx).await;
        let moved = fx.root.path().join("elsewhere");

        let p = ScriptedPrompter::new()
            .answer(REINSTALL_Q, "yes")
            .answer(PATH_Q, &format!("\x15{}", moved.display()))
            .answer(LICENSE_Q, "a");
        let outcome = fx
            .orchestrator()
            .install(&p, &fx.framework("tool"), None)
            .await
            .unwrap();
        assert!(outcome.is_done());
        assert!(!before.install_path.exists());
        let record = fx.store.get("tool").await.unwrap().unwrap();
        assert_eq!(record.install_path, moved);
        let entry = std::fs::read_to_string(fx.launcher_file("tool")).unwrap();
        assert!(entry.contains(&moved.display().to_string()));
    }

    #[tokio::test]
    async fn stale_record_is_treated_as_not_installed() {
        let fx = Fixture::new();
        let before = install_default(&fx).await;
        std::fs::remove_dir_all(&before.install_path).unwrap();

        let outcome = fx
            .orchestrator()
            .install(&accept_all(), &fx.framework("tool"), None)
            .await
            .unwrap();
        assert!(outcome.is_done());
        assert_eq!(fx.store.list().await.unwrap().len(), 1);
        assert!(before.install_path.join("bin/tool.sh").is_file());
    }

    #[tokio::test]
    async fn path_of_another_framework_is_refused() {
        let fx = Fixture::new();
        let tool = install_default(&fx).await;

        let p = ScriptedPrompter::new()
            .answer(PATH_Q, &format!("\x15{}", tool.install_path.display()))
            .eof(PATH_Q);
        let outcome = fx
            .orchestrator()
            .install(&p, &fx.framework("other"), None)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SessionOutcome::Aborted {
                reason: AbortReason::Declined,
                ..
            }
        ));
        assert!(p.output().contains("already the installation path of tool"));
        assert!(fx.store.get("other").await.unwrap().is_none());
    }

    struct BrokenFetcher;

    #[async_trait]
    impl Fetcher for BrokenFetcher {
        async fn fetch(
            &self,
            _source: &crate::models::catalog::DownloadSource,
            dest: &Path,
        ) -> anyhow::Result<FetchedArtifact> {
            std::fs::write(dest, b"partial").unwrap();
            Err(anyhow::anyhow!("connection reset"))
        }
    }

    #[tokio::test]
    async fn fetch_failure_rolls_back_and_names_the_step() {
        let fx = Fixture::new();
        let p = accept_all();
        let orch = fx.orchestrator_with(fx.store.clone(), Arc::new(BrokenFetcher));
        let outcome = orch.install(&p, &fx.framework("tool"), None).await.unwrap();
        match outcome {
            SessionOutcome::Aborted {
                at: SessionState::Downloading,
                reason: AbortReason::Failed(InstallError::Fetch(_)),
            } => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(p.output().contains("warn: Download failed: connection reset"));
        assert_untouched(&fx).await;
        assert!(std::fs::read_dir(fx.settings.download_dir()).unwrap().next().is_none());
    }

    /// Serves a file that isn't the archive it claims to be.
    struct GarbageFetcher;

    #[async_trait]
    impl Fetcher for GarbageFetcher {
        async fn fetch(
            &self,
            _source: &crate::models::catalog::DownloadSource,
            dest: &Path,
        ) -> anyhow::Result<FetchedArtifact> {
            std::fs::write(dest, b"not a zip").unwrap();
            Ok(FetchedArtifact {
                path: dest.to_path_buf(),
                bytes: 9,
                sha256: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn extraction_failure_removes_staging_and_created_parents() {
        let fx = Fixture::new();
        let p = accept_all();
        let orch = fx.orchestrator_with(fx.store.clone(), Arc::new(GarbageFetcher));
        let outcome = orch.install(&p, &fx.framework("tool"), None).await.unwrap();
        match outcome {
            SessionOutcome::Aborted {
                at: SessionState::Extracting,
                reason: AbortReason::Failed(InstallError::Extraction(_)),
            } => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(p.output().contains("warn: Extraction failed:"));
        assert_untouched(&fx).await;
    }

    #[tokio::test]
    async fn launcher_failure_restores_everything() {
        let fx = Fixture::new();
        let custom = fx.root.path().join("busy");
        std::fs::create_dir_all(&custom).unwrap();
        std::fs::write(custom.join("keep"), b"mine").unwrap();
        // Unreadable favorites make pinning fail.
        std::fs::create_dir_all(&fx.settings.state_dir).unwrap();
        std::fs::write(fx.settings.state_dir.join("favorites.json"), b"{corrupt").unwrap();

        let p = ScriptedPrompter::new()
            .answer(NON_EMPTY_Q, "yes")
            .answer(LICENSE_Q, "a");
        let outcome = fx
            .orchestrator()
            .install(&p, &fx.framework("tool"), Some(custom.display().to_string()))
            .await
            .unwrap();
        match outcome {
            SessionOutcome::Aborted {
                at: SessionState::Registering,
                reason: AbortReason::Failed(InstallError::LauncherRegistration(_)),
            } => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(p.output().contains("warn: Launcher registration failed:"));
        assert_eq!(std::fs::read(custom.join("keep")).unwrap(), b"mine");
        assert!(!custom.join("bin").exists());
        assert!(!fx.launcher_file("tool").exists());
        assert!(fx.store.get("tool").await.unwrap().is_none());
        assert!(leftovers(fx.root.path()).is_empty(), "{:?}", leftovers(fx.root.path()));
    }

    /// `link` -> `bigdisk/as`, where the real directory holds one user file.
    fn symlinked_target(fx: &Fixture) -> (PathBuf, PathBuf) {
        let real = fx.root.path().join("bigdisk/as");
        std::fs::create_dir_all(&real).unwrap();
        std::fs::write(real.join("keep"), b"mine").unwrap();
        let link = fx.root.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        (link, real)
    }

    #[tokio::test]
    async fn symlinked_target_is_filled_through_the_link() {
        let fx = Fixture::new();
        let (link, real) = symlinked_target(&fx);
        let p = ScriptedPrompter::new()
            .answer(NON_EMPTY_Q, "i")
            .answer(LICENSE_Q, "a");
        let outcome = fx
            .orchestrator()
            .install(&p, &fx.framework("tool"), Some(link.display().to_string()))
            .await
            .unwrap();
        let SessionOutcome::Done(record) = outcome else {
            panic!("unexpected {:?}", outcome);
        };

        assert_eq!(record.install_path, link);
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert!(real.join("bin/tool.sh").is_file(), "payload lands in the linked directory");
        assert!(!real.join("keep").exists(), "confirmed content is replaced");
        assert!(leftovers(&real).is_empty(), "{:?}", leftovers(&real));
        assert!(fx.registrar.is_registered("tool.desktop").await.unwrap());

        fx.orchestrator()
            .remove(&ScriptedPrompter::new(), &fx.framework("tool"))
            .await
            .unwrap();
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert!(real.is_dir());
        assert!(std::fs::read_dir(&real).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn failed_in_place_install_restores_the_linked_directory() {
        let fx = Fixture::new();
        let (link, real) = symlinked_target(&fx);
        std::fs::create_dir_all(&fx.settings.state_dir).unwrap();
        std::fs::write(fx.settings.state_dir.join("favorites.json"), b"{corrupt").unwrap();

        let p = ScriptedPrompter::new()
            .answer(NON_EMPTY_Q, "i")
            .answer(LICENSE_Q, "a");
        let outcome = fx
            .orchestrator()
            .install(&p, &fx.framework("tool"), Some(link.display().to_string()))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SessionOutcome::Aborted {
                at: SessionState::Registering,
                ..
            }
        ));
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read(real.join("keep")).unwrap(), b"mine");
        assert!(!real.join("bin").exists());
        assert!(leftovers(&real).is_empty(), "{:?}", leftovers(&real));
        assert!(fx.store.get("tool").await.unwrap().is_none());
    }

    /// In-memory store whose first `fail_puts` writes fail.
    struct FlakyStore {
        inner: MemoryStateStore,
        fail_puts: AtomicUsize,
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        async fn get(&self, id: &str) -> anyhow::Result<Option<InstallRecord>> {
            self.inner.get(id).await
        }
        async fn put(&self, record: InstallRecord) -> anyhow::Result<()> {
            if self
                .fail_puts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(anyhow::anyhow!("disk full"));
            }
            self.inner.put(record).await
        }
        async fn remove(&self, id: &str) -> anyhow::Result<Option<InstallRecord>> {
            self.inner.remove(id).await
        }
        async fn list(&self) -> anyhow::Result<Vec<InstallRecord>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn failed_record_write_during_reinstall_restores_the_previous_install() {
        let fx = Fixture::new();
        let store = Arc::new(FlakyStore {
            inner: MemoryStateStore::new(),
            fail_puts: AtomicUsize::new(0),
        });
        let orch = fx.orchestrator_with(store.clone(), fx.fetcher());
        let first = match orch
            .install(&accept_all(), &fx.framework("tool"), None)
            .await
            .unwrap()
        {
            SessionOutcome::Done(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        std::fs::write(first.install_path.join("marker"), b"old").unwrap();

        store.fail_puts.store(1, Ordering::SeqCst);
        let p = ScriptedPrompter::new()
            .answer(REINSTALL_Q, "y")
            .answer(PATH_Q, "")
            .answer(LICENSE_Q, "a");
        let outcome = orch.install(&p, &fx.framework("tool"), None).await.unwrap();
        match outcome {
            SessionOutcome::Aborted {
                at: SessionState::Registering,
                reason: AbortReason::Failed(InstallError::State(_)),
            } => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.get("tool").await.unwrap(), Some(first.clone()));
        assert_eq!(std::fs::read(first.install_path.join("marker")).unwrap(), b"old");
        assert!(fx.registrar.is_registered("tool.desktop").await.unwrap());
        assert!(leftovers(first.install_path.parent().unwrap()).is_empty());
    }

    #[tokio::test]
    async fn cancellation_before_download_rolls_back() {
        let fx = Fixture::new();
        let p = ScriptedPrompter::new().answer(PATH_Q, "").answer(LICENSE_Q, "a");
        fx.cancel.cancel();
        let outcome = fx
            .orchestrator()
            .install(&p, &fx.framework("tool"), None)
            .await
            .unwrap();
        // The cancelled token wins over the first prompt.
        assert!(matches!(
            outcome,
            SessionOutcome::Aborted {
                at: SessionState::PathPending,
                reason: AbortReason::Interrupted
            }
        ));
        assert_untouched(&fx).await;
    }

    #[tokio::test]
    async fn second_session_for_the_same_framework_is_locked_out() {
        let fx = Fixture::new();
        let _held = FrameworkLock::try_acquire(&fx.settings.lock_dir(), "tool")
            .unwrap()
            .unwrap();
        let err = fx
            .orchestrator()
            .install(&accept_all(), &fx.framework("tool"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::Locked(ref id) if id == "tool"));

        let other = fx
            .orchestrator()
            .install(
                &ScriptedPrompter::new().answer(PATH_Q, ""),
                &fx.framework("other"),
                None,
            )
            .await
            .unwrap();
        assert!(other.is_done(), "other frameworks aren't blocked");
    }

    #[tokio::test]
    async fn remove_clears_record_launcher_and_directory() {
        let fx = Fixture::new();
        let record = install_default(&fx).await;
        let orch = fx.orchestrator();
        let p = ScriptedPrompter::new();

        let removed = orch.remove(&p, &fx.framework("tool")).await.unwrap();
        assert_eq!(removed, record);
        assert!(!record.install_path.exists());
        assert!(!fx.launcher_file("tool").exists());
        assert!(orch.installed(None).await.unwrap().is_empty());
        assert_eq!(p.output(), "say: Removal done");

        let err = orch.remove(&p, &fx.framework("tool")).await.unwrap_err();
        assert_eq!(err.to_string(), "Tool isn't installed");
    }

    #[tokio::test]
    async fn listing_filters_by_category_and_launch_lookup_requires_complete_install() {
        let fx = Fixture::new();
        let orch = fx.orchestrator();
        assert!(matches!(
            orch.installed_record(&fx.framework("tool")).await,
            Err(InstallError::NotInstalled(_))
        ));

        let record = install_default(&fx).await;
        assert_eq!(orch.installed(Some("devel")).await.unwrap(), vec![record.clone()]);
        assert!(orch.installed(Some("android")).await.unwrap().is_empty());
        assert_eq!(orch.installed_record(&fx.framework("tool")).await.unwrap(), record);

        std::fs::remove_file(record.install_path.join("bin/tool.sh")).unwrap();
        assert!(orch.installed_record(&fx.framework("tool")).await.is_err());
    }
}
