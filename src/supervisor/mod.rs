// Process supervision for launched frameworks
//
// Launchers are usually shell scripts that exec or fork the real application, so the
// process we spawn isn't necessarily the one we need to stop. `locate` finds the live
// process by a command-line signature: every signature part must appear in one of its
// arguments.

use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, System};
use tokio::process::{Child, Command};

use crate::error::SupervisorError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A process found by [`ProcessSupervisor::locate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedProcess {
    pub pid: u32,
    pub cmdline: Vec<String>,
}

// ============================================================================
// Process table
// ============================================================================

/// Every signature part is a substring of at least one argument.
pub fn matches_signature(cmdline: &[String], signature: &[String]) -> bool {
    !cmdline.is_empty()
        && !signature.is_empty()
        && signature
            .iter()
            .all(|part| cmdline.iter().any(|arg| arg.contains(part.as_str())))
}

fn scan_processes(signature: &[String], exclude: u32) -> Vec<LocatedProcess> {
    let mut system = System::new();
    system.refresh_processes();
    let mut found: Vec<LocatedProcess> = system
        .processes()
        .iter()
        .filter(|(pid, proc_)| pid.as_u32() != exclude && proc_.status() != ProcessStatus::Zombie)
        .filter(|(_, proc_)| matches_signature(proc_.cmd(), signature))
        .map(|(pid, proc_)| LocatedProcess {
            pid: pid.as_u32(),
            cmdline: proc_.cmd().to_vec(),
        })
        .collect();
    // Threads show up with their own ids, always above the id of their process.
    found.sort_by_key(|p| p.pid);
    found.dedup_by(|a, b| a.cmdline == b.cmdline);
    found
}

fn is_alive(pid: u32) -> bool {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    if !system.refresh_process(pid) {
        return false;
    }
    system
        .process(pid)
        .map(|p| p.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}

/// Exit code of a finished process; death by signal N reports 128 + N like a shell.
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

// ============================================================================
// Supervisor
// ============================================================================

pub struct ProcessSupervisor {
    locate_window: Duration,
    stop_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(locate_window: Duration, stop_timeout: Duration) -> Self {
        Self {
            locate_window,
            stop_timeout,
        }
    }

    /// Start `program`. The child keeps our stdio and is killed if its handle is dropped.
    pub fn launch(&self, program: &Path, args: &[String]) -> Result<Child, SupervisorError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Launch {
                program: program.display().to_string(),
                source,
            })?;
        info!(
            "[PHASE: launch] [STEP: spawn] Started {:?} (pid={:?})",
            program,
            child.id()
        );
        Ok(child)
    }

    /// Poll until a process matching `signature` shows up, within the locate window.
    pub async fn locate(&self, signature: &[String]) -> Result<LocatedProcess, SupervisorError> {
        let started = Instant::now();
        let me = std::process::id();
        loop {
            let sig = signature.to_vec();
            let found = tokio::task::spawn_blocking(move || scan_processes(&sig, me))
                .await
                .map_err(|e| SupervisorError::Io(std::io::Error::other(e)))?;
            if let Some(p) = found.into_iter().next() {
                info!(
                    "[PHASE: launch] [STEP: locate] Found pid {} for {:?} after {}ms",
                    p.pid,
                    signature,
                    started.elapsed().as_millis()
                );
                return Ok(p);
            }
            if started.elapsed() >= self.locate_window {
                warn!(
                    "[PHASE: launch] [STEP: locate] No process matching {:?} within {}s",
                    signature,
                    self.locate_window.as_secs()
                );
                return Err(SupervisorError::ProcessNotFound {
                    signature: signature.to_vec(),
                    waited: self.locate_window,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Ask `pid` to stop (SIGTERM).
    pub fn terminate(&self, pid: u32) -> Result<(), SupervisorError> {
        let raw = i32::try_from(pid).map_err(|_| SupervisorError::Signal {
            pid,
            source: std::io::Error::from(std::io::ErrorKind::InvalidInput),
        })?;
        signal::kill(NixPid::from_raw(raw), Signal::SIGTERM).map_err(|errno| {
            SupervisorError::Signal {
                pid,
                source: std::io::Error::from(errno),
            }
        })?;
        info!("[PHASE: launch] [STEP: terminate] Sent SIGTERM to {}", pid);
        Ok(())
    }

    /// Wait for our own child to exit, up to the stop timeout.
    pub async fn wait_for_exit(&self, child: &mut Child) -> Result<i32, SupervisorError> {
        let pid = child.id().unwrap_or_default();
        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(status) => {
                let code = exit_code(status?);
                info!(
                    "[PHASE: launch] [STEP: wait] Process {} exited with {}",
                    pid, code
                );
                Ok(code)
            }
            Err(_) => Err(SupervisorError::Timeout {
                pid,
                waited: self.stop_timeout,
            }),
        }
    }

    /// Wait for an arbitrary process (not necessarily our child) to disappear.
    pub async fn wait_for_pid_exit(&self, pid: u32) -> Result<(), SupervisorError> {
        let started = Instant::now();
        while is_alive(pid) {
            if started.elapsed() >= self.stop_timeout {
                return Err(SupervisorError::Timeout {
                    pid,
                    waited: self.stop_timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        debug!("[PHASE: launch] [STEP: wait] Process {} is gone", pid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn signature_parts_may_match_different_arguments() {
        let cmd = s(&["/usr/bin/java", "-cp", "/t/android-studio/lib/x.jar"]);
        assert!(matches_signature(&cmd, &s(&["java", "/t/android-studio"])));
        assert!(!matches_signature(&cmd, &s(&["java", "/t/other"])));
        assert!(!matches_signature(&[], &s(&["java"])));
        assert!(!matches_signature(&cmd, &[]));
    }

    #[tokio::test]
    async fn launched_script_is_located_and_stops_cleanly_on_sigterm() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("studio.sh");
        let ready = tmp.path().join("ready");
        std::fs::write(
            &script,
            format!(
                "trap 'exit 0' TERM\ntouch '{}'\nwhile true; do sleep 0.1; done\n",
                ready.display()
            ),
        )
        .unwrap();
        let sup = ProcessSupervisor::new(Duration::from_secs(10), Duration::from_secs(10));

        let mut child = sup
            .launch(Path::new("/bin/sh"), &[script.display().to_string()])
            .unwrap();
        let found = sup
            .locate(&[script.display().to_string()])
            .await
            .unwrap();
        assert_eq!(Some(found.pid), child.id());
        while !ready.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        sup.terminate(found.pid).unwrap();
        assert_eq!(sup.wait_for_exit(&mut child).await.unwrap(), 0);
        sup.wait_for_pid_exit(found.pid).await.unwrap();
    }

    #[tokio::test]
    async fn locate_gives_up_after_the_window() {
        let sup = ProcessSupervisor::new(Duration::from_millis(300), Duration::from_secs(1));
        let err = sup
            .locate(&s(&["dtc-no-such-process-signature-7f3a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ProcessNotFound { .. }));
    }

    #[tokio::test]
    async fn killed_child_reports_128_plus_signal() {
        let sup = ProcessSupervisor::new(Duration::from_secs(1), Duration::from_secs(10));
        let mut child = sup
            .launch(Path::new("/bin/sh"), &s(&["-c", "sleep 30"]))
            .unwrap();
        let pid = child.id().unwrap();
        sup.terminate(pid).unwrap();
        assert_eq!(sup.wait_for_exit(&mut child).await.unwrap(), 128 + Signal::SIGTERM as i32);
    }

    #[tokio::test]
    async fn stuck_child_times_out() {
        let sup = ProcessSupervisor::new(Duration::from_secs(1), Duration::from_millis(200));
        let mut child = sup
            .launch(Path::new("/bin/sh"), &s(&["-c", "trap '' TERM; sleep 5"]))
            .unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        sup.terminate(pid).unwrap();
        let err = sup.wait_for_exit(&mut child).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Timeout { .. }));
    }
}
