// devtools-center
// Library entry point: logging, wiring of the installer core, and the CLI actions

pub mod config;
pub mod error;
pub mod installation;
pub mod licensing;
pub mod models;
pub mod prompt;
pub mod security;
pub mod supervisor;
pub mod utils;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use config::Settings;
use error::InstallError;
use installation::extract::ArchiveExtractor;
use installation::fetch::HttpFetcher;
use installation::launcher::DesktopLauncherRegistrar;
use installation::orchestrator::Orchestrator;
use installation::session::{AbortReason, SessionOutcome};
use models::catalog::{Catalog, FrameworkDescriptor};
use models::state::JsonStateStore;
use prompt::Prompter;
use supervisor::ProcessSupervisor;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
/// 128 + SIGINT, like a shell.
pub const EXIT_INTERRUPTED: i32 = 130;

fn format_human(out: fern::FormatCallback, message: &std::fmt::Arguments, record: &log::Record) {
    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let message_str = format!("{}", message);
    let (phase, step, cleaned_message) = utils::logging::parse_log_metadata(&message_str);
    let txt_line = utils::logging::format_human_readable_log(
        &timestamp_local.to_string(),
        record.level(),
        record.target(),
        &cleaned_message,
        phase.as_deref(),
        step.as_deref(),
    );
    out.finish(format_args!("{}", txt_line));
}

/// Initialize logging with dual format (JSON + human-readable), one pair of files per run.
///
/// `verbose` also mirrors the human-readable lines to stderr.
pub fn init_logging(log_dir: &Path, verbose: bool, session_id: &str) -> Result<PathBuf> {
    let log_dir = utils::path_resolver::resolve_log_folder(log_dir)?;
    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");

    // JSON log file for structured parsing
    let json_log_file = log_dir.join(format!("devtools-center-{}.log", timestamp));
    // Human-readable log file (.txt)
    let txt_log_file = log_dir.join(format!("devtools-center-{}.txt", timestamp));

    let mut dispatch = fern::Dispatch::new()
        .level(log::LevelFilter::Debug)
        // Dependencies are chatty at debug level.
        .level_for("reqwest", log::LevelFilter::Info)
        .level_for("hyper", log::LevelFilter::Info)
        .level_for("hyper_util", log::LevelFilter::Info);

    if verbose {
        dispatch = dispatch.chain(fern::Dispatch::new().format(format_human).chain(std::io::stderr()));
    }

    let session = session_id.to_string();
    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                        Some(&session),
                    );
                    out.finish(format_args!("{}", json_line));
                })
                .chain(fern::log_file(&json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(format_human)
                .chain(fern::log_file(&txt_log_file)?),
        );

    dispatch.apply().context("Logger already initialized")?;

    info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(log_dir)
}

/// Cancel `cancel` on the first SIGINT or SIGTERM.
pub fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(t), Ok(i)) => (t, i),
                (Err(e), _) | (_, Err(e)) => {
                    error!(
                        "[PHASE: initialization] [STEP: signals] Failed to install signal handlers: {}",
                        e
                    );
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                warn!("[PHASE: shutdown] [STEP: signal] Received SIGTERM, cancelling");
            }
            _ = sigint.recv() => {
                warn!("[PHASE: shutdown] [STEP: signal] Received SIGINT, cancelling");
            }
        }
        cancel.cancel();
    });
}

/// Wire the orchestrator with the production collaborators.
pub fn build_orchestrator(settings: &Settings, cancel: CancellationToken) -> Result<Orchestrator> {
    let store = Arc::new(JsonStateStore::new(settings.state_file()));
    let fetcher = Arc::new(HttpFetcher::new(settings.download_retries, true)?);
    let extractor = Arc::new(ArchiveExtractor::new(settings.extract_timeout()));
    let registrar = Arc::new(DesktopLauncherRegistrar::new(
        settings.applications_dir.clone(),
        settings.state_dir.join("favorites.json"),
        settings.pin_with_gsettings,
    ));
    Ok(Orchestrator::new(
        settings.clone(),
        store,
        fetcher,
        extractor,
        registrar,
        cancel,
    ))
}

/// Split the optional positionals after `<category>` into framework id and custom path.
///
/// A second positional that isn't a framework of the category is the custom path,
/// unless a third positional follows it.
pub fn split_positionals(
    catalog: &Catalog,
    category: &str,
    second: Option<String>,
    third: Option<String>,
) -> (Option<String>, Option<String>) {
    match (second, third) {
        (Some(s), None) if !catalog.is_framework(category, &s) => (None, Some(s)),
        (s, t) => (s, t),
    }
}

pub fn exit_code_for(outcome: &SessionOutcome) -> i32 {
    match outcome {
        SessionOutcome::Done(_) => EXIT_OK,
        SessionOutcome::Aborted { reason, .. } => match reason {
            AbortReason::Declined => EXIT_OK,
            AbortReason::Interrupted => EXIT_INTERRUPTED,
            AbortReason::Failed(_) => EXIT_FAILURE,
        },
    }
}

fn report_error(prompter: &dyn Prompter, err: &InstallError) -> i32 {
    error!("[PHASE: cli] [STEP: error] {}", err);
    prompter.warn(&err.to_string());
    match err {
        InstallError::Interrupted => EXIT_INTERRUPTED,
        _ => EXIT_FAILURE,
    }
}

pub async fn run_install(
    orchestrator: &Orchestrator,
    prompter: &dyn Prompter,
    framework: &FrameworkDescriptor,
    custom_path: Option<String>,
) -> i32 {
    match orchestrator.install(prompter, framework, custom_path).await {
        Ok(outcome) => exit_code_for(&outcome),
        Err(e) => report_error(prompter, &e),
    }
}

pub async fn run_remove(
    orchestrator: &Orchestrator,
    prompter: &dyn Prompter,
    framework: &FrameworkDescriptor,
) -> i32 {
    match orchestrator.remove(prompter, framework).await {
        Ok(_) => EXIT_OK,
        Err(e) => report_error(prompter, &e),
    }
}

/// One line per installed framework of `category`: id, path, install time.
pub async fn list_lines(orchestrator: &Orchestrator, category: &str) -> Result<Vec<String>, InstallError> {
    Ok(orchestrator
        .installed(Some(category))
        .await?
        .into_iter()
        .map(|r| {
            format!(
                "{}\t{}\t{}",
                r.framework_id,
                r.install_path.display(),
                r.installed_at
            )
        })
        .collect())
}

pub async fn run_list(orchestrator: &Orchestrator, prompter: &dyn Prompter, category: &str) -> i32 {
    match list_lines(orchestrator, category).await {
        Ok(lines) if lines.is_empty() => {
            prompter.say(&format!("Nothing installed in {}", category));
            EXIT_OK
        }
        Ok(lines) => {
            for line in lines {
                prompter.say(&line);
            }
            EXIT_OK
        }
        Err(e) => report_error(prompter, &e),
    }
}

/// Launch the installed framework and supervise it until it exits. A cancellation
/// (Ctrl-C, SIGTERM) is forwarded as SIGTERM to the located application process.
pub async fn run_launch(
    orchestrator: &Orchestrator,
    settings: &Settings,
    prompter: &dyn Prompter,
    framework: &FrameworkDescriptor,
    cancel: CancellationToken,
) -> i32 {
    let record = match orchestrator.installed_record(framework).await {
        Ok(r) => r,
        Err(e) => return report_error(prompter, &e),
    };
    let sup = ProcessSupervisor::new(settings.launch_locate_window(), settings.stop_timeout());
    let exe = framework.executable(&record.install_path);

    let mut child = match sup.launch(&exe, &[]) {
        Ok(c) => c,
        Err(e) => {
            prompter.warn(&e.to_string());
            return EXIT_FAILURE;
        }
    };
    let signature = framework.process_signature_for(&record.install_path);
    let located = match sup.locate(&signature).await {
        Ok(p) => p,
        Err(e) => {
            prompter.warn(&e.to_string());
            return EXIT_FAILURE;
        }
    };

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                info!("[PHASE: launch] [STEP: wait] {} exited ({})", framework.id, status);
                supervisor::exit_code(status)
            }
            Err(e) => {
                prompter.warn(&format!("Failed to wait for {}: {}", framework.name, e));
                EXIT_FAILURE
            }
        },
        _ = cancel.cancelled() => {
            if let Err(e) = sup.terminate(located.pid) {
                prompter.warn(&e.to_string());
                return EXIT_FAILURE;
            }
            if child.id() != Some(located.pid) {
                if let Err(e) = sup.wait_for_pid_exit(located.pid).await {
                    prompter.warn(&e.to_string());
                    return EXIT_FAILURE;
                }
            }
            match sup.wait_for_exit(&mut child).await {
                Ok(code) => code,
                Err(e) => {
                    prompter.warn(&e.to_string());
                    EXIT_FAILURE
                }
            }
        }
    }
}
