// devtools-center CLI
//
//   devtools-center [OPTIONS] <category> [<framework>] [<path>]
//
// Exit codes: 0 done or declined, 1 failure, 130 interrupted.

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use devtools_center::config::Settings;
use devtools_center::models::catalog::Catalog;
use devtools_center::prompt::TerminalPrompter;
use devtools_center::{
    build_orchestrator, init_logging, run_install, run_launch, run_list, run_remove,
    spawn_signal_listener, split_positionals, EXIT_FAILURE,
};

#[derive(Parser, Debug)]
#[command(name = "devtools-center", version, about = "Install and manage developer tools")]
struct Cli {
    /// Framework category, e.g. `android`
    category: String,

    /// Framework id (the category default when omitted), or the installation path
    framework: Option<String>,

    /// Installation path; skips the path question
    path: Option<String>,

    /// Remove the framework instead of installing it
    #[arg(short, long, conflicts_with_all = ["list", "launch"])]
    remove: bool,

    /// List installed frameworks of the category
    #[arg(short, long, conflicts_with = "launch")]
    list: bool,

    /// Launch the installed framework and supervise it
    #[arg(long)]
    launch: bool,

    /// Mirror logs to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: $XDG_CONFIG_HOME/devtools-center/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let settings = Settings::load(cli.config.as_deref())?;
    let session_id = uuid::Uuid::new_v4().simple().to_string();
    if let Err(e) = init_logging(&settings.log_dir, cli.verbose, &session_id) {
        eprintln!("Failed to initialize logging: {:#}", e);
    }
    info!(
        "[PHASE: initialization] devtools-center {} starting (session={})",
        env!("CARGO_PKG_VERSION"),
        session_id
    );

    let catalog = Catalog::load(settings.catalog_path.as_deref())?;
    if catalog.category(&cli.category).is_none() {
        eprintln!("No category named '{}'", cli.category);
        return Ok(EXIT_FAILURE);
    }
    let (framework_id, custom_path) =
        split_positionals(&catalog, &cli.category, cli.framework, cli.path);
    let framework = match catalog.resolve(&cli.category, framework_id.as_deref()) {
        Ok(f) => f.clone(),
        Err(e) => {
            error!("[PHASE: initialization] {}", e);
            eprintln!("{}", e);
            return Ok(EXIT_FAILURE);
        }
    };
    if custom_path.is_some() && (cli.remove || cli.list || cli.launch) {
        warn!("[PHASE: initialization] Installation path ignored for this action");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let code = runtime.block_on(async {
        let cancel = CancellationToken::new();
        spawn_signal_listener(cancel.clone());
        let orchestrator = build_orchestrator(&settings, cancel.clone())?;
        let prompter = TerminalPrompter::new(cancel.clone());

        let code = if cli.list {
            run_list(&orchestrator, &prompter, &cli.category).await
        } else if cli.remove {
            run_remove(&orchestrator, &prompter, &framework).await
        } else if cli.launch {
            run_launch(&orchestrator, &settings, &prompter, &framework, cancel).await
        } else {
            run_install(&orchestrator, &prompter, &framework, custom_path).await
        };
        Ok::<i32, anyhow::Error>(code)
    })?;

    // A prompt read may still be parked on stdin in the blocking pool.
    runtime.shutdown_timeout(Duration::from_millis(500));
    info!("[PHASE: shutdown] Exiting with code {}", code);
    Ok(code)
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("[PHASE: shutdown] {:#}", e);
            eprintln!("{:#}", e);
            EXIT_FAILURE
        }
    };
    let _ = crossterm::terminal::disable_raw_mode();
    log::logger().flush();
    std::process::exit(code);
}
