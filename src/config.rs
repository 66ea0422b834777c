// Runtime settings
//
// Layering (last wins): built-in defaults -> TOML file -> DTC_* environment variables.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "devtools-center";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Root that `{tools_root}` in catalog path templates expands to.
    pub tools_root: PathBuf,
    /// Holds `installed.json` and the per-framework lock files.
    pub state_dir: PathBuf,
    /// Downloads land here and are deleted once extracted.
    pub cache_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Where `<framework>.desktop` entries are written.
    pub applications_dir: PathBuf,
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
    pub pin_with_gsettings: bool,
    pub download_timeout_secs: u64,
    pub extract_timeout_secs: u64,
    pub launch_locate_secs: u64,
    pub stop_timeout_secs: u64,
    pub download_retries: usize,
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn lossy(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

/// `$XDG_CONFIG_HOME/devtools-center/config.toml`
pub fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"))
}

impl Settings {
    /// Load settings. An explicit file must exist; the default location is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let data = dirs::data_dir().unwrap_or_else(|| home().join(".local/share"));
        let cache = dirs::cache_dir().unwrap_or_else(|| home().join(".cache"));
        let state_dir = data.join(APP_DIR);

        let mut builder = config::Config::builder()
            .set_default("tools_root", lossy(&home().join("tools")))?
            .set_default("state_dir", lossy(&state_dir))?
            .set_default("cache_dir", lossy(&cache.join(APP_DIR)))?
            .set_default("log_dir", lossy(&state_dir.join("logs")))?
            .set_default("applications_dir", lossy(&data.join("applications")))?
            .set_default("pin_with_gsettings", false)?
            .set_default("download_timeout_secs", 1800_i64)?
            .set_default("extract_timeout_secs", 600_i64)?
            .set_default("launch_locate_secs", 60_i64)?
            .set_default("stop_timeout_secs", 60_i64)?
            .set_default("download_retries", 3_i64)?;

        match explicit {
            Some(path) => {
                builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
            }
            None => {
                if let Some(path) = default_config_file() {
                    builder = builder.add_source(config::File::from(path).required(false));
                }
            }
        }

        builder = builder.add_source(config::Environment::with_prefix("DTC").try_parsing(true));

        let settings: Settings = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        Ok(settings)
    }

    /// Self-contained settings rooted in one directory (isolated runs and tests).
    pub fn for_root(root: &Path) -> Self {
        Settings {
            tools_root: root.join("tools"),
            state_dir: root.join("state"),
            cache_dir: root.join("cache"),
            log_dir: root.join("logs"),
            applications_dir: root.join("applications"),
            catalog_path: None,
            pin_with_gsettings: false,
            download_timeout_secs: 1800,
            extract_timeout_secs: 600,
            launch_locate_secs: 60,
            stop_timeout_secs: 60,
            download_retries: 3,
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join("installed.json")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.cache_dir.join("downloads")
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    pub fn launch_locate_window(&self) -> Duration {
        Duration::from_secs(self.launch_locate_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}
