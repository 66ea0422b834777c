// Desktop launcher registration
//
// A launcher is a freedesktop `.desktop` entry in the applications directory plus its
// "pinned" state. Pinned state lives in a JSON favorites file owned by this crate and,
// when enabled, is mirrored into the GNOME shell favorites through `gsettings`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tokio::time::Duration;

use super::files;
use crate::installation::run_command;
use crate::models::catalog::FrameworkDescriptor;

const GSETTINGS_SCHEMA: &str = "org.gnome.shell";
const GSETTINGS_KEY: &str = "favorite-apps";

/// Everything needed to (re)create a launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherSpec {
    /// Desktop id, e.g. `android-studio.desktop`.
    pub id: String,
    pub name: String,
    pub comment: Option<String>,
    pub exec: PathBuf,
    pub icon: Option<PathBuf>,
    pub categories: Vec<String>,
    pub wm_class: Option<String>,
}

impl LauncherSpec {
    pub fn for_framework(framework: &FrameworkDescriptor, install_path: &Path) -> Self {
        LauncherSpec {
            id: framework.launcher_id(),
            name: framework.name.clone(),
            comment: framework.description.clone(),
            exec: framework.executable(install_path),
            icon: framework.icon_path(install_path),
            categories: framework.desktop_categories.clone(),
            wm_class: framework.wm_class.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherHandle {
    pub id: String,
    pub path: PathBuf,
}

#[async_trait]
pub trait LauncherRegistrar: Send + Sync {
    /// Create the launcher and pin it. On error nothing of the new launcher is left.
    async fn register(&self, spec: &LauncherSpec) -> Result<LauncherHandle>;

    /// Unpin and delete. Unknown ids are not an error.
    async fn unregister(&self, id: &str) -> Result<()>;

    /// True when the launcher exists and is pinned.
    async fn is_registered(&self, id: &str) -> Result<bool>;
}

// ============================================================================
// Desktop entry generation (pure functions)
// ============================================================================

/// Single-line value for a desktop entry key.
fn entry_value(s: &str) -> String {
    s.replace(['\n', '\r'], " ")
}

/// Quote one Exec argument per the desktop entry spec.
///
/// Unquoted when no reserved character is present. Inside quotes `"`, `` ` ``, `$` and
/// `\` are backslash-escaped, and the string-level escape doubles every backslash.
fn quote_exec_arg(arg: &str) -> String {
    const RESERVED: &[char] = &[
        ' ', '\t', '\n', '"', '\'', '\\', '>', '<', '~', '|', '&', ';', '$', '*', '?', '#', '(',
        ')', '`',
    ];
    let arg = arg.replace('%', "%%");
    if !arg.contains(RESERVED) {
        return arg;
    }
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for c in arg.chars() {
        match c {
            '\\' => out.push_str("\\\\\\\\"),
            '"' | '`' | '$' => {
                out.push_str("\\\\");
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Build the `.desktop` file text for a launcher.
pub fn build_desktop_entry_text(spec: &LauncherSpec) -> String {
    let exec = quote_exec_arg(&spec.exec.to_string_lossy());
    let mut text = String::from("[Desktop Entry]\nVersion=1.0\nType=Application\n");
    text.push_str(&format!("Name={}\n", entry_value(&spec.name)));
    if let Some(icon) = &spec.icon {
        text.push_str(&format!("Icon={}\n", entry_value(&icon.to_string_lossy())));
    }
    text.push_str(&format!("Exec={} %f\n", exec));
    if let Some(comment) = &spec.comment {
        text.push_str(&format!("Comment={}\n", entry_value(comment)));
    }
    if !spec.categories.is_empty() {
        text.push_str(&format!("Categories={};\n", spec.categories.join(";")));
    }
    text.push_str("Terminal=false\n");
    if let Some(wm_class) = &spec.wm_class {
        text.push_str(&format!("StartupWMClass={}\n", entry_value(wm_class)));
    }
    text
}

/// Parse `gsettings get org.gnome.shell favorite-apps` output.
pub fn parse_gsettings_list(raw: &str) -> Vec<String> {
    let s = raw.trim();
    let s = s.strip_prefix("@as").map(str::trim).unwrap_or(s);
    let inner = s
        .strip_prefix('[')
        .and_then(|x| x.strip_suffix(']'))
        .unwrap_or("");
    inner
        .split(',')
        .map(|item| item.trim().trim_matches(|c| c == '\'' || c == '"').to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Format a favorites list the way `gsettings set` expects.
pub fn format_gsettings_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|i| format!("'{}'", i)).collect();
    format!("[{}]", quoted.join(", "))
}

// ============================================================================
// Desktop registrar
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct Favorites {
    favorites: Vec<String>,
}

pub struct DesktopLauncherRegistrar {
    applications_dir: PathBuf,
    favorites_file: PathBuf,
    use_gsettings: bool,
    /// Overrides the `gsettings` found on PATH.
    gsettings_program: Option<PathBuf>,
    guard: Mutex<()>,
}

impl DesktopLauncherRegistrar {
    pub fn new(applications_dir: PathBuf, favorites_file: PathBuf, use_gsettings: bool) -> Self {
        Self {
            applications_dir,
            favorites_file,
            use_gsettings,
            gsettings_program: None,
            guard: Mutex::new(()),
        }
    }

    /// Mirror pins through `program` instead of looking up `gsettings` on PATH.
    pub fn with_gsettings_program(mut self, program: PathBuf) -> Self {
        self.use_gsettings = true;
        self.gsettings_program = Some(program);
        self
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.applications_dir.join(id)
    }

    async fn load_favorites(&self) -> Result<Favorites> {
        match tokio::fs::read_to_string(&self.favorites_file).await {
            Ok(text) if text.trim().is_empty() => Ok(Favorites::default()),
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("Favorites file {:?} is corrupt", self.favorites_file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Favorites::default()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to read {:?}", self.favorites_file))),
        }
    }

    async fn save_favorites(&self, favs: &Favorites) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(favs).context("Failed to encode favorites")?;
        files::write_file_atomic(&self.favorites_file, &bytes, "favorites").await
    }

    async fn set_pinned(&self, id: &str, pinned: bool) -> Result<()> {
        let mut favs = self.load_favorites().await?;
        let present = favs.favorites.iter().any(|f| f == id);
        match (pinned, present) {
            (true, false) => favs.favorites.push(id.to_string()),
            (false, true) => favs.favorites.retain(|f| f != id),
            _ => return Ok(()),
        }
        self.save_favorites(&favs).await
    }

    /// Mirror the pin into the desktop shell. Best-effort: the favorites file is the record.
    async fn mirror_to_gsettings(&self, id: &str, pinned: bool) {
        if !self.use_gsettings {
            return;
        }
        let program = match &self.gsettings_program {
            Some(p) => p.clone(),
            None => match which::which("gsettings") {
                Ok(p) => p,
                Err(_) => {
                    debug!("[PHASE: installation] [STEP: launcher] gsettings not on PATH; skipping shell favorites");
                    return;
                }
            },
        };
        if let Err(e) = update_gsettings_favorites(&program, id, pinned).await {
            warn!(
                "[PHASE: installation] [STEP: launcher] Failed to update shell favorites for {}: {:#}",
                id, e
            );
        }
    }
}

async fn update_gsettings_favorites(program: &Path, id: &str, pinned: bool) -> Result<()> {
    let timeout = Duration::from_secs(10);
    let out = run_command(
        program,
        &["get".into(), GSETTINGS_SCHEMA.into(), GSETTINGS_KEY.into()],
        timeout,
        "gsettings_get_favorites",
    )
    .await?;
    if !out.success() {
        return Err(anyhow::anyhow!("gsettings get failed: {}", out.stderr.trim()));
    }

    let mut items = parse_gsettings_list(&out.stdout);
    let present = items.iter().any(|i| i == id);
    match (pinned, present) {
        (true, false) => items.push(id.to_string()),
        (false, true) => items.retain(|i| i != id),
        _ => return Ok(()),
    }

    let out = run_command(
        program,
        &[
            "set".into(),
            GSETTINGS_SCHEMA.into(),
            GSETTINGS_KEY.into(),
            format_gsettings_list(&items),
        ],
        timeout,
        "gsettings_set_favorites",
    )
    .await?;
    if !out.success() {
        return Err(anyhow::anyhow!("gsettings set failed: {}", out.stderr.trim()));
    }
    Ok(())
}

#[async_trait]
impl LauncherRegistrar for DesktopLauncherRegistrar {
    async fn register(&self, spec: &LauncherSpec) -> Result<LauncherHandle> {
        let _g = self.guard.lock().await;
        let path = self.entry_path(&spec.id);
        let text = build_desktop_entry_text(spec);

        files::write_file_atomic(&path, text.as_bytes(), "desktop_entry")
            .await
            .with_context(|| format!("Failed to write launcher {:?}", path))?;

        if let Err(e) = self.set_pinned(&spec.id, true).await {
            if let Err(cleanup) = files::remove_file_idempotent(&path, "desktop_entry").await {
                warn!(
                    "[PHASE: installation] [STEP: launcher] Failed to delete unpinned launcher {:?}: {:#}",
                    path, cleanup
                );
            }
            return Err(e.context(format!("Failed to pin launcher {}", spec.id)));
        }
        self.mirror_to_gsettings(&spec.id, true).await;

        info!(
            "[PHASE: installation] [STEP: launcher] Registered and pinned {} ({:?})",
            spec.id, path
        );
        Ok(LauncherHandle {
            id: spec.id.clone(),
            path,
        })
    }

    async fn unregister(&self, id: &str) -> Result<()> {
        let _g = self.guard.lock().await;
        self.set_pinned(id, false)
            .await
            .with_context(|| format!("Failed to unpin launcher {}", id))?;
        self.mirror_to_gsettings(id, false).await;
        files::remove_file_idempotent(&self.entry_path(id), "desktop_entry").await?;
        info!("[PHASE: installation] [STEP: launcher] Unregistered {}", id);
        Ok(())
    }

    async fn is_registered(&self, id: &str) -> Result<bool> {
        let _g = self.guard.lock().await;
        if tokio::fs::metadata(self.entry_path(id)).await.is_err() {
            return Ok(false);
        }
        Ok(self.load_favorites().await?.favorites.iter().any(|f| f == id))
    }
}
