// Shared fixtures for unit tests: small generated archives and an isolated install
// environment (settings, JSON store, desktop registrar) rooted in a temp directory.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::installation::extract::{ArchiveExtractor, Extractor};
use crate::installation::fetch::{Fetcher, HttpFetcher};
use crate::installation::launcher::{DesktopLauncherRegistrar, LauncherRegistrar};
use crate::installation::orchestrator::Orchestrator;
use crate::models::catalog::{Catalog, FrameworkDescriptor};
use crate::models::state::{JsonStateStore, StateStore};

/// Write a zip archive; entries are `(name, content, unix mode)`.
pub fn write_zip(path: &Path, entries: &[(&str, &str, u32)]) {
    let file = File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    for (name, content, mode) in entries {
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(*mode);
        zip.start_file(*name, options).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

/// Write a gzip-compressed tarball; entries are `(name, content, unix mode)`.
pub fn write_tar_gz(path: &Path, entries: &[(&str, &str, u32)]) {
    let file = File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, content, mode) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(*mode);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

pub const TOOL_SCRIPT: &str = "#!/bin/sh\nexit 0\n";
pub const TOOL_LICENSE: &str = "Tool license terms.";

fn catalog_toml(payload_url: &str) -> String {
    format!(
        r#"
[[categories]]
id = "devel"
name = "Development"
default_framework = "tool"

[[categories.frameworks]]
id = "tool"
name = "Tool"
description = "Test tool"
install_path = "{{tools_root}}/devel/tool"
license_required = true
license = "{license}"
exec = "bin/tool.sh"
icon = "bin/tool.png"
desktop_categories = ["Development"]
process_signature = ["{{install_path}}/bin/tool.sh"]

[categories.frameworks.download]
url = "{url}"
version = "1.0"

[[categories.frameworks]]
id = "other"
name = "Other Tool"
install_path = "{{tools_root}}/devel/other"
exec = "bin/tool.sh"

[categories.frameworks.download]
url = "{url}"
version = "2.0"
"#,
        license = TOOL_LICENSE,
        url = payload_url
    )
}

/// Isolated environment: everything lives under one temp directory.
pub struct Fixture {
    pub root: TempDir,
    pub settings: Settings,
    pub store: Arc<JsonStateStore>,
    pub registrar: Arc<DesktopLauncherRegistrar>,
    pub catalog: Catalog,
    pub cancel: CancellationToken,
}

impl Fixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let settings = Settings::for_root(root.path());

        let payload_dir = root.path().join("payload");
        std::fs::create_dir_all(&payload_dir).unwrap();
        let archive = payload_dir.join("tool-1.0.zip");
        write_zip(
            &archive,
            &[
                ("tool-1.0/bin/tool.sh", TOOL_SCRIPT, 0o755),
                ("tool-1.0/bin/tool.png", "png", 0o644),
                ("tool-1.0/README", "readme", 0o644),
            ],
        );
        let url = url::Url::from_file_path(&archive).unwrap().to_string();
        let catalog = Catalog::from_toml_str(&catalog_toml(&url)).unwrap();

        let store = Arc::new(JsonStateStore::new(settings.state_file()));
        let registrar = Arc::new(DesktopLauncherRegistrar::new(
            settings.applications_dir.clone(),
            settings.state_dir.join("favorites.json"),
            false,
        ));

        Fixture {
            root,
            settings,
            store,
            registrar,
            catalog,
            cancel: CancellationToken::new(),
        }
    }

    pub fn framework(&self, id: &str) -> FrameworkDescriptor {
        self.catalog.resolve("devel", Some(id)).unwrap().clone()
    }

    pub fn default_path(&self, id: &str) -> PathBuf {
        self.framework(id)
            .default_install_path(&self.settings.tools_root)
            .unwrap()
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(self.store.clone(), self.fetcher())
    }

    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        Arc::new(HttpFetcher::with_client(client, 0, false))
    }

    pub fn orchestrator_with(
        &self,
        store: Arc<dyn StateStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Orchestrator {
        let extractor: Arc<dyn Extractor> = Arc::new(ArchiveExtractor::new(Duration::from_secs(60)));
        let registrar: Arc<dyn LauncherRegistrar> = self.registrar.clone();
        Orchestrator::new(
            self.settings.clone(),
            store,
            fetcher,
            extractor,
            registrar,
            self.cancel.clone(),
        )
    }

    pub fn launcher_file(&self, id: &str) -> PathBuf {
        self.settings.applications_dir.join(format!("{}.desktop", id))
    }
}
