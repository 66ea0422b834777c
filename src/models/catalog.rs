// Framework catalog: categories and the frameworks they offer.
//
// Descriptors are read-only metadata; the installer core never mutates them.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::InstallError;
use crate::utils::{path_resolver, validation};

const BUILTIN_CATALOG: &str = include_str!("catalog.toml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ArchiveFormat {
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "tar.gz", alias = "tgz")]
    TarGz,
}

impl ArchiveFormat {
    /// Guess the format from a URL or file name.
    pub fn infer(name: &str) -> Option<Self> {
        let lowered = name.to_ascii_lowercase();
        let lowered = lowered.split(['?', '#']).next().unwrap_or_default();
        if lowered.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if lowered.ends_with(".tar.gz") || lowered.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSource {
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub format: Option<ArchiveFormat>,
    #[serde(default)]
    pub version: Option<String>,
}

impl DownloadSource {
    /// Last path segment of the URL (query and fragment stripped).
    pub fn file_name(&self) -> String {
        let without_query = self.url.split(['?', '#']).next().unwrap_or_default();
        without_query
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("artifact")
            .to_string()
    }

    pub fn archive_format(&self) -> Result<ArchiveFormat> {
        self.format
            .or_else(|| ArchiveFormat::infer(&self.url))
            .ok_or_else(|| anyhow::anyhow!("Can't tell the archive format of {}", self.file_name()))
    }

    /// Version marker stored in the install record.
    pub fn version_tag(&self) -> String {
        if let Some(v) = &self.version {
            return v.clone();
        }
        let name = self.file_name();
        for ext in [".tar.gz", ".tgz", ".zip"] {
            if let Some(stem) = name.strip_suffix(ext) {
                return stem.to_string();
            }
        }
        name
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameworkDescriptor {
    pub id: String,
    /// Filled from the owning category while loading.
    #[serde(default)]
    pub category_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Default install path; may contain `{tools_root}`.
    pub install_path: String,
    #[serde(default)]
    pub license_required: bool,
    #[serde(default)]
    pub license: Option<String>,
    /// Executable relative to the install root.
    pub exec: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub desktop_categories: Vec<String>,
    #[serde(default)]
    pub wm_class: Option<String>,
    /// Substrings that identify the running application in a process command line.
    #[serde(default)]
    pub process_signature: Vec<String>,
    pub download: DownloadSource,
}

impl FrameworkDescriptor {
    pub fn default_install_path(&self, tools_root: &Path) -> Result<PathBuf> {
        path_resolver::render_template(&self.install_path, tools_root)
    }

    pub fn executable(&self, install_path: &Path) -> PathBuf {
        install_path.join(&self.exec)
    }

    pub fn icon_path(&self, install_path: &Path) -> Option<PathBuf> {
        self.icon.as_ref().map(|i| install_path.join(i))
    }

    /// Desktop entry id, e.g. `android-studio.desktop`.
    pub fn launcher_id(&self) -> String {
        format!("{}.desktop", self.id)
    }

    /// Process signature with `{install_path}` filled in. Falls back to the executable.
    pub fn process_signature_for(&self, install_path: &Path) -> Vec<String> {
        if self.process_signature.is_empty() {
            return vec![self.executable(install_path).to_string_lossy().into_owned()];
        }
        let rendered = install_path.to_string_lossy();
        self.process_signature
            .iter()
            .map(|part| part.replace("{install_path}", &rendered))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub default_framework: String,
    pub frameworks: Vec<FrameworkDescriptor>,
}

impl Category {
    pub fn framework(&self, id: &str) -> Option<&FrameworkDescriptor> {
        self.frameworks.iter().find(|f| f.id == id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    pub categories: Vec<Category>,
}

impl Catalog {
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_CATALOG).context("Built-in catalog is invalid")
    }

    /// Load `path` when given, the built-in catalog otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read catalog {:?}", p))?;
                Self::from_toml_str(&text).with_context(|| format!("Invalid catalog {:?}", p))
            }
            None => Self::builtin(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut catalog: Catalog = toml::from_str(text).context("Failed to parse catalog TOML")?;
        catalog.check()?;
        for category in &mut catalog.categories {
            for framework in &mut category.frameworks {
                framework.category_id = category.id.clone();
            }
        }
        Ok(catalog)
    }

    fn check(&self) -> Result<()> {
        let mut framework_ids = HashSet::new();
        for category in &self.categories {
            validation::validate_identifier(&category.id)
                .with_context(|| format!("category '{}'", category.id))?;
            if category.framework(&category.default_framework).is_none() {
                return Err(anyhow::anyhow!(
                    "Category '{}' defaults to unknown framework '{}'",
                    category.id,
                    category.default_framework
                ));
            }
            for framework in &category.frameworks {
                validation::validate_identifier(&framework.id)
                    .with_context(|| format!("framework '{}'", framework.id))?;
                // Ids key the state file and the launcher file name.
                if !framework_ids.insert(framework.id.as_str()) {
                    return Err(anyhow::anyhow!("Duplicate framework id '{}'", framework.id));
                }
                if framework.license_required && framework.license.is_none() {
                    return Err(anyhow::anyhow!(
                        "Framework '{}' requires a license but has no license text",
                        framework.id
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn category(&self, id: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    pub fn is_framework(&self, category: &str, name: &str) -> bool {
        self.category(category)
            .and_then(|c| c.framework(name))
            .is_some()
    }

    /// Pick a framework of `category`; `None` selects the category default.
    pub fn resolve(
        &self,
        category: &str,
        framework: Option<&str>,
    ) -> std::result::Result<&FrameworkDescriptor, InstallError> {
        let cat = self
            .category(category)
            .ok_or_else(|| InstallError::UnknownCategory(category.to_string()))?;
        let wanted = framework.unwrap_or(&cat.default_framework);
        cat.framework(wanted)
            .ok_or_else(|| InstallError::UnknownFramework {
                category: category.to_string(),
                framework: wanted.to_string(),
            })
    }
}
