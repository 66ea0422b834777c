// Persisted install record

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One installed framework. Unique per framework id and per install path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRecord {
    pub framework_id: String,
    pub category_id: String,
    pub install_path: PathBuf,
    /// RFC 3339
    pub installed_at: String,
    pub version_tag: String,
    /// Desktop entry id of the launcher, e.g. `android-studio.desktop`.
    pub launcher_id: String,
}

impl InstallRecord {
    pub fn new(
        framework_id: impl Into<String>,
        category_id: impl Into<String>,
        install_path: PathBuf,
        version_tag: impl Into<String>,
        launcher_id: impl Into<String>,
    ) -> Self {
        InstallRecord {
            framework_id: framework_id.into(),
            category_id: category_id.into(),
            install_path,
            installed_at: chrono::Utc::now().to_rfc3339(),
            version_tag: version_tag.into(),
            launcher_id: launcher_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_camel_case_keys() {
        let r = InstallRecord::new(
            "android-studio",
            "android",
            PathBuf::from("/t/android-studio"),
            "2024.1",
            "android-studio.desktop",
        );
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["frameworkId"], "android-studio");
        assert_eq!(v["installPath"], "/t/android-studio");
        assert!(chrono::DateTime::parse_from_rfc3339(v["installedAt"].as_str().unwrap()).is_ok());
    }
}
