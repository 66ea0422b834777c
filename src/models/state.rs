// Installed-state stores
//
// The store is the only owner of InstallRecords. Writes are crash-consistent: the JSON
// file is replaced through a temp file + rename, never edited in place.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::record::InstallRecord;
use crate::installation::files;

type RecordMap = BTreeMap<String, InstallRecord>;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, framework_id: &str) -> Result<Option<InstallRecord>>;

    /// Insert or replace the record for `record.framework_id`.
    ///
    /// Refuses a record whose install path is already recorded for another framework.
    async fn put(&self, record: InstallRecord) -> Result<()>;

    /// Remove and return the record. Removing an absent record is not an error.
    async fn remove(&self, framework_id: &str) -> Result<Option<InstallRecord>>;

    /// All records, ordered by framework id.
    async fn list(&self) -> Result<Vec<InstallRecord>>;
}

fn ensure_path_unique(records: &RecordMap, record: &InstallRecord) -> Result<()> {
    if let Some(other) = records.values().find(|r| {
        r.framework_id != record.framework_id && r.install_path == record.install_path
    }) {
        return Err(anyhow::anyhow!(
            "{} is already recorded as the install path of {}",
            record.install_path.display(),
            other.framework_id
        ));
    }
    Ok(())
}

// ============================================================================
// JSON file store
// ============================================================================

/// `installed.json`: a JSON object keyed by framework id.
pub struct JsonStateStore {
    path: PathBuf,
    // Serializes read-modify-write cycles inside this process; cross-process exclusion
    // comes from the per-framework lock.
    guard: Mutex<()>,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonStateStore {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<RecordMap> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RecordMap::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to read installed state {:?}", self.path)))
            }
        };
        if text.trim().is_empty() {
            return Ok(RecordMap::new());
        }
        serde_json::from_str(&text)
            .with_context(|| format!("Installed state {:?} is corrupt", self.path))
    }

    async fn save(&self, records: &RecordMap) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(records).context("Failed to encode installed state")?;
        files::write_file_atomic(&self.path, &bytes, "installed_state").await?;
        debug!(
            "[PHASE: state] [STEP: save] Wrote {} record(s) to {:?}",
            records.len(),
            self.path
        );
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn get(&self, framework_id: &str) -> Result<Option<InstallRecord>> {
        let _g = self.guard.lock().await;
        Ok(self.load().await?.remove(framework_id))
    }

    async fn put(&self, record: InstallRecord) -> Result<()> {
        let _g = self.guard.lock().await;
        let mut records = self.load().await?;
        ensure_path_unique(&records, &record)?;
        let id = record.framework_id.clone();
        records.insert(id.clone(), record);
        self.save(&records).await?;
        info!("[PHASE: state] [STEP: put] Recorded {} as installed", id);
        Ok(())
    }

    async fn remove(&self, framework_id: &str) -> Result<Option<InstallRecord>> {
        let _g = self.guard.lock().await;
        let mut records = self.load().await?;
        let removed = records.remove(framework_id);
        if removed.is_some() {
            self.save(&records).await?;
            info!("[PHASE: state] [STEP: remove] Removed record of {}", framework_id);
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<InstallRecord>> {
        let _g = self.guard.lock().await;
        Ok(self.load().await?.into_values().collect())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<RecordMap>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, framework_id: &str) -> Result<Option<InstallRecord>> {
        Ok(self.inner.lock().await.get(framework_id).cloned())
    }

    async fn put(&self, record: InstallRecord) -> Result<()> {
        let mut records = self.inner.lock().await;
        ensure_path_unique(&records, &record)?;
        records.insert(record.framework_id.clone(), record);
        Ok(())
    }

    async fn remove(&self, framework_id: &str) -> Result<Option<InstallRecord>> {
        Ok(self.inner.lock().await.remove(framework_id))
    }

    async fn list(&self) -> Result<Vec<InstallRecord>> {
        Ok(self.inner.lock().await.values().cloned().collect())
    }
}
