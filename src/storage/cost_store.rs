use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::cost_tracker::CostRecord;

/// Durable home for cost records. The tracker always hands over the full,
/// already-capped record list.
#[async_trait]
pub trait CostStore: Send + Sync {
    async fn load(&self) -> Result<Vec<CostRecord>>;

    async fn save(&self, records: &[CostRecord]) -> Result<()>;
}

/// JSON array on disk, replaced atomically on every save.
pub struct JsonFileCostStore {
    path: PathBuf,
}

impl JsonFileCostStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "costs.json".into());
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling(".tmp")
    }

    /// Where an unreadable record file is moved so the next save cannot
    /// overwrite it.
    pub fn corrupt_path(&self) -> PathBuf {
        self.sibling(".corrupt")
    }
}

#[async_trait]
impl CostStore for JsonFileCostStore {
    async fn load(&self) -> Result<Vec<CostRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => Ok(Vec::new()),
            Ok(bytes) => match serde_json::from_slice::<Vec<CostRecord>>(&bytes) {
                Ok(records) => {
                    debug!("Loaded {} cost records from {:?}", records.len(), self.path);
                    Ok(records)
                }
                Err(e) => {
                    let aside = self.corrupt_path();
                    tokio::fs::rename(&self.path, &aside).await?;
                    warn!(
                        "Cost records in {:?} are unreadable ({}), moved to {:?}",
                        self.path, e, aside
                    );
                    Ok(Vec::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, records: &[CostRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(records)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        debug!("Saved {} cost records to {:?}", records.len(), self.path);
        Ok(())
    }
}

/// Keeps the last saved snapshot in memory.
#[derive(Default)]
pub struct MemoryCostStore {
    records: Mutex<Vec<CostRecord>>,
    saves: Mutex<usize>,
}

impl MemoryCostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<CostRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            saves: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> Vec<CostRecord> {
        self.records.lock().clone()
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

#[async_trait]
impl CostStore for MemoryCostStore {
    async fn load(&self) -> Result<Vec<CostRecord>> {
        Ok(self.records.lock().clone())
    }

    async fn save(&self, records: &[CostRecord]) -> Result<()> {
        *self.records.lock() = records.to_vec();
        *self.saves.lock() += 1;
        Ok(())
    }
}
