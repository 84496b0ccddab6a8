use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Where the orchestrator keeps its configuration, data and logs.
#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self> {
        let project_dirs = ProjectDirs::from("ai", "valechat", "ai-orchestrator")
            .ok_or_else(|| Error::platform("Failed to determine application directories"))?;

        Ok(Self {
            config_dir: project_dirs.config_dir().to_path_buf(),
            data_dir: project_dirs.data_dir().to_path_buf(),
        })
    }

    /// Everything under one base directory: `<base>/config` and `<base>/data`.
    pub fn with_base_dir(base: &Path) -> Self {
        Self {
            config_dir: base.join("config"),
            data_dir: base.join("data"),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn cost_records_file(&self) -> PathBuf {
        self.data_dir.join("costs.json")
    }

    pub fn query_log_file(&self) -> PathBuf {
        self.data_dir.join("query_log.db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn ensure_dirs_exist(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_base_dir_layout() {
        let dir = TempDir::new().unwrap();
        let paths = AppPaths::with_base_dir(dir.path());
        paths.ensure_dirs_exist().unwrap();

        assert!(paths.logs_dir().is_dir());
        assert_eq!(paths.config_file(), dir.path().join("config").join("config.toml"));
        assert_eq!(paths.cost_records_file(), dir.path().join("data").join("costs.json"));
        assert_eq!(paths.query_log_file(), dir.path().join("data").join("query_log.db"));
    }
}
