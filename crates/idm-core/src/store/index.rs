//! Global `jobs.json`: the list of known temp dirs, for startup enumeration
//! without scanning the filesystem.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const INDEX_NAME: &str = "jobs.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobIndex {
    pub temp_dirs: Vec<PathBuf>,
}

impl JobIndex {
    /// Load the index under `root`, or empty when absent/unreadable.
    /// An unreadable index only costs startup enumeration, never data.
    pub fn load(root: &Path) -> Self {
        let path = root.join(INDEX_NAME);
        match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                tracing::warn!("ignoring unreadable {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    fn save(&self, root: &Path) -> Result<()> {
        fs::create_dir_all(root)?;
        let tmp = root.join(format!("{}.tmp", INDEX_NAME));
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, root.join(INDEX_NAME))?;
        Ok(())
    }

    pub fn add(root: &Path, temp_dir: &Path) -> Result<()> {
        let mut idx = Self::load(root);
        if !idx.temp_dirs.iter().any(|d| d == temp_dir) {
            idx.temp_dirs.push(temp_dir.to_path_buf());
            idx.save(root)?;
        }
        Ok(())
    }

    pub fn remove(root: &Path, temp_dir: &Path) -> Result<()> {
        let mut idx = Self::load(root);
        let before = idx.temp_dirs.len();
        idx.temp_dirs.retain(|d| d != temp_dir);
        if idx.temp_dirs.len() != before {
            idx.save(root)?;
        }
        Ok(())
    }
}
