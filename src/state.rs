//! Persistent record of the last confirmed deployment.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::aggregator::SourceSummary;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DeployRecord {
    pub last_deploy: Option<DateTime<Utc>>,
    pub device: Option<String>,
    /// Hex SHA-256 of the artifact the device confirmed
    pub artifact_sha256: Option<String>,
    pub route_count: usize,
    #[serde(default)]
    pub sources: Vec<SourceStats>,
}

/// Statistics for a single source at the time of the deployment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceStats {
    pub name: String,
    pub entries: usize,
    pub blocks: usize,
}

impl From<&SourceSummary> for SourceStats {
    fn from(s: &SourceSummary) -> Self {
        Self {
            name: s.id.clone(),
            entries: s.entries,
            blocks: s.blocks,
        }
    }
}

impl DeployRecord {
    /// Load state, or the empty state when the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read state file {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Corrupt state file {:?}", path))
    }

    /// Save atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent_dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent_dir)?;

        let content = serde_json::to_string_pretty(self)?;
        let mut temp_file =
            NamedTempFile::new_in(parent_dir).context("Failed to create temporary state file")?;
        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;
        temp_file
            .persist(path)
            .with_context(|| format!("Failed to persist state file {:?}", path))?;
        Ok(())
    }

    /// Record a confirmed deployment.
    pub fn record(&mut self, device: &str, sha256: &str, route_count: usize, sources: &[SourceSummary]) {
        self.last_deploy = Some(Utc::now());
        self.device = Some(device.to_string());
        self.artifact_sha256 = Some(sha256.to_string());
        self.route_count = route_count;
        self.sources = sources.iter().map(SourceStats::from).collect();
    }

    /// True when `sha256` is what `device` last confirmed.
    pub fn is_unchanged(&self, device: &str, sha256: &str) -> bool {
        self.device.as_deref() == Some(device) && self.artifact_sha256.as_deref() == Some(sha256)
    }
}
