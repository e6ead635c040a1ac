//! Persisted sync record.
//!
//! The record is a plain value: operations take it by value and return the
//! updated copy, and [`StateStore`] is the only thing that touches disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::SyncError;
use crate::prefix::{Area, Family, FamilyFilter};

/// One port under protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtectedPort {
    pub port: u16,
    #[serde(default)]
    pub family: FamilyFilter,
    #[serde(default)]
    pub area: Area,
}

impl ProtectedPort {
    pub fn new(port: u16, family: FamilyFilter, area: Area) -> Self {
        Self { port, family, area }
    }
}

/// Singleton record of one installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Sorted by port, one entry per port.
    #[serde(default)]
    pub protected_ports: Vec<ProtectedPort>,
    pub update_interval_days: u32,
    /// Unix seconds of the last converged sync; 0 means never.
    #[serde(default)]
    pub last_sync_epoch: i64,
    /// Whether the recurring trigger should be installed.
    #[serde(default = "default_auto_update")]
    pub auto_update: bool,
}

fn default_auto_update() -> bool {
    true
}

impl SyncRecord {
    pub fn new(update_interval_days: u32) -> Self {
        Self {
            protected_ports: Vec::new(),
            update_interval_days,
            last_sync_epoch: 0,
            auto_update: true,
        }
    }

    /// Upsert `entry` by port and refresh the last-sync timestamp.
    pub fn add_protected_port(mut self, entry: ProtectedPort, now: i64) -> Self {
        match self.protected_ports.iter_mut().find(|p| p.port == entry.port) {
            Some(existing) => *existing = entry,
            None => {
                self.protected_ports.push(entry);
                self.protected_ports.sort_by_key(|p| p.port);
            }
        }
        self.last_sync_epoch = now;
        self
    }

    /// Drop every entry for `port`; no-op when absent.
    pub fn remove_protected_port(mut self, port: u16) -> Self {
        self.protected_ports.retain(|p| p.port != port);
        self
    }

    pub fn with_update_interval(mut self, days: u32) -> Result<Self, SyncError> {
        if days == 0 {
            return Err(SyncError::InvalidArgument(
                "update interval must be at least 1 day".to_string(),
            ));
        }
        self.update_interval_days = days;
        self.auto_update = true;
        Ok(self)
    }

    pub fn with_auto_update(mut self, enabled: bool) -> Self {
        self.auto_update = enabled;
        self
    }

    pub fn mark_synced(mut self, now: i64) -> Self {
        self.last_sync_epoch = now;
        self
    }

    pub fn find(&self, port: u16) -> Option<&ProtectedPort> {
        self.protected_ports.iter().find(|p| p.port == port)
    }

    /// Families covered by at least one protected port, v4 first.
    pub fn families(&self) -> Vec<Family> {
        [Family::V4, Family::V6]
            .into_iter()
            .filter(|f| self.protected_ports.iter().any(|p| p.family.includes(*f)))
            .collect()
    }
}

/// Load/save pair for the JSON record file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    default_interval_days: u32,
}

impl StateStore {
    pub fn new<P: AsRef<Path>>(path: P, default_interval_days: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            default_interval_days,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record, or synthesize a default when none exists yet.
    pub fn load(&self) -> Result<SyncRecord> {
        if !self.path.exists() {
            return Ok(SyncRecord::new(self.default_interval_days));
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {:?}", self.path))?;
        let record: SyncRecord = serde_json::from_str(&content).map_err(|e| {
            SyncError::State(format!(
                "{:?} is corrupt ({}). Delete it to start from a fresh record.",
                self.path, e
            ))
        })?;

        if record.update_interval_days == 0 {
            return Err(SyncError::State(format!("{:?}: update_interval_days is 0", self.path)).into());
        }
        Ok(record)
    }

    /// Atomically replace the record file.
    pub fn save(&self, record: &SyncRecord) -> Result<()> {
        let content = serde_json::to_string_pretty(record).context("Failed to serialize state")?;

        let parent_dir = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent_dir)
            .with_context(|| format!("Failed to create state directory {:?}", parent_dir))?;
        let mut temp_file =
            NamedTempFile::new_in(parent_dir).context("Failed to create temporary file for state")?;

        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;
        temp_file
            .persist(&self.path)
            .with_context(|| format!("Failed to persist state file: {:?}", self.path))?;

        Ok(())
    }
}
