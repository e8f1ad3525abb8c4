//! Durable status cache: work item -> stage -> [`StageRecord`].
//!
//! Every mutation rewrites the whole JSON document. The previous copy is
//! kept as `<file>.bak` and the new one is written to a temporary sibling
//! and renamed into place, so readers only ever see a complete document.
//! The cache never outranks the disk: the reconciler overwrites it with
//! whatever the reports say.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::PipelineError;
use crate::state_machine::{Evaluation, StageStatus};

/// Key prefix of sweeper jobs.
pub const EXTRA_PREFIX: &str = "[Extra]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_sec: Option<f64>,
    #[serde(default)]
    pub duration_str: String,
    #[serde(default)]
    pub error: String,
}

impl Default for StageRecord {
    fn default() -> Self {
        Self {
            status: StageStatus::Pending,
            start_time: None,
            duration_sec: None,
            duration_str: String::new(),
            error: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Final free energy, kcal/mol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_g: Option<f64>,
    /// The geometry file this item came from is gone.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub xyz_missing: bool,
    #[serde(flatten)]
    pub stages: BTreeMap<String, StageRecord>,
}

pub struct StatusStore {
    path: PathBuf,
    data: BTreeMap<String, ItemRecord>,
}

impl StatusStore {
    /// Opens the store at `path`. A corrupt file falls back to its backup,
    /// then to an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match Self::read(&path) {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "status file unreadable, trying backup");
                Self::read(&backup_path(&path)).unwrap_or_default()
            }
        };
        Self { path, data }
    }

    /// Reads a snapshot without taking ownership of the file, for dashboards.
    pub fn read(path: &Path) -> Result<BTreeMap<String, ItemRecord>, PipelineError> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn items(&self) -> &BTreeMap<String, ItemRecord> {
        &self.data
    }

    pub fn item(&self, item: &str) -> Option<&ItemRecord> {
        self.data.get(item)
    }

    pub fn stage(&self, item: &str, stage: &str) -> Option<&StageRecord> {
        self.data.get(item)?.stages.get(stage)
    }

    /// Marks a stage RUNNING with a fresh start time.
    pub fn start(&mut self, item: &str, stage: &str) -> Result<(), PipelineError> {
        let record = self.record_mut(item, stage);
        record.status = StageStatus::Running;
        record.start_time = Some(Utc::now());
        record.duration_sec = None;
        record.duration_str.clear();
        record.error.clear();
        self.save()
    }

    /// Records a finished run. The duration is taken only on the
    /// RUNNING -> terminal edge. DONE clears the error; any other status
    /// keeps the last non-empty one.
    pub fn finish(
        &mut self,
        item: &str,
        stage: &str,
        status: StageStatus,
        error: &str,
    ) -> Result<(), PipelineError> {
        let record = self.record_mut(item, stage);
        if record.status == StageStatus::Running
            && let Some(start) = record.start_time
        {
            let secs = (Utc::now() - start).num_milliseconds().max(0) as f64 / 1000.0;
            record.duration_sec = Some(secs);
            record.duration_str = format_duration(secs);
        }
        record.status = status;
        if status == StageStatus::Done {
            record.error.clear();
        } else if !error.is_empty() {
            record.error = error.to_string();
        }
        self.save()
    }

    /// Brings the cached record in line with a status derived from disk.
    /// Writes only when something changed; returns whether it did.
    pub fn sync(
        &mut self,
        item: &str,
        stage: &str,
        eval: &Evaluation,
    ) -> Result<bool, PipelineError> {
        let status = match eval.status {
            StageStatus::Missing => StageStatus::Pending,
            other => other,
        };
        if let Some(record) = self.stage(item, stage)
            && record.status == status
            && (status == StageStatus::Pending || record.error == eval.error)
        {
            return Ok(false);
        }
        let record = self.record_mut(item, stage);
        record.status = status;
        if status == StageStatus::Pending {
            record.start_time = None;
            record.duration_sec = None;
            record.duration_str.clear();
        }
        record.error = eval.error.clone();
        self.save()?;
        Ok(true)
    }

    pub fn set_result(&mut self, item: &str, g_kcal: f64) -> Result<(), PipelineError> {
        self.data.entry(item.to_string()).or_default().result_g = Some(g_kcal);
        self.save()
    }

    pub fn clear_result(&mut self, item: &str) -> Result<(), PipelineError> {
        match self.data.get_mut(item) {
            Some(record) if record.result_g.is_some() => {
                record.result_g = None;
                self.save()
            }
            _ => Ok(()),
        }
    }

    /// Forgets downstream state after an upstream rerun.
    pub fn reset_stages(&mut self, item: &str, stages: &[&str]) -> Result<(), PipelineError> {
        let Some(record) = self.data.get_mut(item) else {
            return Ok(());
        };
        let before = record.clone();
        for stage in stages {
            record.stages.remove(*stage);
        }
        record.result_g = None;
        if *record != before {
            self.save()?;
        }
        Ok(())
    }

    pub fn set_source_missing(&mut self, item: &str, missing: bool) -> Result<(), PipelineError> {
        let Some(record) = self.data.get_mut(item) else {
            return Ok(());
        };
        if record.xyz_missing == missing {
            return Ok(());
        }
        record.xyz_missing = missing;
        self.save()
    }

    pub fn remove_stage(&mut self, item: &str, stage: &str) -> Result<(), PipelineError> {
        let Some(record) = self.data.get_mut(item) else {
            return Ok(());
        };
        if record.stages.remove(stage).is_none() {
            return Ok(());
        }
        if record.stages.is_empty() && record.result_g.is_none() {
            self.data.remove(item);
        }
        self.save()
    }

    fn record_mut(&mut self, item: &str, stage: &str) -> &mut StageRecord {
        self.data
            .entry(item.to_string())
            .or_default()
            .stages
            .entry(stage.to_string())
            .or_default()
    }

    fn save(&self) -> Result<(), PipelineError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        if self.path.exists()
            && let Err(e) = fs::copy(&self.path, backup_path(&self.path))
        {
            warn!(error = %e, "could not back up status file");
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&self.data)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// `1h 2m 3s` style, dropping leading zero units.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let (h, m, s) = (total / 3600, (total / 60) % 60, total % 60);
    let mut parts = Vec::new();
    if h > 0 {
        parts.push(format!("{h}h"));
    }
    if m > 0 {
        parts.push(format!("{m}m"));
    }
    parts.push(format!("{s}s"));
    parts.join(" ")
}
