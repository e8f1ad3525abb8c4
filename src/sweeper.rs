//! Task sweeper: ad-hoc decks dropped anywhere under `extra_jobs/`.
//!
//! Each deck is a single job with no pipeline around it. Its store key is
//! `[Extra]{stem}` and its stage is the name of the directory holding it,
//! or `root` for decks directly under the sweeper root. The sweeper only
//! runs when the reconciler had nothing to submit.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use glob::Pattern;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::executor::JobExecutor;
use crate::process::JobControl;
use crate::state_machine::{Evaluation, JobArtifact, derive_status};
use crate::store::{EXTRA_PREFIX, StatusStore};

/// Stage name for decks sitting directly in the sweeper root.
pub const ROOT_STAGE: &str = "root";

#[derive(Debug, Clone)]
pub struct SweepJob {
    pub item: String,
    pub stage: String,
    pub artifact: JobArtifact,
}

pub struct Sweeper<'a> {
    config: &'a PipelineConfig,
    executor: JobExecutor<'a>,
    root: PathBuf,
    ignore: Vec<Pattern>,
}

impl<'a> Sweeper<'a> {
    pub fn new(config: &'a PipelineConfig, control: &'a JobControl) -> Result<Self, PipelineError> {
        let ignore = config
            .sweeper_ignore
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            config,
            executor: JobExecutor::new(config, control),
            root: config.sweeper_dir(),
            ignore,
        })
    }

    fn ignored(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        self.ignore.iter().any(|p| p.matches(&name))
    }

    fn has_extension(path: &Path, extensions: &[String]) -> bool {
        path.extension().is_some_and(|ext| {
            extensions
                .iter()
                .any(|e| e.trim_start_matches('.') == ext.to_string_lossy())
        })
    }

    fn naming(&self, path: &Path) -> (String, String) {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stage = match path.parent() {
            Some(parent) if parent != self.root => parent
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| ROOT_STAGE.to_string()),
            _ => ROOT_STAGE.to_string(),
        };
        (format!("{EXTRA_PREFIX}{stem}"), stage)
    }

    /// Every submittable deck, oldest first.
    pub fn candidates(&self) -> Vec<SweepJob> {
        let mut found: Vec<(SystemTime, PathBuf)> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| Self::has_extension(p, &self.config.input_extensions) && !self.ignored(p))
            .filter_map(|p| {
                let mtime = p.metadata().and_then(|m| m.modified()).ok()?;
                Some((mtime, p))
            })
            .collect();
        found.sort();

        found
            .into_iter()
            .map(|(_, input)| {
                let (item, stage) = self.naming(&input);
                SweepJob {
                    item,
                    stage,
                    artifact: JobArtifact::new(input, &self.config.output_extensions),
                }
            })
            .collect()
    }

    /// Submits the oldest deck that has no report yet. Returns whether an
    /// engine ran; decks that could not be started are pinned to ERROR and
    /// skipped.
    pub async fn run_once(&self, store: &mut StatusStore) -> Result<bool, PipelineError> {
        for job in self.candidates() {
            if job.artifact.has_output() {
                continue;
            }
            info!(item = %job.item, stage = %job.stage, "sweeper picked up job");
            let submission = self
                .executor
                .submit_and_wait(&job.artifact, &job.item, &job.stage, false, store)
                .await?;
            if submission.ran() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Syncs every ad-hoc record with disk and drops records whose deck and
    /// report are both gone.
    pub fn scan(&self, store: &mut StatusStore) -> Result<(), PipelineError> {
        let mut on_disk: BTreeSet<(String, String)> = BTreeSet::new();

        for job in self.candidates() {
            let eval = if job.artifact.has_output() {
                derive_status(job.artifact.output(), false)
            } else {
                Evaluation::missing()
            };
            store.sync(&job.item, &job.stage, &eval)?;
            on_disk.insert((job.item, job.stage));
        }

        // Reports whose deck was removed still keep their record alive.
        for entry in WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if entry.file_type().is_file()
                && Self::has_extension(path, &self.config.output_extensions)
            {
                on_disk.insert(self.naming(path));
            }
        }

        let stale: Vec<(String, String)> = store
            .items()
            .iter()
            .filter(|(name, _)| name.starts_with(EXTRA_PREFIX))
            .flat_map(|(name, record)| {
                record
                    .stages
                    .keys()
                    .map(move |stage| (name.clone(), stage.clone()))
            })
            .filter(|key| !on_disk.contains(key))
            .collect();

        for (item, stage) in stale {
            warn!(item = %item, stage = %stage, "ad-hoc job files gone, dropping record");
            store.remove_stage(&item, &stage)?;
        }
        Ok(())
    }
}
