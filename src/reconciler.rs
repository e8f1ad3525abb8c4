//! Pipeline reconciler and the control loop around it.
//!
//! Every cycle re-derives each work item's progress from the files under
//! `data/`, records it in the status store, and launches at most one job:
//! the first missing stage of the newest work item that has one. After a
//! submission the cycle ends, so the next one starts again from the top.
//!
//! The store is written from here only; it is never read back to decide
//! what to run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::decks::{DeckWriter, Molecule};
use crate::error::PipelineError;
use crate::executor::JobExecutor;
use crate::process::JobControl;
use crate::report::Report;
use crate::state_machine::{
    Evaluation, JobArtifact, Stage, StageStatus, artifact_stem, derive_status, remove_artifacts,
};
use crate::store::{EXTRA_PREFIX, StatusStore};
use crate::sweeper::Sweeper;
use crate::thermo::{self, Energies};

/// A work item discovered in the geometry directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub name: String,
    pub geometry: PathBuf,
}

/// `.xyz` files in `dir`, newest first. A missing directory has no items.
pub fn scan_geometries(dir: &Path) -> io::Result<Vec<WorkItem>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut found: Vec<(SystemTime, WorkItem)> = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() || path.extension().is_none_or(|ext| ext != "xyz") {
            continue;
        }
        let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        let mtime = fs::metadata(&path)?.modified()?;
        found.push((
            mtime,
            WorkItem {
                name,
                geometry: path,
            },
        ));
    }
    found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
    Ok(found.into_iter().map(|(_, item)| item).collect())
}

pub struct Reconciler<'a> {
    config: &'a PipelineConfig,
    executor: JobExecutor<'a>,
    decks: &'a dyn DeckWriter,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        control: &'a JobControl,
        decks: &'a dyn DeckWriter,
    ) -> Self {
        Self {
            config,
            executor: JobExecutor::new(config, control),
            decks,
        }
    }

    /// One pass over every work item. Returns `true` when an engine ran, in
    /// which case the pass stopped right after it. A job that could not be
    /// started blocks its item and the pass moves on.
    pub async fn cycle(&self, store: &mut StatusStore) -> Result<bool, PipelineError> {
        let items = scan_geometries(&self.config.geometry_dir())?;
        self.flag_missing_sources(&items, store)?;

        for item in &items {
            if self.process_item(item, store).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Re-derives every cached stage of every work item from disk. Run once
    /// at startup to correct records left RUNNING by a dead controller.
    pub fn recover(&self, store: &mut StatusStore) -> Result<(), PipelineError> {
        let cached: Vec<(String, Vec<String>)> = store
            .items()
            .iter()
            .filter(|(name, _)| !name.starts_with(EXTRA_PREFIX))
            .map(|(name, record)| (name.clone(), record.stages.keys().cloned().collect()))
            .collect();

        for (item, stages) in cached {
            for key in stages {
                let Some(stage) = Stage::from_name(&key) else {
                    continue;
                };
                let eval = match self.locate(&item, stage) {
                    Some(artifact) => derive_status(artifact.output(), stage.is_primary()),
                    None => Evaluation::missing(),
                };
                if store.sync(&item, &key, &eval)? {
                    info!(item = %item, stage = %stage, status = %eval.status, "recovered stage status");
                }
            }
        }
        Ok(())
    }

    fn locate(&self, item: &str, stage: Stage) -> Option<JobArtifact> {
        JobArtifact::locate(
            &self.config.stage_dir(stage),
            &artifact_stem(item, stage),
            &self.config.input_extensions,
            &self.config.output_extensions,
        )
    }

    fn artifact(&self, input: PathBuf) -> JobArtifact {
        JobArtifact::new(input, &self.config.output_extensions)
    }

    fn flag_missing_sources(
        &self,
        items: &[WorkItem],
        store: &mut StatusStore,
    ) -> Result<(), PipelineError> {
        let known: Vec<String> = store
            .items()
            .keys()
            .filter(|name| !name.starts_with(EXTRA_PREFIX))
            .cloned()
            .collect();
        for name in known {
            let present = items.iter().any(|item| item.name == name);
            if store.item(&name).is_some_and(|r| r.xyz_missing == present) {
                if !present {
                    warn!(item = %name, "geometry file is gone");
                }
                store.set_source_missing(&name, !present)?;
            }
        }
        Ok(())
    }

    async fn process_item(
        &self,
        item: &WorkItem,
        store: &mut StatusStore,
    ) -> Result<bool, PipelineError> {
        let name = item.name.as_str();
        let primary = Stage::PRIMARY;

        let opt_artifact = match self.locate(name, primary) {
            Some(artifact) => artifact,
            None => {
                match self
                    .decks
                    .write_primary(name, &item.geometry, &self.config.stage_dir(primary))
                {
                    Ok(input) => self.artifact(input),
                    Err(e) => {
                        warn!(item = name, error = %e, "cannot generate primary deck");
                        store.sync(name, primary.as_str(), &Evaluation::error(e.to_string()))?;
                        self.observe(name, &Stage::DOWNSTREAM, store)?;
                        return Ok(false);
                    }
                }
            }
        };

        if !opt_artifact.has_output() {
            self.invalidate_downstream(name, store)?;
            let submission = self
                .executor
                .submit_and_wait(&opt_artifact, name, primary.as_str(), true, store)
                .await?;
            if submission.ran() {
                return Ok(true);
            }
            self.observe(name, &Stage::DOWNSTREAM, store)?;
            return Ok(false);
        }

        let eval = derive_status(opt_artifact.output(), true);
        store.sync(name, primary.as_str(), &eval)?;
        if !eval.is_done() {
            debug!(item = name, status = %eval.status, "primary stage blocks item");
            self.observe(name, &Stage::DOWNSTREAM, store)?;
            return Ok(false);
        }

        let mut molecule: Option<Molecule> = None;
        for (idx, &stage) in Stage::DOWNSTREAM.iter().enumerate() {
            let rest = &Stage::DOWNSTREAM[idx + 1..];
            let key = stage.as_str();

            let artifact = match self.locate(name, stage) {
                Some(artifact) => artifact,
                None => {
                    let written =
                        self.write_downstream(name, stage, &mut molecule, opt_artifact.output());
                    match written {
                        Ok(input) => self.artifact(input),
                        Err(e) => {
                            let status = match e {
                                PipelineError::NoCoordinates => StageStatus::ErrData,
                                _ => StageStatus::Error,
                            };
                            warn!(item = name, stage = key, error = %e, "cannot generate deck");
                            store.sync(name, key, &Evaluation::new(status, e.to_string()))?;
                            self.observe(name, rest, store)?;
                            return Ok(false);
                        }
                    }
                }
            };

            if !artifact.has_output() {
                store.clear_result(name)?;
                let submission = self
                    .executor
                    .submit_and_wait(&artifact, name, key, false, store)
                    .await?;
                if submission.ran() {
                    return Ok(true);
                }
                self.observe(name, rest, store)?;
                return Ok(false);
            }

            let eval = derive_status(artifact.output(), false);
            store.sync(name, key, &eval)?;
            if !eval.is_done() {
                debug!(item = name, stage = key, status = %eval.status, "stage blocks item");
                self.observe(name, rest, store)?;
                return Ok(false);
            }
        }

        self.record_result(name, store)?;
        Ok(false)
    }

    /// Writes a downstream deck. The molecule is read from the primary
    /// report on first use and reused for the remaining stages.
    fn write_downstream(
        &self,
        item: &str,
        stage: Stage,
        molecule: &mut Option<Molecule>,
        primary_report: &Path,
    ) -> Result<PathBuf, PipelineError> {
        let mol = match molecule.take() {
            Some(mol) => mol,
            None => load_molecule(primary_report)?,
        };
        let written = self
            .decks
            .write_stage(item, stage, &mol, &self.config.stage_dir(stage));
        *molecule = Some(mol);
        written
    }

    /// Syncs statuses of `stages` without generating or submitting anything.
    fn observe(
        &self,
        item: &str,
        stages: &[Stage],
        store: &mut StatusStore,
    ) -> Result<(), PipelineError> {
        for &stage in stages {
            let eval = match self.locate(item, stage) {
                Some(artifact) => derive_status(artifact.output(), false),
                None => Evaluation::missing(),
            };
            store.sync(item, stage.as_str(), &eval)?;
        }
        Ok(())
    }

    /// Deletes every downstream deck and report of `item` so nothing computed
    /// from an older primary result survives.
    fn invalidate_downstream(
        &self,
        item: &str,
        store: &mut StatusStore,
    ) -> Result<(), PipelineError> {
        let mut removed = 0;
        for stage in Stage::DOWNSTREAM {
            removed += remove_artifacts(
                &self.config.stage_dir(stage),
                &artifact_stem(item, stage),
                &self.config.input_extensions,
                &self.config.output_extensions,
            )?;
        }
        if removed > 0 {
            info!(item, removed, "cleared downstream artifacts");
        }
        store.reset_stages(item, &Stage::DOWNSTREAM.map(Stage::as_str))?;
        Ok(())
    }

    /// Recomputes the final free energy from the current reports and rewrites
    /// its results row. The store is only touched when the value changed.
    /// Missing inputs are left for a later cycle.
    fn record_result(&self, item: &str, store: &mut StatusStore) -> Result<(), PipelineError> {
        let Some(energies) = self.collect_energies(item) else {
            debug!(item, "energies incomplete, result deferred");
            return Ok(());
        };

        let result = thermo::gibbs(&energies, item, &self.config.constants);
        thermo::upsert_csv(&self.config.results_file(), item, &energies, &result)?;
        if store.item(item).and_then(|r| r.result_g) == Some(result.g_final_kcal) {
            return Ok(());
        }
        store.set_result(item, result.g_final_kcal)?;
        info!(
            item,
            g_kcal = result.g_final_kcal,
            conc_kcal = result.conc_corr_kcal,
            "free energy recorded"
        );
        Ok(())
    }

    fn collect_energies(&self, item: &str) -> Option<Energies> {
        let load = |stage: Stage| -> Option<Report> {
            let artifact = self.locate(item, stage)?;
            Report::load(artifact.output()).ok()
        };
        Some(Energies {
            thermal_corr: load(Stage::Opt)?.thermal_correction()?,
            gas: load(Stage::Gas)?.electronic_energy()?,
            solv: load(Stage::Solv)?.electronic_energy()?,
            sp: load(Stage::Sp)?.electronic_energy()?,
        })
    }
}

fn load_molecule(report: &Path) -> Result<Molecule, PipelineError> {
    let report = Report::load(report)?;
    Molecule::from_report(&*report)
}

/// How long the control loop keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Until the operator quits.
    Forever,
    /// One reconcile cycle (plus the sweeper if the cycle was idle).
    Once,
}

/// The control loop: reconcile, then sweep, then sleep when idle.
///
/// A quit request ends the loop with `Ok(())` after the running job, if any,
/// has been killed and recorded.
pub async fn run(
    config: &PipelineConfig,
    control: &JobControl,
    decks: &dyn DeckWriter,
    mode: RunMode,
) -> Result<(), PipelineError> {
    let mut store = StatusStore::open(config.status_file());
    let reconciler = Reconciler::new(config, control, decks);
    let sweeper = Sweeper::new(config, control)?;

    reconciler.recover(&mut store)?;
    sweeper.scan(&mut store)?;

    match drive(&reconciler, &sweeper, control, config, &mut store, mode).await {
        Err(PipelineError::Interrupted) => {
            info!("quit requested, controller stopping");
            Ok(())
        }
        other => other,
    }
}

async fn drive(
    reconciler: &Reconciler<'_>,
    sweeper: &Sweeper<'_>,
    control: &JobControl,
    config: &PipelineConfig,
    store: &mut StatusStore,
    mode: RunMode,
) -> Result<(), PipelineError> {
    loop {
        if control.quit_requested() {
            return Err(PipelineError::Interrupted);
        }

        let submitted = reconciler.cycle(store).await? || sweeper.run_once(store).await?;
        sweeper.scan(store)?;

        if mode == RunMode::Once {
            return Ok(());
        }
        if submitted {
            continue;
        }

        debug!(secs = config.idle_sleep_secs, "nothing to do, sleeping");
        let stopped = control.stopped();
        tokio::pin!(stopped);
        stopped.as_mut().enable();
        if control.quit_requested() {
            return Err(PipelineError::Interrupted);
        }
        tokio::select! {
            _ = sleep(config.idle_sleep()) => {}
            _ = &mut stopped => {}
        }
    }
}
