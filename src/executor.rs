//! Runs one engine job to completion and records what its report says.

use std::path::Path;
use std::time::Instant;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::process::{EngineProcess, JobControl};
use crate::state_machine::{
    Evaluation, JobArtifact, StageStatus, derive_status, file_name, pin_error,
};
use crate::store::StatusStore;
use crate::ui::JobProgress;

const STOPPED: &str = "Stopped by operator";
const NO_REPORT: &str = "Engine exited without writing a report";

/// How the wait on an engine ended.
enum Exit {
    Finished,
    Killed,
}

/// What came of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The engine ran and the stage derived DONE.
    Done,
    /// The engine ran and the stage ended in an error state.
    Failed,
    /// No engine process was started: no command for the deck, or the
    /// spawn itself failed.
    NotStarted,
}

impl Submission {
    /// Whether an engine process actually ran.
    pub fn ran(self) -> bool {
        self != Submission::NotStarted
    }
}

/// Owns at most one engine process at a time.
pub struct JobExecutor<'a> {
    config: &'a PipelineConfig,
    control: &'a JobControl,
}

impl<'a> JobExecutor<'a> {
    pub fn new(config: &'a PipelineConfig, control: &'a JobControl) -> Self {
        Self { config, control }
    }

    /// Runs the engine on `artifact` and blocks until it exits or is
    /// stopped. The stage record goes RUNNING first, then to whatever the
    /// report derives to.
    ///
    /// Every outcome other than DONE leaves a report on disk that derives to
    /// ERROR, so the stage stays blocked until the operator deletes it.
    /// Failures of the job itself are recorded, not returned; `Err` means the
    /// store could not be written or the operator asked to quit.
    pub async fn submit_and_wait(
        &self,
        artifact: &JobArtifact,
        item: &str,
        stage: &str,
        primary: bool,
        store: &mut StatusStore,
    ) -> Result<Submission, PipelineError> {
        let output = artifact.declared_output();
        let ext = artifact.extension();
        let Some(template) = self.config.command_for(&ext) else {
            let err = PipelineError::NoCommand(ext);
            warn!(item, stage, "{err}");
            pin(output, &err.to_string());
            store.finish(item, stage, StageStatus::Error, &err.to_string())?;
            return Ok(Submission::NotStarted);
        };

        let command = template
            .replace("{input}", &file_name(&artifact.input))
            .replace("{output}", &file_name(output));

        store.start(item, stage)?;
        info!(item, stage, %command, "submitting job");
        let progress = JobProgress::start(&format!("{item} [{}]", stage.to_uppercase()));

        let mut engine = match EngineProcess::spawn(&command, artifact.dir()) {
            Ok(engine) => engine,
            Err(e) => {
                warn!(item, stage, error = %e, "engine did not start");
                let eval = Evaluation::error(e.to_string());
                pin(output, &eval.error);
                progress.complete(&eval);
                store.finish(item, stage, eval.status, &eval.error)?;
                return Ok(Submission::NotStarted);
            }
        };

        let exit = self.wait(&mut engine, &progress).await;

        let eval = match exit {
            Exit::Finished if !artifact.has_output() => {
                pin(output, NO_REPORT);
                Evaluation::error(NO_REPORT)
            }
            Exit::Finished => derive_status(artifact.output(), primary),
            Exit::Killed => {
                pin(output, STOPPED);
                let eval = derive_status(output, primary);
                if eval.status == StageStatus::Error {
                    eval
                } else {
                    Evaluation::error(STOPPED)
                }
            }
        };

        progress.complete(&eval);
        store.finish(item, stage, eval.status, &eval.error)?;
        if eval.is_done() {
            info!(item, stage, "job done");
        } else {
            warn!(item, stage, status = %eval.status, error = %eval.error, "job failed");
        }

        if self.control.quit_requested() {
            return Err(PipelineError::Interrupted);
        }
        Ok(if eval.is_done() {
            Submission::Done
        } else {
            Submission::Failed
        })
    }

    async fn wait(&self, engine: &mut EngineProcess, progress: &JobProgress) -> Exit {
        let started = Instant::now();
        let stopped = self.control.stopped();
        tokio::pin!(stopped);
        stopped.as_mut().enable();

        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.control.quit_requested() {
                engine.kill_group().await;
                return Exit::Killed;
            }
            tokio::select! {
                _ = &mut stopped => {
                    info!(pid = ?engine.id(), "stop requested, killing process group");
                    engine.kill_group().await;
                    return Exit::Killed;
                }
                _ = ticker.tick() => match engine.poll() {
                    Ok(Some(status)) => {
                        debug!(%status, command = engine.command(), "engine exited");
                        return Exit::Finished;
                    }
                    Ok(None) => progress.tick(started.elapsed()),
                    Err(e) => {
                        warn!(error = %e, "lost track of engine process");
                        engine.kill_group().await;
                        return Exit::Killed;
                    }
                },
            }
        }
    }
}

/// Pins the stage to ERROR on disk so a later scan never resubmits it.
fn pin(output: &Path, reason: &str) {
    if let Err(e) = pin_error(output, reason) {
        warn!(path = %output.display(), error = %e, "could not write error marker");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const DONE_REPORT: &str = " Entering Gaussian System\n SCF Done:  E(RB3LYP) =  -76.4000  A.U.\n Normal termination of Gaussian 16\n";

    fn config(root: &Path, gjf_command: &str) -> PipelineConfig {
        let mut config = PipelineConfig::with_root(root);
        config.poll_interval_ms = 20;
        config
            .commands
            .insert(".gjf".to_string(), gjf_command.to_string());
        config
    }

    fn artifact(tmp: &TempDir, name: &str, body: &str) -> JobArtifact {
        let input = tmp.path().join(name);
        fs::write(&input, body).unwrap();
        JobArtifact::new(input, &[".out".to_string(), ".log".to_string()])
    }

    #[tokio::test]
    async fn successful_job_is_done() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path(), "cat {input} > {output}");
        let control = JobControl::new(config.interrupt_debounce());
        let mut store = StatusStore::open(config.status_file());
        let art = artifact(&tmp, "m_gas.gjf", DONE_REPORT);

        let executor = JobExecutor::new(&config, &control);
        let outcome = executor
            .submit_and_wait(&art, "m", "gas", false, &mut store)
            .await
            .unwrap();

        assert_eq!(outcome, Submission::Done);
        let rec = store.stage("m", "gas").unwrap();
        assert_eq!(rec.status, StageStatus::Done);
        assert!(rec.duration_sec.is_some());
        assert!(tmp.path().join("m_gas.out").exists());
    }

    #[tokio::test]
    async fn missing_command_template_is_error() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path(), "cat {input} > {output}");
        let control = JobControl::new(config.interrupt_debounce());
        let mut store = StatusStore::open(config.status_file());
        let art = artifact(&tmp, "m_gas.com", DONE_REPORT);

        let outcome = JobExecutor::new(&config, &control)
            .submit_and_wait(&art, "m", "gas", false, &mut store)
            .await
            .unwrap();

        assert_eq!(outcome, Submission::NotStarted);
        assert!(!outcome.ran());
        let rec = store.stage("m", "gas").unwrap();
        assert_eq!(rec.status, StageStatus::Error);
        assert!(rec.error.contains("No command registered for .com"));
        // The pinned report keeps the stage blocked on later scans.
        let again = derive_status(&tmp.path().join("m_gas.out"), false);
        assert_eq!(again.status, StageStatus::Error);
        assert!(again.error.contains("No command registered for .com"));
    }

    #[tokio::test]
    async fn failed_report_is_recorded() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path(), "cat {input} > {output}");
        let control = JobControl::new(config.interrupt_debounce());
        let mut store = StatusStore::open(config.status_file());
        let art = artifact(
            &tmp,
            "m_opt.gjf",
            " Entering Gaussian System\n Error termination via Lnk1e\n",
        );

        let outcome = JobExecutor::new(&config, &control)
            .submit_and_wait(&art, "m", "opt", true, &mut store)
            .await
            .unwrap();

        assert_eq!(outcome, Submission::Failed);
        assert_eq!(store.stage("m", "opt").unwrap().status, StageStatus::Error);
    }

    #[tokio::test]
    async fn engine_without_report_is_error() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path(), "exit 1");
        let control = JobControl::new(config.interrupt_debounce());
        let mut store = StatusStore::open(config.status_file());
        let art = artifact(&tmp, "m_gas.gjf", DONE_REPORT);

        let outcome = JobExecutor::new(&config, &control)
            .submit_and_wait(&art, "m", "gas", false, &mut store)
            .await
            .unwrap();

        assert_eq!(outcome, Submission::Failed);
        let rec = store.stage("m", "gas").unwrap();
        assert_eq!(rec.status, StageStatus::Error);
        assert_eq!(rec.error, "Engine exited without writing a report");
        assert!(rec.duration_sec.is_some());
        assert!(art.has_output());
        let again = derive_status(art.output(), false);
        assert_eq!(again, Evaluation::error("Engine exited without writing a report"));
    }

    #[tokio::test]
    async fn stop_kills_job_and_pins_error() {
        let tmp = TempDir::new().unwrap();
        // Writes a plausible report first, then hangs.
        let config = config(tmp.path(), "cat {input} > {output}; sleep 30");
        let control = Arc::new(JobControl::new(config.interrupt_debounce()));
        let mut store = StatusStore::open(config.status_file());
        let art = artifact(&tmp, "m_sp.gjf", DONE_REPORT);

        let stopper = Arc::clone(&control);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            stopper.stop_current_job();
        });

        let started = Instant::now();
        let outcome = JobExecutor::new(&config, &control)
            .submit_and_wait(&art, "m", "sp", false, &mut store)
            .await
            .unwrap();

        assert_eq!(outcome, Submission::Failed);
        assert!(started.elapsed() < Duration::from_secs(10));
        let rec = store.stage("m", "sp").unwrap();
        assert_eq!(rec.status, StageStatus::Error);
        assert_eq!(rec.error, "Stopped by operator");
        // The report on disk stays an error for later scans.
        let again = derive_status(&tmp.path().join("m_sp.out"), false);
        assert_eq!(again.status, StageStatus::Error);
    }

    #[tokio::test]
    async fn quit_returns_interrupted() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path(), "sleep 30");
        let control = Arc::new(JobControl::new(config.interrupt_debounce()));
        let mut store = StatusStore::open(config.status_file());
        let art = artifact(&tmp, "m_sp.gjf", DONE_REPORT);

        let quitter = Arc::clone(&control);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            quitter.shutdown();
        });

        let result = JobExecutor::new(&config, &control)
            .submit_and_wait(&art, "m", "sp", false, &mut store)
            .await;

        assert!(matches!(result, Err(PipelineError::Interrupted)));
        assert_eq!(store.stage("m", "sp").unwrap().status, StageStatus::Error);
    }
}
