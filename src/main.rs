mod cli;
mod config;
mod decks;
mod error;
mod executor;
mod logging;
mod process;
mod reconciler;
mod report;
mod state_machine;
mod store;
mod sweeper;
mod thermo;
mod ui;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use cli::{Cli, Command};
use config::PipelineConfig;
use decks::TemplateDecks;
use process::{JobControl, StopRequest};
use reconciler::RunMode;
use report::Report;
use state_machine::derive_status;
use store::StatusStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run => run(&config, RunMode::Forever).await,
        Command::Once => run(&config, RunMode::Once).await,
        Command::Status => status(&config),
        Command::Inspect { report, opt } => inspect(&report, opt),
    }
}

async fn run(config: &PipelineConfig, mode: RunMode) -> Result<()> {
    let control = Arc::new(JobControl::new(config.interrupt_debounce()));
    install_signal_handlers(&control);

    let decks = TemplateDecks::new(config);
    info!(root = %config.root_dir.display(), ?mode, "controller starting");
    reconciler::run(config, &control, &decks, mode)
        .await
        .context("control loop failed")?;
    Ok(())
}

/// Ctrl+C skips the running job, twice in quick succession quits. SIGTERM
/// quits straight away. Either way the job's process group is killed first.
fn install_signal_handlers(control: &Arc<JobControl>) {
    let on_interrupt = Arc::clone(control);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            match on_interrupt.interrupt() {
                StopRequest::SkipJob => {
                    warn!("interrupt: stopping current job, press Ctrl+C again to quit")
                }
                StopRequest::Quit => {
                    warn!("interrupt: quitting");
                    break;
                }
            }
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let on_terminate = Arc::clone(control);
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    if sigterm.recv().await.is_some() {
                        info!("received SIGTERM, shutting down");
                        on_terminate.shutdown();
                    }
                }
                Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
            }
        });
    }
}

fn status(config: &PipelineConfig) -> Result<()> {
    let path = config.status_file();
    let items = StatusStore::read(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if items.is_empty() {
        println!("No jobs recorded in {}", path.display());
        return Ok(());
    }
    ui::print_dashboard(&items);
    ui::print_errors(&items);
    Ok(())
}

fn inspect(path: &Path, opt: bool) -> Result<()> {
    let report =
        Report::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    let show = |value: Option<f64>| value.map_or("-".to_string(), |v| format!("{v:.6}"));
    let (charge, mult) = report.charge_mult();

    println!("Report:             {}", path.display());
    println!("Dialect:            {}", report.dialect());
    println!("Failed:             {}", report.is_failed());
    println!("Finished:           {}", report.is_finished());
    println!("Converged:          {}", report.is_converged());
    println!("Imaginary freq:     {}", report.has_imaginary_freq());
    println!("Charge/mult:        {charge} {mult}");
    println!("Energy (Ha):        {}", show(report.electronic_energy()));
    println!("Thermal corr (Ha):  {}", show(report.thermal_correction()));
    match report.coordinates() {
        Ok(coords) => println!("Coordinates:\n{coords}"),
        Err(e) => println!("Coordinates:        {e}"),
    }

    let eval = derive_status(path, opt);
    if eval.error.is_empty() {
        println!("Status:             {}", eval.status);
    } else {
        println!("Status:             {} ({})", eval.status, eval.error);
    }
    Ok(())
}
