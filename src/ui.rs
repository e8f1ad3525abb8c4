//! Terminal output: the per-job spinner and the status dashboard.
//!
//! `indicatif` drives the spinner, `console` colours the statuses. Nothing
//! here mutates pipeline state.

use std::collections::BTreeMap;
use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::state_machine::{Evaluation, Stage, StageStatus};
use crate::store::{EXTRA_PREFIX, ItemRecord, format_duration};

/// Spinner shown while the executor waits on an engine.
pub struct JobProgress {
    pb: ProgressBar,
    label: String,
    green: Style,
    red: Style,
}

impl JobProgress {
    /// `label` reads like `water [OPT]`.
    pub fn start(label: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("invalid template"),
        );
        pb.set_message(format!("Submitting: {label}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            label: label.to_string(),
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
        }
    }

    pub fn tick(&self, elapsed: Duration) {
        self.pb.set_message(format!(
            "Running: {} ... Time: {}",
            self.label,
            format_duration(elapsed.as_secs_f64())
        ));
    }

    pub fn complete(&self, eval: &Evaluation) {
        self.pb.finish_and_clear();
        if eval.is_done() {
            println!("  {} {} finished", self.green.apply_to("✓"), self.label);
        } else {
            println!(
                "  {} {} {}: {}",
                self.red.apply_to("✗"),
                self.label,
                eval.status,
                eval.error
            );
        }
    }
}

fn status_style(status: StageStatus) -> Style {
    match status {
        StageStatus::Done => Style::new().green(),
        StageStatus::Running => Style::new().cyan().bold(),
        StageStatus::Pending | StageStatus::Missing => Style::new().dim(),
        _ => Style::new().red(),
    }
}

/// Prints one row per work item, then the ad-hoc jobs.
pub fn print_dashboard(items: &BTreeMap<String, ItemRecord>) {
    let header = Style::new().bold();
    let mut line = format!("{:<24}", "Molecule");
    for stage in Stage::ALL {
        line.push_str(&format!(" {:<20}", stage.as_str().to_uppercase()));
    }
    line.push_str(" G (kcal/mol)");
    println!("{}", header.apply_to(line));

    for (name, record) in items.iter().filter(|(k, _)| !k.starts_with(EXTRA_PREFIX)) {
        let mut row = format!("{name:<24}");
        for stage in Stage::ALL {
            let status = record
                .stages
                .get(stage.as_str())
                .map_or(StageStatus::Pending, |r| r.status);
            let cell = format!("{:<20}", status.to_string());
            row.push_str(&format!(" {}", status_style(status).apply_to(cell)));
        }
        match record.result_g {
            Some(g) => row.push_str(&format!(" {g:.2}")),
            None => row.push_str(" -"),
        }
        if record.xyz_missing {
            row.push_str(&format!(" {}", Style::new().yellow().apply_to("(xyz missing)")));
        }
        println!("{row}");
    }

    let extras: Vec<_> = items
        .iter()
        .filter(|(k, _)| k.starts_with(EXTRA_PREFIX))
        .collect();
    if extras.is_empty() {
        return;
    }
    println!();
    println!("{}", header.apply_to("Extra jobs"));
    for (name, record) in extras {
        for (stage, rec) in &record.stages {
            let status = status_style(rec.status).apply_to(format!("{:<20}", rec.status.to_string()));
            println!("{name:<32} {stage:<16} {status} {}", rec.error);
        }
    }
}

/// Errors worth surfacing under the table.
pub fn print_errors(items: &BTreeMap<String, ItemRecord>) {
    let red = Style::new().red();
    for (name, record) in items {
        for (stage, rec) in &record.stages {
            if rec.status.is_error() && !rec.error.is_empty() && !name.starts_with(EXTRA_PREFIX) {
                println!("  {} {name} [{stage}]: {}", red.apply_to("!"), rec.error);
            }
        }
    }
}
