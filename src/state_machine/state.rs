use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::report::{Report, ReportSignals};

/// Prefix of a line the controller appends to a report whose outcome it
/// decided itself: a killed job, or an engine that never wrote one. The
/// rest of the line is the error, and the report derives to ERROR from then
/// on, whatever else it contains.
const ERROR_MARKER: &str = "#### gibbsflow: ";

/// Appends an error marker line to `output`, creating the file if needed.
pub fn pin_error(output: &Path, reason: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(output)?;
    writeln!(file, "\n{ERROR_MARKER}{}", reason.replace(['\r', '\n'], " "))
}

fn pinned_error(content: &str) -> Option<&str> {
    content
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(ERROR_MARKER))
        .map(str::trim)
}

/// Status of one (work item, stage) pair.
///
/// `PENDING -> RUNNING -> {DONE | ERROR | ERR_NOT_CONVERGED | ERR_IMAGINARY_FREQ}`.
/// Deleting a report sends any terminal state back to `MISSING` on the next
/// scan; that is the only retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    Missing,
    Running,
    Done,
    Error,
    ErrNotConverged,
    ErrImaginaryFreq,
    ErrData,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            StageStatus::Pending | StageStatus::Missing | StageStatus::Running
        )
    }

    pub fn is_error(self) -> bool {
        self.is_terminal() && self != StageStatus::Done
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "PENDING",
            StageStatus::Missing => "MISSING",
            StageStatus::Running => "RUNNING",
            StageStatus::Done => "DONE",
            StageStatus::Error => "ERROR",
            StageStatus::ErrNotConverged => "ERR_NOT_CONVERGED",
            StageStatus::ErrImaginaryFreq => "ERR_IMAGINARY_FREQ",
            StageStatus::ErrData => "ERR_DATA",
        };
        f.write_str(s)
    }
}

/// A derived status plus the message explaining it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub status: StageStatus,
    pub error: String,
}

impl Evaluation {
    pub fn new(status: StageStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }

    pub fn missing() -> Self {
        Self::new(StageStatus::Missing, "")
    }

    pub fn done() -> Self {
        Self::new(StageStatus::Done, "")
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(StageStatus::Error, message)
    }

    pub fn is_done(&self) -> bool {
        self.status == StageStatus::Done
    }
}

/// Derives a stage status from its report on disk.
///
/// Pure function of the file content: calling it twice on the same file
/// gives the same answer. Read and parse problems come back as ERROR with
/// the error text, never as a panic or `Err`.
pub fn derive_status(output: &Path, primary: bool) -> Evaluation {
    if !output.exists() {
        return Evaluation::missing();
    }
    let bytes = match std::fs::read(output) {
        Ok(bytes) => bytes,
        Err(e) => return Evaluation::error(format!("Cannot read {}: {e}", output.display())),
    };
    let content = String::from_utf8_lossy(&bytes).into_owned();
    if let Some(reason) = pinned_error(&content) {
        return Evaluation::error(reason);
    }
    match Report::detect(content) {
        Some(report) => classify(&*report, primary),
        None => Evaluation::error(format!("Unsupported report format: {}", output.display())),
    }
}

/// Applies the precedence failed > incomplete > not converged > imaginary
/// frequency > done. Convergence and frequencies only matter for the
/// primary optimization.
pub fn classify(report: &dyn ReportSignals, primary: bool) -> Evaluation {
    if report.is_failed() {
        return Evaluation::error("Error termination reported by engine");
    }
    if !report.is_finished() {
        return Evaluation::error("Report incomplete (no termination banner)");
    }
    if primary && !report.is_converged() {
        return Evaluation::new(StageStatus::ErrNotConverged, "Optimization not converged");
    }
    if primary && report.has_imaginary_freq() {
        return Evaluation::new(StageStatus::ErrImaginaryFreq, "Imaginary frequency detected");
    }
    Evaluation::done()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const HEADER: &str = " Entering Gaussian System\n";

    fn write(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn missing_file() {
        let tmp = TempDir::new().unwrap();
        let eval = derive_status(&tmp.path().join("nope.out"), true);
        assert_eq!(eval.status, StageStatus::Missing);
    }

    #[test]
    fn failure_beats_unfinished() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "a.out", &format!("{HEADER} Error termination via Lnk1e.\n"));
        let eval = derive_status(&path, true);
        assert_eq!(eval.status, StageStatus::Error);
        assert!(eval.error.contains("Error termination"));
    }

    #[test]
    fn failure_beats_normal_termination() {
        let tmp = TempDir::new().unwrap();
        let body = format!("{HEADER} Error termination\n Normal termination of Gaussian 16\n");
        let path = write(&tmp, "a.out", &body);
        assert_eq!(derive_status(&path, false).status, StageStatus::Error);
    }

    #[test]
    fn truncated_report_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "a.out", &format!("{HEADER} SCF Done:  E(RB3LYP) = -1.0\n"));
        let eval = derive_status(&path, false);
        assert_eq!(eval.status, StageStatus::Error);
        assert!(eval.error.contains("incomplete"));
    }

    #[test]
    fn optimization_specific_errors() {
        let tmp = TempDir::new().unwrap();
        let unconverged = write(&tmp, "a.out", &format!("{HEADER} Normal termination\n"));
        assert_eq!(
            derive_status(&unconverged, true).status,
            StageStatus::ErrNotConverged
        );
        // Single points do not need a convergence banner.
        assert_eq!(derive_status(&unconverged, false).status, StageStatus::Done);

        let imaginary = write(
            &tmp,
            "b.out",
            &format!(
                "{HEADER} Stationary point found.\n Harmonic frequencies (cm**-1)\n Frequencies --  -120.3  50.0  80.0\n Normal termination\n"
            ),
        );
        assert_eq!(
            derive_status(&imaginary, true).status,
            StageStatus::ErrImaginaryFreq
        );
    }

    #[test]
    fn done_when_all_signals_clean() {
        let tmp = TempDir::new().unwrap();
        let path = write(
            &tmp,
            "a.out",
            &format!("{HEADER} Stationary point found.\n Normal termination\n"),
        );
        assert_eq!(derive_status(&path, true), Evaluation::done());
    }

    #[test]
    fn derivation_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "a.out", &format!("{HEADER} Normal termination\n"));
        let first = derive_status(&path, true);
        let second = derive_status(&path, true);
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_format_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, "a.out", "");
        let eval = derive_status(&path, false);
        assert_eq!(eval.status, StageStatus::Error);
        assert!(eval.error.starts_with("Unsupported report format"));
    }

    #[test]
    fn pinned_error_beats_clean_report() {
        let tmp = TempDir::new().unwrap();
        let body = format!("{HEADER} Stationary point found.\n Normal termination\n");
        let path = write(&tmp, "a.out", &body);
        pin_error(&path, "Stopped by operator").unwrap();
        let eval = derive_status(&path, true);
        assert_eq!(eval.status, StageStatus::Error);
        assert_eq!(eval.error, "Stopped by operator");
    }

    #[test]
    fn pin_error_creates_missing_report() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.out");
        pin_error(&path, "spawn failed:\nno such file").unwrap();
        let eval = derive_status(&path, false);
        assert_eq!(eval.status, StageStatus::Error);
        assert_eq!(eval.error, "spawn failed: no such file");
    }

    #[test]
    fn terminal_classification() {
        assert!(!StageStatus::Running.is_terminal());
        assert!(!StageStatus::Missing.is_terminal());
        assert!(StageStatus::Done.is_terminal());
        assert!(!StageStatus::Done.is_error());
        assert!(StageStatus::ErrData.is_error());
    }

    #[test]
    fn status_display_matches_serde() {
        for status in [
            StageStatus::Pending,
            StageStatus::Running,
            StageStatus::Done,
            StageStatus::ErrNotConverged,
            StageStatus::ErrImaginaryFreq,
            StageStatus::ErrData,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }
}
