use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One engine invocation type in a work item's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Geometry optimization plus frequencies; everything else depends on it.
    Opt,
    /// Gas-phase single point.
    Gas,
    /// Solvated single point.
    Solv,
    /// High-level single point.
    Sp,
}

impl Stage {
    pub const PRIMARY: Stage = Stage::Opt;

    /// Downstream stages, in the order they are attempted.
    pub const DOWNSTREAM: [Stage; 3] = [Stage::Gas, Stage::Solv, Stage::Sp];

    pub const ALL: [Stage; 4] = [Stage::Opt, Stage::Gas, Stage::Solv, Stage::Sp];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Opt => "opt",
            Stage::Gas => "gas",
            Stage::Solv => "solv",
            Stage::Sp => "sp",
        }
    }

    pub fn is_primary(self) -> bool {
        self == Stage::PRIMARY
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.as_str() == name)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File stem shared by a stage's deck and report: `{item}_{stage}`.
pub fn artifact_stem(item: &str, stage: Stage) -> String {
    format!("{item}_{stage}")
}

/// An input deck and the report(s) it produces, side by side on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobArtifact {
    pub input: PathBuf,
    /// Candidate report paths in preference order; the first is the one the
    /// executor asks the engine to write.
    outputs: Vec<PathBuf>,
}

impl JobArtifact {
    pub fn new(input: PathBuf, output_extensions: &[String]) -> Self {
        let outputs = output_extensions
            .iter()
            .map(|ext| swap_extension(&input, ext))
            .collect();
        Self { input, outputs }
    }

    /// Finds `{dir}/{stem}{ext}` for the first extension that exists.
    pub fn locate(
        dir: &Path,
        stem: &str,
        input_extensions: &[String],
        output_extensions: &[String],
    ) -> Option<Self> {
        input_extensions
            .iter()
            .map(|ext| dir.join(format!("{stem}{ext}")))
            .find(|path| path.is_file())
            .map(|input| Self::new(input, output_extensions))
    }

    /// Where the executor directs the engine's report.
    pub fn declared_output(&self) -> &Path {
        &self.outputs[0]
    }

    /// The first report that exists, else the declared one.
    pub fn output(&self) -> &Path {
        self.outputs
            .iter()
            .find(|path| path.exists())
            .unwrap_or(&self.outputs[0])
    }

    pub fn has_output(&self) -> bool {
        self.outputs.iter().any(|path| path.exists())
    }

    /// Input extension including the dot, e.g. `.gjf`.
    pub fn extension(&self) -> String {
        self.input
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default()
    }

    pub fn dir(&self) -> &Path {
        self.input.parent().unwrap_or(Path::new("."))
    }
}

/// Deletes every deck and report named `{stem}{ext}` in `dir`. Returns how
/// many files were removed.
pub fn remove_artifacts(
    dir: &Path,
    stem: &str,
    input_extensions: &[String],
    output_extensions: &[String],
) -> io::Result<usize> {
    let mut removed = 0;
    for ext in input_extensions.iter().chain(output_extensions) {
        let path = dir.join(format!("{stem}{ext}"));
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

fn swap_extension(path: &Path, ext: &str) -> PathBuf {
    path.with_extension(ext.trim_start_matches('.'))
}

/// Bare file name of a path, as handed to engine command templates.
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
