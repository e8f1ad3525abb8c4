use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unsupported report format: {}", .0.display())]
    UnsupportedReport(PathBuf),

    #[error("No coordinates found in report")]
    NoCoordinates,

    #[error("No command registered for {0}")]
    NoCommand(String),

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No template for stage {0}")]
    MissingTemplate(String),

    #[error("Invalid geometry file {}: {reason}", .path.display())]
    InvalidGeometry { path: PathBuf, reason: String },

    #[error("Interrupted by user")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid ignore pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}
