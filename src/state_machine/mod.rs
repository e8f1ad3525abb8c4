mod job;
mod state;

pub use job::{JobArtifact, Stage, artifact_stem, file_name, remove_artifacts};
pub use state::{Evaluation, StageStatus, classify, derive_status, pin_error};
