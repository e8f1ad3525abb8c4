//! Pipeline configuration loaded from `gibbsflow.toml`.
//!
//! [`PipelineConfig`] is built once at startup and handed to every component
//! by reference. Values missing from the file fall back to defaults.
//! The `GIBBSFLOW_ROOT` environment variable takes precedence over `root_dir`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::state_machine::Stage;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "gibbsflow.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Base directory every relative path below is resolved against.
    pub root_dir: PathBuf,
    /// Watched directory of `.xyz` geometries, one per work item.
    pub geometry_dir: PathBuf,
    /// Deck templates, named `{stage}{ext}`.
    pub template_dir: PathBuf,
    /// Holds one sub-directory per stage.
    pub data_dir: PathBuf,
    /// Independent tree of ad-hoc jobs picked up by the sweeper.
    pub sweeper_dir: PathBuf,
    pub status_file: PathBuf,
    pub results_file: PathBuf,
    /// Input deck extensions, in preference order.
    pub input_extensions: Vec<String>,
    /// Report extensions, in preference order. The first one is what the
    /// executor asks the engine to write.
    pub output_extensions: Vec<String>,
    /// Shell command template per input extension, with `{input}` and
    /// `{output}` placeholders.
    pub commands: BTreeMap<String, String>,
    pub poll_interval_ms: u64,
    pub idle_sleep_secs: u64,
    /// Two interrupts closer than this quit the controller.
    pub interrupt_debounce_ms: u64,
    /// File-name globs the sweeper must never submit.
    pub sweeper_ignore: Vec<String>,
    pub constants: Constants,
}

/// Physical constants used by the free-energy formula.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Constants {
    pub hartree_to_kcal: f64,
    /// Standard-state concentration correction, kcal/mol.
    pub conc_corr_kcal: f64,
    /// Per-molecule overrides of the concentration correction, keyed by
    /// lower-case work item name, kcal/mol.
    pub special_conc_corr_kcal: BTreeMap<String, f64>,
}

impl Default for Constants {
    fn default() -> Self {
        Self {
            hartree_to_kcal: 627.509474,
            conc_corr_kcal: 1.89,
            special_conc_corr_kcal: BTreeMap::from([
                ("h2o".to_string(), 0.0),
                ("water".to_string(), 0.0),
            ]),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            geometry_dir: PathBuf::from("xyz"),
            template_dir: PathBuf::from("templates"),
            data_dir: PathBuf::from("data"),
            sweeper_dir: PathBuf::from("extra_jobs"),
            status_file: PathBuf::from("task_status.json"),
            results_file: PathBuf::from("results.csv"),
            input_extensions: vec![".gjf".to_string(), ".inp".to_string()],
            output_extensions: vec![".out".to_string(), ".log".to_string()],
            commands: BTreeMap::from([
                (".gjf".to_string(), "g16 < {input} > {output}".to_string()),
                (
                    ".inp".to_string(),
                    "/opt/orca/orca {input} > {output}".to_string(),
                ),
            ]),
            poll_interval_ms: 1000,
            idle_sleep_secs: 60,
            interrupt_debounce_ms: 1500,
            sweeper_ignore: vec![
                "*_atom*.inp".to_string(),
                "*.scfgrad.inp".to_string(),
                "*.scfhess.inp".to_string(),
                "*.tmp*".to_string(),
            ],
            constants: Constants::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads `path`, or `gibbsflow.toml` in the working directory when no
    /// path is given. A missing default file yields the defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(CONFIG_FILE).exists() => Self::from_file(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };

        // Environment wins over the file for the data root.
        if let Ok(root) = std::env::var("GIBBSFLOW_ROOT")
            && !root.is_empty()
        {
            config.root_dir = PathBuf::from(root);
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = toml::from_str::<PipelineConfig>(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// A configuration rooted at `root` with every other value defaulted.
    #[cfg(test)]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root.into(),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.input_extensions.is_empty() {
            anyhow::bail!("input_extensions must not be empty");
        }
        if self.output_extensions.is_empty() {
            anyhow::bail!("output_extensions must not be empty");
        }
        if let Some(ext) = self
            .input_extensions
            .iter()
            .find(|ext| self.command_for(ext).is_none())
        {
            anyhow::bail!("input extension {ext:?} has no entry in [commands]");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be positive");
        }
        for pattern in &self.sweeper_ignore {
            glob::Pattern::new(pattern)
                .with_context(|| format!("invalid sweeper_ignore pattern {pattern:?}"))?;
        }
        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_dir.join(path)
        }
    }

    pub fn geometry_dir(&self) -> PathBuf {
        self.resolve(&self.geometry_dir)
    }

    pub fn template_dir(&self) -> PathBuf {
        self.resolve(&self.template_dir)
    }

    pub fn sweeper_dir(&self) -> PathBuf {
        self.resolve(&self.sweeper_dir)
    }

    pub fn status_file(&self) -> PathBuf {
        self.resolve(&self.status_file)
    }

    pub fn results_file(&self) -> PathBuf {
        self.resolve(&self.results_file)
    }

    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.resolve(&self.data_dir).join(stage.as_str())
    }

    /// Command template for an input extension such as `.gjf`.
    pub fn command_for(&self, extension: &str) -> Option<&str> {
        self.commands.get(extension).map(String::as_str)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_secs(self.idle_sleep_secs)
    }

    pub fn interrupt_debounce(&self) -> Duration {
        Duration::from_millis(self.interrupt_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.input_extensions, vec![".gjf", ".inp"]);
        assert_eq!(config.command_for(".gjf"), Some("g16 < {input} > {output}"));
        assert_eq!(config.command_for(".xyz"), None);
        assert_eq!(config.output_extensions[0], ".out");
        assert_eq!(config.constants.hartree_to_kcal, 627.509474);
        assert_eq!(config.constants.special_conc_corr_kcal.get("water"), Some(&0.0));
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            root_dir = "/scratch/run1"
            poll_interval_ms = 250

            [commands]
            ".gjf" = "python mock_engine.py {input} {output}"

            [constants]
            conc_corr_kcal = 2.0
        "#;
        let config: PipelineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.root_dir, PathBuf::from("/scratch/run1"));
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.commands.len(), 1);
        assert_eq!(config.constants.conc_corr_kcal, 2.0);
        assert_eq!(config.constants.hartree_to_kcal, 627.509474);
        assert_eq!(config.idle_sleep_secs, 60);
    }

    #[test]
    fn relative_dirs_resolve_against_root() {
        let config = PipelineConfig::with_root("/work");
        assert_eq!(config.geometry_dir(), PathBuf::from("/work/xyz"));
        assert_eq!(config.stage_dir(Stage::Solv), PathBuf::from("/work/data/solv"));
        assert_eq!(config.status_file(), PathBuf::from("/work/task_status.json"));
    }

    #[test]
    fn absolute_dirs_are_kept() {
        let mut config = PipelineConfig::with_root("/work");
        config.sweeper_dir = PathBuf::from("/elsewhere/jobs");
        assert_eq!(config.sweeper_dir(), PathBuf::from("/elsewhere/jobs"));
    }

    #[test]
    fn validate_rejects_bad_ignore_pattern() {
        let mut config = PipelineConfig::default();
        config.sweeper_ignore = vec!["[".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_command_for_every_input_extension() {
        assert!(PipelineConfig::default().validate().is_ok());

        let mut config = PipelineConfig::default();
        config.commands.remove(".inp");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains(".inp"));
    }

    #[test]
    fn load_explicit_missing_file_fails() {
        let result = PipelineConfig::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(result.is_err());
    }
}
