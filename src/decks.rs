//! Input deck generation.
//!
//! Decks are rendered from `templates/{stage}{ext}` by plain placeholder
//! substitution: `[NAME]`, `[Charge]`, `[Multiplicity]` and `[GEOMETRY]`.

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::report::{ReportSignals, format_atom};
use crate::state_machine::{Stage, artifact_stem};

static CHARGE_MULT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)charge\s*=\s*(-?\d+)\s+multiplicity\s*=\s*(\d+)").expect("valid regex")
});

/// What a deck needs to know about the system.
#[derive(Debug, Clone, PartialEq)]
pub struct Molecule {
    pub charge: i32,
    pub mult: u32,
    /// One `Sym x y z` line per atom.
    pub coordinates: String,
}

impl Molecule {
    /// Takes charge, multiplicity and the final geometry from a finished
    /// optimization report.
    pub fn from_report(report: &dyn ReportSignals) -> Result<Self, PipelineError> {
        let (charge, mult) = report.charge_mult();
        Ok(Self {
            charge,
            mult,
            coordinates: report.coordinates()?,
        })
    }

    /// Parses an XYZ file. The comment line may carry
    /// `Charge = c Multiplicity = m`; otherwise the system is a neutral
    /// singlet.
    pub fn from_xyz(path: &Path) -> Result<Self, PipelineError> {
        let invalid = |reason: &str| PipelineError::InvalidGeometry {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let text = fs::read_to_string(path)?;
        let mut lines = text.lines();
        let count: usize = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| invalid("first line must be the atom count"))?;
        let comment = lines.next().unwrap_or_default();
        let (charge, mult) = CHARGE_MULT
            .captures(comment)
            .and_then(|caps| Some((caps[1].parse().ok()?, caps[2].parse().ok()?)))
            .unwrap_or((0, 1));

        let atoms: Vec<String> = lines
            .filter(|l| !l.trim().is_empty())
            .take(count)
            .map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                match fields.as_slice() {
                    [sym, x, y, z, ..] => Ok(format_atom(sym, x, y, z)),
                    _ => Err(invalid(&format!("malformed atom line {line:?}"))),
                }
            })
            .collect::<Result<_, _>>()?;

        if count == 0 || atoms.len() != count {
            return Err(invalid(&format!(
                "expected {count} atoms, found {}",
                atoms.len()
            )));
        }

        Ok(Self {
            charge,
            mult,
            coordinates: atoms.join("\n"),
        })
    }
}

/// Produces input decks for the reconciler.
pub trait DeckWriter {
    /// Writes the primary-stage deck for `item` from its geometry file.
    fn write_primary(&self, item: &str, geometry: &Path, dir: &Path)
    -> Result<PathBuf, PipelineError>;

    /// Writes a downstream deck from the optimized molecule.
    fn write_stage(
        &self,
        item: &str,
        stage: Stage,
        molecule: &Molecule,
        dir: &Path,
    ) -> Result<PathBuf, PipelineError>;
}

/// Renders decks from per-stage template files.
pub struct TemplateDecks {
    template_dir: PathBuf,
    extensions: Vec<String>,
}

impl TemplateDecks {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            template_dir: config.template_dir(),
            extensions: config.input_extensions.clone(),
        }
    }

    /// First template for `stage` in extension preference order.
    fn template(&self, stage: Stage) -> Result<(String, &str), PipelineError> {
        for ext in &self.extensions {
            let path = self.template_dir.join(format!("{stage}{ext}"));
            if path.is_file() {
                return Ok((fs::read_to_string(path)?, ext.as_str()));
            }
        }
        Err(PipelineError::MissingTemplate(stage.to_string()))
    }

    fn render(
        &self,
        item: &str,
        stage: Stage,
        molecule: &Molecule,
        dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        let (template, ext) = self.template(stage)?;
        let stem = artifact_stem(item, stage);
        let mut deck = template
            .replace("[NAME]", &stem)
            .replace("[Charge]", &molecule.charge.to_string())
            .replace("[Multiplicity]", &molecule.mult.to_string())
            .replace("[GEOMETRY]", &molecule.coordinates);
        // Gaussian needs a blank line after the geometry.
        if !deck.ends_with("\n\n") {
            deck.push_str(if deck.ends_with('\n') { "\n" } else { "\n\n" });
        }

        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{stem}{ext}"));
        fs::write(&path, deck)?;
        debug!(path = %path.display(), "deck written");
        Ok(path)
    }
}

impl DeckWriter for TemplateDecks {
    fn write_primary(
        &self,
        item: &str,
        geometry: &Path,
        dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        let molecule = Molecule::from_xyz(geometry)?;
        self.render(item, Stage::PRIMARY, &molecule, dir)
    }

    fn write_stage(
        &self,
        item: &str,
        stage: Stage,
        molecule: &Molecule,
        dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        self.render(item, stage, molecule, dir)
    }
}
