use once_cell::sync::Lazy;
use regex::Regex;

use super::{IMAGINARY_THRESHOLD, ReportSignals, element_symbol, format_atom};
use crate::error::PipelineError;

static FREQUENCIES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Frequencies\s*--\s*(.*)").expect("valid regex"));
static CHARGE_MULT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Charge\s*=\s*(-?\d+)\s+Multiplicity\s*=\s*(\d+)").expect("valid regex")
});
static SCF_ENERGY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"SCF Done:.*=\s*(-?\d+\.\d+)").expect("valid regex"));
static THERMAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Thermal correction to Gibbs Free Energy=\s*(-?\d+\.\d+)").expect("valid regex")
});

/// A Gaussian 09/16 log.
#[derive(Debug, Clone)]
pub struct GaussianReport {
    content: String,
}

impl GaussianReport {
    pub fn new(content: String) -> Self {
        Self { content }
    }

    pub fn detect(content: &str) -> bool {
        content.contains("Gaussian, Inc.") || content.contains("Entering Gaussian System")
    }
}

impl ReportSignals for GaussianReport {
    fn is_finished(&self) -> bool {
        self.content.contains("Normal termination")
    }

    fn is_failed(&self) -> bool {
        self.content.contains("Error termination") || self.content.contains("severe error")
    }

    fn is_converged(&self) -> bool {
        self.content.contains("Stationary point found")
    }

    fn has_imaginary_freq(&self) -> bool {
        let Some(idx) = self.content.rfind("Harmonic frequencies") else {
            return false;
        };
        FREQUENCIES
            .captures_iter(&self.content[idx..])
            .flat_map(|caps| {
                caps[1]
                    .split_whitespace()
                    .filter_map(|token| token.parse::<f64>().ok())
                    .collect::<Vec<_>>()
            })
            .any(|freq| freq < IMAGINARY_THRESHOLD)
    }

    fn charge_mult(&self) -> (i32, u32) {
        CHARGE_MULT
            .captures(&self.content)
            .and_then(|caps| Some((caps[1].parse().ok()?, caps[2].parse().ok()?)))
            .unwrap_or((0, 1))
    }

    fn coordinates(&self) -> Result<String, PipelineError> {
        let idx = self
            .content
            .rfind("Standard orientation")
            .or_else(|| self.content.rfind("Input orientation"))
            .ok_or(PipelineError::NoCoordinates)?;

        // Table layout: title, dashes, two header lines, dashes, atoms, dashes.
        let mut atoms = Vec::new();
        let mut dashes = 0;
        for line in self.content[idx..].lines() {
            if line.contains("--------") {
                dashes += 1;
                if dashes >= 3 {
                    break;
                }
                continue;
            }
            if dashes == 2 {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() >= 6 {
                    let z = fields[1].parse::<u32>().unwrap_or(0);
                    atoms.push(format_atom(element_symbol(z), fields[3], fields[4], fields[5]));
                }
            }
        }

        if atoms.is_empty() {
            return Err(PipelineError::NoCoordinates);
        }
        Ok(atoms.join("\n"))
    }

    fn electronic_energy(&self) -> Option<f64> {
        SCF_ENERGY
            .captures_iter(&self.content)
            .last()
            .and_then(|caps| caps[1].parse().ok())
    }

    fn thermal_correction(&self) -> Option<f64> {
        THERMAL
            .captures(&self.content)
            .and_then(|caps| caps[1].parse().ok())
    }
}
