//! Engine report parsing.
//!
//! A [`Report`] wraps the raw text of one engine output file. The dialect is
//! chosen by sniffing the content; both dialects answer the same
//! [`ReportSignals`] questions.

mod gaussian;
mod orca;

use std::ops::Deref;
use std::path::Path;

use crate::error::PipelineError;

pub use gaussian::GaussianReport;
pub use orca::OrcaReport;

/// Frequencies below this value (cm**-1) count as imaginary.
pub const IMAGINARY_THRESHOLD: f64 = -0.1;

/// Signals every report dialect exposes.
pub trait ReportSignals {
    /// Normal-termination banner present.
    fn is_finished(&self) -> bool;
    /// Fatal-error banner present. Callers check this before `is_finished`.
    fn is_failed(&self) -> bool;
    /// Optimization-converged banner present.
    fn is_converged(&self) -> bool;
    /// Any frequency in the last frequency block is below
    /// [`IMAGINARY_THRESHOLD`]. No block means `false`.
    fn has_imaginary_freq(&self) -> bool;
    /// Declared charge and multiplicity, `(0, 1)` when absent.
    fn charge_mult(&self) -> (i32, u32);
    /// Last geometry block, one `Sym x y z` line per atom.
    fn coordinates(&self) -> Result<String, PipelineError>;
    /// Last electronic energy reported, in Hartree.
    fn electronic_energy(&self) -> Option<f64>;
    /// Thermal correction to the Gibbs free energy, in Hartree.
    fn thermal_correction(&self) -> Option<f64>;
}

#[derive(Debug, Clone)]
pub enum Report {
    Gaussian(GaussianReport),
    Orca(OrcaReport),
}

impl Report {
    /// Picks the dialect matching `content`, if any.
    pub fn detect(content: String) -> Option<Self> {
        if GaussianReport::detect(&content) {
            Some(Report::Gaussian(GaussianReport::new(content)))
        } else if OrcaReport::detect(&content) {
            Some(Report::Orca(OrcaReport::new(content)))
        } else {
            None
        }
    }

    /// Reads and sniffs a report file. Bytes that are not valid UTF-8 are
    /// replaced rather than rejected.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let bytes = std::fs::read(path)?;
        let content = String::from_utf8_lossy(&bytes).into_owned();
        Self::detect(content).ok_or_else(|| PipelineError::UnsupportedReport(path.to_path_buf()))
    }

    pub fn dialect(&self) -> &'static str {
        match self {
            Report::Gaussian(_) => "Gaussian",
            Report::Orca(_) => "ORCA",
        }
    }
}

impl Deref for Report {
    type Target = dyn ReportSignals;

    fn deref(&self) -> &Self::Target {
        match self {
            Report::Gaussian(report) => report,
            Report::Orca(report) => report,
        }
    }
}

const ELEMENTS: [&str; 92] = [
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S", "Cl",
    "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As",
    "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In",
    "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm", "Sm", "Eu", "Gd", "Tb",
    "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl",
    "Pb", "Bi", "Po", "At", "Rn", "Fr", "Ra", "Ac", "Th", "Pa", "U",
];

/// Element symbol for an atomic number, `X` when unknown.
pub fn element_symbol(atomic_number: u32) -> &'static str {
    atomic_number
        .checked_sub(1)
        .and_then(|i| ELEMENTS.get(i as usize))
        .copied()
        .unwrap_or("X")
}

pub(crate) fn format_atom(symbol: &str, x: &str, y: &str, z: &str) -> String {
    format!("{symbol:<4} {x:>12} {y:>12} {z:>12}")
}
