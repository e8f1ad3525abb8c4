use once_cell::sync::Lazy;
use regex::Regex;

use super::{IMAGINARY_THRESHOLD, ReportSignals, format_atom};
use crate::error::PipelineError;

const FREQ_HEADER: &str = "VIBRATIONAL FREQUENCIES";
const COORD_HEADER: &str = "CARTESIAN COORDINATES (ANGSTROEM)";

static FREQUENCY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":\s+(-?\d+\.\d+)\s+cm\*\*-1").expect("valid regex"));
static XYZ_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\s*xyz\s+(-?\d+)\s+(\d+)").expect("valid regex"));
static CHARGE_MULT_SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)Total Charge\s+Charge\s+\.+\s+(-?\d+).*?Mult\s+\.+\s+(\d+)")
        .expect("valid regex")
});
static FINAL_ENERGY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"FINAL SINGLE POINT ENERGY\s+(-?\d+\.\d+)").expect("valid regex"));
static THERMAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"G-E\(el\)\s+.*?(-?\d+\.\d+)\s+Eh").expect("valid regex"));

/// An ORCA output file.
#[derive(Debug, Clone)]
pub struct OrcaReport {
    content: String,
}

impl OrcaReport {
    pub fn new(content: String) -> Self {
        Self { content }
    }

    pub fn detect(content: &str) -> bool {
        content.contains("* O   R   C   A *")
    }
}

impl ReportSignals for OrcaReport {
    fn is_finished(&self) -> bool {
        self.content.contains("ORCA TERMINATED NORMALLY")
    }

    fn is_failed(&self) -> bool {
        self.content.contains("ORCA finished by error") || self.content.contains("FATAL ERROR")
    }

    fn is_converged(&self) -> bool {
        self.content.contains("THE OPTIMIZATION HAS CONVERGED")
    }

    fn has_imaginary_freq(&self) -> bool {
        let Some(idx) = self.content.rfind(FREQ_HEADER) else {
            return false;
        };
        FREQUENCY
            .captures_iter(&self.content[idx..])
            .filter_map(|caps| caps[1].parse::<f64>().ok())
            .any(|freq| freq < IMAGINARY_THRESHOLD)
    }

    fn charge_mult(&self) -> (i32, u32) {
        XYZ_LINE
            .captures(&self.content)
            .or_else(|| CHARGE_MULT_SUMMARY.captures(&self.content))
            .and_then(|caps| Some((caps[1].parse().ok()?, caps[2].parse().ok()?)))
            .unwrap_or((0, 1))
    }

    fn coordinates(&self) -> Result<String, PipelineError> {
        let idx = self
            .content
            .rfind(COORD_HEADER)
            .ok_or(PipelineError::NoCoordinates)?;
        let block = &self.content[idx + COORD_HEADER.len()..];

        let mut atoms = Vec::new();
        for line in block.trim_start().lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("-------") {
                if atoms.is_empty() {
                    continue;
                }
                break;
            }
            if trimmed.is_empty() {
                break;
            }
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() >= 4 {
                atoms.push(format_atom(fields[0], fields[1], fields[2], fields[3]));
            }
        }

        if atoms.is_empty() {
            return Err(PipelineError::NoCoordinates);
        }
        Ok(atoms.join("\n"))
    }

    fn electronic_energy(&self) -> Option<f64> {
        FINAL_ENERGY
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

#[cfg(test)]
mod tests {
    use super::*;

    const OPT_OUT: &str = "
                                 * O   R   C   A *

 Total Charge           Charge          ...    1
 Multiplicity           Mult            ...    2

 FINAL SINGLE POINT ENERGY       -76.0000
 FINAL SINGLE POINT ENERGY       -76.5000

      THE OPTIMIZATION HAS CONVERGED

 CARTESIAN COORDINATES (ANGSTROEM)
 ---------------------------------
 C      9.000000    9.000000    9.000000

 VIBRATIONAL FREQUENCIES
    0:   100.50 cm**-1
    1:   200.60 cm**-1

 G-E(el)                               ...      0.05000 Eh

 FINAL ENERGY EVALUATION AT THE STATIONARY POINT

 CARTESIAN COORDINATES (ANGSTROEM)
 ---------------------------------
 O      0.000000    0.000000    0.117790
 H      0.000000    0.758602   -0.471160
 H      0.000000   -0.758602   -0.471160

 ****ORCA TERMINATED NORMALLY****
";

    fn report(text: &str) -> OrcaReport {
        OrcaReport::new(text.to_string())
    }

    #[test]
    fn banners() {
        let r = report(OPT_OUT);
        assert!(r.is_finished());
        assert!(r.is_converged());
        assert!(!r.is_failed());

        assert!(report("* O   R   C   A *\n ORCA finished by error termination in SCF\n").is_failed());
        assert!(report("* O   R   C   A *\n FATAL ERROR ENCOUNTERED\n").is_failed());
    }

    #[test]
    fn last_energy_wins() {
        assert_eq!(report(OPT_OUT).electronic_energy(), Some(-76.5));
        assert_eq!(report("* O   R   C   A *").electronic_energy(), None);
    }

    #[test]
    fn thermal_correction_parsed() {
        assert_eq!(report(OPT_OUT).thermal_correction(), Some(0.05));
    }

    #[test]
    fn imaginary_frequency_detection() {
        assert!(!report(OPT_OUT).has_imaginary_freq());
        let imag = report(" VIBRATIONAL FREQUENCIES\n 0:   100.50 cm**-1\n 1:   -50.20 cm**-1\n 2:   300.70 cm**-1\n");
        assert!(imag.has_imaginary_freq());
        assert!(!report("* O   R   C   A *").has_imaginary_freq());
    }

    #[test]
    fn charge_mult_sources() {
        assert_eq!(report(OPT_OUT).charge_mult(), (1, 2));
        assert_eq!(report("! B3LYP\n* xyz -2 3\nO 0 0 0\n*").charge_mult(), (-2, 3));
        assert_eq!(report("* O   R   C   A *").charge_mult(), (0, 1));
    }

    #[test]
    fn coordinates_from_last_block() {
        let coords = report(OPT_OUT).coordinates().unwrap();
        let lines: Vec<&str> = coords.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("O "));
        assert!(!coords.contains("9.000000"));
    }

    #[test]
    fn no_coordinates_is_an_error() {
        assert!(matches!(
            report("* O   R   C   A *").coordinates(),
            Err(PipelineError::NoCoordinates)
        ));
    }
}
