//! Final free energy of a work item and the results table.
//!
//! `G = E_sp + G_corr + (E_solv - E_gas) + conc_corr`, all in Hartree, where
//! `conc_corr` is the standard-state correction (a per-molecule override or
//! the default, configured in kcal/mol).

use std::fs::{self, File};
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::Constants;
use crate::error::PipelineError;

/// Inputs gathered from the stage reports, Hartree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Energies {
    pub sp: f64,
    pub gas: f64,
    pub solv: f64,
    pub thermal_corr: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GibbsResult {
    pub dg_solv_kcal: f64,
    pub conc_corr_kcal: f64,
    pub g_final_ha: f64,
    pub g_final_kcal: f64,
}

pub fn gibbs(energies: &Energies, item: &str, constants: &Constants) -> GibbsResult {
    let conc_kcal = constants
        .special_conc_corr_kcal
        .get(&item.to_lowercase())
        .copied()
        .unwrap_or(constants.conc_corr_kcal);
    let conc_ha = conc_kcal / constants.hartree_to_kcal;
    let dg_solv = energies.solv - energies.gas;
    let g_final_ha = energies.sp + energies.thermal_corr + dg_solv + conc_ha;

    GibbsResult {
        dg_solv_kcal: dg_solv * constants.hartree_to_kcal,
        conc_corr_kcal: conc_kcal,
        g_final_ha,
        g_final_kcal: g_final_ha * constants.hartree_to_kcal,
    }
}

/// One line of the results table. Fields stay text so rows written by hand
/// or by other tools pass through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct ResultRow {
    #[serde(rename = "Molecule")]
    molecule: String,
    #[serde(rename = "G_Final (kcal/mol)")]
    g_final_kcal: String,
    #[serde(rename = "E_SP (Ha)")]
    sp: String,
    #[serde(rename = "E_Gas (Ha)")]
    gas: String,
    #[serde(rename = "E_Solv (Ha)")]
    solv: String,
    #[serde(rename = "Thermal_Corr (Ha)")]
    thermal_corr: String,
    #[serde(rename = "dG_Solv (kcal/mol)")]
    dg_solv_kcal: String,
    #[serde(rename = "G_Final (Ha)")]
    g_final_ha: String,
}

impl ResultRow {
    fn new(item: &str, energies: &Energies, result: &GibbsResult) -> Self {
        let fixed = |v: f64| format!("{v:.6}");
        Self {
            molecule: item.to_string(),
            g_final_kcal: fixed(result.g_final_kcal),
            sp: fixed(energies.sp),
            gas: fixed(energies.gas),
            solv: fixed(energies.solv),
            thermal_corr: fixed(energies.thermal_corr),
            dg_solv_kcal: fixed(result.dg_solv_kcal),
            g_final_ha: fixed(result.g_final_ha),
        }
    }
}

/// Rows of an existing results file, matched to columns by header name.
/// Unknown columns are dropped; a missing file has no rows.
fn read_rows(path: &Path) -> Result<Vec<ResultRow>, PipelineError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);
    reader
        .deserialize()
        .collect::<Result<Vec<ResultRow>, _>>()
        .map_err(PipelineError::from)
}

/// Replaces the row for `item` in the results CSV and keeps every other
/// molecule's row, in order. The new row goes last.
pub fn upsert_csv(
    path: &Path,
    item: &str,
    energies: &Energies,
    result: &GibbsResult,
) -> Result<(), PipelineError> {
    let mut rows = read_rows(path)?;
    rows.retain(|row| row.molecule != item);
    rows.push(ResultRow::new(item, energies, result));

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("csv.tmp");
    let mut writer = csv::Writer::from_path(&tmp)?;
    for row in &rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    drop(writer);
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const E: Energies = Energies {
        sp: -76.5,
        gas: -76.0,
        solv: -76.1,
        thermal_corr: 0.05,
    };

    const HEADER: &str = "Molecule,G_Final (kcal/mol),E_SP (Ha),E_Gas (Ha),E_Solv (Ha),Thermal_Corr (Ha),dG_Solv (kcal/mol),G_Final (Ha)";

    #[test]
    fn formula_with_default_correction() {
        let c = Constants::default();
        let r = gibbs(&E, "methane", &c);
        let expected_ha = E.sp + E.thermal_corr + (E.solv - E.gas) + 1.89 / 627.509474;
        assert_eq!(r.g_final_ha, expected_ha);
        assert_eq!(r.g_final_kcal, expected_ha * 627.509474);
        assert_eq!(r.dg_solv_kcal, (E.solv - E.gas) * 627.509474);
        assert_eq!(r.conc_corr_kcal, 1.89);
    }

    #[test]
    fn water_has_no_concentration_correction() {
        let c = Constants::default();
        let r = gibbs(&E, "Water", &c);
        let expected_ha = E.sp + E.thermal_corr + (E.solv - E.gas) + 0.0 / 627.509474;
        assert_eq!(r.g_final_ha, expected_ha);
        assert_eq!(r.conc_corr_kcal, 0.0);
    }

    #[test]
    fn repeated_computation_is_bit_identical() {
        let c = Constants::default();
        let first = gibbs(&E, "methane", &c);
        let second = gibbs(&E, "methane", &c);
        assert_eq!(first.g_final_ha.to_bits(), second.g_final_ha.to_bits());
        assert_eq!(first.g_final_kcal.to_bits(), second.g_final_kcal.to_bits());
        assert_eq!(first.dg_solv_kcal.to_bits(), second.dg_solv_kcal.to_bits());
    }

    #[test]
    fn upsert_replaces_same_molecule() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("results.csv");
        let c = Constants::default();

        upsert_csv(&path, "a", &E, &gibbs(&E, "a", &c)).unwrap();
        upsert_csv(&path, "b,c", &E, &gibbs(&E, "b,c", &c)).unwrap();
        let e2 = Energies { sp: -10.0, ..E };
        upsert_csv(&path, "a", &e2, &gibbs(&e2, "a", &c)).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].starts_with("\"b,c\","));
        assert!(lines[2].starts_with("a,"));
        assert!(lines[2].contains(",-10.000000,"));
    }

    #[test]
    fn rows_are_matched_by_molecule_column() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("results.csv");
        // Reordered columns, an extra column, CRLF line endings.
        fs::write(
            &path,
            "Notes,Molecule,G_Final (kcal/mol)\r\nkeep,b,-1.5\r\nold,a,-9.0\r\n",
        )
        .unwrap();

        upsert_csv(&path, "a", &E, &gibbs(&E, "a", &Constants::default())).unwrap();

        let rows = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].molecule, "b");
        assert_eq!(rows[0].g_final_kcal, "-1.5");
        assert_eq!(rows[0].sp, "");
        assert_eq!(rows[1].molecule, "a");
        assert_eq!(rows[1].sp, "-76.500000");
    }

    #[test]
    fn quoted_multiline_field_survives() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("results.csv");
        fs::write(&path, format!("{HEADER}\n\"two\nlines\",1,2,3,4,5,6,7\n")).unwrap();

        upsert_csv(&path, "a", &E, &gibbs(&E, "a", &Constants::default())).unwrap();

        let rows = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].molecule, "two\nlines");
        assert_eq!(rows[0].g_final_ha, "7");
    }
}
