//! Result files: `exposures.json`, `lights.json` and the HDR mesh.

use crate::error::{EstimateError, Result};
use crate::scene::light::DetectedLight;
use crate::scene::mesh::Mesh;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Writes `{ frame name: log2(exposure) }`.
pub fn write_exposures<P: AsRef<Path>>(path: P, names: &[String], exposures: &[f64]) -> Result<()> {
    if names.len() != exposures.len() {
        return Err(EstimateError::malformed(format!(
            "{} frame names for {} exposures",
            names.len(),
            exposures.len()
        )));
    }
    let table: BTreeMap<&str, f64> = names
        .iter()
        .map(String::as_str)
        .zip(exposures.iter().map(|e| e.log2()))
        .collect();
    fs::write(path, serde_json::to_string_pretty(&table)?)?;
    Ok(())
}

/// Reads back an `exposures.json` as linear exposures in frame-name order.
pub fn read_exposures<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, f64>> {
    let table: BTreeMap<String, f64> = serde_json::from_str(&fs::read_to_string(path)?)?;
    Ok(table.into_iter().map(|(k, ev)| (k, ev.exp2())).collect())
}

pub fn write_lights<P: AsRef<Path>>(path: P, lights: &[DetectedLight]) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(lights)?)?;
    Ok(())
}

/// Writes the mesh as OBJ with per-vertex radiance in the `v x y z r g b` extension.
pub fn write_hdr_mesh<P: AsRef<Path>>(path: P, mesh: &Mesh) -> Result<()> {
    let radiance = mesh
        .radiance()
        .ok_or_else(|| EstimateError::malformed("mesh carries no radiance to export"))?;
    let mut out = BufWriter::new(File::create(path)?);
    for (p, c) in mesh.positions.iter().zip(radiance) {
        writeln!(out, "v {} {} {} {} {} {}", p.x, p.y, p.z, c.x, c.y, c.z)?;
    }
    for [a, b, c] in &mesh.faces {
        writeln!(out, "f {} {} {}", a + 1, b + 1, c + 1)?;
    }
    out.flush()?;
    Ok(())
}
