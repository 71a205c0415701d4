//! Snapshot I/O (spec.md §6): a `StateVector`'s four modal fields are
//! written as one binary `.fields` file (concatenated, column-major,
//! interleaved real/imaginary `f64` pairs, `u1`, `u2`, `u3`, `b` in that
//! order), alongside a `.params` sidecar carrying scalar parameters as text
//! at at least 30 significant digits, matching `SaveToFile`/`LoadFromFile`
//! /`SaveValueToFile` in `StateVector.cpp`/`ExtendedStateVector.h`. A
//! `CriticalPoint`'s eigenvector component is saved under an `-eig.fields`
//! suffix, exactly `FindCriticalPoint.cpp`'s `CriticalPoint::SaveToFile`.

use crate::error::StratiflowError;
use crate::field::ModalField;
use crate::grid::GridParams;
use crate::operators::reinterpolate_to_grid;
use crate::params::FlowParams;
use crate::state::{CriticalPoint, ExtendedStateVector, StateVector};
use anyhow::{Context, Result};
use num_complex::Complex64;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

fn write_field(writer: &mut impl Write, field: &ModalField) -> Result<()> {
    let n1 = field.field.n1();
    let n2 = field.field.n2();
    let n3 = field.field.n3();
    for i in 0..n1 {
        for j in 0..n2 {
            for v in field.field.stack(i, j).iter().take(n3) {
                writer.write_all(&v.re.to_le_bytes())?;
                writer.write_all(&v.im.to_le_bytes())?;
            }
        }
    }
    Ok(())
}

fn read_field(reader: &mut impl Read, grid: &GridParams, field: &mut ModalField) -> Result<()> {
    let n1 = field.field.n1();
    let n2 = field.field.n2();
    let n3 = field.field.n3();
    let mut re_buf = [0u8; 8];
    let mut im_buf = [0u8; 8];
    for i in 0..n1 {
        for j in 0..n2 {
            for k in 0..n3 {
                reader.read_exact(&mut re_buf)?;
                reader.read_exact(&mut im_buf)?;
                let value = Complex64::new(f64::from_le_bytes(re_buf), f64::from_le_bytes(im_buf));
                field.field.set(i, j, k, value);
            }
        }
    }
    let _ = grid;
    Ok(())
}

fn write_state(path: &Path, state: &StateVector) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating snapshot file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write_field(&mut writer, &state.u1)?;
    write_field(&mut writer, &state.u2)?;
    write_field(&mut writer, &state.u3)?;
    write_field(&mut writer, &state.b)?;
    writer.flush()?;
    Ok(())
}

fn read_state(path: &Path, grid: &GridParams) -> Result<StateVector> {
    let file = File::open(path).with_context(|| format!("opening snapshot file {}", path.display()))?;
    let expected_bytes = 4 * grid.n1 * grid.n2 * grid.actual_n3() * 16;
    let actual_bytes = file.metadata().map(|m| m.len() as usize).unwrap_or(0);
    if actual_bytes != expected_bytes && actual_bytes % (grid.n1 * grid.n2 * 16).max(1) == 0 {
        // bytes-per-stack divides evenly, so the mismatch is consistent with
        // a changed n3 at the same (n1, n2): report it precisely rather than
        // failing deep inside `read_exact` with an opaque I/O error.
        let snap_n3 = actual_bytes / (4 * grid.n1.max(1) * grid.n2.max(1) * 16).max(1);
        anyhow::bail!(StratiflowError::ResolutionMismatch {
            n1: grid.n1,
            n2: grid.n2,
            n3: grid.actual_n3(),
            snap_n1: grid.n1,
            snap_n2: grid.n2,
            snap_n3,
        });
    }
    let mut reader = BufReader::new(file);
    let mut state = StateVector::zeros(grid);
    read_field(&mut reader, grid, &mut state.u1)?;
    read_field(&mut reader, grid, &mut state.u2)?;
    read_field(&mut reader, grid, &mut state.u3)?;
    read_field(&mut reader, grid, &mut state.b)?;
    Ok(state)
}

fn write_params_file(path: &Path, values: &[f64]) -> Result<()> {
    let mut text = String::new();
    for value in values {
        text.push_str(&format!("{value:.30e}\n"));
    }
    std::fs::write(path, text).with_context(|| format!("writing params file {}", path.display()))?;
    Ok(())
}

fn read_params_file(path: &Path) -> Result<Vec<f64>> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading params file {}", path.display()))?;
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim().parse::<f64>().context("parsing params file value"))
        .collect()
}

/// Saves a `StateVector` as `{stem}.fields` (binary) with no sidecar
/// parameters of its own (`StateVector::SaveToFile`).
pub fn save_state(stem: &Path, state: &StateVector) -> Result<()> {
    let fields_path = stem.with_extension("fields");
    write_state(&fields_path, state)
}

pub fn load_state(stem: &Path, grid: &GridParams) -> Result<StateVector> {
    let fields_path = stem.with_extension("fields");
    read_state(&fields_path, grid)
}

/// Saves an `ExtendedStateVector` as `{stem}.fields` + `{stem}.params`
/// (`ExtendedStateVector::SaveToFile`).
pub fn save_extended_state(stem: &Path, state: &ExtendedStateVector) -> Result<()> {
    save_state(stem, &state.x)?;
    write_params_file(&stem.with_extension("params"), &[state.p])
}

pub fn load_extended_state(stem: &Path, grid: &GridParams) -> Result<ExtendedStateVector> {
    let x = load_state(stem, grid)?;
    let params = read_params_file(&stem.with_extension("params"))?;
    let p = *params.first().ok_or_else(|| StratiflowError::Configuration(
        format!("missing Ri value in {}", stem.with_extension("params").display()),
    ))?;
    Ok(ExtendedStateVector { x, p })
}

/// Saves a `CriticalPoint` as `{stem}.fields` (the state `x`), `{stem}-eig.fields`
/// (the eigenvector `v`), and `{stem}.params` (the parameter `p`),
/// `FindCriticalPoint.cpp`'s `CriticalPoint::SaveToFile`.
pub fn save_critical_point(stem: &Path, point: &CriticalPoint) -> Result<()> {
    save_state(stem, &point.x)?;
    let eig_path = eig_stem(stem);
    write_state(&eig_path.with_extension("fields"), &point.v)?;
    write_params_file(&stem.with_extension("params"), &[point.p])
}

pub fn load_critical_point(stem: &Path, grid: &GridParams) -> Result<CriticalPoint> {
    let x = load_state(stem, grid)?;
    let eig_path = eig_stem(stem);
    let v = read_state(&eig_path.with_extension("fields"), grid)?;
    let params = read_params_file(&stem.with_extension("params"))?;
    let p = *params.first().ok_or_else(|| StratiflowError::Configuration(
        format!("missing parameter value in {}", stem.with_extension("params").display()),
    ))?;
    Ok(CriticalPoint { x, v, p })
}

fn eig_stem(stem: &Path) -> std::path::PathBuf {
    let mut name = stem.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push("-eig");
    stem.with_file_name(name)
}

/// Reads a state saved at one resolution and resamples it onto `to`,
/// zero-padding missing high wavenumbers or truncating extra ones
/// (`LoadAndInterpolate`, spec.md §6).
pub fn load_and_interpolate(stem: &Path, from: &GridParams, to: &GridParams) -> Result<StateVector> {
    let loaded = load_state(stem, from)?;
    let mut out = StateVector::zeros(to);
    out.u1 = reinterpolate_to_grid(&loaded.u1, from, to);
    out.u2 = reinterpolate_to_grid(&loaded.u2, from, to);
    out.u3 = reinterpolate_to_grid(&loaded.u3, from, to);
    out.b = reinterpolate_to_grid(&loaded.b, from, to);
    Ok(out)
}

/// Standalone scalar flow-parameter load, used by CLI front ends that build
/// a `FlowParamsCell` from a saved configuration rather than literals.
pub fn load_flow_params(path: &Path) -> Result<FlowParams> {
    let values = read_params_file(path)?;
    if values.len() < 6 {
        anyhow::bail!(StratiflowError::Configuration(format!(
            "flow params file {} has {} values, expected 6 (re, pr, ri, l1, l2, l3)",
            path.display(),
            values.len()
        )));
    }
    Ok(FlowParams::new(values[0], values[1], values[2], values[3], values[4], values[5]))
}

pub fn save_flow_params(path: &Path, params: &FlowParams) -> Result<()> {
    write_params_file(path, &[params.re, params.pr, params.ri, params.l1, params.l2, params.l3])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_free_tests::*;

    // No external tempfile dependency: write into the crate's own target
    // scratch directory via `std::env::temp_dir`, cleaning up afterwards.
    mod tempfile_free_tests {
        pub fn scratch_path(name: &str) -> std::path::PathBuf {
            std::env::temp_dir().join(format!("stratiflow_core_io_test_{name}_{}", std::process::id()))
        }
    }

    #[test]
    fn state_round_trips_through_save_and_load() {
        let grid = GridParams::new(4, 1, 5, 1.0, 1.0, 1.0);
        let mut state = StateVector::zeros(&grid);
        state.u1.field.set(1, 0, 2, Complex64::new(3.0, -1.5));
        state.b.field.set(0, 0, 0, Complex64::new(2.0, 0.0));

        let path = scratch_path("state");
        save_state(&path, &state).unwrap();
        let loaded = load_state(&path, &grid).unwrap();

        assert_eq!(loaded.u1.field.get(1, 0, 2), &Complex64::new(3.0, -1.5));
        assert_eq!(loaded.b.field.get(0, 0, 0), &Complex64::new(2.0, 0.0));

        std::fs::remove_file(path.with_extension("fields")).ok();
    }

    #[test]
    fn critical_point_round_trips_with_eig_suffix_and_params() {
        let grid = GridParams::new(4, 1, 5, 1.0, 1.0, 1.0);
        let mut point = CriticalPoint::zeros(&grid);
        point.p = 0.125;
        point.v.u1.field.set(0, 0, 0, Complex64::new(9.0, 0.0));

        let path = scratch_path("critical");
        save_critical_point(&path, &point).unwrap();
        let loaded = load_critical_point(&path, &grid).unwrap();

        assert!((loaded.p - 0.125).abs() < 1e-12);
        assert_eq!(loaded.v.u1.field.get(0, 0, 0), &Complex64::new(9.0, 0.0));

        std::fs::remove_file(path.with_extension("fields")).ok();
        std::fs::remove_file(eig_stem(&path).with_extension("fields")).ok();
        std::fs::remove_file(path.with_extension("params")).ok();
    }

    #[test]
    fn flow_params_round_trip_preserves_values() {
        let params = FlowParams::new(500.0, 8.0, 0.16, 16.0, 1.0, 5.0);
        let path = scratch_path("flowparams");
        save_flow_params(&path, &params).unwrap();
        let loaded = load_flow_params(&path).unwrap();
        assert!((loaded.re - params.re).abs() < 1e-9);
        assert!((loaded.ri - params.ri).abs() < 1e-9);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn load_flow_params_rejects_truncated_file() {
        let path = scratch_path("flowparams_bad");
        std::fs::write(&path, "1.0\n2.0\n").unwrap();
        assert!(load_flow_params(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
