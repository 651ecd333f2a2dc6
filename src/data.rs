//! Survey input files.
//!
//! Both inputs are whitespace-delimited text tables. Blank lines and lines
//! starting with `#` are skipped.
//!
//! - Topography: one `x y z` row per point.
//! - Observations: at least five columns per row. Receiver coordinates and
//!   the measured field value are located through [`ObservationColumns`];
//!   with the default layout column 3 is present in the file but skipped.

use crate::error::{InversionError, InversionResult};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::info;

/// Fraction of the largest absolute datum used as the uncertainty of every datum.
///
/// This is a fixed noise policy, not an uncertainty derived from the
/// measurements.
pub const UNCERTAINTY_FLOOR_FRACTION: f64 = 0.02;

/// Zero-based column indices of the observation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ObservationColumns {
    #[serde(default = "default_x")]
    pub x: usize,
    #[serde(default = "default_y")]
    pub y: usize,
    #[serde(default = "default_z")]
    pub z: usize,
    /// Measured field value (nT). Column 4 in the standard layout.
    #[serde(default = "default_value")]
    pub value: usize,
}

fn default_x() -> usize { 0 }
fn default_y() -> usize { 1 }
fn default_z() -> usize { 2 }
fn default_value() -> usize { 4 }

impl Default for ObservationColumns {
    fn default() -> Self {
        Self {
            x: 0,
            y: 1,
            z: 2,
            value: 4,
        }
    }
}

impl ObservationColumns {
    /// Smallest column count a row must have for this layout.
    pub fn min_columns(&self) -> usize {
        // Skipped columns still count: the default layout needs five.
        [self.x, self.y, self.z, self.value]
            .into_iter()
            .max()
            .unwrap_or(0)
            + 1
    }

    pub fn validate(&self) -> InversionResult<()> {
        let cols = [self.x, self.y, self.z, self.value];
        for (i, a) in cols.iter().enumerate() {
            if cols[i + 1..].contains(a) {
                return Err(InversionError::config(format!(
                    "data.columns indices must be distinct, column {} used twice",
                    a
                )));
            }
        }
        Ok(())
    }
}

/// Receiver geometry and measured data, aligned row by row.
#[derive(Debug, Clone)]
pub struct Observations {
    /// N x 3 receiver locations (x, y, z).
    pub locations: Array2<f64>,
    pub values: Array1<f64>,
    pub standard_deviation: Array1<f64>,
}

impl Observations {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Parse a whitespace-delimited numeric table, requiring `min_columns` per row.
///
/// Returns each row together with its one-based line number.
fn read_table(path: &Path, min_columns: usize) -> InversionResult<Vec<(usize, Vec<f64>)>> {
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => InversionError::FileNotFound {
            path: path.to_path_buf(),
        },
        _ => InversionError::Io(e),
    })?;

    let mut rows = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(|tok| {
                tok.parse::<f64>().map_err(|_| InversionError::Format {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    message: format!("'{}' is not a number", tok),
                })
            })
            .collect::<InversionResult<Vec<f64>>>()?;
        if row.len() < min_columns {
            return Err(InversionError::Format {
                path: path.to_path_buf(),
                line: idx + 1,
                message: format!("expected at least {} columns, found {}", min_columns, row.len()),
            });
        }
        if let Some(bad) = row.iter().find(|v| !v.is_finite()) {
            return Err(InversionError::Format {
                path: path.to_path_buf(),
                line: idx + 1,
                message: format!("non-finite value {}", bad),
            });
        }
        rows.push((idx + 1, row));
    }

    if rows.is_empty() {
        return Err(InversionError::Format {
            path: path.to_path_buf(),
            line: 0,
            message: "file contains no data rows".to_string(),
        });
    }
    Ok(rows)
}

/// Load topography points as an N x 3 array.
pub fn load_topography(path: &Path) -> InversionResult<Array2<f64>> {
    let rows = read_table(path, 3)?;
    let mut points = Array2::zeros((rows.len(), 3));
    for (i, (_, row)) in rows.iter().enumerate() {
        for k in 0..3 {
            points[[i, k]] = row[k];
        }
    }
    info!(points = points.nrows(), path = %path.display(), "loaded topography");
    Ok(points)
}

/// Load receiver locations and observed values, and derive the uncertainty floor.
pub fn load_observations(path: &Path, columns: &ObservationColumns) -> InversionResult<Observations> {
    columns.validate()?;
    let rows = read_table(path, columns.min_columns())?;

    let n = rows.len();
    let mut locations = Array2::zeros((n, 3));
    let mut values = Array1::zeros(n);
    for (i, (_, row)) in rows.iter().enumerate() {
        locations[[i, 0]] = row[columns.x];
        locations[[i, 1]] = row[columns.y];
        locations[[i, 2]] = row[columns.z];
        values[i] = row[columns.value];
    }

    let standard_deviation = uncertainty_floor(&values);
    info!(
        data = n,
        std = standard_deviation.first().copied().unwrap_or(0.0),
        path = %path.display(),
        "loaded observations"
    );

    Ok(Observations {
        locations,
        values,
        standard_deviation,
    })
}

/// Constant uncertainty: [`UNCERTAINTY_FLOOR_FRACTION`] of the largest |datum|,
/// repeated for every datum.
pub fn uncertainty_floor(values: &Array1<f64>) -> Array1<f64> {
    let max_abs = values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    Array1::from_elem(values.len(), UNCERTAINTY_FLOOR_FRACTION * max_abs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::path::PathBuf;

    fn scratch(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "maginv_data_{}_{}.txt",
            name,
            std::process::id()
        ));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_topography_three_points() {
        let path = scratch("topo3", "0 0 10\n1 0 10\n2 0 10\n");
        let topo = load_topography(&path).unwrap();
        assert_eq!(topo.dim(), (3, 3));
        assert_relative_eq!(topo[[1, 0]], 1.0);
        assert_relative_eq!(topo[[2, 2]], 10.0);
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_observation_floor_two_rows() {
        let path = scratch("obs2", "0 0 12 0 100\n5 0 12 0 100\n");
        let obs = load_observations(&path, &ObservationColumns::default()).unwrap();
        assert_eq!(obs.len(), 2);
        assert_eq!(obs.locations.nrows(), 2);
        assert_eq!(obs.standard_deviation.len(), 2);
        for s in obs.standard_deviation.iter() {
            assert_relative_eq!(*s, 2.0, epsilon = 1e-12);
        }
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_value_read_from_column_four_not_three() {
        let path = scratch("col4", "1 2 3 -999 42.5\n");
        let obs = load_observations(&path, &ObservationColumns::default()).unwrap();
        assert_relative_eq!(obs.values[0], 42.5);
        assert_relative_eq!(obs.locations[[0, 2]], 3.0);
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_floor_uses_absolute_maximum() {
        let values = Array1::from(vec![-250.0, 10.0, 100.0]);
        let std = uncertainty_floor(&values);
        assert!(std.iter().all(|s| (*s - 5.0).abs() < 1e-12));
    }

    #[test]
    fn test_too_few_observation_columns() {
        let path = scratch("short", "0 0 12 100\n");
        let err = load_observations(&path, &ObservationColumns::default()).unwrap_err();
        match err {
            InversionError::Format { line, .. } => assert_eq!(line, 1),
            other => panic!("unexpected error: {other}"),
        }
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_missing_file() {
        let path = std::env::temp_dir().join("maginv_data_does_not_exist.txt");
        let err = load_topography(&path).unwrap_err();
        assert!(matches!(err, InversionError::FileNotFound { .. }));
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let path = scratch("comments", "# x y z\n\n0 0 1\n  \n1 1 2\n");
        let topo = load_topography(&path).unwrap();
        assert_eq!(topo.nrows(), 2);
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_non_numeric_token_reports_line() {
        let path = scratch("nan", "0 0 1\n0 x 1\n");
        let err = load_topography(&path).unwrap_err();
        match err {
            InversionError::Format { line, message, .. } => {
                assert_eq!(line, 2);
                assert!(message.contains("'x'"));
            }
            other => panic!("unexpected error: {other}"),
        }
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_empty_file_rejected() {
        let path = scratch("empty", "# only a header\n");
        assert!(matches!(
            load_topography(&path),
            Err(InversionError::Format { .. })
        ));
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_duplicate_columns_rejected() {
        let cols = ObservationColumns {
            value: 2,
            ..Default::default()
        };
        assert!(cols.validate().is_err());
    }

    #[test]
    fn test_min_columns_tracks_value_index() {
        assert_eq!(ObservationColumns::default().min_columns(), 5);
        let cols = ObservationColumns {
            value: 6,
            ..Default::default()
        };
        assert_eq!(cols.min_columns(), 7);
    }
}
