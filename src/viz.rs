//! Hand-off of the recovered model to a slice renderer.
//!
//! The built-in renderer writes one CSV per slice with the in-plane cell
//! centres and the model value of every cell of the full mesh.

use crate::error::{InversionError, InversionResult};
use crate::mesh::{ActiveCells, TensorMesh};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceAxis {
    X,
    Y,
    Z,
}

impl SliceAxis {
    pub fn index(self) -> usize {
        match self {
            SliceAxis::X => 0,
            SliceAxis::Y => 1,
            SliceAxis::Z => 2,
        }
    }

    /// The two in-plane axes, in increasing order.
    fn plane(self) -> (usize, usize) {
        match self {
            SliceAxis::X => (1, 2),
            SliceAxis::Y => (0, 2),
            SliceAxis::Z => (0, 1),
        }
    }
}

/// What to draw for cells above topography.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InactiveCells {
    Omit,
    Fill(f64),
}

impl Default for InactiveCells {
    fn default() -> Self {
        InactiveCells::Omit
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceRequest {
    pub axis: SliceAxis,
    pub index: usize,
    pub path: PathBuf,
    #[serde(default)]
    pub inactive: InactiveCells,
}

pub trait SliceRenderer {
    fn render(
        &mut self,
        mesh: &TensorMesh,
        active: &ActiveCells,
        model: &Array1<f64>,
        request: &SliceRequest,
    ) -> InversionResult<()>;
}

/// Cells of one slice as `(u, v, value)` with inactive cells handled per request.
pub fn slice_values(
    mesh: &TensorMesh,
    active: &ActiveCells,
    model: &Array1<f64>,
    axis: SliceAxis,
    index: usize,
    inactive: InactiveCells,
) -> InversionResult<Vec<(f64, f64, f64)>> {
    if model.len() != active.n_active() {
        return Err(InversionError::config(format!(
            "model has {} entries, mesh has {} active cells",
            model.len(),
            active.n_active()
        )));
    }
    let shape = mesh.shape();
    let a = axis.index();
    if index >= shape[a] {
        return Err(InversionError::config(format!(
            "slice index {} out of range for axis {:?} with {} cells",
            index, axis, shape[a]
        )));
    }
    let (u, v) = axis.plane();
    let mut out = Vec::with_capacity(shape[u] * shape[v]);
    for jv in 0..shape[v] {
        for ju in 0..shape[u] {
            let mut ijk = [0usize; 3];
            ijk[a] = index;
            ijk[u] = ju;
            ijk[v] = jv;
            let cell = mesh.cell_index(ijk[0], ijk[1], ijk[2]);
            let value = match (active.active_index(cell), inactive) {
                (Some(i), _) => model[i],
                (None, InactiveCells::Fill(fill)) => fill,
                (None, InactiveCells::Omit) => continue,
            };
            out.push((mesh.centers(u)[ju], mesh.centers(v)[jv], value));
        }
    }
    Ok(out)
}

pub struct CsvSliceWriter;

impl SliceRenderer for CsvSliceWriter {
    fn render(
        &mut self,
        mesh: &TensorMesh,
        active: &ActiveCells,
        model: &Array1<f64>,
        request: &SliceRequest,
    ) -> InversionResult<()> {
        let cells = slice_values(mesh, active, model, request.axis, request.index, request.inactive)?;
        write_slice(&request.path, request.axis, &cells)?;
        info!(
            path = %request.path.display(),
            axis = ?request.axis,
            index = request.index,
            cells = cells.len(),
            "slice written"
        );
        Ok(())
    }
}

fn write_slice(path: &Path, axis: SliceAxis, cells: &[(f64, f64, f64)]) -> InversionResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let names = ["x", "y", "z"];
    let (u, v) = axis.plane();
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "{},{},susceptibility", names[u], names[v])?;
    for (cu, cv, value) in cells {
        writeln!(w, "{:.6},{:.6},{:.10e}", cu, cv, value)?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{Origin, WidthSegment};
    use ndarray::array;

    fn setup() -> (TensorMesh, ActiveCells) {
        let mesh = TensorMesh::from_segments(
            [
                &[WidthSegment::Uniform(1.0, 2)],
                &[WidthSegment::Uniform(1.0, 2)],
                &[WidthSegment::Uniform(1.0, 2)],
            ],
            [Origin::Zero; 3],
        )
        .unwrap();
        // Top layer (iz = 1) has one inactive cell.
        let mut mask = vec![true; 8];
        mask[mesh.cell_index(1, 1, 1)] = false;
        let active = ActiveCells::from_mask(mask).unwrap();
        (mesh, active)
    }

    #[test]
    fn test_omit_drops_inactive_cells() {
        let (mesh, active) = setup();
        let model = Array1::from_iter((0..7).map(|i| i as f64));
        let cells = slice_values(&mesh, &active, &model, SliceAxis::Z, 1, InactiveCells::Omit).unwrap();
        assert_eq!(cells.len(), 3);
        let bottom = slice_values(&mesh, &active, &model, SliceAxis::Z, 0, InactiveCells::Omit).unwrap();
        assert_eq!(bottom.len(), 4);
        assert_eq!(bottom[0], (0.5, 0.5, 0.0));
    }

    #[test]
    fn test_fill_replaces_inactive_cells() {
        let (mesh, active) = setup();
        let model = Array1::ones(7);
        let cells =
            slice_values(&mesh, &active, &model, SliceAxis::Z, 1, InactiveCells::Fill(-1.0)).unwrap();
        assert_eq!(cells.len(), 4);
        assert_eq!(cells[3], (1.5, 1.5, -1.0));
    }

    #[test]
    fn test_out_of_range_index() {
        let (mesh, active) = setup();
        let model = Array1::ones(7);
        assert!(slice_values(&mesh, &active, &model, SliceAxis::X, 2, InactiveCells::Omit).is_err());
        assert!(slice_values(&mesh, &active, &array![1.0], SliceAxis::X, 0, InactiveCells::Omit).is_err());
    }

    #[test]
    fn test_inactive_policy_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            slice: SliceRequest,
        }
        let w: Wrapper = toml::from_str(
            "[slice]\naxis = \"z\"\nindex = 3\npath = \"s.csv\"\ninactive = { fill = -100.0 }\n",
        )
        .unwrap();
        assert_eq!(w.slice.inactive, InactiveCells::Fill(-100.0));
        let w: Wrapper =
            toml::from_str("[slice]\naxis = \"x\"\nindex = 0\npath = \"s.csv\"\ninactive = \"omit\"\n").unwrap();
        assert_eq!(w.slice.inactive, InactiveCells::Omit);
        assert_eq!(w.slice.axis, SliceAxis::X);
    }

    #[test]
    fn test_csv_writer_writes_header_and_rows() {
        let (mesh, active) = setup();
        let path = std::env::temp_dir().join(format!("maginv_slice_{}.csv", std::process::id()));
        let request = SliceRequest {
            axis: SliceAxis::Y,
            index: 0,
            path: path.clone(),
            inactive: InactiveCells::Omit,
        };
        CsvSliceWriter
            .render(&mesh, &active, &Array1::zeros(7), &request)
            .unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("x,z,susceptibility\n"));
        assert_eq!(text.lines().count(), 5);
        let _ = fs::remove_file(&path);
    }
}
