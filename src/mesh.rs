//! Tensor mesh and the active-cell map below topography.
//!
//! Cells are numbered with x varying fastest, then y, then z.

use crate::error::{InversionError, InversionResult};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::info;

/// One run of cell widths along an axis.
///
/// `[width, count]` repeats `width` `count` times. `[width, count, factor]`
/// grows geometrically: `width * factor^1 .. width * factor^count`. A negative
/// factor produces the same widths in reverse order, so padding expands toward
/// the low end of the axis.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum WidthSegment {
    Expanding(f64, usize, f64),
    Uniform(f64, usize),
}

impl WidthSegment {
    fn unpack(&self, out: &mut Vec<f64>) -> InversionResult<()> {
        match *self {
            WidthSegment::Uniform(h, n) => {
                if !(h.is_finite() && h > 0.0) {
                    return Err(InversionError::config(format!("cell width {} must be positive", h)));
                }
                out.extend(std::iter::repeat(h).take(n));
            }
            WidthSegment::Expanding(h, n, r) => {
                if !(h.is_finite() && h > 0.0) {
                    return Err(InversionError::config(format!("cell width {} must be positive", h)));
                }
                if !r.is_finite() || r.abs() < 1.0 {
                    return Err(InversionError::config(format!(
                        "expansion factor {} must have magnitude >= 1",
                        r
                    )));
                }
                let grow: Vec<f64> = (1..=n).map(|i| h * r.abs().powi(i as i32)).collect();
                if r < 0.0 {
                    out.extend(grow.into_iter().rev());
                } else {
                    out.extend(grow);
                }
            }
        }
        Ok(())
    }
}

/// Placement of the mesh along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Axis starts at 0.
    Zero,
    /// Axis is centred on 0.
    Centered,
    /// Axis ends at 0.
    Negative,
}

impl Origin {
    fn offset(&self, total: f64) -> f64 {
        match self {
            Origin::Zero => 0.0,
            Origin::Centered => -0.5 * total,
            Origin::Negative => -total,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TensorMesh {
    widths: [Vec<f64>; 3],
    centers: [Vec<f64>; 3],
    origin: [f64; 3],
}

impl TensorMesh {
    pub fn new(widths: [Vec<f64>; 3], origin: [f64; 3]) -> InversionResult<Self> {
        for (axis, h) in widths.iter().enumerate() {
            if h.is_empty() {
                return Err(InversionError::config(format!("mesh axis {} has no cells", axis)));
            }
            if h.iter().any(|w| !(w.is_finite() && *w > 0.0)) {
                return Err(InversionError::config(format!(
                    "mesh axis {} has non-positive widths",
                    axis
                )));
            }
        }
        let centers = [0, 1, 2].map(|axis| {
            let mut edge = origin[axis];
            widths[axis]
                .iter()
                .map(|w| {
                    let c = edge + 0.5 * w;
                    edge += w;
                    c
                })
                .collect::<Vec<f64>>()
        });
        Ok(Self {
            widths,
            centers,
            origin,
        })
    }

    /// Build from per-axis segments and origin placement.
    pub fn from_segments(segments: [&[WidthSegment]; 3], placement: [Origin; 3]) -> InversionResult<Self> {
        let mut widths: [Vec<f64>; 3] = Default::default();
        for axis in 0..3 {
            for seg in segments[axis] {
                seg.unpack(&mut widths[axis])?;
            }
        }
        let mut origin = [0.0; 3];
        for axis in 0..3 {
            let total: f64 = widths[axis].iter().sum();
            origin[axis] = placement[axis].offset(total);
        }
        let mesh = Self::new(widths, origin)?;
        info!(
            nx = mesh.shape()[0],
            ny = mesh.shape()[1],
            nz = mesh.shape()[2],
            cells = mesh.n_cells(),
            "mesh built"
        );
        Ok(mesh)
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.widths[0].len(), self.widths[1].len(), self.widths[2].len()]
    }

    pub fn n_cells(&self) -> usize {
        let [nx, ny, nz] = self.shape();
        nx * ny * nz
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    pub fn widths(&self, axis: usize) -> &[f64] {
        &self.widths[axis]
    }

    pub fn centers(&self, axis: usize) -> &[f64] {
        &self.centers[axis]
    }

    pub fn cell_index(&self, ix: usize, iy: usize, iz: usize) -> usize {
        let [nx, ny, _] = self.shape();
        ix + nx * (iy + ny * iz)
    }

    pub fn cell_ijk(&self, index: usize) -> [usize; 3] {
        let [nx, ny, _] = self.shape();
        [index % nx, (index / nx) % ny, index / (nx * ny)]
    }

    pub fn cell_center(&self, index: usize) -> [f64; 3] {
        let [i, j, k] = self.cell_ijk(index);
        [self.centers[0][i], self.centers[1][j], self.centers[2][k]]
    }

    pub fn cell_volume(&self, index: usize) -> f64 {
        let [i, j, k] = self.cell_ijk(index);
        self.widths[0][i] * self.widths[1][j] * self.widths[2][k]
    }

    /// Smallest cell width anywhere in the mesh.
    pub fn min_width(&self) -> f64 {
        self.widths
            .iter()
            .flat_map(|h| h.iter())
            .fold(f64::INFINITY, |a, &b| a.min(b))
    }
}

/// Map between mesh cells and the entries of the model vector.
#[derive(Debug, Clone)]
pub struct ActiveCells {
    mask: Vec<bool>,
    indices: Vec<usize>,
    lookup: Vec<Option<usize>>,
}

impl ActiveCells {
    pub fn from_mask(mask: Vec<bool>) -> InversionResult<Self> {
        let mut indices = Vec::new();
        let mut lookup = vec![None; mask.len()];
        for (i, &active) in mask.iter().enumerate() {
            if active {
                lookup[i] = Some(indices.len());
                indices.push(i);
            }
        }
        if indices.is_empty() {
            return Err(InversionError::config("no active cells below topography"));
        }
        Ok(Self {
            mask,
            indices,
            lookup,
        })
    }

    pub fn n_active(&self) -> usize {
        self.indices.len()
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    pub fn is_active(&self, cell: usize) -> bool {
        self.mask.get(cell).copied().unwrap_or(false)
    }

    /// Model-vector position of a mesh cell, if active.
    pub fn active_index(&self, cell: usize) -> Option<usize> {
        self.lookup.get(cell).copied().flatten()
    }

    /// Mesh cell of each model-vector entry, in model order.
    pub fn cells(&self) -> &[usize] {
        &self.indices
    }
}

/// Mark every cell whose centre lies at or below the topography.
///
/// The topographic elevation of each (x, y) column is taken from the nearest
/// topography point in plan view.
pub fn active_cells(mesh: &TensorMesh, topography: &Array2<f64>) -> InversionResult<ActiveCells> {
    if topography.nrows() == 0 || topography.ncols() != 3 {
        return Err(InversionError::config("topography must be a non-empty N x 3 array"));
    }
    let [nx, ny, nz] = mesh.shape();
    let mut mask = vec![false; mesh.n_cells()];

    for iy in 0..ny {
        let y = mesh.centers(1)[iy];
        for ix in 0..nx {
            let x = mesh.centers(0)[ix];
            let mut best = f64::INFINITY;
            let mut elevation = topography[[0, 2]];
            for row in topography.rows() {
                let d2 = (row[0] - x).powi(2) + (row[1] - y).powi(2);
                if d2 < best {
                    best = d2;
                    elevation = row[2];
                }
            }
            for iz in 0..nz {
                if mesh.centers(2)[iz] <= elevation {
                    mask[mesh.cell_index(ix, iy, iz)] = true;
                }
            }
        }
    }

    let active = ActiveCells::from_mask(mask)?;
    info!(active = active.n_active(), total = mesh.n_cells(), "active cells below topography");
    Ok(active)
}

/// Adjacent pair of active cells along one axis, as model-vector indices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellPair {
    pub lower: usize,
    pub upper: usize,
    /// Centre-to-centre distance.
    pub distance: f64,
}

/// All pairs of face-sharing active cells along `axis` (0 = x, 1 = y, 2 = z).
pub fn active_neighbours(mesh: &TensorMesh, active: &ActiveCells, axis: usize) -> Vec<CellPair> {
    let shape = mesh.shape();
    let mut pairs = Vec::new();
    for (a, &cell) in active.cells().iter().enumerate() {
        let mut ijk = mesh.cell_ijk(cell);
        if ijk[axis] + 1 >= shape[axis] {
            continue;
        }
        let here = mesh.centers(axis)[ijk[axis]];
        ijk[axis] += 1;
        let next = mesh.cell_index(ijk[0], ijk[1], ijk[2]);
        if let Some(b) = active.active_index(next) {
            pairs.push(CellPair {
                lower: a,
                upper: b,
                distance: mesh.centers(axis)[ijk[axis]] - here,
            });
        }
    }
    pairs
}
