//! Forward modelling of magnetic data from a susceptibility model.
//!
//! [`ForwardSimulation`] is the seam the misfit, the directives and the
//! optimizer talk to. [`IntegralSimulation`] is the built-in backend: a dense
//! sensitivity matrix in which every active cell acts as an induced point
//! dipole at its centre.

use crate::mesh::{ActiveCells, TensorMesh};
use crate::survey::{Component, Survey};
use ndarray::{Array1, Array2};
use std::f64::consts::PI;
use tracing::info;

/// Predicted-data provider over the active-cell model vector.
pub trait ForwardSimulation {
    fn n_data(&self) -> usize;

    fn n_model(&self) -> usize;

    fn dpred(&self, model: &Array1<f64>) -> Array1<f64>;

    /// Sensitivity times a model-space vector.
    fn jvec(&self, model: &Array1<f64>, v: &Array1<f64>) -> Array1<f64>;

    /// Transposed sensitivity times a data-space vector.
    fn jtvec(&self, model: &Array1<f64>, v: &Array1<f64>) -> Array1<f64>;

    /// Diagonal of `J^T diag(w)^2 J`.
    fn jtj_diag(&self, model: &Array1<f64>, w: &Array1<f64>) -> Array1<f64>;
}

/// Linear simulation `d = G m` with a stored sensitivity matrix.
#[derive(Debug, Clone)]
pub struct IntegralSimulation {
    g: Array2<f64>,
}

impl IntegralSimulation {
    /// Assemble the dipole sensitivity for every (datum, active cell) pair.
    ///
    /// Rows are ordered receiver-major, component-minor. Receiver-to-cell
    /// distances are floored at half the smallest cell width.
    pub fn new(mesh: &TensorMesh, survey: &Survey, active: &ActiveCells) -> Self {
        let src = survey.source();
        let b_hat = src.direction();
        let components = survey.components();
        let n_comp = components.len();
        let locs = survey.locations();
        let r_min = 0.5 * mesh.min_width();

        let mut g = Array2::zeros((survey.n_data(), active.n_active()));
        for (col, &cell) in active.cells().iter().enumerate() {
            let c = mesh.cell_center(cell);
            let scale = src.strength_nt * mesh.cell_volume(cell) / (4.0 * PI);
            for rx in 0..survey.n_receivers() {
                let r = [locs[[rx, 0]] - c[0], locs[[rx, 1]] - c[1], locs[[rx, 2]] - c[2]];
                let dist = (r[0] * r[0] + r[1] * r[1] + r[2] * r[2]).sqrt().max(r_min);
                let r_hat = [r[0] / dist, r[1] / dist, r[2] / dist];
                let proj = b_hat[0] * r_hat[0] + b_hat[1] * r_hat[1] + b_hat[2] * r_hat[2];
                let k = scale / dist.powi(3);
                let field = [
                    k * (3.0 * proj * r_hat[0] - b_hat[0]),
                    k * (3.0 * proj * r_hat[1] - b_hat[1]),
                    k * (3.0 * proj * r_hat[2] - b_hat[2]),
                ];
                for (ic, comp) in components.iter().enumerate() {
                    g[[rx * n_comp + ic, col]] = match comp {
                        Component::Tmi => {
                            field[0] * b_hat[0] + field[1] * b_hat[1] + field[2] * b_hat[2]
                        }
                        Component::Bx => field[0],
                        Component::By => field[1],
                        Component::Bz => field[2],
                    };
                }
            }
        }

        info!(
            data = g.nrows(),
            cells = g.ncols(),
            "sensitivity matrix assembled"
        );
        Self { g }
    }

    /// Wrap an existing sensitivity matrix.
    pub fn from_sensitivity(g: Array2<f64>) -> Self {
        Self { g }
    }

    pub fn sensitivity(&self) -> &Array2<f64> {
        &self.g
    }
}

impl ForwardSimulation for IntegralSimulation {
    fn n_data(&self) -> usize {
        self.g.nrows()
    }

    fn n_model(&self) -> usize {
        self.g.ncols()
    }

    fn dpred(&self, model: &Array1<f64>) -> Array1<f64> {
        self.g.dot(model)
    }

    fn jvec(&self, _model: &Array1<f64>, v: &Array1<f64>) -> Array1<f64> {
        self.g.dot(v)
    }

    fn jtvec(&self, _model: &Array1<f64>, v: &Array1<f64>) -> Array1<f64> {
        self.g.t().dot(v)
    }

    fn jtj_diag(&self, _model: &Array1<f64>, w: &Array1<f64>) -> Array1<f64> {
        let mut diag = Array1::zeros(self.g.ncols());
        for (row, wi) in self.g.rows().into_iter().zip(w.iter()) {
            let w2 = wi * wi;
            for (d, gij) in diag.iter_mut().zip(row.iter()) {
                *d += w2 * gij * gij;
            }
        }
        diag
    }
}
