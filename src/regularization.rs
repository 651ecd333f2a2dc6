//! Sparse-norm model regularization with IRLS reweighting.
//!
//! The objective has four terms: smallness `m - m_ref` and first-order
//! differences between face-sharing active cells along x, y and z. Each term
//! `k` contributes `alpha_k * sum_i w_ki * r_ki * f_ki^2`, where `w` are cell
//! weights (sensitivity weighting) and `r` are IRLS weights
//! `((f / eps)^2 + 1)^(p_k / 2 - 1)` computed from a previous model. With all
//! exponents at 2 the IRLS weights are one and the term is plain L2.
//!
//! Differences are scaled by `h_min / distance` so the gradient terms are
//! dimensionless like the smallness term.

use crate::error::{InversionError, InversionResult};
use crate::mesh::{active_neighbours, ActiveCells, CellPair, TensorMesh};
use ndarray::Array1;
use tracing::debug;

pub const N_TERMS: usize = 4;
pub const TERM_NAMES: [&str; N_TERMS] = ["s", "x", "y", "z"];

const EPSILON_FLOOR: f64 = 1e-12;
const L2_EXPONENT: f64 = 2.0;
const NORM_TOLERANCE: f64 = 1e-12;

/// Relative weights of the smallness and x/y/z smoothness terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alphas {
    pub s: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for Alphas {
    fn default() -> Self {
        Self {
            s: 1.0,
            x: 1.0,
            y: 1.0,
            z: 1.0,
        }
    }
}

impl Alphas {
    fn as_array(&self) -> [f64; N_TERMS] {
        [self.s, self.x, self.y, self.z]
    }
}

/// Difference operator for one smoothness direction.
#[derive(Debug, Clone)]
struct Difference {
    pairs: Vec<CellPair>,
    scale: Vec<f64>,
}

impl Difference {
    fn new(pairs: Vec<CellPair>, h_min: f64) -> Self {
        let scale = pairs.iter().map(|p| h_min / p.distance).collect();
        Self { pairs, scale }
    }

    fn apply(&self, m: &Array1<f64>) -> Array1<f64> {
        self.pairs
            .iter()
            .zip(self.scale.iter())
            .map(|(p, s)| s * (m[p.upper] - m[p.lower]))
            .collect()
    }

    fn apply_transpose(&self, y: &Array1<f64>, out: &mut Array1<f64>) {
        for ((p, s), yi) in self.pairs.iter().zip(self.scale.iter()).zip(y.iter()) {
            out[p.lower] -= s * yi;
            out[p.upper] += s * yi;
        }
    }
}

pub struct SparseRegularization {
    reference: Array1<f64>,
    alphas: [f64; N_TERMS],
    differences: [Difference; 3],
    cell_weights: Array1<f64>,
    target_norms: [f64; N_TERMS],
    norms: [f64; N_TERMS],
    /// Smoothing parameters for the smallness and the gradient terms.
    epsilon: Option<[f64; 2]>,
    irls: [Array1<f64>; N_TERMS],
}

impl SparseRegularization {
    /// Regularization over the active cells of `mesh`.
    ///
    /// All exponents start at 2 and move toward `target_norms` only when the
    /// IRLS schedule asks for it.
    pub fn new(
        mesh: &TensorMesh,
        active: &ActiveCells,
        reference: Array1<f64>,
        alphas: Alphas,
        target_norms: [f64; N_TERMS],
    ) -> InversionResult<Self> {
        let n = active.n_active();
        if reference.len() != n {
            return Err(InversionError::config(format!(
                "reference model has {} entries, expected {}",
                reference.len(),
                n
            )));
        }
        let alphas = alphas.as_array();
        if alphas.iter().any(|a| !(a.is_finite() && *a >= 0.0)) {
            return Err(InversionError::config("regularization alphas must be >= 0"));
        }
        if alphas.iter().all(|a| *a == 0.0) {
            return Err(InversionError::config("at least one regularization alpha must be > 0"));
        }
        if target_norms.iter().any(|p| !(0.0..=2.0).contains(p)) {
            return Err(InversionError::config("regularization norms must be in [0, 2]"));
        }

        let h_min = mesh.min_width();
        let differences =
            [0, 1, 2].map(|axis| Difference::new(active_neighbours(mesh, active, axis), h_min));
        let irls = [
            Array1::ones(n),
            Array1::ones(differences[0].pairs.len()),
            Array1::ones(differences[1].pairs.len()),
            Array1::ones(differences[2].pairs.len()),
        ];

        Ok(Self {
            reference,
            alphas,
            differences,
            cell_weights: Array1::ones(n),
            target_norms,
            norms: [L2_EXPONENT; N_TERMS],
            epsilon: None,
            irls,
        })
    }

    pub fn n_model(&self) -> usize {
        self.reference.len()
    }

    pub fn reference(&self) -> &Array1<f64> {
        &self.reference
    }

    /// Current exponents `[p, qx, qy, qz]`.
    pub fn norms(&self) -> [f64; N_TERMS] {
        self.norms
    }

    pub fn target_norms(&self) -> [f64; N_TERMS] {
        self.target_norms
    }

    pub fn epsilon(&self) -> Option<[f64; 2]> {
        self.epsilon
    }

    pub fn cell_weights(&self) -> &Array1<f64> {
        &self.cell_weights
    }

    pub fn set_cell_weights(&mut self, weights: Array1<f64>) -> InversionResult<()> {
        if weights.len() != self.n_model() {
            return Err(InversionError::config(format!(
                "cell weights have {} entries, expected {}",
                weights.len(),
                self.n_model()
            )));
        }
        if weights.iter().any(|w| !(w.is_finite() && *w > 0.0)) {
            return Err(InversionError::config("cell weights must be positive"));
        }
        self.cell_weights = weights;
        Ok(())
    }

    /// Raw term values `f_k(m)`.
    fn term(&self, k: usize, m: &Array1<f64>) -> Array1<f64> {
        if k == 0 {
            m - &self.reference
        } else {
            self.differences[k - 1].apply(m)
        }
    }

    /// Combined cell and IRLS weights of term `k`.
    fn term_weights(&self, k: usize) -> Array1<f64> {
        if k == 0 {
            &self.cell_weights * &self.irls[0]
        } else {
            let d = &self.differences[k - 1];
            d.pairs
                .iter()
                .zip(self.irls[k].iter())
                .map(|(p, r)| 0.5 * (self.cell_weights[p.lower] + self.cell_weights[p.upper]) * r)
                .collect()
        }
    }

    /// Per-term contributions `alpha_k * sum(w r f^2)`.
    pub fn evaluate_terms(&self, m: &Array1<f64>) -> [f64; N_TERMS] {
        let mut out = [0.0; N_TERMS];
        for (k, slot) in out.iter_mut().enumerate() {
            if self.alphas[k] == 0.0 {
                continue;
            }
            let f = self.term(k, m);
            let w = self.term_weights(k);
            *slot = self.alphas[k] * (&w * &f).dot(&f);
        }
        out
    }

    pub fn evaluate(&self, m: &Array1<f64>) -> f64 {
        self.evaluate_terms(m).iter().sum()
    }

    pub fn gradient(&self, m: &Array1<f64>) -> Array1<f64> {
        let mut out = Array1::zeros(self.n_model());
        for k in 0..N_TERMS {
            if self.alphas[k] == 0.0 {
                continue;
            }
            let y = self.term_weights(k) * &self.term(k, m) * (2.0 * self.alphas[k]);
            self.accumulate_transpose(k, &y, &mut out);
        }
        out
    }

    /// Hessian product for the current weights. Independent of the model.
    pub fn hessian_vec(&self, v: &Array1<f64>) -> Array1<f64> {
        let mut out = Array1::zeros(self.n_model());
        for k in 0..N_TERMS {
            if self.alphas[k] == 0.0 {
                continue;
            }
            let dv = if k == 0 {
                v.clone()
            } else {
                self.differences[k - 1].apply(v)
            };
            let y = self.term_weights(k) * &dv * (2.0 * self.alphas[k]);
            self.accumulate_transpose(k, &y, &mut out);
        }
        out
    }

    pub fn hessian_diag(&self) -> Array1<f64> {
        let mut diag = Array1::zeros(self.n_model());
        for k in 0..N_TERMS {
            if self.alphas[k] == 0.0 {
                continue;
            }
            let w = self.term_weights(k);
            let a2 = 2.0 * self.alphas[k];
            if k == 0 {
                diag = diag + &w * a2;
            } else {
                let d = &self.differences[k - 1];
                for ((p, s), wi) in d.pairs.iter().zip(d.scale.iter()).zip(w.iter()) {
                    let c = a2 * wi * s * s;
                    diag[p.lower] += c;
                    diag[p.upper] += c;
                }
            }
        }
        diag
    }

    fn accumulate_transpose(&self, k: usize, y: &Array1<f64>, out: &mut Array1<f64>) {
        if k == 0 {
            *out += y;
        } else {
            self.differences[k - 1].apply_transpose(y, out);
        }
    }

    /// Largest magnitude of the smallness term and of all gradient terms.
    pub fn max_term_magnitudes(&self, m: &Array1<f64>) -> [f64; 2] {
        let max_abs = |a: &Array1<f64>| a.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let small = max_abs(&self.term(0, m));
        let grad = (1..N_TERMS)
            .map(|k| max_abs(&self.term(k, m)))
            .fold(0.0_f64, f64::max);
        [small, grad]
    }

    /// Set the IRLS smoothing parameters from the model at activation.
    pub fn start_irls(&mut self, m: &Array1<f64>) -> [f64; 2] {
        let eps = self.max_term_magnitudes(m).map(|e| e.max(EPSILON_FLOOR));
        self.epsilon = Some(eps);
        eps
    }

    pub fn cool_epsilon(&mut self, factor: f64) {
        if let Some(eps) = self.epsilon.as_mut() {
            for e in eps.iter_mut() {
                *e = (*e / factor).max(EPSILON_FLOOR);
            }
        }
    }

    /// Move every exponent one step of `(2 - target) / ramp_steps` toward its target.
    pub fn step_norms(&mut self, ramp_steps: usize) {
        let steps = ramp_steps.max(1) as f64;
        for k in 0..N_TERMS {
            let target = self.target_norms[k];
            let next = (self.norms[k] - (L2_EXPONENT - target) / steps).max(target);
            self.norms[k] = if (next - target).abs() < NORM_TOLERANCE {
                target
            } else {
                next
            };
        }
    }

    pub fn norms_at_target(&self) -> bool {
        self.norms
            .iter()
            .zip(self.target_norms.iter())
            .all(|(p, t)| (p - t).abs() < NORM_TOLERANCE)
    }

    /// Recompute the IRLS weights from `m` with the current exponents and epsilons.
    pub fn update_irls_weights(&mut self, m: &Array1<f64>) {
        let Some(eps) = self.epsilon else {
            return;
        };
        for k in 0..N_TERMS {
            let p = self.norms[k];
            if (L2_EXPONENT - p).abs() < NORM_TOLERANCE {
                self.irls[k].fill(1.0);
                continue;
            }
            let e = if k == 0 { eps[0] } else { eps[1] };
            let f = self.term(k, m);
            self.irls[k] = f.mapv(|v| ((v / e).powi(2) + 1.0).powf(0.5 * p - 1.0));
        }
        debug!(norms = ?self.norms, eps = ?eps, "IRLS weights updated");
    }
}
