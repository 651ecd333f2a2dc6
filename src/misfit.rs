//! Weighted L2 data misfit.

use crate::error::{InversionError, InversionResult};
use crate::simulation::ForwardSimulation;
use ndarray::Array1;

/// `phi_d(m) = || W (F(m) - d_obs) ||^2` with `W = diag(1 / std)`.
pub struct DataMisfit {
    simulation: Box<dyn ForwardSimulation>,
    observed: Array1<f64>,
    weights: Array1<f64>,
}

impl DataMisfit {
    pub fn new(
        simulation: Box<dyn ForwardSimulation>,
        observed: Array1<f64>,
        standard_deviation: &Array1<f64>,
    ) -> InversionResult<Self> {
        let n = simulation.n_data();
        if observed.len() != n || standard_deviation.len() != n {
            return Err(InversionError::config(format!(
                "length mismatch: simulation predicts {} data, observed={}, std={}",
                n,
                observed.len(),
                standard_deviation.len()
            )));
        }
        if let Some(bad) = standard_deviation.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(InversionError::config(format!(
                "standard deviation must be positive, got {}",
                bad
            )));
        }
        let weights = standard_deviation.mapv(|s| 1.0 / s);
        Ok(Self {
            simulation,
            observed,
            weights,
        })
    }

    pub fn simulation(&self) -> &dyn ForwardSimulation {
        self.simulation.as_ref()
    }

    pub fn n_data(&self) -> usize {
        self.observed.len()
    }

    pub fn observed(&self) -> &Array1<f64> {
        &self.observed
    }

    /// Data weights `1 / std`.
    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    /// Weighted residual `W (d_pred - d_obs)` for a precomputed prediction.
    pub fn weighted_residual(&self, predicted: &Array1<f64>) -> Array1<f64> {
        (predicted - &self.observed) * &self.weights
    }

    pub fn evaluate(&self, model: &Array1<f64>) -> f64 {
        let r = self.weighted_residual(&self.simulation.dpred(model));
        r.dot(&r)
    }

    /// `2 J^T W^T W (F(m) - d_obs)`
    pub fn gradient(&self, model: &Array1<f64>) -> Array1<f64> {
        let r = self.weighted_residual(&self.simulation.dpred(model)) * &self.weights;
        self.simulation.jtvec(model, &r) * 2.0
    }

    /// Gauss-Newton Hessian product `2 J^T W^T W J v`.
    pub fn hessian_vec(&self, model: &Array1<f64>, v: &Array1<f64>) -> Array1<f64> {
        let w2 = &self.weights * &self.weights;
        let jv = self.simulation.jvec(model, v) * &w2;
        self.simulation.jtvec(model, &jv) * 2.0
    }

    /// Diagonal of the Gauss-Newton Hessian.
    pub fn hessian_diag(&self, model: &Array1<f64>) -> Array1<f64> {
        self.simulation.jtj_diag(model, &self.weights) * 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::IntegralSimulation;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn misfit() -> DataMisfit {
        let sim = IntegralSimulation::from_sensitivity(array![[1.0, 0.0], [1.0, 1.0], [0.0, 2.0]]);
        DataMisfit::new(Box::new(sim), array![1.0, 2.0, 2.0], &array![0.5, 1.0, 2.0]).unwrap()
    }

    #[test]
    fn test_zero_at_exact_model() {
        let dm = misfit();
        assert_relative_eq!(dm.evaluate(&array![1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_value_is_weighted_sum_of_squares() {
        let dm = misfit();
        // Prediction at zero model is zero: residuals -1, -2, -2 scaled by 2, 1, 0.5.
        assert_relative_eq!(dm.evaluate(&array![0.0, 0.0]), 4.0 + 4.0 + 1.0);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let dm = misfit();
        let m = array![0.3, -0.2];
        let g = dm.gradient(&m);
        let h = 1e-6;
        for i in 0..2 {
            let mut mp = m.clone();
            let mut mm = m.clone();
            mp[i] += h;
            mm[i] -= h;
            let fd = (dm.evaluate(&mp) - dm.evaluate(&mm)) / (2.0 * h);
            assert_relative_eq!(g[i], fd, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_hessian_diag_matches_products() {
        let dm = misfit();
        let m = array![0.0, 0.0];
        let diag = dm.hessian_diag(&m);
        for i in 0..2 {
            let mut e = Array1::zeros(2);
            e[i] = 1.0;
            assert_relative_eq!(dm.hessian_vec(&m, &e)[i], diag[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let sim = IntegralSimulation::from_sensitivity(array![[1.0], [1.0]]);
        let err = DataMisfit::new(Box::new(sim), array![1.0], &array![1.0]).err().unwrap();
        assert!(matches!(err, InversionError::Configuration(_)));
    }

    #[test]
    fn test_zero_uncertainty_rejected() {
        let sim = IntegralSimulation::from_sensitivity(array![[1.0]]);
        assert!(DataMisfit::new(Box::new(sim), array![0.0], &array![0.0]).is_err());
    }
}
