//! Bound-constrained projected Gauss-Newton optimizer.
//!
//! One call to [`ProjectedGaussNewton::minimize`] performs a single outer
//! step:
//! 1. split variables into free and bound-active sets,
//! 2. solve the reduced Gauss-Newton system with Jacobi-preconditioned CG,
//! 3. backtrack along the projected path until the Armijo condition holds.
//!
//! Running out of CG or line-search iterations is a soft failure: it is
//! reported on the [`StepReport`] and logged, never returned as an error.

use crate::error::{InversionError, InversionResult};
use ndarray::Array1;
use serde::Serialize;
use tracing::{debug, warn};

/// Smooth objective seen by the optimizer.
pub trait Objective {
    fn value(&self, m: &Array1<f64>) -> f64;

    fn gradient(&self, m: &Array1<f64>) -> Array1<f64>;

    /// Product of the (Gauss-Newton) Hessian at `m` with `v`.
    fn hessian_vec(&self, m: &Array1<f64>, v: &Array1<f64>) -> Array1<f64>;
}

/// Optimizer configuration
#[derive(Clone, Debug)]
pub struct OptimizerConfig {
    /// Outer iteration cap (enforced by the inversion driver)
    pub max_iter: usize,
    /// Backtracking steps per outer step
    pub max_iter_ls: usize,
    /// CG iterations per outer step
    pub max_iter_cg: usize,
    /// Relative CG residual tolerance
    pub tol_cg: f64,
    pub lower: f64,
    pub upper: f64,
    /// Sufficient-decrease constant of the Armijo rule
    pub armijo: f64,
    /// Step shrink factor per backtracking step
    pub shrink: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iter: 10,
            max_iter_ls: 20,
            max_iter_cg: 10,
            tol_cg: 1e-3,
            lower: 0.0,
            upper: 1.0,
            armijo: 1e-4,
            shrink: 0.5,
        }
    }
}

/// Inner solve that ended early without failing the outer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftFailure {
    CgIterationCap,
    /// CG met a direction of non-positive curvature before its cap.
    NonPositiveCurvature,
    LineSearchCap,
}

/// What one outer step did.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub objective_before: f64,
    pub objective_after: f64,
    pub projected_gradient_norm: f64,
    pub cg_iterations: usize,
    pub ls_iterations: usize,
    /// Accepted step length along the search direction (0 when rejected)
    pub step_length: f64,
    pub free_variables: usize,
    pub soft_failures: Vec<SoftFailure>,
}

impl StepReport {
    pub fn accepted(&self) -> bool {
        self.step_length > 0.0
    }
}

pub struct ProjectedGaussNewton {
    config: OptimizerConfig,
}

impl ProjectedGaussNewton {
    pub fn new(config: OptimizerConfig) -> InversionResult<Self> {
        if config.max_iter == 0 {
            return Err(InversionError::config("optimization.max_iter must be >= 1"));
        }
        if config.max_iter_ls == 0 || config.max_iter_cg == 0 {
            return Err(InversionError::config(
                "optimization.max_iter_ls and max_iter_cg must be >= 1",
            ));
        }
        if !(config.tol_cg.is_finite() && config.tol_cg > 0.0) {
            return Err(InversionError::config("optimization.tol_cg must be positive"));
        }
        if !(config.lower.is_finite() && config.upper.is_finite() && config.lower < config.upper) {
            return Err(InversionError::config("model bounds must be finite with lower < upper"));
        }
        if !(0.0 < config.shrink && config.shrink < 1.0) || !(0.0 < config.armijo && config.armijo < 1.0) {
            return Err(InversionError::config("line search constants must be in (0, 1)"));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Clamp a model into the bounds.
    pub fn project(&self, m: &Array1<f64>) -> Array1<f64> {
        m.mapv(|v| v.clamp(self.config.lower, self.config.upper))
    }

    /// Variables not pinned at a bound by the sign of the gradient.
    fn free_set(&self, m: &Array1<f64>, g: &Array1<f64>) -> Array1<f64> {
        let tol = 1e-12 * (self.config.upper - self.config.lower);
        m.iter()
            .zip(g.iter())
            .map(|(&mi, &gi)| {
                let at_lower = mi <= self.config.lower + tol && gi > 0.0;
                let at_upper = mi >= self.config.upper - tol && gi < 0.0;
                if at_lower || at_upper {
                    0.0
                } else {
                    1.0
                }
            })
            .collect()
    }

    /// One projected Gauss-Newton step from `m0`.
    ///
    /// `inv_diag` is an optional Jacobi preconditioner (inverse Hessian
    /// diagonal). Returns the new model and a report; the model is unchanged
    /// when no acceptable step was found.
    pub fn minimize(
        &self,
        m0: &Array1<f64>,
        objective: &dyn Objective,
        inv_diag: Option<&Array1<f64>>,
    ) -> InversionResult<(Array1<f64>, StepReport)> {
        let m = self.project(m0);
        let f0 = objective.value(&m);
        if !f0.is_finite() {
            return Err(InversionError::Numerical(format!("objective is {}", f0)));
        }
        let g = objective.gradient(&m);
        let free = self.free_set(&m, &g);
        let g_free = &g * &free;

        let mut report = StepReport {
            objective_before: f0,
            objective_after: f0,
            projected_gradient_norm: g_free.dot(&g_free).sqrt(),
            free_variables: free.iter().filter(|f| **f > 0.0).count(),
            ..Default::default()
        };
        if report.projected_gradient_norm == 0.0 {
            debug!("projected gradient vanishes; model is stationary");
            return Ok((m, report));
        }

        // Reduced system H_FF p = -g_F
        let precondition = |r: &Array1<f64>| match inv_diag {
            Some(d) => r * d * &free,
            None => r.clone(),
        };
        let mut x: Array1<f64> = Array1::zeros(m.len());
        let mut r = -&g_free;
        let r0 = r.dot(&r).sqrt();
        let mut z = precondition(&r);
        let mut p = z.clone();
        let mut rz = r.dot(&z);
        let mut cg_converged = false;
        let mut curvature_break = false;

        for it in 1..=self.config.max_iter_cg {
            report.cg_iterations = it;
            let hp = objective.hessian_vec(&m, &p) * &free;
            let curvature = p.dot(&hp);
            if !(curvature > 0.0) {
                debug!(iteration = it, "CG stopped on non-positive curvature");
                curvature_break = true;
                break;
            }
            let alpha = rz / curvature;
            x.scaled_add(alpha, &p);
            r.scaled_add(-alpha, &hp);
            if r.dot(&r).sqrt() <= self.config.tol_cg * r0 {
                cg_converged = true;
                break;
            }
            z = precondition(&r);
            let rz_next = r.dot(&z);
            p = &z + &(p * (rz_next / rz));
            rz = rz_next;
        }

        if curvature_break {
            warn!(
                iterations = report.cg_iterations,
                "CG met non-positive curvature; using best available direction"
            );
            report.soft_failures.push(SoftFailure::NonPositiveCurvature);
        } else if !cg_converged {
            warn!(
                iterations = report.cg_iterations,
                "CG did not reach tolerance; using best available direction"
            );
            report.soft_failures.push(SoftFailure::CgIterationCap);
        }

        let mut direction = x;
        if !(g.dot(&direction) < 0.0) {
            direction = -&g_free;
        }

        let mut t = 1.0;
        for ls in 1..=self.config.max_iter_ls {
            report.ls_iterations = ls;
            let trial = self.project(&(&m + &(&direction * t)));
            let f_trial = objective.value(&trial);
            let decrease = g.dot(&(&trial - &m));
            if f_trial.is_finite() && f_trial <= f0 + self.config.armijo * decrease {
                report.objective_after = f_trial;
                report.step_length = t;
                return Ok((trial, report));
            }
            t *= self.config.shrink;
        }

        warn!(
            iterations = report.ls_iterations,
            "line search found no sufficient decrease; keeping current model"
        );
        report.soft_failures.push(SoftFailure::LineSearchCap);
        Ok((m, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    /// 0.5 x^T A x - b^T x
    struct Quadratic {
        a: Array2<f64>,
        b: Array1<f64>,
    }

    impl Objective for Quadratic {
        fn value(&self, m: &Array1<f64>) -> f64 {
            0.5 * m.dot(&self.a.dot(m)) - self.b.dot(m)
        }

        fn gradient(&self, m: &Array1<f64>) -> Array1<f64> {
            self.a.dot(m) - &self.b
        }

        fn hessian_vec(&self, _m: &Array1<f64>, v: &Array1<f64>) -> Array1<f64> {
            self.a.dot(v)
        }
    }

    /// Reports the negated gradient, so no search direction descends.
    struct Misleading(Quadratic);

    impl Objective for Misleading {
        fn value(&self, m: &Array1<f64>) -> f64 {
            self.0.value(m)
        }

        fn gradient(&self, m: &Array1<f64>) -> Array1<f64> {
            -self.0.gradient(m)
        }

        fn hessian_vec(&self, m: &Array1<f64>, v: &Array1<f64>) -> Array1<f64> {
            self.0.hessian_vec(m, v)
        }
    }

    fn optimizer(max_iter_cg: usize, lower: f64, upper: f64) -> ProjectedGaussNewton {
        ProjectedGaussNewton::new(OptimizerConfig {
            max_iter_cg,
            tol_cg: 1e-10,
            lower,
            upper,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_interior_minimum_in_one_step() {
        let q = Quadratic {
            a: array![[2.0, 0.5], [0.5, 1.0]],
            b: array![1.0, 1.0],
        };
        let opt = optimizer(10, -10.0, 10.0);
        let (m, report) = opt.minimize(&array![0.0, 0.0], &q, None).unwrap();
        let g = q.gradient(&m);
        assert!(g.dot(&g).sqrt() < 1e-8);
        assert!(report.soft_failures.is_empty());
        assert_relative_eq!(report.step_length, 1.0);
        assert!(report.objective_after < report.objective_before);
    }

    #[test]
    fn test_bounds_are_respected() {
        let q = Quadratic {
            a: array![[1.0, 0.0], [0.0, 1.0]],
            b: array![5.0, -5.0],
        };
        let opt = optimizer(10, 0.0, 1.0);
        let mut m = array![0.5, 0.5];
        for _ in 0..5 {
            m = opt.minimize(&m, &q, None).unwrap().0;
        }
        assert_relative_eq!(m[0], 1.0);
        assert_relative_eq!(m[1], 0.0);
    }

    #[test]
    fn test_variable_pinned_at_bound_is_not_free() {
        let q = Quadratic {
            a: array![[1.0, 0.0], [0.0, 1.0]],
            b: array![-1.0, 0.5],
        };
        let opt = optimizer(10, 0.0, 1.0);
        let (m, report) = opt.minimize(&array![0.0, 0.0], &q, None).unwrap();
        assert_eq!(report.free_variables, 1);
        assert_relative_eq!(m[0], 0.0);
        assert_relative_eq!(m[1], 0.5, epsilon = 1e-10);
    }

    #[test]
    fn test_cg_cap_is_soft_failure() {
        let q = Quadratic {
            a: array![[10.0, 1.0, 0.0], [1.0, 1.0, 0.5], [0.0, 0.5, 0.1]],
            b: array![1.0, 2.0, 3.0],
        };
        let opt = optimizer(1, -100.0, 100.0);
        let (_, report) = opt.minimize(&array![0.0, 0.0, 0.0], &q, None).unwrap();
        assert_eq!(report.cg_iterations, 1);
        assert!(report.soft_failures.contains(&SoftFailure::CgIterationCap));
        assert!(report.objective_after < report.objective_before);
    }

    #[test]
    fn test_negative_curvature_is_not_reported_as_cg_cap() {
        // Gradient lies along the concave axis, so the first CG direction
        // has negative curvature.
        let q = Quadratic {
            a: array![[-1.0, 0.0], [0.0, 1.0]],
            b: array![0.0, 0.5],
        };
        let opt = optimizer(10, 0.0, 1.0);
        let (m, report) = opt.minimize(&array![0.5, 0.5], &q, None).unwrap();
        assert_eq!(report.cg_iterations, 1);
        assert_eq!(report.soft_failures, vec![SoftFailure::NonPositiveCurvature]);
        assert!(report.accepted());
        assert_relative_eq!(m[0], 1.0);
        assert_relative_eq!(m[1], 0.5);
    }

    #[test]
    fn test_line_search_cap_keeps_model() {
        let q = Misleading(Quadratic {
            a: array![[1.0, 0.0], [0.0, 1.0]],
            b: array![1.0, 1.0],
        });
        let opt = optimizer(10, -10.0, 10.0);
        let m0 = array![0.0, 0.0];
        let (m, report) = opt.minimize(&m0, &q, None).unwrap();
        assert_eq!(m, m0);
        assert!(!report.accepted());
        assert!(report.soft_failures.contains(&SoftFailure::LineSearchCap));
        assert_eq!(report.ls_iterations, 20);
    }

    #[test]
    fn test_jacobi_preconditioner_gives_same_minimum() {
        let q = Quadratic {
            a: array![[100.0, 0.0], [0.0, 0.01]],
            b: array![1.0, 1.0],
        };
        let opt = optimizer(10, -1000.0, 1000.0);
        let inv = array![0.01, 100.0];
        let (m, _) = opt.minimize(&array![0.0, 0.0], &q, Some(&inv)).unwrap();
        assert_relative_eq!(m[0], 0.01, epsilon = 1e-8);
        assert_relative_eq!(m[1], 100.0, epsilon = 1e-6);
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let cfg = OptimizerConfig {
            lower: 1.0,
            upper: 0.0,
            ..Default::default()
        };
        assert!(ProjectedGaussNewton::new(cfg).is_err());
    }
}
