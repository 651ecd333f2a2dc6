//! Inverse problem assembly, shared inversion state and the outer loop.
//!
//! [`InverseProblem::combine`] joins the three strategies. The
//! [`InversionContext`] is the only state directives see: they may change
//! beta, the preconditioner and the regularization's exponents and weights,
//! but the model vector is written exclusively by the [`Driver`]'s outer step.

use crate::directives::{DirectiveKind, DirectiveSchedule};
use crate::error::{InversionError, InversionResult};
use crate::misfit::DataMisfit;
use crate::optimization::{Objective, ProjectedGaussNewton, StepReport};
use crate::regularization::{SparseRegularization, N_TERMS};
use ndarray::Array1;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

/// Constant starting (and reference) model.
///
/// The background must be strictly positive: a zero model gives a degenerate
/// first gradient for the sparse terms.
pub fn starting_model(background: f64, n_active: usize) -> InversionResult<Array1<f64>> {
    if !(background.is_finite() && background > 0.0) {
        return Err(InversionError::config(format!(
            "background susceptibility must be > 0, got {}",
            background
        )));
    }
    if n_active == 0 {
        return Err(InversionError::config("no active cells to invert"));
    }
    Ok(Array1::from_elem(n_active, background))
}

// ============================================================================
// Inverse problem
// ============================================================================

pub struct InverseProblem {
    misfit: DataMisfit,
    regularization: SparseRegularization,
    optimizer: ProjectedGaussNewton,
}

impl InverseProblem {
    pub fn combine(
        misfit: DataMisfit,
        regularization: SparseRegularization,
        optimizer: ProjectedGaussNewton,
    ) -> InversionResult<Self> {
        let n_sim = misfit.simulation().n_model();
        if n_sim != regularization.n_model() {
            return Err(InversionError::config(format!(
                "simulation has {} model cells but regularization has {}",
                n_sim,
                regularization.n_model()
            )));
        }
        Ok(Self {
            misfit,
            regularization,
            optimizer,
        })
    }

    pub fn misfit(&self) -> &DataMisfit {
        &self.misfit
    }

    pub fn regularization(&self) -> &SparseRegularization {
        &self.regularization
    }

    pub fn optimizer(&self) -> &ProjectedGaussNewton {
        &self.optimizer
    }

    pub fn n_model(&self) -> usize {
        self.regularization.n_model()
    }
}

/// `phi_d + beta * phi_m` with the regularization weights frozen.
struct Combined<'a> {
    misfit: &'a DataMisfit,
    regularization: &'a SparseRegularization,
    beta: f64,
}

impl Objective for Combined<'_> {
    fn value(&self, m: &Array1<f64>) -> f64 {
        self.misfit.evaluate(m) + self.beta * self.regularization.evaluate(m)
    }

    fn gradient(&self, m: &Array1<f64>) -> Array1<f64> {
        self.misfit.gradient(m) + self.regularization.gradient(m) * self.beta
    }

    fn hessian_vec(&self, m: &Array1<f64>, v: &Array1<f64>) -> Array1<f64> {
        self.misfit.hessian_vec(m, v) + self.regularization.hessian_vec(v) * self.beta
    }
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    L2,
    Irls,
    Converged,
    MaxIterStopped,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Converged | Phase::MaxIterStopped)
    }

    fn can_advance_to(self, next: Phase) -> bool {
        match (self, next) {
            (Phase::Initializing, Phase::L2) => true,
            (Phase::L2, Phase::Irls) => true,
            (Phase::L2 | Phase::Irls, Phase::Converged) => true,
            (from, Phase::MaxIterStopped) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Initializing => "initializing",
            Phase::L2 => "l2",
            Phase::Irls => "irls",
            Phase::Converged => "converged",
            Phase::MaxIterStopped => "max_iter_stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TargetMisfit,
    SparseConverged,
    IrlsIterationCap,
    OuterIterationCap,
}

impl StopReason {
    /// Terminal phase reached when this reason stops the run.
    pub fn phase(self) -> Phase {
        match self {
            StopReason::TargetMisfit | StopReason::SparseConverged => Phase::Converged,
            StopReason::IrlsIterationCap | StopReason::OuterIterationCap => Phase::MaxIterStopped,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::TargetMisfit => "target_misfit",
            StopReason::SparseConverged => "sparse_converged",
            StopReason::IrlsIterationCap => "irls_iteration_cap",
            StopReason::OuterIterationCap => "outer_iteration_cap",
        };
        f.write_str(name)
    }
}

/// One row of the convergence history.
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub phase: Phase,
    pub beta: f64,
    pub phi_d: f64,
    pub phi_m: f64,
    pub phi: f64,
    pub norms: [f64; N_TERMS],
    pub epsilon: Option<[f64; 2]>,
    pub cg_iterations: usize,
    pub ls_iterations: usize,
    pub soft_failures: usize,
}

pub struct InversionContext {
    problem: InverseProblem,
    model: Array1<f64>,
    beta: Option<f64>,
    preconditioner: Option<Array1<f64>>,
    phase: Phase,
    iteration: usize,
    stop: Option<StopReason>,
    last_step: Option<StepReport>,
    history: Vec<IterationRecord>,
    sparse_schedule: bool,
}

impl InversionContext {
    pub(crate) fn new(problem: InverseProblem, model: Array1<f64>, sparse_schedule: bool) -> Self {
        Self {
            problem,
            model,
            beta: None,
            preconditioner: None,
            phase: Phase::Initializing,
            iteration: 0,
            stop: None,
            last_step: None,
            history: Vec::new(),
            sparse_schedule,
        }
    }

    pub fn problem(&self) -> &InverseProblem {
        &self.problem
    }

    pub fn current_model(&self) -> &Array1<f64> {
        &self.model
    }

    pub fn predicted_data(&self) -> Array1<f64> {
        self.problem.misfit.simulation().dpred(&self.model)
    }

    pub fn n_data(&self) -> usize {
        self.problem.misfit.n_data()
    }

    pub fn phi_d(&self) -> f64 {
        self.problem.misfit.evaluate(&self.model)
    }

    pub fn phi_m(&self) -> f64 {
        self.problem.regularization.evaluate(&self.model)
    }

    pub fn beta(&self) -> Option<f64> {
        self.beta
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Completed outer iterations.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_some()
    }

    pub fn last_step(&self) -> Option<&StepReport> {
        self.last_step.as_ref()
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    pub fn record(&mut self, record: IterationRecord) {
        self.history.push(record);
    }

    /// Whether an IRLS updater drives the run.
    pub fn sparse_schedule(&self) -> bool {
        self.sparse_schedule
    }

    pub fn regularization_mut(&mut self) -> &mut SparseRegularization {
        &mut self.problem.regularization
    }

    pub fn preconditioner(&self) -> Option<&Array1<f64>> {
        self.preconditioner.as_ref()
    }

    /// Install an inverse-diagonal preconditioner for the inner CG solve.
    pub fn set_preconditioner(&mut self, inv_diag: Array1<f64>) -> InversionResult<()> {
        if inv_diag.len() != self.model.len() {
            return Err(InversionError::config(format!(
                "preconditioner has {} entries, model has {}",
                inv_diag.len(),
                self.model.len()
            )));
        }
        self.preconditioner = Some(inv_diag);
        Ok(())
    }

    /// Set the first beta; moves the run from initializing to the L2 phase.
    pub fn initialize_beta(&mut self, beta: f64) -> InversionResult<()> {
        if self.beta.is_some() {
            return Err(InversionError::config("beta has already been initialized"));
        }
        check_beta(beta)?;
        self.beta = Some(beta);
        self.advance_phase(Phase::L2)
    }

    /// Change beta during the IRLS phase.
    pub fn set_beta(&mut self, beta: f64) -> InversionResult<()> {
        if self.phase != Phase::Irls {
            return Err(InversionError::config(format!(
                "beta can only change during the IRLS phase, current phase is {}",
                self.phase
            )));
        }
        check_beta(beta)?;
        self.beta = Some(beta);
        Ok(())
    }

    pub fn advance_phase(&mut self, next: Phase) -> InversionResult<()> {
        if !self.phase.can_advance_to(next) {
            return Err(InversionError::config(format!(
                "invalid phase transition {} -> {}",
                self.phase, next
            )));
        }
        info!(from = %self.phase, to = %next, iteration = self.iteration, "phase change");
        self.phase = next;
        Ok(())
    }

    /// Ask the driver to stop. The first reason signalled wins.
    pub fn signal_stop(&mut self, reason: StopReason) -> InversionResult<()> {
        if let Some(existing) = self.stop {
            debug!(%existing, ignored = %reason, "stop already signalled");
            return Ok(());
        }
        self.advance_phase(reason.phase())?;
        self.stop = Some(reason);
        info!(%reason, iteration = self.iteration, "stop signalled");
        Ok(())
    }

    /// Run one optimizer step and replace the model with its result.
    fn outer_step(&mut self) -> InversionResult<StepReport> {
        let beta = self
            .beta
            .ok_or_else(|| InversionError::config("beta must be set before the first outer step"))?;
        let objective = Combined {
            misfit: &self.problem.misfit,
            regularization: &self.problem.regularization,
            beta,
        };
        let (model, report) =
            self.problem
                .optimizer
                .minimize(&self.model, &objective, self.preconditioner.as_ref())?;
        if model.len() != self.model.len() {
            return Err(InversionError::Numerical(format!(
                "optimizer returned {} cells, expected {}",
                model.len(),
                self.model.len()
            )));
        }
        self.model = model;
        self.iteration += 1;
        self.last_step = Some(report.clone());
        Ok(report)
    }
}

fn check_beta(beta: f64) -> InversionResult<()> {
    if beta.is_finite() && beta > 0.0 {
        Ok(())
    } else {
        Err(InversionError::Numerical(format!("beta must be positive and finite, got {}", beta)))
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Final state of an inversion run.
#[derive(Debug, Clone)]
pub struct InversionOutcome {
    pub model: Array1<f64>,
    pub predicted: Array1<f64>,
    pub phase: Phase,
    pub stop_reason: StopReason,
    pub iterations: usize,
    pub beta: f64,
    pub phi_d: f64,
    pub phi_m: f64,
    pub history: Vec<IterationRecord>,
}

pub struct Driver {
    problem: InverseProblem,
    schedule: DirectiveSchedule,
}

impl Driver {
    pub fn new(problem: InverseProblem, schedule: DirectiveSchedule) -> Self {
        Self { problem, schedule }
    }

    /// Run the outer loop from `starting_model` until a directive stops it or
    /// the outer iteration cap is reached.
    pub fn run(mut self, starting_model: Array1<f64>) -> InversionResult<InversionOutcome> {
        let n = self.problem.n_model();
        if starting_model.len() != n {
            return Err(InversionError::config(format!(
                "starting model has {} entries, expected {}",
                starting_model.len(),
                n
            )));
        }
        let max_iter = self.problem.optimizer.config().max_iter;
        let sparse = self.schedule.contains(DirectiveKind::IrlsUpdater);
        let mut ctx = InversionContext::new(self.problem, starting_model, sparse);

        info!(
            cells = n,
            data = ctx.n_data(),
            max_iter,
            directives = %self.schedule,
            "starting inversion"
        );
        self.schedule.initialize(&mut ctx)?;

        while !ctx.is_stopped() && ctx.iteration() < max_iter {
            let report = ctx.outer_step()?;
            self.schedule.end_iteration(&mut ctx)?;
            info!(
                iteration = ctx.iteration(),
                phase = %ctx.phase(),
                beta = ctx.beta().unwrap_or(f64::NAN),
                phi_d = ctx.phi_d(),
                phi_m = ctx.phi_m(),
                cg = report.cg_iterations,
                ls = report.ls_iterations,
                "outer iteration"
            );
            if ctx.is_stopped() {
                break;
            }
        }
        if !ctx.is_stopped() {
            ctx.signal_stop(StopReason::OuterIterationCap)?;
        }

        let stop_reason = ctx.stop.unwrap_or(StopReason::OuterIterationCap);
        let outcome = InversionOutcome {
            predicted: ctx.predicted_data(),
            phase: ctx.phase,
            stop_reason,
            iterations: ctx.iteration,
            beta: ctx.beta.unwrap_or(f64::NAN),
            phi_d: ctx.phi_d(),
            phi_m: ctx.phi_m(),
            history: ctx.history,
            model: ctx.model,
        };
        info!(
            phase = %outcome.phase,
            reason = %outcome.stop_reason,
            iterations = outcome.iterations,
            phi_d = outcome.phi_d,
            "inversion finished"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{ActiveCells, Origin, TensorMesh, WidthSegment};
    use crate::optimization::OptimizerConfig;
    use crate::regularization::Alphas;
    use crate::simulation::IntegralSimulation;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn context() -> InversionContext {
        let mesh = TensorMesh::from_segments(
            [
                &[WidthSegment::Uniform(1.0, 2)],
                &[WidthSegment::Uniform(1.0, 1)],
                &[WidthSegment::Uniform(1.0, 1)],
            ],
            [Origin::Zero; 3],
        )
        .unwrap();
        let active = ActiveCells::from_mask(vec![true, true]).unwrap();
        let sim = IntegralSimulation::from_sensitivity(array![[1.0, 0.5], [0.2, 1.0]]);
        let misfit = DataMisfit::new(Box::new(sim), array![1.0, 1.0], &array![0.1, 0.1]).unwrap();
        let reg = SparseRegularization::new(&mesh, &active, array![0.1, 0.1], Alphas::default(), [0.0; 4])
            .unwrap();
        let opt = ProjectedGaussNewton::new(OptimizerConfig::default()).unwrap();
        let problem = InverseProblem::combine(misfit, reg, opt).unwrap();
        InversionContext::new(problem, array![0.1, 0.1], true)
    }

    #[test]
    fn test_starting_model_is_constant_background() {
        let m = starting_model(1e-4, 4).unwrap();
        assert_eq!(m, array![1e-4, 1e-4, 1e-4, 1e-4]);
    }

    #[test]
    fn test_starting_model_rejects_zero_background() {
        assert!(starting_model(0.0, 4).is_err());
        assert!(starting_model(-1.0, 4).is_err());
        assert!(starting_model(1e-4, 0).is_err());
    }

    #[test]
    fn test_beta_initialized_once() {
        let mut ctx = context();
        ctx.initialize_beta(10.0).unwrap();
        assert_eq!(ctx.phase(), Phase::L2);
        assert!(ctx.initialize_beta(5.0).is_err());
        assert_eq!(ctx.beta(), Some(10.0));
    }

    #[test]
    fn test_set_beta_only_in_irls() {
        let mut ctx = context();
        assert!(ctx.set_beta(1.0).is_err());
        ctx.initialize_beta(10.0).unwrap();
        assert!(ctx.set_beta(1.0).is_err());
        ctx.advance_phase(Phase::Irls).unwrap();
        ctx.set_beta(2.0).unwrap();
        assert_eq!(ctx.beta(), Some(2.0));
        assert!(ctx.set_beta(-1.0).is_err());
    }

    #[test]
    fn test_phase_never_moves_backward() {
        let mut ctx = context();
        assert!(ctx.advance_phase(Phase::Irls).is_err());
        ctx.initialize_beta(1.0).unwrap();
        ctx.advance_phase(Phase::Irls).unwrap();
        assert!(ctx.advance_phase(Phase::L2).is_err());
        assert!(ctx.advance_phase(Phase::Initializing).is_err());
    }

    #[test]
    fn test_first_stop_reason_wins() {
        let mut ctx = context();
        ctx.initialize_beta(1.0).unwrap();
        ctx.signal_stop(StopReason::TargetMisfit).unwrap();
        ctx.signal_stop(StopReason::OuterIterationCap).unwrap();
        assert_eq!(ctx.stop_reason(), Some(StopReason::TargetMisfit));
        assert_eq!(ctx.phase(), Phase::Converged);
    }

    #[test]
    fn test_outer_step_requires_beta() {
        let mut ctx = context();
        assert!(ctx.outer_step().is_err());
        ctx.initialize_beta(1e-3).unwrap();
        let report = ctx.outer_step().unwrap();
        assert_eq!(ctx.iteration(), 1);
        assert_eq!(ctx.current_model().len(), 2);
        assert!(report.objective_after <= report.objective_before);
    }

    #[test]
    fn test_preconditioner_length_checked() {
        let mut ctx = context();
        assert!(ctx.set_preconditioner(array![1.0]).is_err());
        ctx.set_preconditioner(array![1.0, 2.0]).unwrap();
        assert_relative_eq!(ctx.preconditioner().unwrap()[1], 2.0);
    }
}
