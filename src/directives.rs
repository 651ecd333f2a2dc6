//! Directive schedule: policies invoked around every outer iteration.
//!
//! Directives run in registered order. Each one declares the directives it
//! depends on, and [`DirectiveSchedule::new`] refuses schedules whose
//! prerequisites are missing or registered too late. Directives change beta,
//! the preconditioner and the regularization state through the
//! [`InversionContext`]; they never touch the model vector.

use crate::error::{InversionError, InversionResult};
use crate::inversion::{InversionContext, IterationRecord, Phase, StopReason};
use crate::io::write_model;
use ndarray::Array1;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectiveKind {
    SensitivityWeighting,
    BetaEstimator,
    OutputSaver,
    IrlsUpdater,
    PreconditionerUpdater,
    TargetMisfit,
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DirectiveKind::SensitivityWeighting => "sensitivity_weighting",
            DirectiveKind::BetaEstimator => "beta_estimator",
            DirectiveKind::OutputSaver => "output_saver",
            DirectiveKind::IrlsUpdater => "irls_updater",
            DirectiveKind::PreconditionerUpdater => "preconditioner_updater",
            DirectiveKind::TargetMisfit => "target_misfit",
        };
        f.write_str(name)
    }
}

pub trait Directive {
    fn kind(&self) -> DirectiveKind;

    /// Directives that must be registered before this one.
    fn requires(&self) -> &'static [DirectiveKind] {
        &[]
    }

    /// Called once before the first outer step.
    fn initialize(&mut self, _ctx: &mut InversionContext) -> InversionResult<()> {
        Ok(())
    }

    /// Called after every outer step.
    fn end_iteration(&mut self, ctx: &mut InversionContext) -> InversionResult<()>;
}

pub struct DirectiveSchedule {
    directives: Vec<Box<dyn Directive>>,
}

impl DirectiveSchedule {
    pub fn new(directives: Vec<Box<dyn Directive>>) -> InversionResult<Self> {
        let mut seen: Vec<DirectiveKind> = Vec::new();
        for d in &directives {
            let kind = d.kind();
            if seen.contains(&kind) {
                return Err(InversionError::config(format!("directive {} registered twice", kind)));
            }
            for req in d.requires() {
                if !seen.contains(req) {
                    return Err(InversionError::config(format!(
                        "directive {} requires {} to be registered before it",
                        kind, req
                    )));
                }
            }
            seen.push(kind);
        }
        if !seen.contains(&DirectiveKind::BetaEstimator) {
            return Err(InversionError::config("schedule has no beta estimator"));
        }
        Ok(Self { directives })
    }

    pub fn kinds(&self) -> Vec<DirectiveKind> {
        self.directives.iter().map(|d| d.kind()).collect()
    }

    pub fn contains(&self, kind: DirectiveKind) -> bool {
        self.directives.iter().any(|d| d.kind() == kind)
    }

    pub fn initialize(&mut self, ctx: &mut InversionContext) -> InversionResult<()> {
        for d in self.directives.iter_mut() {
            debug!(directive = %d.kind(), "initialize");
            d.initialize(ctx)?;
        }
        Ok(())
    }

    /// Run every directive in order; once one signals stop the rest are skipped.
    pub fn end_iteration(&mut self, ctx: &mut InversionContext) -> InversionResult<()> {
        for d in self.directives.iter_mut() {
            if ctx.is_stopped() {
                break;
            }
            d.end_iteration(ctx)?;
        }
        Ok(())
    }
}

impl fmt::Display for DirectiveSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.kinds().iter().map(|k| k.to_string()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

fn relative_change(previous: f64, current: f64) -> f64 {
    if previous == 0.0 {
        if current == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        ((current - previous) / previous).abs()
    }
}

// ============================================================================
// Sensitivity weighting
// ============================================================================

const SENSITIVITY_FLOOR: f64 = 1e-12;

/// Regularization cell weights `sqrt(diag(J^T W^T W J))`, normalised by their maximum.
pub struct SensitivityWeighting {
    every_iteration: bool,
}

impl SensitivityWeighting {
    pub fn new(every_iteration: bool) -> Self {
        Self { every_iteration }
    }

    fn apply(&self, ctx: &mut InversionContext) -> InversionResult<()> {
        let misfit = ctx.problem().misfit();
        let diag = misfit.simulation().jtj_diag(ctx.current_model(), misfit.weights());
        let wr = diag.mapv(f64::sqrt);
        let max = wr.iter().fold(0.0_f64, |acc, v| acc.max(*v));
        if !(max > 0.0 && max.is_finite()) {
            return Err(InversionError::Numerical("sensitivity vanishes for every cell".into()));
        }
        let weights = wr.mapv(|w| (w / max).max(SENSITIVITY_FLOOR));
        debug!(
            min = weights.iter().fold(f64::INFINITY, |acc, v| acc.min(*v)),
            "sensitivity weights updated"
        );
        ctx.regularization_mut().set_cell_weights(weights)
    }
}

impl Directive for SensitivityWeighting {
    fn kind(&self) -> DirectiveKind {
        DirectiveKind::SensitivityWeighting
    }

    fn initialize(&mut self, ctx: &mut InversionContext) -> InversionResult<()> {
        self.apply(ctx)
    }

    fn end_iteration(&mut self, ctx: &mut InversionContext) -> InversionResult<()> {
        if self.every_iteration {
            self.apply(ctx)?;
        }
        Ok(())
    }
}

// ============================================================================
// Beta estimator
// ============================================================================

/// Deterministic pseudo-random vector in [0, 1).
fn seed_vector(seed: u64, n: usize) -> Array1<f64> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) as f64) / ((1u64 << 31) as f64)
        })
        .collect()
}

/// Largest eigenvalue of a symmetric positive semi-definite operator.
fn power_iteration(
    op: impl Fn(&Array1<f64>) -> Array1<f64>,
    start: &Array1<f64>,
    iterations: usize,
) -> f64 {
    let mut x = start.clone();
    let mut lambda = 0.0;
    for _ in 0..iterations.max(1) {
        let norm = x.dot(&x).sqrt();
        if norm == 0.0 {
            return 0.0;
        }
        x /= norm;
        let y = op(&x);
        lambda = x.dot(&y);
        x = y;
    }
    lambda
}

/// Sets the initial beta as `ratio * lambda_d / lambda_m`.
pub struct BetaEstimator {
    ratio: f64,
    iterations: usize,
    seed: u64,
}

impl BetaEstimator {
    pub fn new(ratio: f64, iterations: usize, seed: u64) -> Self {
        Self {
            ratio,
            iterations,
            seed,
        }
    }

    pub fn estimate(&self, ctx: &InversionContext) -> InversionResult<f64> {
        let m = ctx.current_model();
        let problem = ctx.problem();
        let x0 = seed_vector(self.seed, m.len());
        let lambda_d = power_iteration(|v| problem.misfit().hessian_vec(m, v), &x0, self.iterations);
        let lambda_m = power_iteration(|v| problem.regularization().hessian_vec(v), &x0, self.iterations);
        if !(lambda_m > 0.0) {
            return Err(InversionError::Numerical(format!(
                "regularization curvature estimate is {}",
                lambda_m
            )));
        }
        let beta = self.ratio * lambda_d / lambda_m;
        info!(lambda_d, lambda_m, beta, "initial beta estimated");
        Ok(beta)
    }
}

impl Directive for BetaEstimator {
    fn kind(&self) -> DirectiveKind {
        DirectiveKind::BetaEstimator
    }

    fn initialize(&mut self, ctx: &mut InversionContext) -> InversionResult<()> {
        let beta = self.estimate(ctx)?;
        ctx.initialize_beta(beta)
    }

    fn end_iteration(&mut self, _ctx: &mut InversionContext) -> InversionResult<()> {
        Ok(())
    }
}

// ============================================================================
// Output saver
// ============================================================================

/// Appends an [`IterationRecord`] per iteration and optionally dumps each iterate.
pub struct OutputSaver {
    iterations_dir: Option<PathBuf>,
}

impl OutputSaver {
    pub fn new(iterations_dir: Option<PathBuf>) -> Self {
        Self { iterations_dir }
    }
}

impl Directive for OutputSaver {
    fn kind(&self) -> DirectiveKind {
        DirectiveKind::OutputSaver
    }

    fn end_iteration(&mut self, ctx: &mut InversionContext) -> InversionResult<()> {
        let beta = ctx.beta().unwrap_or(f64::NAN);
        let phi_d = ctx.phi_d();
        let phi_m = ctx.phi_m();
        let (cg_iterations, ls_iterations, soft_failures) = ctx
            .last_step()
            .map(|s| (s.cg_iterations, s.ls_iterations, s.soft_failures.len()))
            .unwrap_or_default();
        let record = IterationRecord {
            iteration: ctx.iteration(),
            phase: ctx.phase(),
            beta,
            phi_d,
            phi_m,
            phi: phi_d + beta * phi_m,
            norms: ctx.problem().regularization().norms(),
            epsilon: ctx.problem().regularization().epsilon(),
            cg_iterations,
            ls_iterations,
            soft_failures,
        };
        ctx.record(record);

        if let Some(dir) = &self.iterations_dir {
            let path = dir.join(format!("model_{:03}.txt", ctx.iteration()));
            write_model(&path, ctx.current_model())?;
        }
        Ok(())
    }
}

// ============================================================================
// IRLS updater
// ============================================================================

#[derive(Debug, Clone)]
pub struct IrlsSettings {
    pub f_min_change: f64,
    pub max_irls_iterations: usize,
    pub cool_eps_fact: f64,
    pub beta_tol: f64,
    pub chifact: f64,
    pub norm_ramp_iterations: usize,
}

impl Default for IrlsSettings {
    fn default() -> Self {
        Self {
            f_min_change: 1e-4,
            max_irls_iterations: 30,
            cool_eps_fact: 1.5,
            beta_tol: 1e-2,
            chifact: 1.0,
            norm_ramp_iterations: 3,
        }
    }
}

/// Drives the L2 to IRLS transition and the sparse reweighting schedule.
pub struct IrlsUpdater {
    settings: IrlsSettings,
    irls_iteration: usize,
    previous_phi_m: Option<f64>,
}

impl IrlsUpdater {
    pub fn new(settings: IrlsSettings) -> Self {
        Self {
            settings,
            irls_iteration: 0,
            previous_phi_m: None,
        }
    }

    pub fn irls_iteration(&self) -> usize {
        self.irls_iteration
    }

    fn target(&self, ctx: &InversionContext) -> f64 {
        self.settings.chifact * ctx.n_data() as f64
    }

    fn l2_iteration(&mut self, ctx: &mut InversionContext) -> InversionResult<()> {
        let phi_d = ctx.phi_d();
        let phi_m = ctx.phi_m();
        let change = self
            .previous_phi_m
            .map(|prev| relative_change(prev, phi_m))
            .unwrap_or(f64::INFINITY);
        self.previous_phi_m = Some(phi_m);

        if phi_d > self.target(ctx) && change >= self.settings.f_min_change {
            return Ok(());
        }

        let m = ctx.current_model().clone();
        ctx.advance_phase(Phase::Irls)?;
        let reg = ctx.regularization_mut();
        let eps = reg.start_irls(&m);
        reg.step_norms(self.settings.norm_ramp_iterations);
        reg.update_irls_weights(&m);
        info!(
            phi_d,
            change,
            eps_s = eps[0],
            eps_grad = eps[1],
            norms = ?reg.norms(),
            "IRLS activated"
        );
        self.previous_phi_m = None;
        Ok(())
    }

    fn irls_iteration_step(&mut self, ctx: &mut InversionContext) -> InversionResult<()> {
        self.irls_iteration += 1;
        let phi_m = ctx.phi_m();
        let change = self
            .previous_phi_m
            .map(|prev| relative_change(prev, phi_m))
            .unwrap_or(f64::INFINITY);
        self.previous_phi_m = Some(phi_m);

        if self.irls_iteration >= self.settings.max_irls_iterations {
            return ctx.signal_stop(StopReason::IrlsIterationCap);
        }
        if ctx.problem().regularization().norms_at_target()
            && self.irls_iteration >= 2
            && change < self.settings.f_min_change
        {
            return ctx.signal_stop(StopReason::SparseConverged);
        }

        let phi_d = ctx.phi_d();
        let target = self.target(ctx);
        if let Some(beta) = ctx.beta() {
            match adjusted_beta(beta, phi_d, target, self.settings.beta_tol) {
                Some(next) => {
                    ctx.set_beta(next)?;
                    debug!(from = beta, to = next, phi_d, target, "beta adjusted");
                }
                None => debug!(beta, phi_d, target, "beta kept"),
            }
        }

        let m = ctx.current_model().clone();
        let reg = ctx.regularization_mut();
        reg.cool_epsilon(self.settings.cool_eps_fact);
        reg.step_norms(self.settings.norm_ramp_iterations);
        reg.update_irls_weights(&m);
        debug!(
            irls_iteration = self.irls_iteration,
            change,
            eps = ?reg.epsilon(),
            norms = ?reg.norms(),
            "IRLS weights updated"
        );
        Ok(())
    }
}

/// Beta after one IRLS rebalance, or `None` when it stays put.
///
/// The ratio `target / phi_d` is averaged with 2 when the misfit is below
/// target and with 0.75 otherwise. Misfits inside the `beta_tol` band, and a
/// zero misfit where the ratio has no finite value, leave beta unchanged.
fn adjusted_beta(beta: f64, phi_d: f64, target: f64, beta_tol: f64) -> Option<f64> {
    if !(phi_d > 0.0) || (1.0 - phi_d / target).abs() <= beta_tol {
        return None;
    }
    let ratio = target / phi_d;
    let factor = if ratio > 1.0 {
        0.5 * (ratio + 2.0)
    } else {
        0.5 * (ratio + 0.75)
    };
    let next = beta * factor;
    next.is_finite().then_some(next)
}

impl Directive for IrlsUpdater {
    fn kind(&self) -> DirectiveKind {
        DirectiveKind::IrlsUpdater
    }

    fn requires(&self) -> &'static [DirectiveKind] {
        &[DirectiveKind::BetaEstimator]
    }

    fn end_iteration(&mut self, ctx: &mut InversionContext) -> InversionResult<()> {
        match ctx.phase() {
            Phase::L2 => self.l2_iteration(ctx),
            Phase::Irls => self.irls_iteration_step(ctx),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Preconditioner updater
// ============================================================================

/// Jacobi preconditioner `1 / diag(H_d + beta H_m)`.
pub struct PreconditionerUpdater;

impl PreconditionerUpdater {
    fn apply(&self, ctx: &mut InversionContext) -> InversionResult<()> {
        let Some(beta) = ctx.beta() else {
            return Err(InversionError::config("preconditioner needs beta to be set"));
        };
        let problem = ctx.problem();
        let diag = problem.misfit().hessian_diag(ctx.current_model())
            + problem.regularization().hessian_diag() * beta;
        let inv = diag.mapv(|d| if d > 0.0 { 1.0 / d } else { 1.0 });
        ctx.set_preconditioner(inv)
    }
}

impl Directive for PreconditionerUpdater {
    fn kind(&self) -> DirectiveKind {
        DirectiveKind::PreconditionerUpdater
    }

    fn requires(&self) -> &'static [DirectiveKind] {
        &[DirectiveKind::BetaEstimator]
    }

    fn initialize(&mut self, ctx: &mut InversionContext) -> InversionResult<()> {
        self.apply(ctx)
    }

    fn end_iteration(&mut self, ctx: &mut InversionContext) -> InversionResult<()> {
        self.apply(ctx)
    }
}

// ============================================================================
// Target misfit
// ============================================================================

/// Stops the run once `phi_d <= chifact * nD`.
pub struct TargetMisfit {
    chifact: f64,
}

impl TargetMisfit {
    pub fn new(chifact: f64) -> Self {
        Self { chifact }
    }
}

impl Directive for TargetMisfit {
    fn kind(&self) -> DirectiveKind {
        DirectiveKind::TargetMisfit
    }

    fn end_iteration(&mut self, ctx: &mut InversionContext) -> InversionResult<()> {
        let eligible = match ctx.phase() {
            Phase::Irls => ctx.problem().regularization().norms_at_target(),
            Phase::L2 => !ctx.sparse_schedule(),
            _ => false,
        };
        let target = self.chifact * ctx.n_data() as f64;
        if eligible && ctx.phi_d() <= target {
            return ctx.signal_stop(StopReason::TargetMisfit);
        }
        Ok(())
    }
}
