//! End-to-end wiring: load, assemble, invert, export.

use crate::config;
use crate::data::{load_observations, load_topography, uncertainty_floor};
use crate::directives::{
    BetaEstimator, Directive, DirectiveSchedule, IrlsUpdater, OutputSaver, PreconditionerUpdater,
    SensitivityWeighting, TargetMisfit,
};
use crate::error::{InversionError, InversionResult};
use crate::inversion::{starting_model, Driver, InverseProblem, InversionOutcome};
use crate::io::{write_history, write_model, write_observations, write_predicted};
use crate::mesh::{active_cells, ActiveCells, TensorMesh};
use crate::misfit::DataMisfit;
use crate::optimization::ProjectedGaussNewton;
use crate::regularization::SparseRegularization;
use crate::simulation::{ForwardSimulation, IntegralSimulation};
use crate::survey::Survey;
use crate::viz::SliceRenderer;
use ndarray::{Array1, Array2};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

pub fn build_mesh(cfg: &config::Mesh) -> InversionResult<TensorMesh> {
    TensorMesh::from_segments(
        [cfg.hx.as_slice(), cfg.hy.as_slice(), cfg.hz.as_slice()],
        cfg.origin,
    )
}

/// Directives in their standard order.
pub fn standard_schedule(cfg: &config::Root) -> InversionResult<DirectiveSchedule> {
    let d = &cfg.directives;
    let mut directives: Vec<Box<dyn Directive>> = vec![
        Box::new(SensitivityWeighting::new(d.sensitivity_every_iteration)),
        Box::new(BetaEstimator::new(d.beta0_ratio, d.power_iterations, d.seed)),
        Box::new(OutputSaver::new(cfg.output.iterations_dir.clone())),
        Box::new(IrlsUpdater::new(d.irls.settings())),
        Box::new(PreconditionerUpdater),
    ];
    if d.target.enabled {
        directives.push(Box::new(TargetMisfit::new(d.target.chifact)));
    }
    DirectiveSchedule::new(directives)
}

pub struct InversionRun {
    pub mesh: TensorMesh,
    pub active: ActiveCells,
    pub locations: Array2<f64>,
    pub outcome: InversionOutcome,
    pub target_misfit: f64,
    pub wall_time_ms: f64,
}

pub fn run_inversion(cfg: &config::Root) -> InversionResult<InversionRun> {
    let start = Instant::now();

    let topo = load_topography(&cfg.data.topography)?;
    let obs = load_observations(&cfg.data.observations, &cfg.data.columns)?;
    let uncertainty = uncertainty_floor(&obs.values);
    info!(
        receivers = obs.len(),
        std = uncertainty.get(0).copied().unwrap_or(0.0),
        "uncertainty floor applied"
    );

    let survey = Survey::new(
        cfg.survey.source_field(),
        obs.locations.clone(),
        cfg.survey.components.clone(),
    )?;
    if survey.n_data() != obs.len() {
        return Err(InversionError::config(format!(
            "survey measures {} components per receiver but the observation file has one value per row",
            survey.components().len()
        )));
    }

    let mesh = build_mesh(&cfg.mesh)?;
    let active = active_cells(&mesh, &topo)?;
    let simulation = IntegralSimulation::new(&mesh, &survey, &active);

    let m0 = starting_model(cfg.model.background_susceptibility, active.n_active())?;
    let misfit = DataMisfit::new(Box::new(simulation), obs.values.clone(), &uncertainty)?;
    let regularization = SparseRegularization::new(
        &mesh,
        &active,
        m0.clone(),
        cfg.regularization.alphas(),
        cfg.regularization.norms,
    )?;
    let optimizer = ProjectedGaussNewton::new(cfg.optimization.optimizer_config(&cfg.model))?;
    let problem = InverseProblem::combine(misfit, regularization, optimizer)?;

    let schedule = standard_schedule(cfg)?;
    let outcome = Driver::new(problem, schedule).run(m0)?;

    Ok(InversionRun {
        target_misfit: cfg.directives.target.chifact * obs.len() as f64,
        mesh,
        active,
        locations: obs.locations,
        outcome,
        wall_time_ms: start.elapsed().as_secs_f64() * 1000.0,
    })
}

/// Write the model, predicted data, history and requested slices.
pub fn export(
    output: &config::Output,
    run: &InversionRun,
    renderer: &mut dyn SliceRenderer,
) -> InversionResult<()> {
    write_model(&output.model, &run.outcome.model)?;
    write_predicted(&output.predicted, &run.locations, &run.outcome.predicted)?;
    write_history(&output.history, &run.outcome.history)?;
    for request in &output.slices {
        renderer.render(&run.mesh, &run.active, &run.outcome.model, request)?;
    }
    info!(
        model = %output.model.display(),
        predicted = %output.predicted.display(),
        history = %output.history.display(),
        slices = output.slices.len(),
        "results written"
    );
    Ok(())
}

// ============================================================================
// Synthetic forward modelling
// ============================================================================

pub struct SyntheticData {
    pub observations: PathBuf,
    pub true_model: PathBuf,
    pub n_receivers: usize,
    pub n_anomalous: usize,
}

/// Background model with the cells whose centres fall in the block set to
/// the block susceptibility. Returns the model and the number of block cells.
pub fn block_model(
    mesh: &TensorMesh,
    active: &ActiveCells,
    background: f64,
    block: &config::Synthetic,
) -> (Array1<f64>, usize) {
    let mut count = 0;
    let model = active
        .cells()
        .iter()
        .map(|&cell| {
            let c = mesh.cell_center(cell);
            let inside = (0..3).all(|a| block.min[a] <= c[a] && c[a] <= block.max[a]);
            if inside {
                count += 1;
                block.susceptibility
            } else {
                background
            }
        })
        .collect();
    (model, count)
}

/// Simulate the `[synthetic]` block at receivers `height` above each
/// topography point and write an observation file plus the true model.
pub fn forward_synthetic(cfg: &config::Root, height: f64) -> InversionResult<SyntheticData> {
    let block = cfg
        .synthetic
        .as_ref()
        .ok_or_else(|| InversionError::config("forward modelling needs a [synthetic] section"))?;
    if cfg.survey.components.len() != 1 {
        return Err(InversionError::config(
            "forward modelling writes one value per receiver; configure exactly one component",
        ));
    }

    let topo = load_topography(&cfg.data.topography)?;
    let mut locations = topo.clone();
    locations.column_mut(2).mapv_inplace(|z| z + height);

    let survey = Survey::new(cfg.survey.source_field(), locations, cfg.survey.components.clone())?;
    let mesh = build_mesh(&cfg.mesh)?;
    let active = active_cells(&mesh, &topo)?;
    let (model, n_anomalous) =
        block_model(&mesh, &active, cfg.model.background_susceptibility, block);
    let simulation = IntegralSimulation::new(&mesh, &survey, &active);
    let data = simulation.dpred(&model);

    let true_model = sibling(&cfg.output.model, "true_model.txt");
    write_observations(&cfg.data.observations, survey.locations(), &data)?;
    write_model(&true_model, &model)?;
    info!(
        receivers = survey.n_receivers(),
        anomalous_cells = n_anomalous,
        observations = %cfg.data.observations.display(),
        "synthetic data written"
    );

    Ok(SyntheticData {
        observations: cfg.data.observations.clone(),
        true_model,
        n_receivers: survey.n_receivers(),
        n_anomalous,
    })
}

fn sibling(path: &Path, name: &str) -> PathBuf {
    match path.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::DirectiveKind;
    use crate::mesh::{Origin, WidthSegment};

    fn root(extra: &str) -> config::Root {
        let text = format!(
            "[data]\ntopography = \"t.txt\"\nobservations = \"o.txt\"\n\n\
             [mesh]\nhx = [[1.0, 2]]\nhy = [[1.0, 2]]\nhz = [[1.0, 2]]\n{}",
            extra
        );
        config::Root::from_toml(&text).unwrap()
    }

    #[test]
    fn test_standard_schedule_order() {
        let schedule = standard_schedule(&root("")).unwrap();
        assert_eq!(schedule.kinds().len(), 6);
        assert_eq!(schedule.kinds()[0], DirectiveKind::SensitivityWeighting);
        assert_eq!(schedule.kinds()[5], DirectiveKind::TargetMisfit);
    }

    #[test]
    fn test_target_can_be_disabled() {
        let schedule = standard_schedule(&root("\n[directives.target]\nenabled = false\n")).unwrap();
        assert!(!schedule.contains(DirectiveKind::TargetMisfit));
    }

    #[test]
    fn test_block_model_counts_cells() {
        let mesh = TensorMesh::from_segments(
            [
                &[WidthSegment::Uniform(1.0, 4)],
                &[WidthSegment::Uniform(1.0, 1)],
                &[WidthSegment::Uniform(1.0, 1)],
            ],
            [Origin::Zero; 3],
        )
        .unwrap();
        let active = ActiveCells::from_mask(vec![true; 4]).unwrap();
        let block = config::Synthetic {
            min: [1.0, -1.0, -1.0],
            max: [3.0, 1.0, 1.0],
            susceptibility: 0.1,
        };
        let (model, n) = block_model(&mesh, &active, 1e-4, &block);
        assert_eq!(n, 2);
        assert_eq!(model.to_vec(), vec![1e-4, 0.1, 0.1, 1e-4]);
    }

    #[test]
    fn test_forward_needs_synthetic_section() {
        assert!(forward_synthetic(&root(""), 1.0).is_err());
    }

    #[test]
    fn test_sibling_path() {
        assert_eq!(
            sibling(Path::new("results/recovered_model.txt"), "true_model.txt"),
            PathBuf::from("results/true_model.txt")
        );
    }
}
