//! TOML run configuration.
//!
//! Everything except `[data]` and `[mesh]` has defaults, so a minimal file
//! names the two input files and the mesh widths.

use crate::data::ObservationColumns;
use crate::directives::IrlsSettings;
use crate::error::{InversionError, InversionResult};
use crate::mesh::{Origin, WidthSegment};
use crate::optimization::OptimizerConfig;
use crate::regularization::Alphas;
use crate::survey::{Component, SourceField};
use crate::viz::SliceRequest;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

macro_rules! bail_config {
    ($($arg:tt)*) => {
        return Err(InversionError::config(format!($($arg)*)))
    };
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Root {
    #[serde(default)]
    pub project: Project,
    pub data: Data,
    #[serde(default)]
    pub survey: Survey,
    pub mesh: Mesh,
    #[serde(default)]
    pub model: Model,
    #[serde(default)]
    pub regularization: Regularization,
    #[serde(default)]
    pub optimization: Optimization,
    #[serde(default)]
    pub directives: Directives,
    #[serde(default)]
    pub output: Output,
    pub synthetic: Option<Synthetic>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Project {
    #[serde(default = "default_project_name")]
    pub name: String,
    #[serde(default = "default_project_version")]
    pub version: String,
}

fn default_project_name() -> String {
    "maginv".to_string()
}
fn default_project_version() -> String {
    "0.1.0".to_string()
}

impl Default for Project {
    fn default() -> Self {
        Self {
            name: default_project_name(),
            version: default_project_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Data {
    /// Whitespace-delimited `x y z` rows
    pub topography: PathBuf,
    /// Whitespace-delimited rows; see `columns`
    pub observations: PathBuf,
    /// Zero-based column indices. The default layout skips column 3.
    #[serde(default)]
    pub columns: ObservationColumns,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Survey {
    #[serde(default = "default_strength")]
    pub strength_nt: f64,
    #[serde(default = "default_inclination")]
    pub inclination_deg: f64,
    #[serde(default)]
    pub declination_deg: f64,
    #[serde(default = "default_components")]
    pub components: Vec<Component>,
}

fn default_strength() -> f64 { 50_000.0 }
fn default_inclination() -> f64 { 90.0 }
fn default_components() -> Vec<Component> {
    vec![Component::Tmi]
}

impl Default for Survey {
    fn default() -> Self {
        Self {
            strength_nt: default_strength(),
            inclination_deg: default_inclination(),
            declination_deg: 0.0,
            components: default_components(),
        }
    }
}

impl Survey {
    pub fn source_field(&self) -> SourceField {
        SourceField {
            strength_nt: self.strength_nt,
            inclination_deg: self.inclination_deg,
            declination_deg: self.declination_deg,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Mesh {
    pub hx: Vec<WidthSegment>,
    pub hy: Vec<WidthSegment>,
    pub hz: Vec<WidthSegment>,
    #[serde(default = "default_origin")]
    pub origin: [Origin; 3],
}

fn default_origin() -> [Origin; 3] {
    [Origin::Centered, Origin::Centered, Origin::Negative]
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Model {
    /// Starting and reference susceptibility (SI)
    #[serde(default = "default_background")]
    pub background_susceptibility: f64,
    #[serde(default)]
    pub lower_bound: f64,
    #[serde(default = "default_one")]
    pub upper_bound: f64,
}

fn default_background() -> f64 { 1e-4 }
fn default_one() -> f64 { 1.0 }

impl Default for Model {
    fn default() -> Self {
        Self {
            background_susceptibility: default_background(),
            lower_bound: 0.0,
            upper_bound: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Regularization {
    #[serde(default = "default_one")]
    pub alpha_s: f64,
    #[serde(default = "default_one")]
    pub alpha_x: f64,
    #[serde(default = "default_one")]
    pub alpha_y: f64,
    #[serde(default = "default_one")]
    pub alpha_z: f64,
    /// Target exponents `[p, qx, qy, qz]`
    #[serde(default)]
    pub norms: [f64; 4],
}

impl Default for Regularization {
    fn default() -> Self {
        Self {
            alpha_s: 1.0,
            alpha_x: 1.0,
            alpha_y: 1.0,
            alpha_z: 1.0,
            norms: [0.0; 4],
        }
    }
}

impl Regularization {
    pub fn alphas(&self) -> Alphas {
        Alphas {
            s: self.alpha_s,
            x: self.alpha_x,
            y: self.alpha_y,
            z: self.alpha_z,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Optimization {
    /// Outer iteration cap
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_max_iter_ls")]
    pub max_iter_ls: usize,
    #[serde(default = "default_max_iter_cg")]
    pub max_iter_cg: usize,
    #[serde(default = "default_tol_cg")]
    pub tol_cg: f64,
}

fn default_max_iter() -> usize { 10 }
fn default_max_iter_ls() -> usize { 20 }
fn default_max_iter_cg() -> usize { 10 }
fn default_tol_cg() -> f64 { 1e-3 }

impl Default for Optimization {
    fn default() -> Self {
        Self {
            max_iter: default_max_iter(),
            max_iter_ls: default_max_iter_ls(),
            max_iter_cg: default_max_iter_cg(),
            tol_cg: default_tol_cg(),
        }
    }
}

impl Optimization {
    pub fn optimizer_config(&self, model: &Model) -> OptimizerConfig {
        OptimizerConfig {
            max_iter: self.max_iter,
            max_iter_ls: self.max_iter_ls,
            max_iter_cg: self.max_iter_cg,
            tol_cg: self.tol_cg,
            lower: model.lower_bound,
            upper: model.upper_bound,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Directives {
    #[serde(default = "default_beta0_ratio")]
    pub beta0_ratio: f64,
    #[serde(default = "default_power_iterations")]
    pub power_iterations: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Recompute sensitivity weights after every iteration, not only at start
    #[serde(default)]
    pub sensitivity_every_iteration: bool,
    #[serde(default)]
    pub irls: Irls,
    #[serde(default)]
    pub target: Target,
}

fn default_beta0_ratio() -> f64 { 5.0 }
fn default_power_iterations() -> usize { 4 }
fn default_seed() -> u64 { 518_936 }

impl Default for Directives {
    fn default() -> Self {
        Self {
            beta0_ratio: default_beta0_ratio(),
            power_iterations: default_power_iterations(),
            seed: default_seed(),
            sensitivity_every_iteration: false,
            irls: Irls::default(),
            target: Target::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Irls {
    #[serde(default = "default_f_min_change")]
    pub f_min_change: f64,
    #[serde(default = "default_max_irls_iterations")]
    pub max_irls_iterations: usize,
    #[serde(default = "default_cool_eps_fact")]
    pub cool_eps_fact: f64,
    #[serde(default = "default_beta_tol")]
    pub beta_tol: f64,
    #[serde(default = "default_one")]
    pub chifact: f64,
    #[serde(default = "default_norm_ramp")]
    pub norm_ramp_iterations: usize,
}

fn default_f_min_change() -> f64 { 1e-4 }
fn default_max_irls_iterations() -> usize { 30 }
fn default_cool_eps_fact() -> f64 { 1.5 }
fn default_beta_tol() -> f64 { 1e-2 }
fn default_norm_ramp() -> usize { 3 }

impl Default for Irls {
    fn default() -> Self {
        Self {
            f_min_change: default_f_min_change(),
            max_irls_iterations: default_max_irls_iterations(),
            cool_eps_fact: default_cool_eps_fact(),
            beta_tol: default_beta_tol(),
            chifact: 1.0,
            norm_ramp_iterations: default_norm_ramp(),
        }
    }
}

impl Irls {
    pub fn settings(&self) -> IrlsSettings {
        IrlsSettings {
            f_min_change: self.f_min_change,
            max_irls_iterations: self.max_irls_iterations,
            cool_eps_fact: self.cool_eps_fact,
            beta_tol: self.beta_tol,
            chifact: self.chifact,
            norm_ramp_iterations: self.norm_ramp_iterations,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Target {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_one")]
    pub chifact: f64,
}

fn default_true() -> bool { true }

impl Default for Target {
    fn default() -> Self {
        Self {
            enabled: true,
            chifact: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Output {
    #[serde(default = "default_model_path")]
    pub model: PathBuf,
    #[serde(default = "default_predicted_path")]
    pub predicted: PathBuf,
    #[serde(default = "default_history_path")]
    pub history: PathBuf,
    /// Directory for per-iteration model dumps
    pub iterations_dir: Option<PathBuf>,
    #[serde(default)]
    pub slices: Vec<SliceRequest>,
}

fn default_model_path() -> PathBuf {
    PathBuf::from("results/recovered_model.txt")
}
fn default_predicted_path() -> PathBuf {
    PathBuf::from("results/dpred.txt")
}
fn default_history_path() -> PathBuf {
    PathBuf::from("results/history.csv")
}

impl Default for Output {
    fn default() -> Self {
        Self {
            model: default_model_path(),
            predicted: default_predicted_path(),
            history: default_history_path(),
            iterations_dir: None,
            slices: Vec::new(),
        }
    }
}

impl Output {
    /// Move every output into `dir`, keeping file names.
    pub fn rebase(&mut self, dir: &Path) {
        let move_into = |p: &Path| match p.file_name() {
            Some(name) => dir.join(name),
            None => dir.to_path_buf(),
        };
        self.model = move_into(&self.model);
        self.predicted = move_into(&self.predicted);
        self.history = move_into(&self.history);
        self.iterations_dir = self.iterations_dir.as_deref().map(move_into);
        for s in self.slices.iter_mut() {
            s.path = move_into(&s.path);
        }
    }
}

/// Rectangular anomaly for the `forward` command.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Synthetic {
    pub min: [f64; 3],
    pub max: [f64; 3],
    pub susceptibility: f64,
}

impl Root {
    pub fn from_toml(text: &str) -> InversionResult<Self> {
        let cfg: Root = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate; also returns the raw text for hashing.
    pub fn load(path: &Path) -> InversionResult<(Self, String)> {
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => InversionError::FileNotFound {
                path: path.to_path_buf(),
            },
            _ => InversionError::Io(e),
        })?;
        Ok((Self::from_toml(&text)?, text))
    }

    pub fn validate(&self) -> InversionResult<()> {
        self.data.columns.validate()?;

        let s = &self.survey;
        if !(s.strength_nt.is_finite() && s.strength_nt > 0.0) {
            bail_config!("survey.strength_nt must be positive");
        }
        if !(-90.0..=90.0).contains(&s.inclination_deg) {
            bail_config!("survey.inclination_deg must be in [-90, 90]");
        }
        if !(-360.0..=360.0).contains(&s.declination_deg) {
            bail_config!("survey.declination_deg must be in [-360, 360]");
        }
        if s.components.is_empty() {
            bail_config!("survey.components must not be empty");
        }

        if self.mesh.hx.is_empty() || self.mesh.hy.is_empty() || self.mesh.hz.is_empty() {
            bail_config!("mesh.hx, mesh.hy and mesh.hz must each have at least one segment");
        }

        let m = &self.model;
        if !(m.background_susceptibility.is_finite() && m.background_susceptibility > 0.0) {
            bail_config!("model.background_susceptibility must be > 0");
        }
        if !(m.lower_bound < m.upper_bound) {
            bail_config!("model.lower_bound must be < model.upper_bound");
        }
        if !(m.lower_bound..=m.upper_bound).contains(&m.background_susceptibility) {
            bail_config!("model.background_susceptibility must lie within the bounds");
        }

        let r = &self.regularization;
        let alphas = [r.alpha_s, r.alpha_x, r.alpha_y, r.alpha_z];
        if alphas.iter().any(|a| !(a.is_finite() && *a >= 0.0)) {
            bail_config!("regularization.alpha_* must be >= 0");
        }
        if alphas.iter().all(|a| *a == 0.0) {
            bail_config!("at least one regularization.alpha_* must be > 0");
        }
        if r.norms.iter().any(|p| !(0.0..=2.0).contains(p)) {
            bail_config!("regularization.norms must be in [0, 2]");
        }

        let o = &self.optimization;
        if o.max_iter == 0 || o.max_iter > 10_000 {
            bail_config!("optimization.max_iter must be in [1, 10000]");
        }
        if o.max_iter_ls == 0 || o.max_iter_cg == 0 {
            bail_config!("optimization.max_iter_ls and optimization.max_iter_cg must be >= 1");
        }
        if !(o.tol_cg.is_finite() && o.tol_cg > 0.0) {
            bail_config!("optimization.tol_cg must be positive");
        }

        let d = &self.directives;
        if !(d.beta0_ratio.is_finite() && d.beta0_ratio > 0.0) {
            bail_config!("directives.beta0_ratio must be positive");
        }
        if d.power_iterations == 0 {
            bail_config!("directives.power_iterations must be >= 1");
        }
        let irls = &d.irls;
        if !(irls.f_min_change > 0.0) {
            bail_config!("directives.irls.f_min_change must be positive");
        }
        if irls.max_irls_iterations == 0 {
            bail_config!("directives.irls.max_irls_iterations must be >= 1");
        }
        if !(irls.cool_eps_fact >= 1.0) {
            bail_config!("directives.irls.cool_eps_fact must be >= 1");
        }
        if !(irls.beta_tol > 0.0) || !(irls.chifact > 0.0) {
            bail_config!("directives.irls.beta_tol and directives.irls.chifact must be positive");
        }
        if irls.norm_ramp_iterations == 0 {
            bail_config!("directives.irls.norm_ramp_iterations must be >= 1");
        }
        if !(d.target.chifact > 0.0) {
            bail_config!("directives.target.chifact must be positive");
        }

        if let Some(ref syn) = self.synthetic {
            for axis in 0..3 {
                if !(syn.min[axis] < syn.max[axis]) {
                    bail_config!("synthetic.min must be < synthetic.max on every axis");
                }
            }
            if !(m.lower_bound..=m.upper_bound).contains(&syn.susceptibility) {
                bail_config!("synthetic.susceptibility must lie within the model bounds");
            }
        }

        Ok(())
    }
}
