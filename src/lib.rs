//! Sparse-norm inversion of total magnetic intensity data for a 3D
//! susceptibility model.
//!
//! The pipeline loads topography and observations, builds a survey, a tensor
//! mesh and the active cells below topography, assembles a weighted L2 data
//! misfit with a sparse IRLS regularization and a projected Gauss-Newton
//! optimizer, and drives the outer loop through a validated directive
//! schedule. See [`pipeline::run_inversion`].

pub mod config;
pub mod data;
pub mod directives;
pub mod error;
pub mod inversion;
pub mod io;
pub mod mesh;
pub mod misfit;
pub mod optimization;
pub mod pipeline;
pub mod regularization;
pub mod simulation;
pub mod survey;
pub mod viz;

pub use error::{InversionError, InversionResult};
