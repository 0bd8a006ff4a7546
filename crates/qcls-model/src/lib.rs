//! # qcls-model
//!
//! Likelihood models implementing [`qcls_core::StatModel`]:
//! - [`GaussianModel`]: Gaussian measurements with an optional constrained systematic
//! - [`CountingModel`]: binned Poisson counting experiment built from a JSON [`Workspace`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod counting;
pub mod gaussian;
pub mod schema;
pub mod simplemodels;

pub use counting::{CountingModel, DEFAULT_DATA_NAME};
pub use gaussian::GaussianModel;
pub use schema::Workspace;

#[cfg(test)]
mod tests;
