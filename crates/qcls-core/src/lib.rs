//! # qcls-core
//!
//! Core types, traits, and error handling for quickcls.
//!
//! This crate provides:
//! - The error taxonomy shared by every crate
//! - The clonable parameter state handed to each minimization
//! - Dataset and fit-result types
//! - The [`StatModel`] trait implemented by likelihood models

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dataset;
pub mod error;
pub mod params;
pub mod traits;
pub mod types;

pub use dataset::{Conditioning, Dataset, DatasetKind};
pub use error::{Error, Result};
pub use params::{ModelConfig, ParamRole, Parameter, ParameterState, PoiSpec};
pub use traits::StatModel;
pub use types::{CovarianceQuality, FitResult, FitStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
