//! # qcls-inference
//!
//! Asymptotic CLs upper limits for quickcls.
//!
//! This crate provides:
//! - A retrying minimizer over any [`qcls_core::StatModel`]
//! - Asimov dataset construction
//! - The `q_mu` / `q̃_mu` test statistics and their asymptotic p-values
//! - A precision-controlled crossing search along the POI
//! - Median, ±1σ and ±2σ expected limits and the observed limit
//!
//! ## Architecture
//!
//! The engine depends on the `StatModel` trait from qcls-core, never on a
//! concrete likelihood. All mutable fit state is a `ParameterState` value, so
//! independent scans run in parallel on clones.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Asimov pseudo-data.
pub mod asimov;
/// Closed-form asymptotic p-values and CLs.
pub mod asymptotics;
/// Expected-limit bands.
pub mod bands;
/// Run configuration.
pub mod config;
/// Limit run entry point.
pub mod limits;
/// Retrying minimizer.
pub mod minimizer;
/// Generic numerical optimizer (L-BFGS-B backend).
pub mod optimizer;
/// Profile likelihood of a dataset.
pub mod profile;
/// Persisted results.
pub mod record;
/// Crossing search along the POI.
pub mod scanner;
/// One-sided test statistics.
pub mod test_statistic;

pub use asimov::{AsimovBuilder, AsimovData};
pub use asymptotics::{AsymptoticPValues, NSIGMA_ORDER};
pub use bands::{BandComputer, BandOptions, LimitEstimate};
pub use config::LimitConfig;
pub use limits::{AsymptoticLimitTool, BandLimit, LimitResult, PoiFit, RunPhase, prepare_model};
pub use minimizer::{FailureBudget, MinimizerConfig, RetryLadder, RobustMinimizer};
pub use optimizer::{LbfgsbOptimizer, MinimizerBackend, ObjectiveFunction, OptimizationResult, OptimizerConfig};
pub use profile::{HypothesisTester, ProfiledData};
pub use record::LimitRecord;
pub use scanner::{Crossing, Direction, LimitPoint, LimitScanner, LimitStatus, ScanValue};
pub use test_statistic::TestStatistic;
