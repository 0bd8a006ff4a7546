//! Error types for quickcls

use thiserror::Error;

/// quickcls error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Missing or contradictory run options. Raised before any fit is attempted.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Model structure is unusable (missing parameter subsets, malformed ranges).
    #[error("Model validation error: {0}")]
    ModelValidation(String),

    /// Invalid argument to an operation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// The run-wide budget of non-converged fits was exceeded.
    #[error("Fit failure budget exhausted: {failed} failed fits (budget {budget})")]
    FitBudgetExhausted {
        /// Failed fits recorded so far.
        failed: usize,
        /// Configured budget.
        budget: usize,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
