//! Iterative ensemble smoother: subspace update engine, persistent analysis
//! state and the dense linear algebra backing both.

pub mod config;
pub mod data;
pub mod linalg;
pub mod mask;
pub mod textio;
pub mod update;

use thiserror::Error;

pub use config::{IesConfig, Inversion};
pub use data::IesData;
pub use mask::ActiveMask;
pub use update::{initial_transition, make_transition, sample_perturbations, update_ensemble};

#[derive(Debug, Error)]
pub enum IesError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Realizations may not vanish or appear once assimilation has started.
    #[error("mask inconsistency: {0}")]
    MaskInconsistency(String),
    #[error("matrix geometry mismatch: {0}")]
    ShapeMismatch(String),
    #[error("observation {index} has non-positive error variance {variance}")]
    InvalidObservationVariance { index: usize, variance: f64 },
    #[error("smoother state not initialized: {0}")]
    NotInitialized(&'static str),
    #[error(transparent)]
    Linalg(#[from] linalg::LinalgError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
