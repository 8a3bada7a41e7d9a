//! Error taxonomy for the registration core.
//!
//! Every variant is recoverable: point-count and geometry errors ask the caller
//! for better input, fit failures skip a single item.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("insufficient points: need at least {required}, got {got}")]
    InsufficientPoints { required: usize, got: usize },

    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("transform is not invertible (determinant {determinant:e})")]
    SingularTransform { determinant: f64 },

    /// `peak` is `None` when the population reference fit failed.
    #[error("curve fit did not converge for {}: {reason}", describe_fit(.peak))]
    FitConvergence { peak: Option<usize>, reason: String },

    #[error("point ({x:.1}, {y:.1}) cannot be assigned to a unique tile (candidates {candidates:?})")]
    IndexAmbiguity {
        x: f64,
        y: f64,
        candidates: Vec<usize>,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

fn describe_fit(peak: &Option<usize>) -> String {
    match peak {
        Some(index) => format!("peak {index}"),
        None => "the reference profile".to_string(),
    }
}

impl RegistrationError {
    pub(crate) fn insufficient(required: usize, got: usize) -> Self {
        Self::InsufficientPoints { required, got }
    }
}
