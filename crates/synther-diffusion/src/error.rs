//! Error types for the diffusion core

use std::fmt;

use thiserror::Error;

/// Reason an adaptive ODE solve was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationFailure {
    /// The state or its error estimate became NaN or infinite
    NonFinite,
    /// The step size shrank below what the current sigma can resolve
    StepUnderflow,
}

impl fmt::Display for IntegrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrationFailure::NonFinite => write!(f, "non-finite state or error estimate"),
            IntegrationFailure::StepUnderflow => write!(f, "step size underflow"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DiffusionError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("ODE integration failed at step {step} (sigma = {sigma}): {reason} after {fevals} function evaluations")]
    Integration {
        step: usize,
        sigma: f64,
        fevals: usize,
        reason: IntegrationFailure,
    },

    #[error("ODE evaluation budget exceeded: {fevals} function evaluations (limit {limit})")]
    EvaluationBudget { fevals: usize, limit: usize },

    #[error("Tensor data error: {0}")]
    TensorData(String),
}

impl DiffusionError {
    /// Whether this error came from the ODE solver rather than from
    /// shapes, configuration or data transfer
    pub fn is_integration(&self) -> bool {
        matches!(
            self,
            DiffusionError::Integration { .. } | DiffusionError::EvaluationBudget { .. }
        )
    }

    /// Function evaluations performed before an ODE failure
    pub fn fevals(&self) -> Option<usize> {
        match self {
            DiffusionError::Integration { fevals, .. }
            | DiffusionError::EvaluationBudget { fevals, .. } => Some(*fevals),
            _ => None,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        DiffusionError::InvalidConfig(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, DiffusionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integration_errors_carry_fevals() {
        let err = DiffusionError::Integration {
            step: 7,
            sigma: 0.5,
            fevals: 43,
            reason: IntegrationFailure::NonFinite,
        };
        assert!(err.is_integration());
        assert_eq!(err.fevals(), Some(43));
        assert!(err.to_string().contains("step 7"));

        let budget = DiffusionError::EvaluationBudget { fevals: 100, limit: 100 };
        assert!(budget.is_integration());
        assert_eq!(budget.fevals(), Some(100));
    }

    #[test]
    fn test_shape_error_is_not_integration() {
        let err = DiffusionError::ShapeMismatch {
            expected: vec![2, 4],
            actual: vec![2, 5],
        };
        assert!(!err.is_integration());
        assert_eq!(err.fevals(), None);
        assert!(err.to_string().contains("[2, 4]"));
    }
}
