//! Error types for the filtering and smoothing engine.

use thiserror::Error;

/// Errors raised by the particle filter, the smoother and the estimator front end.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SmcError {
    /// Caller error: bad particle/trajectory counts, malformed history, dimension mismatch.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Every filter log-weight at `step` was `-inf` or NaN.
    #[error("degenerate filter weights at step {step}: no particle has finite likelihood")]
    DegenerateWeights { step: usize },

    /// Every backward-simulation log-weight was `-inf` or NaN for one trajectory at `step`.
    #[error(
        "degenerate smoothing weights at step {step} for trajectory {trajectory}: \
         no candidate has finite transition density"
    )]
    DegenerateSmoothingWeights { step: usize, trajectory: usize },

    /// An estimator accessor was called before `simulate`.
    #[error("no results available: {0}")]
    NotRun(&'static str),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SmcError>;

impl SmcError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        SmcError::InvalidConfiguration(message.into())
    }
    /// Degenerate-weight errors may be recovered from with [`crate::DegeneracyPolicy::UniformFallback`].
    pub fn is_degenerate(&self) -> bool {
        matches!(
            self,
            SmcError::DegenerateWeights { .. } | SmcError::DegenerateSmoothingWeights { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SmcError::DegenerateWeights { step: 3 };
        assert!(err.to_string().contains("step 3"));
        let err = SmcError::DegenerateSmoothingWeights {
            step: 1,
            trajectory: 7,
        };
        assert!(err.to_string().contains("trajectory 7"));
        let err = SmcError::config("num_particles must be at least 1");
        assert_eq!(
            err.to_string(),
            "invalid configuration: num_particles must be at least 1"
        );
    }

    #[test]
    fn test_is_degenerate() {
        assert!(SmcError::DegenerateWeights { step: 0 }.is_degenerate());
        assert!(
            SmcError::DegenerateSmoothingWeights {
                step: 0,
                trajectory: 0
            }
            .is_degenerate()
        );
        assert!(!SmcError::config("bad").is_degenerate());
        assert!(!SmcError::NotRun("filter").is_degenerate());
    }
}
