//! This module defines the error type shared by the Krylov solvers and the
//! effective-operator entry points.
//!
//! Only recoverable numerical failures of the small dense kernels are reported
//! through [`KrylovError`]. Violated structural invariants (mismatched sector
//! layouts, missing diagonals, arena misuse) are programming errors and abort
//! with a panic instead. Non-convergence is never an error: solvers return their
//! best estimate together with the iteration count.
//!
//! Note that [`faer::linalg::evd::EvdError`] does not implement the standard
//! [`std::error::Error`] trait, so it is wrapped manually.
use thiserror::Error;

/// Represents all recoverable errors raised by the solvers.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct KrylovError(#[from] KrylovErrorKind);

/// Private enum containing the distinct kinds of errors.
#[derive(Error, Debug, PartialEq)]
pub(crate) enum KrylovErrorKind {
    /// Two vectors (or an operator and a vector) passed to a solver disagree in size.
    #[error("Dimension mismatch: operator acts on {expected} entries but vector has {found}.")]
    DimensionMismatch { expected: usize, found: usize },

    /// The projected system of a deflation or subspace step could not be solved.
    #[error("Projected {dim}x{dim} system is singular: {reason}")]
    SingularProjection { dim: usize, reason: String },

    /// Indicates that an invalid input parameter was provided to a function.
    #[error("Invalid input parameter: {0}")]
    InputError(String),

    /// Wraps an error originating from [`faer`]'s eigendecomposition module.
    #[error("A numerical error occurred during a subspace eigendecomposition: {0:?}")]
    EvdError(faer::linalg::evd::EvdError),
}

impl PartialEq for KrylovError {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl KrylovError {
    pub(crate) fn input(message: impl Into<String>) -> Self {
        KrylovErrorKind::InputError(message.into()).into()
    }

    pub(crate) fn evd(error: faer::linalg::evd::EvdError) -> Self {
        KrylovErrorKind::EvdError(error).into()
    }
}

pub(crate) fn check_len(expected: usize, found: usize) -> Result<(), KrylovError> {
    if expected != found {
        return Err(KrylovErrorKind::DimensionMismatch { expected, found }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_mismatch_error_message() {
        let error = KrylovError(KrylovErrorKind::DimensionMismatch {
            expected: 100,
            found: 99,
        });
        assert_eq!(
            error.to_string(),
            "Dimension mismatch: operator acts on 100 entries but vector has 99."
        );
    }

    #[test]
    fn test_singular_projection_message() {
        let error = KrylovError(KrylovErrorKind::SingularProjection {
            dim: 3,
            reason: "zero pivot".to_string(),
        });
        assert_eq!(error.to_string(), "Projected 3x3 system is singular: zero pivot");
    }

    #[test]
    fn test_input_error_message() {
        let error = KrylovError::input("eta must be positive");
        assert_eq!(
            error.to_string(),
            "Invalid input parameter: eta must be positive"
        );
    }

    #[test]
    fn test_evd_error_message() {
        let error = KrylovError::evd(faer::linalg::evd::EvdError::NoConvergence);
        assert_eq!(
            error.to_string(),
            "A numerical error occurred during a subspace eigendecomposition: NoConvergence"
        );
    }

    #[test]
    fn test_check_len() {
        assert!(check_len(4, 4).is_ok());
        assert_eq!(
            check_len(4, 3),
            Err(KrylovError(KrylovErrorKind::DimensionMismatch {
                expected: 4,
                found: 3
            }))
        );
    }
}
