//! Symmetric Lanczos tridiagonalization.
//!
//! Builds an orthonormal basis `V_k` of the Krylov subspace
//! `K_k(A, b) = span{b, Ab, ..., A^{k-1} b}` together with the tridiagonal
//! projection `T_k = V_kᵀ A V_k`. The basis is stored, and every new vector is
//! reorthogonalized against all previous ones, since `k` stays small in the
//! exponential propagator that uses this module.

use super::{KrylovBasis, symmetric_eigen};
use crate::error::{KrylovError, check_len};
use crate::matrix::LinearOperator;
use crate::vector::{self, Reduction};
use faer::Mat;

/// Relative size of `β_j` below which the Krylov subspace is taken to be
/// invariant under `A`.
pub fn breakdown_tolerance() -> f64 {
    f64::EPSILON.sqrt() * 1e-4
}

/// Scalar coefficients of the tridiagonal matrix `T_k`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LanczosDecomposition {
    /// Diagonal entries `α_1, ..., α_k`.
    pub alphas: Vec<f64>,
    /// `β_1, ..., β_k`; `β_j` couples `v_j` and `v_{j+1}`, so the last entry is
    /// the norm of the residual leaving the subspace.
    pub betas: Vec<f64>,
}

impl LanczosDecomposition {
    pub fn steps(&self) -> usize {
        self.alphas.len()
    }

    /// Dense `T_k` (the trailing `β_k` is not part of it).
    pub fn tridiagonal(&self) -> Mat<f64> {
        let k = self.steps();
        Mat::from_fn(k, k, |i, j| {
            if i == j {
                self.alphas[i]
            } else if i.abs_diff(j) == 1 {
                self.betas[i.min(j)]
            } else {
                0.0
            }
        })
    }

    /// `exp(t T_k) e_1`, through the eigendecomposition of `T_k`.
    pub fn exp_e1(&self, t: f64) -> Result<Vec<f64>, KrylovError> {
        let k = self.steps();
        if k == 0 {
            return Ok(Vec::new());
        }
        let (lambda, q) = symmetric_eigen(self.tridiagonal().as_ref())?;
        Ok((0..k)
            .map(|i| {
                (0..k)
                    .map(|j| q[(i, j)] * (t * lambda[j]).exp() * q[(0, j)])
                    .sum()
            })
            .collect())
    }
}

/// Output of [`lanczos_standard`].
#[derive(Debug, Clone)]
pub struct LanczosOutput {
    /// Orthonormal basis vectors `v_1, ..., v_k` as columns.
    pub basis: KrylovBasis<f64>,
    pub decomposition: LanczosDecomposition,
    /// `‖b‖`.
    pub b_norm: f64,
    /// Whether the iteration stopped because the subspace became invariant.
    pub invariant: bool,
}

/// Runs up to `k` Lanczos steps from `b`.
///
/// # Returns
/// The basis and tridiagonal coefficients. Stops early, with `invariant` set,
/// when `β_j ≤ breakdown_tolerance() · ‖A v_j‖`.
pub fn lanczos_standard<O: LinearOperator<f64> + ?Sized>(
    op: &mut O,
    b: &[f64],
    k: usize,
    reduction: Reduction<'_>,
) -> Result<LanczosOutput, KrylovError> {
    check_len(op.ncols(), b.len())?;
    let b_norm = reduction.norm(b);
    if b_norm == 0.0 {
        return Err(KrylovError::input("Lanczos starting vector is zero"));
    }
    if k == 0 {
        return Err(KrylovError::input("Lanczos needs at least one step"));
    }

    let mut basis = KrylovBasis::new(b.len(), k);
    basis.push(b);
    vector::scale(1.0 / b_norm, basis.col_mut(0));
    let mut decomposition = LanczosDecomposition::default();
    let mut invariant = false;

    for j in 0..k {
        let mut w = vec![0.0; b.len()];
        op.apply(basis.col(j), &mut w);
        let scale = reduction.norm(&w);
        let alpha = reduction.dot(basis.col(j), &w);
        vector::axpy(-alpha, basis.col(j), &mut w);
        if j > 0 {
            vector::axpy(-decomposition.betas[j - 1], basis.col(j - 1), &mut w);
        }
        // Full reorthogonalization.
        for i in 0..basis.len() {
            let q = basis.col(i);
            let c = reduction.dot(q, &w);
            vector::axpy(-c, q, &mut w);
        }
        let beta = reduction.norm(&w);
        decomposition.alphas.push(alpha);
        decomposition.betas.push(beta);

        if beta <= breakdown_tolerance() * scale.max(f64::MIN_POSITIVE) {
            invariant = true;
            break;
        }
        if j + 1 < k {
            vector::scale(1.0 / beta, &mut w);
            basis.push(&w);
        }
    }

    Ok(LanczosOutput {
        basis,
        decomposition,
        b_norm,
        invariant,
    })
}
