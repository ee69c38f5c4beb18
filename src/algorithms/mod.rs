//! Krylov-subspace solvers operating on [`crate::matrix::LinearOperator`]s.
//!
//! All solvers take an [`IterativeOptions`] and a [`Reduction`], which sums
//! every inner product across processes when a communicator is present. None of
//! them treats non-convergence as an error: they return the best estimate and
//! the number of iterations used, with a `converged` flag.
//!
//! Search spaces are kept as the leading columns of a faer matrix allocated
//! once per call at its final capacity ([`KrylovBasis`]), so projections and
//! recombinations are dense matrix products.

pub mod conjugate_gradient;
pub mod davidson;
pub mod expo;
pub mod gcrotmk;
pub mod lanczos;
pub mod minres;

use crate::error::{KrylovError, KrylovErrorKind};
use crate::matrix::LinearOperator;
use crate::vector::{self, Field, Reduction, col};
use faer::{Mat, MatRef, Side, prelude::*};
use serde::{Deserialize, Serialize};

/// Convergence and subspace-size settings shared by the iterative solvers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterativeOptions {
    /// Residual-norm threshold.
    /// Default: 5e-6
    pub conv_thrd: f64,

    /// Hard cap on iterations.
    /// Default: 5000
    pub max_iter: usize,

    /// Optional earlier stop; reaching it is silent and non-fatal.
    pub soft_max_iter: Option<usize>,

    /// Subspace vectors kept when a Davidson subspace is collapsed.
    /// Default: 2
    pub deflation_min_size: usize,

    /// Subspace size that triggers a collapse.
    /// Default: 50
    pub deflation_max_size: usize,
}

impl Default for IterativeOptions {
    fn default() -> Self {
        Self {
            conv_thrd: 5e-6,
            max_iter: 5000,
            soft_max_iter: None,
            deflation_min_size: 2,
            deflation_max_size: 50,
        }
    }
}

impl IterativeOptions {
    pub fn with_conv_thrd(mut self, conv_thrd: f64) -> Self {
        self.conv_thrd = conv_thrd;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_soft_max_iter(mut self, soft_max_iter: usize) -> Self {
        self.soft_max_iter = Some(soft_max_iter);
        self
    }

    /// Whether iteration `iter` (1-based, already performed) exhausts a budget.
    /// Logs which budget was hit.
    pub(crate) fn exhausted(&self, iter: usize, solver: &str) -> bool {
        if self.soft_max_iter.is_some_and(|soft| iter >= soft) {
            log::debug!("{solver}: soft iteration budget of {iter} reached");
            return true;
        }
        if iter >= self.max_iter {
            log::warn!("{solver}: not converged after {iter} iterations");
            return true;
        }
        false
    }
}

/// Result of an iterative solve.
#[derive(Debug, Clone, PartialEq)]
pub struct KrylovOutcome<V> {
    pub value: V,
    pub iterations: usize,
    pub converged: bool,
}

/// Eigendecomposition of a small symmetric matrix, eigenvalues ascending.
pub(crate) fn symmetric_eigen(a: MatRef<'_, f64>) -> Result<(Vec<f64>, Mat<f64>), KrylovError> {
    let evd = a
        .self_adjoint_eigen(Side::Lower)
        .map_err(KrylovError::evd)?;
    let s = evd.S();
    let values = (0..a.nrows()).map(|i| s[i]).collect();
    Ok((values, evd.U().to_owned()))
}

/// Solves a small dense system through an LU factorization with partial pivoting.
pub(crate) fn dense_solve(a: &Mat<f64>, b: &Mat<f64>) -> Result<Mat<f64>, KrylovError> {
    let x = a.partial_piv_lu().solve(b);
    let finite = (0..x.nrows()).all(|i| (0..x.ncols()).all(|j| x[(i, j)].is_finite()));
    if !finite {
        return Err(KrylovErrorKind::SingularProjection {
            dim: a.nrows(),
            reason: "LU solve produced non-finite entries".to_string(),
        }
        .into());
    }
    Ok(x)
}

/// Vectors stored as the leading columns of a preallocated matrix.
#[derive(Debug, Clone)]
pub struct KrylovBasis<T: Field> {
    cols: Mat<T>,
    len: usize,
}

impl<T: Field> KrylovBasis<T> {
    /// Room for `capacity` vectors of length `n`.
    pub fn new(n: usize, capacity: usize) -> Self {
        Self {
            cols: Mat::zeros(n, capacity),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.cols.ncols()
    }

    pub fn col(&self, j: usize) -> &[T] {
        assert!(j < self.len, "basis vector {j} out of {}", self.len);
        self.cols.col_as_slice(j)
    }

    pub fn col_mut(&mut self, j: usize) -> &mut [T] {
        assert!(j < self.len, "basis vector {j} out of {}", self.len);
        self.cols.col_as_slice_mut(j)
    }

    /// The stored vectors as an `n × len` view.
    pub fn as_ref(&self) -> MatRef<'_, T> {
        self.cols.as_ref().get(.., 0..self.len)
    }

    /// Appends a copy of `v`.
    ///
    /// # Panics
    /// If the basis is full.
    pub fn push(&mut self, v: &[T]) {
        let j = self.push_zeroed_index();
        self.cols.col_mut(j).copy_from(col(v));
    }

    /// Appends a zero vector and returns it.
    pub fn push_zeroed(&mut self) -> &mut [T] {
        let j = self.push_zeroed_index();
        let v = self.cols.col_as_slice_mut(j);
        vector::clear(v);
        v
    }

    fn push_zeroed_index(&mut self) -> usize {
        assert!(self.len < self.capacity(), "Krylov basis is full at {} vectors", self.len);
        self.len += 1;
        self.len - 1
    }

    /// Drops the oldest vector, shifting the others down.
    pub fn remove_first(&mut self) {
        for j in 1..self.len {
            let (mut head, tail) = self.cols.as_mut().split_at_col_mut(j);
            head.col_mut(j - 1).copy_from(tail.as_ref().col(0));
        }
        self.len = self.len.saturating_sub(1);
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// `out += alpha · Σ_j y_j v_j` over the first `y.len()` vectors.
    pub fn accumulate(&self, y: &[T], alpha: T, out: &mut [T]) {
        assert!(y.len() <= self.len, "more coefficients than basis vectors");
        vector::gemv(out, self.cols.as_ref().get(.., 0..y.len()), y, alpha);
    }
}

/// Removes the components of `v` along the orthonormal `basis` (two passes)
/// and returns the remaining norm.
pub(crate) fn orthogonalize<T: Field>(v: &mut [T], basis: &KrylovBasis<T>, reduction: Reduction<'_>) -> f64 {
    for _ in 0..2 {
        for j in 0..basis.len() {
            let q = basis.col(j);
            let c = reduction.dot(q, v);
            vector::axpy(-c, q, v);
        }
    }
    reduction.norm(v)
}

/// `(a + aᵀ) / 2`
fn symmetrized(a: Mat<f64>) -> Mat<f64> {
    let m = a.nrows();
    Mat::from_fn(m, m, |i, j| 0.5 * (a[(i, j)] + a[(j, i)]))
}

/// An orthonormal search space together with the operator images of its vectors.
#[derive(Debug, Clone)]
pub(crate) struct Subspace {
    pub basis: KrylovBasis<f64>,
    pub images: KrylovBasis<f64>,
}

impl Subspace {
    pub fn new(n: usize, capacity: usize) -> Self {
        Self {
            basis: KrylovBasis::new(n, capacity),
            images: KrylovBasis::new(n, capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.basis.len()
    }

    /// Orthonormalizes `v` against the space and, if it survives, appends it
    /// with its image. Returns whether the space grew; `v` is overwritten
    /// either way.
    pub fn extend<O: LinearOperator<f64> + ?Sized>(
        &mut self,
        op: &mut O,
        v: &mut [f64],
        reduction: Reduction<'_>,
    ) -> bool {
        let before = reduction.norm(v);
        let after = orthogonalize(v, &self.basis, reduction);
        if before == 0.0 || after <= 1e-10 * before || after < 1e-14 {
            return false;
        }
        vector::scale(1.0 / after, v);
        self.basis.push(v);
        op.apply(v, self.images.push_zeroed());
        true
    }

    /// `(Σ y_j b_j, Σ y_j A b_j)` for column `col` of `y`.
    pub fn combine(&self, y: MatRef<'_, f64>, col: usize) -> (Vec<f64>, Vec<f64>) {
        let m = self.len();
        let coeffs: Vec<f64> = (0..m).map(|j| y[(j, col)]).collect();
        let n = self.basis.as_ref().nrows();
        let mut x = vec![0.0; n];
        let mut ax = vec![0.0; n];
        self.basis.accumulate(&coeffs, 1.0, &mut x);
        self.images.accumulate(&coeffs, 1.0, &mut ax);
        (x, ax)
    }

    /// `Vᵀ A V`, symmetrized.
    pub fn projection(&self, reduction: Reduction<'_>) -> Mat<f64> {
        symmetrized(reduction.gram(self.basis.as_ref(), self.images.as_ref()))
    }

    /// Replaces the space by the given (linearly independent) vectors and
    /// images, re-orthonormalizing both with the same transformation.
    pub fn reset(&mut self, pairs: Vec<(Vec<f64>, Vec<f64>)>, reduction: Reduction<'_>) {
        self.basis.clear();
        self.images.clear();
        for (mut x, mut ax) in pairs {
            for _ in 0..2 {
                for j in 0..self.basis.len() {
                    let (q, aq) = (self.basis.col(j), self.images.col(j));
                    let c = reduction.dot(q, &x);
                    vector::axpy(-c, q, &mut x);
                    vector::axpy(-c, aq, &mut ax);
                }
            }
            let nrm = reduction.norm(&x);
            if nrm < 1e-14 {
                continue;
            }
            vector::scale(1.0 / nrm, &mut x);
            vector::scale(1.0 / nrm, &mut ax);
            self.basis.push(&x);
            self.images.push(&ax);
        }
    }
}
