//! This module defines the core abstraction for linear operators.
//!
//! None of the Krylov solvers in this crate look at individual matrix
//! elements. Their only access to the operator is the matrix-vector product,
//! so they are written against the [`LinearOperator`] trait and work equally
//! with a small dense test matrix and with an effective Hamiltonian whose
//! action is a sum of block tensor contractions.
//!
//! Operators act on flat slices and accumulate: `apply` computes
//! `output += A · input`. The receiver is `&mut self` because applying an
//! effective operator updates its flop counter and scratch buffers.

use crate::vector::{self, Field};
use faer::{Accum, Mat, MatMut, MatRef, Par, linalg::matmul::matmul, traits::ComplexField};

/// Represents a square linear operator acting on flat vectors.
///
/// # Example
///
/// ```
/// use faer::mat;
/// use heff_krylov::matrix::LinearOperator;
///
/// let mut a = mat![[2.0_f64, 1.0], [1.0, 3.0]];
/// let mut y = vec![1.0, 0.0];
/// a.apply(&[1.0, 1.0], &mut y);
/// assert_eq!(y, vec![4.0, 4.0]);
/// ```
pub trait LinearOperator<T: ComplexField> {
    /// Returns the number of rows of the operator.
    fn nrows(&self) -> usize;

    /// Returns the number of columns of the operator.
    fn ncols(&self) -> usize;

    /// Accumulates `A · input` into `output`.
    ///
    /// # Panics
    ///
    /// Implementations panic if `input` does not have `ncols()` entries or
    /// `output` does not have `nrows()` entries.
    fn apply(&mut self, input: &[T], output: &mut [T]);
}

fn check_dims(nrows: usize, ncols: usize, input: usize, output: usize) {
    assert_eq!(
        ncols, input,
        "Dimension mismatch: operator columns ({ncols}) do not match vector rows ({input})."
    );
    assert_eq!(
        nrows, output,
        "Dimension mismatch: operator rows ({nrows}) do not match output rows ({output})."
    );
}

impl<T: ComplexField> LinearOperator<T> for MatRef<'_, T> {
    #[inline]
    fn nrows(&self) -> usize {
        MatRef::nrows(self)
    }

    #[inline]
    fn ncols(&self) -> usize {
        MatRef::ncols(self)
    }

    fn apply(&mut self, input: &[T], output: &mut [T]) {
        let (m, n) = (MatRef::nrows(self), MatRef::ncols(self));
        check_dims(m, n, input.len(), output.len());
        let x = MatRef::from_column_major_slice(input, n, 1);
        let y = MatMut::from_column_major_slice_mut(output, m, 1);
        matmul(y, Accum::Add, *self, x, T::one_impl(), Par::Seq);
    }
}

impl<T: ComplexField> LinearOperator<T> for Mat<T> {
    #[inline]
    fn nrows(&self) -> usize {
        Mat::nrows(self)
    }

    #[inline]
    fn ncols(&self) -> usize {
        Mat::ncols(self)
    }

    fn apply(&mut self, input: &[T], output: &mut [T]) {
        let mut view = Mat::as_ref(self);
        LinearOperator::apply(&mut view, input, output);
    }
}

/// Operator defined by a closure accumulating `A · input` into `output`.
pub struct FnOperator<F> {
    dim: usize,
    f: F,
}

impl<F> FnOperator<F> {
    pub fn new(dim: usize, f: F) -> Self {
        Self { dim, f }
    }
}

impl<T: ComplexField, F: FnMut(&[T], &mut [T])> LinearOperator<T> for FnOperator<F> {
    fn nrows(&self) -> usize {
        self.dim
    }

    fn ncols(&self) -> usize {
        self.dim
    }

    fn apply(&mut self, input: &[T], output: &mut [T]) {
        check_dims(self.dim, self.dim, input.len(), output.len());
        (self.f)(input, output)
    }
}

/// `A + shift · I`
pub struct Shifted<'a, T: Field, O: ?Sized> {
    pub inner: &'a mut O,
    pub shift: T,
}

impl<T: Field, O: LinearOperator<T> + ?Sized> LinearOperator<T> for Shifted<'_, T, O> {
    fn nrows(&self) -> usize {
        self.inner.nrows()
    }

    fn ncols(&self) -> usize {
        self.inner.ncols()
    }

    fn apply(&mut self, input: &[T], output: &mut [T]) {
        self.inner.apply(input, output);
        vector::axpy(self.shift, input, output);
    }
}

/// `(A + shift)² + eta² · I`, the positive-definite operator whose inverse
/// yields the imaginary part of a Green's function.
///
/// The intermediate `(A + shift) · input` lives in a caller-provided buffer.
pub struct ShiftedSquare<'a, O: ?Sized> {
    inner: &'a mut O,
    shift: f64,
    eta: f64,
    tmp: &'a mut [f64],
}

impl<'a, O: LinearOperator<f64> + ?Sized> ShiftedSquare<'a, O> {
    pub fn new(inner: &'a mut O, shift: f64, eta: f64, tmp: &'a mut [f64]) -> Self {
        assert_eq!(tmp.len(), inner.nrows(), "shifted-square scratch has the wrong length");
        Self {
            inner,
            shift,
            eta,
            tmp,
        }
    }
}

impl<O: LinearOperator<f64> + ?Sized> LinearOperator<f64> for ShiftedSquare<'_, O> {
    fn nrows(&self) -> usize {
        self.inner.nrows()
    }

    fn ncols(&self) -> usize {
        self.inner.ncols()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        vector::clear(self.tmp);
        self.inner.apply(input, self.tmp);
        vector::axpy(self.shift, input, self.tmp);
        self.inner.apply(self.tmp, output);
        vector::axpy(self.shift, self.tmp, output);
        vector::axpy(self.eta * self.eta, input, output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    #[test]
    fn test_linear_operator_for_mat() {
        let mut matrix: Mat<f64> = mat![[2.0, -1.0, 0.0], [-1.0, 2.0, -1.0], [0.0, -1.0, 2.0],];
        let mut out = vec![1.0, 1.0, 1.0];
        matrix.apply(&[1.0, 2.0, 3.0], &mut out);
        assert_eq!(out, vec![1.0, 1.0, 5.0]);

        let operator: &mut dyn LinearOperator<f64> = &mut matrix;
        assert_eq!(operator.nrows(), 3);
        assert_eq!(operator.ncols(), 3);
    }

    #[test]
    fn test_shifted_and_squared() {
        let mut a: Mat<f64> = mat![[1.0, 0.0], [0.0, -2.0]];
        let mut out = vec![0.0; 2];
        Shifted {
            inner: &mut a,
            shift: 0.5,
        }
        .apply(&[1.0, 1.0], &mut out);
        assert_eq!(out, vec![1.5, -1.5]);

        let mut out = vec![0.0; 2];
        let mut tmp = vec![7.0; 2];
        ShiftedSquare::new(&mut a, 0.5, 2.0, &mut tmp).apply(&[1.0, 1.0], &mut out);
        assert_eq!(out, vec![1.5 * 1.5 + 4.0, 1.5 * 1.5 + 4.0]);
    }

    #[test]
    fn test_fn_operator_complex() {
        use faer::c64;
        let i = c64::new(0.0, 1.0);
        let mut op = FnOperator::new(1, |x: &[c64], y: &mut [c64]| y[0] += i * x[0]);
        let mut out = vec![c64::new(1.0, 0.0)];
        op.apply(&[c64::new(2.0, 0.0)], &mut out);
        assert_eq!(out[0], c64::new(1.0, 2.0));

        let mut dense = faer::mat![[c64::new(0.0, 1.0)]];
        let mut out = vec![c64::new(0.0, 0.0)];
        dense.apply(&[c64::new(3.0, 0.0)], &mut out);
        assert_eq!(out[0], c64::new(0.0, 3.0));
    }

    #[test]
    #[should_panic(
        expected = "Dimension mismatch: operator columns (2) do not match vector rows (3)."
    )]
    fn test_dimension_mismatch_panic() {
        let mut matrix: Mat<f64> = mat![[1.0, 0.0], [0.0, 1.0]];
        let mut out = vec![0.0; 2];
        matrix.apply(&[1.0, 2.0, 3.0], &mut out);
    }
}
