//! Vector kernels used by the Krylov solvers.
//!
//! Sector-blocked vectors reach the solvers as their flat storage. The kernels
//! view that storage as faer columns ([`ColRef`], [`ColMut`]) and run faer's
//! inner-product, norm and elementwise kernels on it. [`Reduction`] wraps the
//! optional reduction collaborator: with a communicator present, every inner
//! product is accumulated over the entries owned by this process and then
//! summed across processes.

use crate::comm::Communicator;
use faer::traits::ComplexField;
use faer::{Accum, ColMut, ColRef, Mat, MatMut, MatRef, Par, c64, linalg::matmul::matmul, unzip, zip};
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// Fields the solvers run in: faer's `f64` and `c64`.
///
/// Everything beyond plain arithmetic (conjugation, moduli, real and
/// imaginary parts) comes from [`ComplexField`].
pub trait Field:
    ComplexField<Real = f64>
    + Copy
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + Send
    + Sync
{
    /// `re + i·im`; real fields drop `im`.
    fn from_parts(re: f64, im: f64) -> Self;
}

impl Field for f64 {
    #[inline]
    fn from_parts(re: f64, _im: f64) -> Self {
        re
    }
}

impl Field for c64 {
    #[inline]
    fn from_parts(re: f64, im: f64) -> Self {
        c64::new(re, im)
    }
}

#[inline]
pub fn col<T>(v: &[T]) -> ColRef<'_, T> {
    ColRef::from_slice(v)
}

#[inline]
pub fn col_mut<T>(v: &mut [T]) -> ColMut<'_, T> {
    ColMut::from_slice_mut(v)
}

/// `Σ conj(a_i) b_i`
pub fn dot<T: Field>(a: &[T], b: &[T]) -> T {
    assert_eq!(a.len(), b.len(), "dot product of vectors of different length");
    col(a).adjoint() * col(b)
}

pub fn norm<T: Field>(a: &[T]) -> f64 {
    col(a).norm_l2()
}

/// `y += alpha * x`
pub fn axpy<T: Field>(alpha: T, x: &[T], y: &mut [T]) {
    assert_eq!(x.len(), y.len(), "axpy on vectors of different length");
    zip!(col_mut(y), col(x)).for_each(|unzip!(y, x)| *y += alpha * *x);
}

pub fn scale<T: Field>(alpha: T, x: &mut [T]) {
    zip!(col_mut(x)).for_each(|unzip!(x)| *x = alpha * *x);
}

pub fn clear<T: Field>(x: &mut [T]) {
    zip!(col_mut(x)).for_each(|unzip!(x)| *x = T::zero_impl());
}

/// `out += alpha · a · y` for the column `y` of length `a.ncols()`.
pub fn gemv<T: Field>(out: &mut [T], a: MatRef<'_, T>, y: &[T], alpha: T) {
    assert_eq!(a.ncols(), y.len(), "gemv coefficients do not match the matrix");
    let n = out.len();
    let y = MatRef::from_column_major_slice(y, y.len(), 1);
    matmul(MatMut::from_column_major_slice_mut(out, n, 1), Accum::Add, a, y, alpha, Par::Seq);
}

/// Inner products and norms, optionally summed across processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reduction<'a> {
    comm: Option<&'a dyn Communicator>,
}

impl<'a> Reduction<'a> {
    pub fn new(comm: Option<&'a dyn Communicator>) -> Self {
        Self { comm }
    }

    pub fn local() -> Self {
        Self { comm: None }
    }

    pub fn comm(&self) -> Option<&'a dyn Communicator> {
        self.comm
    }

    pub fn dot<T: Field>(&self, a: &[T], b: &[T]) -> T {
        match self.comm {
            None => dot(a, b),
            Some(comm) => {
                assert_eq!(a.len(), b.len(), "dot product of vectors of different length");
                let range = comm.owned_range(a.len());
                let partial = dot(&a[range.clone()], &b[range]);
                let mut buf = [T::real_part_impl(&partial), T::imag_part_impl(&partial)];
                comm.allreduce_sum(&mut buf);
                T::from_parts(buf[0], buf[1])
            }
        }
    }

    pub fn norm<T: Field>(&self, a: &[T]) -> f64 {
        match self.comm {
            None => norm(a),
            Some(_) => T::real_part_impl(&self.dot(a, a)).max(0.0).sqrt(),
        }
    }

    /// `aᵀ b` for real column blocks of equal height.
    pub fn gram(&self, a: MatRef<'_, f64>, b: MatRef<'_, f64>) -> Mat<f64> {
        assert_eq!(a.nrows(), b.nrows(), "gram matrix of blocks of different height");
        let Some(comm) = self.comm else {
            return a.transpose() * b;
        };
        let range = comm.owned_range(a.nrows());
        let local = a.get(range.clone(), ..).transpose() * b.get(range, ..);
        let (m, k) = (local.nrows(), local.ncols());
        let mut buf: Vec<f64> = (0..k).flat_map(|j| (0..m).map(move |i| (i, j))).map(|ij| local[ij]).collect();
        comm.allreduce_sum(&mut buf);
        Mat::from_fn(m, k, |i, j| buf[i + j * m])
    }

    /// Sums `buf` element-wise across processes. No-op without a communicator.
    pub fn allreduce(&self, buf: &mut [f64]) {
        if let Some(comm) = self.comm {
            comm.allreduce_sum(buf);
        }
    }

    /// Whether this process is the root (always true without a communicator).
    pub fn is_root(&self) -> bool {
        self.comm.is_none_or(|c| c.is_root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadCommunicator;
    use faer::mat;
    use std::thread;

    #[test]
    fn test_complex_dot_conjugates_left() {
        let a = [c64::new(0.0, 1.0)];
        let b = [c64::new(0.0, 1.0)];
        assert_eq!(dot(&a, &b), c64::new(1.0, 0.0));
        assert_eq!(c64::from_parts(2.0, 7.0), c64::new(2.0, 7.0));
        assert_eq!(f64::from_parts(2.0, 7.0), 2.0);
    }

    #[test]
    fn test_axpy_and_scale() {
        let x = [1.0, 2.0, 3.0];
        let mut y = [1.0, 1.0, 1.0];
        axpy(2.0, &x, &mut y);
        scale(0.5, &mut y);
        assert_eq!(y, [1.5, 2.5, 3.5]);
        clear(&mut y);
        assert_eq!(norm(&y), 0.0);
    }

    #[test]
    fn test_gemv_accumulates() {
        let a = mat![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let mut out = vec![1.0, 1.0, 1.0];
        gemv(&mut out, a.as_ref(), &[1.0, -1.0], 2.0);
        assert_eq!(out, vec![-1.0, -1.0, -1.0]);
    }

    #[test]
    fn test_distributed_dot_and_gram_match_serial() {
        let a: Vec<f64> = (0..11).map(|i| i as f64 * 0.5 - 1.0).collect();
        let b: Vec<f64> = (0..11).map(|i| (i as f64).sin()).collect();
        let expected = dot(&a, &b);
        let block = Mat::from_fn(11, 2, |i, j| if j == 0 { a[i] } else { b[i] });
        let serial = Reduction::local().gram(block.as_ref(), block.as_ref());
        let handles: Vec<_> = ThreadCommunicator::group(4)
            .into_iter()
            .map(|comm| {
                let (a, b, block) = (a.clone(), b.clone(), block.clone());
                thread::spawn(move || {
                    let red = Reduction::new(Some(&comm));
                    (red.dot(&a, &b), red.gram(block.as_ref(), block.as_ref()))
                })
            })
            .collect();
        for handle in handles {
            let (d, g) = handle.join().unwrap();
            assert!((d - expected).abs() < 1e-12);
            assert!((g[(0, 1)] - expected).abs() < 1e-12);
            assert!((g[(1, 1)] - serial[(1, 1)]).abs() < 1e-12);
        }
    }
}
