//! Preconditioned conjugate gradient for symmetric positive-definite systems,
//! with optional deflation.
//!
//! The deflated variant restricts the iteration to the `A`-orthogonal
//! complement of a small basis `W`: the initial guess is corrected by the
//! Galerkin solution on `span(W)`, and every search direction is projected
//! with `p ← z − W (WᵀAW)⁻¹ (AW)ᵀ z`. When `W` spans the eigenvectors of the
//! smallest eigenvalues, convergence is governed by the remaining spectrum.
//!
//! [`davidson_projected_deflated_cg`] builds `W` on the fly by alternating
//! short harmonic Davidson runs with short deflated CG runs.

use super::davidson::harmonic_davidson;
use super::{IterativeOptions, KrylovOutcome, dense_solve, symmetrized};
use crate::error::{KrylovError, check_len};
use crate::matrix::LinearOperator;
use crate::vector::{self, Reduction, col, col_mut};
use faer::{Mat, MatRef, unzip, zip};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Seed of the random trial vectors, shared by all processes.
const TRIAL_SEED: u64 = 0x5eed;

fn precondition(r: &[f64], diag: Option<&[f64]>, z: &mut [f64]) {
    match diag {
        Some(d) => zip!(col_mut(z), col(r), col(d))
            .for_each(|unzip!(z, r, d)| *z = if d.abs() > 1e-12 { *r / *d } else { *r }),
        None => col_mut(z).copy_from(col(r)),
    }
}

/// Galerkin projector onto a deflation basis.
struct Deflation {
    basis: Mat<f64>,
    images: Mat<f64>,
    gram: Mat<f64>,
}

impl Deflation {
    fn new<O: LinearOperator<f64> + ?Sized>(op: &mut O, basis: MatRef<'_, f64>, reduction: Reduction<'_>) -> Self {
        let basis = basis.to_owned();
        let mut images = Mat::zeros(basis.nrows(), basis.ncols());
        for j in 0..basis.ncols() {
            op.apply(basis.col_as_slice(j), images.col_as_slice_mut(j));
        }
        let gram = symmetrized(reduction.gram(basis.as_ref(), images.as_ref()));
        Self { basis, images, gram }
    }

    fn is_empty(&self) -> bool {
        self.basis.ncols() == 0
    }

    /// `(WᵀAW)⁻¹ cᵀ v` where the columns of `c` are `with`.
    fn coefficients(&self, with: MatRef<'_, f64>, v: &[f64], reduction: Reduction<'_>) -> Result<Mat<f64>, KrylovError> {
        let rhs = reduction.gram(with, MatRef::from_column_major_slice(v, v.len(), 1));
        dense_solve(&self.gram, &rhs)
    }

    /// `x += W μ`, `r -= AW μ` with `μ = (WᵀAW)⁻¹ Wᵀ r`.
    fn correct_guess(&self, x: &mut [f64], r: &mut [f64], reduction: Reduction<'_>) -> Result<(), KrylovError> {
        let mu = self.coefficients(self.basis.as_ref(), r, reduction)?;
        vector::gemv(x, self.basis.as_ref(), mu.col_as_slice(0), 1.0);
        vector::gemv(r, self.images.as_ref(), mu.col_as_slice(0), -1.0);
        Ok(())
    }

    /// `p -= W (WᵀAW)⁻¹ (AW)ᵀ z`
    fn project(&self, z: &[f64], p: &mut [f64], reduction: Reduction<'_>) -> Result<(), KrylovError> {
        let mu = self.coefficients(self.images.as_ref(), z, reduction)?;
        vector::gemv(p, self.basis.as_ref(), mu.col_as_slice(0), -1.0);
        Ok(())
    }
}

/// Solves `A x = b` for symmetric positive-definite `A` with an optional
/// Jacobi (diagonal) preconditioner.
///
/// `x` holds the initial guess on entry and the solution on exit.
///
/// # Returns
/// `⟨x|b⟩` for the final `x`, with the iteration count and whether the
/// residual norm dropped below `options.conv_thrd`.
pub fn conjugate_gradient<O: LinearOperator<f64> + ?Sized>(
    op: &mut O,
    diag: Option<&[f64]>,
    x: &mut [f64],
    b: &[f64],
    options: &IterativeOptions,
    reduction: Reduction<'_>,
) -> Result<KrylovOutcome<f64>, KrylovError> {
    let none = Mat::zeros(op.ncols(), 0);
    deflated_conjugate_gradient(op, diag, x, b, none.as_ref(), options, reduction)
}

/// Conjugate gradient in the `A`-orthogonal complement of `deflation`.
///
/// The columns of `deflation` need not be orthonormal but must be linearly
/// independent; an empty basis gives plain preconditioned CG.
pub fn deflated_conjugate_gradient<O: LinearOperator<f64> + ?Sized>(
    op: &mut O,
    diag: Option<&[f64]>,
    x: &mut [f64],
    b: &[f64],
    deflation: MatRef<'_, f64>,
    options: &IterativeOptions,
    reduction: Reduction<'_>,
) -> Result<KrylovOutcome<f64>, KrylovError> {
    let n = op.ncols();
    check_len(n, x.len())?;
    check_len(n, b.len())?;
    if let Some(d) = diag {
        check_len(n, d.len())?;
    }
    check_len(n, deflation.nrows())?;

    let defl = Deflation::new(op, deflation, reduction);
    let mut r = vec![0.0; n];
    op.apply(x, &mut r);
    zip!(col_mut(&mut r), col(b)).for_each(|unzip!(r, b)| *r = *b - *r);
    if !defl.is_empty() {
        defl.correct_guess(x, &mut r, reduction)?;
    }

    let mut rnorm = reduction.norm(&r);
    if rnorm < options.conv_thrd {
        return Ok(KrylovOutcome {
            value: reduction.dot(x, b),
            iterations: 0,
            converged: true,
        });
    }

    let mut z = vec![0.0; n];
    precondition(&r, diag, &mut z);
    let mut p = z.clone();
    if !defl.is_empty() {
        defl.project(&z, &mut p, reduction)?;
    }
    let mut rz = reduction.dot(&r, &z);
    let mut ap = vec![0.0; n];

    let mut iter = 0;
    let mut converged = false;
    loop {
        iter += 1;
        vector::clear(&mut ap);
        op.apply(&p, &mut ap);
        let pap = reduction.dot(&p, &ap);
        if pap.abs() < f64::MIN_POSITIVE {
            log::warn!("conjugate gradient: breakdown at iteration {iter}");
            break;
        }
        let alpha = rz / pap;
        vector::axpy(alpha, &p, x);
        vector::axpy(-alpha, &ap, &mut r);
        rnorm = reduction.norm(&r);
        log::debug!("conjugate gradient iter {iter}: |r| {rnorm:.3e}");
        if rnorm < options.conv_thrd {
            converged = true;
            break;
        }
        if options.exhausted(iter, "conjugate gradient") {
            break;
        }

        precondition(&r, diag, &mut z);
        let rz_new = reduction.dot(&r, &z);
        let beta = rz_new / rz;
        rz = rz_new;
        vector::scale(beta, &mut p);
        vector::axpy(1.0, &z, &mut p);
        if !defl.is_empty() {
            defl.project(&z, &mut p, reduction)?;
        }
    }

    Ok(KrylovOutcome {
        value: reduction.dot(x, b),
        iterations: iter,
        converged,
    })
}

/// Outcome of [`davidson_projected_deflated_cg`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedOutcome {
    /// Final CG result; `iterations` counts CG steps over all rounds.
    pub cg: KrylovOutcome<f64>,
    pub davidson_iterations: usize,
}

/// Deflated CG whose `n_deflation`-vector basis is refined by harmonic
/// Davidson (shift 0, unpreconditioned) between rounds.
///
/// Each round runs at most `options.deflation_max_size` Davidson iterations
/// followed by at most as many CG iterations, both warm-started. Once the
/// Davidson vectors converge the final CG round runs to the full budget.
pub fn davidson_projected_deflated_cg<O: LinearOperator<f64> + ?Sized>(
    op: &mut O,
    diag: Option<&[f64]>,
    x: &mut [f64],
    b: &[f64],
    n_deflation: usize,
    options: &IterativeOptions,
    reduction: Reduction<'_>,
) -> Result<ProjectedOutcome, KrylovError> {
    let n = op.ncols();
    check_len(n, x.len())?;
    if n_deflation == 0 {
        return Err(KrylovError::input("projected CG needs at least one deflation vector"));
    }

    let mut rng = StdRng::seed_from_u64(TRIAL_SEED);
    let seeded = vector::norm(x) > 0.0;
    let mut basis = Mat::from_fn(n, n_deflation.min(n), |i, j| {
        if j == 0 && seeded { x[i] } else { rng.random::<f64>() - 0.5 }
    });

    let round = options.deflation_max_size.max(1);
    let davidson_options = IterativeOptions {
        soft_max_iter: Some(round),
        ..*options
    };
    let mut davidson_iterations = 0;
    let mut cg_iterations = 0;
    loop {
        let dav = harmonic_davidson(op, diag, basis.as_mut(), 0.0, false, &davidson_options, reduction)?;
        davidson_iterations += dav.iterations;
        let remaining = options.max_iter.saturating_sub(cg_iterations).max(1);
        let final_round = dav.converged || davidson_iterations >= options.max_iter;
        let cg_options = IterativeOptions {
            max_iter: remaining,
            soft_max_iter: if final_round { None } else { Some(round.min(remaining)) },
            ..*options
        };
        let cg = deflated_conjugate_gradient(op, diag, x, b, basis.as_ref(), &cg_options, reduction)?;
        cg_iterations += cg.iterations;
        if cg.converged || final_round || cg_iterations >= options.max_iter {
            log::debug!(
                "projected CG: {cg_iterations} CG and {davidson_iterations} Davidson iterations"
            );
            return Ok(ProjectedOutcome {
                cg: KrylovOutcome {
                    iterations: cg_iterations,
                    ..cg
                },
                davidson_iterations,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::symmetric_eigen;

    fn spd(n: usize) -> Mat<f64> {
        Mat::from_fn(n, n, |i, j| {
            if i == j {
                0.05 + 0.3 * i as f64
            } else if i.abs_diff(j) == 1 {
                -0.1
            } else {
                0.0
            }
        })
    }

    fn rhs(n: usize) -> Vec<f64> {
        (0..n).map(|i| 1.0 + (i as f64 * 0.7).sin()).collect()
    }

    fn residual(a: &Mat<f64>, x: &[f64], b: &[f64]) -> f64 {
        let mut r: Vec<f64> = b.iter().map(|v| -v).collect();
        a.clone().apply(x, &mut r);
        vector::norm(&r)
    }

    #[test]
    fn test_cg_solves_spd_system() {
        let mut a = spd(40);
        let b = rhs(40);
        let mut x = vec![0.0; 40];
        let opts = IterativeOptions::default().with_conv_thrd(1e-10);
        let out = conjugate_gradient(&mut a, None, &mut x, &b, &opts, Reduction::local()).unwrap();
        assert!(out.converged);
        assert!(residual(&a, &x, &b) < 1e-9);
        assert!((out.value - vector::dot(&x, &b)).abs() < 1e-12);
    }

    #[test]
    fn test_jacobi_preconditioner_reduces_iterations() {
        let mut a = spd(40);
        let diag: Vec<f64> = (0..40).map(|i| a[(i, i)]).collect();
        let b = rhs(40);
        let opts = IterativeOptions::default().with_conv_thrd(1e-10);
        let mut x0 = vec![0.0; 40];
        let plain = conjugate_gradient(&mut a, None, &mut x0, &b, &opts, Reduction::local()).unwrap();
        let mut x1 = vec![0.0; 40];
        let jacobi = conjugate_gradient(&mut a, Some(&diag), &mut x1, &b, &opts, Reduction::local()).unwrap();
        assert!(jacobi.converged);
        assert!(jacobi.iterations <= plain.iterations);
        assert!(residual(&a, &x1, &b) < 1e-9);
    }

    #[test]
    fn test_deflation_with_exact_eigenvectors() {
        let mut a = spd(30);
        let (_, u) = symmetric_eigen(a.as_ref()).unwrap();
        let w = u.as_ref().get(.., 0..4);
        let b = rhs(30);
        let opts = IterativeOptions::default().with_conv_thrd(1e-10);
        let mut x0 = vec![0.0; 30];
        let plain = conjugate_gradient(&mut a, None, &mut x0, &b, &opts, Reduction::local()).unwrap();
        let mut x1 = vec![0.0; 30];
        let defl = deflated_conjugate_gradient(&mut a, None, &mut x1, &b, w, &opts, Reduction::local()).unwrap();
        assert!(defl.converged);
        assert!(defl.iterations <= plain.iterations);
        assert!(residual(&a, &x1, &b) < 1e-9);
    }

    #[test]
    fn test_davidson_projected_cg() {
        let mut a = spd(30);
        let b = rhs(30);
        let mut x = vec![0.0; 30];
        let opts = IterativeOptions::default().with_conv_thrd(1e-9);
        let out = davidson_projected_deflated_cg(&mut a, None, &mut x, &b, 3, &opts, Reduction::local()).unwrap();
        assert!(out.cg.converged);
        assert!(out.davidson_iterations > 0);
        assert!(residual(&a, &x, &b) < 1e-8);
    }
}
