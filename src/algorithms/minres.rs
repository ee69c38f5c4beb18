//! Minimum-residual solver for symmetric, possibly indefinite, systems.
//!
//! This is the Paige–Saunders MINRES recurrence without a preconditioner. The
//! Lanczos three-term recurrence is combined with a running QR factorization
//! of the tridiagonal matrix, so only a handful of vectors are kept
//! regardless of the iteration count.

use super::{IterativeOptions, KrylovOutcome};
use crate::error::{KrylovError, check_len};
use crate::matrix::LinearOperator;
use crate::vector::{self, Reduction, col, col_mut};
use faer::{unzip, zip};

/// Solves `(A + shift) x = b`.
///
/// `x` holds the initial guess on entry and the solution on exit.
///
/// # Returns
/// `⟨x|b⟩` for the final `x`, with the iteration count and whether the
/// residual norm estimate dropped below `options.conv_thrd`.
pub fn minres<O: LinearOperator<f64> + ?Sized>(
    op: &mut O,
    x: &mut [f64],
    b: &[f64],
    shift: f64,
    options: &IterativeOptions,
    reduction: Reduction<'_>,
) -> Result<KrylovOutcome<f64>, KrylovError> {
    let n = op.ncols();
    check_len(n, x.len())?;
    check_len(n, b.len())?;

    let mut apply = |v: &[f64], out: &mut [f64]| {
        vector::clear(out);
        op.apply(v, out);
        vector::axpy(shift, v, out);
    };

    let mut r1 = vec![0.0; n];
    apply(x, &mut r1);
    zip!(col_mut(&mut r1), col(b)).for_each(|unzip!(r, b)| *r = *b - *r);
    let beta1 = reduction.norm(&r1);
    if beta1 < options.conv_thrd {
        return Ok(KrylovOutcome {
            value: reduction.dot(x, b),
            iterations: 0,
            converged: true,
        });
    }

    let mut r2 = r1.clone();
    let mut y = r1.clone();
    let mut v = vec![0.0; n];
    let mut w = vec![0.0; n];
    let mut w1 = vec![0.0; n];
    let mut w2 = vec![0.0; n];

    let (mut oldb, mut beta) = (0.0, beta1);
    let (mut dbar, mut epsln) = (0.0, 0.0);
    let mut phibar = beta1;
    let (mut cs, mut sn) = (-1.0_f64, 0.0_f64);

    let mut iter = 0;
    let mut converged = false;
    loop {
        iter += 1;
        v.copy_from_slice(&y);
        vector::scale(1.0 / beta, &mut v);
        apply(&v, &mut y);
        if iter >= 2 {
            vector::axpy(-beta / oldb, &r1, &mut y);
        }
        let alfa = reduction.dot(&v, &y);
        vector::axpy(-alfa / beta, &r2, &mut y);
        std::mem::swap(&mut r1, &mut r2);
        r2.copy_from_slice(&y);
        oldb = beta;
        beta = reduction.norm(&r2);

        // Apply the previous rotation, then compute and apply the new one.
        let oldeps = epsln;
        let delta = cs * dbar + sn * alfa;
        let gbar = sn * dbar - cs * alfa;
        epsln = sn * beta;
        dbar = -cs * beta;
        let gamma = gbar.hypot(beta).max(f64::EPSILON);
        cs = gbar / gamma;
        sn = beta / gamma;
        let phi = cs * phibar;
        phibar *= sn;

        std::mem::swap(&mut w1, &mut w2);
        std::mem::swap(&mut w2, &mut w);
        zip!(col_mut(&mut w), col(&v), col(&w1), col(&w2))
            .for_each(|unzip!(w, v, w1, w2)| *w = (*v - oldeps * *w1 - delta * *w2) / gamma);
        vector::axpy(phi, &w, x);

        log::debug!("minres iter {iter}: |r| {phibar:.3e}");
        if phibar < options.conv_thrd {
            converged = true;
            break;
        }
        if beta < 1e-14 * beta1 {
            log::debug!("minres: Krylov space exhausted at iteration {iter}");
            converged = true;
            break;
        }
        if options.exhausted(iter, "minres") {
            break;
        }
    }

    Ok(KrylovOutcome {
        value: reduction.dot(x, b),
        iterations: iter,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::{Mat, mat};

    fn residual(a: &Mat<f64>, shift: f64, x: &[f64], b: &[f64]) -> f64 {
        let mut ax = vec![0.0; b.len()];
        let mut a = a.clone();
        a.apply(x, &mut ax);
        vector::axpy(shift, x, &mut ax);
        vector::axpy(-1.0, b, &mut ax);
        vector::norm(&ax)
    }

    #[test]
    fn test_minres_solves_indefinite_system() {
        let mut a = mat![[2.0_f64, 1.0, 0.0], [1.0, -3.0, 0.5], [0.0, 0.5, 1.0]];
        let b = [1.0, 2.0, -1.0];
        let mut x = vec![0.0; 3];
        let opts = IterativeOptions::default().with_conv_thrd(1e-12);
        let out = minres(&mut a, &mut x, &b, 0.0, &opts, Reduction::local()).unwrap();
        assert!(out.converged);
        assert!(residual(&a, 0.0, &x, &b) < 1e-10);
        assert!((out.value - vector::dot(&x, &b)).abs() < 1e-14);
    }

    #[test]
    fn test_minres_with_shift_and_initial_guess() {
        let mut a = mat![[1.0_f64, 0.0], [0.0, 4.0]];
        let b = [3.0, 3.0];
        let mut x = vec![1.0, -1.0];
        let opts = IterativeOptions::default().with_conv_thrd(1e-12);
        minres(&mut a, &mut x, &b, -2.0, &opts, Reduction::local()).unwrap();
        assert!((x[0] + 3.0).abs() < 1e-10);
        assert!((x[1] - 1.5).abs() < 1e-10);
    }

    #[test]
    fn test_minres_exact_guess_returns_immediately() {
        let mut a = mat![[2.0_f64, 0.0], [0.0, 2.0]];
        let mut x = vec![0.5, 1.0];
        let out = minres(
            &mut a,
            &mut x,
            &[1.0, 2.0],
            0.0,
            &IterativeOptions::default(),
            Reduction::local(),
        )
        .unwrap();
        assert_eq!(out.iterations, 0);
        assert_eq!(x, vec![0.5, 1.0]);
    }
}
