//! Davidson eigensolvers for the lowest eigenpairs of a symmetric operator.
//!
//! [`davidson`] performs Rayleigh–Ritz extraction on an orthonormal search
//! space and expands it with diagonally preconditioned residuals.
//! [`harmonic_davidson`] extracts harmonic Ritz pairs with respect to a shift,
//! which targets the eigenvalues just above the shift; it builds the deflation
//! space of the Green's-function solvers.
//!
//! When the subspace reaches `deflation_max_size` it is collapsed onto its
//! best `max(k, deflation_min_size)` Ritz vectors.

use super::{IterativeOptions, KrylovOutcome, Subspace, orthogonalize, symmetric_eigen};
use crate::error::KrylovError;
use crate::matrix::LinearOperator;
use crate::vector::{self, Reduction, col};
use faer::{Mat, MatMut, Scale};

/// Smallest magnitude allowed for a preconditioner denominator.
const DENOMINATOR_FLOOR: f64 = 1e-8;

fn regularized(den: f64) -> f64 {
    if den.abs() < DENOMINATOR_FLOOR {
        DENOMINATOR_FLOOR.copysign(if den == 0.0 { 1.0 } else { den })
    } else {
        den
    }
}

/// Correction vector for the Ritz pair `(theta, x)` with residual `r`.
///
/// The plain correction is `r / (diag - theta)`. When it lies (numerically)
/// inside the current space, which happens whenever the diagonal is an exact
/// preconditioner, the Olsen-corrected vector is used instead. Without a
/// diagonal the residual itself is returned.
fn correction(
    r: &[f64],
    x: &[f64],
    theta: f64,
    diag: Option<&[f64]>,
    space: &Subspace,
    reduction: Reduction<'_>,
) -> Vec<f64> {
    let Some(diag) = diag else {
        return r.to_vec();
    };
    let plain: Vec<f64> = r
        .iter()
        .zip(diag)
        .map(|(ri, di)| ri / regularized(di - theta))
        .collect();
    let mut trial = plain.clone();
    let before = reduction.norm(&trial);
    let after = orthogonalize(&mut trial, &space.basis, reduction);
    if before > 0.0 && after > 1e-8 * before {
        return plain;
    }
    let tx: Vec<f64> = x
        .iter()
        .zip(diag)
        .map(|(xi, di)| xi / regularized(di - theta))
        .collect();
    let denom = reduction.dot(x, &tx);
    if denom.abs() < 1e-300 {
        return r.to_vec();
    }
    let eps = reduction.dot(x, &plain) / denom;
    let mut t = plain;
    vector::axpy(-eps, &tx, &mut t);
    t
}

/// Ritz pair data of one root.
struct Root {
    theta: f64,
    x: Vec<f64>,
    ax: Vec<f64>,
}

impl Root {
    fn residual(&self) -> Vec<f64> {
        let mut r = self.ax.clone();
        vector::axpy(-self.theta, &self.x, &mut r);
        r
    }
}

fn initial_space<O: LinearOperator<f64> + ?Sized>(
    op: &mut O,
    vectors: &MatMut<'_, f64>,
    capacity: usize,
    reduction: Reduction<'_>,
) -> Result<Subspace, KrylovError> {
    let n = op.ncols();
    if vectors.nrows() != n {
        return Err(crate::error::KrylovErrorKind::DimensionMismatch {
            expected: n,
            found: vectors.nrows(),
        }
        .into());
    }
    let mut space = Subspace::new(n, capacity);
    for j in 0..vectors.ncols() {
        let mut v: Vec<f64> = (0..n).map(|i| vectors[(i, j)]).collect();
        if !space.extend(op, &mut v, reduction) {
            return Err(KrylovError::input(
                "initial guess vectors are zero or linearly dependent",
            ));
        }
    }
    Ok(space)
}

fn write_back(vectors: &mut MatMut<'_, f64>, roots: &[Root]) -> Vec<f64> {
    for (j, root) in roots.iter().enumerate() {
        vectors.as_mut().col_mut(j).copy_from(col(&root.x));
    }
    roots.iter().map(|root| root.theta).collect()
}

/// Finds the `vectors.ncols()` lowest eigenpairs of `op`.
///
/// The columns of `vectors` hold the initial guesses on entry and the Ritz
/// vectors on exit.
/// `diag` is the operator diagonal used for preconditioning.
///
/// # Returns
/// The Ritz values (ascending), the number of iterations and whether every
/// residual norm dropped below `options.conv_thrd`.
pub fn davidson<O: LinearOperator<f64> + ?Sized>(
    op: &mut O,
    diag: Option<&[f64]>,
    mut vectors: MatMut<'_, f64>,
    options: &IterativeOptions,
    reduction: Reduction<'_>,
) -> Result<KrylovOutcome<Vec<f64>>, KrylovError> {
    let k = vectors.ncols();
    if k == 0 {
        return Err(KrylovError::input("davidson needs at least one guess vector"));
    }
    let keep = k.max(options.deflation_min_size);
    let max_size = options.deflation_max_size.max(keep + 1);
    let mut space = initial_space(op, &vectors, max_size, reduction)?;

    let mut iter = 0;
    let mut converged = false;
    let roots = loop {
        let (theta, y) = symmetric_eigen(space.projection(reduction).as_ref())?;
        let nroots = k.min(space.len());
        let roots: Vec<Root> = (0..nroots)
            .map(|i| {
                let (x, ax) = space.combine(y.as_ref(), i);
                Root {
                    theta: theta[i],
                    x,
                    ax,
                }
            })
            .collect();
        iter += 1;

        let mut pending = None;
        for (i, root) in roots.iter().enumerate() {
            let r = root.residual();
            let rnorm = reduction.norm(&r);
            if i == 0 {
                log::debug!(
                    "davidson iter {iter}: size {} theta {:.12} |r| {rnorm:.3e}",
                    space.len(),
                    root.theta
                );
            }
            if rnorm >= options.conv_thrd && pending.is_none() {
                pending = Some((i, r));
            }
        }
        let Some((i, r)) = pending else {
            converged = true;
            break roots;
        };
        if options.exhausted(iter, "davidson") {
            break roots;
        }

        let mut t = correction(&r, &roots[i].x, roots[i].theta, diag, &space, reduction);
        if space.len() + 1 > max_size {
            let pairs = (0..keep.min(space.len()))
                .map(|j| space.combine(y.as_ref(), j))
                .collect();
            space.reset(pairs, reduction);
        }
        let mut r = r;
        if !space.extend(op, &mut t, reduction) && !space.extend(op, &mut r, reduction) {
            log::warn!("davidson: search space stopped growing at iteration {iter}");
            break roots;
        }
    };

    Ok(KrylovOutcome {
        value: write_back(&mut vectors, &roots),
        iterations: iter,
        converged,
    })
}

/// Harmonic Ritz pairs of `space` with respect to `shift`, ordered so that
/// eigenvalues just above the shift come first.
fn harmonic_pairs(
    space: &Subspace,
    shift: f64,
    reduction: Reduction<'_>,
) -> Result<Vec<(Vec<f64>, Vec<f64>)>, KrylovError> {
    let m = space.len();
    let basis = space.basis.as_ref();
    // z_j = (A - shift) v_j
    let z = space.images.as_ref() - basis * Scale(shift);
    let s = reduction.gram(z.as_ref(), z.as_ref());
    let vz = reduction.gram(basis, z.as_ref());
    let g = Mat::from_fn(m, m, |i, j| 0.5 * (vz[(i, j)] + vz[(j, i)]));
    // S^{-1/2} G S^{-1/2} is symmetric; its eigenvalues are 1 / (theta - shift).
    let (lambda, u) = symmetric_eigen(s.as_ref())?;
    let floor = 1e-14 * lambda.last().copied().unwrap_or(1.0).abs().max(1e-300);
    let inv_sqrt = Mat::from_fn(m, m, |i, j| {
        (0..m)
            .map(|l| u[(i, l)] * u[(j, l)] / lambda[l].max(floor).sqrt())
            .sum::<f64>()
    });
    let mid = &(&inv_sqrt * &g) * &inv_sqrt;
    let (mu, w) = symmetric_eigen(mid.as_ref())?;
    let y = &inv_sqrt * &w;

    let mut order: Vec<usize> = (0..m).filter(|&i| mu[i] > 0.0).collect();
    order.sort_by(|&a, &b| mu[b].total_cmp(&mu[a]));
    let mut rest: Vec<usize> = (0..m).filter(|&i| mu[i] <= 0.0).collect();
    rest.sort_by(|&a, &b| mu[a].total_cmp(&mu[b]));
    order.extend(rest);

    Ok(order
        .into_iter()
        .map(|i| {
            let (mut x, mut ax) = space.combine(y.as_ref(), i);
            let nrm = reduction.norm(&x);
            if nrm > 0.0 {
                vector::scale(1.0 / nrm, &mut x);
                vector::scale(1.0 / nrm, &mut ax);
            }
            (x, ax)
        })
        .collect())
}

/// Harmonic Davidson for the `vectors.ncols()` eigenpairs closest to `shift`
/// from above.
///
/// Ritz values are reported as Rayleigh quotients of the harmonic Ritz
/// vectors. With `precondition == false` the search space is expanded with the
/// bare residuals.
pub fn harmonic_davidson<O: LinearOperator<f64> + ?Sized>(
    op: &mut O,
    diag: Option<&[f64]>,
    mut vectors: MatMut<'_, f64>,
    shift: f64,
    precondition: bool,
    options: &IterativeOptions,
    reduction: Reduction<'_>,
) -> Result<KrylovOutcome<Vec<f64>>, KrylovError> {
    let k = vectors.ncols();
    if k == 0 {
        return Err(KrylovError::input(
            "harmonic davidson needs at least one guess vector",
        ));
    }
    let keep = k.max(options.deflation_min_size);
    let max_size = options.deflation_max_size.max(keep + 1);
    let mut space = initial_space(op, &vectors, max_size, reduction)?;
    let diag = if precondition { diag } else { None };

    let mut iter = 0;
    let mut converged = false;
    let roots = loop {
        let pairs = harmonic_pairs(&space, shift, reduction)?;
        let roots: Vec<Root> = pairs
            .iter()
            .take(k)
            .map(|(x, ax)| Root {
                theta: reduction.dot(x, ax),
                x: x.clone(),
                ax: ax.clone(),
            })
            .collect();
        iter += 1;

        let mut pending = None;
        for (i, root) in roots.iter().enumerate() {
            let r = root.residual();
            let rnorm = reduction.norm(&r);
            if i == 0 {
                log::debug!(
                    "harmonic davidson iter {iter}: size {} rho {:.12} |r| {rnorm:.3e}",
                    space.len(),
                    root.theta
                );
            }
            if rnorm >= options.conv_thrd && pending.is_none() {
                pending = Some((i, r));
            }
        }
        let Some((i, r)) = pending else {
            converged = true;
            break roots;
        };
        if options.exhausted(iter, "harmonic davidson") {
            break roots;
        }

        let mut t = correction(&r, &roots[i].x, roots[i].theta, diag, &space, reduction);
        if space.len() + 1 > max_size {
            space.reset(pairs.into_iter().take(keep).collect(), reduction);
        }
        let mut r = r;
        if !space.extend(op, &mut t, reduction) && !space.extend(op, &mut r, reduction) {
            log::warn!("harmonic davidson: search space stopped growing at iteration {iter}");
            break roots;
        }
    };

    Ok(KrylovOutcome {
        value: write_back(&mut vectors, &roots),
        iterations: iter,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::Mat;

    fn columns(data: &mut [f64], n: usize) -> MatMut<'_, f64> {
        MatMut::from_column_major_slice_mut(data, n, data.len() / n)
    }

    fn laplacian(n: usize) -> Mat<f64> {
        Mat::from_fn(n, n, |i, j| {
            if i == j {
                2.0 + i as f64 * 0.1
            } else if i.abs_diff(j) == 1 {
                -1.0
            } else {
                0.0
            }
        })
    }

    fn lowest_eigenvalues(a: &Mat<f64>) -> Vec<f64> {
        symmetric_eigen(a.as_ref()).unwrap().0
    }

    #[test]
    fn test_davidson_lowest_root() {
        let mut a = laplacian(30);
        let exact = lowest_eigenvalues(&a);
        let diag: Vec<f64> = (0..30).map(|i| a[(i, i)]).collect();
        let mut guess = vec![1.0; 30];
        let opts = IterativeOptions::default().with_conv_thrd(1e-8);
        let out = davidson(
            &mut a,
            Some(&diag),
            columns(&mut guess, 30),
            &opts,
            Reduction::local(),
        )
        .unwrap();
        assert!(out.converged);
        assert!((out.value[0] - exact[0]).abs() < 1e-10);
        let mut av = vec![0.0; 30];
        a.apply(&guess, &mut av);
        vector::axpy(-out.value[0], &guess, &mut av);
        assert!(vector::norm(&av) < 1e-7);
    }

    #[test]
    fn test_davidson_two_roots_with_small_collapse() {
        let mut a = laplacian(40);
        let exact = lowest_eigenvalues(&a);
        let diag: Vec<f64> = (0..40).map(|i| a[(i, i)]).collect();
        let mut guesses: Vec<f64> = (0..40)
            .map(|i| 1.0 + 0.01 * i as f64)
            .chain((0..40).map(|i| (i as f64 * 0.3).sin()))
            .collect();
        let opts = IterativeOptions {
            conv_thrd: 1e-7,
            deflation_max_size: 8,
            ..IterativeOptions::default()
        };
        let out = davidson(
            &mut a,
            Some(&diag),
            columns(&mut guesses, 40),
            &opts,
            Reduction::local(),
        )
        .unwrap();
        assert!(out.converged);
        assert!((out.value[0] - exact[0]).abs() < 1e-9);
        assert!((out.value[1] - exact[1]).abs() < 1e-9);
    }

    #[test]
    fn test_diagonal_operator_converges_to_one_hot() {
        let d = vec![3.0, -1.5, 2.0, 0.5];
        let mut a = Mat::from_fn(4, 4, |i, j| if i == j { d[i] } else { 0.0 });
        let mut guess = vec![1.0; 4];
        let out = davidson(
            &mut a,
            Some(&d),
            columns(&mut guess, 4),
            &IterativeOptions::default(),
            Reduction::local(),
        )
        .unwrap();
        assert!((out.value[0] + 1.5).abs() < 1e-10);
        assert!((guess[1].abs() - 1.0).abs() < 1e-8);
    }

    #[test]
    fn test_soft_budget_stops_early() {
        let mut a = laplacian(50);
        let mut guess = vec![1.0; 50];
        let opts = IterativeOptions::default()
            .with_conv_thrd(1e-14)
            .with_soft_max_iter(2);
        let out = davidson(
            &mut a,
            None,
            columns(&mut guess, 50),
            &opts,
            Reduction::local(),
        )
        .unwrap();
        assert_eq!(out.iterations, 2);
        assert!(!out.converged);
    }

    #[test]
    fn test_harmonic_davidson_targets_smallest_positive() {
        // Positive definite: A^2 + 0.1 A.
        let a = laplacian(25);
        let a2 = &a * &a;
        let mut b = Mat::from_fn(25, 25, |i, j| a2[(i, j)] + 0.1 * a[(i, j)]);
        let exact = lowest_eigenvalues(&b);
        let mut guesses: Vec<f64> = std::iter::repeat_n(1.0, 25)
            .chain((0..25).map(|i| ((i * 7 % 5) as f64) - 2.0))
            .collect();
        let out = harmonic_davidson(
            &mut b,
            None,
            columns(&mut guesses, 25),
            0.0,
            false,
            &IterativeOptions::default().with_conv_thrd(1e-6),
            Reduction::local(),
        )
        .unwrap();
        assert!(out.converged);
        assert!((out.value[0] - exact[0]).abs() < 1e-8);
        assert!((out.value[1] - exact[1]).abs() < 1e-8);
    }
}
