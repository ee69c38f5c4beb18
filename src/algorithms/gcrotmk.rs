//! GCROT(m,k): flexible GMRES with a recycled, truncated outer space.
//!
//! Each outer cycle runs at most `m + (k - |CU|)` steps of right-preconditioned
//! Arnoldi, orthogonalized against the stored images `C`, and distils the
//! cycle into one new pair `(c, u)` with `A u = c` and `‖c‖ = 1`. At most `k`
//! pairs are kept; the oldest is dropped first.
//!
//! The solver is generic over [`Field`] and is used in complex arithmetic for
//! the shifted systems `(H + ω + iη) x = b` of Green's-function evaluation.

use super::{IterativeOptions, KrylovBasis, KrylovOutcome};
use crate::error::{KrylovError, KrylovErrorKind, check_len};
use crate::matrix::LinearOperator;
use crate::vector::{self, Field, Reduction, col, col_mut};
use faer::{Mat, unzip, zip};

/// Complex Givens rotation `(c, s)` zeroing `b` in `[a, b]`, and the rotated `a`.
///
/// The rotation acts as `[c s; -conj(s) c]` with real `c`.
fn givens<T: Field>(a: T, b: T) -> (f64, T, T) {
    let (na, nb) = (T::abs_impl(&a), T::abs_impl(&b));
    if nb == 0.0 {
        return (1.0, T::zero_impl(), a);
    }
    if na == 0.0 {
        return (0.0, T::conj_impl(&b) * T::from_f64_impl(1.0 / nb), T::from_f64_impl(nb));
    }
    let r = na.hypot(nb);
    let phase = a * T::from_f64_impl(1.0 / na);
    (na / r, phase * T::conj_impl(&b) * T::from_f64_impl(1.0 / r), phase * T::from_f64_impl(r))
}

fn precondition<T: Field>(v: &[T], diag: Option<&[T]>, z: &mut [T]) {
    match diag {
        Some(d) => zip!(col_mut(z), col(v), col(d))
            .for_each(|unzip!(z, v, d)| *z = if T::abs_impl(d) > 1e-12 { *v / *d } else { *v }),
        None => col_mut(z).copy_from(col(v)),
    }
}

/// Solves `A x = b` for a general (non-Hermitian) operator.
///
/// `x` holds the initial guess on entry and the solution on exit. `diag`
/// is an optional diagonal right preconditioner. `k == 0` keeps `m` pairs.
/// `options.max_iter` bounds the number of outer cycles.
///
/// # Returns
/// `⟨b|x⟩` for the final `x`, the total number of Arnoldi steps, and whether
/// the residual norm dropped below `options.conv_thrd`.
#[allow(clippy::too_many_arguments)]
pub fn gcrotmk<T: Field, O: LinearOperator<T> + ?Sized>(
    op: &mut O,
    diag: Option<&[T]>,
    x: &mut [T],
    b: &[T],
    m: usize,
    k: usize,
    options: &IterativeOptions,
    reduction: Reduction<'_>,
) -> Result<KrylovOutcome<T>, KrylovError> {
    let n = op.ncols();
    check_len(n, x.len())?;
    check_len(n, b.len())?;
    if let Some(d) = diag {
        check_len(n, d.len())?;
    }
    if m == 0 {
        return Err(KrylovError::input("gcrotmk needs an inner space of at least one vector"));
    }
    let k = if k == 0 { m } else { k };
    let (zero, one) = (T::zero_impl(), T::one_impl());

    let mut r = vec![zero; n];
    op.apply(x, &mut r);
    zip!(col_mut(&mut r), col(b)).for_each(|unzip!(r, b)| *r = *b - *r);

    // Recycled pairs, oldest first; one spare column for the pair of the
    // current cycle.
    let mut cs = KrylovBasis::<T>::new(n, k + 1);
    let mut us = KrylovBasis::<T>::new(n, k + 1);
    let mut w = vec![zero; n];
    let mut steps = 0;
    let mut outer = 0;
    let mut converged = false;
    loop {
        let rnorm = reduction.norm(&r);
        log::debug!("gcrotmk cycle {outer}: |r| {rnorm:.3e} |CU| {}", cs.len());
        if rnorm < options.conv_thrd {
            converged = true;
            break;
        }
        if outer > 0 && options.exhausted(outer, "gcrotmk") {
            break;
        }
        outer += 1;

        let inner = m + k.saturating_sub(cs.len());
        let ncu = cs.len();
        let mut vs = KrylovBasis::<T>::new(n, inner + 1);
        let mut zs = KrylovBasis::<T>::new(n, inner);
        vs.push(&r);
        vector::scale(T::from_f64_impl(1.0 / rnorm), vs.col_mut(0));
        // Unrotated Hessenberg matrix, projections onto C, and the rotated
        // upper triangle.
        let mut hess = Mat::<T>::zeros(inner + 1, inner);
        let mut proj = Mat::<T>::zeros(ncu, inner);
        let mut tri = Mat::<T>::zeros(inner, inner);
        let mut rots: Vec<(f64, T)> = Vec::with_capacity(inner);
        let mut g = vec![T::from_f64_impl(rnorm)];

        for j in 0..inner {
            precondition(vs.col(j), diag, zs.push_zeroed());
            vector::clear(&mut w);
            op.apply(zs.col(j), &mut w);
            steps += 1;

            for i in 0..ncu {
                let c = cs.col(i);
                let h = reduction.dot(c, &w);
                vector::axpy(-h, c, &mut w);
                proj[(i, j)] = h;
            }
            for _ in 0..2 {
                for i in 0..vs.len() {
                    let v = vs.col(i);
                    let c = reduction.dot(v, &w);
                    vector::axpy(-c, v, &mut w);
                    hess[(i, j)] += c;
                }
            }
            let hnext = reduction.norm(&w);
            hess[(j + 1, j)] = T::from_f64_impl(hnext);

            let mut rc: Vec<T> = (0..j + 2).map(|i| hess[(i, j)]).collect();
            for (i, &(c, s)) in rots.iter().enumerate() {
                let (a, bb) = (rc[i], rc[i + 1]);
                rc[i] = T::from_f64_impl(c) * a + s * bb;
                rc[i + 1] = -(T::conj_impl(&s) * a) + T::from_f64_impl(c) * bb;
            }
            let (c, s, diag_entry) = givens(rc[j], rc[j + 1]);
            rc[j] = diag_entry;
            for (i, &v) in rc.iter().take(j + 1).enumerate() {
                tri[(i, j)] = v;
            }
            rots.push((c, s));
            let gj = g[j];
            g[j] = T::from_f64_impl(c) * gj;
            g.push(-(T::conj_impl(&s) * gj));

            let estimate = T::abs_impl(&g[j + 1]);
            let breakdown = hnext <= 1e-14 * rnorm;
            if breakdown {
                vs.push_zeroed();
            } else {
                vector::scale(T::from_f64_impl(1.0 / hnext), &mut w);
                vs.push(&w);
            }
            if estimate < options.conv_thrd || breakdown {
                break;
            }
        }

        let p = zs.len();
        let mut y = vec![zero; p];
        for i in (0..p).rev() {
            let mut acc = g[i];
            for jj in i + 1..p {
                acc -= tri[(i, jj)] * y[jj];
            }
            let d = tri[(i, i)];
            if T::abs_impl(&d) < 1e-300 {
                return Err(KrylovErrorKind::SingularProjection {
                    dim: p,
                    reason: "triangular factor of the Arnoldi relation is singular".to_string(),
                }
                .into());
            }
            y[i] = acc / d;
        }

        // A (Z y - U B y) = V H y
        let mut ux = vec![zero; n];
        zs.accumulate(&y, one, &mut ux);
        if ncu > 0 {
            let mut by = vec![zero; ncu];
            vector::gemv(&mut by, proj.as_ref().get(.., 0..p), &y, one);
            us.accumulate(&by, -one, &mut ux);
        }
        let mut hy = vec![zero; p + 1];
        vector::gemv(&mut hy, hess.as_ref().get(0..p + 1, 0..p), &y, one);
        let mut cx = vec![zero; n];
        vs.accumulate(&hy, one, &mut cx);
        let alpha = reduction.norm(&cx);
        if alpha == 0.0 {
            log::warn!("gcrotmk: cycle {outer} made no progress");
            break;
        }
        vector::scale(T::from_f64_impl(1.0 / alpha), &mut cx);
        vector::scale(T::from_f64_impl(1.0 / alpha), &mut ux);

        let gamma = reduction.dot(&cx, &r);
        vector::axpy(gamma, &ux, x);
        vector::axpy(-gamma, &cx, &mut r);
        cs.push(&cx);
        us.push(&ux);
        if cs.len() > k {
            cs.remove_first();
            us.remove_first();
        }
    }

    Ok(KrylovOutcome {
        value: reduction.dot(b, x),
        iterations: steps,
        converged,
    })
}
