//! Exponential propagation `v ← exp(t (A + e)) v`.
//!
//! [`expo_apply`] is a Krylov propagator: the step is split into substeps,
//! each projecting onto a small Lanczos space, exponentiating the tridiagonal
//! matrix exactly and mapping back. A substep is halved while its a posteriori
//! error estimate `‖v‖ β_m |e_mᵀ exp(τ T_m) e_1|` exceeds the tolerance. The
//! first substep length is bounded by the operator norm estimate.
//!
//! The RK4 helpers implement a classical fourth-order Runge–Kutta step with
//! dense output at one, two and three thirds of the step.

use super::lanczos::lanczos_standard;
use super::{IterativeOptions, KrylovOutcome};
use crate::error::{KrylovError, check_len};
use crate::matrix::LinearOperator;
use crate::vector::{self, Reduction};

/// Largest Krylov space built per substep.
pub const KRYLOV_DIM: usize = 30;

/// Runge–Kutta stage offsets.
pub const RK4_NODES: [f64; 4] = [0.0, 0.5, 0.5, 1.0];

/// Dense-output weights giving the state at `t/3`, `2t/3` and `t`.
pub const RK4_WEIGHTS: [[f64; 4]; 3] = [
    [31.0 / 162.0, 14.0 / 162.0, 14.0 / 162.0, -5.0 / 162.0],
    [16.0 / 81.0, 20.0 / 81.0, 20.0 / 81.0, -2.0 / 81.0],
    [1.0 / 6.0, 2.0 / 6.0, 2.0 / 6.0, 1.0 / 6.0],
];

const MAX_HALVINGS: usize = 60;

/// Computes `v ← exp(t (A + shift)) v` in place.
///
/// `anorm` is an estimate of `‖A‖`; the local error tolerance is
/// `options.conv_thrd`.
///
/// # Returns
/// `‖v‖` after propagation, the number of operator applications, and
/// whether every substep met the tolerance.
pub fn expo_apply<O: LinearOperator<f64> + ?Sized>(
    op: &mut O,
    t: f64,
    anorm: f64,
    v: &mut [f64],
    shift: f64,
    options: &IterativeOptions,
    reduction: Reduction<'_>,
) -> Result<KrylovOutcome<f64>, KrylovError> {
    let n = op.ncols();
    check_len(n, v.len())?;
    let m = KRYLOV_DIM.min(n).max(1);
    let total = t.abs();
    let sign = t.signum();
    let tol = options.conv_thrd;

    let mut done = 0.0;
    let mut tau = if anorm > 0.0 {
        total.min(m as f64 / anorm)
    } else {
        total
    };
    let mut nmult = 0;
    let mut converged = true;
    let mut substeps = 0;

    while total - done > f64::EPSILON * total {
        let beta = reduction.norm(v);
        if beta == 0.0 {
            break;
        }
        tau = tau.min(total - done);
        let krylov = lanczos_standard(op, v, m, reduction)?;
        nmult += krylov.decomposition.steps();
        let decomposition = &krylov.decomposition;
        let last = decomposition.steps() - 1;
        let residual_beta = decomposition.betas[last];

        let mut halvings = 0;
        let (y, err) = loop {
            if krylov.invariant {
                tau = total - done;
            }
            let y = decomposition.exp_e1(sign * tau)?;
            let err = if krylov.invariant {
                0.0
            } else {
                beta * residual_beta * y[last].abs()
            };
            if err <= tol || halvings >= MAX_HALVINGS {
                break (y, err);
            }
            tau *= 0.5;
            halvings += 1;
        };
        if err > tol {
            log::warn!("expo: substep error {err:.3e} above tolerance at t = {done:.6e}");
            converged = false;
        }

        vector::clear(v);
        let factor = beta * (sign * tau * shift).exp();
        krylov.basis.accumulate(&y, factor, v);
        done += tau;
        substeps += 1;
        log::debug!("expo substep {substeps}: tau {tau:.3e} err {err:.3e} krylov {}", last + 1);
        if halvings == 0 && err < 0.1 * tol {
            tau *= 2.0;
        }
    }

    Ok(KrylovOutcome {
        value: reduction.norm(v),
        iterations: nmult,
        converged,
    })
}

/// RK4 stages `k_i = β A (v + node_i k_{i-1})`, written into `k`.
///
/// With `first` given, it is used as `k_0 = β A v` and only three operator
/// applications are made. `stage` is scratch of the same length.
pub fn rk4_stages<O: LinearOperator<f64> + ?Sized>(
    op: &mut O,
    beta: f64,
    v: &[f64],
    first: Option<&[f64]>,
    k: &mut [&mut [f64]; 4],
    stage: &mut [f64],
) -> Result<(), KrylovError> {
    let n = op.ncols();
    check_len(n, v.len())?;
    check_len(n, stage.len())?;
    for ki in k.iter_mut() {
        check_len(n, ki.len())?;
        vector::clear(&mut **ki);
    }
    match first {
        Some(k0) => {
            check_len(n, k0.len())?;
            k[0].copy_from_slice(k0);
        }
        None => {
            op.apply(v, &mut *k[0]);
            vector::scale(beta, &mut *k[0]);
        }
    }
    for i in 1..4 {
        stage.copy_from_slice(v);
        let (done, rest) = k.split_at_mut(i);
        vector::axpy(RK4_NODES[i], &*done[i - 1], stage);
        op.apply(stage, &mut *rest[0]);
        vector::scale(beta, &mut *rest[0]);
    }
    Ok(())
}

/// States at `β/3`, `2β/3` and `β` from the RK4 stages, each multiplied by
/// `exp(β (i+1)/3 · shift)` for the constant energy term.
pub fn rk4_combine(v: &[f64], k: &[&mut [f64]; 4], beta: f64, shift: f64) -> [Vec<f64>; 3] {
    std::array::from_fn(|i| {
        let mut r = v.to_vec();
        for (kj, &c) in k.iter().zip(&RK4_WEIGHTS[i]) {
            vector::axpy(c, &**kj, &mut r);
        }
        vector::scale((beta * (i + 1) as f64 / 3.0 * shift).exp(), &mut r);
        r
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::symmetric_eigen;
    use faer::{Mat, mat};

    fn exact_exp(a: &Mat<f64>, t: f64, v: &[f64]) -> Vec<f64> {
        let (lambda, q) = symmetric_eigen(a.as_ref()).unwrap();
        let n = v.len();
        (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| {
                        let proj: f64 = (0..n).map(|l| q[(l, j)] * v[l]).sum();
                        q[(i, j)] * (t * lambda[j]).exp() * proj
                    })
                    .sum()
            })
            .collect()
    }

    fn stages(a: &mut Mat<f64>, beta: f64, v: &[f64], first: Option<&[f64]>) -> [Vec<f64>; 4] {
        let mut k: [Vec<f64>; 4] = std::array::from_fn(|_| vec![0.0; v.len()]);
        let mut stage = vec![0.0; v.len()];
        let mut views = k.each_mut().map(Vec::as_mut_slice);
        rk4_stages(a, beta, v, first, &mut views, &mut stage).unwrap();
        k
    }

    fn combine(v: &[f64], k: &mut [Vec<f64>; 4], beta: f64, shift: f64) -> [Vec<f64>; 3] {
        rk4_combine(v, &k.each_mut().map(Vec::as_mut_slice), beta, shift)
    }

    fn max_diff(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
    }

    #[test]
    fn test_rk4_matches_exact_to_fifth_order() {
        let mut a = mat![[-1.0_f64, 0.5], [0.5, -2.0]];
        let v = [1.0, 0.5];
        let beta = 0.1;
        let mut k = stages(&mut a, beta, &v, None);
        let r = combine(&v, &mut k, beta, 0.0);
        // Local error is O(β⁵) at the end of the step and O(β⁴) in the dense output.
        assert!(max_diff(&r[2], &exact_exp(&a, beta, &v)) < 1e-5);
        assert!(max_diff(&r[0], &exact_exp(&a, beta / 3.0, &v)) < 1e-4);
        assert!(max_diff(&r[1], &exact_exp(&a, 2.0 * beta / 3.0, &v)) < 1e-4);
    }

    #[test]
    fn test_rk4_with_precomputed_first_stage_and_shift() {
        let mut a = mat![[0.0_f64, 1.0], [1.0, 0.0]];
        let v = [1.0, 0.0];
        let beta = -0.05;
        let mut k0 = vec![0.0; 2];
        a.apply(&v, &mut k0);
        vector::scale(beta, &mut k0);
        let mut k = stages(&mut a, beta, &v, Some(&k0));
        assert_eq!(k, stages(&mut a, beta, &v, None));
        let r = combine(&v, &mut k, beta, 2.0);
        let mut expected = exact_exp(&a, beta, &v);
        vector::scale((2.0 * beta).exp(), &mut expected);
        assert!(max_diff(&r[2], &expected) < 1e-7);
    }

    #[test]
    fn test_krylov_expo_on_small_operator() {
        let mut a = mat![[-1.0_f64, 0.5], [0.5, -2.0]];
        let mut v = vec![1.0, 0.5];
        let opts = IterativeOptions::default().with_conv_thrd(1e-12);
        let out = expo_apply(&mut a, 0.1, 2.5, &mut v, 0.0, &opts, Reduction::local()).unwrap();
        assert!(out.converged);
        assert!(max_diff(&v, &exact_exp(&a, 0.1, &[1.0, 0.5])) < 1e-12);
        assert!((out.value - vector::norm(&v)).abs() < 1e-14);
    }

    #[test]
    fn test_krylov_expo_takes_substeps() {
        let n = 60;
        let mut a = Mat::from_fn(n, n, |i, j| {
            if i == j {
                -2.0 - 0.05 * i as f64
            } else if i.abs_diff(j) == 1 {
                1.0
            } else {
                0.0
            }
        });
        let v0: Vec<f64> = (0..n).map(|i| ((i + 1) as f64 * 0.3).cos()).collect();
        let mut v = v0.clone();
        let anorm = (0..n).map(|i| a[(i, i)] * a[(i, i)]).sum::<f64>().sqrt();
        let opts = IterativeOptions::default().with_conv_thrd(1e-10);
        let out = expo_apply(&mut a, -1.5, anorm, &mut v, 0.25, &opts, Reduction::local()).unwrap();
        let mut expected = exact_exp(&a, -1.5, &v0);
        vector::scale((-1.5_f64 * 0.25).exp(), &mut expected);
        assert!(out.converged);
        assert!(max_diff(&v, &expected) < 1e-7);
    }
}
