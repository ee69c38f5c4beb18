//! Krylov entry points of [`EffectiveHamiltonian`].
//!
//! Every entry point follows the same shape: reset the flop counter, open a
//! `precompute` bracket, hand the operator to one of the solvers in
//! [`crate::algorithms`], close the bracket, and report the result together
//! with the iteration count, the flops (summed onto the root process) and the
//! wall time as a [`SolverReport`].
//!
//! Operator-level scratch of a call (the preconditioner and right-hand side of
//! the normal equations, the intermediate of the shifted square, the real and
//! imaginary splits of the complex solver, the RK4 stages) is taken from the
//! operator's [`StackArena`] and released before returning. The solvers in
//! [`crate::algorithms`] allocate their own Krylov workspaces once per call.
//!
//! [`StackArena`]: crate::arena::StackArena

use crate::algorithms::conjugate_gradient::{
    conjugate_gradient, davidson_projected_deflated_cg, deflated_conjugate_gradient,
};
use crate::algorithms::davidson::{davidson, harmonic_davidson};
use crate::algorithms::expo::{expo_apply, rk4_combine, rk4_stages};
use crate::algorithms::gcrotmk::gcrotmk;
use crate::algorithms::minres::minres;
use crate::algorithms::{IterativeOptions, KrylovOutcome};
use crate::effective::EffectiveHamiltonian;
use crate::error::{KrylovError, check_len};
use crate::matrix::{FnOperator, LinearOperator, ShiftedSquare};
use crate::quantum::QuantumLabel;
use crate::vector::{self, Reduction, col, col_mut};
use faer::{Mat, MatMut, c64, unzip, zip};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::time::Instant;

/// Seed of the random vectors completing a harmonic projection basis.
const PROJECTION_SEED: u64 = 0x9e37;

/// Convergence threshold of the harmonic Davidson run that builds a
/// projection basis for the Green's function.
const PROJECTION_CONV_THRD: f64 = 1e-4;

/// Result of a solver entry point.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverReport<T> {
    pub result: T,
    /// Iterations or operator applications, depending on the entry point.
    pub iterations: usize,
    /// Floating-point operations of the block multiplications, summed onto
    /// the root process.
    pub nflop: u64,
    pub seconds: f64,
    pub converged: bool,
}

/// Outcome of a time step.
#[derive(Debug, Clone, PartialEq)]
pub struct Propagation {
    /// `⟨v|O|v⟩ / ‖v‖²` of the propagated state, when requested.
    pub energy: Option<f64>,
    pub norm: f64,
}

/// Outcome of an RK4 step, with the states at `β/3`, `2β/3` and `β`.
#[derive(Debug, Clone, PartialEq)]
pub struct Rk4Propagation {
    pub energy: Option<f64>,
    pub norm: f64,
    pub states: [Vec<f64>; 3],
}

impl<L: QuantumLabel> EffectiveHamiltonian<L> {
    /// Runs `f` inside a `precompute` bracket and fills in the statistics.
    fn bracketed<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<KrylovOutcome<T>, KrylovError>,
    ) -> Result<SolverReport<T>, KrylovError> {
        let start = Instant::now();
        self.engine.seq.reset_nflop();
        self.precompute();
        let outcome = f(self);
        self.post_precompute();
        let outcome = outcome?;
        Ok(SolverReport {
            result: outcome.value,
            iterations: outcome.iterations,
            nflop: self.engine.take_nflop(),
            seconds: start.elapsed().as_secs_f64(),
            converged: outcome.converged,
        })
    }

    fn require_diag(&self, caller: &str) -> crate::arena::Handle {
        match self.diag {
            Some(handle) => handle,
            None => panic!("{caller} needs the diagonal; build the operator with compute_diag"),
        }
    }

    /// `⟨v|O|v⟩ / ‖v‖²` with one extra operator application.
    fn rayleigh_quotient(&mut self, v: &[f64], reduction: Reduction<'_>) -> f64 {
        let mark = self.arena.mark();
        let hv = self.arena.alloc(v.len());
        self.engine
            .apply_term(0, v, self.arena.get_mut(hv), 1.0, true, true);
        let norm = reduction.norm(v);
        let energy = reduction.dot(v, self.arena.get(hv)) / (norm * norm);
        self.arena.release_to(mark);
        energy
    }

    /// Lowest eigenpair by Davidson, preconditioned with the diagonal. The
    /// ket is the initial guess and receives the eigenvector.
    ///
    /// # Panics
    /// If the operator was built without its diagonal.
    pub fn eigs(&mut self, options: &IterativeOptions, reduction: Reduction<'_>) -> Result<SolverReport<f64>, KrylovError> {
        let diag = self.require_diag("eigs");
        let report = self.bracketed(|h| {
            let n = h.ket.len();
            davidson(
                &mut h.engine,
                Some(h.arena.get(diag)),
                MatMut::from_column_major_slice_mut(h.ket.data_mut(), n, 1),
                options,
                reduction,
            )
        })?;
        let energy = report.result[0];
        log::info!(
            "eigs: E = {energy:.12} after {} iterations ({:.3}s)",
            report.iterations,
            report.seconds
        );
        Ok(SolverReport {
            result: energy,
            iterations: report.iterations,
            nflop: report.nflop,
            seconds: report.seconds,
            converged: report.converged,
        })
    }

    /// Solves `(O − const_e) · bra = ket` by MINRES, starting from the
    /// current bra.
    ///
    /// # Returns
    /// `⟨bra|ket⟩`.
    pub fn inverse_multiply(
        &mut self,
        const_e: f64,
        options: &IterativeOptions,
        reduction: Reduction<'_>,
    ) -> Result<SolverReport<f64>, KrylovError> {
        check_len(self.ket.len(), self.bra.len())?;
        self.bracketed(|h| {
            minres(
                &mut h.engine,
                h.bra.data_mut(),
                h.ket.data(),
                -const_e,
                options,
                reduction,
            )
        })
    }

    /// Green's function `⟨ket|(ω + const_e + O + iη)⁻¹|ket⟩` through the
    /// normal equations.
    ///
    /// The imaginary part solves `((O + const_e + ω)² + η²) · bra = −η · ket`
    /// by conjugate gradients, preconditioned with `(diag + const_e + ω)² + η²`;
    /// the bra receives that solution. The real part follows as
    /// `⟨ket|−(O + const_e + ω) · bra / η⟩` and the vector itself is written
    /// to `real_bra` when given.
    ///
    /// `n_harmonic_projection` selects the CG flavour: 0 for plain CG, `n > 0`
    /// for CG deflated by `n` harmonic Ritz vectors computed up front, `n < 0`
    /// for CG alternating with harmonic Davidson on `|n|` vectors.
    #[allow(clippy::too_many_arguments)]
    pub fn greens_function(
        &mut self,
        const_e: f64,
        omega: f64,
        eta: f64,
        n_harmonic_projection: i32,
        real_bra: Option<&mut [f64]>,
        options: &IterativeOptions,
        reduction: Reduction<'_>,
    ) -> Result<SolverReport<c64>, KrylovError> {
        assert!(eta != 0.0, "greens_function needs a nonzero broadening");
        let diag = self.require_diag("greens_function");
        let n = self.ket.len();
        check_len(n, self.bra.len())?;
        if let Some(real) = &real_bra {
            check_len(n, real.len())?;
        }
        let shift = const_e + omega;

        let start = Instant::now();
        self.engine.seq.reset_nflop();
        let mark = self.arena.mark();
        let aa = self.arena.alloc(n);
        {
            let (d, a) = self.arena.get2_mut(diag, aa);
            zip!(col_mut(a), col(d)).for_each(|unzip!(a, d)| *a = (*d + shift) * (*d + shift) + eta * eta);
        }
        let rhs = self.arena.alloc_copy(self.ket.data());
        vector::scale(-eta, self.arena.get_mut(rhs));
        let tmp = self.arena.alloc(n);

        self.precompute();
        let solved = self.solve_shifted_square(shift, eta, [aa, rhs, tmp], n_harmonic_projection, options, reduction);
        let (g, iterations, converged) = match solved {
            Ok((imag, iterations, converged)) => {
                let rbra = self.arena.alloc(n);
                self.engine
                    .apply_term(0, self.bra.data(), self.arena.get_mut(rbra), -1.0 / eta, true, true);
                vector::axpy(-shift / eta, self.bra.data(), self.arena.get_mut(rbra));
                let real = reduction.dot(self.arena.get(rbra), self.ket.data());
                if let Some(out) = real_bra {
                    out.copy_from_slice(self.arena.get(rbra));
                }
                (c64::new(real, imag), iterations, converged)
            }
            Err(e) => {
                self.post_precompute();
                self.arena.release_to(mark);
                return Err(e);
            }
        };
        self.post_precompute();
        self.arena.release_to(mark);

        log::info!(
            "greens_function: omega = {omega:.6} G = ({:.10}, {:.10}) after {iterations} iterations",
            g.re,
            g.im
        );
        Ok(SolverReport {
            result: g,
            iterations,
            nflop: self.engine.take_nflop(),
            seconds: start.elapsed().as_secs_f64(),
            converged,
        })
    }

    /// The CG stage of [`EffectiveHamiltonian::greens_function`] on the
    /// arena buffers `[preconditioner, rhs, scratch]`. Returns the imaginary
    /// part, the operator applications and convergence.
    fn solve_shifted_square(
        &mut self,
        shift: f64,
        eta: f64,
        buffers: [crate::arena::Handle; 3],
        n_harmonic_projection: i32,
        options: &IterativeOptions,
        reduction: Reduction<'_>,
    ) -> Result<(f64, usize, bool), KrylovError> {
        let [precond, b, tmp] = self.arena.get_many_mut(buffers);
        let (precond, b) = (Some(&*precond), &*b);
        let mut op = ShiftedSquare::new(&mut self.engine, shift, eta, tmp);
        let x = self.bra.data_mut();
        let (cg, extra) = match n_harmonic_projection {
            0 => (conjugate_gradient(&mut op, precond, x, b, options, reduction)?, 0),
            np if np > 0 => {
                let first: &[f64] = if reduction.norm(x) > 0.0 { &*x } else { self.ket.data() };
                let mut rng = StdRng::seed_from_u64(PROJECTION_SEED);
                let mut basis = Mat::from_fn(first.len(), np as usize, |i, j| {
                    if j == 0 { first[i] } else { rng.random::<f64>() - 0.5 }
                });
                let davidson_options = options.with_conv_thrd(PROJECTION_CONV_THRD);
                let projection =
                    harmonic_davidson(&mut op, precond, basis.as_mut(), 0.0, false, &davidson_options, reduction)?;
                log::debug!(
                    "harmonic projection: {} Ritz values in {} iterations",
                    projection.value.len(),
                    projection.iterations
                );
                let cg = deflated_conjugate_gradient(&mut op, precond, x, b, basis.as_ref(), options, reduction)?;
                (cg, projection.iterations)
            }
            np => {
                let projected =
                    davidson_projected_deflated_cg(&mut op, precond, x, b, np.unsigned_abs() as usize, options, reduction)?;
                (projected.cg, projected.davidson_iterations)
            }
        };
        Ok((cg.value / -eta, cg.iterations + extra, cg.converged))
    }

    /// Green's function `⟨ket|(O + const_e + ω + iη)⁻¹|ket⟩` by GCROT(m,k) in
    /// complex arithmetic, preconditioned with the shifted diagonal.
    ///
    /// The solution's imaginary part is left in the bra and its real part in
    /// `real_bra` when given; both also seed the initial guess.
    #[allow(clippy::too_many_arguments)]
    pub fn greens_function_gcrot(
        &mut self,
        const_e: f64,
        omega: f64,
        eta: f64,
        m: usize,
        k: usize,
        mut real_bra: Option<&mut [f64]>,
        options: &IterativeOptions,
        reduction: Reduction<'_>,
    ) -> Result<SolverReport<c64>, KrylovError> {
        let diag = self.require_diag("greens_function_gcrot");
        let n = self.ket.len();
        check_len(n, self.bra.len())?;
        let z = c64::new(const_e + omega, eta);
        let cdiag: Vec<c64> = self.arena.get(diag).iter().map(|&d| d + z).collect();
        let b: Vec<c64> = self.ket.data().iter().map(|&v| c64::new(v, 0.0)).collect();
        let mut x: Vec<c64> = match &real_bra {
            Some(real) => {
                check_len(n, real.len())?;
                real.iter()
                    .zip(self.bra.data())
                    .map(|(&re, &im)| c64::new(re, im))
                    .collect()
            }
            None => self.bra.data().iter().map(|&im| c64::new(0.0, im)).collect(),
        };

        let report = self.bracketed(|h| {
            let mark = h.arena.mark();
            let splits = [h.arena.alloc(n), h.arena.alloc(n), h.arena.alloc(n), h.arena.alloc(n)];
            let [xr, xi, yr, yi] = h.arena.get_many_mut(splits);
            let engine = &mut h.engine;
            let mut op = FnOperator::new(n, |input: &[c64], output: &mut [c64]| {
                zip!(col_mut(xr), col_mut(xi), col(input)).for_each(|unzip!(re, im, v)| {
                    *re = v.re;
                    *im = v.im;
                });
                vector::clear(yr);
                vector::clear(yi);
                engine.apply(xr, yr);
                engine.apply(xi, yi);
                zip!(col_mut(output), col(input), col(yr), col(yi))
                    .for_each(|unzip!(out, v, re, im)| *out += c64::new(*re, *im) + z * *v);
            });
            let outcome = gcrotmk(&mut op, Some(cdiag.as_slice()), &mut x, &b, m, k, options, reduction);
            h.arena.release_to(mark);
            outcome
        })?;

        for (bi, xi) in self.bra.data_mut().iter_mut().zip(&x) {
            *bi = xi.im;
        }
        if let Some(real) = real_bra.as_deref_mut() {
            for (ri, xi) in real.iter_mut().zip(&x) {
                *ri = xi.re;
            }
        }
        log::info!(
            "greens_function_gcrot: omega = {omega:.6} G = ({:.10}, {:.10}) after {} iterations",
            report.result.re,
            report.result.im,
            report.iterations
        );
        Ok(report)
    }

    /// `ket ← exp(β (O + const_e)) · ket` by the Krylov propagator, with the
    /// norm of the diagonal as the operator norm estimate.
    ///
    /// `iterations` counts operator applications, including the one spent on
    /// the energy.
    pub fn expo_apply(
        &mut self,
        beta: f64,
        const_e: f64,
        eval_energy: bool,
        options: &IterativeOptions,
        reduction: Reduction<'_>,
    ) -> Result<SolverReport<Propagation>, KrylovError> {
        let diag = self.require_diag("expo_apply");
        let anorm = vector::norm(self.arena.get(diag));
        let report = self.bracketed(|h| {
            let out = expo_apply(&mut h.engine, beta, anorm, h.ket.data_mut(), const_e, options, reduction)?;
            let energy = eval_energy.then(|| {
                let v = h.ket.data().to_vec();
                h.rayleigh_quotient(&v, reduction)
            });
            Ok(KrylovOutcome {
                value: Propagation {
                    energy,
                    norm: out.value,
                },
                iterations: out.iterations + usize::from(eval_energy),
                converged: out.converged,
            })
        })?;
        log::debug!("expo_apply: beta = {beta:.4e} norm = {:.12}", report.result.norm);
        Ok(report)
    }

    /// Returns `[ket, β · O · ket]`, the first RK4 stage of a step whose
    /// remaining stages run in another basis. The bra is left untouched.
    ///
    /// The stage carries no constant energy; it enters through the scaling
    /// `exp(β (i+1)/3 · const_e)` of the states in
    /// [`EffectiveHamiltonian::second_rk4_apply`].
    pub fn first_rk4_apply(&mut self, beta: f64) -> SolverReport<[Vec<f64>; 2]> {
        let start = Instant::now();
        self.engine.seq.reset_nflop();
        let mark = self.arena.mark();
        let hket = self.arena.alloc(self.bra.len());
        let buf = self.arena.get_mut(hket);
        self.engine.apply_term(0, self.ket.data(), buf, 1.0, true, false);
        vector::scale(beta, buf);
        let result = [self.ket.data().to_vec(), buf.to_vec()];
        self.arena.release_to(mark);
        SolverReport {
            result,
            iterations: 1,
            nflop: self.engine.take_nflop(),
            seconds: start.elapsed().as_secs_f64(),
            converged: true,
        }
    }

    /// One RK4 step `ket ← exp(β (O + const_e)) · ket`, also returning the
    /// states at `β/3`, `2β/3` and `β`.
    pub fn rk4_apply(
        &mut self,
        beta: f64,
        const_e: f64,
        eval_energy: bool,
        reduction: Reduction<'_>,
    ) -> Result<SolverReport<Rk4Propagation>, KrylovError> {
        self.rk4_step(beta, const_e, None, eval_energy, reduction)
    }

    /// The RK4 step given its first stage `hket = β O ket` (see
    /// [`EffectiveHamiltonian::first_rk4_apply`]).
    pub fn second_rk4_apply(
        &mut self,
        beta: f64,
        const_e: f64,
        hket: &[f64],
        eval_energy: bool,
        reduction: Reduction<'_>,
    ) -> Result<SolverReport<Rk4Propagation>, KrylovError> {
        self.rk4_step(beta, const_e, Some(hket), eval_energy, reduction)
    }

    fn rk4_step(
        &mut self,
        beta: f64,
        const_e: f64,
        first: Option<&[f64]>,
        eval_energy: bool,
        reduction: Reduction<'_>,
    ) -> Result<SolverReport<Rk4Propagation>, KrylovError> {
        let nmult = if first.is_some() { 3 } else { 4 };
        let report = self.bracketed(|h| {
            let n = h.ket.len();
            let mark = h.arena.mark();
            let buffers = [h.arena.alloc(n), h.arena.alloc(n), h.arena.alloc(n), h.arena.alloc(n), h.arena.alloc(n)];
            let [k0, k1, k2, k3, stage] = h.arena.get_many_mut(buffers);
            let mut k = [k0, k1, k2, k3];
            let states = rk4_stages(&mut h.engine, beta, h.ket.data(), first, &mut k, stage)
                .map(|()| rk4_combine(h.ket.data(), &k, beta, const_e));
            h.arena.release_to(mark);
            let states = states?;
            h.ket.data_mut().copy_from_slice(&states[2]);
            let norm = reduction.norm(&states[2]);
            let energy = eval_energy.then(|| h.rayleigh_quotient(&states[2], reduction));
            Ok(KrylovOutcome {
                value: Rk4Propagation { energy, norm, states },
                iterations: nmult + usize::from(eval_energy),
                converged: true,
            })
        })?;
        log::debug!("rk4_apply: beta = {beta:.4e} norm = {:.12}", report.result.norm);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effective::EffectiveOptions;
    use crate::sequencer::SeqMode;
    use crate::utils::spin_chain::{HeisenbergBond, exact_spectrum};

    fn opts() -> IterativeOptions {
        IterativeOptions::default().with_conv_thrd(1e-9)
    }

    #[test]
    fn test_eigs_matches_exact_ground_state() {
        let bond = HeisenbergBond::new(2, 3);
        let exact = exact_spectrum(5, 1).unwrap()[0];
        for mode in [SeqMode::None, SeqMode::Auto] {
            let mut h = bond.effective(1, EffectiveOptions::default().with_mode(mode), 21);
            let report = h.eigs(&opts(), Reduction::local()).unwrap();
            assert!(report.converged);
            assert!((report.result - exact).abs() < 1e-10, "{} vs {exact}", report.result);
            assert!(report.nflop > 0);
            assert!((h.ket().norm() - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    #[should_panic(expected = "eigs needs the diagonal")]
    fn test_eigs_without_diagonal_panics() {
        let bond = HeisenbergBond::new(1, 1);
        let mut h = bond.effective(0, EffectiveOptions::default().with_diag(false), 1);
        let _ = h.eigs(&opts(), Reduction::local());
    }

    #[test]
    fn test_inverse_multiply_solves_shifted_system() {
        let bond = HeisenbergBond::new(2, 2);
        let mut h = bond.effective(0, EffectiveOptions::default(), 8);
        let e = -3.0;
        let report = h.inverse_multiply(e, &opts(), Reduction::local()).unwrap();
        assert!(report.converged);
        let bra = h.bra().data().to_vec();
        let ket = h.ket().data().to_vec();
        let mut r = vec![0.0; bra.len()];
        h.apply(0, &bra, &mut r, 1.0, true);
        vector::axpy(-e, &bra, &mut r);
        vector::axpy(-1.0, &ket, &mut r);
        assert!(vector::norm(&r) < 1e-8);
        assert!((report.result - vector::dot(&bra, &ket)).abs() < 1e-12);
    }

    #[test]
    fn test_greens_function_flavours_agree_with_gcrot() {
        let bond = HeisenbergBond::new(2, 2);
        let (e, omega, eta) = (0.2, -0.5, 0.1);
        let mut values = Vec::new();
        for np in [0, 3, -2] {
            let mut h = bond.effective(0, EffectiveOptions::default(), 13);
            let mut real = vec![0.0; h.ket().len()];
            let report = h
                .greens_function(e, omega, eta, np, Some(&mut real), &opts(), Reduction::local())
                .unwrap();
            assert!(report.converged, "flavour {np}");
            // Resolvent identity for the imaginary part.
            let ibra = h.bra().data().to_vec();
            let ket = h.ket().data().to_vec();
            let mut lhs = vec![0.0; ibra.len()];
            let mut tmp = vec![0.0; ibra.len()];
            ShiftedSquare::new(h.as_linear_operator(), e + omega, eta, &mut tmp).apply(&ibra, &mut lhs);
            vector::axpy(eta, &ket, &mut lhs);
            assert!(vector::norm(&lhs) < 1e-7);
            assert!((report.result.re - vector::dot(&real, &ket)).abs() < 1e-12);
            values.push(report.result);
        }
        let mut h = bond.effective(0, EffectiveOptions::default(), 13);
        let direct = h
            .greens_function_gcrot(e, omega, eta, 10, 4, None, &opts(), Reduction::local())
            .unwrap();
        assert!(direct.converged);
        for g in values {
            assert!((g - direct.result).norm() < 1e-6, "{g} vs {}", direct.result);
        }
    }

    #[test]
    fn test_rk4_and_krylov_propagation_agree() {
        let bond = HeisenbergBond::new(2, 2);
        let beta = -0.05;
        let mut krylov = bond.effective(0, EffectiveOptions::default(), 17);
        let mut rk4 = bond.effective(0, EffectiveOptions::default().with_mode(SeqMode::Simple), 17);
        let ek = krylov
            .expo_apply(beta, 0.3, true, &IterativeOptions::default().with_conv_thrd(1e-12), Reduction::local())
            .unwrap();
        let er = rk4.rk4_apply(beta, 0.3, true, Reduction::local()).unwrap();
        assert_eq!(er.iterations, 5);
        let diff: f64 = krylov
            .ket()
            .data()
            .iter()
            .zip(rk4.ket().data())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        assert!(diff < 1e-7);
        assert!((ek.result.norm - er.result.norm).abs() < 1e-7);
        let (a, b) = (ek.result.energy.unwrap(), er.result.energy.unwrap());
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn test_first_and_second_rk4_compose_to_full_step() {
        let bond = HeisenbergBond::new(1, 2);
        let (beta, const_e) = (0.02, 0.4);
        let mut full = bond.effective(1, EffectiveOptions::default(), 23);
        let mut split = bond.effective(1, EffectiveOptions::default(), 23);
        let whole = full.rk4_apply(beta, const_e, false, Reduction::local()).unwrap();

        let marker: Vec<f64> = (0..split.bra().len()).map(|i| i as f64 - 0.5).collect();
        split.bra_mut().data_mut().copy_from_slice(&marker);
        let depth = split.arena.depth();
        let first = split.first_rk4_apply(beta);
        assert!(first.nflop > 0);
        assert_eq!(split.bra().data(), marker.as_slice());
        assert_eq!(split.arena.depth(), depth);
        let [ket, hket] = first.result;
        assert_eq!(&ket, split.ket().data());
        let mut expected = vec![0.0; ket.len()];
        split.apply(0, &ket, &mut expected, beta, true);
        for (a, b) in hket.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-14);
        }

        let second = split
            .second_rk4_apply(beta, const_e, &hket, false, Reduction::local())
            .unwrap();
        assert_eq!(second.iterations, 3);
        assert_eq!(second.result.energy, None);
        for (a, b) in whole.result.states.iter().zip(&second.result.states) {
            let diff = a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max);
            assert!(diff < 1e-14);
        }
    }
}
