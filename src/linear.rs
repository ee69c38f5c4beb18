//! Weighted sums `Σ c_i H_i` of effective operators.
//!
//! A [`LinearEffectiveHamiltonian`] borrows its constituents and never
//! deallocates them. All constituents act on vectors of the same length; the
//! first one supplies the ket that [`LinearEffectiveHamiltonian::eigs`]
//! refines.

use crate::algorithms::IterativeOptions;
use crate::algorithms::davidson::davidson;
use crate::effective::EffectiveHamiltonian;
use crate::error::KrylovError;
use crate::matrix::LinearOperator;
use crate::quantum::QuantumLabel;
use crate::solvers::SolverReport;
use crate::vector::{self, Reduction};
use faer::MatMut;
use std::time::Instant;

pub struct LinearEffectiveHamiltonian<'h, L: QuantumLabel> {
    terms: Vec<(&'h mut EffectiveHamiltonian<L>, f64)>,
}

impl<'h, L: QuantumLabel> LinearEffectiveHamiltonian<'h, L> {
    /// `Σ c_i H_i` from `(H_i, c_i)` pairs.
    ///
    /// # Panics
    /// If there are no terms, or the constituents disagree on the vector
    /// length.
    pub fn combine(terms: impl IntoIterator<Item = (&'h mut EffectiveHamiltonian<L>, f64)>) -> Self {
        let terms: Vec<_> = terms.into_iter().collect();
        assert!(!terms.is_empty(), "a linear combination needs at least one term");
        let n = terms[0].0.ket().len();
        for (h, _) in &terms {
            assert_eq!(h.ket().len(), n, "constituents act on different spaces");
            assert_eq!(h.bra().len(), n, "constituents act on different spaces");
        }
        Self { terms }
    }

    pub fn single(h: &'h mut EffectiveHamiltonian<L>) -> Self {
        Self::combine([(h, 1.0)])
    }

    pub fn coefficients(&self) -> impl Iterator<Item = f64> + '_ {
        self.terms.iter().map(|(_, c)| *c)
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn scaled(mut self, d: f64) -> Self {
        for (_, c) in &mut self.terms {
            *c *= d;
        }
        self
    }

    pub fn negated(self) -> Self {
        self.scaled(-1.0)
    }

    pub fn plus(mut self, other: Self) -> Self {
        let n = self.dim();
        assert_eq!(other.dim(), n, "constituents act on different spaces");
        self.terms.extend(other.terms);
        self
    }

    pub fn minus(self, other: Self) -> Self {
        self.plus(other.negated())
    }

    fn dim(&self) -> usize {
        self.terms[0].0.ket().len()
    }

    /// `Σ c_i diag(H_i)`.
    ///
    /// # Panics
    /// If a constituent was built without its diagonal.
    pub fn diag(&self) -> Vec<f64> {
        let mut diag = vec![0.0; self.dim()];
        for (h, c) in &self.terms {
            let Some(d) = h.diag() else {
                panic!("every constituent needs its diagonal");
            };
            vector::axpy(*c, d, &mut diag);
        }
        diag
    }

    /// Lowest eigenpair of the combination by Davidson, starting from and
    /// writing into the first constituent's ket.
    pub fn eigs(&mut self, options: &IterativeOptions, reduction: Reduction<'_>) -> Result<SolverReport<f64>, KrylovError> {
        let start = Instant::now();
        let diag = self.diag();
        let mut ket = self.terms[0].0.ket().data().to_vec();
        for (h, _) in &mut self.terms {
            h.engine.seq.reset_nflop();
            h.precompute();
        }
        let n = ket.len();
        let guess = MatMut::from_column_major_slice_mut(&mut ket, n, 1);
        let outcome = davidson(self, Some(diag.as_slice()), guess, options, reduction);
        let mut nflop = 0;
        for (h, _) in &mut self.terms {
            h.post_precompute();
            nflop += h.engine.take_nflop();
        }
        let outcome = outcome?;
        self.terms[0].0.ket_mut().data_mut().copy_from_slice(&ket);
        log::info!(
            "linear eigs: E = {:.12} over {} terms after {} iterations",
            outcome.value[0],
            self.terms.len(),
            outcome.iterations
        );
        Ok(SolverReport {
            result: outcome.value[0],
            iterations: outcome.iterations,
            nflop,
            seconds: start.elapsed().as_secs_f64(),
            converged: outcome.converged,
        })
    }
}

impl<L: QuantumLabel> LinearOperator<f64> for LinearEffectiveHamiltonian<'_, L> {
    fn nrows(&self) -> usize {
        self.dim()
    }

    fn ncols(&self) -> usize {
        self.dim()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        for (h, c) in &mut self.terms {
            h.engine.apply_term(0, input, output, *c, true, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effective::EffectiveOptions;
    use crate::utils::spin_chain::{HeisenbergBond, exact_spectrum};

    #[test]
    fn test_combination_applies_weighted_sum() {
        let bond = HeisenbergBond::new(2, 2);
        let mut a = bond.effective(0, EffectiveOptions::default(), 3);
        let mut b = bond.effective(0, EffectiveOptions::default(), 4);
        let x = a.ket().data().to_vec();
        let mut single = vec![0.0; x.len()];
        a.apply(0, &x, &mut single, 1.0, true);

        let mut combo = LinearEffectiveHamiltonian::single(&mut a)
            .scaled(2.0)
            .minus(LinearEffectiveHamiltonian::single(&mut b).scaled(0.5));
        assert_eq!(combo.coefficients().collect::<Vec<_>>(), vec![2.0, -0.5]);
        let mut y = vec![0.0; x.len()];
        combo.apply(&x, &mut y);
        for (yi, si) in y.iter().zip(&single) {
            assert!((yi - 1.5 * si).abs() < 1e-13);
        }
        let diag = combo.diag();
        let expected: Vec<f64> = a_diag_scaled(&bond, 1.5);
        for (d, e) in diag.iter().zip(&expected) {
            assert!((d - e).abs() < 1e-13);
        }
    }

    fn a_diag_scaled(bond: &HeisenbergBond, c: f64) -> Vec<f64> {
        let h = bond.effective(0, EffectiveOptions::default(), 3);
        h.diag().unwrap().iter().map(|d| c * d).collect()
    }

    #[test]
    fn test_eigs_of_scaled_sum() {
        let bond = HeisenbergBond::new(2, 3);
        let mut a = bond.effective(1, EffectiveOptions::default(), 5);
        let mut b = bond.effective(1, EffectiveOptions::default(), 6);
        let mut combo = LinearEffectiveHamiltonian::combine([(&mut a, 0.25), (&mut b, 0.75)]);
        let report = combo
            .eigs(&IterativeOptions::default().with_conv_thrd(1e-9), Reduction::local())
            .unwrap();
        let exact = exact_spectrum(5, 1).unwrap()[0];
        assert!(report.converged);
        assert!((report.result - exact).abs() < 1e-10);
        drop(combo);
        assert!((a.ket().norm() - 1.0).abs() < 1e-10);
    }

    #[test]
    #[should_panic(expected = "different spaces")]
    fn test_mismatched_spaces_panic() {
        let small = HeisenbergBond::new(1, 1);
        let large = HeisenbergBond::new(2, 2);
        let mut a = small.effective(0, EffectiveOptions::default(), 1);
        let mut b = large.effective(0, EffectiveOptions::default(), 1);
        let _ = LinearEffectiveHamiltonian::combine([(&mut a, 1.0), (&mut b, 1.0)]);
    }
}
