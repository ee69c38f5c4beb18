//! The effective Hamiltonian of one bond of a DMRG sweep.
//!
//! [`EffectiveHamiltonian`] binds an [`OperatorTensor`] (symbolic expressions
//! plus the left and right block operator tables) to a bra and a ket vector
//! and turns it into a callable operator on the ket's flat storage. The block
//! connectivity is derived once at construction, together with the optional
//! diagonal used as a preconditioner.
//!
//! Lifecycle: `new → {precompute → solver calls → post_precompute}* →
//! deallocate`. The Krylov entry points (`eigs`, `greens_function`, ...) live
//! in [`crate::solvers`] and bracket themselves with `precompute` /
//! `post_precompute`.
//!
//! # Distributed operators
//!
//! With a [`ParallelRule`], every process holds a share of the expression.
//! `apply` then contracts the local share into a scratch vector and
//! all-reduces it, so every process ends up with the full product. Terms whose
//! rule marks them as numbers are evaluated on their owner only and summed at
//! the end of [`EffectiveHamiltonian::expect`].

use crate::arena::{Handle, StackArena};
use crate::comm::{ParallelOpKind, ParallelRule};
use crate::contract::{BlockContractor, Contractor, PartialRoute, PartialTarget, partial_sub_label};
use crate::expr::{OpElement, OpExpr, OpName, OperatorTensor, ProductOp, SubLabel, uniq_sub_labels};
use crate::matrix::LinearOperator;
use crate::quantum::{QuantumLabel, StateInfo};
use crate::sector::{ConnectionInfo, OperatorInfos, SectorLayout, SparseVector, SparseVectorGroup};
use crate::sequencer::{Applicable, SeqMode, Sequencer, TaskPlan, applicable_for};
use crate::solvers::SolverReport;
use crate::vector;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

/// Construction settings of an [`EffectiveHamiltonian`].
#[derive(Debug, Clone)]
pub struct EffectiveOptions<L: QuantumLabel> {
    pub mode: SeqMode,
    /// Whether to compute the diagonal. Requires identical bra and ket layouts.
    pub compute_diag: bool,
    pub contractor: Arc<dyn Contractor<L>>,
    pub para_rule: Option<Arc<dyn ParallelRule<L>>>,
}

impl<L: QuantumLabel> Default for EffectiveOptions<L> {
    fn default() -> Self {
        Self {
            mode: SeqMode::None,
            compute_diag: true,
            contractor: Arc::new(BlockContractor),
            para_rule: None,
        }
    }
}

impl<L: QuantumLabel> EffectiveOptions<L> {
    pub fn with_mode(mut self, mode: SeqMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_diag(mut self, compute_diag: bool) -> Self {
        self.compute_diag = compute_diag;
        self
    }

    pub fn with_para_rule(mut self, rule: Arc<dyn ParallelRule<L>>) -> Self {
        self.para_rule = Some(rule);
        self
    }
}

/// Flavour of the vectors returned by
/// [`EffectiveHamiltonian::perturbative_noise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseKind {
    /// One vector per reachable label, summed over all operators.
    Reduced,
    /// One vector per (unapplied operator, reachable label) pair.
    Unreduced,
}

/// The operator part of an [`EffectiveHamiltonian`], separate from the
/// vectors so that solvers can borrow both at once.
#[derive(Debug)]
pub(crate) struct Engine<L: QuantumLabel> {
    pub(crate) op: OperatorTensor<L>,
    cinfo: ConnectionInfo<L>,
    contractor: Arc<dyn Contractor<L>>,
    applicable: Box<dyn Applicable>,
    pub(crate) seq: Sequencer,
    pub(crate) para_rule: Option<Arc<dyn ParallelRule<L>>>,
    /// Whether term 0 is split across processes and needs an all-reduce.
    distributed: bool,
    ket_layout: Arc<SectorLayout<L>>,
    bra_layout: Arc<SectorLayout<L>>,
    partial: Vec<f64>,
}

impl<L: QuantumLabel> Engine<L> {
    /// The tasks of one application of term `idx`.
    fn plan(&self, idx: usize) -> TaskPlan {
        let mut plan = TaskPlan::default();
        self.contractor.tensor_product_multiply(
            &self.op.mat[idx],
            &self.op.lopt,
            &self.op.ropt,
            &self.cinfo,
            &self.ket_layout,
            &self.bra_layout,
            &mut |task| plan.push(task),
        );
        plan
    }

    fn contract(&mut self, idx: usize, input: &[f64], output: &mut [f64], factor: f64, replay: bool) {
        if replay && idx == 0 {
            if let Some(plan) = self.applicable.recorded() {
                self.seq.perform(plan, input, output, factor);
                return;
            }
        }
        if self.seq.mode() == SeqMode::None {
            let seq = &mut self.seq;
            self.contractor.tensor_product_multiply(
                &self.op.mat[idx],
                &self.op.lopt,
                &self.op.ropt,
                &self.cinfo,
                &self.ket_layout,
                &self.bra_layout,
                &mut |task| seq.execute(&task, input, output, factor),
            );
        } else {
            let plan = self.plan(idx);
            self.seq.perform(&plan, input, output, factor);
        }
    }

    /// `output += factor · O[idx] · input`. A recorded plan is replayed for
    /// term 0 when `replay` is set.
    pub(crate) fn apply_term(
        &mut self,
        idx: usize,
        input: &[f64],
        output: &mut [f64],
        factor: f64,
        all_reduce: bool,
        replay: bool,
    ) {
        assert_eq!(input.len(), self.ket_layout.size(), "input does not match the ket layout");
        assert_eq!(output.len(), self.bra_layout.size(), "output does not match the bra layout");
        let reduce = all_reduce && (idx != 0 || self.distributed);
        let Some(rule) = self.para_rule.clone().filter(|_| reduce) else {
            self.contract(idx, input, output, factor, replay);
            return;
        };
        let mut partial = std::mem::take(&mut self.partial);
        partial.clear();
        partial.resize(output.len(), 0.0);
        self.contract(idx, input, &mut partial, factor, replay);
        rule.comm().allreduce_sum(&mut partial);
        vector::axpy(1.0, &partial, output);
        self.partial = partial;
    }

    pub(crate) fn is_root(&self) -> bool {
        self.para_rule.as_ref().is_none_or(|r| r.is_root())
    }

    /// Flops since the last reset, summed onto the root process. Resets the
    /// counter.
    pub(crate) fn take_nflop(&mut self) -> u64 {
        let mut nflop = [self.seq.cumulative_nflop()];
        if let Some(rule) = &self.para_rule {
            let comm = rule.comm();
            comm.reduce_sum_u64(&mut nflop, comm.root());
        }
        self.seq.reset_nflop();
        nflop[0]
    }
}

impl<L: QuantumLabel> LinearOperator<f64> for Engine<L> {
    fn nrows(&self) -> usize {
        self.bra_layout.size()
    }

    fn ncols(&self) -> usize {
        self.ket_layout.size()
    }

    fn apply(&mut self, input: &[f64], output: &mut [f64]) {
        self.apply_term(0, input, output, 1.0, true, true);
    }
}

/// Matrix-free effective Hamiltonian of one bond.
#[derive(Debug)]
pub struct EffectiveHamiltonian<L: QuantumLabel> {
    pub(crate) engine: Engine<L>,
    pub(crate) bra: SparseVector<L>,
    pub(crate) ket: SparseVector<L>,
    pub(crate) arena: StackArena<f64>,
    pub(crate) diag: Option<Handle>,
    left_infos: OperatorInfos<L>,
    right_infos: OperatorInfos<L>,
    opdq: L,
    precomputed: bool,
}

impl<L: QuantumLabel> EffectiveHamiltonian<L> {
    /// Builds the operator for `op` between `bra` and `ket`.
    ///
    /// `hop` is the element whose label every computed term must carry; the
    /// bra label must be reachable from the ket label through it.
    ///
    /// # Panics
    /// If the labels do not match, if `op` has no terms, or if a diagonal is
    /// requested for different bra and ket layouts.
    pub fn new(
        left_infos: OperatorInfos<L>,
        right_infos: OperatorInfos<L>,
        op: OperatorTensor<L>,
        bra: SparseVector<L>,
        ket: SparseVector<L>,
        hop: &OpElement<L>,
        options: EffectiveOptions<L>,
    ) -> Self {
        assert!(!op.is_empty(), "effective operator without terms");
        let opdq = hop.q_label;
        assert!(
            ket.delta().fuse(opdq).contains(&bra.delta()),
            "bra label {:?} is not reachable from ket label {:?} through {:?}",
            bra.delta(),
            ket.delta(),
            opdq
        );
        if options.compute_diag {
            assert_eq!(bra.layout(), ket.layout(), "a diagonal needs identical bra and ket layouts");
        }

        // The identity connection is always built so that a constant shift can
        // be folded into the first term.
        let mut subs = uniq_sub_labels(&op.mat);
        let identity = SubLabel {
            conj: 0,
            left: L::vacuum(),
            right: L::vacuum(),
        };
        if !subs.contains(&identity) {
            subs.push(identity);
        }

        let distributed = options
            .para_rule
            .as_ref()
            .is_some_and(|r| r.property(hop).kind != ParallelOpKind::Repeated);
        let mut arena = StackArena::new();
        let diag = options.compute_diag.then(|| {
            let handle = arena.alloc(ket.len());
            let dinfo = ConnectionInfo::initialize_diag(ket.layout(), &subs, &left_infos, &right_infos);
            let buf = arena.get_mut(handle);
            let nflop = options.contractor.tensor_product_diagonal(
                &op.mat[0],
                &op.lopt,
                &op.ropt,
                &dinfo,
                ket.layout(),
                buf,
            );
            if let Some(rule) = options.para_rule.as_ref().filter(|_| distributed) {
                rule.comm().allreduce_sum(buf);
            }
            log::debug!("diagonal of {} entries: {nflop} flops", buf.len());
            handle
        });

        let cinfo = ConnectionInfo::initialize_wfn(ket.layout(), bra.layout(), &subs, &left_infos, &right_infos);
        log::debug!(
            "effective operator: {} terms, {} sub-labels, {} block connections",
            op.len(),
            subs.len(),
            cinfo.len()
        );
        let engine = Engine {
            op,
            cinfo,
            contractor: options.contractor,
            applicable: applicable_for(options.mode),
            seq: Sequencer::new(options.mode),
            para_rule: options.para_rule,
            distributed,
            ket_layout: Arc::clone(ket.layout()),
            bra_layout: Arc::clone(bra.layout()),
            partial: Vec::new(),
        };
        Self {
            engine,
            bra,
            ket,
            arena,
            diag,
            left_infos,
            right_infos,
            opdq,
            precomputed: false,
        }
    }

    pub fn ket(&self) -> &SparseVector<L> {
        &self.ket
    }

    pub fn ket_mut(&mut self) -> &mut SparseVector<L> {
        &mut self.ket
    }

    pub fn bra(&self) -> &SparseVector<L> {
        &self.bra
    }

    pub fn bra_mut(&mut self) -> &mut SparseVector<L> {
        &mut self.bra
    }

    pub fn diag(&self) -> Option<&[f64]> {
        self.diag.map(|h| self.arena.get(h))
    }

    pub fn operator(&self) -> &OperatorTensor<L> {
        &self.engine.op
    }

    pub fn mode(&self) -> SeqMode {
        self.engine.seq.mode()
    }

    /// The operator as a plain [`LinearOperator`] (term 0, all-reduced).
    pub fn as_linear_operator(&mut self) -> &mut dyn LinearOperator<f64> {
        &mut self.engine
    }

    /// MPO bond dimension of the first term.
    pub fn bond_dimension(&self) -> usize {
        self.engine.op.mat[0].bond_dimension()
    }

    /// `output += factor · O[idx] · input` on flat storage.
    ///
    /// With `all_reduce == false` the result is the local share of a
    /// distributed operator and the caller has to reduce it.
    ///
    /// # Panics
    /// If the slice lengths do not match the ket and bra layouts.
    pub fn apply(&mut self, idx: usize, input: &[f64], output: &mut [f64], factor: f64, all_reduce: bool) {
        self.engine.apply_term(idx, input, output, factor, all_reduce, true);
    }

    /// Records the task list of term 0 for replay, when the scheduling mode
    /// asks for it.
    pub fn precompute(&mut self) {
        assert!(!self.precomputed, "precompute called twice without post_precompute");
        self.precomputed = true;
        if self.engine.applicable.records() {
            let plan = self.engine.plan(0);
            log::debug!(
                "{:?}: recorded {} tasks, {} flops per application",
                self.engine.seq.mode(),
                plan.len(),
                plan.nflop()
            );
            self.engine.seq.prepare(&plan);
            self.engine.applicable.store(plan);
        }
    }

    pub fn post_precompute(&mut self) {
        assert!(self.precomputed, "post_precompute without precompute");
        self.precomputed = false;
        if self.engine.applicable.records() {
            self.engine.applicable.clear();
            self.engine.seq.deallocate();
        }
    }

    /// Adds `const_e · (I ⊗ I)` to term 0 and returns the expression to
    /// restore. A distributed term receives the shift on the root only.
    fn fold_energy(&mut self, const_e: f64) -> Option<OpExpr<L>> {
        if const_e == 0.0 || (self.engine.distributed && !self.engine.is_root()) {
            return None;
        }
        let expr = std::mem::replace(&mut self.engine.op.mat[0], OpExpr::Zero);
        self.engine.op.mat[0] = expr.clone().plus(OpExpr::identity_product(const_e));
        Some(expr)
    }

    fn restore(&mut self, saved: Option<OpExpr<L>>) {
        if let Some(expr) = saved {
            self.engine.op.mat[0] = expr;
        }
    }

    /// `bra = (O + const_e) · ket`.
    ///
    /// # Returns
    /// `‖bra‖`.
    pub fn multiply(&mut self, const_e: f64) -> SolverReport<f64> {
        let start = Instant::now();
        self.engine.seq.reset_nflop();
        self.bra.clear();
        let saved = self.fold_energy(const_e);
        self.engine
            .apply_term(0, self.ket.data(), self.bra.data_mut(), 1.0, true, false);
        self.restore(saved);
        let norm = self.bra.norm();
        SolverReport {
            result: norm,
            iterations: 1,
            nflop: self.engine.take_nflop(),
            seconds: start.elapsed().as_secs_f64(),
            converged: true,
        }
    }

    /// `⟨bra|O_k|ket⟩` for every top-level term `k`, with `const_e` added to
    /// the first one.
    ///
    /// Terms named `Zero` are skipped; terms whose label differs from the
    /// operator's are reported as exactly 0.
    pub fn expect(&mut self, const_e: f64) -> SolverReport<Vec<(OpElement<L>, f64)>> {
        let start = Instant::now();
        self.engine.seq.reset_nflop();
        let saved = self.fold_energy(const_e);
        let replay = saved.is_none();

        let nterms = self.engine.op.len();
        let mut expectations = Vec::with_capacity(nterms);
        let mut numbers = Vec::new();
        let mut number_idx = Vec::new();
        let mark = self.arena.mark();
        let ktmp = self.arena.alloc(self.bra.len());
        for i in 0..nterms {
            let dop = self.engine.op.dops[i].clone();
            if dop.name == OpName::Zero {
                continue;
            }
            if dop.q_label != self.opdq {
                expectations.push((dop, 0.0));
                continue;
            }
            let kind = self.engine.para_rule.as_ref().map(|r| (r.property(&dop).kind, r.own(&dop)));
            let value = match kind {
                Some((ParallelOpKind::Number, own)) => {
                    let r = if own {
                        let buf = self.arena.get_mut(ktmp);
                        vector::clear(buf);
                        self.engine.apply_term(i, self.ket.data(), buf, 1.0, false, replay);
                        vector::dot(self.arena.get(ktmp), self.bra.data())
                    } else {
                        0.0
                    };
                    numbers.push(r);
                    number_idx.push(expectations.len());
                    r
                }
                other => {
                    let distributed = !matches!(other, Some((ParallelOpKind::Repeated, _)));
                    let buf = self.arena.get_mut(ktmp);
                    vector::clear(buf);
                    self.engine.apply_term(i, self.ket.data(), buf, 1.0, distributed, replay);
                    vector::dot(self.arena.get(ktmp), self.bra.data())
                }
            };
            expectations.push((dop, value));
        }
        self.arena.release_to(mark);
        self.restore(saved);

        if let Some(rule) = self.engine.para_rule.as_ref().filter(|_| !numbers.is_empty()) {
            rule.comm().allreduce_sum(&mut numbers);
            for (&i, &v) in number_idx.iter().zip(&numbers) {
                expectations[i].1 = v;
            }
        }
        SolverReport {
            result: expectations,
            iterations: 1,
            nflop: self.engine.take_nflop(),
            seconds: start.elapsed().as_secs_f64(),
            converged: true,
        }
    }

    /// Candidate vectors for subspace enlargement.
    ///
    /// Applies only one side of every product of term 0 to the ket (the right
    /// side when `trace_right`) and collects the results in new wavefunctions
    /// over `left_basis ⊗ right_basis`, one per label reachable from the ket
    /// label (or one per pair of unapplied operator and label for
    /// [`NoiseKind::Unreduced`]). The basis on the unapplied side must be the
    /// ket's; the operator infos of the applied side must cover its basis.
    ///
    /// With a parallel rule, the reachable labels are gathered from all
    /// processes and the vectors are summed onto the root.
    ///
    /// # Panics
    /// For [`NoiseKind::Unreduced`] on more than one process.
    pub fn perturbative_noise(
        &mut self,
        trace_right: bool,
        left_basis: &StateInfo<L>,
        right_basis: &StateInfo<L>,
        kind: NoiseKind,
    ) -> SolverReport<SparseVectorGroup<L>> {
        let start = Instant::now();
        self.engine.seq.reset_nflop();
        if kind == NoiseKind::Unreduced {
            assert!(
                self.engine
                    .para_rule
                    .as_ref()
                    .is_none_or(|r| r.comm().size() == 1),
                "unreduced noise is only available on a single process"
            );
        }

        let ket_delta = self.ket.delta();
        let mut subs = BTreeSet::new();
        let mut labels = BTreeSet::new();
        let mut pairs = BTreeSet::new();
        self.engine.op.mat[0].for_each_product(&mut |term| {
            let sub = partial_sub_label(&term, trace_right);
            let (kept, delta) = if trace_right {
                (term.left, sub.right_delta())
            } else {
                (term.right, sub.left_delta())
            };
            subs.insert(sub);
            for q in ket_delta.fuse(delta) {
                labels.insert(q);
                pairs.insert((kept_element(kept), q));
            }
        });
        if let Some(rule) = &self.engine.para_rule {
            let raw: Vec<i64> = labels.iter().map(|q| q.to_raw()).collect();
            labels = rule
                .comm()
                .allgather_i64(&raw)
                .into_iter()
                .map(L::from_raw)
                .collect();
        }
        let subs: Vec<SubLabel<L>> = subs.into_iter().collect();

        let layout_of = |q: L| Arc::new(SectorLayout::wavefunction(left_basis, right_basis, q));
        let mut targets = Vec::new();
        let route: Box<PartialRoute<'_, L>> = match kind {
            NoiseKind::Reduced => {
                let mut index = BTreeMap::new();
                for q in labels {
                    let layout = layout_of(q);
                    if layout.size() > 0 {
                        index.insert(q, targets.len());
                        targets.push(layout);
                    }
                }
                Box::new(move |_: ProductOp<'_, L>, q: L| index.get(&q).copied())
            }
            NoiseKind::Unreduced => {
                let mut index = BTreeMap::new();
                for (kept, q) in pairs {
                    let layout = layout_of(q);
                    if layout.size() > 0 {
                        index.insert((kept, q), targets.len());
                        targets.push(layout);
                    }
                }
                Box::new(move |kept: ProductOp<'_, L>, q: L| index.get(&(kept_element(kept), q)).copied())
            }
        };

        let targets: Vec<PartialTarget<L>> = targets
            .into_iter()
            .map(|layout| {
                let cinfo = ConnectionInfo::initialize_wfn(
                    self.ket.layout(),
                    &layout,
                    &subs,
                    &self.left_infos,
                    &self.right_infos,
                );
                PartialTarget { layout, cinfo }
            })
            .collect();
        let mut bases = Vec::with_capacity(targets.len());
        let mut total = 0;
        for target in &targets {
            bases.push(total);
            total += target.layout.size();
        }

        let mut group = SparseVectorGroup::zeros(targets.iter().map(|t| Arc::clone(&t.layout)).collect());
        let immediate = self.engine.seq.mode() == SeqMode::None;
        let mut plan = TaskPlan::default();
        {
            let Engine {
                op, contractor, seq, ..
            } = &mut self.engine;
            let ket = self.ket.data();
            let data = group.data_mut();
            contractor.tensor_product_partial_multiply(
                &op.mat[0],
                &op.lopt,
                &op.ropt,
                trace_right,
                self.ket.layout(),
                &targets,
                &*route,
                &mut |it, mut task| {
                    task.output = task.output.shifted(bases[it]);
                    if immediate {
                        seq.execute(&task, ket, data, 1.0);
                    } else {
                        plan.push(task);
                    }
                },
            );
            if !immediate {
                seq.perform(&plan, ket, data, 1.0);
            }
        }
        if let Some(rule) = self.engine.para_rule.as_ref().filter(|_| self.engine.distributed) {
            let comm = rule.comm();
            comm.reduce_sum(group.data_mut(), comm.root());
        }
        log::debug!(
            "perturbative noise: {} vectors, {} entries",
            group.len(),
            group.data().len()
        );
        SolverReport {
            result: group,
            iterations: 1,
            nflop: self.engine.take_nflop(),
            seconds: start.elapsed().as_secs_f64(),
            converged: true,
        }
    }

    /// Releases the diagonal, the connection tables and the expression, newest
    /// first, and hands back `(bra, ket)`.
    ///
    /// # Panics
    /// If scratch buffers are still allocated or a `precompute` is open.
    pub fn deallocate(mut self) -> (SparseVector<L>, SparseVector<L>) {
        assert!(!self.precomputed, "deallocate inside a precompute bracket");
        if let Some(handle) = self.diag.take() {
            self.arena.release(handle);
        }
        assert!(self.arena.is_empty(), "scratch buffers outlived the solver call");
        self.engine.cinfo.clear();
        self.right_infos.release();
        self.left_infos.release();
        self.engine.op.mat.clear();
        self.engine.op.dops.clear();
        (self.bra, self.ket)
    }
}

fn kept_element<L: QuantumLabel>(op: ProductOp<'_, L>) -> Option<OpElement<L>> {
    match op {
        ProductOp::Op(e) if !e.is_identity() => Some(e.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalCommunicator, SumMpoRule};
    use crate::quantum::SzLabel;
    use crate::utils::spin_chain::{HeisenbergBond, dense_hamiltonian};

    fn max_diff(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
    }

    /// Dense matrix of the operator in the wavefunction basis, column by column.
    fn materialize(h: &mut EffectiveHamiltonian<SzLabel>) -> Vec<Vec<f64>> {
        let n = h.ket().len();
        (0..n)
            .map(|j| {
                let mut e = vec![0.0; n];
                e[j] = 1.0;
                let mut col = vec![0.0; n];
                h.apply(0, &e, &mut col, 1.0, true);
                col
            })
            .collect()
    }

    #[test]
    fn test_operator_is_symmetric_with_matching_diagonal() {
        let bond = HeisenbergBond::new(2, 2);
        let mut h = bond.effective(0, EffectiveOptions::default(), 1);
        let cols = materialize(&mut h);
        let n = cols.len();
        assert_eq!(n, 6);
        let diag = h.diag().unwrap().to_vec();
        for i in 0..n {
            assert!((cols[i][i] - diag[i]).abs() < 1e-14);
            for j in 0..n {
                assert!((cols[i][j] - cols[j][i]).abs() < 1e-14);
            }
        }
        // Same trace as the dense chain Hamiltonian.
        let dense = dense_hamiltonian(4, 0);
        let trace: f64 = (0..n).map(|i| dense[(i, i)]).sum();
        assert!((diag.iter().sum::<f64>() - trace).abs() < 1e-12);
    }

    #[test]
    fn test_modes_are_bit_identical() {
        let bond = HeisenbergBond::new(3, 2);
        let mut reference = None;
        for mode in [SeqMode::None, SeqMode::Simple, SeqMode::Auto, SeqMode::Tasked] {
            let mut h = bond.effective(1, EffectiveOptions::default().with_mode(mode), 7);
            let ket = h.ket().data().to_vec();
            let mut first = vec![0.0; ket.len()];
            let mut second = vec![0.0; ket.len()];
            h.precompute();
            h.apply(0, &ket, &mut first, 1.0, true);
            h.apply(0, &ket, &mut second, 1.0, true);
            h.post_precompute();
            assert_eq!(first, second);
            match &reference {
                None => reference = Some(first),
                Some(r) => assert_eq!(r, &first, "mode {mode:?} differs"),
            }
        }
    }

    #[test]
    fn test_multiply_folds_energy_and_restores_expression() {
        let bond = HeisenbergBond::new(2, 2);
        let mut h = bond.effective(0, EffectiveOptions::default(), 3);
        let before = h.operator().mat[0].clone();
        let ket = h.ket().data().to_vec();
        let mut expected = vec![0.0; ket.len()];
        h.apply(0, &ket, &mut expected, 1.0, true);
        vector::axpy(0.5, &ket, &mut expected);

        let report = h.multiply(0.5);
        assert!(max_diff(h.bra().data(), &expected) < 1e-14);
        assert!((report.result - vector::norm(&expected)).abs() < 1e-14);
        assert!(report.nflop > 0);
        assert_eq!(h.operator().mat[0], before);
    }

    #[test]
    fn test_expect_skips_zero_and_mismatched_terms() {
        let bond = HeisenbergBond::new(2, 2);
        let mut h = bond.effective_with(bond.correlators(), 0, EffectiveOptions::default(), 5);
        let ket = h.ket().data().to_vec();
        h.bra_mut().data_mut().copy_from_slice(&ket);
        let depth = h.arena.depth();
        let values = h.expect(0.0).result;
        assert_eq!(h.arena.depth(), depth);
        assert_eq!(values.len(), 4);
        assert_eq!(values[3].1, 0.0);
        assert_eq!(values[3].0.name, OpName::Sp);

        let energy = h.multiply(0.0);
        let e = vector::dot(h.bra().data(), &ket);
        assert!(energy.result > 0.0);
        assert!((values[0].1 - e).abs() < 1e-12);
        // The first term receives the constant shift.
        h.bra_mut().data_mut().copy_from_slice(&ket);
        let shifted = h.expect(2.0).result;
        assert!((shifted[0].1 - e - 2.0).abs() < 1e-12);
        assert!((shifted[1].1 - values[1].1).abs() < 1e-14);
    }

    #[test]
    fn test_local_rule_matches_plain_operator() {
        let bond = HeisenbergBond::new(2, 3);
        let rule: Arc<dyn ParallelRule<SzLabel>> = Arc::new(SumMpoRule::new(Arc::new(LocalCommunicator)));
        let mut plain = bond.effective(1, EffectiveOptions::default(), 9);
        let mut ruled = bond.effective(1, EffectiveOptions::default().with_para_rule(rule), 9);
        assert_eq!(plain.diag(), ruled.diag());
        let ket = plain.ket().data().to_vec();
        let mut a = vec![0.0; ket.len()];
        let mut b = vec![0.0; ket.len()];
        plain.apply(0, &ket, &mut a, 2.0, true);
        ruled.apply(0, &ket, &mut b, 2.0, true);
        assert_eq!(a, b);
    }

    #[test]
    fn test_noise_of_zero_expression_is_empty() {
        let bond = HeisenbergBond::new(2, 2);
        let mut op = bond.hamiltonian.clone();
        op.mat[0] = OpExpr::Zero;
        let mut h = bond.effective_with(op, 0, EffectiveOptions::default().with_diag(false), 2);
        let report = h.perturbative_noise(true, &bond.left_basis, &bond.right_basis, NoiseKind::Reduced);
        assert!(report.result.is_empty());
        assert_eq!(report.nflop, 0);
    }

    #[test]
    fn test_noise_reaches_neighbouring_sectors() {
        let bond = HeisenbergBond::new(2, 2);
        for mode in [SeqMode::None, SeqMode::Simple] {
            let mut h = bond.effective(0, EffectiveOptions::default().with_mode(mode), 4);
            let reduced = h
                .perturbative_noise(true, &bond.left_basis, &bond.right_basis, NoiseKind::Reduced)
                .result;
            let labels: Vec<SzLabel> = (0..reduced.len()).map(|i| reduced.layout(i).delta()).collect();
            assert_eq!(labels, vec![SzLabel::spin(-2), SzLabel::spin(0), SzLabel::spin(2)]);
            assert!(reduced.data().iter().any(|&x| x != 0.0));

            let unreduced = h
                .perturbative_noise(true, &bond.left_basis, &bond.right_basis, NoiseKind::Unreduced)
                .result;
            assert!(unreduced.len() > reduced.len());
            // Summing the unreduced vectors of one label gives the reduced one.
            for i in 0..reduced.len() {
                let q = reduced.layout(i).delta();
                let mut sum = vec![0.0; reduced.vector(i).len()];
                for j in (0..unreduced.len()).filter(|&j| unreduced.layout(j).delta() == q) {
                    vector::axpy(1.0, unreduced.vector(j), &mut sum);
                }
                assert!(max_diff(&sum, reduced.vector(i)) < 1e-14);
            }
        }
    }

    #[test]
    fn test_deallocate_returns_vectors() {
        let bond = HeisenbergBond::new(1, 1);
        let h = bond.effective(0, EffectiveOptions::default(), 11);
        let ket = h.ket().clone();
        let (bra, back) = h.deallocate();
        assert_eq!(back, ket);
        assert_eq!(bra.len(), 2);
    }

    #[test]
    #[should_panic(expected = "input does not match the ket layout")]
    fn test_apply_rejects_wrong_length() {
        let bond = HeisenbergBond::new(1, 1);
        let mut h = bond.effective(0, EffectiveOptions::default(), 11);
        let mut out = vec![0.0; 2];
        h.apply(0, &[1.0], &mut out, 1.0, true);
    }
}
