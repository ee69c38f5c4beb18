//! Exact block operators of an open spin-1/2 Heisenberg chain.
//!
//! The chain of `n_left + n_right` sites is cut into a left block (sites
//! `0..n_left`) and a right block (the remaining sites). Block states are the
//! spin configurations of the block, grouped into sectors by twice their total
//! spin projection. The bond Hamiltonian
//!
//! ```text
//! H = H_L ⊗ I + I ⊗ H_R + Sz ⊗ Sz + ½ (S+ ⊗ S- + S- ⊗ S+)
//! ```
//!
//! couples the two boundary sites. This gives effective Hamiltonians with a
//! real contraction plan and exactly known spectra, which the benchmark binary
//! and the tests rely on.

use crate::algorithms::symmetric_eigen;
use crate::effective::{EffectiveHamiltonian, EffectiveOptions};
use crate::error::KrylovError;
use crate::expr::{BlockOperator, OpElement, OpExpr, OpName, OperatorTensor};
use crate::quantum::{QuantumLabel, StateInfo, SzLabel};
use crate::sector::{OperatorInfos, SectorLayout, SparseVector};
use faer::Mat;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Spin configurations of a block, grouped by `2 Sz`.
#[derive(Debug, Clone)]
struct BlockBasis {
    sectors: BTreeMap<i32, Vec<u32>>,
    position: Vec<(i32, usize)>,
}

impl BlockBasis {
    fn new(sites: usize) -> Self {
        let mut sectors: BTreeMap<i32, Vec<u32>> = BTreeMap::new();
        for state in 0..1u32 << sites {
            sectors.entry(twos_of(state, sites)).or_default().push(state);
        }
        let mut position = vec![(0, 0); 1 << sites];
        for (&twos, states) in &sectors {
            for (i, &s) in states.iter().enumerate() {
                position[s as usize] = (twos, i);
            }
        }
        Self { sectors, position }
    }

    fn state_info(&self) -> StateInfo<SzLabel> {
        StateInfo::new(
            self.sectors
                .iter()
                .map(|(&twos, states)| (SzLabel::spin(twos), states.len())),
        )
    }

    /// Block operator of `delta_twos` whose action on a basis state is given
    /// by `action` as (state, amplitude) pairs.
    fn operator(&self, delta_twos: i32, action: impl Fn(u32) -> Vec<(u32, f64)>) -> BlockOperator<SzLabel> {
        let mut blocks: BTreeMap<(i32, i32), Mat<f64>> = BTreeMap::new();
        for (&ket, states) in &self.sectors {
            for (j, &state) in states.iter().enumerate() {
                for (target, amp) in action(state) {
                    let (bra, i) = self.position[target as usize];
                    let rows = self.sectors[&bra].len();
                    let block = blocks
                        .entry((bra, ket))
                        .or_insert_with(|| Mat::zeros(rows, states.len()));
                    block[(i, j)] += amp;
                }
            }
        }
        let mut op = BlockOperator::new(SzLabel::spin(delta_twos));
        for ((bra, ket), block) in blocks {
            op.insert(SzLabel::spin(bra), SzLabel::spin(ket), block);
        }
        op
    }
}

fn twos_of(state: u32, sites: usize) -> i32 {
    2 * state.count_ones() as i32 - sites as i32
}

fn sz(state: u32, site: usize) -> f64 {
    if state >> site & 1 == 1 { 0.5 } else { -0.5 }
}

fn raise(state: u32, site: usize) -> Vec<(u32, f64)> {
    if state >> site & 1 == 0 {
        vec![(state | 1 << site, 1.0)]
    } else {
        Vec::new()
    }
}

fn lower(state: u32, site: usize) -> Vec<(u32, f64)> {
    if state >> site & 1 == 1 {
        vec![(state & !(1 << site), 1.0)]
    } else {
        Vec::new()
    }
}

/// Heisenberg bonds `(i, i+1)` for `i < sites - 1`, applied to one state.
fn chain_action(state: u32, sites: usize) -> Vec<(u32, f64)> {
    let mut out = Vec::new();
    let mut diag = 0.0;
    for i in 0..sites.saturating_sub(1) {
        diag += sz(state, i) * sz(state, i + 1);
        if (state >> i & 1) != (state >> (i + 1) & 1) {
            out.push((state ^ (0b11 << i), 0.5));
        }
    }
    out.push((state, diag));
    out
}

/// A Heisenberg chain split into two blocks, with every table an effective
/// Hamiltonian of the bond needs.
#[derive(Debug, Clone)]
pub struct HeisenbergBond {
    pub n_left: usize,
    pub n_right: usize,
    pub left_basis: StateInfo<SzLabel>,
    pub right_basis: StateInfo<SzLabel>,
    pub left_infos: OperatorInfos<SzLabel>,
    pub right_infos: OperatorInfos<SzLabel>,
    /// Single-term bond Hamiltonian together with both operator tables.
    pub hamiltonian: OperatorTensor<SzLabel>,
    /// Top-level element of the Hamiltonian.
    pub hop: OpElement<SzLabel>,
    terms: Vec<OpExpr<SzLabel>>,
}

impl HeisenbergBond {
    pub fn new(n_left: usize, n_right: usize) -> Self {
        assert!(
            n_left >= 1 && n_right >= 1 && n_left + n_right <= 20,
            "chain blocks need between 1 and 20 sites in total"
        );
        let lb = BlockBasis::new(n_left);
        let rb = BlockBasis::new(n_right);
        let (ls, rs) = (n_left - 1, 0);
        let lsite = (n_left - 1) as u16;
        let rsite = n_left as u16;

        let h = |site: Vec<u16>| OpElement::new(OpName::H, site, SzLabel::vacuum());
        let hl = h(vec![0]);
        let hr = h(vec![rsite]);
        let szl = OpElement::new(OpName::Sz, vec![lsite], SzLabel::spin(0));
        let spl = OpElement::new(OpName::Sp, vec![lsite], SzLabel::spin(2));
        let sml = OpElement::new(OpName::Sm, vec![lsite], SzLabel::spin(-2));
        let szr = OpElement::new(OpName::Sz, vec![rsite], SzLabel::spin(0));
        let spr = OpElement::new(OpName::Sp, vec![rsite], SzLabel::spin(2));
        let smr = OpElement::new(OpName::Sm, vec![rsite], SzLabel::spin(-2));

        let mut terms = Vec::new();
        if n_left > 1 {
            terms.push(OpExpr::elem(hl.clone()));
        }
        if n_right > 1 {
            terms.push(OpExpr::prod(OpElement::identity(), hr.clone()));
        }
        terms.push(OpExpr::prod(szl.clone(), szr.clone()));
        terms.push(OpExpr::prod(spl.clone(), smr.clone()).scaled(0.5));
        terms.push(OpExpr::prod(sml.clone(), spr.clone()).scaled(0.5));

        let hop = h(Vec::new());
        let expr = terms.iter().cloned().fold(OpExpr::Zero, OpExpr::plus);
        let hamiltonian = OperatorTensor::single(hop.clone(), expr)
            .with_left(hl, lb.operator(0, |s| chain_action(s, n_left)))
            .with_left(szl, lb.operator(0, |s| vec![(s, sz(s, ls))]))
            .with_left(spl, lb.operator(2, |s| raise(s, ls)))
            .with_left(sml, lb.operator(-2, |s| lower(s, ls)))
            .with_right(hr, rb.operator(0, |s| chain_action(s, n_right)))
            .with_right(szr, rb.operator(0, |s| vec![(s, sz(s, rs))]))
            .with_right(spr, rb.operator(2, |s| raise(s, rs)))
            .with_right(smr, rb.operator(-2, |s| lower(s, rs)));

        let deltas = [SzLabel::spin(2), SzLabel::spin(-2)];
        let left_basis = lb.state_info();
        let right_basis = rb.state_info();
        Self {
            n_left,
            n_right,
            left_infos: OperatorInfos::from_basis(&left_basis, deltas),
            right_infos: OperatorInfos::from_basis(&right_basis, deltas),
            left_basis,
            right_basis,
            hamiltonian,
            hop,
            terms,
        }
    }

    /// Block layout of wavefunctions with total `2 Sz = twos`.
    pub fn wavefunction(&self, twos: i32) -> Arc<SectorLayout<SzLabel>> {
        Arc::new(SectorLayout::wavefunction(
            &self.left_basis,
            &self.right_basis,
            SzLabel::spin(twos),
        ))
    }

    /// Normalized random vector with a reproducible seed.
    pub fn random_vector(&self, twos: i32, seed: u64) -> SparseVector<SzLabel> {
        let layout = self.wavefunction(twos);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data: Vec<f64> = (0..layout.size()).map(|_| rng.random::<f64>() - 0.5).collect();
        let norm = crate::vector::norm(&data);
        crate::vector::scale(1.0 / norm, &mut data);
        SparseVector::from_data(layout, data)
    }

    /// The share of the Hamiltonian held by `rank` when its terms are dealt
    /// out round-robin over `size` processes. The operator tables are complete
    /// on every process.
    pub fn partial_hamiltonian(&self, rank: usize, size: usize) -> OperatorTensor<SzLabel> {
        let expr = self
            .terms
            .iter()
            .enumerate()
            .filter(|(i, _)| i % size == rank)
            .map(|(_, t)| t.clone())
            .fold(OpExpr::Zero, OpExpr::plus);
        let mut op = self.hamiltonian.clone();
        op.mat[0] = expr;
        op
    }

    /// Operator with several top-level terms for expectation values: the
    /// Hamiltonian, the two boundary correlators, a spin-raising term whose
    /// label differs from the Hamiltonian's and a `Zero` placeholder.
    pub fn correlators(&self) -> OperatorTensor<SzLabel> {
        let (lsite, rsite) = ((self.n_left - 1) as u16, self.n_left as u16);
        let pick = |name: OpName, site: u16, table: &crate::expr::OperatorTable<SzLabel>| {
            table
                .keys()
                .find(|k| k.name == name && k.site_index == vec![site])
                .cloned()
                .unwrap_or_else(|| panic!("{name:?}{site} missing from the block tables"))
        };
        let szl = pick(OpName::Sz, lsite, &self.hamiltonian.lopt);
        let szr = pick(OpName::Sz, rsite, &self.hamiltonian.ropt);
        let spl = pick(OpName::Sp, lsite, &self.hamiltonian.lopt);
        let smr = pick(OpName::Sm, rsite, &self.hamiltonian.ropt);
        let sites = vec![lsite, rsite];
        let mut op = self.hamiltonian.clone();
        op.dops = vec![
            self.hop.clone(),
            OpElement::new(OpName::X(0), sites.clone(), SzLabel::vacuum()),
            OpElement::new(OpName::X(1), sites.clone(), SzLabel::vacuum()),
            OpElement::new(OpName::Sp, vec![lsite], SzLabel::spin(2)),
            OpElement::new(OpName::Zero, Vec::new(), SzLabel::vacuum()),
        ];
        op.mat = vec![
            self.hamiltonian.mat[0].clone(),
            OpExpr::prod(szl, szr),
            OpExpr::prod(spl.clone(), smr),
            OpExpr::elem(spl),
            OpExpr::Zero,
        ];
        op
    }

    /// Effective Hamiltonian on the sector `twos`, with a random ket and a
    /// zero bra on the same layout.
    pub fn effective(&self, twos: i32, options: EffectiveOptions<SzLabel>, seed: u64) -> EffectiveHamiltonian<SzLabel> {
        self.effective_with(self.hamiltonian.clone(), twos, options, seed)
    }

    /// Like [`HeisenbergBond::effective`] for another operator on the same
    /// block tables.
    pub fn effective_with(
        &self,
        op: OperatorTensor<SzLabel>,
        twos: i32,
        options: EffectiveOptions<SzLabel>,
        seed: u64,
    ) -> EffectiveHamiltonian<SzLabel> {
        let ket = self.random_vector(twos, seed);
        let bra = SparseVector::zeros(Arc::clone(ket.layout()));
        let hop = op.dops[0].clone();
        EffectiveHamiltonian::new(
            self.left_infos.clone(),
            self.right_infos.clone(),
            op,
            bra,
            ket,
            &hop,
            options,
        )
    }
}

/// Dense Hamiltonian of the open chain of `sites` spins in the sector `twos`,
/// states ordered by their bit pattern.
pub fn dense_hamiltonian(sites: usize, twos: i32) -> Mat<f64> {
    let states: Vec<u32> = (0..1u32 << sites)
        .filter(|&s| twos_of(s, sites) == twos)
        .collect();
    let index: BTreeMap<u32, usize> = states.iter().enumerate().map(|(i, &s)| (s, i)).collect();
    let mut h = Mat::zeros(states.len(), states.len());
    for (j, &s) in states.iter().enumerate() {
        for (t, amp) in chain_action(s, sites) {
            h[(index[&t], j)] += amp;
        }
    }
    h
}

/// Exact spectrum of the chain in the sector `twos`, ascending.
pub fn exact_spectrum(sites: usize, twos: i32) -> Result<Vec<f64>, KrylovError> {
    let h = dense_hamiltonian(sites, twos);
    let (values, _) = symmetric_eigen(h.as_ref())?;
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_operators_have_expected_sectors() {
        let bond = HeisenbergBond::new(2, 3);
        assert_eq!(bond.left_basis.total_dim(), 4);
        assert_eq!(bond.right_basis.total_dim(), 8);
        // 2 Sz = 1 on five spins: C(5, 3) configurations.
        assert_eq!(bond.wavefunction(1).size(), 10);
        let sp = bond
            .hamiltonian
            .lopt
            .iter()
            .find(|(k, _)| k.name == OpName::Sp)
            .map(|(_, v)| Arc::clone(v))
            .unwrap();
        assert_eq!(sp.blocks().count(), 2);
    }

    #[test]
    fn test_two_site_spectrum() {
        let values = exact_spectrum(2, 0).unwrap();
        assert!((values[0] + 0.75).abs() < 1e-12);
        assert!((values[1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_partial_hamiltonians_cover_all_terms() {
        let bond = HeisenbergBond::new(2, 2);
        let total: usize = (0..3)
            .map(|r| bond.partial_hamiltonian(r, 3).mat[0].bond_dimension())
            .sum();
        assert_eq!(total, bond.hamiltonian.mat[0].bond_dimension());
    }
}
