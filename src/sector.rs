//! Symmetry-blocked vector storage and block connectivity.
//!
//! A wavefunction on a bond is a set of dense blocks, one per pair of left and
//! right sectors whose labels fuse to the target label. [`SectorLayout`]
//! records the blocks and their offsets into one flat buffer; [`SparseVector`]
//! pairs a layout with the buffer.
//!
//! [`OperatorInfos`] describe which sector pairs an operator of a given label
//! can connect on one side of the bond, and [`ConnectionInfo`] combines them
//! with the bra/ket layouts into the list of block-to-block contractions every
//! product term performs. Connection tables are derived once per operator.

use crate::expr::SubLabel;
use crate::quantum::{QuantumLabel, StateInfo};
use crate::vector;
use faer::{MatMut, MatRef};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One dense block: `rows = dim(left)`, `cols = dim(right)`, stored column
/// major starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorBlock<L: QuantumLabel> {
    pub left: L,
    pub right: L,
    pub rows: usize,
    pub cols: usize,
    pub offset: usize,
}

impl<L: QuantumLabel> SectorBlock<L> {
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorLayout<L: QuantumLabel> {
    delta: L,
    blocks: Vec<SectorBlock<L>>,
    size: usize,
}

impl<L: QuantumLabel> SectorLayout<L> {
    /// All (left, right) sector pairs of the two bases that fuse to `target`.
    pub fn wavefunction(left: &StateInfo<L>, right: &StateInfo<L>, target: L) -> Self {
        let pairs = left.iter().flat_map(|(l, dl)| {
            right
                .iter()
                .filter(move |&(r, _)| l.fuse(r).contains(&target))
                .map(move |(r, dr)| (l, r, dl, dr))
        });
        Self::from_blocks(target, pairs)
    }

    /// Layout from explicit (left, right, rows, cols) blocks.
    pub fn from_blocks(delta: L, blocks: impl IntoIterator<Item = (L, L, usize, usize)>) -> Self {
        let mut sorted: Vec<_> = blocks.into_iter().filter(|b| b.2 * b.3 > 0).collect();
        sorted.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        sorted.dedup_by(|a, b| (a.0, a.1) == (b.0, b.1));
        let mut offset = 0;
        let blocks = sorted
            .into_iter()
            .map(|(left, right, rows, cols)| {
                let block = SectorBlock {
                    left,
                    right,
                    rows,
                    cols,
                    offset,
                };
                offset += rows * cols;
                block
            })
            .collect();
        Self {
            delta,
            blocks,
            size: offset,
        }
    }

    pub fn delta(&self) -> L {
        self.delta
    }

    /// Total number of stored entries.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn blocks(&self) -> &[SectorBlock<L>] {
        &self.blocks
    }

    pub fn block(&self, i: usize) -> &SectorBlock<L> {
        &self.blocks[i]
    }

    pub fn find(&self, left: L, right: L) -> Option<usize> {
        self.blocks
            .binary_search_by(|b| (b.left, b.right).cmp(&(left, right)))
            .ok()
    }
}

/// Sector-blocked vector: a shared layout plus flat storage.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseVector<L: QuantumLabel> {
    layout: Arc<SectorLayout<L>>,
    data: Vec<f64>,
}

impl<L: QuantumLabel> SparseVector<L> {
    pub fn zeros(layout: Arc<SectorLayout<L>>) -> Self {
        let data = vec![0.0; layout.size()];
        Self { layout, data }
    }

    pub fn from_data(layout: Arc<SectorLayout<L>>, data: Vec<f64>) -> Self {
        assert_eq!(
            layout.size(),
            data.len(),
            "storage does not match the sector layout"
        );
        Self { layout, data }
    }

    pub fn layout(&self) -> &Arc<SectorLayout<L>> {
        &self.layout
    }

    pub fn delta(&self) -> L {
        self.layout.delta()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    pub fn block(&self, i: usize) -> MatRef<'_, f64> {
        let b = self.layout.block(i);
        MatRef::from_column_major_slice(&self.data[b.range()], b.rows, b.cols)
    }

    pub fn block_mut(&mut self, i: usize) -> MatMut<'_, f64> {
        let b = *self.layout.block(i);
        MatMut::from_column_major_slice_mut(&mut self.data[b.range()], b.rows, b.cols)
    }

    pub fn clear(&mut self) {
        vector::clear(&mut self.data);
    }

    pub fn norm(&self) -> f64 {
        vector::norm(&self.data)
    }

    pub fn dot(&self, other: &Self) -> f64 {
        vector::dot(&self.data, &other.data)
    }

    pub fn copy_from(&mut self, other: &Self) {
        assert_eq!(self.layout, other.layout, "copy between different layouts");
        self.data.copy_from_slice(&other.data);
    }
}

/// Several sector-blocked vectors sharing one flat allocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseVectorGroup<L: QuantumLabel> {
    layouts: Vec<Arc<SectorLayout<L>>>,
    offsets: Vec<usize>,
    data: Vec<f64>,
}

impl<L: QuantumLabel> SparseVectorGroup<L> {
    pub fn zeros(layouts: Vec<Arc<SectorLayout<L>>>) -> Self {
        let mut offsets = Vec::with_capacity(layouts.len());
        let mut total = 0;
        for layout in &layouts {
            offsets.push(total);
            total += layout.size();
        }
        Self {
            layouts,
            offsets,
            data: vec![0.0; total],
        }
    }

    /// Number of vectors in the group.
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    pub fn layout(&self, i: usize) -> &Arc<SectorLayout<L>> {
        &self.layouts[i]
    }

    fn range(&self, i: usize) -> std::ops::Range<usize> {
        self.offsets[i]..self.offsets[i] + self.layouts[i].size()
    }

    pub fn vector(&self, i: usize) -> &[f64] {
        &self.data[self.range(i)]
    }

    pub fn vector_mut(&mut self, i: usize) -> &mut [f64] {
        let range = self.range(i);
        &mut self.data[range]
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Copies vector `i` out as a standalone [`SparseVector`].
    pub fn to_vector(&self, i: usize) -> SparseVector<L> {
        SparseVector::from_data(Arc::clone(&self.layouts[i]), self.vector(i).to_vec())
    }
}

/// Sector pairs an operator with label `delta` connects within one block
/// basis: `(bra, ket) -> (rows, cols)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorInfo<L: QuantumLabel> {
    pub delta: L,
    pairs: BTreeMap<(L, L), (usize, usize)>,
}

impl<L: QuantumLabel> OperatorInfo<L> {
    pub fn from_basis(basis: &StateInfo<L>, delta: L) -> Self {
        let mut pairs = BTreeMap::new();
        for (ket, dk) in basis.iter() {
            for bra in ket.fuse(delta) {
                let db = basis.dim(bra);
                if db > 0 {
                    pairs.insert((bra, ket), (db, dk));
                }
            }
        }
        Self { delta, pairs }
    }

    /// Bra sectors the operator reaches from `ket`.
    pub fn targets(&self, ket: L) -> impl Iterator<Item = L> + '_ {
        self.pairs.keys().filter(move |k| k.1 == ket).map(|k| k.0)
    }

    /// Ket sectors the operator reaches `bra` from; the targets of the transpose.
    pub fn sources(&self, bra: L) -> impl Iterator<Item = L> + '_ {
        self.pairs.keys().filter(move |k| k.0 == bra).map(|k| k.1)
    }

    pub fn contains(&self, bra: L, ket: L) -> bool {
        self.pairs.contains_key(&(bra, ket))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Operator infos of one side of the bond, keyed by operator label.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OperatorInfos<L: QuantumLabel> {
    infos: Vec<(L, Arc<OperatorInfo<L>>)>,
}

impl<L: QuantumLabel> OperatorInfos<L> {
    /// Infos for every label in `deltas` (plus the vacuum) over `basis`.
    pub fn from_basis(basis: &StateInfo<L>, deltas: impl IntoIterator<Item = L>) -> Self {
        let mut labels: Vec<L> = deltas.into_iter().chain([L::vacuum()]).collect();
        labels.sort();
        labels.dedup();
        Self {
            infos: labels
                .into_iter()
                .map(|q| (q, Arc::new(OperatorInfo::from_basis(basis, q))))
                .collect(),
        }
    }

    pub fn get(&self, delta: L) -> Option<&Arc<OperatorInfo<L>>> {
        self.infos
            .binary_search_by(|(q, _)| q.cmp(&delta))
            .ok()
            .map(|i| &self.infos[i].1)
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Drops the tables newest first.
    pub fn release(&mut self) {
        while self.infos.pop().is_some() {}
    }
}

/// One block-to-block contraction: the ket block `ket_block` is mapped to the
/// bra block `bra_block` by the left operator block `left = (bra, ket)` and the
/// right operator block `right = (bra, ket)`, both given as labels of the
/// stored (untransposed) operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEntry<L: QuantumLabel> {
    pub ket_block: usize,
    pub bra_block: usize,
    pub left: (L, L),
    pub right: (L, L),
}

/// Block connectivity per sub-label, derived once per operator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionInfo<L: QuantumLabel> {
    entries: BTreeMap<SubLabel<L>, Vec<ConnectionEntry<L>>>,
}

impl<L: QuantumLabel> ConnectionInfo<L> {
    /// Connectivity between `ket` and `bra` for every sub-label. Sub-labels
    /// whose operator labels have no info table contribute no entries.
    pub fn initialize_wfn(
        ket: &SectorLayout<L>,
        bra: &SectorLayout<L>,
        sub_labels: &[SubLabel<L>],
        left_infos: &OperatorInfos<L>,
        right_infos: &OperatorInfos<L>,
    ) -> Self {
        let mut entries = BTreeMap::new();
        for sub in sub_labels {
            let (Some(linfo), Some(rinfo)) = (left_infos.get(sub.left), right_infos.get(sub.right))
            else {
                log::debug!("no operator info for sub-label {sub:?}");
                continue;
            };
            let left_conj = sub.conj & crate::expr::CONJ_LEFT != 0;
            let right_conj = sub.conj & crate::expr::CONJ_RIGHT != 0;
            let mut list = Vec::new();
            for (ik, kb) in ket.blocks().iter().enumerate() {
                let lefts = side_targets(linfo, kb.left, left_conj);
                let rights = side_targets(rinfo, kb.right, right_conj);
                for &(lbra, lpair) in &lefts {
                    for &(rbra, rpair) in &rights {
                        if let Some(ib) = bra.find(lbra, rbra) {
                            list.push(ConnectionEntry {
                                ket_block: ik,
                                bra_block: ib,
                                left: lpair,
                                right: rpair,
                            });
                        }
                    }
                }
            }
            entries.insert(*sub, list);
        }
        Self { entries }
    }

    /// Connectivity of the diagonal: only sub-labels that leave both sectors
    /// unchanged, each block mapped onto itself.
    pub fn initialize_diag(
        layout: &SectorLayout<L>,
        sub_labels: &[SubLabel<L>],
        left_infos: &OperatorInfos<L>,
        right_infos: &OperatorInfos<L>,
    ) -> Self {
        let mut entries = BTreeMap::new();
        for sub in sub_labels {
            if sub.left != L::vacuum() || sub.right != L::vacuum() {
                continue;
            }
            let (Some(linfo), Some(rinfo)) = (left_infos.get(sub.left), right_infos.get(sub.right))
            else {
                continue;
            };
            let list = layout
                .blocks()
                .iter()
                .enumerate()
                .filter(|(_, b)| linfo.contains(b.left, b.left) && rinfo.contains(b.right, b.right))
                .map(|(i, b)| ConnectionEntry {
                    ket_block: i,
                    bra_block: i,
                    left: (b.left, b.left),
                    right: (b.right, b.right),
                })
                .collect();
            entries.insert(*sub, list);
        }
        Self { entries }
    }

    pub fn get(&self, sub: &SubLabel<L>) -> &[ConnectionEntry<L>] {
        self.entries.get(sub).map_or(&[], Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Bra sectors reachable from `ket` and the stored operator block realizing
/// each step.
fn side_targets<L: QuantumLabel>(info: &OperatorInfo<L>, ket: L, conj: bool) -> Vec<(L, (L, L))> {
    if conj {
        info.sources(ket).map(|src| (src, (ket, src))).collect()
    } else {
        info.targets(ket).map(|dst| (dst, (dst, ket))).collect()
    }
}
