//! Tensor-product contraction of operator expressions with blocked vectors.
//!
//! The [`Contractor`] trait is the seam between the effective operator and the
//! kernels that turn an expression into block multiplications. Contractors do
//! not touch vector data for the multiply routines: they emit [`GemmTask`]s
//! into a sink, and the caller decides whether to execute them right away, batch
//! them, or record them for replay. The diagonal is accumulated directly.
//!
//! [`BlockContractor`] is the reference implementation for dense operator
//! blocks. For a product `a ⊗ b` acting on a wavefunction block `X` (rows
//! indexing the left sector, columns the right sector) it emits
//! `Y += f · op(A) · X · op(B)ᵀ` for every connected pair of blocks. Fermionic
//! exchange signs are expected to be folded into the operator blocks.

use crate::expr::{
    BlockOperator, CONJ_LEFT, CONJ_RIGHT, OpExpr, OperatorTable, ProductOp, ProductTerm, SubLabel,
};
use crate::quantum::QuantumLabel;
use crate::sector::{ConnectionEntry, ConnectionInfo, SectorLayout};
use crate::sequencer::{BlockSpan, GemmTask};
use std::sync::Arc;

/// Output vector of a partial contraction together with its connectivity.
#[derive(Debug, Clone)]
pub struct PartialTarget<L: QuantumLabel> {
    pub layout: Arc<SectorLayout<L>>,
    pub cinfo: ConnectionInfo<L>,
}

/// Routes the contribution of one product to an output vector, given the
/// operator left unapplied and the label of the result.
pub type PartialRoute<'r, L> = dyn Fn(ProductOp<'_, L>, L) -> Option<usize> + 'r;

pub trait Contractor<L: QuantumLabel>: Send + Sync + std::fmt::Debug {
    /// Emits the tasks of `bra += expr · ket`.
    #[allow(clippy::too_many_arguments)]
    fn tensor_product_multiply(
        &self,
        expr: &OpExpr<L>,
        lopt: &OperatorTable<L>,
        ropt: &OperatorTable<L>,
        cinfo: &ConnectionInfo<L>,
        ket: &SectorLayout<L>,
        bra: &SectorLayout<L>,
        sink: &mut dyn FnMut(GemmTask),
    );

    /// Accumulates the diagonal of `expr` into `diag` and returns the number
    /// of floating-point operations spent.
    fn tensor_product_diagonal(
        &self,
        expr: &OpExpr<L>,
        lopt: &OperatorTable<L>,
        ropt: &OperatorTable<L>,
        cinfo: &ConnectionInfo<L>,
        layout: &SectorLayout<L>,
        diag: &mut [f64],
    ) -> u64;

    /// Emits the tasks applying only one side of every product to `ket`
    /// (the right side when `trace_right`), routing each contribution to one
    /// of `targets`. The sink receives the target index with every task.
    #[allow(clippy::too_many_arguments)]
    fn tensor_product_partial_multiply(
        &self,
        expr: &OpExpr<L>,
        lopt: &OperatorTable<L>,
        ropt: &OperatorTable<L>,
        trace_right: bool,
        ket: &SectorLayout<L>,
        targets: &[PartialTarget<L>],
        route: &PartialRoute<'_, L>,
        sink: &mut dyn FnMut(usize, GemmTask),
    );
}

/// Sub-label of the half of `term` that a partial contraction applies: the
/// right operator when `trace_right`, the left one otherwise. The other side
/// is replaced by the vacuum.
pub fn partial_sub_label<L: QuantumLabel>(term: &ProductTerm<'_, L>, trace_right: bool) -> SubLabel<L> {
    if trace_right {
        SubLabel {
            conj: term.conj & CONJ_RIGHT,
            left: L::vacuum(),
            right: term.right.q_label(),
        }
    } else {
        SubLabel {
            conj: term.conj & CONJ_LEFT,
            left: term.left.q_label(),
            right: L::vacuum(),
        }
    }
}

/// Reference contractor over dense operator blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockContractor;

fn lookup<'t, L: QuantumLabel>(
    table: &'t OperatorTable<L>,
    op: ProductOp<'_, L>,
    side: &str,
) -> Option<&'t Arc<BlockOperator<L>>> {
    match op {
        ProductOp::Identity => None,
        ProductOp::Op(op) if op.is_identity() => None,
        ProductOp::Op(op) => Some(
            table
                .get(op)
                .unwrap_or_else(|| panic!("operator {op} missing from the {side} operator table")),
        ),
    }
}

/// The task for one connection entry, or `None` when a stored operator has no
/// block for the required sector pair.
fn entry_task<L: QuantumLabel>(
    left: Option<&Arc<BlockOperator<L>>>,
    right: Option<&Arc<BlockOperator<L>>>,
    conj: u8,
    factor: f64,
    entry: &ConnectionEntry<L>,
    ket: &SectorLayout<L>,
    bra: &SectorLayout<L>,
) -> Option<GemmTask> {
    let left = match left {
        Some(op) => Some(Arc::clone(op.block(entry.left.0, entry.left.1)?)),
        None => None,
    };
    let right = match right {
        Some(op) => Some(Arc::clone(op.block(entry.right.0, entry.right.1)?)),
        None => None,
    };
    let (kb, bb) = (ket.block(entry.ket_block), bra.block(entry.bra_block));
    Some(GemmTask {
        left,
        left_trans: conj & CONJ_LEFT != 0,
        right,
        right_trans: conj & CONJ_RIGHT != 0,
        input: BlockSpan {
            offset: kb.offset,
            rows: kb.rows,
            cols: kb.cols,
        },
        output: BlockSpan {
            offset: bb.offset,
            rows: bb.rows,
            cols: bb.cols,
        },
        factor,
    })
}

impl<L: QuantumLabel> Contractor<L> for BlockContractor {
    fn tensor_product_multiply(
        &self,
        expr: &OpExpr<L>,
        lopt: &OperatorTable<L>,
        ropt: &OperatorTable<L>,
        cinfo: &ConnectionInfo<L>,
        ket: &SectorLayout<L>,
        bra: &SectorLayout<L>,
        sink: &mut dyn FnMut(GemmTask),
    ) {
        expr.for_each_product(&mut |term: ProductTerm<'_, L>| {
            let a = lookup(lopt, term.left, "left");
            let b = lookup(ropt, term.right, "right");
            for entry in cinfo.get(&term.sub_label()) {
                if let Some(task) = entry_task(a, b, term.conj, term.factor, entry, ket, bra) {
                    sink(task);
                }
            }
        });
    }

    fn tensor_product_diagonal(
        &self,
        expr: &OpExpr<L>,
        lopt: &OperatorTable<L>,
        ropt: &OperatorTable<L>,
        cinfo: &ConnectionInfo<L>,
        layout: &SectorLayout<L>,
        diag: &mut [f64],
    ) -> u64 {
        assert_eq!(diag.len(), layout.size(), "diagonal does not match the layout");
        let mut nflop = 0u64;
        expr.for_each_product(&mut |term| {
            let a = lookup(lopt, term.left, "left");
            let b = lookup(ropt, term.right, "right");
            for entry in cinfo.get(&term.sub_label()) {
                let blk = layout.block(entry.ket_block);
                let da = match a {
                    Some(op) => match op.block(entry.left.0, entry.left.1) {
                        Some(m) => Some(m),
                        None => continue,
                    },
                    None => None,
                };
                let db = match b {
                    Some(op) => match op.block(entry.right.0, entry.right.1) {
                        Some(m) => Some(m),
                        None => continue,
                    },
                    None => None,
                };
                let out = &mut diag[blk.range()];
                for j in 0..blk.cols {
                    let bj = db.map_or(1.0, |m| m[(j, j)]);
                    for i in 0..blk.rows {
                        let ai = da.map_or(1.0, |m| m[(i, i)]);
                        out[i + j * blk.rows] += term.factor * ai * bj;
                    }
                }
                nflop += 2 * blk.len() as u64;
            }
        });
        nflop
    }

    fn tensor_product_partial_multiply(
        &self,
        expr: &OpExpr<L>,
        lopt: &OperatorTable<L>,
        ropt: &OperatorTable<L>,
        trace_right: bool,
        ket: &SectorLayout<L>,
        targets: &[PartialTarget<L>],
        route: &PartialRoute<'_, L>,
        sink: &mut dyn FnMut(usize, GemmTask),
    ) {
        expr.for_each_product(&mut |term| {
            let sub = partial_sub_label(&term, trace_right);
            let (kept, applied, delta) = if trace_right {
                (term.left, lookup(ropt, term.right, "right"), sub.right_delta())
            } else {
                (term.right, lookup(lopt, term.left, "left"), sub.left_delta())
            };
            for q in ket.delta().fuse(delta) {
                let Some(it) = route(kept, q) else {
                    continue;
                };
                let target = &targets[it];
                let (a, b) = if trace_right {
                    (None, applied)
                } else {
                    (applied, None)
                };
                for entry in target.cinfo.get(&sub) {
                    if let Some(task) =
                        entry_task(a, b, sub.conj, term.factor, entry, ket, &target.layout)
                    {
                        sink(it, task);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{OpElement, OpName, OperatorTensor};
    use crate::quantum::{StateInfo, SzLabel};
    use crate::sector::OperatorInfos;
    use crate::sequencer::Sequencer;
    use faer::mat;

    fn up() -> SzLabel {
        SzLabel::spin(1)
    }

    fn dn() -> SzLabel {
        SzLabel::spin(-1)
    }

    /// One spin-1/2 on each side: the Sz·Sz + (S+S- + S-S+)/2 exchange.
    fn exchange() -> (OperatorTensor<SzLabel>, StateInfo<SzLabel>) {
        let basis = StateInfo::new([(dn(), 1), (up(), 1)]);
        let sz = OpElement::new(OpName::Sz, vec![0], SzLabel::spin(0));
        let sp = OpElement::new(OpName::Sp, vec![0], SzLabel::spin(2));
        let sm = OpElement::new(OpName::Sm, vec![0], SzLabel::spin(-2));
        let mut szb = BlockOperator::new(SzLabel::spin(0));
        szb.insert(up(), up(), mat![[0.5]]);
        szb.insert(dn(), dn(), mat![[-0.5]]);
        let mut spb = BlockOperator::new(SzLabel::spin(2));
        spb.insert(up(), dn(), mat![[1.0]]);
        let mut smb = BlockOperator::new(SzLabel::spin(-2));
        smb.insert(dn(), up(), mat![[1.0]]);
        let expr = OpExpr::prod(sz.clone(), sz.clone())
            .plus(OpExpr::prod(sp.clone(), sm.clone()).scaled(0.5))
            .plus(OpExpr::prod(sm.clone(), sp.clone()).scaled(0.5));
        let op = OperatorTensor::single(OpElement::new(OpName::H, vec![], SzLabel::default()), expr)
            .with_left(sz.clone(), szb.clone())
            .with_left(sp.clone(), spb.clone())
            .with_left(sm.clone(), smb.clone())
            .with_right(sz, szb)
            .with_right(sp, spb)
            .with_right(sm, smb);
        (op, basis)
    }

    #[test]
    fn test_singlet_is_eigenvector_of_exchange() {
        let (op, basis) = exchange();
        let deltas = [SzLabel::spin(2), SzLabel::spin(-2)];
        let infos = OperatorInfos::from_basis(&basis, deltas);
        let layout = SectorLayout::wavefunction(&basis, &basis, SzLabel::spin(0));
        let subs = crate::expr::uniq_sub_labels(&op.mat);
        let cinfo = ConnectionInfo::initialize_wfn(&layout, &layout, &subs, &infos, &infos);

        // Blocks are (dn, up) then (up, dn); the singlet is (|du> - |ud>)/sqrt2.
        let s = std::f64::consts::FRAC_1_SQRT_2;
        let ket = [s, -s];
        let mut bra = [0.0; 2];
        let mut seq = Sequencer::default();
        BlockContractor.tensor_product_multiply(
            &op.mat[0],
            &op.lopt,
            &op.ropt,
            &cinfo,
            &layout,
            &layout,
            &mut |task| seq.execute(&task, &ket, &mut bra, 1.0),
        );
        assert!((bra[0] + 0.75 * s).abs() < 1e-14);
        assert!((bra[1] - 0.75 * s).abs() < 1e-14);

        let diag_cinfo = ConnectionInfo::initialize_diag(&layout, &subs, &infos, &infos);
        let mut diag = [0.0; 2];
        let nflop = BlockContractor.tensor_product_diagonal(
            &op.mat[0],
            &op.lopt,
            &op.ropt,
            &diag_cinfo,
            &layout,
            &mut diag,
        );
        assert_eq!(diag, [-0.25, -0.25]);
        assert_eq!(nflop, 4);
    }

    #[test]
    #[should_panic(expected = "missing from the right operator table")]
    fn test_missing_operator_panics() {
        let (mut op, basis) = exchange();
        op.ropt.clear();
        let infos = OperatorInfos::from_basis(&basis, [SzLabel::spin(2), SzLabel::spin(-2)]);
        let layout = SectorLayout::wavefunction(&basis, &basis, SzLabel::spin(0));
        let subs = crate::expr::uniq_sub_labels(&op.mat);
        let cinfo = ConnectionInfo::initialize_wfn(&layout, &layout, &subs, &infos, &infos);
        BlockContractor.tensor_product_multiply(
            &op.mat[0],
            &op.lopt,
            &op.ropt,
            &cinfo,
            &layout,
            &layout,
            &mut |_| {},
        );
    }
}
