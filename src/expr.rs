//! Symbolic operator expressions and the block operators they refer to.
//!
//! An effective operator is a sum of terms, each a tensor product of an
//! operator on the left block and an operator on the right block. The
//! expression tree is a closed set of variants ([`OpExpr`]); consumers
//! pattern-match on it. Operator matrices are looked up by [`OpElement`] in the
//! left and right operator tables of an [`OperatorTensor`].

use crate::quantum::QuantumLabel;
use faer::Mat;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Operator names appearing in Hamiltonian and observable expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpName {
    Zero,
    I,
    H,
    N,
    NN,
    Sz,
    Sp,
    Sm,
    C,
    D,
    R,
    RD,
    A,
    AD,
    B,
    P,
    PD,
    Q,
    /// Site-resolved observable or scratch name not covered above.
    X(u16),
}

/// A named operator: name, site indices and the symmetry label it carries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpElement<L: QuantumLabel> {
    pub name: OpName,
    pub site_index: Vec<u16>,
    pub q_label: L,
}

impl<L: QuantumLabel> OpElement<L> {
    pub fn new(name: OpName, site_index: Vec<u16>, q_label: L) -> Self {
        Self {
            name,
            site_index,
            q_label,
        }
    }

    /// The identity; its matrix is never looked up.
    pub fn identity() -> Self {
        Self::new(OpName::I, Vec::new(), L::vacuum())
    }

    pub fn is_identity(&self) -> bool {
        self.name == OpName::I
    }
}

impl<L: QuantumLabel> fmt::Display for OpElement<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.name)?;
        if !self.site_index.is_empty() {
            let sites: Vec<String> = self.site_index.iter().map(u16::to_string).collect();
            write!(f, "{}", sites.join(","))?;
        }
        Ok(())
    }
}

/// Which side of a [`OpExpr::SumProd`] carries the single operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixedSide {
    Left,
    Right,
}

/// Bit in `conj` marking a transposed left operator.
pub const CONJ_LEFT: u8 = 1;
/// Bit in `conj` marking a transposed right operator.
pub const CONJ_RIGHT: u8 = 2;

/// Operator expression tree.
///
/// `Elem` is an operator of the left block acting with the identity on the
/// right block. `Prod` is `a ⊗ b` with `a` on the left and `b` on the right.
/// `SumProd` is `fixed ⊗ Σ fᵢ opᵢ` (or the mirror image). `Sum` is a flat string
/// of the other variants.
#[derive(Debug, Clone, PartialEq)]
pub enum OpExpr<L: QuantumLabel> {
    Zero,
    Elem {
        op: OpElement<L>,
        factor: f64,
    },
    Prod {
        a: OpElement<L>,
        b: OpElement<L>,
        conj: u8,
        factor: f64,
    },
    SumProd {
        fixed: OpElement<L>,
        side: FixedSide,
        ops: Vec<(OpElement<L>, f64)>,
        conj: u8,
        factor: f64,
    },
    Sum(Vec<OpExpr<L>>),
}

/// One elementary tensor product after expanding `Elem` and `SumProd`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductTerm<'a, L: QuantumLabel> {
    pub left: ProductOp<'a, L>,
    pub right: ProductOp<'a, L>,
    pub conj: u8,
    pub factor: f64,
}

/// Operand of a [`ProductTerm`]; the implicit identity of `Elem` terms has no
/// element of its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProductOp<'a, L: QuantumLabel> {
    Identity,
    Op(&'a OpElement<L>),
}

impl<L: QuantumLabel> ProductOp<'_, L> {
    pub fn q_label(&self) -> L {
        match self {
            ProductOp::Identity => L::vacuum(),
            ProductOp::Op(op) => op.q_label,
        }
    }

    pub fn is_identity(&self) -> bool {
        match self {
            ProductOp::Identity => true,
            ProductOp::Op(op) => op.is_identity(),
        }
    }
}

impl<'a, L: QuantumLabel> ProductTerm<'a, L> {
    pub fn sub_label(&self) -> SubLabel<L> {
        SubLabel {
            conj: self.conj,
            left: self.left.q_label(),
            right: self.right.q_label(),
        }
    }
}

impl<L: QuantumLabel> OpExpr<L> {
    pub fn elem(op: OpElement<L>) -> Self {
        OpExpr::Elem { op, factor: 1.0 }
    }

    pub fn prod(a: OpElement<L>, b: OpElement<L>) -> Self {
        OpExpr::Prod {
            a,
            b,
            conj: 0,
            factor: 1.0,
        }
    }

    /// `factor · (I ⊗ I)`
    pub fn identity_product(factor: f64) -> Self {
        OpExpr::Prod {
            a: OpElement::identity(),
            b: OpElement::identity(),
            conj: 0,
            factor,
        }
    }

    pub fn scaled(self, d: f64) -> Self {
        match self {
            OpExpr::Zero => OpExpr::Zero,
            _ if d == 0.0 => OpExpr::Zero,
            OpExpr::Elem { op, factor } => OpExpr::Elem {
                op,
                factor: factor * d,
            },
            OpExpr::Prod { a, b, conj, factor } => OpExpr::Prod {
                a,
                b,
                conj,
                factor: factor * d,
            },
            OpExpr::SumProd {
                fixed,
                side,
                ops,
                conj,
                factor,
            } => OpExpr::SumProd {
                fixed,
                side,
                ops,
                conj,
                factor: factor * d,
            },
            OpExpr::Sum(terms) => OpExpr::Sum(terms.into_iter().map(|t| t.scaled(d)).collect()),
        }
    }

    /// Flattening sum; `Zero` is neutral.
    pub fn plus(self, other: Self) -> Self {
        match (self, other) {
            (OpExpr::Zero, x) | (x, OpExpr::Zero) => x,
            (OpExpr::Sum(mut a), OpExpr::Sum(b)) => {
                a.extend(b);
                OpExpr::Sum(a)
            }
            (OpExpr::Sum(mut a), x) => {
                a.push(x);
                OpExpr::Sum(a)
            }
            (x, OpExpr::Sum(mut b)) => {
                b.insert(0, x);
                OpExpr::Sum(b)
            }
            (x, y) => OpExpr::Sum(vec![x, y]),
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            OpExpr::Zero => true,
            OpExpr::Sum(terms) => terms.iter().all(OpExpr::is_zero),
            _ => false,
        }
    }

    /// Visits every elementary product of the expression in a fixed order.
    pub fn for_each_product<'a>(&'a self, f: &mut dyn FnMut(ProductTerm<'a, L>)) {
        match self {
            OpExpr::Zero => {}
            OpExpr::Elem { op, factor } => f(ProductTerm {
                left: ProductOp::Op(op),
                right: ProductOp::Identity,
                conj: 0,
                factor: *factor,
            }),
            OpExpr::Prod { a, b, conj, factor } => f(ProductTerm {
                left: ProductOp::Op(a),
                right: ProductOp::Op(b),
                conj: *conj,
                factor: *factor,
            }),
            OpExpr::SumProd {
                fixed,
                side,
                ops,
                conj,
                factor,
            } => {
                for (op, g) in ops {
                    let (left, right) = match side {
                        FixedSide::Left => (fixed, op),
                        FixedSide::Right => (op, fixed),
                    };
                    f(ProductTerm {
                        left: ProductOp::Op(left),
                        right: ProductOp::Op(right),
                        conj: *conj,
                        factor: factor * g,
                    });
                }
            }
            OpExpr::Sum(terms) => {
                for term in terms {
                    term.for_each_product(f);
                }
            }
        }
    }

    /// Number of MPO channels the expression sums over.
    pub fn bond_dimension(&self) -> usize {
        match self {
            OpExpr::Zero => 0,
            OpExpr::Elem { .. } | OpExpr::Prod { .. } => 1,
            OpExpr::SumProd { ops, .. } => ops.len(),
            OpExpr::Sum(terms) => terms.iter().map(OpExpr::bond_dimension).sum(),
        }
    }
}

/// Labels of the two operators of a product, plus its transpose bits. The
/// labels are those of the stored operators, before transposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubLabel<L: QuantumLabel> {
    pub conj: u8,
    pub left: L,
    pub right: L,
}

impl<L: QuantumLabel> SubLabel<L> {
    /// Label change the left operator applies, accounting for transposition.
    pub fn left_delta(&self) -> L {
        if self.conj & CONJ_LEFT != 0 {
            self.left.negate()
        } else {
            self.left
        }
    }

    pub fn right_delta(&self) -> L {
        if self.conj & CONJ_RIGHT != 0 {
            self.right.negate()
        } else {
            self.right
        }
    }
}

/// Sorted distinct sub-labels of all products in `exprs`.
pub fn uniq_sub_labels<'a, L: QuantumLabel>(
    exprs: impl IntoIterator<Item = &'a OpExpr<L>>,
) -> Vec<SubLabel<L>> {
    let mut labels = BTreeSet::new();
    for expr in exprs {
        expr.for_each_product(&mut |term| {
            labels.insert(term.sub_label());
        });
    }
    labels.into_iter().collect()
}

/// Block-sparse operator matrix on one side of the bond.
///
/// The block `(bra, ket)` maps the `ket` sector of the block basis to the
/// `bra` sector; `bra` must be reachable from `ket` through `delta`.
#[derive(Debug, Clone)]
pub struct BlockOperator<L: QuantumLabel> {
    pub delta: L,
    blocks: BTreeMap<(L, L), Arc<Mat<f64>>>,
}

impl<L: QuantumLabel> BlockOperator<L> {
    pub fn new(delta: L) -> Self {
        Self {
            delta,
            blocks: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, bra: L, ket: L, block: Mat<f64>) {
        assert!(
            ket.fuse(self.delta).contains(&bra),
            "block {bra:?} <- {ket:?} is not connected by {:?}",
            self.delta
        );
        self.blocks.insert((bra, ket), Arc::new(block));
    }

    pub fn block(&self, bra: L, ket: L) -> Option<&Arc<Mat<f64>>> {
        self.blocks.get(&(bra, ket))
    }

    pub fn blocks(&self) -> impl Iterator<Item = (&(L, L), &Arc<Mat<f64>>)> {
        self.blocks.iter()
    }
}

pub type OperatorTable<L> = BTreeMap<OpElement<L>, Arc<BlockOperator<L>>>;

/// The operator being projected: named top-level terms (`dops`), one
/// expression per term (`mat`), and the left/right block operator tables the
/// expressions refer to.
#[derive(Debug, Clone)]
pub struct OperatorTensor<L: QuantumLabel> {
    pub dops: Vec<OpElement<L>>,
    pub mat: Vec<OpExpr<L>>,
    pub lopt: OperatorTable<L>,
    pub ropt: OperatorTable<L>,
}

impl<L: QuantumLabel> OperatorTensor<L> {
    pub fn new(dops: Vec<OpElement<L>>, mat: Vec<OpExpr<L>>) -> Self {
        assert_eq!(
            dops.len(),
            mat.len(),
            "every top-level term needs exactly one expression"
        );
        Self {
            dops,
            mat,
            lopt: BTreeMap::new(),
            ropt: BTreeMap::new(),
        }
    }

    /// Single-term operator, e.g. a Hamiltonian.
    pub fn single(dop: OpElement<L>, expr: OpExpr<L>) -> Self {
        Self::new(vec![dop], vec![expr])
    }

    pub fn with_left(mut self, op: OpElement<L>, block: BlockOperator<L>) -> Self {
        self.lopt.insert(op, Arc::new(block));
        self
    }

    pub fn with_right(mut self, op: OpElement<L>, block: BlockOperator<L>) -> Self {
        self.ropt.insert(op, Arc::new(block));
        self
    }

    pub fn len(&self) -> usize {
        self.mat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mat.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantum::SzLabel;

    fn op(name: OpName, twos: i32) -> OpElement<SzLabel> {
        OpElement::new(name, vec![0], SzLabel::spin(twos))
    }

    #[test]
    fn test_plus_flattens_and_skips_zero() {
        let e = OpExpr::prod(op(OpName::Sp, 2), op(OpName::Sm, -2))
            .plus(OpExpr::Zero)
            .plus(OpExpr::prod(op(OpName::Sm, -2), op(OpName::Sp, 2)).plus(OpExpr::elem(op(OpName::H, 0))));
        match &e {
            OpExpr::Sum(terms) => assert_eq!(terms.len(), 3),
            other => panic!("expected a sum, got {other:?}"),
        }
        assert_eq!(e.bond_dimension(), 3);
    }

    #[test]
    fn test_sum_prod_expansion_and_sub_labels() {
        let e = OpExpr::SumProd {
            fixed: op(OpName::Sz, 0),
            side: FixedSide::Left,
            ops: vec![(op(OpName::Sz, 0), 0.5), (op(OpName::N, 0), 2.0)],
            conj: 0,
            factor: 2.0,
        }
        .plus(OpExpr::Prod {
            a: op(OpName::Sp, 2),
            b: op(OpName::Sp, 2),
            conj: CONJ_RIGHT,
            factor: 1.0,
        });
        let mut factors = Vec::new();
        e.for_each_product(&mut |t| factors.push(t.factor));
        assert_eq!(factors, vec![1.0, 4.0, 1.0]);
        assert_eq!(e.bond_dimension(), 3);

        let labels = uniq_sub_labels([&e]);
        assert_eq!(labels.len(), 2);
        let transposed = labels.iter().find(|s| s.conj == CONJ_RIGHT).unwrap();
        assert_eq!(transposed.right_delta(), SzLabel::spin(-2));
        assert_eq!(transposed.left_delta(), SzLabel::spin(2));
    }

    #[test]
    fn test_scaled_by_zero_is_zero() {
        let e = OpExpr::elem(op(OpName::H, 0)).scaled(0.0);
        assert!(e.is_zero());
        assert_eq!(e.bond_dimension(), 0);
    }

    #[test]
    #[should_panic(expected = "is not connected")]
    fn test_block_operator_rejects_wrong_sector() {
        let mut sp = BlockOperator::new(SzLabel::spin(2));
        sp.insert(SzLabel::spin(0), SzLabel::spin(0), Mat::zeros(1, 1));
    }
}
