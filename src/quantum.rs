//! Symmetry labels and blocked bases.
//!
//! Every block of a wavefunction or operator carries a [`QuantumLabel`]. The
//! crate only relies on the abstract label algebra (vacuum, negation, fusion);
//! [`SzLabel`] is the concrete abelian label used for particle number, spin
//! projection and point-group irreps.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

/// Label algebra of a symmetry group.
pub trait QuantumLabel:
    Copy + Ord + Hash + fmt::Debug + Default + Send + Sync + 'static
{
    /// The trivial label (`Default` is required to return the same value).
    fn vacuum() -> Self {
        Self::default()
    }

    /// Label of the conjugate representation.
    fn negate(self) -> Self;

    /// All labels in the product `self ⊗ other`, sorted and without repeats.
    /// Abelian groups always return exactly one label.
    fn fuse(self, other: Self) -> Vec<Self>;

    /// Number of labels in `self ⊗ other`.
    fn multiplicity(self, other: Self) -> usize {
        self.fuse(other).len()
    }

    /// Lossless integer encoding, used to ship label sets between processes.
    fn to_raw(self) -> i64;

    fn from_raw(raw: i64) -> Self;
}

/// Abelian label: particle number, twice the spin projection and a point-group
/// irrep (combined by XOR).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SzLabel {
    pub n: i32,
    pub twos: i32,
    pub pg: u8,
}

const RAW_OFFSET: i64 = 1 << 19;
const RAW_MASK: i64 = (1 << 20) - 1;

impl SzLabel {
    pub const fn new(n: i32, twos: i32, pg: u8) -> Self {
        Self { n, twos, pg }
    }

    /// Label of a pure spin degree of freedom (no particle number, trivial irrep).
    pub const fn spin(twos: i32) -> Self {
        Self { n: 0, twos, pg: 0 }
    }

    /// Single-label fusion, the only result abelian fusion can produce.
    pub fn combine(self, other: Self) -> Self {
        Self {
            n: self.n + other.n,
            twos: self.twos + other.twos,
            pg: self.pg ^ other.pg,
        }
    }
}

impl QuantumLabel for SzLabel {
    fn negate(self) -> Self {
        Self {
            n: -self.n,
            twos: -self.twos,
            pg: self.pg,
        }
    }

    fn fuse(self, other: Self) -> Vec<Self> {
        vec![self.combine(other)]
    }

    fn multiplicity(self, _other: Self) -> usize {
        1
    }

    fn to_raw(self) -> i64 {
        ((self.n as i64 + RAW_OFFSET) << 28)
            | ((self.twos as i64 + RAW_OFFSET) << 8)
            | self.pg as i64
    }

    fn from_raw(raw: i64) -> Self {
        Self {
            n: (((raw >> 28) & RAW_MASK) - RAW_OFFSET) as i32,
            twos: (((raw >> 8) & RAW_MASK) - RAW_OFFSET) as i32,
            pg: (raw & 0xff) as u8,
        }
    }
}

impl fmt::Display for SzLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.twos % 2 == 0 {
            write!(f, "< N={} SZ={} PG={} >", self.n, self.twos / 2, self.pg)
        } else {
            write!(f, "< N={} SZ={}/2 PG={} >", self.n, self.twos, self.pg)
        }
    }
}

/// A blocked basis: sorted labels with the dimension of each block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateInfo<L: QuantumLabel> {
    quanta: Vec<(L, usize)>,
}

impl<L: QuantumLabel> StateInfo<L> {
    /// Builds a basis from (label, dimension) pairs. Repeated labels are merged
    /// and empty blocks dropped.
    pub fn new(pairs: impl IntoIterator<Item = (L, usize)>) -> Self {
        let mut merged = BTreeMap::new();
        for (label, dim) in pairs {
            *merged.entry(label).or_insert(0) += dim;
        }
        Self {
            quanta: merged.into_iter().filter(|&(_, d)| d > 0).collect(),
        }
    }

    /// Blocked basis of `a ⊗ b`. With `cap`, only labels present in `cap` are
    /// kept and each block is truncated to the dimension `cap` allows.
    pub fn tensor_product(a: &Self, b: &Self, cap: Option<&Self>) -> Self {
        let mut merged = BTreeMap::new();
        for &(la, da) in &a.quanta {
            for &(lb, db) in &b.quanta {
                for q in la.fuse(lb) {
                    *merged.entry(q).or_insert(0) += da * db;
                }
            }
        }
        let quanta = merged
            .into_iter()
            .filter_map(|(q, d)| match cap {
                Some(cap) => {
                    let limit = cap.dim(q);
                    (limit > 0).then(|| (q, d.min(limit)))
                }
                None => Some((q, d)),
            })
            .collect();
        Self { quanta }
    }

    pub fn len(&self) -> usize {
        self.quanta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quanta.is_empty()
    }

    pub fn find(&self, label: L) -> Option<usize> {
        self.quanta.binary_search_by(|(q, _)| q.cmp(&label)).ok()
    }

    /// Dimension of the block with `label`, zero if absent.
    pub fn dim(&self, label: L) -> usize {
        self.find(label).map_or(0, |i| self.quanta[i].1)
    }

    pub fn total_dim(&self) -> usize {
        self.quanta.iter().map(|&(_, d)| d).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (L, usize)> + '_ {
        self.quanta.iter().copied()
    }

    pub fn labels(&self) -> impl Iterator<Item = L> + '_ {
        self.quanta.iter().map(|&(q, _)| q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sz_algebra() {
        let a = SzLabel::new(2, 1, 3);
        let b = SzLabel::new(1, -1, 1);
        assert_eq!(a.fuse(b), vec![SzLabel::new(3, 0, 2)]);
        assert_eq!(a.combine(a.negate()), SzLabel::vacuum());
        assert_eq!(a.multiplicity(b), 1);
    }

    #[test]
    fn test_raw_encoding_round_trips_negative_labels() {
        for label in [
            SzLabel::new(-4, -7, 5),
            SzLabel::new(12, 3, 0),
            SzLabel::default(),
        ] {
            assert_eq!(SzLabel::from_raw(label.to_raw()), label);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(SzLabel::new(2, 2, 0).to_string(), "< N=2 SZ=1 PG=0 >");
        assert_eq!(SzLabel::new(1, -1, 0).to_string(), "< N=1 SZ=-1/2 PG=0 >");
    }

    #[test]
    fn test_tensor_product_with_cap() {
        let up = SzLabel::spin(1);
        let dn = SzLabel::spin(-1);
        let site = StateInfo::new([(up, 1), (dn, 1)]);
        let two = StateInfo::tensor_product(&site, &site, None);
        assert_eq!(
            two.iter().collect::<Vec<_>>(),
            vec![(SzLabel::spin(-2), 1), (SzLabel::spin(0), 2), (SzLabel::spin(2), 1)]
        );
        let cap = StateInfo::new([(SzLabel::spin(0), 1), (SzLabel::spin(2), 5)]);
        let capped = StateInfo::tensor_product(&site, &site, Some(&cap));
        assert_eq!(
            capped.iter().collect::<Vec<_>>(),
            vec![(SzLabel::spin(0), 1), (SzLabel::spin(2), 1)]
        );
        assert_eq!(capped.total_dim(), 2);
        assert_eq!(capped.dim(SzLabel::spin(-2)), 0);
    }
}
