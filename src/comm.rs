//! Reduction collaborators for distributed execution.
//!
//! The effective operator and every Krylov solver accept an optional
//! reduction collaborator. Vectors are replicated on every process; each
//! process evaluates the dot products over its own slice of the entries and the
//! partial sums are combined with [`Communicator::allreduce_sum`], so that every
//! process sees the same scalar and follows the same iteration path.
//!
//! Two transports are provided: [`LocalCommunicator`] for a single process and
//! [`ThreadCommunicator`], which runs several ranks as threads of one process and
//! is mainly used to exercise the distributed code paths in tests.
//!
//! On top of the transport, a [`ParallelRule`] decides which operator terms a
//! process owns and whether a term contributes a partial number that has to be
//! all-reduced.

use crate::expr::OpElement;
use crate::quantum::QuantumLabel;
use std::ops::Range;
use std::sync::{Arc, Barrier, Mutex};

/// Collective operations over a fixed group of processes.
///
/// Sums are always evaluated in rank order so that every process obtains a
/// bit-identical result.
pub trait Communicator: Send + Sync + std::fmt::Debug {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn root(&self) -> usize {
        0
    }

    fn is_root(&self) -> bool {
        self.rank() == self.root()
    }

    /// Element-wise sum over all processes, result available everywhere.
    fn allreduce_sum(&self, data: &mut [f64]);

    /// Element-wise sum over all processes, result available on `root` only.
    /// Buffers of the other processes are left untouched.
    fn reduce_sum(&self, data: &mut [f64], root: usize);

    fn allreduce_sum_u64(&self, data: &mut [u64]);

    fn reduce_sum_u64(&self, data: &mut [u64], root: usize);

    /// Concatenates the local buffers of all processes in rank order.
    fn allgather_i64(&self, local: &[i64]) -> Vec<i64>;

    fn barrier(&self);

    /// The half-open range of entries of a length-`len` vector that this
    /// process accounts for in distributed dot products.
    fn owned_range(&self, len: usize) -> Range<usize> {
        let chunk = len.div_ceil(self.size().max(1));
        let start = (self.rank() * chunk).min(len);
        let end = (start + chunk).min(len);
        start..end
    }
}

/// Single-process transport: every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCommunicator;

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn allreduce_sum(&self, _data: &mut [f64]) {}

    fn reduce_sum(&self, _data: &mut [f64], _root: usize) {}

    fn allreduce_sum_u64(&self, _data: &mut [u64]) {}

    fn reduce_sum_u64(&self, _data: &mut [u64], _root: usize) {}

    fn allgather_i64(&self, local: &[i64]) -> Vec<i64> {
        local.to_vec()
    }

    fn barrier(&self) {}
}

#[derive(Debug)]
struct SharedSlots {
    barrier: Barrier,
    real: Mutex<Vec<Vec<f64>>>,
    integer: Mutex<Vec<Vec<i64>>>,
}

/// In-process transport where every rank is a thread.
///
/// Create the whole group with [`ThreadCommunicator::group`] and move one
/// handle into each thread. All ranks must issue the same sequence of
/// collective calls.
#[derive(Debug, Clone)]
pub struct ThreadCommunicator {
    rank: usize,
    size: usize,
    shared: Arc<SharedSlots>,
}

impl ThreadCommunicator {
    pub fn group(size: usize) -> Vec<ThreadCommunicator> {
        assert!(size > 0, "a communicator group needs at least one rank");
        let shared = Arc::new(SharedSlots {
            barrier: Barrier::new(size),
            real: Mutex::new(vec![Vec::new(); size]),
            integer: Mutex::new(vec![Vec::new(); size]),
        });
        (0..size)
            .map(|rank| ThreadCommunicator {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn exchange_real(&self, local: &[f64]) -> Vec<Vec<f64>> {
        self.shared
            .real
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())[self.rank] = local.to_vec();
        self.shared.barrier.wait();
        let all = self
            .shared
            .real
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        // Nobody may overwrite its slot before every rank has read.
        self.shared.barrier.wait();
        all
    }

    fn exchange_integer(&self, local: &[i64]) -> Vec<Vec<i64>> {
        self.shared
            .integer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())[self.rank] = local.to_vec();
        self.shared.barrier.wait();
        let all = self
            .shared
            .integer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        self.shared.barrier.wait();
        all
    }

    fn sum_real(all: &[Vec<f64>], data: &mut [f64]) {
        data.iter_mut().for_each(|x| *x = 0.0);
        for part in all {
            assert_eq!(part.len(), data.len(), "reduction buffers differ in length");
            for (x, y) in data.iter_mut().zip(part) {
                *x += y;
            }
        }
    }

    fn sum_integer(all: &[Vec<i64>], data: &mut [u64]) {
        data.iter_mut().for_each(|x| *x = 0);
        for part in all {
            assert_eq!(part.len(), data.len(), "reduction buffers differ in length");
            for (x, y) in data.iter_mut().zip(part) {
                *x += *y as u64;
            }
        }
    }
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn allreduce_sum(&self, data: &mut [f64]) {
        let all = self.exchange_real(data);
        Self::sum_real(&all, data);
    }

    fn reduce_sum(&self, data: &mut [f64], root: usize) {
        let all = self.exchange_real(data);
        if self.rank == root {
            Self::sum_real(&all, data);
        }
    }

    fn allreduce_sum_u64(&self, data: &mut [u64]) {
        let local: Vec<i64> = data.iter().map(|&x| x as i64).collect();
        let all = self.exchange_integer(&local);
        Self::sum_integer(&all, data);
    }

    fn reduce_sum_u64(&self, data: &mut [u64], root: usize) {
        let local: Vec<i64> = data.iter().map(|&x| x as i64).collect();
        let all = self.exchange_integer(&local);
        if self.rank == root {
            Self::sum_integer(&all, data);
        }
    }

    fn allgather_i64(&self, local: &[i64]) -> Vec<i64> {
        self.exchange_integer(local).concat()
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }
}

/// How an operator term is distributed over the processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelOpKind {
    /// Every process holds its own share of the term; applying it requires an
    /// all-reduce of the result vector.
    Distributed,
    /// The whole term lives on `owner`; its value is a partial number that is
    /// summed across processes once all terms are evaluated.
    Number,
    /// Every process holds the complete term.
    Repeated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelProperty {
    pub owner: usize,
    pub kind: ParallelOpKind,
}

/// Term ownership scheme used by distributed expectation values.
pub trait ParallelRule<L: QuantumLabel>: Send + Sync + std::fmt::Debug {
    fn comm(&self) -> &dyn Communicator;

    fn property(&self, op: &OpElement<L>) -> ParallelProperty;

    fn is_root(&self) -> bool {
        self.comm().is_root()
    }

    /// Whether this process holds (part of) the term.
    fn own(&self, op: &OpElement<L>) -> bool {
        let prop = self.property(op);
        prop.owner == self.comm().rank() || prop.kind == ParallelOpKind::Repeated
    }

    /// Whether the term evaluates to a number summed across processes.
    fn number(&self, op: &OpElement<L>) -> bool {
        self.property(op).kind == ParallelOpKind::Number
    }
}

/// Rule for Hamiltonians whose terms are split across processes by site
/// index: every process holds a partial operator, all terms are distributed.
#[derive(Debug, Clone)]
pub struct SumMpoRule {
    comm: Arc<dyn Communicator>,
}

impl SumMpoRule {
    pub fn new(comm: Arc<dyn Communicator>) -> Self {
        Self { comm }
    }

    /// Whether the constant part of the Hamiltonian belongs to this process.
    pub fn index_available(&self) -> bool {
        self.comm.is_root()
    }

    /// Whether integrals whose leading site is `i` belong to this process.
    pub fn site_available(&self, i: u16) -> bool {
        self.comm.rank() == i as usize % self.comm.size()
    }
}

impl<L: QuantumLabel> ParallelRule<L> for SumMpoRule {
    fn comm(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    fn property(&self, _op: &OpElement<L>) -> ParallelProperty {
        ParallelProperty {
            owner: self.comm.rank(),
            kind: ParallelOpKind::Distributed,
        }
    }
}

/// Rule for expectation-value operators: a site-indexed term belongs to the
/// process `site % size` and evaluates to a partial number there; terms
/// without a site index are repeated everywhere.
#[derive(Debug, Clone)]
pub struct SiteOwnershipRule {
    comm: Arc<dyn Communicator>,
}

impl SiteOwnershipRule {
    pub fn new(comm: Arc<dyn Communicator>) -> Self {
        Self { comm }
    }
}

impl<L: QuantumLabel> ParallelRule<L> for SiteOwnershipRule {
    fn comm(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    fn property(&self, op: &OpElement<L>) -> ParallelProperty {
        match op.site_index.first() {
            Some(&site) => ParallelProperty {
                owner: site as usize % self.comm.size(),
                kind: ParallelOpKind::Number,
            },
            None => ParallelProperty {
                owner: self.comm.rank(),
                kind: ParallelOpKind::Repeated,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::OpName;
    use crate::quantum::SzLabel;
    use std::thread;

    #[test]
    fn test_local_communicator_is_identity() {
        let comm = LocalCommunicator;
        let mut data = [1.0, 2.0];
        comm.allreduce_sum(&mut data);
        assert_eq!(data, [1.0, 2.0]);
        assert_eq!(comm.owned_range(7), 0..7);
        assert_eq!(comm.allgather_i64(&[3, 4]), vec![3, 4]);
    }

    #[test]
    fn test_thread_allreduce_sums_in_rank_order() {
        let handles: Vec<_> = ThreadCommunicator::group(3)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let mut data = [comm.rank() as f64, 1.0];
                    comm.allreduce_sum(&mut data);
                    let mut count = [1u64];
                    comm.reduce_sum_u64(&mut count, 0);
                    let gathered = comm.allgather_i64(&[comm.rank() as i64]);
                    (comm.rank(), data, count[0], gathered)
                })
            })
            .collect();
        for handle in handles {
            let (rank, data, count, gathered) = handle.join().unwrap();
            assert_eq!(data, [3.0, 3.0]);
            assert_eq!(count, if rank == 0 { 3 } else { 1 });
            assert_eq!(gathered, vec![0, 1, 2]);
        }
    }

    #[test]
    fn test_owned_ranges_cover_vector() {
        let group = ThreadCommunicator::group(3);
        let ranges: Vec<_> = group.iter().map(|c| c.owned_range(8)).collect();
        assert_eq!(ranges, vec![0..3, 3..6, 6..8]);
    }

    #[test]
    fn test_site_ownership_rule() {
        let group = ThreadCommunicator::group(2);
        let rule = SiteOwnershipRule::new(Arc::new(group[1].clone()));
        let vac = SzLabel::default();
        let on_site_3 = OpElement::new(OpName::N, vec![3], vac);
        let on_site_4 = OpElement::new(OpName::N, vec![4], vac);
        let global = OpElement::new(OpName::H, vec![], vac);
        assert!(rule.own(&on_site_3));
        assert!(!rule.own(&on_site_4));
        assert!(rule.number(&on_site_4));
        assert!(rule.own(&global));
        assert!(!rule.number(&global));
    }
}
