//! Matrix-free effective Hamiltonians and Krylov solvers for symmetry-blocked
//! DMRG sweeps.
//!
//! At each step of a two-site (or one-site) DMRG sweep the many-body problem is
//! projected onto the tensor product of a left and a right renormalized block.
//! The projected operator is never formed: it is a short symbolic expression of
//! products `L_i ⊗ R_j` of block operators, and its action on a wavefunction
//! stored sector by sector is a sequence of small dense multiplications
//! `op(L) · X · op(R)ᵀ`. This crate provides that operator and the iterative
//! solvers that consume it.
//!
//! ## Layers
//!
//! - **Symmetry and storage** ([`quantum`], [`sector`]): quantum-number labels,
//!   block bases, and vectors laid out in symmetry sectors.
//! - **Symbolic operators** ([`expr`]): operator names, expressions and
//!   per-block operator tables.
//! - **Contraction** ([`contract`], [`sequencer`]): turning one product term into
//!   block multiplications, executed immediately or recorded into a plan that is
//!   replayed on every later application.
//! - **Effective operator** ([`effective`], [`solvers`], [`linear`]): the
//!   operator bound to a bra and a ket, its diagonal, and the solver entry
//!   points (`eigs`, `multiply`, `inverse_multiply`, `expect`,
//!   `greens_function`, `expo_apply`, `rk4_apply`, `perturbative_noise`).
//! - **Solvers** ([`algorithms`]): Davidson, MINRES, CG and its deflated
//!   variants, GCROT(m,k), and Krylov/RK4 time propagation, all written
//!   against [`matrix::LinearOperator`].
//! - **Distribution** ([`comm`], [`vector::Reduction`]): replicated vectors with
//!   all-reduced dot products, and rules deciding which terms a process owns.
//!
//! ## Example
//!
//! Ground state of a four-site Heisenberg chain split into two blocks:
//!
//! ```rust
//! use heff_krylov::utils::spin_chain::{HeisenbergBond, exact_spectrum};
//! use heff_krylov::{EffectiveOptions, IterativeOptions, Reduction, SeqMode};
//!
//! let bond = HeisenbergBond::new(2, 2);
//! let options = EffectiveOptions::default().with_mode(SeqMode::Auto);
//! let mut heff = bond.effective(0, options, 7);
//!
//! let report = heff.eigs(&IterativeOptions::default().with_conv_thrd(1e-8), Reduction::local())?;
//! let exact = exact_spectrum(4, 0)?[0];
//! assert!(report.converged);
//! assert!((report.result - exact).abs() < 1e-8);
//! # Ok::<(), heff_krylov::KrylovError>(())
//! ```

pub mod algorithms;
pub mod arena;
pub mod comm;
pub mod contract;
pub mod effective;
pub mod error;
pub mod expr;
pub mod linear;
pub mod matrix;
pub mod quantum;
pub mod sector;
pub mod sequencer;
pub mod solvers;
pub mod utils;
pub mod vector;

pub use algorithms::{IterativeOptions, KrylovOutcome};
pub use comm::{Communicator, LocalCommunicator, ParallelRule, SiteOwnershipRule, SumMpoRule, ThreadCommunicator};
pub use effective::{EffectiveHamiltonian, EffectiveOptions, NoiseKind};
pub use error::KrylovError;
pub use linear::LinearEffectiveHamiltonian;
pub use sequencer::SeqMode;
pub use solvers::{Propagation, Rk4Propagation, SolverReport};
pub use vector::Reduction;
