//! Support code for the benchmark binary and the test suites.
//!
//! - **`spin_chain`**: a Heisenberg chain cut into a left and a right block,
//!   producing complete effective-operator setups together with exact
//!   reference spectra.
//! - **`perf`**: process memory statistics for benchmark rows.

pub mod perf;
pub mod spin_chain;
