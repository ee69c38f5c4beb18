//! Benchmark runner for the effective-Hamiltonian solvers.
//!
//! Builds the effective operator of a Heisenberg chain cut into a left and a
//! right block, then times the solver entry points on it: the ground state by
//! Davidson, a Green's function scan over a frequency grid, and a sequence of
//! imaginary-time steps. One CSV row is written per solver call, carrying the
//! iteration count, the flops of the block multiplications, wall time and peak
//! memory.

use anyhow::{Context, Result, anyhow, ensure};
use clap::{Parser, ValueEnum};
use heff_krylov::{
    EffectiveHamiltonian, EffectiveOptions, IterativeOptions, Reduction, SeqMode,
    quantum::SzLabel,
    utils::{
        perf::peak_rss_kb,
        spin_chain::{HeisenbergBond, exact_spectrum},
    },
};
use serde::Serialize;
use std::path::PathBuf;

/// Execution strategy of the block multiplications.
#[derive(ValueEnum, Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
enum Mode {
    None,
    Simple,
    Auto,
    Tasked,
}

impl From<Mode> for SeqMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::None => SeqMode::None,
            Mode::Simple => SeqMode::Simple,
            Mode::Auto => SeqMode::Auto,
            Mode::Tasked => SeqMode::Tasked,
        }
    }
}

/// Solver families to run.
#[derive(ValueEnum, Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
enum Task {
    Eigs,
    Greens,
    GreensGcrot,
    Expo,
    Rk4,
}

#[derive(Parser, Debug)]
#[clap(
    name = "heff-bench",
    about = "Times the Krylov solvers on a Heisenberg-chain effective Hamiltonian."
)]
struct Args {
    /// Sites in the left block.
    #[clap(long, default_value_t = 5)]
    n_left: usize,
    /// Sites in the right block.
    #[clap(long, default_value_t = 5)]
    n_right: usize,
    /// Twice the total Sz of the target sector.
    #[clap(long, default_value_t = 0, allow_hyphen_values = true)]
    twos: i32,
    /// Execution strategy of the block multiplications.
    #[clap(long, value_enum, default_value_t = Mode::Auto)]
    mode: Mode,
    /// Solver families to run; all when omitted.
    #[clap(long, value_enum, value_delimiter = ',')]
    tasks: Vec<Task>,
    /// Convergence threshold of the iterative solvers.
    #[clap(long, default_value_t = 1e-7)]
    conv_thrd: f64,
    /// Lowest frequency of the Green's function scan, relative to the ground
    /// state energy.
    #[clap(long, default_value_t = 0.0, allow_hyphen_values = true)]
    omega_start: f64,
    /// Highest frequency of the Green's function scan.
    #[clap(long, default_value_t = 2.0, allow_hyphen_values = true)]
    omega_end: f64,
    /// Number of frequencies in the scan.
    #[clap(long, default_value_t = 5)]
    omega_points: usize,
    /// Lorentzian broadening of the Green's function.
    #[clap(long, default_value_t = 0.1)]
    eta: f64,
    /// Harmonic projection size for the CG Green's function (0: plain CG,
    /// positive: deflated, negative: projected).
    #[clap(long, default_value_t = 0, allow_hyphen_values = true)]
    n_harmonic_projection: i32,
    /// Imaginary time step.
    #[clap(long, default_value_t = 0.05)]
    dt: f64,
    /// Number of time steps.
    #[clap(long, default_value_t = 10)]
    steps: usize,
    /// Seed of the initial wavefunction.
    #[clap(long, default_value_t = 1234)]
    seed: u64,
    /// Path to the output CSV file.
    #[clap(long, value_name = "PATH")]
    output: PathBuf,
}

/// One solver call.
#[derive(Debug, Serialize)]
struct BenchRow {
    task: Task,
    mode: Mode,
    n_left: usize,
    n_right: usize,
    twos: i32,
    dim: usize,
    /// Frequency or elapsed time, depending on the task.
    param: f64,
    re: f64,
    im: f64,
    iterations: usize,
    converged: bool,
    nflop: u64,
    time_s: f64,
    rss_kb: u64,
}

struct Runner {
    args: Args,
    bond: HeisenbergBond,
    options: IterativeOptions,
    writer: csv::Writer<std::fs::File>,
}

impl Runner {
    fn operator(&self) -> EffectiveHamiltonian<SzLabel> {
        let options = EffectiveOptions::default().with_mode(self.args.mode.into());
        self.bond.effective(self.args.twos, options, self.args.seed)
    }

    #[allow(clippy::too_many_arguments)]
    fn row(&mut self, task: Task, dim: usize, param: f64, re: f64, im: f64, iterations: usize, converged: bool, nflop: u64, time_s: f64) -> Result<()> {
        let row = BenchRow {
            task,
            mode: self.args.mode,
            n_left: self.args.n_left,
            n_right: self.args.n_right,
            twos: self.args.twos,
            dim,
            param,
            re,
            im,
            iterations,
            converged,
            nflop,
            time_s,
            rss_kb: peak_rss_kb(),
        };
        self.writer
            .serialize(&row)
            .with_context(|| format!("Failed to write {task:?} row"))?;
        self.writer.flush()?;
        Ok(())
    }

    /// Ground state; returns its energy and leaves the eigenvector in `heff`.
    fn eigs(&mut self, heff: &mut EffectiveHamiltonian<SzLabel>) -> Result<f64> {
        let report = heff.eigs(&self.options, Reduction::local())?;
        let sites = self.args.n_left + self.args.n_right;
        if sites <= 14 {
            let exact = exact_spectrum(sites, self.args.twos)?[0];
            log::info!("ground state error vs exact diagonalization: {:.3e}", (report.result - exact).abs());
        }
        self.row(Task::Eigs, heff.ket().len(), 0.0, report.result, 0.0, report.iterations, report.converged, report.nflop, report.seconds)?;
        Ok(report.result)
    }

    fn frequencies(&self) -> Vec<f64> {
        let n = self.args.omega_points.max(1);
        let (a, b) = (self.args.omega_start, self.args.omega_end);
        if n == 1 {
            return vec![a];
        }
        (0..n).map(|i| a + (b - a) * i as f64 / (n - 1) as f64).collect()
    }

    fn greens(&mut self, e0: f64, gcrot: bool) -> Result<()> {
        let task = if gcrot { Task::GreensGcrot } else { Task::Greens };
        for omega in self.frequencies() {
            let mut heff = self.operator();
            heff.bra_mut().clear();
            let report = if gcrot {
                heff.greens_function_gcrot(-e0, omega, self.args.eta, 20, 10, None, &self.options, Reduction::local())?
            } else {
                heff.greens_function(
                    -e0,
                    omega,
                    self.args.eta,
                    self.args.n_harmonic_projection,
                    None,
                    &self.options,
                    Reduction::local(),
                )?
            };
            let dim = heff.ket().len();
            self.row(task, dim, omega, report.result.re, report.result.im, report.iterations, report.converged, report.nflop, report.seconds)?;
        }
        Ok(())
    }

    fn evolve(&mut self, e0: f64, rk4: bool) -> Result<()> {
        let task = if rk4 { Task::Rk4 } else { Task::Expo };
        let mut heff = self.operator();
        let dim = heff.ket().len();
        for step in 1..=self.args.steps {
            let beta = -self.args.dt;
            let (energy, norm, iterations, converged, nflop, seconds) = if rk4 {
                let r = heff.rk4_apply(beta, e0, true, Reduction::local())?;
                (r.result.energy, r.result.norm, r.iterations, r.converged, r.nflop, r.seconds)
            } else {
                let r = heff.expo_apply(beta, e0, true, &self.options, Reduction::local())?;
                (r.result.energy, r.result.norm, r.iterations, r.converged, r.nflop, r.seconds)
            };
            let energy = energy.ok_or_else(|| anyhow!("time step returned no energy"))?;
            ensure!(norm.is_finite() && norm > 0.0, "propagated state has norm {norm}");
            heff.ket_mut().data_mut().iter_mut().for_each(|v| *v /= norm);
            let t = step as f64 * self.args.dt;
            self.row(task, dim, t, energy, norm, iterations, converged, nflop, seconds)?;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logger: {}", e))?;

    let args = Args::parse();
    ensure!(args.n_left > 0 && args.n_right > 0, "both blocks need at least one site");
    let tasks = if args.tasks.is_empty() {
        vec![Task::Eigs, Task::Greens, Task::GreensGcrot, Task::Expo, Task::Rk4]
    } else {
        args.tasks.clone()
    };
    log::info!(
        "heff-bench: {}+{} sites, 2Sz = {}, mode {:?}, tasks {:?}",
        args.n_left,
        args.n_right,
        args.twos,
        args.mode,
        tasks
    );

    let writer = csv::Writer::from_path(&args.output)
        .with_context(|| format!("Failed to create CSV writer for {:?}", &args.output))?;
    let mut runner = Runner {
        options: IterativeOptions::default().with_conv_thrd(args.conv_thrd),
        bond: HeisenbergBond::new(args.n_left, args.n_right),
        args,
        writer,
    };

    // Every later task is referenced to the ground state energy.
    let mut heff = runner.operator();
    let e0 = runner.eigs(&mut heff)?;
    for task in tasks {
        match task {
            Task::Eigs => {}
            Task::Greens => runner.greens(e0, false)?,
            Task::GreensGcrot => runner.greens(e0, true)?,
            Task::Expo => runner.evolve(-e0, false)?,
            Task::Rk4 => runner.evolve(-e0, true)?,
        }
    }
    log::info!("results written to {:?}", runner.args.output);
    Ok(())
}
