// ─────────────────────────────────────────────────────────────────────
// SCPN Flow Core — Pressure Poisson
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Pressure Poisson system on the block grid and its solver backends.
//!
//! The operator is the wide stencil
//! `0.25·(p[x±2h] + p[y±2h]) − p`, with zero pressure outside the
//! domain. It is what the centered pressure gradient followed by the
//! centered divergence produces, so a solve makes the corrected
//! velocity divergence-free in the same discrete sense.

use ndarray::Array2;
use rayon::prelude::*;

use flow_math::comm::Communicator;
use flow_math::fft::WideStencilSolver;
use flow_math::gmres::{gmres_solve, GmresConfig};
use flow_math::linalg::BandedLu;
use flow_math::sparse::{AssembledSystem, DistributedSparseSystem, SpRow};
use flow_types::config::{PoissonConfig, SolverKind};
use flow_types::error::{FlowError, FlowResult};

use crate::grid::BlockGrid;

const WIDE_OFFSETS: [(isize, isize); 4] = [(-2, 0), (2, 0), (0, -2), (0, 2)];

/// Assemble the pressure operator for this rank's rows. Collective.
pub fn assemble_pressure_matrix(
    grid: &BlockGrid,
    comm: &dyn Communicator,
) -> FlowResult<AssembledSystem> {
    let bs = grid.block_size();
    let mut sys = DistributedSparseSystem::new(grid.rank(), grid.nranks());
    sys.reserve(grid.owned_rows());
    let mut row = SpRow::new(0);
    for &bid in grid.local_blocks() {
        for iy in 0..bs {
            for ix in 0..bs {
                let g = grid.global_row(bid, ix, iy);
                let (gx, gy) = grid.global_cell(bid, ix, iy);
                row.clear();
                row.index = g;
                row.push(g, -1.0);
                for &(dx, dy) in &WIDE_OFFSETS {
                    let Some((nb, nix, niy)) = grid.locate(gx as isize + dx, gy as isize + dy) else {
                        continue;
                    };
                    let col = grid.global_row(nb, nix, niy);
                    let owner = grid.owner_of(nb);
                    if owner == grid.rank() {
                        row.push(col, 0.25);
                    } else {
                        row.push_remote(owner, col, 0.25);
                    }
                }
                sys.push_row(&row)?;
            }
        }
    }
    log::debug!(
        "rank {}: pressure matrix {} local + {} boundary entries",
        grid.rank(),
        sys.local_len(),
        sys.boundary_len()
    );
    sys.finalize(grid.row_cumsum(), comm)
}

/// Outcome of one linear solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveReport {
    pub iterations: usize,
    /// Global L2 norm of `b − A x`.
    pub residual: f64,
    pub converged: bool,
}

/// Solves the assembled pressure system for this rank's owned rows.
pub trait PoissonSolver: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// `x` holds the initial guess on entry. Collective for distributed
    /// backends.
    fn solve(
        &mut self,
        system: &AssembledSystem,
        comm: &dyn Communicator,
        rhs: &[f64],
        x: &mut [f64],
    ) -> FlowResult<SolveReport>;

    /// Called after the pressure system is assembled for `grid`. Drops
    /// anything tied to the previous partition.
    fn prepare(&mut self, _grid: &BlockGrid) -> FlowResult<()> {
        Ok(())
    }
}

fn check_lengths(system: &AssembledSystem, rhs: &[f64], x: &[f64]) -> FlowResult<()> {
    let n = system.owned_rows();
    if rhs.len() != n || x.len() != n {
        return Err(FlowError::LinAlg(format!(
            "pressure solve expects length {n}, got rhs={} x={}",
            rhs.len(),
            x.len()
        )));
    }
    Ok(())
}

fn require_single_rank(name: &str, nranks: usize) -> FlowResult<()> {
    if nranks != 1 {
        return Err(FlowError::ConfigError(format!(
            "{name} pressure solver needs a single rank, got {nranks}"
        )));
    }
    Ok(())
}

/// Global `‖b − A x‖₂`.
fn residual_norm(
    system: &AssembledSystem,
    comm: &dyn Communicator,
    rhs: &[f64],
    x: &[f64],
) -> FlowResult<f64> {
    let mut ax = vec![0.0; x.len()];
    let mut ext = Vec::new();
    system.spmv(comm, x, &mut ax, &mut ext)?;
    let mut sq = [rhs
        .par_iter()
        .zip(ax.par_iter())
        .map(|(b, a)| (b - a) * (b - a))
        .sum::<f64>()];
    comm.all_reduce_sum(&mut sq)?;
    Ok(sq[0].sqrt())
}

/// Distributed restarted GMRES.
#[derive(Debug, Clone)]
pub struct IterativeSolver {
    config: GmresConfig,
}

impl IterativeSolver {
    pub fn new(cfg: &PoissonConfig) -> Self {
        IterativeSolver {
            config: GmresConfig {
                restart: cfg.restart,
                max_iter: cfg.max_restarts,
                tol: cfg.tol,
                tol_rel: cfg.tol_rel,
            },
        }
    }
}

impl PoissonSolver for IterativeSolver {
    fn name(&self) -> &'static str {
        "iterative"
    }

    fn solve(
        &mut self,
        system: &AssembledSystem,
        comm: &dyn Communicator,
        rhs: &[f64],
        x: &mut [f64],
    ) -> FlowResult<SolveReport> {
        check_lengths(system, rhs, x)?;
        let r = gmres_solve(system, comm, rhs, x, &self.config)?;
        Ok(SolveReport {
            iterations: r.iterations,
            residual: r.residual,
            converged: r.converged,
        })
    }
}

/// Sine-transform solver on the whole grid held by one rank.
#[derive(Debug)]
pub struct FftSolver {
    inner: WideStencilSolver,
    /// Global cell `(gy, gx)` of every owned row.
    cells: Vec<(usize, usize)>,
}

impl FftSolver {
    pub fn new(grid: &BlockGrid) -> FlowResult<Self> {
        require_single_rank("fft", grid.nranks())?;
        let layout = grid.layout();
        let bs = grid.block_size();
        let mut cells = Vec::with_capacity(grid.owned_rows());
        for &bid in grid.local_blocks() {
            for iy in 0..bs {
                for ix in 0..bs {
                    let (gx, gy) = grid.global_cell(bid, ix, iy);
                    cells.push((gy, gx));
                }
            }
        }
        Ok(FftSolver {
            inner: WideStencilSolver::new(layout.cells_x(), layout.cells_y())?,
            cells,
        })
    }
}

impl PoissonSolver for FftSolver {
    fn name(&self) -> &'static str {
        "fft"
    }

    fn solve(
        &mut self,
        system: &AssembledSystem,
        comm: &dyn Communicator,
        rhs: &[f64],
        x: &mut [f64],
    ) -> FlowResult<SolveReport> {
        require_single_rank("fft", system.nranks())?;
        check_lengths(system, rhs, x)?;
        if rhs.len() != self.cells.len() {
            return Err(FlowError::LinAlg(format!(
                "fft solver built for {} rows, got {}",
                self.cells.len(),
                rhs.len()
            )));
        }
        let mut f = Array2::zeros(self.inner.shape());
        for (&cell, &b) in self.cells.iter().zip(rhs) {
            f[cell] = b;
        }
        let p = self.inner.solve(&f)?;
        for (xi, &cell) in x.iter_mut().zip(&self.cells) {
            *xi = p[cell];
        }
        let residual = residual_norm(system, comm, rhs, x)?;
        Ok(SolveReport {
            iterations: 1,
            residual,
            converged: true,
        })
    }

    fn prepare(&mut self, grid: &BlockGrid) -> FlowResult<()> {
        *self = FftSolver::new(grid)?;
        Ok(())
    }
}

/// Banded LU, factored on first use and reused until the system is
/// reassembled.
#[derive(Debug, Default)]
pub struct DirectSolver {
    lu: Option<BandedLu>,
}

impl DirectSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the cached factorization.
    pub fn reset(&mut self) {
        self.lu = None;
    }
}

impl PoissonSolver for DirectSolver {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn solve(
        &mut self,
        system: &AssembledSystem,
        comm: &dyn Communicator,
        rhs: &[f64],
        x: &mut [f64],
    ) -> FlowResult<SolveReport> {
        require_single_rank("direct", system.nranks())?;
        check_lengths(system, rhs, x)?;
        let n = system.owned_rows();
        let lu = match self.lu.take() {
            Some(lu) if lu.dim() == n => lu,
            _ => BandedLu::factor(n, system.entries())?,
        };
        x.copy_from_slice(rhs);
        let solved = lu.solve(x);
        self.lu = Some(lu);
        solved?;
        let residual = residual_norm(system, comm, rhs, x)?;
        Ok(SolveReport {
            iterations: 1,
            residual,
            converged: true,
        })
    }

    fn prepare(&mut self, _grid: &BlockGrid) -> FlowResult<()> {
        self.reset();
        Ok(())
    }
}

/// Backend selected by the configuration.
pub fn make_solver(cfg: &PoissonConfig, grid: &BlockGrid) -> FlowResult<Box<dyn PoissonSolver>> {
    let solver: Box<dyn PoissonSolver> = match cfg.solver {
        SolverKind::Iterative => Box::new(IterativeSolver::new(cfg)),
        SolverKind::Fft => Box::new(FftSolver::new(grid)?),
        SolverKind::Direct => {
            require_single_rank("direct", grid.nranks())?;
            Box::new(DirectSolver::new())
        }
    };
    log::info!("pressure solver: {}", solver.name());
    Ok(solver)
}
