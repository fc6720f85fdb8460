// ─────────────────────────────────────────────────────────────────────
// SCPN Flow Core — Config
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FlowResult};
use crate::state::BlockLayout;

/// Top-level simulation configuration.
/// Only `grid` is mandatory; every other section falls back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub grid: GridConfig,
    #[serde(default)]
    pub penalization: PenalizationConfig,
    #[serde(default)]
    pub pressure: PressureConfig,
    #[serde(default)]
    pub poisson: PoissonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Number of blocks along x and y.
    pub blocks: [usize; 2],
    /// Cells per block side.
    pub block_size: usize,
    /// Physical length of the domain along x.
    #[serde(default = "default_extent")]
    pub extent: f64,
}

/// How penalization relaxes velocity and weights the body momenta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PenalizationMode {
    /// Relaxation factor chi; momenta weighted by h²·chi.
    #[default]
    Explicit,
    /// Relaxation factor chi·λdt/(1+λdt·chi); momenta measured relative to udef.
    Implicit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenalizationConfig {
    #[serde(default)]
    pub mode: PenalizationMode,
    /// Penalization coefficient λ (default: 1e7).
    #[serde(default = "default_lambda")]
    pub lambda: f64,
    /// When positive, λ is recomputed as dlm/dt every step (default: 0).
    #[serde(default)]
    pub dlm: f64,
}

/// Outer pressure/penalization iteration controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PressureConfig {
    /// Relative-change tolerance used on the first step (default: 1e-5).
    #[serde(default = "default_min_tolerance")]
    pub initial_tolerance: f64,
    #[serde(default = "default_min_tolerance")]
    pub min_tolerance: f64,
    #[serde(default = "default_max_tolerance")]
    pub max_tolerance: f64,
    /// Iteration index after which the loop always stops (default: 100).
    #[serde(default = "default_hard_cap")]
    pub hard_cap: usize,
    /// Absolute ceiling on passes per step (default: 1000).
    #[serde(default = "default_max_passes")]
    pub max_passes: usize,
}

/// Linear solver backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    /// Distributed restarted GMRES with Jacobi preconditioning.
    #[default]
    Iterative,
    /// Sine-transform solver for a uniform grid held by one rank.
    Fft,
    /// Banded LU factorization, factored once and reused.
    ///
    /// Rows are numbered block by block, so the lower bandwidth is about
    /// `blocks_x · block_size²` and factoring costs `O(n · kl²)`. Only
    /// practical on small grids.
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoissonConfig {
    #[serde(default)]
    pub solver: SolverKind,
    /// Absolute residual tolerance (default: 1e-10).
    #[serde(default = "default_poisson_tol")]
    pub tol: f64,
    /// Residual tolerance relative to the initial residual (default: 1e-8).
    #[serde(default = "default_poisson_tol_rel")]
    pub tol_rel: f64,
    /// Krylov dimension before restart (default: 40).
    #[serde(default = "default_restart")]
    pub restart: usize,
    /// Maximum number of restart cycles (default: 200).
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,
}

fn default_name() -> String {
    "flow".to_string()
}
fn default_extent() -> f64 {
    1.0
}
fn default_lambda() -> f64 {
    1e7
}
fn default_min_tolerance() -> f64 {
    1e-5
}
fn default_max_tolerance() -> f64 {
    1e-3
}
fn default_hard_cap() -> usize {
    100
}
fn default_max_passes() -> usize {
    1000
}
fn default_poisson_tol() -> f64 {
    1e-10
}
fn default_poisson_tol_rel() -> f64 {
    1e-8
}
fn default_restart() -> usize {
    40
}
fn default_max_restarts() -> usize {
    200
}

impl Default for PenalizationConfig {
    fn default() -> Self {
        PenalizationConfig {
            mode: PenalizationMode::default(),
            lambda: default_lambda(),
            dlm: 0.0,
        }
    }
}

impl Default for PressureConfig {
    fn default() -> Self {
        PressureConfig {
            initial_tolerance: default_min_tolerance(),
            min_tolerance: default_min_tolerance(),
            max_tolerance: default_max_tolerance(),
            hard_cap: default_hard_cap(),
            max_passes: default_max_passes(),
        }
    }
}

impl Default for PoissonConfig {
    fn default() -> Self {
        PoissonConfig {
            solver: SolverKind::default(),
            tol: default_poisson_tol(),
            tol_rel: default_poisson_tol_rel(),
            restart: default_restart(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl SimulationConfig {
    /// Load from a JSON file and validate.
    pub fn from_file(path: &str) -> FlowResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> FlowResult<Self> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FlowResult<()> {
        let g = &self.grid;
        if g.blocks[0] == 0 || g.blocks[1] == 0 {
            return Err(FlowError::ConfigError(format!(
                "grid.blocks must be >= 1 in both directions, got {:?}",
                g.blocks
            )));
        }
        if g.block_size < 2 {
            return Err(FlowError::ConfigError(format!(
                "grid.block_size must be >= 2, got {}",
                g.block_size
            )));
        }
        if !g.extent.is_finite() || g.extent <= 0.0 {
            return Err(FlowError::ConfigError(format!(
                "grid.extent must be finite and > 0, got {}",
                g.extent
            )));
        }
        let p = &self.penalization;
        if !p.lambda.is_finite() || p.lambda <= 0.0 {
            return Err(FlowError::ConfigError(format!(
                "penalization.lambda must be finite and > 0, got {}",
                p.lambda
            )));
        }
        if !p.dlm.is_finite() || p.dlm < 0.0 {
            return Err(FlowError::ConfigError(format!(
                "penalization.dlm must be finite and >= 0, got {}",
                p.dlm
            )));
        }
        let pr = &self.pressure;
        if !(pr.min_tolerance > 0.0 && pr.min_tolerance <= pr.max_tolerance) {
            return Err(FlowError::ConfigError(format!(
                "pressure tolerances must satisfy 0 < min <= max, got [{}, {}]",
                pr.min_tolerance, pr.max_tolerance
            )));
        }
        if !pr.initial_tolerance.is_finite() || pr.initial_tolerance <= 0.0 {
            return Err(FlowError::ConfigError(
                "pressure.initial_tolerance must be finite and > 0".to_string(),
            ));
        }
        if pr.max_passes == 0 {
            return Err(FlowError::ConfigError(
                "pressure.max_passes must be >= 1".to_string(),
            ));
        }
        let ps = &self.poisson;
        if ps.restart == 0 || ps.max_restarts == 0 {
            return Err(FlowError::ConfigError(
                "poisson.restart and poisson.max_restarts must be >= 1".to_string(),
            ));
        }
        if !(ps.tol >= 0.0 && ps.tol_rel >= 0.0) {
            return Err(FlowError::ConfigError(
                "poisson tolerances must be >= 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Block layout described by the `grid` section.
    pub fn create_layout(&self) -> BlockLayout {
        let g = &self.grid;
        let h = g.extent / (g.blocks[0] * g.block_size) as f64;
        BlockLayout::new(g.blocks[0], g.blocks[1], g.block_size, h)
    }
}
