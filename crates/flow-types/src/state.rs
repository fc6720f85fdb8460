// ─────────────────────────────────────────────────────────────────────
// SCPN Flow Core — State
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
use serde::{Deserialize, Serialize};

/// Geometry of a uniform block-structured 2D grid.
///
/// Blocks are square tiles of `block_size × block_size` cells, numbered
/// row-major: `block_id = by * blocks_x + bx`. Cell centers sit at
/// `(gx + 0.5) * h, (gy + 0.5) * h`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockLayout {
    pub blocks_x: usize,
    pub blocks_y: usize,
    pub block_size: usize,
    pub h: f64,
}

impl BlockLayout {
    pub fn new(blocks_x: usize, blocks_y: usize, block_size: usize, h: f64) -> Self {
        BlockLayout {
            blocks_x,
            blocks_y,
            block_size,
            h,
        }
    }

    pub fn n_blocks(&self) -> usize {
        self.blocks_x * self.blocks_y
    }

    pub fn cells_per_block(&self) -> usize {
        self.block_size * self.block_size
    }

    pub fn cells_x(&self) -> usize {
        self.blocks_x * self.block_size
    }

    pub fn cells_y(&self) -> usize {
        self.blocks_y * self.block_size
    }

    pub fn total_cells(&self) -> usize {
        self.n_blocks() * self.cells_per_block()
    }

    /// Block coordinates (bx, by) of a block id.
    pub fn block_coords(&self, block_id: usize) -> (usize, usize) {
        (block_id % self.blocks_x, block_id / self.blocks_x)
    }

    /// Physical position of the center of cell (ix, iy) inside a block.
    pub fn cell_center(&self, block_id: usize, ix: usize, iy: usize) -> [f64; 2] {
        let (bx, by) = self.block_coords(block_id);
        let gx = bx * self.block_size + ix;
        let gy = by * self.block_size + iy;
        [(gx as f64 + 0.5) * self.h, (gy as f64 + 0.5) * self.h]
    }
}

/// Per-component prescribed motion. `Some(value)` pins that component.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotionConstraints {
    pub forced_u: Option<f64>,
    pub forced_v: Option<f64>,
    pub forced_omega: Option<f64>,
}

impl MotionConstraints {
    /// Fully free body: velocities follow the penalized fluid momentum.
    pub fn free() -> Self {
        Self::default()
    }

    /// Body held at rest.
    pub fn fixed() -> Self {
        MotionConstraints {
            forced_u: Some(0.0),
            forced_v: Some(0.0),
            forced_omega: Some(0.0),
        }
    }

    pub fn is_fully_forced(&self) -> bool {
        self.forced_u.is_some() && self.forced_v.is_some() && self.forced_omega.is_some()
    }
}

/// Penalized mass/inertia and fluid momenta gathered over a body's cells.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PenalizedMoments {
    /// Σ F
    pub mass: f64,
    /// Σ F·|r|²
    pub inertia: f64,
    /// Σ F·rx
    pub dx: f64,
    /// Σ F·ry
    pub dy: f64,
    /// Σ F·udiff_x
    pub mom_x: f64,
    /// Σ F·udiff_y
    pub mom_y: f64,
    /// Σ F·(rx·udiff_y − ry·udiff_x)
    pub ang_mom: f64,
}

impl PenalizedMoments {
    pub const LEN: usize = 7;

    pub fn to_array(&self) -> [f64; Self::LEN] {
        [
            self.mass,
            self.inertia,
            self.dx,
            self.dy,
            self.mom_x,
            self.mom_y,
            self.ang_mom,
        ]
    }

    pub fn from_array(a: [f64; Self::LEN]) -> Self {
        PenalizedMoments {
            mass: a[0],
            inertia: a[1],
            dx: a[2],
            dy: a[3],
            mom_x: a[4],
            mom_y: a[5],
            ang_mom: a[6],
        }
    }

    pub fn add(&mut self, other: &PenalizedMoments) {
        self.mass += other.mass;
        self.inertia += other.inertia;
        self.dx += other.dx;
        self.dy += other.dy;
        self.mom_x += other.mom_x;
        self.mom_y += other.mom_y;
        self.ang_mom += other.ang_mom;
    }
}

/// Rigid-body state of one immersed shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigidBody {
    pub center_of_mass: [f64; 2],
    pub u: f64,
    pub v: f64,
    pub omega: f64,
    #[serde(default)]
    pub applied_force: [f64; 2],
    #[serde(default)]
    pub applied_torque: f64,
    #[serde(default)]
    pub constraints: MotionConstraints,
    /// Moments from the most recent momentum integration.
    #[serde(default)]
    pub moments: PenalizedMoments,
}

impl RigidBody {
    pub fn at_rest(center_of_mass: [f64; 2]) -> Self {
        RigidBody {
            center_of_mass,
            u: 0.0,
            v: 0.0,
            omega: 0.0,
            applied_force: [0.0, 0.0],
            applied_torque: 0.0,
            constraints: MotionConstraints::free(),
            moments: PenalizedMoments::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: MotionConstraints) -> Self {
        self.constraints = constraints;
        if let Some(u) = constraints.forced_u {
            self.u = u;
        }
        if let Some(v) = constraints.forced_v {
            self.v = v;
        }
        if let Some(w) = constraints.forced_omega {
            self.omega = w;
        }
        self
    }

    /// Rigid velocity (translation + ω×r) at a physical point.
    pub fn velocity_at(&self, p: [f64; 2]) -> [f64; 2] {
        let rx = p[0] - self.center_of_mass[0];
        let ry = p[1] - self.center_of_mass[1];
        [self.u - self.omega * ry, self.v + self.omega * rx]
    }
}
