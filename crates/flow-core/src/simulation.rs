// ─────────────────────────────────────────────────────────────────────
// SCPN Flow Core — Simulation
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Flow state and the ordered pipeline of operators that advances it.

use ndarray::Array2;

use flow_math::comm::Communicator;
use flow_types::config::SimulationConfig;
use flow_types::error::{FlowError, FlowResult};

use crate::grid::{BlockField, BlockGrid};
use crate::obstacle::{put_on_grid, Shape};
use crate::projection::PressureProjection;

/// Fields and shapes owned by one rank.
#[derive(Debug, Clone)]
pub struct FlowState {
    pub grid: BlockGrid,
    /// Velocity, two components.
    pub vel: BlockField,
    pub pres: BlockField,
    /// Governing characteristic function.
    pub chi: BlockField,
    /// Governing deformation velocity, two components.
    pub udef: BlockField,
    /// Index into `shapes` of the governing shape of each cell, `[iy, ix]`.
    pub governor: Vec<Array2<Option<usize>>>,
    pub shapes: Vec<Shape>,
    pub time: f64,
    pub step: usize,
}

impl FlowState {
    pub fn new(grid: BlockGrid) -> Self {
        let bs = grid.block_size();
        let nlocal = grid.local_blocks().len();
        FlowState {
            vel: BlockField::zeros(&grid, 2),
            pres: BlockField::zeros(&grid, 1),
            chi: BlockField::zeros(&grid, 1),
            udef: BlockField::zeros(&grid, 2),
            governor: vec![Array2::from_elem((bs, bs), None); nlocal],
            shapes: Vec::new(),
            time: 0.0,
            step: 0,
            grid,
        }
    }

    /// Register a shape. Ids must be unique.
    pub fn add_shape(&mut self, shape: Shape) -> FlowResult<()> {
        if self.shapes.iter().any(|s| s.id == shape.id) {
            return Err(FlowError::ConfigError(format!(
                "duplicate shape id {}",
                shape.id
            )));
        }
        if shape.n_blocks() != self.grid.n_blocks() {
            return Err(FlowError::ConfigError(format!(
                "shape {} spans {} blocks, grid has {}",
                shape.id,
                shape.n_blocks(),
                self.grid.n_blocks()
            )));
        }
        self.shapes.push(shape);
        Ok(())
    }

    /// Set the velocity of every local cell from its center position.
    pub fn set_velocity<F>(&mut self, f: F)
    where
        F: Fn([f64; 2]) -> [f64; 2] + Sync,
    {
        self.vel = BlockField::from_fn(&self.grid, 2, |p| f(p).to_vec());
    }

    /// Rebuild the governing `chi`/`udef` fields from the shapes.
    pub fn put_shapes_on_grid(&mut self) -> FlowResult<()> {
        put_on_grid(
            &self.grid,
            &self.shapes,
            &mut self.chi,
            &mut self.udef,
            &mut self.governor,
        )
    }

    pub fn shape(&self, id: usize) -> Option<&Shape> {
        self.shapes.iter().find(|s| s.id == id)
    }
}

/// One stage of a time step.
pub trait Operator {
    fn name(&self) -> &str;

    fn apply(&mut self, state: &mut FlowState, comm: &dyn Communicator, dt: f64) -> FlowResult<()>;
}

/// A rank's state, its communicator and the operator pipeline.
pub struct Simulation<C: Communicator> {
    pub state: FlowState,
    pipeline: Vec<Box<dyn Operator>>,
    comm: C,
}

impl<C: Communicator> Simulation<C> {
    pub fn new(state: FlowState, comm: C) -> FlowResult<Self> {
        if state.grid.rank() != comm.rank() || state.grid.nranks() != comm.size() {
            return Err(FlowError::Partition(format!(
                "grid built for rank {}/{} but communicator is rank {}/{}",
                state.grid.rank(),
                state.grid.nranks(),
                comm.rank(),
                comm.size()
            )));
        }
        Ok(Simulation {
            state,
            pipeline: Vec::new(),
            comm,
        })
    }

    /// Grid and pressure projection built from a configuration. Shapes
    /// and initial velocity are added by the caller.
    pub fn from_config(cfg: &SimulationConfig, comm: C) -> FlowResult<Self> {
        let grid = BlockGrid::from_config(cfg, comm.rank(), comm.size())?;
        let projection = PressureProjection::new(cfg, &grid)?;
        let mut sim = Self::new(FlowState::new(grid), comm)?;
        sim.push_operator(Box::new(projection));
        log::info!(
            "{}: {}x{} blocks of {}, rank {}/{}",
            cfg.name,
            cfg.grid.blocks[0],
            cfg.grid.blocks[1],
            cfg.grid.block_size,
            sim.comm.rank(),
            sim.comm.size()
        );
        Ok(sim)
    }

    pub fn push_operator(&mut self, op: Box<dyn Operator>) {
        self.pipeline.push(op);
    }

    /// Insert `op` right after the first operator named `after`.
    pub fn insert_operator_after(&mut self, after: &str, op: Box<dyn Operator>) -> FlowResult<()> {
        let pos = self
            .pipeline
            .iter()
            .position(|o| o.name() == after)
            .ok_or_else(|| FlowError::ConfigError(format!("no operator named {after}")))?;
        self.pipeline.insert(pos + 1, op);
        Ok(())
    }

    pub fn operator_names(&self) -> Vec<&str> {
        self.pipeline.iter().map(|o| o.name()).collect()
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// Run every operator once, then advance the clock.
    pub fn advance(&mut self, dt: f64) -> FlowResult<()> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(FlowError::PhysicsViolation(format!(
                "time step must be finite and > 0, got {dt}"
            )));
        }
        for op in self.pipeline.iter_mut() {
            log::trace!("step {}: {}", self.state.step, op.name());
            op.apply(&mut self.state, &self.comm, dt)?;
        }
        self.state.step += 1;
        self.state.time += dt;
        Ok(())
    }
}
