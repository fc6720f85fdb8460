//! Penalized pressure projection on block-structured grids.
//!
//! Stage 1: block grid, ghost exchange, immersed shapes
//! Stage 2: penalization, pressure Poisson system, coupled iteration

pub mod grid;
pub mod obstacle;
pub mod penalization;
pub mod poisson;
pub mod projection;
pub mod simulation;
