// ─────────────────────────────────────────────────────────────────────
// SCPN Flow Core — Immersed Shapes
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Rigid shapes immersed in the grid through a characteristic function.
//!
//! Each shape keeps per-block obstacle data (`chi` in `[0, 1]` and a
//! deformation velocity `udef`) only for the blocks it touches. The
//! grid-wide `chi`/`udef` fields hold the values of the governing shape
//! of every cell.

use ndarray::{Array2, Array3};
use rayon::prelude::*;

use flow_math::linalg::solve_3x3;
use flow_types::error::{FlowError, FlowResult};
use flow_types::state::RigidBody;

use crate::grid::{BlockField, BlockGrid};

/// Obstacle data of one shape on one block, indexed `[iy, ix]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ObstacleBlock {
    pub chi: Array2<f64>,
    /// Shape `(2, bs, bs)`: deformation velocity components.
    pub udef: Array3<f64>,
}

impl ObstacleBlock {
    pub fn zeros(bs: usize) -> Self {
        ObstacleBlock {
            chi: Array2::zeros((bs, bs)),
            udef: Array3::zeros((2, bs, bs)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chi.iter().all(|&c| c <= 0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Shape {
    pub id: usize,
    pub body: RigidBody,
    blocks: Vec<Option<ObstacleBlock>>,
}

/// Mollified Heaviside of the signed distance `d` (negative inside).
fn smooth_indicator(d: f64, eps: f64) -> f64 {
    if eps <= 0.0 {
        return if d < 0.0 { 1.0 } else { 0.0 };
    }
    if d <= -eps {
        1.0
    } else if d >= eps {
        0.0
    } else {
        let x = d / eps;
        0.5 * (1.0 - x - (std::f64::consts::PI * x).sin() / std::f64::consts::PI)
    }
}

impl Shape {
    /// Shape with no obstacle blocks on a grid of `n_blocks` blocks.
    pub fn new(id: usize, body: RigidBody, n_blocks: usize) -> Self {
        Shape {
            id,
            body,
            blocks: vec![None; n_blocks],
        }
    }

    /// Sample `f(point) -> (chi, udef)` at the centers of local cells.
    /// Only blocks where `chi > 0` somewhere are kept.
    pub fn rasterize<F>(id: usize, body: RigidBody, grid: &BlockGrid, f: F) -> Self
    where
        F: Fn([f64; 2]) -> (f64, [f64; 2]) + Sync,
    {
        let bs = grid.block_size();
        let sampled: Vec<(usize, ObstacleBlock)> = grid
            .local_blocks()
            .par_iter()
            .filter_map(|&bid| {
                let mut ob = ObstacleBlock::zeros(bs);
                for iy in 0..bs {
                    for ix in 0..bs {
                        let (chi, udef) = f(grid.cell_center(bid, ix, iy));
                        ob.chi[[iy, ix]] = chi.clamp(0.0, 1.0);
                        ob.udef[[0, iy, ix]] = udef[0];
                        ob.udef[[1, iy, ix]] = udef[1];
                    }
                }
                (!ob.is_empty()).then_some((bid, ob))
            })
            .collect();

        let mut shape = Shape::new(id, body, grid.n_blocks());
        for (bid, ob) in sampled {
            shape.blocks[bid] = Some(ob);
        }
        log::debug!(
            "shape {id}: {} obstacle blocks on rank {}",
            shape.obstacle_blocks().count(),
            grid.rank()
        );
        shape
    }

    /// Rigid disk centered on the body's center of mass. `smoothing` is
    /// the half-width of the interface in cells; zero gives a sharp edge.
    pub fn disk(
        id: usize,
        body: RigidBody,
        grid: &BlockGrid,
        radius: f64,
        smoothing: f64,
    ) -> FlowResult<Self> {
        if !radius.is_finite() || radius <= 0.0 {
            return Err(FlowError::ConfigError(format!(
                "disk radius must be finite and > 0, got {radius}"
            )));
        }
        if !smoothing.is_finite() || smoothing < 0.0 {
            return Err(FlowError::ConfigError(format!(
                "disk smoothing must be finite and >= 0, got {smoothing}"
            )));
        }
        let c = body.center_of_mass;
        let eps = smoothing * grid.h();
        Ok(Self::rasterize(id, body, grid, move |p| {
            let d = ((p[0] - c[0]).powi(2) + (p[1] - c[1]).powi(2)).sqrt() - radius;
            (smooth_indicator(d, eps), [0.0, 0.0])
        }))
    }

    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, id: usize) -> Option<&ObstacleBlock> {
        self.blocks.get(id).and_then(Option::as_ref)
    }

    pub fn insert_block(&mut self, id: usize, block: ObstacleBlock) -> FlowResult<()> {
        let n = self.blocks.len();
        let slot = self.blocks.get_mut(id).ok_or_else(|| {
            FlowError::ConfigError(format!("block {id} outside shape arena of {n} blocks"))
        })?;
        *slot = Some(block);
        Ok(())
    }

    pub fn obstacle_blocks(&self) -> impl Iterator<Item = (usize, &ObstacleBlock)> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(id, b)| b.as_ref().map(|b| (id, b)))
    }

    /// Solve the penalized rigid-body system for (u, v, ω) from the
    /// current moments. Forced components keep their prescribed value.
    /// A shape with no mass on the grid is left untouched.
    pub fn update_velocity(&mut self, dt: f64) -> FlowResult<()> {
        let m = self.body.moments;
        if m.mass == 0.0 {
            return Ok(());
        }
        let b = &self.body;
        let mut a = [
            [m.mass, 0.0, -m.dy],
            [0.0, m.mass, m.dx],
            [-m.dy, m.dx, m.inertia],
        ];
        let mut rhs = [
            m.mom_x + dt * b.applied_force[0],
            m.mom_y + dt * b.applied_force[1],
            m.ang_mom + dt * b.applied_torque,
        ];
        let forced = [
            b.constraints.forced_u,
            b.constraints.forced_v,
            b.constraints.forced_omega,
        ];
        for (k, f) in forced.iter().enumerate() {
            if let Some(value) = f {
                a[k] = [0.0; 3];
                a[k][k] = 1.0;
                rhs[k] = *value;
            }
        }
        let x = solve_3x3(a, rhs)?;
        self.body.u = x[0];
        self.body.v = x[1];
        self.body.omega = x[2];
        log::trace!(
            "shape {}: u={:.6e} v={:.6e} omega={:.6e}",
            self.id,
            x[0],
            x[1],
            x[2]
        );
        Ok(())
    }
}

/// Write the governing `chi`/`udef` of every local cell and record which
/// shape (index into `shapes`) governs it.
///
/// The governing shape has the largest `chi`; ties go to the lowest id.
/// Cells with no positive `chi` get zeros and no governor.
pub fn put_on_grid(
    grid: &BlockGrid,
    shapes: &[Shape],
    chi: &mut BlockField,
    udef: &mut BlockField,
    governor: &mut [Array2<Option<usize>>],
) -> FlowResult<()> {
    let nlocal = grid.local_blocks().len();
    if chi.len() != nlocal || udef.len() != nlocal || governor.len() != nlocal {
        return Err(FlowError::PhysicsViolation(format!(
            "obstacle fields sized {}/{}/{} for {nlocal} local blocks",
            chi.len(),
            udef.len(),
            governor.len()
        )));
    }
    if let Some(s) = shapes.iter().find(|s| s.n_blocks() != grid.n_blocks()) {
        return Err(FlowError::ConfigError(format!(
            "shape {} spans {} blocks, grid has {}",
            s.id,
            s.n_blocks(),
            grid.n_blocks()
        )));
    }
    let bs = grid.block_size();
    let ids = grid.local_blocks();

    chi.blocks_mut()
        .par_iter_mut()
        .zip(udef.blocks_mut().par_iter_mut())
        .zip(governor.par_iter_mut())
        .zip(ids.par_iter())
        .for_each(|(((c, u), g), &bid)| {
            c.fill(0.0);
            u.fill(0.0);
            g.fill(None);
            for (k, shape) in shapes.iter().enumerate() {
                let Some(ob) = shape.block(bid) else {
                    continue;
                };
                for iy in 0..bs {
                    for ix in 0..bs {
                        let x = ob.chi[[iy, ix]];
                        if x <= 0.0 {
                            continue;
                        }
                        let take = match g[[iy, ix]] {
                            None => true,
                            Some(cur) => {
                                let best = c[[0, iy + 1, ix + 1]];
                                x > best || (x == best && shape.id < shapes[cur].id)
                            }
                        };
                        if take {
                            g[[iy, ix]] = Some(k);
                            c[[0, iy + 1, ix + 1]] = x;
                            u[[0, iy + 1, ix + 1]] = ob.udef[[0, iy, ix]];
                            u[[1, iy + 1, ix + 1]] = ob.udef[[1, iy, ix]];
                        }
                    }
                }
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_types::state::{BlockLayout, MotionConstraints, PenalizedMoments};

    fn grid() -> BlockGrid {
        BlockGrid::new(BlockLayout::new(2, 2, 8, 1.0 / 16.0), 0, 1).expect("grid")
    }

    #[test]
    fn test_smooth_indicator_limits() {
        assert_eq!(smooth_indicator(-1.0, 0.1), 1.0);
        assert_eq!(smooth_indicator(1.0, 0.1), 0.0);
        assert!((smooth_indicator(0.0, 0.1) - 0.5).abs() < 1e-15);
        assert_eq!(smooth_indicator(-1e-9, 0.0), 1.0);
        assert_eq!(smooth_indicator(0.0, 0.0), 0.0);
    }

    #[test]
    fn test_disk_touches_only_nearby_blocks() {
        let g = grid();
        let body = RigidBody::at_rest([0.25, 0.25]);
        let disk = Shape::disk(0, body, &g, 0.1, 0.0).expect("disk");
        assert!(disk.block(0).is_some());
        assert!(disk.block(3).is_none());
        let ob = disk.block(0).expect("block 0");
        // Cell (3, 3) has center (0.21875, 0.21875): inside.
        assert_eq!(ob.chi[[3, 3]], 1.0);
        assert_eq!(ob.chi[[0, 0]], 0.0);
    }

    #[test]
    fn test_disk_rejects_bad_radius() {
        let g = grid();
        let body = RigidBody::at_rest([0.5, 0.5]);
        assert!(Shape::disk(0, body.clone(), &g, 0.0, 1.0).is_err());
        assert!(Shape::disk(0, body, &g, 0.1, -1.0).is_err());
    }

    #[test]
    fn test_put_on_grid_picks_largest_chi_then_lowest_id() {
        let g = grid();
        let body = RigidBody::at_rest([0.5, 0.5]);
        let half = |v: f64| move |_p: [f64; 2]| (v, [v, 0.0]);
        let shapes = vec![
            Shape::rasterize(7, body.clone(), &g, half(0.6)),
            Shape::rasterize(3, body.clone(), &g, half(0.6)),
            Shape::rasterize(5, body, &g, |p| (if p[0] < 0.5 { 0.9 } else { 0.0 }, [2.0, 0.0])),
        ];
        let mut chi = BlockField::zeros(&g, 1);
        let mut udef = BlockField::zeros(&g, 2);
        let mut gov = vec![Array2::from_elem((8, 8), None); 4];
        put_on_grid(&g, &shapes, &mut chi, &mut udef, &mut gov).expect("put");
        // Left half: shape 5 (chi 0.9) wins.
        assert_eq!(gov[0][[0, 0]], Some(2));
        assert_eq!(chi.at(0, 0, 0, 0), 0.9);
        assert_eq!(udef.at(0, 0, 0, 0), 2.0);
        // Right half: tie at 0.6 goes to id 3.
        assert_eq!(gov[1][[0, 0]], Some(1));
        assert_eq!(chi.at(1, 0, 0, 0), 0.6);
    }

    #[test]
    fn test_update_velocity_free_translation() {
        let mut s = Shape::new(0, RigidBody::at_rest([0.0, 0.0]), 1);
        s.body.moments = PenalizedMoments {
            mass: 2.0,
            inertia: 1.0,
            mom_x: 4.0,
            mom_y: -2.0,
            ..Default::default()
        };
        s.body.applied_force = [2.0, 0.0];
        s.update_velocity(0.5).expect("solve");
        assert!((s.body.u - 2.5).abs() < 1e-12);
        assert!((s.body.v + 1.0).abs() < 1e-12);
        assert!(s.body.omega.abs() < 1e-12);
    }

    #[test]
    fn test_update_velocity_respects_forced_components() {
        let body = RigidBody::at_rest([0.0, 0.0]).with_constraints(MotionConstraints {
            forced_u: Some(1.5),
            ..MotionConstraints::free()
        });
        let mut s = Shape::new(0, body, 1);
        s.body.moments = PenalizedMoments {
            mass: 1.0,
            inertia: 2.0,
            dx: 0.5,
            dy: 0.0,
            mom_x: 10.0,
            mom_y: 1.0,
            ang_mom: 0.0,
        };
        s.update_velocity(0.1).expect("solve");
        assert_eq!(s.body.u, 1.5);
        // Rows 2 and 3: v + 0.5ω = 1, 0.5v + 2ω = 0.
        let det = 1.0 * 2.0 - 0.5 * 0.5;
        assert!((s.body.v - 2.0 / det).abs() < 1e-12);
        assert!((s.body.omega + 0.5 / det).abs() < 1e-12);
    }

    #[test]
    fn test_update_velocity_skips_massless_shape() {
        let mut s = Shape::new(0, RigidBody::at_rest([0.0, 0.0]), 1);
        s.body.u = 3.0;
        s.update_velocity(1.0).expect("no-op");
        assert_eq!(s.body.u, 3.0);
    }

    #[test]
    fn test_insert_block_bounds() {
        let mut s = Shape::new(0, RigidBody::at_rest([0.0, 0.0]), 2);
        assert!(s.insert_block(1, ObstacleBlock::zeros(4)).is_ok());
        assert!(s.insert_block(2, ObstacleBlock::zeros(4)).is_err());
        assert_eq!(s.obstacle_blocks().count(), 1);
    }
}
