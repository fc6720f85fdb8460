// ─────────────────────────────────────────────────────────────────────
// SCPN Flow Core — Penalization
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Brinkman penalization coupling the fluid to rigid shapes.
//!
//! [`integrate_momenta`] gathers each shape's penalized mass, inertia
//! and fluid momentum; [`penalize`] relaxes the velocity inside shapes
//! toward the rigid-body velocity and reports the relative change.

use rayon::prelude::*;

use flow_math::comm::Communicator;
use flow_types::config::{PenalizationConfig, PenalizationMode};
use flow_types::error::{FlowError, FlowResult};
use flow_types::state::PenalizedMoments;

use crate::grid::BlockField;
use crate::simulation::FlowState;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PenalizationParams {
    pub mode: PenalizationMode,
    pub lambda: f64,
    pub dt: f64,
}

impl PenalizationParams {
    /// Effective λ for this step: `dlm / dt` when `dlm > 0`.
    pub fn for_step(cfg: &PenalizationConfig, dt: f64) -> Self {
        let lambda = if cfg.dlm > 0.0 { cfg.dlm / dt } else { cfg.lambda };
        PenalizationParams {
            mode: cfg.mode,
            lambda,
            dt,
        }
    }

    /// Relaxation factor applied to `U_S − u` at a cell with `chi`.
    #[inline]
    pub fn factor(&self, chi: f64) -> f64 {
        match self.mode {
            PenalizationMode::Explicit => chi,
            PenalizationMode::Implicit => {
                let x = self.lambda * self.dt * chi;
                x / (1.0 + x)
            }
        }
    }
}

fn check_field(name: &str, field: &BlockField, state: &FlowState, ncomp: usize) -> FlowResult<()> {
    if field.len() != state.grid.local_blocks().len() || field.ncomp() != ncomp {
        return Err(FlowError::PhysicsViolation(format!(
            "{name} has {} comps x {} blocks, expected {ncomp} x {}",
            field.ncomp(),
            field.len(),
            state.grid.local_blocks().len()
        )));
    }
    Ok(())
}

/// Penalized moments of every shape from `v_fluid`, reduced over ranks
/// and stored in each body's `moments`.
///
/// Each shape sums over its own obstacle cells, weighting by
/// `h²·factor(chi)`. Implicit mode measures momentum relative to the
/// shape's `udef`; explicit mode leaves the first moments `dx`, `dy` at
/// zero.
pub fn integrate_momenta(
    state: &mut FlowState,
    params: &PenalizationParams,
    v_fluid: &BlockField,
    comm: &dyn Communicator,
) -> FlowResult<()> {
    check_field("v_fluid", v_fluid, state, 2)?;
    let grid = &state.grid;
    let shapes = &state.shapes;
    let hsq = grid.h() * grid.h();
    let bs = grid.block_size();
    let implicit = params.mode == PenalizationMode::Implicit;

    let partials: Vec<Vec<PenalizedMoments>> = grid
        .local_blocks()
        .par_iter()
        .enumerate()
        .map(|(pos, &bid)| {
            shapes
                .iter()
                .map(|shape| {
                    let mut m = PenalizedMoments::default();
                    let Some(ob) = shape.block(bid) else {
                        return m;
                    };
                    let com = shape.body.center_of_mass;
                    for iy in 0..bs {
                        for ix in 0..bs {
                            let chi = ob.chi[[iy, ix]];
                            if chi <= 0.0 {
                                continue;
                            }
                            let f = hsq * params.factor(chi);
                            let p = grid.cell_center(bid, ix, iy);
                            let (px, py) = (p[0] - com[0], p[1] - com[1]);
                            let mut ux = v_fluid.at(pos, 0, ix as isize, iy as isize);
                            let mut uy = v_fluid.at(pos, 1, ix as isize, iy as isize);
                            if implicit {
                                ux -= ob.udef[[0, iy, ix]];
                                uy -= ob.udef[[1, iy, ix]];
                            }
                            m.mass += f;
                            m.inertia += f * (px * px + py * py);
                            m.dx += f * px;
                            m.dy += f * py;
                            m.mom_x += f * ux;
                            m.mom_y += f * uy;
                            m.ang_mom += f * (px * uy - py * ux);
                        }
                    }
                    m
                })
                .collect()
        })
        .collect();

    let nshapes = shapes.len();
    let mut totals = vec![PenalizedMoments::default(); nshapes];
    for block in &partials {
        for (t, m) in totals.iter_mut().zip(block) {
            t.add(m);
        }
    }
    let mut flat: Vec<f64> = totals.iter().flat_map(|m| m.to_array()).collect();
    comm.all_reduce_sum(&mut flat)?;

    for (shape, chunk) in state
        .shapes
        .iter_mut()
        .zip(flat.chunks_exact(PenalizedMoments::LEN))
    {
        let mut a = [0.0; PenalizedMoments::LEN];
        a.copy_from_slice(chunk);
        let mut m = PenalizedMoments::from_array(a);
        if !implicit {
            m.dx = 0.0;
            m.dy = 0.0;
        }
        log::trace!("shape {} moments {:?}", shape.id, m);
        shape.body.moments = m;
    }
    Ok(())
}

/// Relax the velocity in governed cells toward the shape velocity:
///
/// `vel = tmp_v + factor(chi)·(U_S − v_fluid)` with
/// `U_S = u − ω·ry + udef_x`, `v + ω·rx + udef_y`.
///
/// Returns `sqrt(Σ|Δvel|² / (ε + Σ|vel|²))` over penalized cells of all
/// ranks, with both sums taken after the update.
pub fn penalize(
    state: &mut FlowState,
    params: &PenalizationParams,
    tmp_v: &BlockField,
    v_fluid: &BlockField,
    comm: &dyn Communicator,
) -> FlowResult<f64> {
    check_field("tmp_v", tmp_v, state, 2)?;
    check_field("v_fluid", v_fluid, state, 2)?;
    let FlowState {
        grid,
        vel,
        chi,
        udef,
        governor,
        shapes,
        ..
    } = state;
    let bs = grid.block_size();
    let ids = grid.local_blocks();
    let (grid, chi, udef, governor, shapes) = (&*grid, &*chi, &*udef, &*governor, &*shapes);

    let partials: Vec<[f64; 2]> = vel
        .blocks_mut()
        .par_iter_mut()
        .enumerate()
        .map(|(pos, a)| {
            let bid = ids[pos];
            let mut sums = [0.0; 2];
            for iy in 0..bs {
                for ix in 0..bs {
                    let Some(k) = governor[pos][[iy, ix]] else {
                        continue;
                    };
                    let x = chi.at(pos, 0, ix as isize, iy as isize);
                    if x <= 0.0 {
                        continue;
                    }
                    let rigid = shapes[k].body.velocity_at(grid.cell_center(bid, ix, iy));
                    let us = [
                        rigid[0] + udef.at(pos, 0, ix as isize, iy as isize),
                        rigid[1] + udef.at(pos, 1, ix as isize, iy as isize),
                    ];
                    let fac = params.factor(x);
                    for (c, &usc) in us.iter().enumerate() {
                        let (i, j) = (ix as isize, iy as isize);
                        let df = fac * (usc - v_fluid.at(pos, c, i, j));
                        let cur = &mut a[[c, iy + 1, ix + 1]];
                        let dp = tmp_v.at(pos, c, i, j) + df - *cur;
                        *cur += dp;
                        sums[0] += *cur * *cur;
                        sums[1] += dp * dp;
                    }
                }
            }
            sums
        })
        .collect();

    let mut totals = partials.iter().fold([0.0; 2], |acc, s| [acc[0] + s[0], acc[1] + s[1]]);
    comm.all_reduce_sum(&mut totals)?;
    let rel = (totals[1] / (f64::EPSILON + totals[0])).sqrt();
    if !rel.is_finite() {
        return Err(FlowError::SolverDiverged {
            iteration: 0,
            message: format!("penalization change is {rel}"),
        });
    }
    Ok(rel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::BlockGrid;
    use crate::obstacle::Shape;
    use flow_math::comm::SelfComm;
    use flow_types::state::{BlockLayout, MotionConstraints, RigidBody};

    fn explicit(dt: f64) -> PenalizationParams {
        PenalizationParams {
            mode: PenalizationMode::Explicit,
            lambda: 1e7,
            dt,
        }
    }

    fn grid() -> BlockGrid {
        BlockGrid::new(BlockLayout::new(2, 2, 4, 0.125), 0, 1).expect("grid")
    }

    #[test]
    fn test_factor_modes() {
        let p = explicit(0.1);
        assert_eq!(p.factor(0.3), 0.3);
        let imp = PenalizationParams {
            mode: PenalizationMode::Implicit,
            lambda: 10.0,
            dt: 0.1,
        };
        assert!((imp.factor(1.0) - 0.5).abs() < 1e-15);
        assert_eq!(imp.factor(0.0), 0.0);
    }

    #[test]
    fn test_dlm_overrides_lambda() {
        let cfg = PenalizationConfig {
            mode: PenalizationMode::Implicit,
            lambda: 1e7,
            dlm: 2.0,
        };
        let p = PenalizationParams::for_step(&cfg, 0.5);
        assert!((p.lambda - 4.0).abs() < 1e-15);
        let p = PenalizationParams::for_step(&PenalizationConfig::default(), 0.5);
        assert_eq!(p.lambda, 1e7);
    }

    #[test]
    fn test_penalize_full_chi_sets_body_velocity() {
        let g = grid();
        let mut st = FlowState::new(g.clone());
        let mut body = RigidBody::at_rest([0.5, 0.5]);
        body.u = 2.0;
        let shape = Shape::rasterize(0, body, &g, |p| (if p[0] < 0.5 { 1.0 } else { 0.0 }, [0.0, 0.0]));
        st.add_shape(shape).expect("shape");
        st.put_shapes_on_grid().expect("put");
        st.set_velocity(|_| [1.0, 0.0]);
        let tmp_v = st.vel.clone();
        let v_fluid = st.vel.clone();
        let comm = SelfComm::new();
        let rel = penalize(&mut st, &explicit(0.1), &tmp_v, &v_fluid, &comm).expect("penalize");
        // Left half jumps from 1 to 2 in x: ΔM² / M² = 1/4 there.
        assert!((rel - 0.5).abs() < 1e-12, "rel = {rel}");
        assert!((st.vel.at(0, 0, 1, 1) - 2.0).abs() < 1e-15);
        assert_eq!(st.vel.at(1, 0, 1, 1), 1.0);
        // Second pass from the same inputs changes nothing.
        let rel = penalize(&mut st, &explicit(0.1), &tmp_v, &v_fluid, &comm).expect("penalize");
        assert!(rel < 1e-12);
    }

    #[test]
    fn test_penalize_spinning_body_adds_deformation() {
        let g = grid();
        let mut st = FlowState::new(g.clone());
        let mut body = RigidBody::at_rest([0.5, 0.5]);
        body.u = 0.5;
        body.omega = 3.0;
        let spin = body.clone();
        st.add_shape(Shape::rasterize(0, body, &g, |_| (1.0, [0.1, -0.2])))
            .expect("shape");
        st.put_shapes_on_grid().expect("put");
        st.set_velocity(|_| [0.0, 0.0]);
        let before = st.vel.clone();
        penalize(&mut st, &explicit(0.1), &before, &before, &SelfComm::new()).expect("penalize");
        for (pos, &id) in g.local_blocks().iter().enumerate() {
            let want = spin.velocity_at(g.cell_center(id, 2, 1));
            assert!((st.vel.at(pos, 0, 2, 1) - (want[0] + 0.1)).abs() < 1e-14);
            assert!((st.vel.at(pos, 1, 2, 1) - (want[1] - 0.2)).abs() < 1e-14);
        }
    }

    #[test]
    fn test_penalize_without_shapes_is_noop() {
        let g = grid();
        let mut st = FlowState::new(g);
        st.set_velocity(|p| [p[0], p[1]]);
        let before = st.vel.clone();
        let rel = penalize(&mut st, &explicit(0.1), &before, &before, &SelfComm::new()).expect("penalize");
        assert_eq!(rel, 0.0);
        assert_eq!(st.vel, before);
    }

    #[test]
    fn test_momenta_of_uniform_flow() {
        let g = grid();
        let mut st = FlowState::new(g.clone());
        let body = RigidBody::at_rest([0.25, 0.25]).with_constraints(MotionConstraints::free());
        st.add_shape(Shape::rasterize(0, body, &g, |p| {
            (if p[0] < 0.5 && p[1] < 0.5 { 1.0 } else { 0.0 }, [0.0, 0.0])
        }))
        .expect("shape");
        st.set_velocity(|_| [3.0, -1.0]);
        let v_fluid = st.vel.clone();
        integrate_momenta(&mut st, &explicit(0.1), &v_fluid, &SelfComm::new()).expect("momenta");
        let m = st.shapes[0].body.moments;
        // 16 cells of area 1/64 fully inside.
        assert!((m.mass - 0.25).abs() < 1e-14);
        assert!((m.mom_x - 0.75).abs() < 1e-14);
        assert!((m.mom_y + 0.25).abs() < 1e-14);
        assert_eq!(m.dx, 0.0);
        // Block is symmetric about the center of mass.
        assert!(m.ang_mom.abs() < 1e-14);
        st.shapes[0].update_velocity(0.1).expect("update");
        assert!((st.shapes[0].body.u - 3.0).abs() < 1e-12);
        assert!((st.shapes[0].body.v + 1.0).abs() < 1e-12);
    }
}
