//! Sine transforms and a fast uniform-grid solver for the wide
//! (distance-two) pressure stencil, built on rustfft.
//!
//! The stencil
//!
//! ```text
//! 0.25·(p[j, i-2] + p[j, i+2] + p[j-2, i] + p[j+2, i]) − p[j, i] = f[j, i]
//! ```
//!
//! with `p = 0` outside the array decouples into four parity subgrids
//! `(j mod 2, i mod 2)`. On each subgrid it is a compact 5-point
//! operator with homogeneous Dirichlet data, which DST-I diagonalizes.

use ndarray::{s, Array2};
use num_complex::Complex64;
use rustfft::FftPlanner;

use flow_types::error::{FlowError, FlowResult};

/// Unnormalized DST-I in place:
/// `X[k] = Σ_j x[j]·sin(π·(j+1)·(k+1)/(n+1))`.
///
/// Applying it twice multiplies by `(n+1)/2`.
pub fn dst1(planner: &mut FftPlanner<f64>, data: &mut [f64]) {
    let n = data.len();
    if n == 0 {
        return;
    }
    let m = 2 * (n + 1);
    let mut buf = vec![Complex64::new(0.0, 0.0); m];
    for (j, &x) in data.iter().enumerate() {
        buf[j + 1] = Complex64::new(x, 0.0);
        buf[m - 1 - j] = Complex64::new(-x, 0.0);
    }
    planner.plan_fft_forward(m).process(&mut buf);
    for (k, x) in data.iter_mut().enumerate() {
        *x = -0.5 * buf[k + 1].im;
    }
}

fn dst1_rows(planner: &mut FftPlanner<f64>, a: &mut Array2<f64>) {
    let mut line = Vec::with_capacity(a.ncols());
    for mut row in a.rows_mut() {
        line.clear();
        line.extend(row.iter().copied());
        dst1(planner, &mut line);
        for (d, &v) in row.iter_mut().zip(line.iter()) {
            *d = v;
        }
    }
}

fn dst1_cols(planner: &mut FftPlanner<f64>, a: &mut Array2<f64>) {
    let mut line = Vec::with_capacity(a.nrows());
    for mut col in a.columns_mut() {
        line.clear();
        line.extend(col.iter().copied());
        dst1(planner, &mut line);
        for (d, &v) in col.iter_mut().zip(line.iter()) {
            *d = v;
        }
    }
}

/// Apply the wide stencil to `p` (shape `[ny, nx]`), zero outside.
pub fn apply_wide_stencil(p: &Array2<f64>) -> Array2<f64> {
    let (ny, nx) = p.dim();
    Array2::from_shape_fn((ny, nx), |(j, i)| {
        let at = |jj: isize, ii: isize| -> f64 {
            if jj < 0 || ii < 0 || jj >= ny as isize || ii >= nx as isize {
                0.0
            } else {
                p[[jj as usize, ii as usize]]
            }
        };
        let (j, i) = (j as isize, i as isize);
        0.25 * (at(j, i - 2) + at(j, i + 2) + at(j - 2, i) + at(j + 2, i)) - at(j, i)
    })
}

/// Direct solver for the wide stencil on a fixed `[ny, nx]` array.
pub struct WideStencilSolver {
    nx: usize,
    ny: usize,
    planner: FftPlanner<f64>,
}

impl std::fmt::Debug for WideStencilSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WideStencilSolver")
            .field("nx", &self.nx)
            .field("ny", &self.ny)
            .finish()
    }
}

impl WideStencilSolver {
    pub fn new(nx: usize, ny: usize) -> FlowResult<Self> {
        if nx == 0 || ny == 0 {
            return Err(FlowError::ConfigError(format!(
                "wide-stencil solver needs a non-empty grid, got {nx}x{ny}"
            )));
        }
        Ok(WideStencilSolver {
            nx,
            ny,
            planner: FftPlanner::new(),
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.ny, self.nx)
    }

    pub fn solve(&mut self, rhs: &Array2<f64>) -> FlowResult<Array2<f64>> {
        if rhs.dim() != (self.ny, self.nx) {
            return Err(FlowError::LinAlg(format!(
                "rhs shape {:?} does not match solver shape {:?}",
                rhs.dim(),
                self.shape()
            )));
        }
        if rhs.iter().any(|v| !v.is_finite()) {
            return Err(FlowError::PhysicsViolation(
                "wide-stencil rhs contains non-finite values".to_string(),
            ));
        }
        let mut out = Array2::zeros((self.ny, self.nx));
        for py in 0..2 {
            for px in 0..2 {
                if py >= self.ny || px >= self.nx {
                    continue;
                }
                let mut sub = rhs.slice(s![py..;2, px..;2]).to_owned();
                self.solve_compact(&mut sub);
                out.slice_mut(s![py..;2, px..;2]).assign(&sub);
            }
        }
        Ok(out)
    }

    /// Solve `0.25·(q[b, a±1] + q[b±1, a]) − q = f` in place on one subgrid.
    fn solve_compact(&mut self, sub: &mut Array2<f64>) {
        let (ny, nx) = sub.dim();
        dst1_rows(&mut self.planner, sub);
        dst1_cols(&mut self.planner, sub);
        let tx = std::f64::consts::PI / (nx + 1) as f64;
        let ty = std::f64::consts::PI / (ny + 1) as f64;
        for ((l, k), v) in sub.indexed_iter_mut() {
            let lambda = 0.5 * (((k + 1) as f64 * tx).cos() + ((l + 1) as f64 * ty).cos()) - 1.0;
            *v /= lambda;
        }
        dst1_rows(&mut self.planner, sub);
        dst1_cols(&mut self.planner, sub);
        let norm = 4.0 / ((nx + 1) * (ny + 1)) as f64;
        sub.mapv_inplace(|v| v * norm);
    }
}
