// ─────────────────────────────────────────────────────────────────────
// SCPN Flow Core — GMRES
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Restarted GMRES(m) on a row-distributed [`AssembledSystem`].
//!
//! GMRES (Generalised Minimal RESidual) builds an orthonormal Krylov
//! basis via Arnoldi iteration with modified Gram-Schmidt, then solves
//! the projected least-squares problem using Givens rotations on the
//! upper Hessenberg matrix.  When the basis reaches size `m` without
//! convergence the solver restarts from the current approximate
//! solution.
//!
//! A left Jacobi preconditioner is applied: instead of `A x = b` we
//! solve `D⁻¹ A x = D⁻¹ b` with `D = diag(A)`.
//!
//! Every rank holds only its owned slice of each Krylov vector. Inner
//! products are all-reduced, so the small Hessenberg problem is
//! replicated bit-identically and every rank takes the same branches.

use flow_types::error::{FlowError, FlowResult};

use crate::comm::Communicator;
use crate::sparse::AssembledSystem;

// ───────────────────────────── configuration ─────────────────────────

/// Configuration for the GMRES(m) solver.
#[derive(Debug, Clone)]
pub struct GmresConfig {
    /// Krylov subspace dimension before restart (default: 40).
    pub restart: usize,
    /// Maximum number of outer (restart) iterations (default: 200).
    pub max_iter: usize,
    /// Absolute tolerance on the preconditioned residual (default: 1e-10).
    pub tol: f64,
    /// Tolerance relative to the initial preconditioned residual (default: 1e-8).
    pub tol_rel: f64,
}

impl Default for GmresConfig {
    fn default() -> Self {
        GmresConfig {
            restart: 40,
            max_iter: 200,
            tol: 1e-10,
            tol_rel: 1e-8,
        }
    }
}

/// Result of a GMRES solve.
#[derive(Debug, Clone)]
pub struct GmresResult {
    /// Total number of matrix-vector products (inner iterations summed
    /// over all restarts).
    pub iterations: usize,
    /// Final global L2 norm of the unpreconditioned residual.
    pub residual: f64,
    /// Whether convergence was achieved.
    pub converged: bool,
}

// ───────────────────────── BLAS-like helpers ─────────────────────────

/// Global dot product.
fn dot(comm: &dyn Communicator, a: &[f64], b: &[f64]) -> FlowResult<f64> {
    let mut s = [a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f64>()];
    comm.all_reduce_sum(&mut s)?;
    Ok(s[0])
}

/// Global Euclidean (L2) norm.
fn norm(comm: &dyn Communicator, v: &[f64]) -> FlowResult<f64> {
    Ok(dot(comm, v, v)?.sqrt())
}

/// `y = y + alpha * x` (axpy).
#[inline]
fn vec_axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    for (yi, &xi) in y.iter_mut().zip(x.iter()) {
        *yi += alpha * xi;
    }
}

/// `v = v ⊙ d` (Jacobi preconditioner application).
#[inline]
fn vec_mul(v: &mut [f64], d: &[f64]) {
    for (vi, di) in v.iter_mut().zip(d.iter()) {
        *vi *= di;
    }
}

/// `r = b - A x`, local slice.
fn residual(
    system: &AssembledSystem,
    comm: &dyn Communicator,
    b: &[f64],
    x: &[f64],
    ax: &mut [f64],
    ext: &mut Vec<f64>,
) -> FlowResult<Vec<f64>> {
    system.spmv(comm, x, ax, ext)?;
    Ok(b.iter().zip(ax.iter()).map(|(bi, ai)| bi - ai).collect())
}

// ───────────────────── Givens rotation helpers ──────────────────────

/// A single Givens rotation storing (c, s) such that
/// ```text
/// | c  s | | a |   | r |
/// |-s  c | | b | = | 0 |
/// ```
#[derive(Clone, Copy)]
struct GivensRotation {
    c: f64,
    s: f64,
}

impl GivensRotation {
    /// Compute the rotation that zeroes `b` in (a, b).
    fn compute(a: f64, b: f64) -> Self {
        if b.abs() < 1e-300 {
            GivensRotation { c: 1.0, s: 0.0 }
        } else if b.abs() > a.abs() {
            let tau = -a / b;
            let s = 1.0 / (1.0 + tau * tau).sqrt();
            let c = s * tau;
            GivensRotation { c, s }
        } else {
            let tau = -b / a;
            let c = 1.0 / (1.0 + tau * tau).sqrt();
            let s = c * tau;
            GivensRotation { c, s }
        }
    }

    #[inline]
    fn apply(&self, a: &mut f64, b: &mut f64) {
        let ta = *a;
        let tb = *b;
        *a = self.c * ta - self.s * tb;
        *b = self.s * ta + self.c * tb;
    }
}

// ─────────────────────────── main solver ─────────────────────────────

/// Solve `A x = b` collectively. `x` holds the owned slice of the
/// initial guess on entry and of the solution on exit.
///
/// A zero diagonal entry is a [`FlowError::LinAlg`] error. Exhausting the
/// restart budget is not an error; check [`GmresResult::converged`].
pub fn gmres_solve(
    system: &AssembledSystem,
    comm: &dyn Communicator,
    b: &[f64],
    x: &mut [f64],
    config: &GmresConfig,
) -> FlowResult<GmresResult> {
    let n = system.owned_rows();
    if b.len() != n || x.len() != n {
        return Err(FlowError::LinAlg(format!(
            "GMRES expects vectors of length {n}, got b={} x={}",
            b.len(),
            x.len()
        )));
    }
    if !b.iter().chain(x.iter()).all(|v| v.is_finite()) {
        return Err(FlowError::PhysicsViolation(
            "GMRES input contains non-finite values".to_string(),
        ));
    }

    let diag = system.diagonal();
    if let Some(k) = diag.iter().position(|d| d.abs() < 1e-300) {
        return Err(FlowError::LinAlg(format!(
            "zero diagonal at owned row {k}, Jacobi preconditioner undefined"
        )));
    }
    let inv_diag: Vec<f64> = diag.iter().map(|d| 1.0 / d).collect();

    let m = config.restart.clamp(1, system.global_rows().max(1));
    let mut ext = Vec::with_capacity(system.ext_len());
    let mut av = vec![0.0; n];

    let mut r = residual(system, comm, b, x, &mut av, &mut ext)?;
    let initial_res_norm = norm(comm, &r)?;
    if initial_res_norm < 1e-300 {
        return Ok(GmresResult {
            iterations: 0,
            residual: initial_res_norm,
            converged: true,
        });
    }
    vec_mul(&mut r, &inv_diag);
    let abs_tol = config.tol.max(config.tol_rel * norm(comm, &r)?);

    let mut total_iters: usize = 0;
    let mut converged = false;

    // ───── outer restart loop ─────
    for restart in 0..config.max_iter {
        if restart > 0 {
            r = residual(system, comm, b, x, &mut av, &mut ext)?;
            vec_mul(&mut r, &inv_diag);
        }
        let beta = norm(comm, &r)?;
        if beta < abs_tol {
            converged = true;
            break;
        }

        let mut v_basis: Vec<Vec<f64>> = Vec::with_capacity(m + 1);
        v_basis.push(r.iter().map(|ri| ri / beta).collect());

        // Upper Hessenberg matrix H[(m+1) x m] stored column-major
        // H[i][j] => h_store[j * (m+1) + i]
        let h_rows = m + 1;
        let mut h_store = vec![0.0; h_rows * m];
        let mut givens: Vec<GivensRotation> = Vec::with_capacity(m);
        let mut g = vec![0.0; m + 1];
        g[0] = beta;

        let mut converged_inner = false;
        let mut inner_iters: usize = 0;

        // ───── Arnoldi iteration ─────
        for j in 0..m {
            inner_iters = j + 1;
            total_iters += 1;

            let mut w = vec![0.0; n];
            system.spmv(comm, &v_basis[j], &mut w, &mut ext)?;
            vec_mul(&mut w, &inv_diag);

            // Modified Gram-Schmidt orthogonalisation
            for i in 0..=j {
                let h_ij = dot(comm, &w, &v_basis[i])?;
                h_store[j * h_rows + i] = h_ij;
                vec_axpy(-h_ij, &v_basis[i], &mut w);
            }

            let h_jp1_j = norm(comm, &w)?;
            h_store[j * h_rows + (j + 1)] = h_jp1_j;
            if h_jp1_j > 1e-300 {
                v_basis.push(w.iter().map(|wi| wi / h_jp1_j).collect());
            } else {
                v_basis.push(vec![0.0; n]);
            }

            for (i, rot) in givens.iter().enumerate() {
                let mut ha = h_store[j * h_rows + i];
                let mut hb = h_store[j * h_rows + i + 1];
                rot.apply(&mut ha, &mut hb);
                h_store[j * h_rows + i] = ha;
                h_store[j * h_rows + i + 1] = hb;
            }

            let rot =
                GivensRotation::compute(h_store[j * h_rows + j], h_store[j * h_rows + (j + 1)]);
            {
                let mut ha = h_store[j * h_rows + j];
                let mut hb = h_store[j * h_rows + (j + 1)];
                rot.apply(&mut ha, &mut hb);
                h_store[j * h_rows + j] = ha;
                h_store[j * h_rows + (j + 1)] = hb;
            }
            {
                let mut ga = g[j];
                let mut gb = g[j + 1];
                rot.apply(&mut ga, &mut gb);
                g[j] = ga;
                g[j + 1] = gb;
            }
            givens.push(rot);

            let res_est = g[j + 1].abs();
            log::trace!("gmres restart {restart} step {j}: |r| ~ {res_est:.3e}");
            if res_est < abs_tol || h_jp1_j < 1e-300 {
                converged_inner = true;
                break;
            }
        }

        // ───── solve the upper triangular system H y = g ─────
        let k = inner_iters;
        let mut y = vec![0.0; k];
        for i in (0..k).rev() {
            let mut sum = g[i];
            for jj in (i + 1)..k {
                sum -= h_store[jj * h_rows + i] * y[jj];
            }
            let d = h_store[i * h_rows + i];
            y[i] = if d.abs() > 1e-300 { sum / d } else { 0.0 };
        }
        for (yi, vi) in y.iter().zip(v_basis.iter()) {
            vec_axpy(*yi, vi, x);
        }

        if converged_inner {
            converged = true;
            break;
        }
    }

    let r = residual(system, comm, b, x, &mut av, &mut ext)?;
    let final_residual = norm(comm, &r)?;
    let mut z = r;
    vec_mul(&mut z, &inv_diag);
    converged = converged || norm(comm, &z)? <= abs_tol;
    if !final_residual.is_finite() {
        return Err(FlowError::SolverDiverged {
            iteration: total_iters,
            message: "GMRES residual became non-finite".to_string(),
        });
    }
    if !converged {
        log::warn!(
            "GMRES not converged after {total_iters} iterations: residual {final_residual:.3e}"
        );
    }
    Ok(GmresResult {
        iterations: total_iters,
        residual: final_residual,
        converged,
    })
}

// ═══════════════════════════════ tests ═══════════════════════════════
