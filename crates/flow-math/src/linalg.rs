//! Linear algebra utilities.
//!
//! Small dense LU with partial pivoting and a banded LU used as the
//! direct sparse backend.

use ndarray::Array2;

use flow_types::error::{FlowError, FlowResult};

/// Solve a 3x3 system by Gaussian elimination with partial pivoting.
///
/// Used by the rigid-body velocity update. A pivot below `1e-14` times
/// the largest entry is reported as singular.
pub fn solve_3x3(a: [[f64; 3]; 3], b: [f64; 3]) -> FlowResult<[f64; 3]> {
    let scale = a
        .iter()
        .flat_map(|row| row.iter())
        .fold(0.0_f64, |m, v| m.max(v.abs()));
    if !scale.is_finite() || !b.iter().all(|v| v.is_finite()) {
        return Err(FlowError::LinAlg(
            "3x3 system contains non-finite values".to_string(),
        ));
    }
    if scale == 0.0 {
        return Err(FlowError::LinAlg("3x3 system matrix is zero".to_string()));
    }

    let mut m = a;
    let mut x = b;
    for k in 0..3 {
        let p = (k..3)
            .max_by(|&i, &j| m[i][k].abs().total_cmp(&m[j][k].abs()))
            .unwrap_or(k);
        if m[p][k].abs() < 1e-14 * scale {
            return Err(FlowError::LinAlg(format!(
                "3x3 system singular at column {k}"
            )));
        }
        m.swap(k, p);
        x.swap(k, p);
        for i in k + 1..3 {
            let l = m[i][k] / m[k][k];
            for j in k..3 {
                m[i][j] -= l * m[k][j];
            }
            x[i] -= l * x[k];
        }
    }
    for i in (0..3).rev() {
        let mut sum = x[i];
        for j in i + 1..3 {
            sum -= m[i][j] * x[j];
        }
        x[i] = sum / m[i][i];
    }
    Ok(x)
}

/// LU factorization of a banded matrix without pivoting.
///
/// Entry `(i, j)` lives at `lu[[i, j + kl - i]]`. Intended for the
/// diagonally dominant pressure operator, where elimination without
/// pivoting is stable and fill stays inside the band.
#[derive(Debug, Clone)]
pub struct BandedLu {
    n: usize,
    kl: usize,
    ku: usize,
    lu: Array2<f64>,
}

impl BandedLu {
    /// Factor the `n × n` matrix given by `(row, col, value)` entries.
    /// Duplicate entries accumulate.
    pub fn factor<I>(n: usize, entries: I) -> FlowResult<Self>
    where
        I: IntoIterator<Item = (usize, usize, f64)>,
    {
        let entries: Vec<(usize, usize, f64)> = entries.into_iter().collect();
        let mut kl = 0;
        let mut ku = 0;
        for &(i, j, v) in &entries {
            if i >= n || j >= n {
                return Err(FlowError::GridOutOfBounds { row: i, col: j });
            }
            if !v.is_finite() {
                return Err(FlowError::LinAlg(format!(
                    "non-finite matrix entry at ({i}, {j})"
                )));
            }
            kl = kl.max(i.saturating_sub(j));
            ku = ku.max(j.saturating_sub(i));
        }

        let mut lu = Array2::<f64>::zeros((n, kl + ku + 1));
        for (i, j, v) in entries {
            lu[[i, j + kl - i]] += v;
        }

        for k in 0..n {
            let piv = lu[[k, kl]];
            if piv.abs() < 1e-300 {
                return Err(FlowError::LinAlg(format!("zero pivot at row {k}")));
            }
            for i in k + 1..n.min(k + kl + 1) {
                let l = lu[[i, k + kl - i]] / piv;
                if l == 0.0 {
                    continue;
                }
                lu[[i, k + kl - i]] = l;
                for j in k + 1..n.min(k + ku + 1) {
                    lu[[i, j + kl - i]] -= l * lu[[k, j + kl - k]];
                }
            }
        }
        log::debug!("banded LU: n={n}, kl={kl}, ku={ku}");
        Ok(BandedLu { n, kl, ku, lu })
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    /// (lower, upper) bandwidth.
    pub fn bandwidth(&self) -> (usize, usize) {
        (self.kl, self.ku)
    }

    /// Overwrite `b` with the solution of `A x = b`.
    pub fn solve(&self, b: &mut [f64]) -> FlowResult<()> {
        let (n, kl, ku) = (self.n, self.kl, self.ku);
        if b.len() != n {
            return Err(FlowError::LinAlg(format!(
                "banded solve expects length {n}, got {}",
                b.len()
            )));
        }
        for i in 0..n {
            let mut sum = b[i];
            for k in i.saturating_sub(kl)..i {
                sum -= self.lu[[i, k + kl - i]] * b[k];
            }
            b[i] = sum;
        }
        for i in (0..n).rev() {
            let mut sum = b[i];
            for j in i + 1..n.min(i + ku + 1) {
                sum -= self.lu[[i, j + kl - i]] * b[j];
            }
            b[i] = sum / self.lu[[i, kl]];
        }
        Ok(())
    }
}
