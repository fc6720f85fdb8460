// ─────────────────────────────────────────────────────────────────────
// SCPN Flow Core — Distributed Sparse System
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Row-partitioned sparse matrix assembly with halo discovery.
//!
//! Each rank owns a contiguous range of global rows
//! `[row_cumsum[rank], row_cumsum[rank + 1])`. Rows whose columns are all
//! owned go to *local* storage; rows touching a column owned elsewhere go
//! to *boundary* storage and register that column with its owner.
//! [`DistributedSparseSystem::finalize`] is collective: ranks trade their
//! requested column lists and the result is an [`AssembledSystem`] in
//! local numbering together with the [`HaloPlan`] used by every
//! subsequent matrix-vector product.
//!
//! Local vector layout after finalize:
//!
//! ```text
//! [ lower halo | owned rows | upper halo ]
//!   ranks < me                ranks > me
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use flow_types::error::{FlowError, FlowResult};

use crate::comm::{Communicator, MessageTag, Payload, RequestSet};

// ───────────────────────────── triplets ──────────────────────────────

/// Coordinate-format entries. Duplicate (row, col) pairs accumulate.
#[derive(Debug, Clone, PartialEq)]
pub struct Triplets<I> {
    pub rows: Vec<I>,
    pub cols: Vec<I>,
    pub vals: Vec<f64>,
}

impl<I> Default for Triplets<I> {
    fn default() -> Self {
        Triplets {
            rows: Vec::new(),
            cols: Vec::new(),
            vals: Vec::new(),
        }
    }
}

impl<I: Copy> Triplets<I> {
    pub fn with_capacity(n: usize) -> Self {
        Triplets {
            rows: Vec::with_capacity(n),
            cols: Vec::with_capacity(n),
            vals: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, row: I, col: I, val: f64) {
        self.rows.push(row);
        self.cols.push(col);
        self.vals.push(val);
    }

    pub fn len(&self) -> usize {
        self.vals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (I, I, f64)> + '_ {
        self.rows
            .iter()
            .zip(self.cols.iter())
            .zip(self.vals.iter())
            .map(|((&r, &c), &v)| (r, c, v))
    }
}

/// One assembled matrix row in global numbering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpRow {
    pub index: i64,
    pub entries: Vec<(i64, f64)>,
    /// `(owner rank, global column)` for every column owned by another rank.
    pub remote: Vec<(usize, i64)>,
}

impl SpRow {
    pub fn new(index: i64) -> Self {
        SpRow {
            index,
            ..Default::default()
        }
    }

    pub fn push(&mut self, col: i64, val: f64) {
        self.entries.push((col, val));
    }

    pub fn push_remote(&mut self, owner: usize, col: i64, val: f64) {
        self.entries.push((col, val));
        self.remote.push((owner, col));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.remote.clear();
    }
}

// ───────────────────────────── builder ───────────────────────────────

/// Per-rank assembler. Consumed by [`finalize`](Self::finalize).
#[derive(Debug, Clone)]
pub struct DistributedSparseSystem {
    rank: usize,
    nranks: usize,
    local: Triplets<i64>,
    boundary: Triplets<i64>,
    recv_sets: Vec<BTreeSet<i64>>,
}

impl DistributedSparseSystem {
    pub fn new(rank: usize, nranks: usize) -> Self {
        DistributedSparseSystem {
            rank,
            nranks,
            local: Triplets::default(),
            boundary: Triplets::default(),
            recv_sets: vec![BTreeSet::new(); nranks],
        }
    }

    /// Clear all contents and size storage for `n` owned rows.
    pub fn reserve(&mut self, n: usize) {
        self.local = Triplets::with_capacity(6 * n);
        self.boundary = Triplets::with_capacity(n);
        self.recv_sets = vec![BTreeSet::new(); self.nranks];
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn nranks(&self) -> usize {
        self.nranks
    }

    /// Append an entry whose row and column are both owned by this rank.
    pub fn push_local_entry(&mut self, value: f64, row: i64, col: i64) {
        self.local.push(row, col, value);
    }

    /// Append a whole row; rows with remote columns go to boundary storage.
    pub fn push_row(&mut self, row: &SpRow) -> FlowResult<()> {
        if row.remote.is_empty() {
            for &(col, val) in &row.entries {
                self.local.push(row.index, col, val);
            }
            return Ok(());
        }
        for &(owner, col) in &row.remote {
            if owner >= self.nranks || owner == self.rank {
                return Err(FlowError::Partition(format!(
                    "row {} registers column {col} with invalid owner {owner} (rank {}, nranks {})",
                    row.index, self.rank, self.nranks
                )));
            }
            self.recv_sets[owner].insert(col);
        }
        for &(col, val) in &row.entries {
            self.boundary.push(row.index, col, val);
        }
        Ok(())
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    pub fn boundary_len(&self) -> usize {
        self.boundary.len()
    }

    /// Collective: exchange halo requests and convert to local numbering.
    ///
    /// Every rank of `comm` must call this with the same `row_cumsum`.
    pub fn finalize(
        self,
        row_cumsum: &[i64],
        comm: &dyn Communicator,
    ) -> FlowResult<AssembledSystem> {
        let rank = comm.rank();
        let nranks = comm.size();
        if rank != self.rank || nranks != self.nranks {
            return Err(FlowError::Partition(format!(
                "assembler built for rank {}/{} finalized on rank {rank}/{nranks}",
                self.rank, self.nranks
            )));
        }
        validate_row_cumsum(row_cumsum, nranks)?;

        let row_start = row_cumsum[rank];
        let owned = (row_cumsum[rank + 1] - row_start) as usize;

        // Sorted, deduplicated requests per owning rank.
        let requests: Vec<Vec<i64>> = self
            .recv_sets
            .into_iter()
            .map(|set| set.into_iter().collect())
            .collect();
        for (owner, cols) in requests.iter().enumerate() {
            let range = row_cumsum[owner]..row_cumsum[owner + 1];
            if let Some(&bad) = cols.iter().find(|c| !range.contains(c)) {
                return Err(FlowError::Partition(format!(
                    "column {bad} registered with rank {owner} which owns rows {range:?}"
                )));
            }
        }

        for peer in (0..nranks).filter(|&p| p != rank) {
            let cols = &requests[peer];
            comm.isend(peer, MessageTag::HaloSize, Payload::Count(cols.len()))?;
            if !cols.is_empty() {
                comm.isend(peer, MessageTag::HaloIndices, Payload::Indices(cols.clone()))?;
            }
        }
        let mut pending = RequestSet::default();
        for peer in (0..nranks).filter(|&p| p != rank) {
            let n = comm.recv(peer, MessageTag::HaloSize)?.into_count(peer)?;
            if n > 0 {
                pending.push(peer, comm.irecv(peer, MessageTag::HaloIndices));
            }
        }

        let lower: usize = requests[..rank].iter().map(Vec::len).sum();
        let upper: usize = requests[rank + 1..].iter().map(Vec::len).sum();
        let shift = lower as i64 - row_start;
        let owned_range = lower..lower + owned;
        let to_owned = |g: i64| -> Option<usize> {
            let s = g + shift;
            if s >= owned_range.start as i64 && s < owned_range.end as i64 {
                Some(s as usize)
            } else {
                None
            }
        };

        let mut halo_map = BTreeMap::new();
        let mut recv = Vec::new();
        let mut next_lower = 0usize;
        let mut next_upper = lower + owned;
        for (owner, cols) in requests.into_iter().enumerate() {
            if owner == rank || cols.is_empty() {
                continue;
            }
            let cursor = if owner < rank {
                &mut next_lower
            } else {
                &mut next_upper
            };
            let offset = *cursor;
            for (k, &g) in cols.iter().enumerate() {
                halo_map.insert(g, offset + k);
            }
            *cursor += cols.len();
            recv.push(HaloRecv {
                rank: owner,
                offset,
                columns: cols,
            });
        }

        let mut local = Triplets::with_capacity(self.local.len());
        for (r, c, v) in self.local.iter() {
            match (to_owned(r), to_owned(c)) {
                (Some(lr), Some(lc)) => local.push(lr, lc, v),
                _ => {
                    return Err(FlowError::Partition(format!(
                        "local entry ({r}, {c}) outside owned rows [{row_start}, {})",
                        row_cumsum[rank + 1]
                    )))
                }
            }
        }
        let mut boundary = Triplets::with_capacity(self.boundary.len());
        for (r, c, v) in self.boundary.iter() {
            let lr = to_owned(r).ok_or_else(|| {
                FlowError::Partition(format!("boundary row {r} not owned by rank {rank}"))
            })?;
            let lc = match to_owned(c) {
                Some(lc) => lc,
                None => *halo_map.get(&c).ok_or_else(|| {
                    FlowError::Partition(format!(
                        "boundary column {c} of row {r} is neither owned nor registered as remote"
                    ))
                })?,
            };
            boundary.push(lr, lc, v);
        }

        let mut send = Vec::with_capacity(pending.len());
        for (peer, payload) in pending.wait_all(comm)? {
            let slots = payload
                .into_indices(peer)?
                .into_iter()
                .map(|g| {
                    to_owned(g).ok_or_else(|| {
                        FlowError::Partition(format!(
                            "rank {peer} requested row {g} not owned by rank {rank}"
                        ))
                    })
                })
                .collect::<FlowResult<Vec<usize>>>()?;
            send.push(HaloSend { rank: peer, slots });
        }

        log::debug!(
            "rank {rank}: finalized {owned} rows, {} local + {} boundary entries, halo {lower}/{upper}",
            local.len(),
            boundary.len()
        );

        Ok(AssembledSystem {
            rank,
            nranks,
            row_cumsum: row_cumsum.to_vec(),
            local,
            boundary,
            plan: HaloPlan {
                lower,
                owned,
                upper,
                recv,
                send,
                halo_map,
            },
        })
    }
}

/// `row_cumsum` must have `nranks + 1` entries, start at zero and
/// strictly increase.
pub fn validate_row_cumsum(row_cumsum: &[i64], nranks: usize) -> FlowResult<()> {
    if row_cumsum.len() != nranks + 1 {
        return Err(FlowError::Partition(format!(
            "row_cumsum has {} entries, expected {}",
            row_cumsum.len(),
            nranks + 1
        )));
    }
    if row_cumsum[0] != 0 {
        return Err(FlowError::Partition(format!(
            "row_cumsum must start at 0, got {}",
            row_cumsum[0]
        )));
    }
    if let Some(w) = row_cumsum.windows(2).find(|w| w[1] <= w[0]) {
        return Err(FlowError::Partition(format!(
            "row_cumsum must be strictly increasing, found {} -> {}",
            w[0], w[1]
        )));
    }
    Ok(())
}

// ───────────────────────────── halo plan ─────────────────────────────

/// Slots `[offset, offset + columns.len())` receive `columns` from `rank`.
#[derive(Debug, Clone, PartialEq)]
pub struct HaloRecv {
    pub rank: usize,
    pub offset: usize,
    pub columns: Vec<i64>,
}

/// Owned slots whose values `rank` needs, in the order it requested them.
#[derive(Debug, Clone, PartialEq)]
pub struct HaloSend {
    pub rank: usize,
    pub slots: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HaloPlan {
    pub lower: usize,
    pub owned: usize,
    pub upper: usize,
    pub recv: Vec<HaloRecv>,
    pub send: Vec<HaloSend>,
    /// Global column → halo slot, halo columns only.
    pub halo_map: BTreeMap<i64, usize>,
}

impl HaloPlan {
    pub fn ext_len(&self) -> usize {
        self.lower + self.owned + self.upper
    }

    pub fn owned_range(&self) -> Range<usize> {
        self.lower..self.lower + self.owned
    }

    pub fn post_sends(&self, comm: &dyn Communicator, ext: &[f64]) -> FlowResult<()> {
        for s in &self.send {
            let vals = s.slots.iter().map(|&i| ext[i]).collect();
            comm.isend(s.rank, MessageTag::HaloValues, Payload::Values(vals))?;
        }
        Ok(())
    }

    pub fn complete_recvs(&self, comm: &dyn Communicator, ext: &mut [f64]) -> FlowResult<()> {
        for r in &self.recv {
            let vals = comm
                .recv(r.rank, MessageTag::HaloValues)?
                .into_values(r.rank)?;
            if vals.len() != r.columns.len() {
                return Err(FlowError::Communication {
                    peer: r.rank,
                    message: format!(
                        "halo carries {} values, expected {}",
                        vals.len(),
                        r.columns.len()
                    ),
                });
            }
            ext[r.offset..r.offset + vals.len()].copy_from_slice(&vals);
        }
        Ok(())
    }

    /// Fill the halo slots of `ext` from the owning ranks.
    pub fn exchange(&self, comm: &dyn Communicator, ext: &mut [f64]) -> FlowResult<()> {
        self.post_sends(comm, ext)?;
        self.complete_recvs(comm, ext)
    }
}

// ────────────────────────── assembled system ─────────────────────────

/// Finalized per-rank share of the matrix in local (extended) numbering.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledSystem {
    rank: usize,
    nranks: usize,
    row_cumsum: Vec<i64>,
    local: Triplets<usize>,
    boundary: Triplets<usize>,
    plan: HaloPlan,
}

impl AssembledSystem {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn nranks(&self) -> usize {
        self.nranks
    }

    pub fn row_cumsum(&self) -> &[i64] {
        &self.row_cumsum
    }

    pub fn row_start(&self) -> i64 {
        self.row_cumsum[self.rank]
    }

    pub fn global_rows(&self) -> usize {
        self.row_cumsum[self.nranks] as usize
    }

    pub fn owned_rows(&self) -> usize {
        self.plan.owned
    }

    pub fn ext_len(&self) -> usize {
        self.plan.ext_len()
    }

    pub fn local(&self) -> &Triplets<usize> {
        &self.local
    }

    pub fn boundary(&self) -> &Triplets<usize> {
        &self.boundary
    }

    pub fn plan(&self) -> &HaloPlan {
        &self.plan
    }

    /// All entries as `(row, col)` in extended numbering.
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.local.iter().chain(self.boundary.iter())
    }

    /// Diagonal of the owned block, indexed by owned row.
    pub fn diagonal(&self) -> Vec<f64> {
        let lower = self.plan.lower;
        let mut d = vec![0.0; self.plan.owned];
        for (r, c, v) in self.entries() {
            if r == c {
                d[r - lower] += v;
            }
        }
        d
    }

    /// `y = A x` given a fully populated extended vector.
    pub fn spmv_ext(&self, x_ext: &[f64], y: &mut [f64]) {
        let lower = self.plan.lower;
        y.fill(0.0);
        for (r, c, v) in self.entries() {
            y[r - lower] += v * x_ext[c];
        }
    }

    /// Collective `y = A x` on owned vectors. `ext` is scratch space.
    ///
    /// Halo values are in flight while the local block is applied.
    pub fn spmv(
        &self,
        comm: &dyn Communicator,
        x: &[f64],
        y: &mut [f64],
        ext: &mut Vec<f64>,
    ) -> FlowResult<()> {
        let owned = self.plan.owned;
        if x.len() != owned || y.len() != owned {
            return Err(FlowError::LinAlg(format!(
                "spmv expects vectors of length {owned}, got x={} y={}",
                x.len(),
                y.len()
            )));
        }
        let lower = self.plan.lower;
        ext.resize(self.plan.ext_len(), 0.0);
        ext[self.plan.owned_range()].copy_from_slice(x);
        self.plan.post_sends(comm, ext)?;

        y.fill(0.0);
        for (r, c, v) in self.local.iter() {
            y[r - lower] += v * ext[c];
        }
        self.plan.complete_recvs(comm, ext)?;
        for (r, c, v) in self.boundary.iter() {
            y[r - lower] += v * ext[c];
        }
        Ok(())
    }
}
