// ─────────────────────────────────────────────────────────────────────
// SCPN Flow Core — Block Grid
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Block decomposition, global row numbering and ghost-cell exchange.
//!
//! The domain is tiled by square blocks of `bs × bs` cells. Each block
//! belongs to exactly one rank. Global rows are numbered rank-major, then
//! by ascending block id, then by intra-block offset `ix + iy·bs`, which
//! makes each rank's rows one contiguous range of `row_cumsum`.
//!
//! [`BlockField`] stores one padded `(ncomp, bs + 2, bs + 2)` array per
//! locally owned block. [`BlockField::fill_ghosts`] refreshes the
//! one-cell ghost ring from face neighbours: local copies directly,
//! remote faces bundled into one message per neighbouring rank.

use ndarray::Array3;
use rayon::prelude::*;

use flow_math::comm::{Communicator, MessageTag, Payload};
use flow_types::config::SimulationConfig;
use flow_types::error::{FlowError, FlowResult};
use flow_types::state::BlockLayout;

/// Face directions in exchange order: -x, +x, -y, +y.
pub const FACES: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: usize,
    pub owner: usize,
    pub coords: (usize, usize),
    /// Global row of cell (0, 0).
    pub row_offset: i64,
}

/// One face strip crossing a rank boundary: `src_block`'s cells on
/// `face` fill the opposite ghost face of `dst_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GhostLink {
    src_block: usize,
    face: usize,
    dst_block: usize,
}

/// Per-peer face strips, ordered by source block then face.
#[derive(Debug, Clone, PartialEq, Eq)]
struct GhostRoute {
    rank: usize,
    links: Vec<GhostLink>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockGrid {
    layout: BlockLayout,
    rank: usize,
    nranks: usize,
    blocks: Vec<BlockInfo>,
    local_ids: Vec<usize>,
    local_pos: Vec<Option<usize>>,
    row_cumsum: Vec<i64>,
    sends: Vec<GhostRoute>,
    recvs: Vec<GhostRoute>,
}

/// Split `n` items into `k` near-equal contiguous counts.
fn balanced_split(n: usize, k: usize) -> Vec<usize> {
    let base = n / k;
    let rem = n % k;
    (0..k).map(|i| base + usize::from(i < rem)).collect()
}

impl BlockGrid {
    /// Contiguous, balanced assignment of block ids to ranks.
    pub fn new(layout: BlockLayout, rank: usize, nranks: usize) -> FlowResult<Self> {
        if nranks == 0 {
            return Err(FlowError::Partition("nranks must be >= 1".to_string()));
        }
        let n = layout.n_blocks();
        if nranks > n {
            return Err(FlowError::Partition(format!(
                "Cannot split {n} blocks across {nranks} ranks"
            )));
        }
        let owners = balanced_split(n, nranks)
            .into_iter()
            .enumerate()
            .flat_map(|(r, count)| std::iter::repeat(r).take(count))
            .collect();
        Self::with_owners(layout, rank, owners)
    }

    /// Explicit block → rank assignment. Every rank must own a block.
    pub fn with_owners(layout: BlockLayout, rank: usize, owners: Vec<usize>) -> FlowResult<Self> {
        if layout.blocks_x == 0 || layout.blocks_y == 0 || layout.block_size == 0 {
            return Err(FlowError::ConfigError(format!(
                "degenerate block layout {}x{} blocks of {}",
                layout.blocks_x, layout.blocks_y, layout.block_size
            )));
        }
        if !layout.h.is_finite() || layout.h <= 0.0 {
            return Err(FlowError::ConfigError(format!(
                "grid spacing must be finite and > 0, got {}",
                layout.h
            )));
        }
        let n = layout.n_blocks();
        if owners.len() != n {
            return Err(FlowError::Partition(format!(
                "owner list has {} entries for {n} blocks",
                owners.len()
            )));
        }
        let nranks = owners.iter().max().map_or(0, |m| m + 1);
        if rank >= nranks {
            return Err(FlowError::Partition(format!(
                "rank {rank} owns no blocks (nranks {nranks})"
            )));
        }
        let mut per_rank = vec![0usize; nranks];
        for &o in &owners {
            per_rank[o] += 1;
        }
        if let Some(empty) = per_rank.iter().position(|&c| c == 0) {
            return Err(FlowError::Partition(format!("rank {empty} owns no blocks")));
        }

        let cpb = layout.cells_per_block() as i64;
        let mut row_cumsum = vec![0i64; nranks + 1];
        for r in 0..nranks {
            row_cumsum[r + 1] = row_cumsum[r] + per_rank[r] as i64 * cpb;
        }
        let mut cursor = row_cumsum.clone();
        let blocks: Vec<BlockInfo> = owners
            .iter()
            .enumerate()
            .map(|(id, &owner)| {
                let row_offset = cursor[owner];
                cursor[owner] += cpb;
                BlockInfo {
                    id,
                    owner,
                    coords: layout.block_coords(id),
                    row_offset,
                }
            })
            .collect();

        let local_ids: Vec<usize> = (0..n).filter(|&id| owners[id] == rank).collect();
        let mut local_pos = vec![None; n];
        for (pos, &id) in local_ids.iter().enumerate() {
            local_pos[id] = Some(pos);
        }

        let mut grid = BlockGrid {
            layout,
            rank,
            nranks,
            blocks,
            local_ids,
            local_pos,
            row_cumsum,
            sends: Vec::new(),
            recvs: Vec::new(),
        };
        grid.sends = grid.routes(|src_owner, dst_owner| (src_owner == rank).then_some(dst_owner));
        grid.recvs = grid.routes(|src_owner, dst_owner| (dst_owner == rank).then_some(src_owner));
        log::debug!(
            "rank {rank}/{nranks}: {} blocks, rows {}..{}, {} send / {} recv peers",
            grid.local_ids.len(),
            grid.row_cumsum[rank],
            grid.row_cumsum[rank + 1],
            grid.sends.len(),
            grid.recvs.len()
        );
        Ok(grid)
    }

    /// Cross-rank face links grouped by the peer `select` picks.
    fn routes(&self, select: impl Fn(usize, usize) -> Option<usize>) -> Vec<GhostRoute> {
        let mut per_peer: Vec<Vec<GhostLink>> = vec![Vec::new(); self.nranks];
        for b in &self.blocks {
            for (face, &(dx, dy)) in FACES.iter().enumerate() {
                let Some(dst) = self.neighbor(b.id, dx, dy) else {
                    continue;
                };
                let dst_owner = self.blocks[dst].owner;
                if dst_owner == b.owner {
                    continue;
                }
                if let Some(peer) = select(b.owner, dst_owner) {
                    per_peer[peer].push(GhostLink {
                        src_block: b.id,
                        face,
                        dst_block: dst,
                    });
                }
            }
        }
        per_peer
            .into_iter()
            .enumerate()
            .filter(|(_, links)| !links.is_empty())
            .map(|(rank, links)| GhostRoute { rank, links })
            .collect()
    }

    pub fn from_config(cfg: &SimulationConfig, rank: usize, nranks: usize) -> FlowResult<Self> {
        cfg.validate()?;
        Self::new(cfg.create_layout(), rank, nranks)
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    pub fn h(&self) -> f64 {
        self.layout.h
    }

    pub fn block_size(&self) -> usize {
        self.layout.block_size
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn nranks(&self) -> usize {
        self.nranks
    }

    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, id: usize) -> &BlockInfo {
        &self.blocks[id]
    }

    pub fn blocks(&self) -> &[BlockInfo] {
        &self.blocks
    }

    /// Ids of blocks owned by this rank, ascending.
    pub fn local_blocks(&self) -> &[usize] {
        &self.local_ids
    }

    /// Position of a block in this rank's storage.
    pub fn local_position(&self, id: usize) -> Option<usize> {
        self.local_pos.get(id).copied().flatten()
    }

    pub fn owner_of(&self, id: usize) -> usize {
        self.blocks[id].owner
    }

    pub fn row_cumsum(&self) -> &[i64] {
        &self.row_cumsum
    }

    pub fn owned_rows(&self) -> usize {
        (self.row_cumsum[self.rank + 1] - self.row_cumsum[self.rank]) as usize
    }

    pub fn global_row(&self, id: usize, ix: usize, iy: usize) -> i64 {
        self.blocks[id].row_offset + (iy * self.layout.block_size + ix) as i64
    }

    /// Global cell coordinates of cell (ix, iy) of a block.
    pub fn global_cell(&self, id: usize, ix: usize, iy: usize) -> (usize, usize) {
        let (bx, by) = self.blocks[id].coords;
        let bs = self.layout.block_size;
        (bx * bs + ix, by * bs + iy)
    }

    /// Block and intra-block offset of global cell (gx, gy); `None` outside.
    pub fn locate(&self, gx: isize, gy: isize) -> Option<(usize, usize, usize)> {
        if gx < 0 || gy < 0 {
            return None;
        }
        let (gx, gy) = (gx as usize, gy as usize);
        if gx >= self.layout.cells_x() || gy >= self.layout.cells_y() {
            return None;
        }
        let bs = self.layout.block_size;
        let id = (gy / bs) * self.layout.blocks_x + gx / bs;
        Some((id, gx % bs, gy % bs))
    }

    pub fn neighbor(&self, id: usize, dx: isize, dy: isize) -> Option<usize> {
        let (bx, by) = self.blocks[id].coords;
        let nx = bx as isize + dx;
        let ny = by as isize + dy;
        if nx < 0 || ny < 0 || nx >= self.layout.blocks_x as isize || ny >= self.layout.blocks_y as isize
        {
            return None;
        }
        Some(ny as usize * self.layout.blocks_x + nx as usize)
    }

    pub fn cell_center(&self, id: usize, ix: usize, iy: usize) -> [f64; 2] {
        self.layout.cell_center(id, ix, iy)
    }
}

// ───────────────────────────── fields ────────────────────────────────

/// Value assigned to ghost cells on the physical domain boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryCondition {
    /// Copy the adjacent interior cell.
    ZeroGradient,
    /// Ghost value is zero.
    Zero,
}

/// Interior cells adjacent to `face`, ordered along the face.
fn face_cell(bs: usize, face: (isize, isize), k: usize) -> (isize, isize) {
    let last = bs as isize - 1;
    let k = k as isize;
    match face {
        (-1, 0) => (0, k),
        (1, 0) => (last, k),
        (0, -1) => (k, 0),
        _ => (k, last),
    }
}

/// Ghost cells beyond `face`, ordered along the face.
fn ghost_cell(bs: usize, face: (isize, isize), k: usize) -> (isize, isize) {
    let b = bs as isize;
    let k = k as isize;
    match face {
        (-1, 0) => (-1, k),
        (1, 0) => (b, k),
        (0, -1) => (k, -1),
        _ => (k, b),
    }
}

#[inline]
fn idx(c: usize, ix: isize, iy: isize) -> [usize; 3] {
    [c, (iy + 1) as usize, (ix + 1) as usize]
}

/// Multi-component cell field over the locally owned blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockField {
    ncomp: usize,
    bs: usize,
    blocks: Vec<Array3<f64>>,
}

impl BlockField {
    pub fn zeros(grid: &BlockGrid, ncomp: usize) -> Self {
        let bs = grid.block_size();
        BlockField {
            ncomp,
            bs,
            blocks: (0..grid.local_blocks().len())
                .map(|_| Array3::zeros((ncomp, bs + 2, bs + 2)))
                .collect(),
        }
    }

    /// Initialize interior cells from a function of the cell center.
    pub fn from_fn<F>(grid: &BlockGrid, ncomp: usize, f: F) -> Self
    where
        F: Fn([f64; 2]) -> Vec<f64> + Sync,
    {
        let mut field = Self::zeros(grid, ncomp);
        let bs = field.bs;
        let ids = grid.local_blocks();
        field
            .blocks
            .par_iter_mut()
            .zip(ids.par_iter())
            .for_each(|(a, &id)| {
                for iy in 0..bs {
                    for ix in 0..bs {
                        let v = f(grid.cell_center(id, ix, iy));
                        for (c, &vc) in v.iter().take(ncomp).enumerate() {
                            a[[c, iy + 1, ix + 1]] = vc;
                        }
                    }
                }
            });
        field
    }

    pub fn ncomp(&self) -> usize {
        self.ncomp
    }

    pub fn block_size(&self) -> usize {
        self.bs
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, pos: usize) -> &Array3<f64> {
        &self.blocks[pos]
    }

    pub fn blocks(&self) -> &[Array3<f64>] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut [Array3<f64>] {
        &mut self.blocks
    }

    /// Interior value; `ix`, `iy` may be -1 or `bs` to address ghosts.
    #[inline]
    pub fn at(&self, pos: usize, c: usize, ix: isize, iy: isize) -> f64 {
        self.blocks[pos][idx(c, ix, iy)]
    }

    #[inline]
    pub fn set(&mut self, pos: usize, c: usize, ix: usize, iy: usize, v: f64) {
        self.blocks[pos][[c, iy + 1, ix + 1]] = v;
    }

    pub fn fill(&mut self, v: f64) {
        for b in &mut self.blocks {
            b.fill(v);
        }
    }

    fn check_compatible(&self, other: &BlockField) -> FlowResult<()> {
        if self.ncomp != other.ncomp || self.bs != other.bs || self.blocks.len() != other.blocks.len() {
            return Err(FlowError::PhysicsViolation(format!(
                "field shape mismatch: {} comps x {} blocks of {} vs {} comps x {} blocks of {}",
                self.ncomp,
                self.blocks.len(),
                self.bs,
                other.ncomp,
                other.blocks.len(),
                other.bs
            )));
        }
        Ok(())
    }

    /// Copy all values (ghosts included) from a field of the same shape.
    pub fn assign(&mut self, other: &BlockField) -> FlowResult<()> {
        self.check_compatible(other)?;
        self.blocks
            .par_iter_mut()
            .zip(other.blocks.par_iter())
            .for_each(|(a, b)| a.assign(b));
        Ok(())
    }

    /// Component `c` of the interior cells in owned-row order.
    pub fn to_row_vec(&self, c: usize) -> Vec<f64> {
        let bs = self.bs;
        let mut out = Vec::with_capacity(self.blocks.len() * bs * bs);
        for a in &self.blocks {
            for iy in 0..bs {
                for ix in 0..bs {
                    out.push(a[[c, iy + 1, ix + 1]]);
                }
            }
        }
        out
    }

    /// Inverse of [`to_row_vec`](Self::to_row_vec).
    pub fn copy_from_row_vec(&mut self, c: usize, v: &[f64]) -> FlowResult<()> {
        let bs = self.bs;
        let cpb = bs * bs;
        if v.len() != self.blocks.len() * cpb {
            return Err(FlowError::PhysicsViolation(format!(
                "row vector has {} entries, field holds {}",
                v.len(),
                self.blocks.len() * cpb
            )));
        }
        self.blocks
            .par_iter_mut()
            .zip(v.par_chunks(cpb))
            .for_each(|(a, chunk)| {
                for iy in 0..bs {
                    for ix in 0..bs {
                        a[[c, iy + 1, ix + 1]] = chunk[iy * bs + ix];
                    }
                }
            });
        Ok(())
    }

    /// Largest absolute interior value of component `c` on this rank.
    pub fn max_abs(&self, c: usize) -> f64 {
        let bs = self.bs;
        self.blocks
            .iter()
            .flat_map(|a| {
                (0..bs).flat_map(move |iy| (0..bs).map(move |ix| a[[c, iy + 1, ix + 1]].abs()))
            })
            .fold(0.0, f64::max)
    }

    fn pack_face(&self, pos: usize, face: (isize, isize), out: &mut Vec<f64>) {
        for c in 0..self.ncomp {
            for k in 0..self.bs {
                let (ix, iy) = face_cell(self.bs, face, k);
                out.push(self.at(pos, c, ix, iy));
            }
        }
    }

    fn unpack_ghost(&mut self, pos: usize, face: (isize, isize), vals: &[f64]) {
        let bs = self.bs;
        for c in 0..self.ncomp {
            for k in 0..bs {
                let (ix, iy) = ghost_cell(bs, face, k);
                self.blocks[pos][idx(c, ix, iy)] = vals[c * bs + k];
            }
        }
    }

    /// Refresh the face ghosts of every local block. Collective.
    pub fn fill_ghosts(
        &mut self,
        grid: &BlockGrid,
        comm: &dyn Communicator,
        bc: BoundaryCondition,
    ) -> FlowResult<()> {
        if self.blocks.len() != grid.local_blocks().len() || self.bs != grid.block_size() {
            return Err(FlowError::PhysicsViolation(
                "field does not match grid decomposition".to_string(),
            ));
        }
        let strip = self.ncomp * self.bs;

        for route in &grid.sends {
            let mut buf = Vec::with_capacity(route.links.len() * strip);
            for link in &route.links {
                let pos = grid
                    .local_position(link.src_block)
                    .ok_or_else(|| FlowError::Partition(format!("block {} not local", link.src_block)))?;
                self.pack_face(pos, FACES[link.face], &mut buf);
            }
            comm.isend(route.rank, MessageTag::GhostCells, Payload::Values(buf))?;
        }

        let mut scratch = Vec::with_capacity(strip);
        for pos in 0..self.blocks.len() {
            let id = grid.local_blocks()[pos];
            for &face in &FACES {
                scratch.clear();
                match grid.neighbor(id, face.0, face.1) {
                    None => match bc {
                        BoundaryCondition::Zero => scratch.resize(strip, 0.0),
                        BoundaryCondition::ZeroGradient => self.pack_face(pos, face, &mut scratch),
                    },
                    Some(nb) => match grid.local_position(nb) {
                        Some(npos) => self.pack_face(npos, (-face.0, -face.1), &mut scratch),
                        None => continue,
                    },
                }
                let vals = std::mem::take(&mut scratch);
                self.unpack_ghost(pos, face, &vals);
                scratch = vals;
            }
        }

        for route in &grid.recvs {
            let vals = comm
                .recv(route.rank, MessageTag::GhostCells)?
                .into_values(route.rank)?;
            if vals.len() != route.links.len() * strip {
                return Err(FlowError::Communication {
                    peer: route.rank,
                    message: format!(
                        "ghost bundle carries {} values, expected {}",
                        vals.len(),
                        route.links.len() * strip
                    ),
                });
            }
            for (link, chunk) in route.links.iter().zip(vals.chunks(strip)) {
                let pos = grid
                    .local_position(link.dst_block)
                    .ok_or_else(|| FlowError::Partition(format!("block {} not local", link.dst_block)))?;
                let (dx, dy) = FACES[link.face];
                self.unpack_ghost(pos, (-dx, -dy), chunk);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_math::comm::SelfComm;

    fn layout(bx: usize, by: usize, bs: usize) -> BlockLayout {
        BlockLayout::new(bx, by, bs, 1.0 / (bx * bs) as f64)
    }

    #[test]
    fn test_balanced_split_covers() {
        assert_eq!(balanced_split(10, 3), vec![4, 3, 3]);
        assert_eq!(balanced_split(4, 4), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_row_numbering_single_rank() {
        let g = BlockGrid::new(layout(2, 2, 4), 0, 1).expect("grid");
        assert_eq!(g.row_cumsum(), &[0, 64]);
        assert_eq!(g.global_row(0, 0, 0), 0);
        assert_eq!(g.global_row(0, 3, 1), 7);
        assert_eq!(g.global_row(3, 0, 0), 48);
        assert_eq!(g.locate(5, 6), Some((3, 1, 2)));
        assert_eq!(g.locate(-1, 0), None);
        assert_eq!(g.locate(8, 0), None);
    }

    #[test]
    fn test_rows_rank_major_with_custom_owners() {
        // Rank 1 owns blocks 0 and 3, rank 0 owns 1 and 2.
        let owners = vec![1, 0, 0, 1];
        let g = BlockGrid::with_owners(layout(2, 2, 2), 1, owners).expect("grid");
        assert_eq!(g.row_cumsum(), &[0, 8, 16]);
        assert_eq!(g.block(1).row_offset, 0);
        assert_eq!(g.block(2).row_offset, 4);
        assert_eq!(g.block(0).row_offset, 8);
        assert_eq!(g.block(3).row_offset, 12);
        assert_eq!(g.local_blocks(), &[0, 3]);
        assert_eq!(g.owned_rows(), 8);
    }

    #[test]
    fn test_rejects_bad_partitions() {
        assert!(BlockGrid::new(layout(1, 2, 4), 0, 3).is_err());
        let err = BlockGrid::with_owners(layout(2, 1, 4), 0, vec![0, 2]).expect_err("rank 1 empty");
        match err {
            FlowError::Partition(msg) => assert!(msg.contains("owns no blocks")),
            other => panic!("Unexpected error: {other:?}"),
        }
        assert!(BlockGrid::with_owners(layout(2, 1, 4), 0, vec![0]).is_err());
    }

    #[test]
    fn test_fill_ghosts_single_rank() {
        let g = BlockGrid::new(layout(2, 2, 4), 0, 1).expect("grid");
        let mut f = BlockField::from_fn(&g, 1, |p| vec![p[0] * 100.0 + p[1]]);
        let comm = SelfComm::new();
        f.fill_ghosts(&g, &comm, BoundaryCondition::ZeroGradient)
            .expect("ghosts");
        let h = g.h();
        // Block 0 right ghost is block 1's first column.
        let pos0 = g.local_position(0).expect("local");
        let want = (4.5 * h) * 100.0 + 1.5 * h;
        assert!((f.at(pos0, 0, 4, 1) - want).abs() < 1e-12);
        // Left physical boundary copies the interior.
        assert_eq!(f.at(pos0, 0, -1, 2), f.at(pos0, 0, 0, 2));

        f.fill_ghosts(&g, &comm, BoundaryCondition::Zero).expect("ghosts");
        assert_eq!(f.at(pos0, 0, -1, 2), 0.0);
        assert!((f.at(pos0, 0, 4, 1) - want).abs() < 1e-12);
    }

    #[test]
    fn test_row_vec_roundtrip_order() {
        let g = BlockGrid::new(layout(2, 1, 2), 0, 1).expect("grid");
        let mut f = BlockField::zeros(&g, 2);
        let v: Vec<f64> = (0..8).map(|i| i as f64).collect();
        f.copy_from_row_vec(1, &v).expect("copy");
        assert_eq!(f.at(1, 1, 1, 0), 5.0);
        assert_eq!(f.to_row_vec(1), v);
        assert!(f.to_row_vec(0).iter().all(|&x| x == 0.0));
        assert!(f.copy_from_row_vec(0, &v[..3]).is_err());
        assert_eq!(f.max_abs(1), 7.0);
        assert_eq!(f.max_abs(0), 0.0);
        f.set(0, 0, 1, 1, -9.0);
        assert_eq!(f.max_abs(0), 9.0);
    }

    #[test]
    fn test_assign_rejects_mismatch() {
        let g = BlockGrid::new(layout(2, 1, 2), 0, 1).expect("grid");
        let mut a = BlockField::zeros(&g, 2);
        let b = BlockField::zeros(&g, 1);
        assert!(a.assign(&b).is_err());
    }
}
