use flock_common::{FlockParams, Vec3};
use rayon::prelude::*;

use crate::flock::{Accumulator, AgentSnapshot, NeighborInfluence};

/// Upper bound on grid cells per agent before the cell size is widened.
const MAX_CELLS_PER_AGENT: usize = 8;
const MIN_GRID_CELLS: usize = 64;
/// Marks agents with non-finite positions; they are kept out of every cell.
const UNPLACED: u32 = u32::MAX;

/// Uniform 3D grid over one snapshot array, built with a counting sort.
///
/// Cells are at least one perception radius wide, so every flockmate of an
/// agent lies in the 3x3x3 block around the agent's own cell.
#[derive(Debug)]
pub struct NeighborGrid {
    origin: Vec3,
    inv_cell_size: f32,
    dims: [usize; 3],
    /// Grid cell index for each agent (`UNPLACED` for non-finite positions).
    agent_cells: Vec<u32>,
    cell_counts: Vec<u32>,
    cell_starts: Vec<u32>,
    /// Agent indices sorted by cell.
    cell_agent_indices: Vec<u32>,
}

impl NeighborGrid {
    pub fn build(snapshots: &[AgentSnapshot], perception_radius: f32) -> Self {
        let (origin, extent) = finite_bounds(snapshots);

        let max_cells = (snapshots.len() * MAX_CELLS_PER_AGENT).max(MIN_GRID_CELLS);
        let mut cell_size = perception_radius;
        let mut dims = dims_for(extent, cell_size);
        while cell_total(dims) > max_cells {
            cell_size *= 2.0;
            dims = dims_for(extent, cell_size);
        }
        let inv_cell_size = 1.0 / cell_size;
        let num_cells = cell_total(dims);

        let mut grid = Self {
            origin,
            inv_cell_size,
            dims,
            agent_cells: Vec::with_capacity(snapshots.len()),
            cell_counts: vec![0; num_cells],
            cell_starts: vec![0; num_cells],
            cell_agent_indices: Vec::new(),
        };

        // Phase 1: assign a cell to each agent and count.
        for snap in snapshots {
            let cell = match grid.cell_coords(snap.position) {
                Some(c) => {
                    let idx = grid.flat_index(c);
                    grid.cell_counts[idx] += 1;
                    idx as u32
                }
                None => UNPLACED,
            };
            grid.agent_cells.push(cell);
        }

        // Phase 2: prefix sum for cell start offsets.
        let mut total = 0u32;
        for (start, count) in grid.cell_starts.iter_mut().zip(&grid.cell_counts) {
            *start = total;
            total += count;
        }

        // Phase 3: scatter agent indices into their cell blocks.
        let mut write_offsets = grid.cell_starts.clone();
        grid.cell_agent_indices = vec![0; total as usize];
        for (agent_idx, &cell) in grid.agent_cells.iter().enumerate() {
            if cell == UNPLACED {
                continue;
            }
            let slot = &mut write_offsets[cell as usize];
            grid.cell_agent_indices[*slot as usize] = agent_idx as u32;
            *slot += 1;
        }

        log::trace!(
            "Built neighbor grid {}x{}x{} (cell size {:.3}) for {} agents.",
            dims[0], dims[1], dims[2], cell_size, snapshots.len()
        );
        grid
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Calls `f` with every agent index sharing the 3x3x3 cell block around `idx`, excluding `idx`.
    pub fn for_each_candidate<F>(&self, idx: usize, mut f: F)
    where
        F: FnMut(usize),
    {
        let cell = self.agent_cells[idx];
        if cell == UNPLACED {
            return;
        }
        let center = self.unflatten(cell as usize);
        for dz in -1i64..=1 {
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let c = [center[0] as i64 + dx, center[1] as i64 + dy, center[2] as i64 + dz];
                    if c.iter().zip(&self.dims).any(|(&v, &d)| v < 0 || v >= d as i64) {
                        continue;
                    }
                    let flat = self.flat_index([c[0] as usize, c[1] as usize, c[2] as usize]);
                    let start = self.cell_starts[flat] as usize;
                    let end = start + self.cell_counts[flat] as usize;
                    for &other in &self.cell_agent_indices[start..end] {
                        if other as usize != idx {
                            f(other as usize);
                        }
                    }
                }
            }
        }
    }

    /// Aggregates every agent through the grid. Inclusion rules are the same as
    /// the all-pairs scan; only the summation order differs.
    pub fn influences(&self, snapshots: &[AgentSnapshot], params: &FlockParams, parallel: bool) -> Vec<NeighborInfluence> {
        let one = |idx: usize| {
            let me = &snapshots[idx];
            let mut acc = Accumulator::default();
            self.for_each_candidate(idx, |j| acc.consider(me, &snapshots[j], params));
            acc.finish()
        };
        if parallel {
            (0..snapshots.len()).into_par_iter().map(one).collect()
        } else {
            (0..snapshots.len()).map(one).collect()
        }
    }

    fn cell_coords(&self, pos: Vec3) -> Option<[usize; 3]> {
        if !pos.is_finite() {
            return None;
        }
        let rel = (pos - self.origin) * self.inv_cell_size;
        let clamp_axis = |v: f32, dim: usize| (v.floor().max(0.0) as usize).min(dim - 1);
        Some([
            clamp_axis(rel.x, self.dims[0]),
            clamp_axis(rel.y, self.dims[1]),
            clamp_axis(rel.z, self.dims[2]),
        ])
    }

    #[inline(always)]
    fn flat_index(&self, c: [usize; 3]) -> usize {
        (c[2] * self.dims[1] + c[1]) * self.dims[0] + c[0]
    }

    fn unflatten(&self, flat: usize) -> [usize; 3] {
        let x = flat % self.dims[0];
        let y = (flat / self.dims[0]) % self.dims[1];
        let z = flat / (self.dims[0] * self.dims[1]);
        [x, y, z]
    }
}

/// Bounding box origin and extent over finite positions only.
fn finite_bounds(snapshots: &[AgentSnapshot]) -> (Vec3, Vec3) {
    let mut finite = snapshots.iter().map(|s| s.position).filter(Vec3::is_finite);
    let Some(first) = finite.next() else {
        return (Vec3::ZERO, Vec3::ZERO);
    };
    let (lo, hi) = finite.fold((first, first), |(lo, hi), p| (lo.min(p), hi.max(p)));
    (lo, hi - lo)
}

fn cell_total(dims: [usize; 3]) -> usize {
    dims.iter().fold(1usize, |acc, &d| acc.saturating_mul(d))
}

fn dims_for(extent: Vec3, cell_size: f32) -> [usize; 3] {
    let axis = |e: f32| ((e / cell_size).floor() as usize).saturating_add(1);
    [axis(extent.x), axis(extent.y), axis(extent.z)]
}
