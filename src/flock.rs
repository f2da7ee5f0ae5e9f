//! Neighbor aggregation: for every agent, the mean heading and centre of its
//! flockmates plus the summed avoidance vector from the ones that are too close.

use flock_common::{FlockParams, NeighborSearch, Vec3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::grid::NeighborGrid;

/// Immutable copy of one agent's kinematic state, taken at the start of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub position: Vec3,
    /// Unit forward direction.
    pub heading: Vec3,
}

impl AgentSnapshot {
    pub fn new(position: Vec3, heading: Vec3) -> Self {
        Self { position, heading }
    }
}

/// Aggregate of an agent's neighbors for one tick.
///
/// `flock_heading` and `flock_centre` are means over `neighbor_count` flockmates
/// (zero when there are none). `avoidance_heading` is a raw sum and is zero
/// unless some flockmate sits inside the avoidance radius.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NeighborInfluence {
    pub flock_heading: Vec3,
    pub flock_centre: Vec3,
    pub avoidance_heading: Vec3,
    pub neighbor_count: u32,
}

/// Running sums for a single agent.
#[derive(Debug, Default)]
pub(crate) struct Accumulator {
    heading_sum: Vec3,
    centre_sum: Vec3,
    avoidance: Vec3,
    count: u32,
}

impl Accumulator {
    /// Folds one candidate into the sums. The caller guarantees `other` is not `me`.
    #[inline(always)]
    pub(crate) fn consider(&mut self, me: &AgentSnapshot, other: &AgentSnapshot, params: &FlockParams) {
        // NaN distances fail both comparisons, so non-finite agents never count.
        let dist = me.position.distance(other.position);
        if dist < params.perception_radius() {
            self.heading_sum += other.heading;
            self.centre_sum += other.position;
            self.count += 1;
            if dist < params.avoidance_radius() {
                self.avoidance += me.position - other.position;
            }
        }
    }

    pub(crate) fn finish(self) -> NeighborInfluence {
        let mut influence = NeighborInfluence {
            flock_heading: self.heading_sum,
            flock_centre: self.centre_sum,
            avoidance_heading: self.avoidance,
            neighbor_count: self.count,
        };
        if self.count > 0 {
            let n = self.count as f32;
            influence.flock_heading /= n;
            influence.flock_centre /= n;
        }
        influence
    }
}

/// Aggregates the neighbors of agent `idx` by scanning every other agent in order.
#[inline]
pub fn influence_for(idx: usize, snapshots: &[AgentSnapshot], params: &FlockParams) -> NeighborInfluence {
    let me = &snapshots[idx];
    let mut acc = Accumulator::default();
    for (j, other) in snapshots.iter().enumerate() {
        if j == idx {
            continue;
        }
        acc.consider(me, other, params);
    }
    acc.finish()
}

/// All-pairs aggregation on the calling thread. Output is index-aligned with `snapshots`.
pub fn compute_influences(snapshots: &[AgentSnapshot], params: &FlockParams) -> Vec<NeighborInfluence> {
    (0..snapshots.len())
        .map(|idx| influence_for(idx, snapshots, params))
        .collect()
}

/// Same as [`compute_influences`], with agents spread across the rayon pool.
///
/// Each agent's inner scan is identical to the sequential one, so the results
/// are bit-for-bit equal.
pub fn compute_influences_parallel(snapshots: &[AgentSnapshot], params: &FlockParams) -> Vec<NeighborInfluence> {
    (0..snapshots.len())
        .into_par_iter()
        .map(|idx| influence_for(idx, snapshots, params))
        .collect()
}

/// Dispatches to the configured neighbor search.
pub fn compute_with_search(
    snapshots: &[AgentSnapshot],
    params: &FlockParams,
    search: NeighborSearch,
    parallel: bool,
) -> Vec<NeighborInfluence> {
    match (search, parallel) {
        (NeighborSearch::BruteForce, false) => compute_influences(snapshots, params),
        (NeighborSearch::BruteForce, true) => compute_influences_parallel(snapshots, params),
        (NeighborSearch::Grid, parallel) => {
            let grid = NeighborGrid::build(snapshots, params.perception_radius());
            grid.influences(snapshots, params, parallel)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward() -> Vec3 {
        Vec3::new(0.0, 0.0, 1.0)
    }

    fn line_of_three() -> Vec<AgentSnapshot> {
        vec![
            AgentSnapshot::new(Vec3::new(0.0, 0.0, 0.0), forward()),
            AgentSnapshot::new(Vec3::new(1.0, 0.0, 0.0), forward()),
            AgentSnapshot::new(Vec3::new(2.0, 0.0, 0.0), forward()),
        ]
    }

    #[test]
    fn empty_and_single_give_defaults() {
        let params = FlockParams::new(5.0, 1.0).unwrap();
        assert!(compute_influences(&[], &params).is_empty());
        let one = [AgentSnapshot::new(Vec3::new(3.0, 3.0, 3.0), forward())];
        assert_eq!(compute_influences(&one, &params), vec![NeighborInfluence::default()]);
    }

    #[test]
    fn middle_agent_sees_mean_of_both_sides() {
        let params = FlockParams::new(5.0, 0.5).unwrap();
        let out = compute_influences(&line_of_three(), &params);
        let mid = out[1];
        assert_eq!(mid.neighbor_count, 2);
        assert_eq!(mid.flock_centre, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(mid.flock_heading, forward());
        assert_eq!(mid.avoidance_heading, Vec3::ZERO);
    }

    #[test]
    fn avoidance_is_a_sum() {
        let params = FlockParams::new(5.0, 5.0).unwrap();
        let out = compute_influences(&line_of_three(), &params);
        // Symmetric neighbors cancel.
        assert_eq!(out[1].avoidance_heading, Vec3::ZERO);
        // End agent: (0-1) + (0-2) = -3, not the mean -1.5.
        assert_eq!(out[0].avoidance_heading, Vec3::new(-3.0, 0.0, 0.0));
        assert_eq!(out[2].avoidance_heading, Vec3::new(3.0, 0.0, 0.0));
    }

    #[test]
    fn radius_boundary_is_exclusive() {
        let params = FlockParams::new(2.0, 1.0).unwrap();
        let at_edge = [
            AgentSnapshot::new(Vec3::ZERO, forward()),
            AgentSnapshot::new(Vec3::new(2.0, 0.0, 0.0), forward()),
        ];
        let out = compute_influences(&at_edge, &params);
        assert_eq!(out[0].neighbor_count, 0);
        assert_eq!(out[0].flock_centre, Vec3::ZERO);

        let inside = [
            AgentSnapshot::new(Vec3::ZERO, forward()),
            AgentSnapshot::new(Vec3::new(2.0 - 1e-4, 0.0, 0.0), forward()),
        ];
        assert_eq!(compute_influences(&inside, &params)[0].neighbor_count, 1);
    }

    #[test]
    fn coincident_agents_still_exclude_self() {
        let params = FlockParams::new(1.0, 0.5).unwrap();
        let stacked = [
            AgentSnapshot::new(Vec3::ZERO, forward()),
            AgentSnapshot::new(Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0)),
        ];
        let out = compute_influences(&stacked, &params);
        assert_eq!(out[0].neighbor_count, 1);
        assert_eq!(out[0].flock_heading, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(out[0].avoidance_heading, Vec3::ZERO);
    }

    #[test]
    fn nan_position_is_nobodys_neighbor() {
        let params = FlockParams::new(5.0, 1.0).unwrap();
        let snaps = [
            AgentSnapshot::new(Vec3::ZERO, forward()),
            AgentSnapshot::new(Vec3::new(f32::NAN, 0.0, 0.0), forward()),
            AgentSnapshot::new(Vec3::new(1.0, 0.0, 0.0), forward()),
        ];
        let out = compute_influences(&snaps, &params);
        assert_eq!(out[0].neighbor_count, 1);
        assert_eq!(out[1], NeighborInfluence::default());
    }

    #[test]
    fn parallel_matches_sequential_exactly() {
        let params = FlockParams::new(3.0, 1.0).unwrap();
        let snaps: Vec<AgentSnapshot> = (0..64)
            .map(|i| {
                let f = i as f32;
                AgentSnapshot::new(
                    Vec3::new((f * 0.37).sin() * 4.0, (f * 0.11).cos() * 4.0, f * 0.05),
                    Vec3::new(0.0, 1.0, 0.0),
                )
            })
            .collect();
        assert_eq!(compute_influences(&snaps, &params), compute_influences_parallel(&snaps, &params));
    }
}
