use flock_common::Vec3;
use rayon::prelude::*;

use crate::error::ReadbackError;
use crate::flock::{AgentSnapshot, NeighborInfluence};

/// Per-boid state vectors, index-aligned. Index `i` in every vector is the same boid.
#[derive(Debug, Clone, Default)]
pub struct FlockState {
    pub positions: Vec<Vec3>,
    pub velocities: Vec<Vec3>,
    /// Unit forward directions.
    pub headings: Vec<Vec3>,
    /// Last influence applied to each boid; stale until the next successful batch.
    pub influences: Vec<NeighborInfluence>,
    /// Bumped by every add and remove; a batch built under another value is stale.
    membership: u64,
}

impl FlockState {
    /// Creates boids moving along their headings at `initial_speed`.
    pub fn new(positions: Vec<Vec3>, headings: Vec<Vec3>, initial_speed: f32) -> Self {
        let mut state = Self::default();
        for (position, heading) in positions.into_iter().zip(headings) {
            state.add_boid(position, heading, initial_speed);
        }
        state
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Membership generation of the current agent set.
    pub fn membership(&self) -> u64 {
        self.membership
    }

    /// Appends a boid with no perceived flockmates yet.
    pub fn add_boid(&mut self, position: Vec3, heading: Vec3, speed: f32) {
        self.membership += 1;
        let heading = heading.normalize_or_zero();
        self.positions.push(position);
        self.headings.push(heading);
        self.velocities.push(heading * speed);
        self.influences.push(NeighborInfluence::default());
    }

    /// Removes boid `idx`; the last boid takes its index.
    pub fn remove_boid(&mut self, idx: usize) -> Option<AgentSnapshot> {
        if idx >= self.len() {
            return None;
        }
        self.membership += 1;
        let removed = AgentSnapshot::new(self.positions.swap_remove(idx), self.headings.swap_remove(idx));
        self.velocities.swap_remove(idx);
        self.influences.swap_remove(idx);
        Some(removed)
    }

    /// Copies the kinematic inputs of every boid for one aggregation.
    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.positions
            .par_iter()
            .zip(self.headings.par_iter())
            .map(|(&position, &heading)| AgentSnapshot::new(position, heading))
            .collect()
    }

    /// Replaces every boid's influence at once. Nothing is written unless the
    /// batch was built from the current agent set (`membership`) and covers
    /// exactly the current boids.
    pub fn apply_influences(&mut self, influences: Vec<NeighborInfluence>, membership: u64) -> Result<(), ReadbackError> {
        if membership != self.membership || influences.len() != self.len() {
            return Err(ReadbackError::AgentSetChanged { dispatched: influences.len(), current: self.len() });
        }
        self.influences = influences;
        Ok(())
    }
}
