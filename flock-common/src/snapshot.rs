use serde::{Serialize, Deserialize};

/// Flock statistics recorded at a specific tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// The tick number at which the snapshot was taken.
    pub tick: u32,
    /// Simulated time in seconds (`tick * dt`).
    pub time: f32,
    /// Number of boids alive at the snapshot.
    pub boid_count: u32,
    /// Mean number of perceived flockmates, from the last applied influences.
    pub mean_neighbor_count: f32,
    /// `neighbor_count_distribution[N]` is the number of boids with exactly N flockmates.
    /// The last bin also collects every count beyond it.
    pub neighbor_count_distribution: Vec<u32>,
    /// Length of the mean heading: 1.0 for a fully aligned flock, near 0.0 for disorder.
    pub polarization: f32,
    /// Influence batches applied so far (one per tick on the sequential path).
    pub batches_applied: u32,
    /// Batches discarded after a failed readback.
    pub batches_failed: u32,
    /// Boid positions when `save_positions_in_snapshot` is set. Written as `None`
    /// otherwise; bincode cannot read back a skipped field.
    pub positions: Option<Vec<[f32; 3]>>,
}
