use crate::batch::DispatchHandle;
use crate::error::ReadbackError;
use crate::flock::NeighborInfluence;
use crate::flock_state::FlockState;
use crate::solver::{select_solver, ExecutionCapabilities, FlockSolver, Solve};
use crate::steering::update_boid;
use flock_common::{FlockParams, SimulationConfig, Snapshot, Vec3};
use anyhow::Result;
use log::{debug, error, info, trace};
use rand::distr::Uniform;
use rand::prelude::*;
use rand_distr::UnitSphere;
use rayon::prelude::*;

const MAX_EXPECTED_NEIGHBORS: usize = 32; // Histogram size; larger counts land in the last bin

/// What happened during one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick: u32,
    /// Influences were written to every boid and every boid was updated once.
    pub applied: bool,
    /// A batch was submitted and will be collected on a later tick.
    pub dispatched: bool,
    /// A batch collected this tick failed and was discarded.
    pub readback_error: Option<ReadbackError>,
}

/// A deferred batch and the agent set it was built from.
struct PendingBatch {
    handle: DispatchHandle,
    membership: u64,
}

/// Owns the flock and drives one execution path tick by tick.
pub struct FlockSimulation {
    config: SimulationConfig,
    params: FlockParams,
    state: FlockState,
    solver: Box<dyn FlockSolver>,
    /// Outstanding batch, if the solver deferred its results.
    pending: Option<PendingBatch>,
    current_tick: u32,
    batches_applied: u32,
    batches_failed: u32,
    recorded_snapshots: Vec<Snapshot>,
}

impl FlockSimulation {
    /// Creates a simulation with the solver the capabilities and config call for.
    pub fn new(config: SimulationConfig, caps: ExecutionCapabilities) -> Result<Self> {
        let solver = select_solver(caps, config.execution.backend, config.flock.neighbor_search);
        Self::with_solver(config, solver)
    }

    /// Spawns the configured flock and runs it with `solver`.
    pub fn with_solver(config: SimulationConfig, solver: Box<dyn FlockSolver>) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.spawn.seed);
        let (positions, headings) = place_initial_boids(&config, &mut rng)?;
        let state = FlockState::new(positions, headings, initial_speed(&config));
        Self::with_state(config, state, solver)
    }

    /// Runs an existing flock with `solver`.
    pub fn with_state(config: SimulationConfig, state: FlockState, solver: Box<dyn FlockSolver>) -> Result<Self> {
        config.validate()?;
        let params = config.get_flock_params()?;
        info!("Flock of {} boids using the {} solver.", state.len(), solver.name());
        Ok(Self {
            config,
            params,
            state,
            solver,
            pending: None,
            current_tick: 0,
            batches_applied: 0,
            batches_failed: 0,
            recorded_snapshots: Vec::new(),
        })
    }

    /// Advances the simulation by one tick.
    ///
    /// A finished batch is collected first, so each new snapshot reflects every
    /// result already delivered. Readback failures are reported, not returned
    /// as errors: the flock keeps its previous influences and carries on.
    pub fn step(&mut self) -> Result<TickReport> {
        let mut report = TickReport { tick: self.current_tick, ..Default::default() };

        // --- 1. Collect a finished batch ---
        if let Some(pending) = self.pending.as_mut() {
            if let Some(result) = pending.handle.try_take() {
                let membership = pending.membership;
                self.pending = None;
                match self.finish_batch(result, membership) {
                    Ok(()) => report.applied = true,
                    Err(e) => report.readback_error = Some(e),
                }
            }
        }

        // --- 2. Snapshot and dispatch once nothing is outstanding ---
        if self.pending.is_none() {
            let snapshots = self.state.snapshot();
            let membership = self.state.membership();
            match self.solver.compute(&snapshots, &self.params)? {
                Solve::Ready(influences) => {
                    self.state.apply_influences(influences, membership)?;
                    self.update_boids();
                    self.batches_applied += 1;
                    report.applied = true;
                }
                Solve::Pending(handle) => {
                    trace!("Tick {}: batch {} in flight.", self.current_tick, handle.ticket());
                    self.pending = Some(PendingBatch { handle, membership });
                    report.dispatched = true;
                }
            }
        }

        self.current_tick += 1;
        Ok(report)
    }

    /// Blocks on the outstanding batch, if any, and applies it.
    /// Returns `None` when nothing was in flight.
    pub fn drain(&mut self) -> Option<Result<(), ReadbackError>> {
        let mut pending = self.pending.take()?;
        let result = pending.handle.wait()?;
        Some(self.finish_batch(result, pending.membership))
    }

    fn finish_batch(
        &mut self,
        result: Result<Vec<NeighborInfluence>, ReadbackError>,
        membership: u64,
    ) -> Result<(), ReadbackError> {
        match result.and_then(|influences| self.state.apply_influences(influences, membership)) {
            Ok(()) => {
                self.update_boids();
                self.batches_applied += 1;
                Ok(())
            }
            Err(e) => {
                error!("Discarding flock batch at tick {}: {}", self.current_tick, e);
                self.batches_failed += 1;
                Err(e)
            }
        }
    }

    /// Runs every boid's steering update exactly once against its current influence.
    fn update_boids(&mut self) {
        let settings = &self.config.steering;
        let dt = self.config.timing.dt;
        let state = &mut self.state;
        state
            .positions
            .par_iter_mut()
            .zip(state.velocities.par_iter_mut())
            .zip(state.headings.par_iter_mut())
            .zip(state.influences.par_iter())
            .for_each(|(((position, velocity), heading), influence)| {
                update_boid(position, velocity, heading, influence, settings, dt);
            });
    }

    /// Adds a boid between ticks. A batch already in flight will be discarded on readback.
    pub fn add_boid(&mut self, position: Vec3, heading: Vec3) {
        let speed = initial_speed(&self.config);
        self.state.add_boid(position, heading, speed);
    }

    /// Removes a boid between ticks; the last boid takes its index. A batch
    /// already in flight will be discarded on readback.
    pub fn remove_boid(&mut self, idx: usize) -> bool {
        self.state.remove_boid(idx).is_some()
    }

    /// Current boid positions.
    pub fn get_results(&self) -> Vec<[f32; 3]> {
        self.state.positions.iter().map(|p| p.to_array()).collect()
    }

    pub fn current_boid_count(&self) -> u32 {
        self.state.len() as u32
    }

    pub fn current_tick(&self) -> u32 {
        self.current_tick
    }

    pub fn params(&self) -> &FlockParams {
        &self.params
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn state(&self) -> &FlockState {
        &self.state
    }

    pub fn solver_name(&self) -> &'static str {
        self.solver.name()
    }

    pub fn has_pending_batch(&self) -> bool {
        self.pending.is_some()
    }

    pub fn batches_applied(&self) -> u32 {
        self.batches_applied
    }

    pub fn batches_failed(&self) -> u32 {
        self.batches_failed
    }

    /// Collects flock statistics into a Snapshot.
    /// Should be called at record intervals.
    pub fn record_snapshot(&mut self) -> Result<()> {
        let boid_count = self.state.len();
        debug!("Recording snapshot at tick {}...", self.current_tick);

        let mut neighbor_count_distribution = vec![0u32; MAX_EXPECTED_NEIGHBORS];
        let mut total_neighbors = 0u64;
        let mut max_neighbors = 0;
        for influence in &self.state.influences {
            let count = influence.neighbor_count;
            total_neighbors += count as u64;
            max_neighbors = max_neighbors.max(count);
            let bin = (count as usize).min(MAX_EXPECTED_NEIGHBORS - 1);
            neighbor_count_distribution[bin] += 1;
        }
        let mean_neighbor_count = if boid_count > 0 {
            total_neighbors as f32 / boid_count as f32
        } else {
            0.0
        };

        let polarization = if boid_count > 0 {
            let heading_sum = self
                .state
                .headings
                .par_iter()
                .copied()
                .reduce(Vec3::zero, |a, b| a + b);
            (heading_sum / boid_count as f32).length()
        } else {
            0.0
        };

        debug!(
            "Neighbor stats: boids={}, mean_neighbors={:.2}, max_neighbors={}, polarization={:.3}",
            boid_count, mean_neighbor_count, max_neighbors, polarization
        );

        let positions = if self.config.output.save_positions_in_snapshot {
            Some(self.get_results())
        } else {
            None
        };

        self.recorded_snapshots.push(Snapshot {
            tick: self.current_tick,
            time: self.current_tick as f32 * self.config.timing.dt,
            boid_count: boid_count as u32,
            mean_neighbor_count,
            neighbor_count_distribution,
            polarization,
            batches_applied: self.batches_applied,
            batches_failed: self.batches_failed,
            positions,
        });
        Ok(())
    }

    /// Provides access to the recorded snapshots.
    pub fn get_recorded_snapshots(&self) -> &Vec<Snapshot> {
        &self.recorded_snapshots
    }
}

fn initial_speed(config: &SimulationConfig) -> f32 {
    (config.steering.min_speed + config.steering.max_speed) * 0.5
}

/// Places boids uniformly inside a sphere of `spawn_radius` with random headings.
fn place_initial_boids(config: &SimulationConfig, rng: &mut StdRng) -> Result<(Vec<Vec3>, Vec<Vec3>)> {
    let count = config.spawn.num_boids as usize;
    let radius = config.spawn.spawn_radius;
    let unit = Uniform::new_inclusive(0.0f32, 1.0f32)?;

    let mut positions = Vec::with_capacity(count);
    let mut headings = Vec::with_capacity(count);
    for _ in 0..count {
        let dir: [f32; 3] = UnitSphere.sample(rng);
        // Cube root keeps the density uniform over the volume.
        let r = radius * rng.sample(unit).cbrt();
        positions.push(Vec3::from_array(dir) * r);
        let heading: [f32; 3] = UnitSphere.sample(rng);
        headings.push(Vec3::from_array(heading));
    }
    Ok((positions, headings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::SequentialFlockSolver;

    fn config() -> SimulationConfig {
        SimulationConfig::from_toml_str(
            r#"
            [flock]
            perception_radius = 2.5
            avoidance_radius = 1.0
            [spawn]
            num_boids = 40
            spawn_radius = 4.0
            seed = 11
            [timing]
            dt = 0.02
            total_steps = 5
            [output]
            base_filename = "out/unit"
            save_positions = false
            save_stats = true
            save_positions_in_snapshot = true
            "#,
        )
        .unwrap()
    }

    #[test]
    fn spawn_is_seeded_and_inside_radius() {
        let a = FlockSimulation::with_solver(config(), Box::new(SequentialFlockSolver::default())).unwrap();
        let b = FlockSimulation::with_solver(config(), Box::new(SequentialFlockSolver::default())).unwrap();
        assert_eq!(a.get_results(), b.get_results());
        assert_eq!(a.current_boid_count(), 40);
        assert!(a.state().positions.iter().all(|p| p.length() <= 4.0 + 1e-4));
        assert!(a.state().headings.iter().all(|h| (h.length() - 1.0).abs() < 1e-4));
    }

    #[test]
    fn sequential_tick_applies_in_same_tick() {
        let mut sim = FlockSimulation::with_solver(config(), Box::new(SequentialFlockSolver::default())).unwrap();
        let before = sim.get_results();
        let report = sim.step().unwrap();
        assert!(report.applied);
        assert!(!report.dispatched);
        assert_ne!(sim.get_results(), before);
        assert_eq!(sim.batches_applied(), 1);
        assert!(sim.drain().is_none());
    }

    #[test]
    fn snapshot_records_histogram_and_positions() {
        let mut sim = FlockSimulation::with_solver(config(), Box::new(SequentialFlockSolver::default())).unwrap();
        sim.step().unwrap();
        sim.record_snapshot().unwrap();
        let snap = &sim.get_recorded_snapshots()[0];
        assert_eq!(snap.tick, 1);
        assert_eq!(snap.boid_count, 40);
        assert_eq!(snap.neighbor_count_distribution.iter().sum::<u32>(), 40);
        assert_eq!(snap.positions.as_ref().map(Vec::len), Some(40));
        assert!(snap.polarization >= 0.0 && snap.polarization <= 1.0 + 1e-5);
    }

    #[test]
    fn snapshots_without_positions_read_back_from_bincode() {
        let mut cfg = config();
        cfg.output.save_positions_in_snapshot = false;
        let mut sim = FlockSimulation::with_solver(cfg, Box::new(SequentialFlockSolver::default())).unwrap();
        sim.record_snapshot().unwrap();
        sim.step().unwrap();
        sim.record_snapshot().unwrap();

        let bytes = bincode::serialize(sim.get_recorded_snapshots()).unwrap();
        let back: Vec<Snapshot> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[1].tick, 1);
        assert!(back[1].positions.is_none());
        assert_eq!(back[1].neighbor_count_distribution, sim.get_recorded_snapshots()[1].neighbor_count_distribution);
    }
}
