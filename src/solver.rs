//! Execution strategy: one trait, a sequential and a batch implementation,
//! picked once at startup from the detected capabilities.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use flock_common::{BackendChoice, FlockParams, NeighborSearch};
use log::{debug, info, warn};

use crate::batch::{BatchBuffer, ComputeDevice, DispatchHandle, KernelParams, RayonDevice};
use crate::error::SolverError;
use crate::flock::{compute_with_search, AgentSnapshot, NeighborInfluence};

/// What the runtime can do, resolved once and passed in explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionCapabilities {
    pub parallel_batch: bool,
    pub worker_threads: usize,
}

impl ExecutionCapabilities {
    /// Batch execution pays off only with more than one rayon worker.
    pub fn detect() -> Self {
        let worker_threads = rayon::current_num_threads();
        Self { parallel_batch: worker_threads > 1, worker_threads }
    }

    pub fn sequential_only() -> Self {
        Self { parallel_batch: false, worker_threads: 1 }
    }
}

/// Result of handing one snapshot to a solver.
#[derive(Debug)]
pub enum Solve {
    /// Influences for this tick, index-aligned with the snapshots.
    Ready(Vec<NeighborInfluence>),
    /// Influences will arrive through the handle on a later tick.
    Pending(DispatchHandle),
}

pub trait FlockSolver: Send {
    fn name(&self) -> &'static str;

    fn compute(&mut self, snapshots: &[AgentSnapshot], params: &FlockParams) -> Result<Solve, SolverError>;
}

/// Aggregates on the calling thread; results are ready in the same tick.
#[derive(Debug, Clone, Default)]
pub struct SequentialFlockSolver {
    search: NeighborSearch,
}

impl SequentialFlockSolver {
    pub fn new(search: NeighborSearch) -> Self {
        Self { search }
    }
}

impl FlockSolver for SequentialFlockSolver {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn compute(&mut self, snapshots: &[AgentSnapshot], params: &FlockParams) -> Result<Solve, SolverError> {
        Ok(Solve::Ready(compute_with_search(snapshots, params, self.search, false)))
    }
}

/// Submits each snapshot to a [`ComputeDevice`] and returns immediately.
/// At most one batch may be outstanding.
pub struct BatchFlockSolver {
    device: Arc<dyn ComputeDevice>,
    search: NeighborSearch,
    in_flight: Arc<AtomicBool>,
    recycle: Arc<Mutex<Option<BatchBuffer>>>,
    next_ticket: u64,
}

impl BatchFlockSolver {
    pub fn new(device: Arc<dyn ComputeDevice>, search: NeighborSearch) -> Self {
        Self {
            device,
            search,
            in_flight: Arc::new(AtomicBool::new(false)),
            recycle: Arc::new(Mutex::new(None)),
            next_ticket: 0,
        }
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    pub fn is_idle(&self) -> bool {
        !self.in_flight.load(Ordering::Acquire)
    }
}

impl FlockSolver for BatchFlockSolver {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn compute(&mut self, snapshots: &[AgentSnapshot], params: &FlockParams) -> Result<Solve, SolverError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SolverError::DispatchInFlight);
        }

        let recycled = self.recycle.lock().ok().and_then(|mut slot| slot.take());
        let buffer = BatchBuffer::encode(snapshots, recycled);
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let (tx, rx) = mpsc::channel();
        let kernel = KernelParams { flock: *params, search: self.search };
        debug!("Dispatching batch {} ({} agents) to {}.", ticket, snapshots.len(), self.device.name());
        self.device.dispatch(
            buffer,
            kernel,
            Box::new(move |result| {
                // The receiver may be gone if the handle was dropped; nothing to deliver then.
                let _ = tx.send(result);
            }),
        );

        Ok(Solve::Pending(DispatchHandle::new(
            ticket,
            snapshots.len(),
            rx,
            Arc::clone(&self.in_flight),
            Arc::clone(&self.recycle),
        )))
    }
}

/// Picks the execution path for the whole run.
pub fn select_solver(
    caps: ExecutionCapabilities,
    choice: BackendChoice,
    search: NeighborSearch,
) -> Box<dyn FlockSolver> {
    let use_batch = match choice {
        BackendChoice::Sequential => false,
        BackendChoice::Batch => {
            if !caps.parallel_batch {
                warn!("Batch backend forced with {} worker thread(s); expect no speedup.", caps.worker_threads);
            }
            true
        }
        BackendChoice::Auto => caps.parallel_batch,
    };
    if use_batch {
        info!("Using batch flock solver on rayon ({} threads).", caps.worker_threads);
        Box::new(BatchFlockSolver::new(Arc::new(RayonDevice::new()), search))
    } else {
        info!("Using sequential flock solver.");
        Box::new(SequentialFlockSolver::new(search))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_common::Vec3;

    fn snaps(n: usize) -> Vec<AgentSnapshot> {
        (0..n)
            .map(|i| AgentSnapshot::new(Vec3::new(i as f32 * 0.5, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0)))
            .collect()
    }

    #[test]
    fn auto_follows_capabilities() {
        let par = ExecutionCapabilities { parallel_batch: true, worker_threads: 8 };
        let seq = ExecutionCapabilities::sequential_only();
        assert_eq!(select_solver(par, BackendChoice::Auto, NeighborSearch::BruteForce).name(), "batch");
        assert_eq!(select_solver(seq, BackendChoice::Auto, NeighborSearch::BruteForce).name(), "sequential");
        assert_eq!(select_solver(seq, BackendChoice::Batch, NeighborSearch::BruteForce).name(), "batch");
        assert_eq!(select_solver(par, BackendChoice::Sequential, NeighborSearch::Grid).name(), "sequential");
    }

    #[test]
    fn sequential_is_ready_immediately() {
        let params = FlockParams::new(1.0, 0.2).unwrap();
        let mut solver = SequentialFlockSolver::default();
        match solver.compute(&snaps(4), &params).unwrap() {
            Solve::Ready(out) => {
                assert_eq!(out.len(), 4);
                assert_eq!(out[0].neighbor_count, 1);
                assert_eq!(out[1].neighbor_count, 2);
            }
            Solve::Pending(_) => panic!("sequential solver must not defer"),
        }
    }

    #[test]
    fn second_dispatch_is_refused_until_taken() {
        let params = FlockParams::new(1.0, 0.2).unwrap();
        let mut solver = BatchFlockSolver::new(Arc::new(RayonDevice::new()), NeighborSearch::BruteForce);
        let Solve::Pending(mut handle) = solver.compute(&snaps(6), &params).unwrap() else {
            panic!("batch solver must defer");
        };
        assert!(!solver.is_idle());
        assert_eq!(solver.compute(&snaps(6), &params).unwrap_err(), SolverError::DispatchInFlight);

        let out = handle.wait().unwrap().unwrap();
        assert_eq!(out.len(), 6);
        assert!(solver.is_idle());
        assert!(handle.wait().is_none());
        assert!(matches!(solver.compute(&snaps(6), &params), Ok(Solve::Pending(_))));
    }

    #[test]
    fn dropping_handle_frees_solver() {
        let params = FlockParams::new(1.0, 0.2).unwrap();
        let mut solver = BatchFlockSolver::new(Arc::new(RayonDevice::new()), NeighborSearch::BruteForce);
        let first = solver.compute(&snaps(3), &params).unwrap();
        drop(first);
        assert!(solver.is_idle());
    }

    #[test]
    fn resolved_handle_drop_keeps_newer_batch_outstanding() {
        let params = FlockParams::new(1.0, 0.2).unwrap();
        let mut solver = BatchFlockSolver::new(Arc::new(RayonDevice::new()), NeighborSearch::BruteForce);
        let Solve::Pending(mut first) = solver.compute(&snaps(4), &params).unwrap() else {
            panic!("batch solver must defer");
        };
        first.wait().unwrap().unwrap();

        let Solve::Pending(mut second) = solver.compute(&snaps(4), &params).unwrap() else {
            panic!("batch solver must defer");
        };
        drop(first);
        assert!(!solver.is_idle());
        assert_eq!(solver.compute(&snaps(4), &params).unwrap_err(), SolverError::DispatchInFlight);

        assert_eq!(second.wait().unwrap().unwrap().len(), 4);
        assert!(solver.is_idle());
    }
}
