//! Parallel batch path: agent records are packed into a flat byte buffer,
//! handed to a [`ComputeDevice`], and read back asynchronously through a
//! [`DispatchHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Mutex};

use flock_common::{FlockParams, NeighborSearch, Vec3};
use log::{debug, trace};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::ReadbackError;
use crate::flock::{compute_with_search, AgentSnapshot, NeighborInfluence};

/// One agent's slot in a batch buffer: inputs followed by the kernel's outputs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct BoidData {
    pub position: [f32; 3],
    pub direction: [f32; 3],
    pub flock_heading: [f32; 3],
    pub flock_centre: [f32; 3],
    pub avoidance_heading: [f32; 3],
    pub num_flockmates: u32,
}

/// Byte size of one [`BoidData`] record: five `[f32; 3]` and one `u32`.
pub const BOID_DATA_SIZE: usize = std::mem::size_of::<BoidData>();

impl BoidData {
    fn from_snapshot(snap: &AgentSnapshot) -> Self {
        // Outputs start zeroed; the kernel overwrites them.
        BoidData {
            position: snap.position.to_array(),
            direction: snap.heading.to_array(),
            ..Default::default()
        }
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot::new(Vec3::from_array(self.position), Vec3::from_array(self.direction))
    }

    fn influence(&self) -> NeighborInfluence {
        NeighborInfluence {
            flock_heading: Vec3::from_array(self.flock_heading),
            flock_centre: Vec3::from_array(self.flock_centre),
            avoidance_heading: Vec3::from_array(self.avoidance_heading),
            neighbor_count: self.num_flockmates,
        }
    }

    fn store_influence(&mut self, influence: &NeighborInfluence) {
        self.flock_heading = influence.flock_heading.to_array();
        self.flock_centre = influence.flock_centre.to_array();
        self.avoidance_heading = influence.avoidance_heading.to_array();
        self.num_flockmates = influence.neighbor_count;
    }
}

/// Transient buffer for one dispatch, sized to exactly `count` records.
#[derive(Debug)]
pub struct BatchBuffer {
    count: usize,
    bytes: Vec<u8>,
}

impl BatchBuffer {
    /// Packs `snapshots` into a buffer. `recycled` is reused only when it was
    /// sized for the same agent count; otherwise a fresh buffer is allocated.
    pub fn encode(snapshots: &[AgentSnapshot], recycled: Option<BatchBuffer>) -> Self {
        let count = snapshots.len();
        let mut bytes = match recycled {
            Some(buf) if buf.count == count => buf.bytes,
            Some(buf) => {
                debug!("Reallocating batch buffer: {} -> {} agents.", buf.count, count);
                vec![0; count * BOID_DATA_SIZE]
            }
            None => vec![0; count * BOID_DATA_SIZE],
        };
        for (chunk, snap) in bytes.chunks_exact_mut(BOID_DATA_SIZE).zip(snapshots) {
            chunk.copy_from_slice(BoidData::from_snapshot(snap).as_bytes());
        }
        Self { count, bytes }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn records(&self) -> Result<Vec<BoidData>, ReadbackError> {
        let expected = self.count * BOID_DATA_SIZE;
        if self.bytes.len() != expected {
            return Err(ReadbackError::SizeMismatch { expected, actual: self.bytes.len() });
        }
        self.bytes
            .chunks_exact(BOID_DATA_SIZE)
            .map(|chunk| {
                BoidData::read_from_bytes(chunk).map_err(|_| ReadbackError::SizeMismatch {
                    expected: BOID_DATA_SIZE,
                    actual: chunk.len(),
                })
            })
            .collect()
    }

    pub fn write_records(&mut self, records: &[BoidData]) -> Result<(), ReadbackError> {
        let src = records.as_bytes();
        if src.len() != self.bytes.len() {
            return Err(ReadbackError::SizeMismatch { expected: self.bytes.len(), actual: src.len() });
        }
        self.bytes.copy_from_slice(src);
        Ok(())
    }

    /// Decodes the kernel's outputs, index-aligned with the snapshots that were encoded.
    pub fn read_influences(&self) -> Result<Vec<NeighborInfluence>, ReadbackError> {
        Ok(self.records()?.iter().map(BoidData::influence).collect())
    }
}

/// Uniforms for one kernel launch.
#[derive(Debug, Clone, Copy)]
pub struct KernelParams {
    pub flock: FlockParams,
    pub search: NeighborSearch,
}

/// Runs the neighbor aggregation over a packed buffer, in place, using the rayon pool.
pub fn run_flock_kernel(buffer: &mut BatchBuffer, kernel: &KernelParams) -> Result<(), ReadbackError> {
    let mut records = buffer.records()?;
    let snapshots: Vec<AgentSnapshot> = records.iter().map(BoidData::snapshot).collect();
    let influences = compute_with_search(&snapshots, &kernel.flock, kernel.search, true);
    for (record, influence) in records.iter_mut().zip(&influences) {
        record.store_influence(influence);
    }
    buffer.write_records(&records)
}

/// Callback a device invokes exactly once per dispatch, from whatever thread it likes.
pub type Completion = Box<dyn FnOnce(Result<BatchBuffer, ReadbackError>) + Send + 'static>;

/// A backend able to run the flock kernel over a whole batch without blocking the caller.
pub trait ComputeDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Takes ownership of `buffer` and eventually hands it back through `on_complete`.
    fn dispatch(&self, buffer: BatchBuffer, kernel: KernelParams, on_complete: Completion);
}

/// Runs batches as detached jobs on a rayon pool (the global one unless a pool is given).
#[derive(Debug, Clone, Default)]
pub struct RayonDevice {
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl RayonDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(pool: Arc<rayon::ThreadPool>) -> Self {
        Self { pool: Some(pool) }
    }
}

impl ComputeDevice for RayonDevice {
    fn name(&self) -> &str {
        "rayon"
    }

    fn dispatch(&self, mut buffer: BatchBuffer, kernel: KernelParams, on_complete: Completion) {
        let job = move || {
            let result = run_flock_kernel(&mut buffer, &kernel).map(|()| buffer);
            on_complete(result);
        };
        match &self.pool {
            Some(pool) => pool.spawn(job),
            None => rayon::spawn(job),
        }
    }
}

/// Lifecycle of one dispatch. The solver is idle again once the handle leaves `Dispatched`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Dispatched,
    Completed,
    Failed,
}

/// Single-consumer view of an outstanding batch.
///
/// While a handle is `Dispatched` its solver refuses new dispatches. Taking the
/// result (or dropping the handle) frees the solver.
#[derive(Debug)]
pub struct DispatchHandle {
    ticket: u64,
    agent_count: usize,
    state: DispatchState,
    receiver: Receiver<Result<BatchBuffer, ReadbackError>>,
    in_flight: Arc<AtomicBool>,
    recycle: Arc<Mutex<Option<BatchBuffer>>>,
}

impl DispatchHandle {
    pub(crate) fn new(
        ticket: u64,
        agent_count: usize,
        receiver: Receiver<Result<BatchBuffer, ReadbackError>>,
        in_flight: Arc<AtomicBool>,
        recycle: Arc<Mutex<Option<BatchBuffer>>>,
    ) -> Self {
        Self { ticket, agent_count, state: DispatchState::Dispatched, receiver, in_flight, recycle }
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Number of agents in the snapshot this batch was built from.
    pub fn agent_count(&self) -> usize {
        self.agent_count
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Non-blocking readback. Returns `Some` exactly once, when the device has finished.
    pub fn try_take(&mut self) -> Option<Result<Vec<NeighborInfluence>, ReadbackError>> {
        if self.state != DispatchState::Dispatched {
            return None;
        }
        let raw = match self.receiver.try_recv() {
            Ok(raw) => raw,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => Err(ReadbackError::Disconnected),
        };
        Some(self.resolve(raw))
    }

    /// Blocks until the device finishes. `None` if the result was already taken.
    pub fn wait(&mut self) -> Option<Result<Vec<NeighborInfluence>, ReadbackError>> {
        if self.state != DispatchState::Dispatched {
            return None;
        }
        let raw = self.receiver.recv().unwrap_or(Err(ReadbackError::Disconnected));
        Some(self.resolve(raw))
    }

    fn resolve(&mut self, raw: Result<BatchBuffer, ReadbackError>) -> Result<Vec<NeighborInfluence>, ReadbackError> {
        let result = raw.and_then(|buffer| {
            if buffer.len() != self.agent_count {
                return Err(ReadbackError::SizeMismatch {
                    expected: self.agent_count * BOID_DATA_SIZE,
                    actual: buffer.byte_len(),
                });
            }
            let influences = buffer.read_influences()?;
            if let Ok(mut slot) = self.recycle.lock() {
                *slot = Some(buffer);
            }
            Ok(influences)
        });
        self.state = if result.is_ok() { DispatchState::Completed } else { DispatchState::Failed };
        self.in_flight.store(false, Ordering::Release);
        trace!("Batch {} resolved as {:?}.", self.ticket, self.state);
        result
    }
}

impl Drop for DispatchHandle {
    fn drop(&mut self) {
        // A resolved handle already released the solver, which may since own a newer batch.
        if self.state == DispatchState::Dispatched {
            debug!("Batch {} abandoned before readback.", self.ticket);
            self.in_flight.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flock::compute_influences;

    fn snaps() -> Vec<AgentSnapshot> {
        (0..5)
            .map(|i| {
                AgentSnapshot::new(Vec3::new(i as f32 * 0.8, 0.0, 0.0), Vec3::new(0.0, 0.0, 1.0))
            })
            .collect()
    }

    #[test]
    fn record_layout_is_64_bytes() {
        assert_eq!(BOID_DATA_SIZE, 64);
    }

    #[test]
    fn encode_reuses_only_same_count() {
        let s = snaps();
        let first = BatchBuffer::encode(&s, None);
        assert_eq!(first.byte_len(), 5 * BOID_DATA_SIZE);
        let ptr = first.bytes.as_ptr();
        let reused = BatchBuffer::encode(&s, Some(first));
        assert_eq!(reused.bytes.as_ptr(), ptr);

        let fewer = BatchBuffer::encode(&s[..3], Some(reused));
        assert_eq!(fewer.len(), 3);
        assert_eq!(fewer.byte_len(), 3 * BOID_DATA_SIZE);
    }

    #[test]
    fn kernel_matches_direct_aggregation() {
        let s = snaps();
        let params = FlockParams::new(2.0, 1.0).unwrap();
        let mut buffer = BatchBuffer::encode(&s, None);
        let kernel = KernelParams { flock: params, search: NeighborSearch::BruteForce };
        run_flock_kernel(&mut buffer, &kernel).unwrap();
        assert_eq!(buffer.read_influences().unwrap(), compute_influences(&s, &params));
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let mut buffer = BatchBuffer::encode(&snaps(), None);
        buffer.bytes.truncate(100);
        assert_eq!(
            buffer.records().unwrap_err(),
            ReadbackError::SizeMismatch { expected: 5 * BOID_DATA_SIZE, actual: 100 }
        );
    }
}
