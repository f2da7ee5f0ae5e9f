//! Boid flocking engine: all-pairs neighbor aggregation with a sequential path
//! and an asynchronous parallel batch path that agree on every result.

pub mod batch;
pub mod error;
pub mod flock;
pub mod flock_state;
pub mod grid;
pub mod simulation;
pub mod solver;
pub mod steering;

pub use batch::{BatchBuffer, BoidData, ComputeDevice, DispatchHandle, DispatchState, KernelParams, RayonDevice};
pub use error::{ReadbackError, SolverError};
pub use flock::{compute_influences, compute_influences_parallel, AgentSnapshot, NeighborInfluence};
pub use flock_state::FlockState;
pub use simulation::{FlockSimulation, TickReport};
pub use solver::{select_solver, BatchFlockSolver, ExecutionCapabilities, FlockSolver, SequentialFlockSolver, Solve};
