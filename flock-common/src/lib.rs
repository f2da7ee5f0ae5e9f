pub mod config;
pub mod sim_params;
pub mod snapshot;
pub mod vecmath;

// Re-export key types for easier use by dependent crates
pub use config::{SimulationConfig, FlockConfig, SpawnConfig, SteeringConfig, TimingConfig, ExecutionConfig, OutputConfig, BackendChoice, NeighborSearch};
pub use sim_params::{ConfigurationError, FlockParams};
pub use snapshot::Snapshot;
pub use vecmath::{Vec3, clamp};
