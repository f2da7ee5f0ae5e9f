use serde::{Deserialize, Serialize};
use anyhow::Result;
use crate::sim_params::{ConfigurationError, FlockParams};
use std::path::Path;

/// How neighbors are found for each agent.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NeighborSearch {
    /// All-pairs scan.
    #[default]
    BruteForce,
    /// Uniform spatial grid with cells at least one perception radius wide.
    Grid,
}

// Neighbor perception settings
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FlockConfig {
    pub perception_radius: f32,
    pub avoidance_radius: f32,
    #[serde(default)]
    pub neighbor_search: NeighborSearch,
}

// Initial placement of the flock
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SpawnConfig {
    pub num_boids: u32,
    pub spawn_radius: f32,
    pub seed: u64,
}

/// Per-boid steering settings, consumed by the steering update after each
/// influence application.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SteeringConfig {
    #[serde(default = "default_min_speed")]
    pub min_speed: f32,
    #[serde(default = "default_max_speed")]
    pub max_speed: f32,
    #[serde(default = "default_max_steer_force")]
    pub max_steer_force: f32,
    #[serde(default = "default_weight")]
    pub align_weight: f32,
    #[serde(default = "default_weight")]
    pub cohesion_weight: f32,
    #[serde(default = "default_weight")]
    pub separate_weight: f32,
    #[serde(default = "default_bounds_radius")]
    pub bounds_radius: f32,
    #[serde(default = "default_bounds_weight")]
    pub bounds_weight: f32,
}

// Configuration for timing
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TimingConfig {
    pub dt: f32,
    pub total_steps: u32,
    #[serde(default = "default_record_interval")]
    pub record_interval_steps: u32,
}

/// Which execution path runs the neighbor aggregation.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Batch path when the runtime supports it, sequential otherwise.
    #[default]
    Auto,
    Sequential,
    Batch,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub backend: BackendChoice,
}

// Configuration for output settings
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputConfig {
    pub base_filename: String,
    pub save_positions: bool,
    pub save_stats: bool,
    #[serde(default)]
    pub save_positions_in_snapshot: bool,
    pub format: Option<String>, // Output format: "json", "bincode", "messagepack"
}

// Main configuration structure, loaded from config.toml.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SimulationConfig {
    pub flock: FlockConfig,
    pub spawn: SpawnConfig,
    #[serde(default)]
    pub steering: SteeringConfig,
    pub timing: TimingConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    pub output: OutputConfig,
}

impl Default for SteeringConfig {
    fn default() -> Self {
        SteeringConfig {
            min_speed: default_min_speed(),
            max_speed: default_max_speed(),
            max_steer_force: default_max_steer_force(),
            align_weight: default_weight(),
            cohesion_weight: default_weight(),
            separate_weight: default_weight(),
            bounds_radius: default_bounds_radius(),
            bounds_weight: default_bounds_weight(),
        }
    }
}

impl SimulationConfig {
    /// Loads the simulation configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let config_str = std::fs::read_to_string(path_ref)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path_ref.display(), e))?;
        Self::from_toml_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Invalid config '{}': {}", path_ref.display(), e))
    }

    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: SimulationConfig = toml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast checks on values the simulation cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.get_flock_params()?;
        if !(self.timing.dt.is_finite() && self.timing.dt > 0.0) {
            anyhow::bail!("timing.dt must be positive.");
        }
        if !(self.spawn.spawn_radius.is_finite() && self.spawn.spawn_radius >= 0.0) {
            anyhow::bail!("spawn.spawn_radius must be non-negative.");
        }
        let s = &self.steering;
        if s.min_speed < 0.0 || s.min_speed > s.max_speed {
            anyhow::bail!(
                "steering speeds must satisfy 0 <= min_speed <= max_speed (got {} / {}).",
                s.min_speed,
                s.max_speed
            );
        }
        if s.max_steer_force < 0.0 || s.bounds_radius <= 0.0 {
            anyhow::bail!("steering.max_steer_force must be >= 0 and steering.bounds_radius > 0.");
        }
        Ok(())
    }

    /// Builds the validated radii used by the neighbor aggregation.
    pub fn get_flock_params(&self) -> Result<FlockParams, ConfigurationError> {
        FlockParams::new(self.flock.perception_radius, self.flock.avoidance_radius)
    }
}

// Defaults for steering parameters
fn default_min_speed() -> f32 {
    2.0
}

fn default_max_speed() -> f32 {
    5.0
}

fn default_max_steer_force() -> f32 {
    3.0
}

fn default_weight() -> f32 {
    1.0
}

fn default_bounds_radius() -> f32 {
    25.0
}

fn default_bounds_weight() -> f32 {
    2.0
}

fn default_record_interval() -> u32 {
    10
}
