use thiserror::Error;

/// Rejected flock parameters. Raised once, when parameters are built from config.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("perception_radius must be positive and finite (got {0})")]
    InvalidPerceptionRadius(f32),
    #[error("avoidance_radius must be non-negative and finite (got {0})")]
    InvalidAvoidanceRadius(f32),
    #[error("avoidance_radius ({avoidance}) exceeds perception_radius ({perception})")]
    AvoidanceExceedsPerception { avoidance: f32, perception: f32 },
}

/// Validated radii used by every neighbor aggregation in a run.
///
/// Invariant: `0 <= avoidance_radius <= perception_radius` and
/// `perception_radius > 0`, all finite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlockParams {
    perception_radius: f32,
    avoidance_radius: f32,
}

impl FlockParams {
    pub fn new(perception_radius: f32, avoidance_radius: f32) -> Result<Self, ConfigurationError> {
        if !(perception_radius.is_finite() && perception_radius > 0.0) {
            return Err(ConfigurationError::InvalidPerceptionRadius(perception_radius));
        }
        if !(avoidance_radius.is_finite() && avoidance_radius >= 0.0) {
            return Err(ConfigurationError::InvalidAvoidanceRadius(avoidance_radius));
        }
        if avoidance_radius > perception_radius {
            return Err(ConfigurationError::AvoidanceExceedsPerception {
                avoidance: avoidance_radius,
                perception: perception_radius,
            });
        }
        Ok(Self { perception_radius, avoidance_radius })
    }

    pub fn perception_radius(&self) -> f32 {
        self.perception_radius
    }

    pub fn avoidance_radius(&self) -> f32 {
        self.avoidance_radius
    }
}
