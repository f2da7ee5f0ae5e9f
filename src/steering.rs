//! Per-boid update that consumes a [`NeighborInfluence`]: alignment, cohesion
//! and separation forces plus a soft spherical boundary around the origin.

use flock_common::{clamp, SteeringConfig, Vec3};

use crate::flock::NeighborInfluence;

/// Force that turns `velocity` toward `direction` at full speed, capped at `max_steer_force`.
#[inline]
pub fn steer_towards(direction: Vec3, velocity: Vec3, settings: &SteeringConfig) -> Vec3 {
    let desired = direction.normalize_or_zero() * settings.max_speed - velocity;
    desired.clamp_length(settings.max_steer_force)
}

/// Sum of steering forces acting on one boid this update.
pub fn acceleration(position: Vec3, velocity: Vec3, influence: &NeighborInfluence, settings: &SteeringConfig) -> Vec3 {
    let mut accel = Vec3::ZERO;

    if influence.neighbor_count > 0 {
        let offset_to_centre = influence.flock_centre - position;
        accel += steer_towards(influence.flock_heading, velocity, settings) * settings.align_weight;
        accel += steer_towards(offset_to_centre, velocity, settings) * settings.cohesion_weight;
        // A zero avoidance vector would otherwise read as "brake".
        if influence.avoidance_heading.length_squared() > 0.0 {
            accel += steer_towards(influence.avoidance_heading, velocity, settings) * settings.separate_weight;
        }
    }

    if position.length_squared() > settings.bounds_radius * settings.bounds_radius {
        accel += steer_towards(-position, velocity, settings) * settings.bounds_weight;
    }

    accel
}

/// Integrates one boid by `dt`. Speed stays within `[min_speed, max_speed]`.
pub fn update_boid(
    position: &mut Vec3,
    velocity: &mut Vec3,
    heading: &mut Vec3,
    influence: &NeighborInfluence,
    settings: &SteeringConfig,
    dt: f32,
) {
    let accel = acceleration(*position, *velocity, influence, settings);
    let mut v = *velocity + accel * dt;

    let speed = v.length();
    let dir = if speed > 1e-6 { v / speed } else { *heading };
    v = dir * clamp(speed, settings.min_speed, settings.max_speed);

    *velocity = v;
    *position += v * dt;
    *heading = dir;
}
