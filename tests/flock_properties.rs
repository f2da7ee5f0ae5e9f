//! Property tests for the neighbor aggregation and its execution paths.
//!
//! - Every pair within the perception radius is counted from both sides
//! - Sequential and batch solvers return identical results
//! - The spatial grid agrees with the all-pairs scan

use std::sync::Arc;

use flock_common::{FlockParams, NeighborSearch, Vec3};
use flock_engine::flock::compute_with_search;
use flock_engine::{
    compute_influences, AgentSnapshot, BatchFlockSolver, FlockSolver, NeighborInfluence, RayonDevice,
    SequentialFlockSolver, Solve,
};
use proptest::prelude::*;

fn vec3_strategy() -> impl Strategy<Value = Vec3> {
    (-10.0f32..10.0, -10.0f32..10.0, -10.0f32..10.0).prop_map(|(x, y, z)| Vec3::new(x, y, z))
}

fn flock_strategy(max: usize) -> impl Strategy<Value = Vec<AgentSnapshot>> {
    prop::collection::vec(
        (vec3_strategy(), vec3_strategy()).prop_map(|(p, h)| AgentSnapshot::new(p, h.normalize_or_zero())),
        0..max,
    )
}

fn params_strategy() -> impl Strategy<Value = FlockParams> {
    (0.1f32..8.0, 0.0f32..1.0).prop_map(|(perception, frac)| {
        FlockParams::new(perception, perception * frac).expect("radii in range")
    })
}

fn solve_now(solver: &mut dyn FlockSolver, snaps: &[AgentSnapshot], params: &FlockParams) -> Vec<NeighborInfluence> {
    match solver.compute(snaps, params).expect("solver idle") {
        Solve::Ready(out) => out,
        Solve::Pending(mut handle) => handle
            .wait()
            .expect("result not yet taken")
            .expect("rayon device never fails"),
    }
}

proptest! {
    #[test]
    fn pairs_are_counted_from_both_sides(snaps in flock_strategy(48), params in params_strategy()) {
        let out = compute_influences(&snaps, &params);
        prop_assert_eq!(out.len(), snaps.len());

        let mut pairs = 0u32;
        for i in 0..snaps.len() {
            for j in (i + 1)..snaps.len() {
                if snaps[i].position.distance(snaps[j].position) < params.perception_radius() {
                    pairs += 1;
                }
            }
        }
        let total: u32 = out.iter().map(|inf| inf.neighbor_count).sum();
        prop_assert_eq!(total, 2 * pairs);

        for inf in out.iter().filter(|inf| inf.neighbor_count == 0) {
            prop_assert_eq!(*inf, NeighborInfluence::default());
        }
    }

    #[test]
    fn batch_path_matches_sequential_path(snaps in flock_strategy(64), params in params_strategy()) {
        let mut sequential = SequentialFlockSolver::new(NeighborSearch::BruteForce);
        let mut batch = BatchFlockSolver::new(Arc::new(RayonDevice::new()), NeighborSearch::BruteForce);
        let a = solve_now(&mut sequential, &snaps, &params);
        let b = solve_now(&mut batch, &snaps, &params);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn grid_search_matches_brute_force(snaps in flock_strategy(64), params in params_strategy()) {
        let brute = compute_influences(&snaps, &params);
        let grid = compute_with_search(&snaps, &params, NeighborSearch::Grid, true);
        let tol = 1e-5 * snaps.len() as f32 * 20.0 + 1e-5;
        for (a, b) in brute.iter().zip(&grid) {
            prop_assert_eq!(a.neighbor_count, b.neighbor_count);
            prop_assert!(a.flock_heading.distance(b.flock_heading) <= tol);
            prop_assert!(a.flock_centre.distance(b.flock_centre) <= tol);
            prop_assert!(a.avoidance_heading.distance(b.avoidance_heading) <= tol);
        }
    }
}

#[test]
fn isolated_agent_has_zero_influence() {
    let params = FlockParams::new(1.0, 0.5).unwrap();
    let snaps = [
        AgentSnapshot::new(Vec3::new(-50.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0)),
        AgentSnapshot::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(0.0, 1.0, 0.0)),
        AgentSnapshot::new(Vec3::new(0.5, 0.0, 0.0), Vec3::new(0.0, 1.0, 0.0)),
    ];
    let out = compute_influences(&snaps, &params);
    assert_eq!(out[0], NeighborInfluence::default());
    assert_eq!(out[1].neighbor_count, 1);
}

#[test]
fn asymmetric_avoidance_is_unnormalized() {
    let params = FlockParams::new(5.0, 5.0).unwrap();
    let heading = Vec3::new(0.0, 0.0, 1.0);
    let snaps = [
        AgentSnapshot::new(Vec3::new(0.0, 0.0, 0.0), heading),
        AgentSnapshot::new(Vec3::new(1.0, 0.0, 0.0), heading),
        AgentSnapshot::new(Vec3::new(4.0, 0.0, 0.0), heading),
    ];
    let mid = compute_influences(&snaps, &params)[1];
    // (1 - 0) + (1 - 4) = -2; a mean would give -1.
    assert_eq!(mid.avoidance_heading, Vec3::new(-2.0, 0.0, 0.0));
    assert_eq!(mid.flock_centre, Vec3::new(2.0, 0.0, 0.0));
}
