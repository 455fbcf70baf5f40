//! Sod shock tube neighbourhood check in 1D.
//!
//! Run with e.g. `mpirun -n 2 sod_neighbors`. 400 evenly spaced particles
//! sit on x in [-0.5, 0.5]; the ghost region of every rank covers the
//! query ball, so a radius query around the origin must return exactly
//! the particles with |x| <= 0.1 on every rank.

use mpi::traits::Communicator;
use sph_octree::driver::ParticleSystem;
use sph_octree::params::SimParams;
use sph_octree::particle::Particle;

pub fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let universe = mpi::initialize().unwrap();
    let comm = universe.world();
    let rank = comm.rank() as usize;
    let size = comm.size() as usize;

    // The query ball below is only fully covered by the ghost regions
    // when each half of the tube is one rank.
    assert!(size <= 2, "run with at most 2 ranks");

    let total = 400;
    // The ghost regions extend two smoothing lengths past each rank's
    // particles, which comfortably covers the 0.1 query ball below.
    let smoothing_length = 0.06;

    // Each rank contributes a contiguous slice of the lattice.
    let per_rank = total / size + usize::from(rank < total % size);
    let offset: usize = (0..rank)
        .map(|r| total / size + usize::from(r < total % size))
        .sum();

    let particles: Vec<Particle<1>> = (offset..offset + per_rank)
        .map(|i| {
            let x = -0.5 + (i as f64 + 0.5) / total as f64;
            // Left half of the tube is dense, right half dilute.
            let density = if x < 0.0 { 1.0 } else { 0.125 };
            Particle::new(
                i as u64,
                [x],
                [0.0],
                density / total as f64,
                density,
                2.5,
                smoothing_length,
                if x < 0.0 { 1.0 } else { 0.1 },
            )
        })
        .collect();

    let mut system = ParticleSystem::new(particles, SimParams::default());
    system.update_iteration(&comm);

    // Expected ids: |x_i| <= 0.1 for x_i = -0.5 + (i + 0.5) / 400.
    let expected: Vec<u64> = (0..total as u64)
        .filter(|&i| {
            let x = -0.5 + (i as f64 + 0.5) / total as f64;
            x.abs() <= 0.1
        })
        .collect();

    let tree = system.tree().unwrap();
    let mut found: Vec<u64> = tree
        .find_in_radius(&[0.0], 0.1)
        .into_iter()
        .map(|index| tree.particles()[index].id)
        .collect();
    found.sort_unstable();
    found.dedup();

    assert_eq!(
        found, expected,
        "rank {} sees the wrong neighbourhood around the origin",
        rank
    );

    if comm.rank() == 0 {
        println!("No errors were found in the Sod tube neighbourhood.");
    }
}
