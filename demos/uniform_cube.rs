//! Uniform cube pipeline check.
//!
//! Run with e.g. `mpirun -n 4 uniform_cube`. 10000 particles are placed
//! uniformly in the unit cube; after the rebuild every rank must hold an
//! even share, the tree depth must stay near the uniform-density bound,
//! mass must be conserved under the ghost exchange and a repeated ghost
//! refresh must not change any ghost state.

use mpi::traits::Communicator;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use sph_octree::driver::ParticleSystem;
use sph_octree::params::SimParams;
use sph_octree::tools::generate_random_particles;

pub fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    // Get the world communicator
    let comm = universe.world();
    let size = comm.size() as usize;

    // Initialise a seeded Rng.
    let mut rng = ChaCha8Rng::seed_from_u64(comm.rank() as u64);

    let total = 10000;
    assert_eq!(total % size, 0, "run with a rank count dividing 10000");
    let npoints = total / size;

    let particles = generate_random_particles::<3, _, _>(npoints, 0.05, &mut rng, &comm);

    let params = SimParams {
        leaf_capacity: 32,
        ..Default::default()
    };
    let mut system = ParticleSystem::new(particles, params);

    // Unit total mass by construction of the generator.
    let mass_before = 1.0;

    system.update_iteration(&comm);

    // Each rank holds exactly its even share.
    assert_eq!(system.locals().len(), total / size);
    assert_eq!(system.total_count(), total);

    // Depth bound for a uniform distribution.
    let bound = ((total as f64 / 32.0).log(8.0)).ceil() as usize + 1;
    let max_depth = system.tree().unwrap().max_depth();
    assert!(
        max_depth <= bound,
        "max depth {} exceeds uniform bound {}",
        max_depth,
        bound
    );

    // Mass is conserved under the ghost exchange.
    let mass_after = system.total_mass(&comm);
    assert!((mass_after - mass_before).abs() <= 1e-12 * mass_before);

    // Refreshing twice without owner mutation leaves ghost state alone.
    let ghosts_before: Vec<_> = system
        .tree()
        .unwrap()
        .particles()
        .iter()
        .filter(|p| !p.is_local())
        .map(|p| (p.id, p.position, p.velocity, p.density))
        .collect();

    system.refresh_neighbors(&comm);
    system.refresh_neighbors(&comm);

    let ghosts_after: Vec<_> = system
        .tree()
        .unwrap()
        .particles()
        .iter()
        .filter(|p| !p.is_local())
        .map(|p| (p.id, p.position, p.velocity, p.density))
        .collect();

    assert_eq!(ghosts_before, ghosts_after);

    if size > 1 {
        assert!(!ghosts_before.is_empty());
    }

    if comm.rank() == 0 {
        println!("No errors were found in the uniform cube pipeline.");
    }
}
