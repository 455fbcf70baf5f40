//! Periodic neighbourhood visibility across the domain seam.
//!
//! Run with e.g. `mpirun -n 2 periodic_box`. A particle just below the
//! upper x face must show up in the neighbourhood of a particle just
//! above the lower x face once periodic mirroring is on.

use std::sync::atomic::{AtomicBool, Ordering};

use mpi::collective::SystemOperation;
use mpi::traits::{Communicator, CommunicatorCollectives};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use sph_octree::driver::ParticleSystem;
use sph_octree::geometry::DomainBox;
use sph_octree::params::SimParams;
use sph_octree::particle::Particle;

pub fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let universe = mpi::initialize().unwrap();
    let comm = universe.world();
    let rank = comm.rank() as usize;

    let mut rng = ChaCha8Rng::seed_from_u64(rank as u64);

    let h = 0.05;
    let eps = 0.01; // 2 eps < h, so the seam pair are neighbours.
    let low_id = 1_000_000;
    let high_id = 1_000_001;

    // Uniform filler from every rank, the seam pair on rank 0.
    let mut particles: Vec<Particle<1>> = (0..500)
        .map(|i| {
            Particle::new(
                (rank * 500 + i) as u64,
                [rng.gen()],
                [0.0],
                1.0,
                1.0,
                1.0,
                h,
                1.0,
            )
        })
        .collect();
    if rank == 0 {
        particles.push(Particle::new(low_id, [eps], [0.0], 1.0, 1.0, 1.0, h, 1.0));
        particles.push(Particle::new(high_id, [1.0 - eps], [0.0], 1.0, 1.0, 1.0, h, 1.0));
    }

    let params = SimParams {
        periodic_x: true,
        ..Default::default()
    };
    let mut system = ParticleSystem::new(particles, params);
    system.set_periodic_domain(DomainBox::new([0.0], [1.0]));

    system.update_iteration(&comm);

    // Whichever rank owns the lower seam particle must see the upper one
    // (through its mirror image) in the neighbour list.
    let seen = AtomicBool::new(false);
    system.apply_in_smoothing_length(|particle, neighbours| {
        if particle.id == low_id && particle.mirror == 0 {
            assert!(
                neighbours.iter().any(|n| n.id == high_id),
                "seam neighbour is missing"
            );
            seen.store(true, Ordering::Relaxed);
        }
    });

    let local_seen = seen.load(Ordering::Relaxed);
    let mut global_seen = false;
    comm.all_reduce_into(&local_seen, &mut global_seen, SystemOperation::logical_or());
    assert!(global_seen, "no rank visited the lower seam particle");

    if comm.rank() == 0 {
        println!("No errors were found in the periodic box check.");
    }
}
