//! Distributed spatial index and neighbourhood resolution for SPH.
//!
//! This library turns a distributed set of particles into a hashed tree
//! over a Morton-ordered key space, balances the particles across MPI
//! ranks, and keeps each particle's neighbourhood visible to its owning
//! rank through a persistent ghost-exchange plan.
//!
//! Every branch of the tree is addressed by a [`MortonKey`](crate::morton::MortonKey):
//! a 64 bit value that interleaves the quantised coordinates of a cell
//! and carries a sentinel bit so the cell depth can be recovered from the
//! key alone. Navigation to parents, children and siblings happens on the
//! keys; the tree itself is a hash map from key to branch and needs no
//! pointers. Leaves hold buckets of particles and refine once a bucket
//! exceeds the configured capacity.
//!
//! The distributed pipeline is run by
//! [`ParticleSystem::update_iteration`](crate::driver::ParticleSystem::update_iteration)
//! once per physics step: periodic mirrors are cleaned and regenerated,
//! the maximum smoothing length and the global range are reduced, every
//! particle is re-keyed, a sample sort with residual balancing
//! redistributes the particles so that each rank holds exactly its
//! target count, the local tree is rebuilt, and a ghost plan is
//! established that later refreshes reuse without re-discovering the
//! topology. Physics acts as a visitor over the finished tree and never
//! mutates its structure.
//!
//! ## Using the library.
//!
//! ```no_run
//! use sph_octree::driver::ParticleSystem;
//! use sph_octree::params::SimParams;
//! use sph_octree::tools::generate_random_particles;
//! use mpi::traits::Communicator;
//! use rand::prelude::*;
//! use rand_chacha::ChaCha8Rng;
//!
//! let universe = mpi::initialize().unwrap();
//! let comm = universe.world();
//! let mut rng = ChaCha8Rng::seed_from_u64(comm.rank() as u64);
//!
//! let particles = generate_random_particles::<3, _, _>(10000, 0.05, &mut rng, &comm);
//! let mut system = ParticleSystem::new(particles, SimParams::default());
//!
//! system.update_iteration(&comm);
//! system.apply_in_smoothing_length(|particle, neighbours| {
//!     particle.density = neighbours.iter().map(|n| n.mass).sum();
//! });
//! ```
//!
//! The visitor sees each locally owned particle together with every
//! particle within twice the maximum smoothing length, including ghosts
//! mirrored from other ranks. Collective phases are fatal on invariant
//! violations: the workers must agree on the particle set and the tree
//! shape, so errors abort the job rather than returning in band.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod boundary;
pub mod constants;
pub mod driver;
pub mod geometry;
pub mod ghosts;
pub mod morton;
pub mod params;
pub mod particle;
pub mod sort;
pub mod tools;
pub mod tree;

pub use crate::driver::ParticleSystem;
pub use crate::geometry::DomainBox;
pub use crate::morton::MortonKey;
pub use crate::params::SimParams;
pub use crate::particle::{Locality, Particle};
pub use crate::tree::{ComMode, Tree};
