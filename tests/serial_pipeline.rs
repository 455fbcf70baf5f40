//! Serial end-to-end exercise of the tree pipeline for every supported
//! dimension: build, rollup, queries against brute force, neighbourhood
//! visitors against brute force, and rebuild idempotence.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use sph_octree::geometry::{within, within_box, DomainBox};
use sph_octree::particle::Particle;
use sph_octree::tree::{ComMode, Tree};

fn random_particles<const D: usize>(n: usize, seed: u64) -> Vec<Particle<D>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n as u64)
        .map(|id| {
            let mut position = [0.0; D];
            for p in position.iter_mut() {
                *p = rng.gen();
            }
            Particle::new(
                id,
                position,
                [0.0; D],
                1.0 + rng.gen::<f64>(),
                1.0,
                1.0,
                0.05,
                1.0,
            )
        })
        .collect()
}

fn build<const D: usize>(particles: &[Particle<D>]) -> Tree<D> {
    let mut tree = Tree::new(DomainBox::new([0.0; D], [1.0; D]), 8, 16);
    for &particle in particles {
        tree.insert(particle);
    }
    tree.update_branches(ComMode::All);
    tree
}

fn exercise<const D: usize>() {
    let n = 600;
    let particles = random_particles::<D>(n, 7 + D as u64);
    let mut tree = build(&particles);

    // Rollup invariants.
    let total_mass: f64 = particles.iter().map(|p| p.mass).sum();
    let root = tree.branch(tree.root());
    assert_eq!(root.count(), n as u64);
    assert!((root.mass() - total_mass).abs() <= 1e-12 * total_mass);

    // Keys match the codec and leaves cover their particles.
    for particle in tree.particles() {
        assert_eq!(
            particle.key,
            sph_octree::MortonKey::from_point(tree.range(), &particle.position, tree.max_level())
        );
    }

    // Radius query against brute force.
    let center = [0.4; D];
    for radius in [0.08, 0.3] {
        let mut found = tree.find_in_radius(&center, radius);
        found.sort_unstable();
        let mut expected: Vec<usize> = tree
            .particles()
            .iter()
            .enumerate()
            .filter(|(_, p)| within(&center, &p.position, radius))
            .map(|(i, _)| i)
            .collect();
        expected.sort_unstable();
        assert_eq!(found, expected);
    }

    // Box query against brute force.
    let bmin = [0.25; D];
    let bmax = [0.75; D];
    let mut found = tree.find_in_box(&bmin, &bmax);
    found.sort_unstable();
    let mut expected: Vec<usize> = tree
        .particles()
        .iter()
        .enumerate()
        .filter(|(_, p)| within_box(&p.position, &bmin, &bmax))
        .map(|(i, _)| i)
        .collect();
    expected.sort_unstable();
    assert_eq!(found, expected);

    // Neighbourhood visitor against brute force.
    let radius = 0.1;
    tree.apply_sub_cells(radius, 32, |particle, neighbours| {
        particle.density = neighbours.iter().map(|n| n.mass).sum();
    });
    for particle in tree.particles() {
        let expected: f64 = particles
            .iter()
            .filter(|other| within(&particle.position, &other.position, radius))
            .map(|other| other.mass)
            .sum();
        assert!((particle.density - expected).abs() < 1e-12);
    }

    // Rebuilding from the same inputs gives an isomorphic tree.
    let again = build(&particles);
    let first: Vec<_> = tree.snapshot().iter().map(|r| (r.key, r.count)).collect();
    let second: Vec<_> = again.snapshot().iter().map(|r| (r.key, r.count)).collect();
    assert_eq!(first, second);
    assert_eq!(tree.max_depth(), again.max_depth());
}

#[test]
fn pipeline_1d() {
    exercise::<1>();
}

#[test]
fn pipeline_2d() {
    exercise::<2>();
}

#[test]
fn pipeline_3d() {
    exercise::<3>();
}

#[test]
fn clustered_points_refine_locally() {
    // A tight normal cluster plus uniform background: the cluster region
    // must refine deeper than the background without losing particles.
    let mut rng = ChaCha8Rng::seed_from_u64(123);
    let normal = rand_distr::Normal::new(0.5, 0.01).unwrap();

    let mut particles = random_particles::<3>(200, 321);
    for id in 200..600u64 {
        let position = [
            normal.sample(&mut rng).clamp(0.0, 1.0),
            normal.sample(&mut rng).clamp(0.0, 1.0),
            normal.sample(&mut rng).clamp(0.0, 1.0),
        ];
        particles.push(Particle::new(id, position, [0.0; 3], 1.0, 1.0, 1.0, 0.01, 1.0));
    }

    let tree = build(&particles);
    assert_eq!(tree.branch(tree.root()).count(), 600);

    let near = tree.find_in_radius(&[0.5; 3], 0.05);
    assert!(near.len() >= 400 - 10);

    let mut covered = 0;
    for leaf in tree.leaves() {
        covered += tree.branch(leaf).bucket().len();
    }
    assert_eq!(covered, 600);
}

#[test]
fn boundary_particle_lands_in_a_leaf() {
    let mut particles = random_particles::<2>(40, 99);
    particles.push(Particle::new(40, [1.0, 1.0], [0.0; 2], 1.0, 1.0, 1.0, 0.05, 1.0));
    particles.push(Particle::new(41, [0.0, 0.0], [0.0; 2], 1.0, 1.0, 1.0, 0.05, 1.0));

    let tree = build(&particles);

    let mut covered = 0;
    for leaf in tree.leaves() {
        covered += tree.branch(leaf).bucket().len();
    }
    assert_eq!(covered, particles.len());
}
