//! Spatial queries over the hashed tree.
//!
//! All queries are stack based descents that prune on the bounding boxes
//! cached by the last rollup ([`Tree::update_branches`]). The traversal
//! order is deterministic but not part of the contract; neighbour lists
//! handed to visitors are ordered by particle id.

use rayon::prelude::*;
use smallvec::SmallVec;

use crate::geometry::{intersects_box_box, intersects_sphere_box, within, within_box};
use crate::morton::MortonKey;
use crate::particle::Particle;
use crate::tree::Tree;

type BranchStack = SmallVec<[usize; 64]>;

impl<const D: usize> Tree<D> {
    /// Arena indices of all particles within the closed ball of `radius`
    /// around `center`.
    ///
    /// A non-positive radius yields no particles.
    pub fn find_in_radius(&self, center: &[f64; D], radius: f64) -> Vec<usize> {
        let mut found = Vec::new();
        if radius <= 0.0 {
            return found;
        }

        let mut stack: BranchStack = SmallVec::new();
        stack.push(self.root());

        while let Some(index) = stack.pop() {
            let branch = self.branch(index);
            if branch.is_leaf() {
                for &particle_index in branch.bucket() {
                    if within(center, &self.particles()[particle_index].position, radius) {
                        found.push(particle_index);
                    }
                }
            } else {
                for i in 0..MortonKey::<D>::NUM_CHILDREN {
                    let child_index = self.child(index, i).unwrap();
                    let child = self.branch(child_index);
                    if intersects_sphere_box(child.bmin(), child.bmax(), center, radius) {
                        stack.push(child_index);
                    }
                }
            }
        }

        found
    }

    /// Arena indices of all particles inside the closed box
    /// `[bmin, bmax]`.
    pub fn find_in_box(&self, bmin: &[f64; D], bmax: &[f64; D]) -> Vec<usize> {
        let mut found = Vec::new();

        let mut stack: BranchStack = SmallVec::new();
        stack.push(self.root());

        while let Some(index) = stack.pop() {
            let branch = self.branch(index);
            if branch.is_leaf() {
                for &particle_index in branch.bucket() {
                    if within_box(&self.particles()[particle_index].position, bmin, bmax) {
                        found.push(particle_index);
                    }
                }
            } else {
                for i in 0..MortonKey::<D>::NUM_CHILDREN {
                    let child_index = self.child(index, i).unwrap();
                    let child = self.branch(child_index);
                    if intersects_box_box(bmin, bmax, child.bmin(), child.bmax()) {
                        stack.push(child_index);
                    }
                }
            }
        }

        found
    }

    /// Enumerate sink branches below `start`: non-empty leaves, and
    /// non-empty interior branches whose subtree count is at most
    /// `criterion`.
    pub fn find_sub_cells(&self, start: usize, criterion: u64) -> Vec<usize> {
        let mut sinks = Vec::new();

        let mut stack: BranchStack = SmallVec::new();
        stack.push(start);

        while let Some(index) = stack.pop() {
            let branch = self.branch(index);
            if branch.count() == 0 {
                continue;
            }
            if branch.is_leaf() || branch.count() <= criterion {
                sinks.push(index);
            } else {
                for i in 0..MortonKey::<D>::NUM_CHILDREN {
                    let child_index = self.child(index, i).unwrap();
                    if self.branch(child_index).count() > 0 {
                        stack.push(child_index);
                    }
                }
            }
        }

        sinks
    }

    /// The interaction list of a sink: every non-empty leaf whose bounding
    /// box intersects the sink's bounding box inflated by `radius` on
    /// every face, found by a second descent from the root.
    ///
    /// The inflation makes the list complete for radius queries: rolled-up
    /// boxes are tight over particle positions, so a neighbour of a
    /// particle sitting on the sink boundary lives in a leaf whose tight
    /// box can be up to `radius` away from the sink's.
    pub fn interaction_list(&self, sink: usize, radius: f64) -> Vec<usize> {
        let mut sink_bmin = *self.branch(sink).bmin();
        let mut sink_bmax = *self.branch(sink).bmax();
        for d in 0..D {
            sink_bmin[d] -= radius;
            sink_bmax[d] += radius;
        }

        let mut list = Vec::new();
        let mut stack: BranchStack = SmallVec::new();
        stack.push(self.root());

        while let Some(index) = stack.pop() {
            let branch = self.branch(index);
            if branch.is_leaf() {
                list.push(index);
            } else {
                for i in 0..MortonKey::<D>::NUM_CHILDREN {
                    let child_index = self.child(index, i).unwrap();
                    let child = self.branch(child_index);
                    if child.count() > 0
                        && intersects_box_box(&sink_bmin, &sink_bmax, child.bmin(), child.bmax())
                    {
                        stack.push(child_index);
                    }
                }
            }
        }

        list
    }

    /// Non-empty leaves in the subtree below `start`.
    fn leaves_below(&self, start: usize) -> Vec<usize> {
        self.preorder(start)
            .into_iter()
            .filter(|&index| self.branch(index).is_leaf() && !self.branch(index).bucket().is_empty())
            .collect()
    }

    /// Apply `visitor` to every locally owned particle together with its
    /// neighbourhood of radius `radius`.
    ///
    /// Work is scheduled per sink branch (see [`Tree::find_sub_cells`])
    /// on the rayon pool. Each task snapshots the neighbour state of its
    /// particles, applies the visitor to a copy and returns the updated
    /// copies; the updates are written back after all tasks complete.
    /// Every local particle belongs to exactly one sink, so the merge is
    /// collision free. Neighbour lists are ordered by particle id and
    /// include the particle itself.
    ///
    /// A non-positive radius performs no work.
    pub fn apply_sub_cells<F>(&mut self, radius: f64, criterion: u64, visitor: F)
    where
        F: Fn(&mut Particle<D>, &[Particle<D>]) + Send + Sync,
    {
        if radius <= 0.0 {
            return;
        }

        let sinks = self.find_sub_cells(self.root(), criterion);

        let tree = &*self;
        let updates: Vec<(usize, Particle<D>)> = sinks
            .par_iter()
            .flat_map_iter(|&sink| {
                let interaction = tree.interaction_list(sink, radius);
                let mut task_updates = Vec::new();

                for leaf in tree.leaves_below(sink) {
                    for &particle_index in tree.branch(leaf).bucket() {
                        let particle = tree.particles()[particle_index];
                        if !particle.is_local() {
                            continue;
                        }

                        let mut neighbours = Vec::new();
                        for &other_leaf in &interaction {
                            for &neighbour_index in tree.branch(other_leaf).bucket() {
                                let neighbour = tree.particles()[neighbour_index];
                                if within(&particle.position, &neighbour.position, radius) {
                                    neighbours.push(neighbour);
                                }
                            }
                        }
                        neighbours.sort_by_key(|neighbour| neighbour.id);

                        let mut updated = particle;
                        visitor(&mut updated, &neighbours);
                        task_updates.push((particle_index, updated));
                    }
                }

                task_updates
            })
            .collect();

        for (particle_index, updated) in updates {
            self.particles_mut()[particle_index] = updated;
        }
    }

    /// Apply `visitor` to every locally owned particle in parallel.
    pub fn apply_local<F>(&mut self, visitor: F)
    where
        F: Fn(&mut Particle<D>) + Send + Sync,
    {
        let n_local = self.n_local();
        self.particles_mut()[..n_local]
            .par_iter_mut()
            .for_each(visitor);
    }
}

#[cfg(test)]
mod test {
    use rand::prelude::*;
    use rand::rngs::StdRng;

    use crate::geometry::{within, within_box, DomainBox};
    use crate::particle::Particle;
    use crate::tree::{ComMode, Tree};

    fn build_random_tree(npoints: usize, seed: u64) -> Tree<3> {
        let mut tree = Tree::new(DomainBox::new([0.0; 3], [1.0; 3]), 8, 16);
        let mut rng = StdRng::seed_from_u64(seed);
        for id in 0..npoints as u64 {
            tree.insert(Particle::new(
                id,
                [rng.gen(), rng.gen(), rng.gen()],
                [0.0; 3],
                1.0,
                1.0,
                1.0,
                0.05,
                1.0,
            ));
        }
        tree.update_branches(ComMode::All);
        tree
    }

    #[test]
    fn test_find_in_radius_matches_brute_force() {
        let tree = build_random_tree(500, 11);
        let centers = [[0.5, 0.5, 0.5], [0.05, 0.9, 0.4], [1.0, 1.0, 1.0]];

        for center in &centers {
            for radius in [0.05, 0.2, 0.7] {
                let mut found = tree.find_in_radius(center, radius);
                found.sort_unstable();

                let mut expected: Vec<usize> = tree
                    .particles()
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| within(center, &p.position, radius))
                    .map(|(i, _)| i)
                    .collect();
                expected.sort_unstable();

                assert_eq!(found, expected);
            }
        }
    }

    #[test]
    fn test_find_in_radius_idempotent() {
        let tree = build_random_tree(200, 12);
        let first = tree.find_in_radius(&[0.3, 0.3, 0.3], 0.25);
        let second = tree.find_in_radius(&[0.3, 0.3, 0.3], 0.25);
        assert_eq!(first, second);
    }

    #[test]
    fn test_find_in_radius_zero_is_empty() {
        let tree = build_random_tree(100, 13);
        let center = tree.particles()[0].position;
        assert!(tree.find_in_radius(&center, 0.0).is_empty());
        assert!(tree.find_in_radius(&center, -1.0).is_empty());
    }

    #[test]
    fn test_find_in_box_matches_brute_force() {
        let tree = build_random_tree(500, 14);
        let boxes = [
            ([0.2, 0.2, 0.2], [0.6, 0.5, 0.9]),
            ([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]),
            ([0.9, 0.9, 0.9], [0.95, 0.95, 0.95]),
        ];

        for (bmin, bmax) in &boxes {
            let mut found = tree.find_in_box(bmin, bmax);
            found.sort_unstable();

            let mut expected: Vec<usize> = tree
                .particles()
                .iter()
                .enumerate()
                .filter(|(_, p)| within_box(&p.position, bmin, bmax))
                .map(|(i, _)| i)
                .collect();
            expected.sort_unstable();

            assert_eq!(found, expected);
        }
    }

    #[test]
    fn test_sinks_cover_all_particles_once() {
        let tree = build_random_tree(400, 15);
        let sinks = tree.find_sub_cells(tree.root(), 32);

        let mut seen = vec![false; tree.particles().len()];
        for &sink in &sinks {
            let branch = tree.branch(sink);
            assert!(branch.is_leaf() || branch.count() <= 32);
            for leaf in tree.leaves() {
                if branch.key().is_ancestor(tree.branch(leaf).key()) {
                    for &p in tree.branch(leaf).bucket() {
                        assert!(!seen[p], "particle covered by two sinks");
                        seen[p] = true;
                    }
                }
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_apply_sub_cells_matches_brute_force() {
        let mut tree = build_random_tree(300, 16);
        let radius = 0.15;

        // Sum of neighbour masses stands in for a density estimate.
        tree.apply_sub_cells(radius, 32, |particle, neighbours| {
            particle.density = neighbours.iter().map(|n| n.mass).sum();
        });

        let particles = tree.particles().to_vec();
        for particle in &particles {
            let expected: f64 = particles
                .iter()
                .filter(|other| within(&particle.position, &other.position, radius))
                .map(|other| other.mass)
                .sum();
            assert!(
                (particle.density - expected).abs() < 1e-12,
                "density mismatch for particle {}",
                particle.id
            );
        }
    }

    #[test]
    fn test_apply_sub_cells_neighbours_sorted_and_include_self() {
        let mut tree = build_random_tree(150, 17);
        tree.apply_sub_cells(0.2, 16, |particle, neighbours| {
            assert!(neighbours.windows(2).all(|w| w[0].id < w[1].id));
            assert!(neighbours.iter().any(|n| n.id == particle.id));
        });
    }

    #[test]
    fn test_apply_sub_cells_zero_radius_does_nothing() {
        let mut tree = build_random_tree(100, 18);
        tree.apply_sub_cells(0.0, 32, |particle, _| {
            particle.density = f64::NAN;
        });
        assert!(tree.particles().iter().all(|p| p.density == 1.0));
    }

    #[test]
    fn test_apply_local_visits_exactly_locals() {
        let mut tree = build_random_tree(100, 19);
        let mut ghost = Particle::new(1000, [0.5; 3], [0.0; 3], 1.0, 1.0, 1.0, 0.05, 1.0);
        ghost.locality = crate::particle::Locality::Ghost;
        tree.insert(ghost);
        tree.update_branches(ComMode::All);

        tree.apply_local(|particle| particle.dudt = 1.0);

        assert_eq!(
            tree.particles().iter().filter(|p| p.dudt == 1.0).count(),
            100
        );
    }
}
