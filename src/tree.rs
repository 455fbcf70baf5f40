//! Hashed tree over Morton keys.
//!
//! Branches live in an arena and are addressed through a hash map from
//! Morton key to arena index, so the tree needs no parent or child
//! pointers: navigation happens on the keys. Leaves hold buckets of
//! particle arena indices; inserting into a full leaf refines it by
//! allocating all 2^D children and redistributing the bucket.
//!
//! The tree is rebuilt from scratch every step. There is no coarsening
//! and no reinsertion under particle motion.

pub mod query;

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::geometry::DomainBox;
use crate::morton::MortonKey;
use crate::particle::Particle;

/// A node of the hashed tree.
#[derive(Clone, Debug)]
pub struct Branch<const D: usize> {
    key: MortonKey<D>,
    leaf: bool,
    bucket: Vec<usize>,
    mass: f64,
    center_of_mass: [f64; D],
    bmin: [f64; D],
    bmax: [f64; D],
    count: u64,
}

impl<const D: usize> Branch<D> {
    fn new(key: MortonKey<D>) -> Self {
        Self {
            key,
            leaf: true,
            bucket: Vec::new(),
            mass: 0.0,
            center_of_mass: [0.0; D],
            // Inverted box, recognised as empty by the intersection
            // predicates until the next rollup.
            bmin: [f64::MAX; D],
            bmax: [f64::MIN; D],
            count: 0,
        }
    }

    /// The key addressing this branch.
    pub fn key(&self) -> MortonKey<D> {
        self.key
    }

    /// Return true if the branch holds particles directly.
    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    /// Particle arena indices held by a leaf. Empty for interior branches.
    pub fn bucket(&self) -> &[usize] {
        &self.bucket
    }

    /// Aggregated mass from the last rollup.
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Mass weighted centroid from the last rollup.
    pub fn center_of_mass(&self) -> &[f64; D] {
        &self.center_of_mass
    }

    /// Lower corner of the bounding box over contained particles.
    pub fn bmin(&self) -> &[f64; D] {
        &self.bmin
    }

    /// Upper corner of the bounding box over contained particles.
    pub fn bmax(&self) -> &[f64; D] {
        &self.bmax
    }

    /// Number of particles below this branch from the last rollup.
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Which particles a rollup aggregates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComMode {
    /// Aggregate every particle in the tree, ghosts included.
    All,
    /// Aggregate locally owned particles only, to avoid double counting
    /// ghosts in global sums.
    LocalOnly,
}

/// A diagnostic record describing one branch.
#[derive(Clone, Copy, Debug)]
pub struct BranchRecord<const D: usize> {
    /// Raw key value of the branch.
    pub key: u64,
    /// Lower corner of the branch bounding box.
    pub bmin: [f64; D],
    /// Upper corner of the branch bounding box.
    pub bmax: [f64; D],
    /// Aggregated mass.
    pub mass: f64,
    /// Aggregated particle count.
    pub count: u64,
}

/// Hashed tree over a fixed domain range.
pub struct Tree<const D: usize> {
    range: DomainBox<D>,
    leaf_capacity: usize,
    max_level: usize,
    branches: Vec<Branch<D>>,
    branch_map: HashMap<MortonKey<D>, usize>,
    particles: Vec<Particle<D>>,
    n_local: usize,
    max_depth: usize,
}

impl<const D: usize> Tree<D> {
    /// Create an empty tree over `range`.
    ///
    /// `max_level` is clamped to the deepest level the key width admits.
    pub fn new(range: DomainBox<D>, leaf_capacity: usize, max_level: usize) -> Self {
        assert!(leaf_capacity > 0);
        let max_level = max_level.min(MortonKey::<D>::DEEPEST_LEVEL);

        let mut branch_map = HashMap::new();
        branch_map.insert(MortonKey::root(), 0);

        Self {
            range,
            leaf_capacity,
            max_level,
            branches: vec![Branch::new(MortonKey::root())],
            branch_map,
            particles: Vec::new(),
            n_local: 0,
            max_depth: 0,
        }
    }

    /// The domain range the tree was built over.
    pub fn range(&self) -> &DomainBox<D> {
        &self.range
    }

    /// The configured maximum refinement level.
    pub fn max_level(&self) -> usize {
        self.max_level
    }

    /// The deepest branch level observed so far.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Arena index of the root branch.
    pub fn root(&self) -> usize {
        0
    }

    /// The branch at the given arena index.
    pub fn branch(&self, index: usize) -> &Branch<D> {
        &self.branches[index]
    }

    /// Number of branches in the tree.
    pub fn num_branches(&self) -> usize {
        self.branches.len()
    }

    /// Direct lookup of a branch by key.
    pub fn get(&self, key: MortonKey<D>) -> Option<&Branch<D>> {
        self.branch_map.get(&key).map(|&index| &self.branches[index])
    }

    /// Arena index of the i-th child of a branch, if present.
    pub fn child(&self, index: usize, i: usize) -> Option<usize> {
        self.branch_map
            .get(&self.branches[index].key.push(i))
            .copied()
    }

    /// All particles in the tree. Locally owned particles occupy the
    /// prefix `[0, n_local)` in key order; ghosts follow.
    pub fn particles(&self) -> &[Particle<D>] {
        &self.particles
    }

    /// Mutable access to the particle arena.
    pub fn particles_mut(&mut self) -> &mut [Particle<D>] {
        &mut self.particles
    }

    /// Number of locally owned particles (periodic mirrors included).
    pub fn n_local(&self) -> usize {
        self.n_local
    }

    /// Move the particle arena out of the tree, dropping ghost entries.
    /// Used by the driver to recover ownership before a rebuild.
    pub fn take_local_particles(mut self) -> Vec<Particle<D>> {
        self.particles.truncate(self.n_local);
        self.particles
    }

    /// Insert a particle, keying it against the tree range.
    ///
    /// Returns the particle's arena index. Locally owned particles must
    /// all be inserted before the first ghost so that the local prefix
    /// stays contiguous.
    pub fn insert(&mut self, mut particle: Particle<D>) -> usize {
        particle.key = MortonKey::from_point(&self.range, &particle.position, self.max_level);

        let index = self.particles.len();
        if particle.is_local() {
            debug_assert_eq!(index, self.n_local, "ghosts must be inserted last");
            self.n_local += 1;
        }
        self.particles.push(particle);

        self.insert_index(index);
        index
    }

    /// Route an arena index into its leaf, refining as needed.
    fn insert_index(&mut self, index: usize) {
        let full = self.particles[index].key;

        // Descend to the deepest existing branch on the key path. Interior
        // branches always have all children present, so the deepest
        // existing branch on the path is a leaf.
        let mut key = full.truncate(self.max_depth.min(full.depth()));
        let branch_index = loop {
            if let Some(&index) = self.branch_map.get(&key) {
                break index;
            }
            key = key.pop();
        };

        debug_assert!(self.branches[branch_index].leaf);
        self.branches[branch_index].bucket.push(index);

        let occupancy = self.branches[branch_index].bucket.len();
        let depth = self.branches[branch_index].key.depth();

        if occupancy > self.leaf_capacity {
            if depth < self.max_level {
                self.refine(branch_index);
            } else if occupancy == self.leaf_capacity + 1 {
                // Coincident or near-coincident points cannot be separated
                // by further refinement; the bucket is allowed to grow.
                tracing::warn!(
                    key = self.branches[branch_index].key.value(),
                    "leaf at maximum depth exceeds capacity"
                );
            }
        }
    }

    /// Split a leaf into its 2^D children and redistribute the bucket.
    /// Children that end up over capacity are split in turn.
    fn refine(&mut self, branch_index: usize) {
        let mut work = vec![branch_index];

        while let Some(parent_index) = work.pop() {
            let parent_key = self.branches[parent_index].key;
            let depth = parent_key.depth() + 1;

            let mut children: SmallVec<[usize; 8]> = SmallVec::new();
            for i in 0..MortonKey::<D>::NUM_CHILDREN {
                let key = parent_key.push(i);
                let child_index = self.branches.len();
                self.branches.push(Branch::new(key));
                self.branch_map.insert(key, child_index);
                children.push(child_index);
            }

            self.max_depth = self.max_depth.max(depth);

            let bucket = std::mem::take(&mut self.branches[parent_index].bucket);
            for particle_index in bucket {
                let full = self.particles[particle_index].key;
                let sibling = full.truncate(depth).sibling_index();
                self.branches[children[sibling]].bucket.push(particle_index);
            }
            self.branches[parent_index].leaf = false;

            for &child in children.iter() {
                if self.branches[child].bucket.len() > self.leaf_capacity {
                    if depth < self.max_level {
                        work.push(child);
                    } else {
                        // Coincident points cannot be separated any further.
                        tracing::warn!(
                            key = self.branches[child].key.value(),
                            "leaf at maximum depth exceeds capacity"
                        );
                    }
                }
            }
        }
    }

    /// Drop all branches except the root and forget all particles.
    pub fn clear(&mut self) {
        self.branches.truncate(1);
        self.branches[0] = Branch::new(MortonKey::root());
        self.branch_map.clear();
        self.branch_map.insert(MortonKey::root(), 0);
        self.particles.clear();
        self.n_local = 0;
        self.max_depth = 0;
    }

    /// Branch arena indices in depth first pre-order from `start`.
    pub(crate) fn preorder(&self, start: usize) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.branches.len());
        let mut stack = vec![start];

        while let Some(index) = stack.pop() {
            order.push(index);
            if !self.branches[index].leaf {
                for i in 0..MortonKey::<D>::NUM_CHILDREN {
                    stack.push(self.child(index, i).unwrap());
                }
            }
        }

        order
    }

    /// Post-order rollup of mass, centroid, bounding box and subtree
    /// count for every branch.
    ///
    /// In [`ComMode::LocalOnly`] ghost particles are skipped, so the root
    /// count equals the number of locally owned particles. Bounding boxes
    /// are tight over particle positions; inflation by smoothing lengths
    /// happens at ghost planning time only.
    pub fn update_branches(&mut self, mode: ComMode) {
        // Children appear after their parent in pre-order, so the reverse
        // order visits children first.
        let order = self.preorder(self.root());

        for &index in order.iter().rev() {
            let mut mass = 0.0;
            let mut centroid = [0.0; D];
            let mut bmin = [f64::MAX; D];
            let mut bmax = [f64::MIN; D];
            let mut count = 0u64;

            if self.branches[index].leaf {
                for &particle_index in &self.branches[index].bucket {
                    let particle = &self.particles[particle_index];
                    if mode == ComMode::LocalOnly && !particle.is_local() {
                        continue;
                    }
                    count += 1;
                    mass += particle.mass;
                    for d in 0..D {
                        bmin[d] = bmin[d].min(particle.position[d]);
                        bmax[d] = bmax[d].max(particle.position[d]);
                        centroid[d] += particle.position[d] * particle.mass;
                    }
                }
            } else {
                for i in 0..MortonKey::<D>::NUM_CHILDREN {
                    let child = &self.branches[self.child(index, i).unwrap()];
                    count += child.count;
                    mass += child.mass;
                    if child.count > 0 {
                        for d in 0..D {
                            bmin[d] = bmin[d].min(child.bmin[d]);
                            bmax[d] = bmax[d].max(child.bmax[d]);
                        }
                    }
                    for d in 0..D {
                        centroid[d] += child.center_of_mass[d] * child.mass;
                    }
                }
            }

            if mass > 0.0 {
                for c in centroid.iter_mut() {
                    *c /= mass;
                }
            }

            let branch = &mut self.branches[index];
            branch.mass = mass;
            branch.center_of_mass = centroid;
            branch.bmin = bmin;
            branch.bmax = bmax;
            branch.count = count;
        }
    }

    /// Arena indices of all leaves.
    pub fn leaves(&self) -> Vec<usize> {
        self.preorder(self.root())
            .into_iter()
            .filter(|&index| self.branches[index].leaf)
            .collect()
    }

    /// Diagnostic records for every branch, in pre-order.
    pub fn snapshot(&self) -> Vec<BranchRecord<D>> {
        self.preorder(self.root())
            .into_iter()
            .map(|index| {
                let branch = &self.branches[index];
                BranchRecord {
                    key: branch.key.value(),
                    bmin: branch.bmin,
                    bmax: branch.bmax,
                    mass: branch.mass,
                    count: branch.count,
                }
            })
            .collect()
    }
}

impl<const D: usize> std::fmt::Display for Tree<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tree: #branches: {} #particles: {} #root_count: {}",
            self.branches.len(),
            self.particles.len(),
            self.branches[0].count
        )
    }
}
