//! Per-step orchestration of the distributed pipeline.

use mpi::collective::SystemOperation;
use mpi::traits::CommunicatorCollectives;

use crate::boundary::{clean_mirrors, generate_mirrors};
use crate::constants::{GHOST_INFLATION, MIRROR_BAND};
use crate::geometry::DomainBox;
use crate::ghosts::{plan_ghosts, refresh_ghosts, GhostPlan};
use crate::morton::MortonKey;
use crate::params::SimParams;
use crate::particle::{Locality, Particle};
use crate::sort::{distributed_sort, even_targets};
use crate::tools::{fatal, global_max_f64, global_size, global_sum_f64};
use crate::tree::{BranchRecord, ComMode, Tree};

/// The distributed particle system.
///
/// Owns the local particles, the per-step tree and the ghost plan, and
/// runs the rebuild pipeline: clean mirrors, reduce the maximum smoothing
/// length, regenerate mirrors, compute the global range, re-key,
/// redistribute, rebuild the local tree, roll up, plan and refresh
/// ghosts. Physics visitors run against the finished tree through
/// [`ParticleSystem::apply_in_smoothing_length`] and
/// [`ParticleSystem::apply_local`].
pub struct ParticleSystem<const D: usize> {
    particles: Vec<Particle<D>>,
    tree: Option<Tree<D>>,
    plan: Option<GhostPlan>,
    params: SimParams,
    periodic_domain: Option<DomainBox<D>>,
    h_max: f64,
    total: usize,
}

impl<const D: usize> ParticleSystem<D> {
    /// Create a system from this worker's share of the initial
    /// conditions.
    pub fn new(particles: Vec<Particle<D>>, params: SimParams) -> Self {
        Self {
            particles,
            tree: None,
            plan: None,
            params,
            periodic_domain: None,
            h_max: 0.0,
            total: 0,
        }
    }

    /// Create a system from a flat coordinate array, `D` values per
    /// particle, assigning globally unique ids across ranks.
    pub fn from_flat_positions<C: CommunicatorCollectives>(
        coordinates: &[f64],
        mass: f64,
        smoothing_length: f64,
        params: SimParams,
        comm: &C,
    ) -> Self {
        assert_eq!(coordinates.len() % D, 0);
        let positions: &[[f64; D]] = bytemuck::cast_slice(coordinates);

        // Offset the ids by the particle counts of the lower ranks.
        let local_count = positions.len() as u64;
        let mut id_base = 0_u64;
        comm.exclusive_scan_into(&local_count, &mut id_base, SystemOperation::sum());
        if comm.rank() == 0 {
            id_base = 0;
        }

        let rank = comm.rank();
        let particles = positions
            .iter()
            .enumerate()
            .map(|(index, &position)| {
                let mut particle = Particle::new(
                    id_base + index as u64,
                    position,
                    [0.0; D],
                    mass,
                    1.0,
                    1.0,
                    smoothing_length,
                    1.0,
                );
                particle.owner = rank;
                particle
            })
            .collect();

        Self::new(particles, params)
    }

    /// Set the fixed physical box used to wrap periodic mirrors. Required
    /// when any periodicity flag is set.
    pub fn set_periodic_domain(&mut self, domain: DomainBox<D>) {
        self.periodic_domain = Some(domain);
    }

    /// The parameter bundle.
    pub fn params(&self) -> &SimParams {
        &self.params
    }

    /// The globally reduced maximum smoothing length of the last rebuild.
    pub fn h_max(&self) -> f64 {
        self.h_max
    }

    /// The global particle count of the last rebuild, mirrors included.
    pub fn total_count(&self) -> usize {
        self.total
    }

    /// The tree of the last rebuild.
    pub fn tree(&self) -> Option<&Tree<D>> {
        self.tree.as_ref()
    }

    /// Locally owned particles (periodic mirrors included), in key order
    /// after a rebuild.
    pub fn locals(&self) -> &[Particle<D>] {
        match &self.tree {
            Some(tree) => &tree.particles()[..tree.n_local()],
            None => &self.particles,
        }
    }

    /// Abort on particles that violate the physical preconditions.
    fn validate<C: CommunicatorCollectives>(particles: &[Particle<D>], comm: &C) {
        for particle in particles {
            if particle.position.iter().any(|x| !x.is_finite()) {
                fatal(
                    comm,
                    &format!("particle {} has a non-finite coordinate", particle.id),
                );
            }
            if !(particle.mass > 0.0) {
                fatal(
                    comm,
                    &format!("particle {} has non-positive mass", particle.id),
                );
            }
            if particle.density < 0.0 {
                fatal(
                    comm,
                    &format!("particle {} has negative density", particle.id),
                );
            }
        }
    }

    /// Compute the global range of the system, inflated by twice the
    /// maximum smoothing length.
    fn compute_range<C: CommunicatorCollectives>(
        &self,
        particles: &[Particle<D>],
        comm: &C,
    ) -> DomainBox<D> {
        let mut local_min = [f64::MAX; D];
        let mut local_max = [f64::MIN; D];
        for particle in particles {
            for d in 0..D {
                local_min[d] = local_min[d].min(particle.position[d]);
                local_max[d] = local_max[d].max(particle.position[d]);
            }
        }

        let mut global_min = [0.0; D];
        let mut global_max = [0.0; D];
        comm.all_reduce_into(&local_min[..], &mut global_min[..], SystemOperation::min());
        comm.all_reduce_into(&local_max[..], &mut global_max[..], SystemOperation::max());

        let range =
            DomainBox::new(global_min, global_max).inflated(GHOST_INFLATION * self.h_max);
        if range.extent().iter().any(|&extent| !(extent > 0.0)) {
            fatal(comm, "degenerate domain range");
        }

        if comm.rank() == 0 {
            tracing::debug!(%range, "computed global range");
        }

        range
    }

    /// Rebuild the distributed tree for the current particle positions.
    ///
    /// Each phase is a collective; every worker observes the same phase
    /// sequence. After this call the local tree holds the worker's share
    /// of particles in key order followed by fresh ghosts, branches are
    /// rolled up over all particles, and the ghost plan is ready for
    /// [`ParticleSystem::refresh_neighbors`].
    pub fn update_iteration<C: CommunicatorCollectives>(&mut self, comm: &C) {
        let rank = comm.rank();
        let size = comm.size() as usize;

        // Reclaim the arena from the previous step and drop mirrors.
        let mut particles = match self.tree.take() {
            Some(tree) => tree.take_local_particles(),
            None => std::mem::take(&mut self.particles),
        };
        self.plan = None;
        clean_mirrors(&mut particles);

        Self::validate(&particles, comm);

        // Reduce the maximum smoothing length.
        let local_h = particles
            .iter()
            .map(|p| p.smoothing_length)
            .fold(0.0, f64::max);
        self.h_max = global_max_f64(local_h, comm);

        // Regenerate periodic mirrors against the configured domain.
        if self.params.any_periodic::<D>() {
            let Some(domain) = self.periodic_domain else {
                fatal(comm, "periodic boundaries configured without a domain box");
            };
            generate_mirrors(
                &mut particles,
                &domain,
                MIRROR_BAND * self.h_max,
                &self.params.periodic::<D>(),
            );
        }

        self.total = global_size(&particles, comm);
        if self.total == 0 {
            fatal(comm, "no particles in the system");
        }

        // Global range and keys for this rebuild.
        let range = self.compute_range(&particles, comm);
        let max_level = self.params.max_tree_depth.min(MortonKey::<D>::DEEPEST_LEVEL);
        for particle in particles.iter_mut() {
            particle.key = MortonKey::from_point(&range, &particle.position, max_level);
        }

        // Redistribute to the per-rank targets.
        let targets = even_targets(self.total, size);
        let mut particles = distributed_sort(particles, &targets, comm);

        // Everything that arrived here is ours now.
        for particle in particles.iter_mut() {
            particle.owner = rank;
            particle.locality = Locality::Local;
        }

        // Build the local tree and roll up the local aggregates.
        let mut tree = Tree::new(range, self.params.leaf_capacity, max_level);
        for particle in particles.drain(..) {
            tree.insert(particle);
        }
        tree.update_branches(ComMode::LocalOnly);
        if tree.branch(tree.root()).count() != tree.n_local() as u64 {
            fatal(comm, "root count does not match local particle count");
        }

        // Plan the ghost exchange and fill the ghost state once, then
        // roll up again so queries see the ghosts.
        let plan = plan_ghosts(&mut tree, self.h_max, comm);
        refresh_ghosts(&mut tree, &plan, comm);
        tree.update_branches(ComMode::All);

        if rank == 0 {
            tracing::info!(total = self.total, max_depth = tree.max_depth(), "rebuild done");
        }

        self.tree = Some(tree);
        self.plan = Some(plan);
    }

    /// Push fresh owner state into every ghost, reusing the plan of the
    /// last rebuild. Call between visitors whose neighbour reads depend
    /// on fields written by a previous visitor.
    pub fn refresh_neighbors<C: CommunicatorCollectives>(&mut self, comm: &C) {
        let tree = self
            .tree
            .as_mut()
            .expect("update_iteration must run before refresh_neighbors");
        let plan = self.plan.as_ref().unwrap();
        refresh_ghosts(tree, plan, comm);
    }

    /// Apply a physics visitor to every locally owned particle and its
    /// neighbourhood of radius `2 h_max`.
    pub fn apply_in_smoothing_length<F>(&mut self, visitor: F)
    where
        F: Fn(&mut Particle<D>, &[Particle<D>]) + Send + Sync,
    {
        let radius = GHOST_INFLATION * self.h_max;
        let criterion = self.params.sink_criterion;
        let tree = self
            .tree
            .as_mut()
            .expect("update_iteration must run before visitors");
        tree.apply_sub_cells(radius, criterion, visitor);
    }

    /// Apply a visitor to every locally owned particle.
    pub fn apply_local<F>(&mut self, visitor: F)
    where
        F: Fn(&mut Particle<D>) + Send + Sync,
    {
        let tree = self
            .tree
            .as_mut()
            .expect("update_iteration must run before visitors");
        tree.apply_local(visitor);
    }

    /// Globally reduced total mass over owned particles.
    pub fn total_mass<C: CommunicatorCollectives>(&self, comm: &C) -> f64 {
        let local = self
            .locals()
            .iter()
            .filter(|p| p.is_owned())
            .map(|p| p.mass)
            .sum();
        global_sum_f64(local, comm)
    }

    /// Globally reduced linear momentum over owned particles.
    pub fn linear_momentum<C: CommunicatorCollectives>(&self, comm: &C) -> [f64; D] {
        let mut local = [0.0; D];
        for particle in self.locals().iter().filter(|p| p.is_owned()) {
            for d in 0..D {
                local[d] += particle.mass * particle.velocity[d];
            }
        }
        let mut global = [0.0; D];
        comm.all_reduce_into(&local[..], &mut global[..], SystemOperation::sum());
        global
    }

    /// Globally reduced total energy (internal plus kinetic) over owned
    /// particles.
    pub fn total_energy<C: CommunicatorCollectives>(&self, comm: &C) -> f64 {
        let local = self
            .locals()
            .iter()
            .filter(|p| p.is_owned())
            .map(|p| {
                let v2: f64 = p.velocity.iter().map(|v| v * v).sum();
                p.mass * (p.internal_energy + 0.5 * v2)
            })
            .sum();
        global_sum_f64(local, comm)
    }

    /// Diagnostic records for every branch of the current tree.
    pub fn snapshot(&self) -> Vec<BranchRecord<D>> {
        self.tree
            .as_ref()
            .map(|tree| tree.snapshot())
            .unwrap_or_default()
    }
}
