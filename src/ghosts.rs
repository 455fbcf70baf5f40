//! Ghost exchange: planning and refresh.
//!
//! Once per tree rebuild every worker publishes the bounding box of its
//! local particles, inflated by twice the global maximum smoothing
//! length, and learns which of its particles fall into the peers'
//! inflated regions. Those particles are announced to the peers, which
//! insert them as ghost entries in their own trees. The resulting
//! [`GhostPlan`] pairs per-peer send lists with per-peer receive slots
//! and is reused unchanged by every refresh within the step: refreshing
//! is a buffer fill, one all-to-all-v and an in-order copy into the
//! ghost slots. No pointer rewiring is involved, the slots are arena
//! indices.

use std::mem::offset_of;

use itertools::izip;
use mpi::datatype::{Partition, PartitionMut, UncommittedDatatypeRef, UncommittedUserDatatype, UserDatatype};
use mpi::traits::{CommunicatorCollectives, Equivalence};

use crate::constants::GHOST_INFLATION;
use crate::particle::{Locality, Particle};
use crate::tools::{displacements, fatal, gather_to_all};
use crate::tree::Tree;

/// The inflated bounding region one worker publishes to its peers.
#[derive(Clone, Copy, Debug)]
pub struct WorkerBounds<const D: usize> {
    /// Lower corner.
    pub min: [f64; D],
    /// Upper corner.
    pub max: [f64; D],
}

unsafe impl<const D: usize> Equivalence for WorkerBounds<D> {
    type Out = UserDatatype;

    #[allow(clippy::useless_conversion)]
    fn equivalent_datatype() -> Self::Out {
        let d = D as mpi::Count;
        UserDatatype::structured::<UncommittedDatatypeRef>(
            &[1, 1],
            &[
                (offset_of!(WorkerBounds<D>, min) as i64).try_into().unwrap(),
                (offset_of!(WorkerBounds<D>, max) as i64).try_into().unwrap(),
            ],
            &[
                UncommittedUserDatatype::contiguous(d, &f64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(d, &f64::equivalent_datatype()).as_ref(),
            ],
        )
    }
}

impl<const D: usize> Default for WorkerBounds<D> {
    fn default() -> Self {
        // Inverted box; intersects nothing until real bounds are set.
        Self {
            min: [f64::MAX; D],
            max: [f64::MIN; D],
        }
    }
}

/// Compact announcement record for a particle entering a peer's tree.
#[derive(Clone, Copy, Debug)]
struct GhostSeed<const D: usize> {
    id: u64,
    position: [f64; D],
    mass: f64,
    smoothing_length: f64,
    owner: i32,
}

unsafe impl<const D: usize> Equivalence for GhostSeed<D> {
    type Out = UserDatatype;

    #[allow(clippy::useless_conversion)]
    fn equivalent_datatype() -> Self::Out {
        let d = D as mpi::Count;
        UserDatatype::structured::<UncommittedDatatypeRef>(
            &[1, 1, 1, 1, 1],
            &[
                (offset_of!(GhostSeed<D>, id) as i64).try_into().unwrap(),
                (offset_of!(GhostSeed<D>, position) as i64).try_into().unwrap(),
                (offset_of!(GhostSeed<D>, mass) as i64).try_into().unwrap(),
                (offset_of!(GhostSeed<D>, smoothing_length) as i64)
                    .try_into()
                    .unwrap(),
                (offset_of!(GhostSeed<D>, owner) as i64).try_into().unwrap(),
            ],
            &[
                u64::equivalent_datatype().into(),
                UncommittedUserDatatype::contiguous(d, &f64::equivalent_datatype()).as_ref(),
                f64::equivalent_datatype().into(),
                f64::equivalent_datatype().into(),
                i32::equivalent_datatype().into(),
            ],
        )
    }
}

impl<const D: usize> Default for GhostSeed<D> {
    fn default() -> Self {
        Self {
            id: 0,
            position: [0.0; D],
            mass: 0.0,
            smoothing_length: 0.0,
            owner: 0,
        }
    }
}

/// Full state record pushed on every refresh.
#[derive(Clone, Copy, Debug)]
struct GhostUpdate<const D: usize> {
    id: u64,
    position: [f64; D],
    velocity: [f64; D],
    velocity_half: [f64; D],
    acceleration: [f64; D],
    mass: f64,
    density: f64,
    pressure: f64,
    internal_energy: f64,
    dudt: f64,
    smoothing_length: f64,
}

unsafe impl<const D: usize> Equivalence for GhostUpdate<D> {
    type Out = UserDatatype;

    #[allow(clippy::useless_conversion)]
    fn equivalent_datatype() -> Self::Out {
        let d = D as mpi::Count;
        UserDatatype::structured::<UncommittedDatatypeRef>(
            &[1; 11],
            &[
                (offset_of!(GhostUpdate<D>, id) as i64).try_into().unwrap(),
                (offset_of!(GhostUpdate<D>, position) as i64).try_into().unwrap(),
                (offset_of!(GhostUpdate<D>, velocity) as i64).try_into().unwrap(),
                (offset_of!(GhostUpdate<D>, velocity_half) as i64)
                    .try_into()
                    .unwrap(),
                (offset_of!(GhostUpdate<D>, acceleration) as i64)
                    .try_into()
                    .unwrap(),
                (offset_of!(GhostUpdate<D>, mass) as i64).try_into().unwrap(),
                (offset_of!(GhostUpdate<D>, density) as i64).try_into().unwrap(),
                (offset_of!(GhostUpdate<D>, pressure) as i64).try_into().unwrap(),
                (offset_of!(GhostUpdate<D>, internal_energy) as i64)
                    .try_into()
                    .unwrap(),
                (offset_of!(GhostUpdate<D>, dudt) as i64).try_into().unwrap(),
                (offset_of!(GhostUpdate<D>, smoothing_length) as i64)
                    .try_into()
                    .unwrap(),
            ],
            &[
                u64::equivalent_datatype().into(),
                UncommittedUserDatatype::contiguous(d, &f64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(d, &f64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(d, &f64::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(d, &f64::equivalent_datatype()).as_ref(),
                f64::equivalent_datatype().into(),
                f64::equivalent_datatype().into(),
                f64::equivalent_datatype().into(),
                f64::equivalent_datatype().into(),
                f64::equivalent_datatype().into(),
                f64::equivalent_datatype().into(),
            ],
        )
    }
}

impl<const D: usize> Default for GhostUpdate<D> {
    fn default() -> Self {
        Self {
            id: 0,
            position: [0.0; D],
            velocity: [0.0; D],
            velocity_half: [0.0; D],
            acceleration: [0.0; D],
            mass: 0.0,
            density: 0.0,
            pressure: 0.0,
            internal_energy: 0.0,
            dudt: 0.0,
            smoothing_length: 0.0,
        }
    }
}

impl<const D: usize> GhostUpdate<D> {
    fn from_particle(particle: &Particle<D>) -> Self {
        Self {
            id: particle.id,
            position: particle.position,
            velocity: particle.velocity,
            velocity_half: particle.velocity_half,
            acceleration: particle.acceleration,
            mass: particle.mass,
            density: particle.density,
            pressure: particle.pressure,
            internal_energy: particle.internal_energy,
            dudt: particle.dudt,
            smoothing_length: particle.smoothing_length,
        }
    }
}

/// Persistent send/receive plan for ghost refreshes.
///
/// Immutable between tree rebuilds. Send lists hold arena indices of
/// locally owned particles in (key, id) order per peer; receive slots
/// hold the arena indices of the inserted ghost particles in the exact
/// order the peers send them.
pub struct GhostPlan {
    send_indices: Vec<usize>,
    send_counts: Vec<i32>,
    recv_slots: Vec<usize>,
    recv_counts: Vec<i32>,
}

impl GhostPlan {
    /// An empty plan, used before the first exchange.
    pub fn empty(size: usize) -> Self {
        Self {
            send_indices: Vec::new(),
            send_counts: vec![0; size],
            recv_slots: Vec::new(),
            recv_counts: vec![0; size],
        }
    }

    /// Total number of particles sent per refresh.
    pub fn num_send(&self) -> usize {
        self.send_indices.len()
    }

    /// Total number of ghost slots filled per refresh.
    pub fn num_recv(&self) -> usize {
        self.recv_slots.len()
    }
}

/// The inflated bounding region of this worker's local particles.
pub(crate) fn local_bounds<const D: usize>(tree: &Tree<D>, h_max: f64) -> WorkerBounds<D> {
    let mut bounds = WorkerBounds::default();

    for particle in &tree.particles()[..tree.n_local()] {
        for d in 0..D {
            bounds.min[d] = bounds.min[d].min(particle.position[d]);
            bounds.max[d] = bounds.max[d].max(particle.position[d]);
        }
    }

    if tree.n_local() > 0 {
        let margin = GHOST_INFLATION * h_max;
        for d in 0..D {
            bounds.min[d] -= margin;
            bounds.max[d] += margin;
        }
    }

    bounds
}

/// Build the ghost plan for the current tree.
///
/// Inserts one ghost particle per received announcement; the caller must
/// roll up the branches again afterwards so that queries see the ghosts.
/// Peers with nothing to exchange contribute zero-length lists.
pub fn plan_ghosts<const D: usize, C: CommunicatorCollectives>(
    tree: &mut Tree<D>,
    h_max: f64,
    comm: &C,
) -> GhostPlan {
    let size = comm.size() as usize;
    let rank = comm.rank();

    // 1. Publish the inflated local regions.

    let bounds = local_bounds(tree, h_max);
    let all_bounds = gather_to_all(std::slice::from_ref(&bounds), comm);

    // 2. For each peer, the local particles inside its region form the
    // out-list. The pre-send (key, id) sort fixes the order the peer will
    // see for the lifetime of the plan.

    let mut send_indices = Vec::new();
    let mut send_counts = vec![0_i32; size];

    for (peer, peer_bounds) in all_bounds.iter().enumerate() {
        if peer == rank as usize {
            continue;
        }
        let mut found = tree.find_in_box(&peer_bounds.min, &peer_bounds.max);
        found.retain(|&index| tree.particles()[index].is_local());
        found.sort_unstable_by_key(|&index| {
            let particle = &tree.particles()[index];
            (particle.key.value(), particle.id)
        });
        send_counts[peer] = found.len() as i32;
        send_indices.extend(found);
    }

    // 3. Exchange counts, then the announcement records.

    let mut recv_counts = vec![0_i32; size];
    comm.all_to_all_into(&send_counts, &mut recv_counts);

    let seeds = send_indices
        .iter()
        .map(|&index| {
            let particle = &tree.particles()[index];
            GhostSeed {
                id: particle.id,
                position: particle.position,
                mass: particle.mass,
                smoothing_length: particle.smoothing_length,
                owner: rank,
            }
        })
        .collect::<Vec<_>>();

    let send_displs = displacements(&send_counts);
    let send_partition = Partition::new(&seeds, &send_counts[..], &send_displs[..]);

    let total_recv = recv_counts.iter().sum::<i32>() as usize;
    let mut received = vec![GhostSeed::<D>::default(); total_recv];
    let recv_displs = displacements(&recv_counts);
    let mut recv_partition =
        PartitionMut::new(&mut received[..], &recv_counts[..], &recv_displs[..]);

    comm.all_to_all_varcount_into(&send_partition, &mut recv_partition);

    // 4. Insert the announced particles as ghosts, recording their arena
    // slots in arrival order.

    let recv_slots = received
        .iter()
        .map(|seed| {
            let ghost = Particle {
                id: seed.id,
                position: seed.position,
                mass: seed.mass,
                smoothing_length: seed.smoothing_length,
                owner: seed.owner,
                locality: Locality::Ghost,
                ..Default::default()
            };
            tree.insert(ghost)
        })
        .collect::<Vec<_>>();

    if rank == 0 {
        tracing::info!(
            nsend = send_indices.len(),
            nrecv = recv_slots.len(),
            "ghost plan built"
        );
    }

    GhostPlan {
        send_indices,
        send_counts,
        recv_slots,
        recv_counts,
    }
}

/// Push current local state through the plan and copy it into the ghost
/// slots. Reusable any number of times until the next rebuild.
pub fn refresh_ghosts<const D: usize, C: CommunicatorCollectives>(
    tree: &mut Tree<D>,
    plan: &GhostPlan,
    comm: &C,
) {
    let mut sendbuffer = Vec::with_capacity(plan.send_indices.len());
    for &index in &plan.send_indices {
        sendbuffer.push(GhostUpdate::from_particle(&tree.particles()[index]));
    }

    let send_displs = displacements(&plan.send_counts);
    let send_partition = Partition::new(&sendbuffer, &plan.send_counts[..], &send_displs[..]);

    let mut recvbuffer = vec![GhostUpdate::<D>::default(); plan.recv_slots.len()];
    let recv_displs = displacements(&plan.recv_counts);
    let mut recv_partition =
        PartitionMut::new(&mut recvbuffer[..], &plan.recv_counts[..], &recv_displs[..]);

    comm.all_to_all_varcount_into(&send_partition, &mut recv_partition);

    for (&slot, update) in izip!(&plan.recv_slots, &recvbuffer) {
        let particle = &mut tree.particles_mut()[slot];
        if particle.id != update.id {
            fatal(comm, "ghost refresh slot does not match the planned particle");
        }
        particle.position = update.position;
        particle.velocity = update.velocity;
        particle.velocity_half = update.velocity_half;
        particle.acceleration = update.acceleration;
        particle.mass = update.mass;
        particle.density = update.density;
        particle.pressure = update.pressure;
        particle.internal_energy = update.internal_energy;
        particle.dudt = update.dudt;
        particle.smoothing_length = update.smoothing_length;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::DomainBox;
    use crate::tree::Tree;

    #[test]
    fn test_local_bounds_cover_locals_with_margin() {
        let mut tree = Tree::<2>::new(DomainBox::new([0.0; 2], [1.0; 2]), 8, 10);
        tree.insert(Particle::new(0, [0.2, 0.3], [0.0; 2], 1.0, 1.0, 1.0, 0.05, 1.0));
        tree.insert(Particle::new(1, [0.8, 0.6], [0.0; 2], 1.0, 1.0, 1.0, 0.05, 1.0));

        let bounds = local_bounds(&tree, 0.1);
        assert!((bounds.min[0] - (0.2 - 0.2)).abs() < 1e-14);
        assert!((bounds.max[0] - (0.8 + 0.2)).abs() < 1e-14);
        assert!((bounds.min[1] - (0.3 - 0.2)).abs() < 1e-14);
        assert!((bounds.max[1] - (0.6 + 0.2)).abs() < 1e-14);
    }

    #[test]
    fn test_local_bounds_of_empty_worker_intersect_nothing() {
        let tree = Tree::<3>::new(DomainBox::new([0.0; 3], [1.0; 3]), 8, 10);
        let bounds = local_bounds(&tree, 0.1);
        assert!(!crate::geometry::intersects_box_box(
            &bounds.min,
            &bounds.max,
            &[0.0; 3],
            &[1.0; 3],
        ));
    }

    #[test]
    fn test_local_bounds_ignore_ghosts() {
        let mut tree = Tree::<1>::new(DomainBox::new([0.0], [1.0]), 8, 10);
        tree.insert(Particle::new(0, [0.5], [0.0], 1.0, 1.0, 1.0, 0.01, 1.0));
        let mut ghost = Particle::new(1, [0.99], [0.0], 1.0, 1.0, 1.0, 0.01, 1.0);
        ghost.locality = Locality::Ghost;
        tree.insert(ghost);

        let bounds = local_bounds(&tree, 0.0);
        assert_eq!(bounds.min[0], 0.5);
        assert_eq!(bounds.max[0], 0.5);
    }

    #[test]
    fn test_empty_plan_accounting() {
        let plan = GhostPlan::empty(4);
        assert_eq!(plan.num_send(), 0);
        assert_eq!(plan.num_recv(), 0);
        assert_eq!(plan.send_counts.len(), 4);
    }
}
