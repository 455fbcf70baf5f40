//! Distributed sample sort with residual balancing.
//!
//! Particles are sorted globally by their Morton key, with the particle
//! id as tiebreak so that replicated keys still have a total order. A
//! sample of evenly spaced keys is gathered to rank 0, which elects
//! splitters; an all-to-all-v moves every particle into its splitter
//! interval. A residual phase then sweeps surplus particles right and
//! left between neighbours until every rank holds exactly its target
//! count.

use itertools::Itertools;
use mpi::traits::{CommunicatorCollectives, Destination, Equivalence, Root, Source};

use crate::constants::SAMPLE_BYTES;
use crate::particle::Particle;
use crate::tools::{fatal, gather_to_root, global_size, redistribute, sort_to_bins};

/// Composite sort key. The id tiebreak keeps the order total when many
/// particles quantise to the same Morton cell, which also covers the
/// degenerate case of every sampled key being identical: the splitters
/// then partition by id alone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Equivalence)]
struct SortKey {
    key: u64,
    id: u64,
}

fn sort_key<const D: usize>(particle: &Particle<D>) -> SortKey {
    SortKey {
        key: particle.key.value(),
        id: particle.id,
    }
}

/// Split `total` into `size` per-rank targets, spreading the remainder
/// over the first ranks.
pub fn even_targets(total: usize, size: usize) -> Vec<usize> {
    let base = total / size;
    let remainder = total % size;
    (0..size)
        .map(|rank| base + usize::from(rank < remainder))
        .collect()
}

/// Per-boundary flow of a left-to-right sweep.
///
/// `flows[r]` is the number of particles rank `r` ships from its tail to
/// rank `r + 1`: the cumulative surplus of ranks `0..=r` against their
/// targets, bounded by what rank `r` currently holds. Flows are computed
/// from the same gathered counts on every rank, so no negotiation is
/// needed.
fn flows_right(counts: &[i64], targets: &[i64]) -> Vec<i64> {
    let mut flows = vec![0_i64; counts.len()];
    let mut excess = 0_i64;
    for r in 0..counts.len().saturating_sub(1) {
        excess += counts[r] - targets[r];
        flows[r] = excess.clamp(0, counts[r]);
    }
    flows
}

/// Per-boundary flow of a right-to-left sweep.
///
/// `flows[r]` is the number of particles rank `r` ships from its head to
/// rank `r - 1`: the cumulative deficit of ranks `0..r`, bounded by what
/// rank `r` currently holds.
fn flows_left(counts: &[i64], targets: &[i64]) -> Vec<i64> {
    let mut flows = vec![0_i64; counts.len()];
    let mut excess = 0_i64;
    for r in 1..counts.len() {
        excess += counts[r - 1] - targets[r - 1];
        flows[r] = (-excess).clamp(0, counts[r]);
    }
    flows
}

fn apply_flows_right(counts: &mut [i64], flows: &[i64]) {
    for r in (1..counts.len()).rev() {
        counts[r] += flows[r - 1];
    }
    for (count, flow) in counts.iter_mut().zip(flows) {
        *count -= flow;
    }
}

fn apply_flows_left(counts: &mut [i64], flows: &[i64]) {
    for r in 0..counts.len().saturating_sub(1) {
        counts[r] += flows[r + 1];
    }
    for (count, flow) in counts.iter_mut().zip(flows) {
        *count -= flow;
    }
}

/// Sort particles globally by (key, id) and redistribute them so that
/// rank `r` ends up with exactly `targets[r]` particles.
///
/// The target vector must have one entry per rank and sum to the global
/// particle count; violations are fatal. Empty local partitions are
/// tolerated at every stage.
pub fn distributed_sort<const D: usize, C: CommunicatorCollectives>(
    particles: Vec<Particle<D>>,
    targets: &[usize],
    comm: &C,
) -> Vec<Particle<D>> {
    let size = comm.size() as usize;
    let rank = comm.rank() as usize;

    if targets.len() != size {
        fatal(comm, "target vector length does not match communicator size");
    }

    let mut particles = particles;
    particles.sort_unstable_by_key(sort_key);

    let global_count = global_size(&particles, comm);
    if targets.iter().sum::<usize>() != global_count {
        fatal(comm, "target vector sum does not match global particle count");
    }

    if size == 1 {
        check_unique_keys(&particles, comm);
        return particles;
    }
    if global_count == 0 {
        return particles;
    }

    // Election: evenly spaced sample keys from each rank, gathered to the
    // coordinator.

    let nsample = (SAMPLE_BYTES / std::mem::size_of::<SortKey>()).min(particles.len());
    let mut samples = Vec::with_capacity(nsample);
    if nsample > 0 {
        let stride = particles.len() / nsample;
        for i in 0..nsample {
            samples.push(sort_key(&particles[i * stride]));
        }
    }

    let gathered = gather_to_root(&samples, comm);

    let mut splitters = vec![SortKey::default(); size - 1];
    if rank == 0 {
        let mut gathered = gathered.unwrap();
        gathered.sort_unstable();
        for (i, splitter) in splitters.iter_mut().enumerate() {
            *splitter = gathered[(i + 1) * gathered.len() / size];
        }
    }
    comm.process_at_rank(0).broadcast_into(&mut splitters[..]);

    // Bin the local particles by splitter interval and exchange.

    let mut bins = vec![SortKey::default()];
    bins.extend_from_slice(&splitters);

    let keys = particles.iter().map(sort_key).collect_vec();
    let counts = sort_to_bins(&keys, &bins)
        .iter()
        .map(|&count| count as i32)
        .collect_vec();

    let mut particles = redistribute(&particles, &counts, comm);
    particles.sort_unstable_by_key(sort_key);

    // Residual phase: gather the per-rank counts once, then sweep
    // deterministically until every rank matches its target.

    let targets = targets.iter().map(|&t| t as i64).collect_vec();
    let local_count = particles.len() as i64;
    let mut counts = vec![0_i64; size];
    comm.all_gather_into(&local_count, &mut counts);

    let mut iteration = 0;
    while counts != targets {
        if iteration >= size {
            fatal(comm, "residual balancing did not converge");
        }
        if iteration > 0 {
            tracing::warn!(iteration, "residual balancing needs another sweep");
        }

        let right = flows_right(&counts, &targets);
        sweep_right(&mut particles, &right, comm);
        apply_flows_right(&mut counts, &right);

        let left = flows_left(&counts, &targets);
        sweep_left(&mut particles, &left, comm);
        apply_flows_left(&mut counts, &left);

        iteration += 1;
    }

    if particles.len() != targets[rank] as usize {
        fatal(comm, "rank count does not match target after balancing");
    }

    check_unique_keys(&particles, comm);

    if rank == 0 {
        tracing::info!(repartition = ?counts, "distributed sort complete");
    }

    particles
}

/// Ship tail surpluses to the right neighbour. Sends go out before
/// receives are posted; the last rank never sends, so the chain always
/// unwinds.
fn sweep_right<const D: usize, C: CommunicatorCollectives>(
    particles: &mut Vec<Particle<D>>,
    flows: &[i64],
    comm: &C,
) {
    let rank = comm.rank() as usize;

    let outgoing = flows[rank] as usize;
    if outgoing > 0 {
        let tail = particles.split_off(particles.len() - outgoing);
        comm.process_at_rank(rank as i32 + 1).send(&tail[..]);
    }

    if rank > 0 && flows[rank - 1] > 0 {
        let (mut incoming, _status) = comm
            .process_at_rank(rank as i32 - 1)
            .receive_vec::<Particle<D>>();
        if incoming.len() != flows[rank - 1] as usize {
            fatal(comm, "residual sweep received unexpected particle count");
        }
        // The neighbour's tail keys all precede ours.
        incoming.append(particles);
        *particles = incoming;
    }
}

/// Ship head deficits to the left neighbour. Mirror image of
/// [`sweep_right`].
fn sweep_left<const D: usize, C: CommunicatorCollectives>(
    particles: &mut Vec<Particle<D>>,
    flows: &[i64],
    comm: &C,
) {
    let rank = comm.rank() as usize;
    let size = comm.size() as usize;

    let outgoing = flows[rank] as usize;
    if outgoing > 0 {
        let mut tail = particles.split_off(outgoing);
        std::mem::swap(particles, &mut tail);
        comm.process_at_rank(rank as i32 - 1).send(&tail[..]);
    }

    if rank + 1 < size && flows[rank + 1] > 0 {
        let (mut incoming, _status) = comm
            .process_at_rank(rank as i32 + 1)
            .receive_vec::<Particle<D>>();
        if incoming.len() != flows[rank + 1] as usize {
            fatal(comm, "residual sweep received unexpected particle count");
        }
        particles.append(&mut incoming);
    }
}

/// Duplicate (key, id) pairs among local particles break the total order
/// every worker agreed on; that is fatal.
fn check_unique_keys<const D: usize, C: CommunicatorCollectives>(
    particles: &[Particle<D>],
    comm: &C,
) {
    for (a, b) in particles.iter().tuple_windows() {
        if sort_key(a) == sort_key(b) {
            tracing::error!(id = a.id, "duplicate sort key after redistribution");
            fatal(comm, "duplicate (key, id) pair among local particles");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::prelude::*;
    use rand::rngs::StdRng;

    #[test]
    fn test_even_targets() {
        assert_eq!(even_targets(10, 4), vec![3, 3, 2, 2]);
        assert_eq!(even_targets(8, 4), vec![2, 2, 2, 2]);
        assert_eq!(even_targets(3, 4), vec![1, 1, 1, 0]);
        assert_eq!(even_targets(0, 2), vec![0, 0]);
    }

    fn converges_within(mut counts: Vec<i64>, targets: Vec<i64>) -> usize {
        let size = counts.len();
        let mut iterations = 0;
        while counts != targets {
            assert!(iterations < size, "no convergence for {:?}", counts);
            let right = flows_right(&counts, &targets);
            apply_flows_right(&mut counts, &right);
            let left = flows_left(&counts, &targets);
            apply_flows_left(&mut counts, &left);
            iterations += 1;
        }
        iterations
    }

    #[test]
    fn test_residual_flows_simple_surplus() {
        assert!(converges_within(vec![10, 0, 0, 2], vec![3, 3, 3, 3]) <= 4);
    }

    #[test]
    fn test_residual_flows_surplus_on_last_rank() {
        assert!(converges_within(vec![0, 0, 0, 12], vec![3, 3, 3, 3]) <= 4);
    }

    #[test]
    fn test_residual_flows_full_pipeline_shift() {
        assert!(converges_within(vec![12, 0, 0, 0], vec![0, 0, 0, 12]) <= 4);
    }

    #[test]
    fn test_residual_flows_already_balanced() {
        assert_eq!(converges_within(vec![2, 2, 2], vec![2, 2, 2]), 0);
    }

    #[test]
    fn test_residual_flows_random_stress() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let size = rng.gen_range(1..9);
            let total: i64 = rng.gen_range(0..100);

            // Random composition of `total` into counts and targets.
            let compose = |rng: &mut StdRng| {
                let mut parts = vec![0_i64; size];
                for _ in 0..total {
                    parts[rng.gen_range(0..size)] += 1;
                }
                parts
            };
            let counts = compose(&mut rng);
            let targets = compose(&mut rng);

            converges_within(counts, targets);
        }
    }

    #[test]
    fn test_flows_are_bounded_by_holdings() {
        let counts = vec![1, 0, 7];
        let targets = vec![3, 3, 2];
        let right = flows_right(&counts, &targets);
        assert!(right.iter().zip(&counts).all(|(f, c)| f <= c && *f >= 0));
        let left = flows_left(&counts, &targets);
        assert!(left.iter().zip(&counts).all(|(f, c)| f <= c && *f >= 0));
        // Rank 2's surplus moves left, bounded by nothing else.
        assert_eq!(left, vec![0, 0, 5]);
    }
}
