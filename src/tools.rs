//! Utility routines.

use itertools::Itertools;
use mpi::{
    collective::SystemOperation,
    datatype::{Partition, PartitionMut},
    traits::{Communicator, CommunicatorCollectives, Equivalence, Root},
};
use rand::Rng;

use crate::particle::Particle;

/// Gather array to all processes.
pub fn gather_to_all<T: Equivalence, C: CommunicatorCollectives>(arr: &[T], comm: &C) -> Vec<T> {
    // First we need to broadcast the individual sizes on each process.

    let size = comm.size();

    let local_len = arr.len() as i32;

    let mut sizes = vec![0_i32; size as usize];

    comm.all_gather_into(&local_len, &mut sizes);

    let recv_len = sizes.iter().sum::<i32>() as usize;

    // Now we have the size of each local contribution.
    let mut recvbuffer = Vec::<T>::with_capacity(recv_len);
    let buf: &mut [T] = unsafe { std::mem::transmute(recvbuffer.spare_capacity_mut()) };

    let recv_displs = displacements(&sizes);

    let mut receiv_partition = PartitionMut::new(buf, sizes, &recv_displs[..]);

    comm.all_gather_varcount_into(arr, &mut receiv_partition);

    unsafe { recvbuffer.set_len(recv_len) };

    recvbuffer
}

/// Gather a distributed array to the root rank.
///
/// The result is a `Vec<T>` on root and `None` on all other ranks.
pub fn gather_to_root<T: Equivalence, C: CommunicatorCollectives>(
    arr: &[T],
    comm: &C,
) -> Option<Vec<T>> {
    let n = arr.len() as i32;
    let rank = comm.rank();
    let size = comm.size();
    let root_process = comm.process_at_rank(0);

    // We first communicate the length of the array to root.

    if rank == 0 {
        // We are at root.

        let mut counts = vec![0_i32; size as usize];
        root_process.gather_into_root(&n, &mut counts);

        // We now have all counts at root and can do a varcount gather to
        // get the array elements.

        let nelements = counts.iter().sum::<i32>();
        let mut new_arr = Vec::<T>::with_capacity(nelements as usize);
        let new_arr_buf: &mut [T] = unsafe { std::mem::transmute(new_arr.spare_capacity_mut()) };

        let displs = displacements(counts.as_slice());

        let mut partition = PartitionMut::new(new_arr_buf, counts, &displs[..]);

        root_process.gather_varcount_into_root(arr, &mut partition);

        unsafe { new_arr.set_len(nelements as usize) };
        Some(new_arr)
    } else {
        root_process.gather_into(&n);
        root_process.gather_varcount_into(arr);
        None
    }
}

/// Redistribute an array via an all-to-all-v, sending `counts[r]`
/// consecutive elements to rank `r`.
pub fn redistribute<T: Equivalence + Default + Clone, C: CommunicatorCollectives>(
    arr: &[T],
    counts: &[i32],
    comm: &C,
) -> Vec<T> {
    let size = comm.size() as usize;
    debug_assert_eq!(counts.len(), size);
    debug_assert_eq!(counts.iter().sum::<i32>() as usize, arr.len());

    // First we need to communicate how many elements everybody gets from
    // each process.

    let mut counts_from_processor = vec![0_i32; size];
    comm.all_to_all_into(counts, &mut counts_from_processor);

    // We can now send around the actual elements with an alltoallv.

    let send_displs = displacements(counts);

    let send_partition = Partition::new(arr, counts, &send_displs[..]);

    let mut recvbuffer =
        vec![T::default(); counts_from_processor.iter().sum::<i32>() as usize];

    let recv_displs = displacements(&counts_from_processor);

    let mut receiv_partition =
        PartitionMut::new(&mut recvbuffer[..], counts_from_processor, &recv_displs[..]);
    comm.all_to_all_varcount_into(&send_partition, &mut receiv_partition);

    recvbuffer
}

/// Count how many consecutive elements of a sorted array fall into each
/// bin. `bins[i]` is the inclusive lower bound of bin `i`; elements below
/// `bins[1]` count into bin 0.
pub fn sort_to_bins<T: Ord>(sorted_items: &[T], bins: &[T]) -> Vec<usize> {
    let mut counts = vec![0_usize; bins.len()];
    let mut bin = 0;

    for item in sorted_items {
        while bin + 1 < bins.len() && *item >= bins[bin + 1] {
            bin += 1;
        }
        counts[bin] += 1;
    }

    counts
}

/// Get the global size of a distributed array.
pub fn global_size<T, C: CommunicatorCollectives>(arr: &[T], comm: &C) -> usize {
    let local_size = arr.len();
    let mut global_size = 0;

    comm.all_reduce_into(&local_size, &mut global_size, SystemOperation::sum());

    global_size
}

/// Reduce the global maximum of a local value to all ranks.
pub fn global_max_f64<C: CommunicatorCollectives>(local: f64, comm: &C) -> f64 {
    let mut global = 0.0;
    comm.all_reduce_into(&local, &mut global, SystemOperation::max());
    global
}

/// Reduce the global sum of a local value to all ranks.
pub fn global_sum_f64<C: CommunicatorCollectives>(local: f64, comm: &C) -> f64 {
    let mut global = 0.0;
    comm.all_reduce_into(&local, &mut global, SystemOperation::sum());
    global
}

/// Check if a distributed array is globally sorted.
///
/// The result is `Some` on root and `None` on all other ranks.
pub fn is_sorted_across_ranks<T: Ord + Equivalence, C: CommunicatorCollectives>(
    arr: &[T],
    comm: &C,
) -> Option<bool> {
    let arr = gather_to_root(arr, comm);
    if comm.rank() == 0 {
        let arr = arr.unwrap();
        for (elem1, elem2) in arr.iter().tuple_windows() {
            if elem1 > elem2 {
                return Some(false);
            }
        }
        Some(true)
    } else {
        None
    }
}

/// Compute displacements from a vector of counts.
///
/// This is useful for global MPI varcount operations. Let count be
/// [3, 4, 5]. Then the corresponding displacements are [0, 3, 7]. Note
/// that the last element `5` is ignored.
pub fn displacements(counts: &[i32]) -> Vec<i32> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

/// Generate `npoints` uniformly distributed particles in the unit cube on
/// each rank, with globally unique ids and unit total mass.
pub fn generate_random_particles<const D: usize, R: Rng + ?Sized, C: Communicator>(
    npoints: usize,
    smoothing_length: f64,
    rng: &mut R,
    comm: &C,
) -> Vec<Particle<D>> {
    let rank = comm.rank();
    let size = comm.size();
    let mass = 1.0 / (npoints * size as usize) as f64;

    (0..npoints)
        .map(|index| {
            let mut position = [0.0; D];
            for p in position.iter_mut() {
                *p = rng.gen();
            }
            let mut particle = Particle::new(
                (npoints * rank as usize + index) as u64,
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
        .collect()
}

/// Log a fatal condition and terminate the whole job.
///
/// Invariant violations leave the workers without an agreed particle set,
/// so there is no in-band error return: the job is taken down.
pub fn fatal<C: Communicator>(comm: &C, message: &str) -> ! {
    tracing::error!(rank = comm.rank(), "{}", message);
    comm.abort(1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_displacements() {
        assert_eq!(displacements(&[3, 4, 5]), vec![0, 3, 7]);
        assert_eq!(displacements(&[]), Vec::<i32>::new());
        assert_eq!(displacements(&[0, 2, 0, 1]), vec![0, 0, 2, 2]);
    }

    #[test]
    fn test_sort_to_bins() {
        let items = [1, 2, 5, 5, 6, 9, 12];
        let bins = [0, 5, 10];
        assert_eq!(sort_to_bins(&items, &bins), vec![2, 4, 1]);
    }

    #[test]
    fn test_sort_to_bins_elements_below_first_bin() {
        let items = [-3, 1, 7];
        let bins = [0, 5];
        assert_eq!(sort_to_bins(&items, &bins), vec![2, 1]);
    }

    #[test]
    fn test_sort_to_bins_empty_bins_get_zero() {
        let items = [10, 11];
        let bins = [0, 2, 4, 6];
        assert_eq!(sort_to_bins(&items, &bins), vec![0, 0, 0, 2]);
    }
}
