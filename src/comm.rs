/*!
Communicator model for parallel sampling.

The sampler is single-threaded per rank; ranks coordinate only through the
collective operations here, mirroring an MPI-style world: a full
communicator partitioned into sub-environments, where each sub-environment
runs one chain replica. Two realizations are provided:

- [`SelfComm`]: the degenerate single-rank communicator. All collectives
  are no-ops; this is what the common single-process case uses.
- [`ThreadComm`]: an in-process rank group. [`ThreadComm::group`] creates
  `n` connected endpoints; move each into its own thread and the collective
  calls block exactly like their message-passing counterparts.

Collective calls are the only blocking points in the crate, and every rank
of a group must reach each collective in the same order.
*/

use std::sync::{Arc, Barrier, Mutex};

use nalgebra::DVector;

/// Collective operations over one group of ranks.
pub trait Communicator {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Blocks until every rank of the group has entered.
    fn barrier(&self);

    /// Broadcasts rank 0's value to every rank. Non-root callers pass
    /// `None`-able anything; everyone returns the root's value. A `None`
    /// from the root is the release sentinel of the target-evaluation
    /// protocol.
    fn broadcast_candidate(&self, value: Option<&DVector<f64>>) -> Option<DVector<f64>>;

    /// Element-wise sum across ranks; every rank receives the totals.
    fn sum_reduce_u64(&self, values: &[u64]) -> Vec<u64>;

    /// Element-wise sum across ranks; every rank receives the totals.
    fn sum_reduce_f64(&self, values: &[f64]) -> Vec<f64>;

    /// Gathers each rank's rows at rank 0, ordered by rank. Non-root ranks
    /// receive `None`.
    fn gather_rows(&self, rows: &[DVector<f64>]) -> Option<Vec<Vec<DVector<f64>>>>;

    /// Gathers each rank's values at rank 0, ordered by rank.
    fn gather_f64(&self, values: &[f64]) -> Option<Vec<Vec<f64>>>;
}

/// Single-rank communicator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn broadcast_candidate(&self, value: Option<&DVector<f64>>) -> Option<DVector<f64>> {
        value.cloned()
    }

    fn sum_reduce_u64(&self, values: &[u64]) -> Vec<u64> {
        values.to_vec()
    }

    fn sum_reduce_f64(&self, values: &[f64]) -> Vec<f64> {
        values.to_vec()
    }

    fn gather_rows(&self, rows: &[DVector<f64>]) -> Option<Vec<Vec<DVector<f64>>>> {
        Some(vec![rows.to_vec()])
    }

    fn gather_f64(&self, values: &[f64]) -> Option<Vec<Vec<f64>>> {
        Some(vec![values.to_vec()])
    }
}

struct ThreadCommShared {
    size: usize,
    barrier: Barrier,
    candidate: Mutex<Option<DVector<f64>>>,
    u64_slots: Mutex<Vec<Vec<u64>>>,
    f64_slots: Mutex<Vec<Vec<f64>>>,
    row_slots: Mutex<Vec<Vec<DVector<f64>>>>,
}

/// One endpoint of an in-process rank group.
///
/// Every collective uses a write phase and a read phase separated by
/// barriers, so a group member may immediately reuse the communicator for
/// the next collective once a call returns.
pub struct ThreadComm {
    rank: usize,
    shared: Arc<ThreadCommShared>,
}

impl ThreadComm {
    /// Creates a connected group of `size` endpoints; endpoint `i` is
    /// rank `i`. Move each endpoint into its own thread.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "communicator group must have at least one rank");
        let shared = Arc::new(ThreadCommShared {
            size,
            barrier: Barrier::new(size),
            candidate: Mutex::new(None),
            u64_slots: Mutex::new(vec![Vec::new(); size]),
            f64_slots: Mutex::new(vec![Vec::new(); size]),
            row_slots: Mutex::new(vec![Vec::new(); size]),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn broadcast_candidate(&self, value: Option<&DVector<f64>>) -> Option<DVector<f64>> {
        if self.rank == 0 {
            *self.shared.candidate.lock().unwrap() = value.cloned();
        }
        self.shared.barrier.wait();
        let received = self.shared.candidate.lock().unwrap().clone();
        self.shared.barrier.wait();
        received
    }

    fn sum_reduce_u64(&self, values: &[u64]) -> Vec<u64> {
        self.shared.u64_slots.lock().unwrap()[self.rank] = values.to_vec();
        self.shared.barrier.wait();
        let totals = {
            let slots = self.shared.u64_slots.lock().unwrap();
            let mut totals = vec![0u64; values.len()];
            for contribution in slots.iter() {
                for (total, value) in totals.iter_mut().zip(contribution.iter()) {
                    *total += value;
                }
            }
            totals
        };
        self.shared.barrier.wait();
        totals
    }

    fn sum_reduce_f64(&self, values: &[f64]) -> Vec<f64> {
        self.shared.f64_slots.lock().unwrap()[self.rank] = values.to_vec();
        self.shared.barrier.wait();
        let totals = {
            let slots = self.shared.f64_slots.lock().unwrap();
            let mut totals = vec![0f64; values.len()];
            for contribution in slots.iter() {
                for (total, value) in totals.iter_mut().zip(contribution.iter()) {
                    *total += value;
                }
            }
            totals
        };
        self.shared.barrier.wait();
        totals
    }

    fn gather_rows(&self, rows: &[DVector<f64>]) -> Option<Vec<Vec<DVector<f64>>>> {
        self.shared.row_slots.lock().unwrap()[self.rank] = rows.to_vec();
        self.shared.barrier.wait();
        let gathered = if self.rank == 0 {
            Some(self.shared.row_slots.lock().unwrap().clone())
        } else {
            None
        };
        self.shared.barrier.wait();
        gathered
    }

    fn gather_f64(&self, values: &[f64]) -> Option<Vec<Vec<f64>>> {
        self.shared.f64_slots.lock().unwrap()[self.rank] = values.to_vec();
        self.shared.barrier.wait();
        let gathered = if self.rank == 0 {
            Some(self.shared.f64_slots.lock().unwrap().clone())
        } else {
            None
        };
        self.shared.barrier.wait();
        gathered
    }
}

/// One rank's view of the parallel world: its sub-environment communicator
/// plus, on sub-rank 0, the communicator connecting the rank-0s of all
/// sub-environments (used by unified I/O and cross-replica reductions).
pub struct Environment<C: Communicator> {
    sub_id: usize,
    num_sub_environments: usize,
    full_size: usize,
    sub_comm: C,
    inter0_comm: Option<C>,
}

impl Environment<SelfComm> {
    /// The ordinary single-process world: one sub-environment, one rank.
    pub fn single() -> Self {
        Environment {
            sub_id: 0,
            num_sub_environments: 1,
            full_size: 1,
            sub_comm: SelfComm,
            inter0_comm: Some(SelfComm),
        }
    }

    /// One replica of a `num_sub_environments`-replica run where each
    /// replica is a single rank with no cross-replica channel (each writes
    /// its own `_sub<K>` files).
    pub fn replica(sub_id: usize, num_sub_environments: usize) -> Self {
        Environment {
            sub_id,
            num_sub_environments,
            full_size: num_sub_environments,
            sub_comm: SelfComm,
            inter0_comm: None,
        }
    }
}

impl<C: Communicator> Environment<C> {
    pub fn new(
        sub_id: usize,
        num_sub_environments: usize,
        full_size: usize,
        sub_comm: C,
        inter0_comm: Option<C>,
    ) -> Self {
        Environment {
            sub_id,
            num_sub_environments,
            full_size,
            sub_comm,
            inter0_comm,
        }
    }

    pub fn sub_id(&self) -> usize {
        self.sub_id
    }

    pub fn sub_rank(&self) -> usize {
        self.sub_comm.rank()
    }

    pub fn num_sub_environments(&self) -> usize {
        self.num_sub_environments
    }

    pub fn full_size(&self) -> usize {
        self.full_size
    }

    pub fn sub_comm(&self) -> &C {
        &self.sub_comm
    }

    pub fn inter0_comm(&self) -> Option<&C> {
        self.inter0_comm.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn self_comm_is_identity() {
        let comm = SelfComm;
        assert_eq!(comm.sum_reduce_u64(&[3, 4]), vec![3, 4]);
        let gathered = comm.gather_f64(&[1.0, 2.0]).unwrap();
        assert_eq!(gathered, vec![vec![1.0, 2.0]]);
    }

    #[test]
    fn thread_comm_sum_reduce() {
        let comms = ThreadComm::group(3);
        let totals: Vec<Vec<u64>> = std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    scope.spawn(move || {
                        let mine = [comm.rank() as u64, 10];
                        comm.sum_reduce_u64(&mine)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for totals in totals {
            assert_eq!(totals, vec![0 + 1 + 2, 30]);
        }
    }

    #[test]
    fn thread_comm_broadcast_and_sentinel() {
        let comms = ThreadComm::group(2);
        let results: Vec<Vec<Option<DVector<f64>>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    scope.spawn(move || {
                        let payload = dvector![1.0, 2.0];
                        let first = if comm.rank() == 0 {
                            comm.broadcast_candidate(Some(&payload))
                        } else {
                            comm.broadcast_candidate(None)
                        };
                        let second = comm.broadcast_candidate(None);
                        vec![first, second]
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for rounds in results {
            assert_eq!(rounds[0].as_ref().unwrap(), &dvector![1.0, 2.0]);
            assert!(rounds[1].is_none());
        }
    }

    #[test]
    fn thread_comm_gather_orders_by_rank() {
        let comms = ThreadComm::group(3);
        let gathered: Vec<Option<Vec<Vec<f64>>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| scope.spawn(move || comm.gather_f64(&[comm.rank() as f64])))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let root = gathered[0].as_ref().unwrap();
        assert_eq!(root, &vec![vec![0.0], vec![1.0], vec![2.0]]);
        assert!(gathered[1].is_none() && gathered[2].is_none());
    }
}
