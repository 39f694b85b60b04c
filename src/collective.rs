//! Collective primitives for a fixed team of worker threads.
//!
//! Workers never share mutable state directly; they coordinate through the
//! operations here, which mirror the classic reduction set: barrier,
//! all-reduce, exclusive prefix-sum, all-gather, and broadcast. Every
//! operation is collective: all `ranks` workers must call it, in the same
//! order, or the team deadlocks.
//!
//! Each operation runs in two phases separated by the shared barrier: a
//! write phase where every rank deposits its contribution into its slot, and
//! a read phase where every rank combines the slots. A trailing barrier
//! keeps the next operation from overwriting slots that a slow rank is still
//! reading.

use std::any::Any;
use std::sync::{Barrier, Mutex};

pub struct Collective {
    ranks: usize,
    barrier: Barrier,
    u64_slots: Mutex<Vec<u64>>,
    bool_slots: Mutex<Vec<bool>>,
    vec_slots: Mutex<Vec<Vec<u64>>>,
    bcast_slot: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Collective {
    pub fn new(ranks: usize) -> Self {
        Self {
            ranks,
            barrier: Barrier::new(ranks),
            u64_slots: Mutex::new(vec![0; ranks]),
            bool_slots: Mutex::new(vec![false; ranks]),
            vec_slots: Mutex::new(vec![Vec::new(); ranks]),
            bcast_slot: Mutex::new(None),
        }
    }

    pub fn ranks(&self) -> usize {
        self.ranks
    }

    /// Block until every rank has arrived.
    pub fn barrier(&self) {
        self.barrier.wait();
    }

    /// Sum of every rank's value, returned to all ranks.
    pub fn allreduce_sum(&self, rank: usize, value: u64) -> u64 {
        self.u64_slots.lock().unwrap()[rank] = value;
        self.barrier.wait();
        let total = self.u64_slots.lock().unwrap().iter().sum();
        self.barrier.wait();
        total
    }

    /// Exclusive prefix sum: the sum of values contributed by ranks below
    /// this one.
    pub fn exscan_sum(&self, rank: usize, value: u64) -> u64 {
        self.u64_slots.lock().unwrap()[rank] = value;
        self.barrier.wait();
        let prefix = self.u64_slots.lock().unwrap()[..rank].iter().sum();
        self.barrier.wait();
        prefix
    }

    /// Logical-and reduction: true iff every rank contributed true.
    pub fn alltrue(&self, rank: usize, value: bool) -> bool {
        self.bool_slots.lock().unwrap()[rank] = value;
        self.barrier.wait();
        let all = self.bool_slots.lock().unwrap().iter().all(|&b| b);
        self.barrier.wait();
        all
    }

    /// Concatenate every rank's slice in rank order and return the full
    /// array to all ranks.
    pub fn allgatherv(&self, rank: usize, local: &[u64]) -> Vec<u64> {
        self.vec_slots.lock().unwrap()[rank] = local.to_vec();
        self.barrier.wait();
        let gathered = {
            let slots = self.vec_slots.lock().unwrap();
            slots.iter().flatten().copied().collect()
        };
        self.barrier.wait();
        gathered
    }

    /// Distribute `root`'s value to every rank. The value passed by other
    /// ranks is ignored (callers conventionally pass a default).
    pub fn broadcast<T: Clone + Send + 'static>(&self, rank: usize, root: usize, value: T) -> T {
        if rank == root {
            *self.bcast_slot.lock().unwrap() = Some(Box::new(value));
        }
        self.barrier.wait();
        let out = {
            let slot = self.bcast_slot.lock().unwrap();
            slot.as_ref()
                .and_then(|b| b.downcast_ref::<T>())
                .cloned()
                .expect("broadcast slot type mismatch")
        };
        self.barrier.wait();
        out
    }
}

/// Spawn `ranks` workers and run `body(rank, collective)` on each, returning
/// the per-rank results in rank order.
pub fn run_team<T, F>(ranks: usize, body: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize, &Collective) -> T + Sync,
{
    let coll = Collective::new(ranks);
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..ranks)
            .map(|rank| {
                let coll = &coll;
                let body = &body;
                s.spawn(move || body(rank, coll))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reductions_across_four_ranks() {
        let sums = run_team(4, |rank, coll| {
            let total = coll.allreduce_sum(rank, (rank as u64 + 1) * 10);
            let prefix = coll.exscan_sum(rank, (rank as u64 + 1) * 10);
            (total, prefix)
        });
        for (rank, (total, prefix)) in sums.iter().enumerate() {
            assert_eq!(*total, 100);
            let expect: u64 = (0..rank as u64).map(|r| (r + 1) * 10).sum();
            assert_eq!(*prefix, expect);
        }
    }

    #[test]
    fn allgatherv_preserves_rank_order() {
        let out = run_team(3, |rank, coll| {
            let local: Vec<u64> = (0..rank as u64 + 1).map(|i| rank as u64 * 100 + i).collect();
            coll.allgatherv(rank, &local)
        });
        for gathered in out {
            assert_eq!(gathered, vec![0, 100, 101, 200, 201, 202]);
        }
    }

    #[test]
    fn broadcast_from_nonzero_root() {
        let out = run_team(3, |rank, coll| {
            let value = if rank == 2 { vec![7u64, 8, 9] } else { Vec::new() };
            coll.broadcast(rank, 2, value)
        });
        for v in out {
            assert_eq!(v, vec![7, 8, 9]);
        }
    }

    #[test]
    fn alltrue_detects_any_failure() {
        let out = run_team(4, |rank, coll| coll.alltrue(rank, rank != 2));
        assert!(out.iter().all(|&b| !b));
        let out = run_team(4, |rank, coll| coll.alltrue(rank, true));
        assert!(out.iter().all(|&b| b));
    }
}
