//! In-process communication backend: ranks are threads of one process.
//!
//! Messages travel through mailboxes keyed by `(src, dst, tag)`, each a
//! Mutex-protected queue with a condvar for blocking receives. A
//! [`LocalUniverse`] owns the shared state; each rank holds a
//! [`LocalComm`] handle. This backend exists so multi-rank execution is
//! testable without an MPI installation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Condvar, Mutex};

use super::{CommBackend, HaloXfer};

type Key = (usize, usize, i32); // (src, dst, tag)
type Slot = Arc<(Mutex<VecDeque<Vec<f64>>>, Condvar)>;

struct Shared {
    size: usize,
    mailboxes: Mutex<HashMap<Key, Slot>>,
    barrier: Barrier,
    gather: Mutex<Vec<Option<Vec<i64>>>>,
}

/// Shared state for a set of in-process ranks.
pub struct LocalUniverse {
    inner: Arc<Shared>,
}

impl LocalUniverse {
    pub fn new(size: usize) -> Self {
        assert!(size >= 1);
        Self {
            inner: Arc::new(Shared {
                size,
                mailboxes: Mutex::new(HashMap::new()),
                barrier: Barrier::new(size),
                gather: Mutex::new(vec![None; size]),
            }),
        }
    }

    /// The comm handle for one rank. Hand each to its own thread.
    pub fn comm(&self, rank: usize) -> LocalComm {
        assert!(rank < self.inner.size);
        LocalComm { rank, inner: self.inner.clone() }
    }
}

/// One rank's handle into a [`LocalUniverse`].
pub struct LocalComm {
    rank: usize,
    inner: Arc<Shared>,
}

impl LocalComm {
    fn slot(&self, key: Key) -> Slot {
        let mut map = self.inner.mailboxes.lock().expect("mailbox lock poisoned");
        map.entry(key)
            .or_insert_with(|| Arc::new((Mutex::new(VecDeque::new()), Condvar::new())))
            .clone()
    }

    fn post(&self, dst: usize, tag: i32, data: Vec<f64>) {
        let slot = self.slot((self.rank, dst, tag));
        let (lock, cv) = &*slot;
        lock.lock().expect("mailbox slot poisoned").push_back(data);
        cv.notify_one();
    }

    fn take(&self, src: usize, tag: i32) -> Vec<f64> {
        let slot = self.slot((src, self.rank, tag));
        let (lock, cv) = &*slot;
        let mut q = lock.lock().expect("mailbox slot poisoned");
        while q.is_empty() {
            q = cv.wait(q).expect("mailbox condvar poisoned");
        }
        q.pop_front().expect("queue non-empty")
    }
}

impl CommBackend for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.inner.size
    }

    fn barrier(&self) {
        self.inner.barrier.wait();
    }

    fn all_gather_i64(&self, send: &[i64]) -> Vec<i64> {
        {
            let mut table = self.inner.gather.lock().expect("gather lock poisoned");
            table[self.rank] = Some(send.to_vec());
        }
        self.barrier();
        let out = {
            let table = self.inner.gather.lock().expect("gather lock poisoned");
            table
                .iter()
                .flat_map(|e| e.as_ref().expect("gather slot filled").iter().copied())
                .collect()
        };
        // Everyone has read the table before rank 0 clears it for reuse.
        self.barrier();
        if self.rank == 0 {
            let mut table = self.inner.gather.lock().expect("gather lock poisoned");
            table.iter_mut().for_each(|e| *e = None);
        }
        self.barrier();
        out
    }

    fn exchange(&self, xfers: &mut [HaloXfer<'_>], interior: &mut dyn FnMut()) {
        // Sends never block (queues are unbounded), so post them all
        // before any receive; no rank ordering is needed.
        for x in xfers.iter() {
            self.post(x.peer, x.tag, x.send.to_vec());
        }
        interior();
        for x in xfers.iter_mut() {
            let msg = self.take(x.peer, x.tag);
            assert_eq!(
                msg.len(),
                x.recv.len(),
                "halo message length mismatch from rank {} tag {}",
                x.peer,
                x.tag
            );
            x.recv.copy_from_slice(&msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_all_gather() {
        let uni = LocalUniverse::new(3);
        let handles: Vec<_> = (0..3)
            .map(|r| {
                let comm = uni.comm(r);
                thread::spawn(move || comm.all_gather_i64(&[r as i64, 10 * r as i64]))
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![0, 0, 1, 10, 2, 20]);
        }
    }

    #[test]
    fn test_pairwise_exchange() {
        let uni = LocalUniverse::new(2);
        let mk = |r: usize, peer: usize| {
            let comm = uni.comm(r);
            thread::spawn(move || {
                let send = vec![r as f64; 4];
                let mut recv = vec![0.0; 4];
                let mut xfers = [HaloXfer { peer, tag: 7, send: &send, recv: &mut recv }];
                let mut hits = 0;
                comm.exchange(&mut xfers, &mut || hits += 1);
                assert_eq!(hits, 1);
                recv
            })
        };
        let a = mk(0, 1);
        let b = mk(1, 0);
        assert_eq!(a.join().unwrap(), vec![1.0; 4]);
        assert_eq!(b.join().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_gather_reusable() {
        let uni = LocalUniverse::new(2);
        let handles: Vec<_> = (0..2)
            .map(|r| {
                let comm = uni.comm(r);
                thread::spawn(move || {
                    let a = comm.all_gather_i64(&[r as i64]);
                    let b = comm.all_gather_i64(&[r as i64 + 5]);
                    (a, b)
                })
            })
            .collect();
        for h in handles {
            let (a, b) = h.join().unwrap();
            assert_eq!(a, vec![0, 1]);
            assert_eq!(b, vec![5, 6]);
        }
    }
}
