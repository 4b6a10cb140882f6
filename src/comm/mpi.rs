//! MPI communication backend.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//! Implements [`CommBackend`] over `MPI_COMM_WORLD` using non-blocking
//! point-to-point transfers: receives and sends are posted as immediate
//! operations inside a request scope, the interior hook runs while they
//! are in flight, and everything is waited before `exchange` returns.
//!
//! The caller must initialize MPI before constructing `MpiComm`:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let comm = MpiComm::new();
//! ```

use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use super::{CommBackend, HaloXfer};

/// MPI-based communication backend.
///
/// Wraps the world communicator; `mpi::initialize()` must have been
/// called (with at least `MPI_THREAD_SERIALIZED` when threads are in
/// play) before construction.
pub struct MpiComm;

impl MpiComm {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MpiComm {
    fn default() -> Self {
        Self::new()
    }
}

impl CommBackend for MpiComm {
    fn rank(&self) -> usize {
        SimpleCommunicator::world().rank() as usize
    }

    fn num_ranks(&self) -> usize {
        SimpleCommunicator::world().size() as usize
    }

    fn barrier(&self) {
        SimpleCommunicator::world().barrier();
    }

    fn all_gather_i64(&self, send: &[i64]) -> Vec<i64> {
        let world = SimpleCommunicator::world();
        let mut recv = vec![0i64; send.len() * world.size() as usize];
        world.all_gather_into(send, &mut recv[..]);
        recv
    }

    fn exchange(&self, xfers: &mut [HaloXfer<'_>], interior: &mut dyn FnMut()) {
        let world = SimpleCommunicator::world();

        // Split each transfer into its send and receive halves so the
        // receive buffers can be mutably borrowed by the requests while
        // the send buffers stay readable.
        let mut sends = Vec::with_capacity(xfers.len());
        let mut recvs = Vec::with_capacity(xfers.len());
        for x in xfers.iter_mut() {
            let HaloXfer { peer, tag, send, recv } = x;
            sends.push((*peer, *tag, &**send));
            recvs.push((*peer, *tag, &mut **recv));
        }

        mpi::request::scope(|scope| {
            // Post receives before sends.
            let mut rreqs = Vec::with_capacity(recvs.len());
            for (peer, tag, buf) in recvs {
                let proc = world.process_at_rank(peer as i32);
                rreqs.push(proc.immediate_receive_into_with_tag(scope, buf, tag));
            }
            let mut sreqs = Vec::with_capacity(sends.len());
            for (peer, tag, buf) in sends {
                let proc = world.process_at_rank(peer as i32);
                sreqs.push(proc.immediate_send_with_tag(scope, buf, tag));
            }

            interior();

            for r in rreqs {
                r.wait();
            }
            for s in sreqs {
                s.wait();
            }
        });
    }

    fn test_progress(&self) {
        // A non-blocking probe is enough to nudge the MPI progress
        // engine during long interior computations.
        let world = SimpleCommunicator::world();
        let _ = world.any_process().immediate_probe();
    }
}
