//! Communication backend abstraction for distributed execution.
//!
//! Provides a trait for inter-rank coordination (setup collectives and
//! halo transfers) plus a no-op single-process implementation. The MPI
//! implementation lives in [`mpi`] behind the `distributed` feature; an
//! in-process mailbox implementation in [`local`] lets multi-rank
//! behavior run inside one test process.

pub mod local;
#[cfg(feature = "distributed")]
pub mod mpi;

/// One halo transfer with a single peer: the packed data to send and the
/// staging buffer to receive into. Tags distinguish concurrent transfers
/// between the same pair of ranks.
pub struct HaloXfer<'a> {
    pub peer: usize,
    pub tag: i32,
    pub send: &'a [f64],
    pub recv: &'a mut [f64],
}

/// Abstraction over inter-rank communication.
///
/// Implementations: [`SingleProcessComm`] (no-op), [`local::LocalComm`]
/// (threads in one process), `mpi::MpiComm` (via the mpi crate).
pub trait CommBackend: Send + Sync {
    /// This process's rank index.
    fn rank(&self) -> usize;

    /// Total number of ranks.
    fn num_ranks(&self) -> usize;

    /// Synchronization barrier across all ranks.
    fn barrier(&self);

    /// Gather `send` from every rank, concatenated in rank order. All
    /// ranks must pass slices of the same length.
    fn all_gather_i64(&self, send: &[i64]) -> Vec<i64>;

    /// Run one round of halo transfers.
    ///
    /// `interior` runs while the transfers are in flight (it is the hook
    /// for overlapping interior computation with communication) and all
    /// transfers are complete when this returns. Callers pack before and
    /// unpack after. The order in which a backend issues the individual
    /// operations is its own business: the MPI backend posts receives
    /// before sends to avoid unexpected-message buffering, while the
    /// mailbox backends send eagerly because their queues never block a
    /// sender. A backend must only guarantee that no send waits on a
    /// peer's receive being posted first.
    fn exchange(&self, xfers: &mut [HaloXfer<'_>], interior: &mut dyn FnMut());

    /// Poll outstanding communication to drive progress without
    /// blocking. No-op for backends that need no nudging.
    fn test_progress(&self) {}
}

/// No-op communication backend for single-rank execution.
///
/// There are no neighbors, so an exchange only runs its interior hook.
pub struct SingleProcessComm;

impl CommBackend for SingleProcessComm {
    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn all_gather_i64(&self, send: &[i64]) -> Vec<i64> {
        send.to_vec()
    }

    fn exchange(&self, xfers: &mut [HaloXfer<'_>], interior: &mut dyn FnMut()) {
        debug_assert!(xfers.is_empty(), "halo transfers on a single rank");
        interior();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_process_is_degenerate() {
        let c = SingleProcessComm;
        assert_eq!(c.rank(), 0);
        assert_eq!(c.num_ranks(), 1);
        assert_eq!(c.all_gather_i64(&[3, 4]), vec![3, 4]);
        let mut ran = false;
        c.exchange(&mut [], &mut || ran = true);
        assert!(ran);
    }
}
