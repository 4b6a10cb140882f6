//! Multi-process distributed tests.
//!
//! These tests require MPI and the `distributed` feature flag.
//! Run with: mpirun -n 2 cargo test --features distributed --test distributed_test
//!
//! Without MPI installed, these tests are excluded from the default build.

#![cfg(feature = "distributed")]

use std::sync::Arc;

use halocline::comm::mpi::MpiComm;
use halocline::comm::CommBackend;
use halocline::samples;
use halocline::Solution;

#[test]
fn distributed_diffusion_two_ranks() {
    let (_universe, threading) =
        mpi::initialize_with_threading(mpi::Threading::Serialized).expect("MPI init failed");
    assert!(threading >= mpi::Threading::Serialized);
    let comm = Arc::new(MpiComm::new());
    let nranks = comm.num_ranks() as i64;

    let mut soln = Solution::new(samples::diffusion_1d(), comm.clone()).unwrap();
    soln.settings.rank_sizes = vec![32];
    soln.settings.nranks = vec![nranks];
    soln.prepare_solution().unwrap();

    let neigh = soln.neighborhood().unwrap();
    assert_eq!(neigh.overall_domain[0], 32 * nranks);
    let off = neigh.rank_domain_offset[0];
    for i in off..off + 32 {
        assert!(soln.set_element("u", &[i], 0, i as f64).unwrap());
    }

    soln.run_solution(0, 9).unwrap();

    // The interior of a linear ramp is invariant under the smoother, so
    // any cell far enough from the global edges still holds its index.
    let global_n = 32 * nranks;
    for i in off..off + 32 {
        if i >= 10 && i < global_n - 10 {
            let v = soln.get_element("u", &[i], 10).unwrap().unwrap();
            assert_eq!(v, i as f64, "interior ramp disturbed at {i}");
        }
    }

    // Halo exchange completed everywhere.
    let u = soln.var("u").unwrap();
    assert!(!u.is_dirty(10 % u.alloc_step));
}
