//! The two nested thread levels of the loop hierarchy.
//!
//! The outer pool parallelizes blocks within a region; the inner pool
//! parallelizes sub-blocks within a mini-block. Pools are built once at
//! preparation from the resolved thread split and keep their sizes for
//! the life of the solution.

use rayon::ThreadPool;

use crate::error::{HaloclineError, Result};

pub struct TeamPools {
    pub outer: ThreadPool,
    pub inner: ThreadPool,
    pub outer_threads: usize,
    pub inner_threads: usize,
}

pub fn build(outer_threads: usize, inner_threads: usize) -> Result<TeamPools> {
    let mk = |n: usize| {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| HaloclineError::Unsupported(format!("failed to build thread pool: {e}")))
    };
    Ok(TeamPools {
        outer: mk(outer_threads)?,
        inner: mk(inner_threads)?,
        outer_threads,
        inner_threads,
    })
}
