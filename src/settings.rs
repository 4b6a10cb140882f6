//! User-facing sizing and tuning knobs, and their finalization.
//!
//! All sizes are per domain dim. A size of zero means "inherit the
//! enclosing level's size"; finalization resolves the defaults, clamps
//! each level into its parent, and rounds to the granularity required
//! below it (cluster length for spatial tiles, fold length for
//! sub-blocks). Temporal depths (`region_steps`, `block_steps`) are
//! resolved into wavefront/temporal-block geometry separately, once the
//! maximum halos are known.

use tracing::debug;

use crate::error::{HaloclineError, Result};
use crate::indices::{round_up, DimSpec};
use crate::Idx;

#[derive(Debug, Clone)]
pub struct Settings {
    pub rank_sizes: Vec<Idx>,
    pub region_sizes: Vec<Idx>,
    /// Time steps per region (wavefront depth); 0 disables wavefronts.
    pub region_steps: Idx,
    pub block_sizes: Vec<Idx>,
    /// Time steps per block (temporal blocking depth); 0 disables it.
    pub block_steps: Idx,
    pub mini_block_sizes: Vec<Idx>,
    pub sub_block_sizes: Vec<Idx>,
    pub block_group_sizes: Vec<Idx>,
    pub mini_block_group_sizes: Vec<Idx>,
    pub sub_block_group_sizes: Vec<Idx>,
    pub min_pad_sizes: Vec<Idx>,

    pub nranks: Vec<Idx>,
    pub rank_indices: Option<Vec<Idx>>,

    /// Total worker threads; 0 means all available.
    pub max_threads: usize,
    /// Divides the total before splitting into the two levels.
    pub thread_divisor: usize,
    /// Threads of the inner (sub-block) level per block.
    pub block_threads: usize,

    /// Compute rank-exterior blocks first and overlap interior compute
    /// with communication.
    pub overlap_comms: bool,
    /// Allow whole-vector halo copies when both sides are fold-aligned.
    pub allow_vec_exchange: bool,
    /// Evaluate per-bundle step conditions; `None` enables the checks
    /// only when some bundle declares one.
    pub check_step_conds: Option<bool>,
    /// Use cluster kernels on the optimized path when a bundle has one.
    pub use_cluster: bool,

    finalized: bool,
}

impl Settings {
    pub fn new(ndims: usize) -> Self {
        Self {
            rank_sizes: vec![64; ndims],
            region_sizes: vec![0; ndims],
            region_steps: 0,
            block_sizes: vec![0; ndims],
            block_steps: 0,
            mini_block_sizes: vec![0; ndims],
            sub_block_sizes: vec![0; ndims],
            block_group_sizes: vec![0; ndims],
            mini_block_group_sizes: vec![0; ndims],
            sub_block_group_sizes: vec![0; ndims],
            min_pad_sizes: vec![0; ndims],
            nranks: vec![1; ndims],
            rank_indices: None,
            max_threads: 0,
            thread_divisor: 1,
            block_threads: 1,
            overlap_comms: false,
            allow_vec_exchange: true,
            check_step_conds: None,
            use_cluster: true,
            finalized: false,
        }
    }

    pub fn ndims(&self) -> usize {
        self.rank_sizes.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Mark sizes as stale again, e.g. after an API mutation.
    pub fn invalidate(&mut self) {
        self.finalized = false;
    }

    /// Resolve defaults and round every level to its granularity.
    pub fn finalize(&mut self, dims: &[DimSpec]) -> Result<()> {
        assert_eq!(dims.len(), self.ndims());
        if self.region_steps < 0 || self.block_steps < 0 {
            return Err(HaloclineError::Unsupported(
                "negative temporal tile depth".to_string(),
            ));
        }
        if self.thread_divisor == 0 || self.block_threads == 0 {
            return Err(HaloclineError::Unsupported(
                "thread divisor and block threads must be at least 1".to_string(),
            ));
        }
        for (d, spec) in dims.iter().enumerate() {
            let clen = spec.clen;
            let vlen = spec.vlen;

            if self.rank_sizes[d] < 1 {
                return Err(HaloclineError::DomainTooSmall(format!(
                    "rank-domain size {} in dim '{}'",
                    self.rank_sizes[d], spec.name
                )));
            }
            let rounded = round_up(self.rank_sizes[d], clen);
            if rounded != self.rank_sizes[d] {
                debug!(
                    dim = %spec.name,
                    from = self.rank_sizes[d],
                    to = rounded,
                    "rank-domain size rounded up to cluster multiple"
                );
                self.rank_sizes[d] = rounded;
            }

            // Each level: 0 inherits the parent, clamp into the parent,
            // round up to the granularity of the machinery below.
            let fix = |size: Idx, parent: Idx, gran: Idx| -> Idx {
                let s = if size <= 0 { parent } else { size.min(parent) };
                round_up(s, gran).min(round_up(parent, gran))
            };
            self.region_sizes[d] = fix(self.region_sizes[d], self.rank_sizes[d], clen);
            self.block_sizes[d] = fix(self.block_sizes[d], self.region_sizes[d], clen);
            self.mini_block_sizes[d] = fix(self.mini_block_sizes[d], self.block_sizes[d], clen);
            self.sub_block_sizes[d] = fix(self.sub_block_sizes[d], self.mini_block_sizes[d], vlen);

            let fix_group = |size: Idx, child: Idx| -> Idx {
                if size <= 0 {
                    child
                } else {
                    round_up(size, child)
                }
            };
            self.block_group_sizes[d] = fix_group(self.block_group_sizes[d], self.block_sizes[d]);
            self.mini_block_group_sizes[d] =
                fix_group(self.mini_block_group_sizes[d], self.mini_block_sizes[d]);
            self.sub_block_group_sizes[d] =
                fix_group(self.sub_block_group_sizes[d], self.sub_block_sizes[d]);

            if self.min_pad_sizes[d] < 0 {
                return Err(HaloclineError::Unsupported(
                    "negative minimum pad".to_string(),
                ));
            }
            if self.nranks[d] < 1 {
                return Err(HaloclineError::BadRankLayout(format!(
                    "num ranks {} in dim '{}'",
                    self.nranks[d], spec.name
                )));
            }
        }
        self.finalized = true;
        Ok(())
    }

    /// Split the thread budget into the outer (block) and inner
    /// (sub-block) levels.
    pub fn resolved_threads(&self) -> (usize, usize) {
        let total = if self.max_threads > 0 {
            self.max_threads
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        };
        let budget = (total / self.thread_divisor).max(1);
        let inner = self.block_threads.min(budget);
        let outer = (budget / inner).max(1);
        (outer, inner)
    }
}
