//! Generic N-D tile scanning.
//!
//! One higher-order utility replaces the per-level generated loop nests:
//! it walks a box grid over `[begin, end)` with a given tile size, an
//! optional grouping (all tiles of one group are visited before the next
//! group starts), and a dim-order permutation. A parallel variant fans
//! the tiles out over a thread pool; tile *content* must then be safe to
//! compute in any order.

use rayon::prelude::*;

use crate::indices::Indices;
use crate::Idx;

/// One level of the loop hierarchy: tile `[begin, end)` by `step`, in
/// `group`-sized chunks, visiting dims in `order` (first = outermost).
#[derive(Debug, Clone)]
pub struct ScanPlan {
    pub begin: Indices,
    pub end: Indices,
    pub step: Indices,
    pub group: Indices,
    pub order: Vec<usize>,
}

impl ScanPlan {
    /// Plain plan: no grouping, declared dim order.
    pub fn new(begin: Indices, end: Indices, step: Indices) -> Self {
        let n = begin.len();
        let group = step.clone();
        Self { begin, end, step, group, order: (0..n).collect() }
    }

    pub fn with_group(mut self, group: Indices) -> Self {
        self.group = group;
        self
    }

    pub fn with_order(mut self, order: Vec<usize>) -> Self {
        assert_eq!(order.len(), self.begin.len());
        self.order = order;
        self
    }

    fn ndims(&self) -> usize {
        self.begin.len()
    }

    fn is_empty(&self) -> bool {
        (0..self.ndims()).any(|d| self.end[d] <= self.begin[d])
    }
}

/// Walk sub-ranges of `[begin, end)` of extent `step` in permuted
/// row-major order, calling `f(start, stop)` for each.
fn walk_tiles(
    begin: &Indices,
    end: &Indices,
    step: &Indices,
    order: &[usize],
    f: &mut impl FnMut(&Indices, &Indices),
) {
    let ndims = begin.len();
    for d in 0..ndims {
        if end[d] <= begin[d] {
            return;
        }
        debug_assert!(step[d] >= 1);
    }
    let mut start = begin.clone();
    loop {
        let mut stop = Indices::new(ndims, 0);
        for d in 0..ndims {
            stop[d] = (start[d] + step[d]).min(end[d]);
        }
        f(&start, &stop);
        // Odometer over the permuted order, last entry fastest.
        let mut i = order.len();
        loop {
            if i == 0 {
                return;
            }
            i -= 1;
            let d = order[i];
            start[d] += step[d];
            if start[d] < end[d] {
                break;
            }
            start[d] = begin[d];
        }
    }
}

/// Visit every tile of the plan in order: groups outermost, tiles within
/// each group innermost.
pub fn scan(plan: &ScanPlan, mut visitor: impl FnMut(&Indices, &Indices)) {
    if plan.is_empty() {
        return;
    }
    walk_tiles(
        &plan.begin,
        &plan.end,
        &plan.group,
        &plan.order,
        &mut |gstart, gstop| {
            walk_tiles(gstart, gstop, &plan.step, &plan.order, &mut |s, e| {
                visitor(s, e)
            });
        },
    );
}

/// Materialize the tiles of the plan in traversal order.
pub fn tiles(plan: &ScanPlan) -> Vec<(Indices, Indices)> {
    let mut out = Vec::new();
    scan(plan, |s, e| out.push((s.clone(), e.clone())));
    out
}

/// Visit all tiles from the given pool. Visit order is unspecified;
/// tiles must touch disjoint data or synchronize themselves.
pub fn scan_parallel(
    pool: &rayon::ThreadPool,
    plan: &ScanPlan,
    visitor: impl Fn(&Indices, &Indices) + Sync,
) {
    let list = tiles(plan);
    pool.install(|| {
        list.par_iter().for_each(|(s, e)| visitor(s, e));
    });
}

/// Number of tiles the plan would visit.
pub fn num_tiles(plan: &ScanPlan) -> Idx {
    if plan.is_empty() {
        return 0;
    }
    (0..plan.ndims())
        .map(|d| {
            let len = plan.end[d] - plan.begin[d];
            (len + plan.step[d] - 1) / plan.step[d]
        })
        .product()
}
