//! Bounding boxes over the rank domain and decomposition of
//! non-rectangular valid domains into full rectangles.
//!
//! Each bundle gets one bounding box around its valid points. When the
//! valid domain is not a solid rectangle, it is decomposed into a list of
//! non-overlapping full sub-boxes that the loop drivers iterate, so the
//! hot path never evaluates the sub-domain predicate.

use rayon::prelude::*;

use crate::indices::Indices;
use crate::Idx;

/// A closed-open box `[begin, end)` per domain dim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundingBox {
    pub begin: Indices,
    pub end: Indices,
    /// Valid points inside; equals `size()` when `is_full`.
    pub num_points: Idx,
    pub is_full: bool,
    /// Edges fall on fold-length multiples.
    pub is_aligned: bool,
    /// Side lengths are cluster-length multiples.
    pub is_cluster_mult: bool,
}

impl BoundingBox {
    pub fn empty(ndims: usize) -> Self {
        Self {
            begin: Indices::new(ndims, 0),
            end: Indices::new(ndims, 0),
            num_points: 0,
            is_full: true,
            is_aligned: true,
            is_cluster_mult: true,
        }
    }

    /// A full box over `[begin, end)`.
    pub fn from_range(begin: Indices, end: Indices) -> Self {
        let mut bb = Self {
            num_points: 0,
            is_full: true,
            is_aligned: false,
            is_cluster_mult: false,
            begin,
            end,
        };
        bb.num_points = bb.size();
        bb
    }

    pub fn ndims(&self) -> usize {
        self.begin.len()
    }

    pub fn len(&self, d: usize) -> Idx {
        (self.end[d] - self.begin[d]).max(0)
    }

    /// Points in the rectangular hull.
    pub fn size(&self) -> Idx {
        (0..self.ndims()).map(|d| self.len(d)).product()
    }

    pub fn is_empty(&self) -> bool {
        (0..self.ndims()).any(|d| self.end[d] <= self.begin[d])
    }

    pub fn contains_point(&self, pt: &Indices) -> bool {
        (0..self.ndims()).all(|d| pt[d] >= self.begin[d] && pt[d] < self.end[d])
    }

    /// Whether `[start, stop)` lies entirely inside this box.
    pub fn contains_range(&self, start: &Indices, stop: &Indices) -> bool {
        (0..self.ndims()).all(|d| start[d] >= self.begin[d] && stop[d] <= self.end[d])
    }

    pub fn intersect(&self, other: &BoundingBox) -> BoundingBox {
        let begin = self.begin.max(&other.begin);
        let end = self.end.min(&other.end);
        if (0..self.ndims()).any(|d| end[d] <= begin[d]) {
            return BoundingBox::empty(self.ndims());
        }
        BoundingBox::from_range(begin, end)
    }

    /// Recompute the alignment flags against the given granularities.
    pub fn update_flags(&mut self, vlens: &[Idx], clens: &[Idx]) {
        self.is_aligned = (0..self.ndims()).all(|d| {
            self.begin[d].rem_euclid(vlens[d]) == 0 && self.end[d].rem_euclid(vlens[d]) == 0
        });
        self.is_cluster_mult = (0..self.ndims()).all(|d| self.len(d) % clens[d] == 0);
    }
}

/// Bounding-box data for one bundle: the hull plus, when the hull is not
/// full, a list of non-overlapping full rectangles covering exactly the
/// valid domain.
#[derive(Debug, Clone)]
pub struct BundleBB {
    pub bb: BoundingBox,
    pub sub_bbs: Vec<BoundingBox>,
}

impl BundleBB {
    /// Full rectangles to iterate for this bundle, clipped to `within`.
    pub fn rects_within(&self, within: &BoundingBox) -> Vec<BoundingBox> {
        let list: &[BoundingBox] =
            if self.bb.is_full { std::slice::from_ref(&self.bb) } else { &self.sub_bbs };
        list.iter()
            .map(|r| r.intersect(within))
            .filter(|r| !r.is_empty())
            .collect()
    }
}

/// Scan `[rank_begin, rank_end)` once with the valid-domain predicate and
/// build the bundle's bounding-box data.
///
/// With no predicate the whole range is valid and the hull is full. A
/// non-full hull is decomposed by slicing the outer dim across
/// `nthreads` workers, growing full rectangles greedily inside each
/// slice, then merging slice-adjacent rectangles along the outer dim.
pub fn find_bounding_box(
    pred: Option<&(dyn Fn(&Indices) -> bool + Sync)>,
    rank_begin: &Indices,
    rank_end: &Indices,
    vlens: &[Idx],
    clens: &[Idx],
    nthreads: usize,
) -> BundleBB {
    let ndims = rank_begin.len();
    let Some(pred) = pred else {
        let mut bb = BoundingBox::from_range(rank_begin.clone(), rank_end.clone());
        bb.update_flags(vlens, clens);
        return BundleBB { bb, sub_bbs: Vec::new() };
    };

    // Pass 1: hull and point count, one outer-dim row per task.
    let outer_len = (rank_end[0] - rank_begin[0]).max(0);
    let rows: Vec<Option<(Indices, Indices, Idx)>> = (0..outer_len)
        .into_par_iter()
        .map(|i| {
            let mut lo: Option<Indices> = None;
            let mut hi: Option<Indices> = None;
            let mut count = 0;
            visit_box(rank_begin, rank_end, Some(rank_begin[0] + i), |pt| {
                if pred(pt) {
                    count += 1;
                    lo = Some(match lo.take() {
                        Some(m) => m.min(pt),
                        None => pt.clone(),
                    });
                    hi = Some(match hi.take() {
                        Some(m) => m.max(pt),
                        None => pt.clone(),
                    });
                }
            });
            lo.map(|l| (l, hi.expect("hi set with lo"), count))
        })
        .collect();

    let mut lo: Option<Indices> = None;
    let mut hi: Option<Indices> = None;
    let mut num_points = 0;
    for row in rows.into_iter().flatten() {
        num_points += row.2;
        lo = Some(match lo.take() {
            Some(m) => m.min(&row.0),
            None => row.0,
        });
        hi = Some(match hi.take() {
            Some(m) => m.max(&row.1),
            None => row.1,
        });
    }

    let (Some(lo), Some(hi)) = (lo, hi) else {
        return BundleBB { bb: BoundingBox::empty(ndims), sub_bbs: Vec::new() };
    };

    let end = hi.add(&Indices::new(ndims, 1));
    let mut bb = BoundingBox::from_range(lo, end);
    bb.is_full = num_points == bb.size();
    bb.num_points = num_points;
    bb.update_flags(vlens, clens);
    if bb.is_full {
        return BundleBB { bb, sub_bbs: Vec::new() };
    }

    // Pass 2: decompose into full rectangles, one outer slice per worker.
    let nslices = nthreads.clamp(1, bb.len(0).max(1) as usize) as Idx;
    let slice_len = (bb.len(0) + nslices - 1) / nslices;
    let mut sub_bbs: Vec<BoundingBox> = (0..nslices)
        .into_par_iter()
        .map(|s| {
            let s0 = bb.begin[0] + s * slice_len;
            let s1 = (s0 + slice_len).min(bb.end[0]);
            grow_rects(pred, &bb, s0, s1)
        })
        .reduce(Vec::new, |mut a, mut b| {
            a.append(&mut b);
            a
        });
    merge_along_outer(&mut sub_bbs);
    for r in &mut sub_bbs {
        r.update_flags(vlens, clens);
    }

    BundleBB { bb, sub_bbs }
}

/// Visit all points of `[begin, end)` row-major; when `outer` is given,
/// dim 0 is pinned to that index.
fn visit_box(begin: &Indices, end: &Indices, outer: Option<Idx>, mut f: impl FnMut(&Indices)) {
    let ndims = begin.len();
    let mut lo = begin.clone();
    let mut hi = end.clone();
    if let Some(i) = outer {
        lo[0] = i;
        hi[0] = i + 1;
    }
    for d in 0..ndims {
        if hi[d] <= lo[d] {
            return;
        }
    }
    let mut pt = lo.clone();
    loop {
        f(&pt);
        let mut d = ndims;
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            pt[d] += 1;
            if pt[d] < hi[d] {
                break;
            }
            pt[d] = lo[d];
        }
    }
}

/// Greedy rectangle growth inside the outer-dim slice `[s0, s1)` of `bb`.
fn grow_rects(
    pred: &(dyn Fn(&Indices) -> bool + Sync),
    bb: &BoundingBox,
    s0: Idx,
    s1: Idx,
) -> Vec<BoundingBox> {
    let ndims = bb.ndims();
    let mut rects: Vec<BoundingBox> = Vec::new();
    let covered =
        |pt: &Indices, rects: &[BoundingBox]| rects.iter().any(|r| r.contains_point(pt));

    let mut slice_begin = bb.begin.clone();
    let mut slice_end = bb.end.clone();
    slice_begin[0] = s0;
    slice_end[0] = s1;

    let mut seeds: Vec<Indices> = Vec::new();
    visit_box(&slice_begin, &slice_end, None, |pt| seeds.push(pt.clone()));
    for pt in seeds {
        if !pred(&pt) || covered(&pt, &rects) {
            continue;
        }
        // Start from a unit box and extend one face at a time, innermost
        // dim first; a face is admitted only when every point on it is
        // valid and not already owned by another rectangle.
        let begin = pt.clone();
        let mut end = pt.clone();
        for d in 0..ndims {
            end[d] += 1;
        }
        for d in (0..ndims).rev() {
            let limit = if d == 0 { s1 } else { bb.end[d] };
            'extend: while end[d] < limit {
                let mut face_lo = begin.clone();
                let mut face_hi = end.clone();
                face_lo[d] = end[d];
                face_hi[d] = end[d] + 1;
                let mut ok = true;
                visit_box(&face_lo, &face_hi, None, |q| {
                    if ok && (!pred(q) || covered(q, &rects)) {
                        ok = false;
                    }
                });
                if !ok {
                    break 'extend;
                }
                end[d] += 1;
            }
        }
        rects.push(BoundingBox::from_range(begin, end));
    }
    rects
}

/// Merge rectangles that agree in every non-outer dim and butt together
/// along the outer dim.
fn merge_along_outer(rects: &mut Vec<BoundingBox>) {
    rects.sort_by_key(|r| {
        let mut key: Vec<Idx> = Vec::with_capacity(2 * r.ndims());
        for d in 1..r.ndims() {
            key.push(r.begin[d]);
            key.push(r.end[d]);
        }
        key.push(r.begin[0]);
        key
    });
    let mut merged: Vec<BoundingBox> = Vec::with_capacity(rects.len());
    for r in rects.drain(..) {
        if let Some(last) = merged.last_mut() {
            let same_inner = (1..r.ndims())
                .all(|d| last.begin[d] == r.begin[d] && last.end[d] == r.end[d]);
            if same_inner && last.end[0] == r.begin[0] {
                last.end[0] = r.end[0];
                last.num_points = last.size();
                continue;
            }
        }
        merged.push(r);
    }
    *rects = merged;
}
