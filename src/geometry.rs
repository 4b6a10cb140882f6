//! Temporal-tiling geometry: wavefront angles and extensions,
//! temporal-block trapezoids and bridges, and the shift calculations
//! that turn a base tile into its position for a given shift count.
//!
//! A wavefront shifts every region left by `angle` points per bundle
//! pack per time step, so data written at one step is still in cache
//! when the next step reads it. Temporal blocking tessellates a region
//! into `D+1` phases of trapezoid and bridge shapes so a whole block of
//! time steps runs from cache. Both use the same per-dim angle, rounded
//! up from the maximum halo to the fold length.

use crate::bbox::BoundingBox;
use crate::error::{HaloclineError, Result};
use crate::indices::{ceil_div, round_up, DimSpec, Indices};
use crate::rank::Neighborhood;
use crate::settings::Settings;
use crate::Idx;

/// Derived temporal-tiling quantities; immutable after preparation.
#[derive(Debug, Clone)]
pub struct Geometry {
    /// Wavefront depth in steps: `max(region_steps, tb_steps)`.
    pub wf_steps: Idx,
    pub num_wf_shifts: Idx,
    pub wf_angles: Vec<Idx>,
    /// Total shift per dim over one wavefront window.
    pub wf_shift_pts: Vec<Idx>,
    pub left_wf_exts: Vec<Idx>,
    pub right_wf_exts: Vec<Idx>,

    /// Temporal-block depth, bounded by block sizes; 0 disables TB.
    pub tb_steps: Idx,
    pub num_tb_shifts: Idx,
    pub tb_angles: Vec<Idx>,
    pub tb_widths: Vec<Idx>,
    pub tb_tops: Vec<Idx>,
    pub mb_angles: Vec<Idx>,

    /// This rank's domain in global coordinates.
    pub domain_begin: Indices,
    pub domain_end: Indices,
    /// Domain extended by the wavefront extensions.
    pub ext_begin: Indices,
    pub ext_end: Indices,
    /// Rank domain shrunk by the exchanged halo width on each side with
    /// a neighbor; blocks fully inside may overlap with communication.
    pub interior: BoundingBox,
}

/// Compute all tiling geometry from finalized settings, the recorded
/// maximum halos, and this rank's place in the rank grid.
pub fn derive(
    settings: &Settings,
    dims: &[DimSpec],
    max_halos: &[Idx],
    num_packs: usize,
    neigh: &Neighborhood,
) -> Result<Geometry> {
    assert!(settings.is_finalized());
    let ndims = dims.len();
    let npacks = num_packs.max(1) as Idx;

    let tb_req = settings.block_steps;
    let wf_steps = settings.region_steps.max(tb_req);
    let num_wf_shifts = if wf_steps > 0 { (npacks * wf_steps - 1).max(0) } else { 0 };

    let mut wf_angles = vec![0; ndims];
    let mut wf_shift_pts = vec![0; ndims];
    let mut left_wf_exts = vec![0; ndims];
    let mut right_wf_exts = vec![0; ndims];

    for d in 0..ndims {
        let angle = round_up(max_halos[d], dims[d].vlen);
        // No wavefront shift needed in a dim whose region covers the
        // whole global domain.
        if settings.region_sizes[d] < settings.rank_sizes[d] || settings.nranks[d] > 1 {
            wf_angles[d] = angle;
        }
        wf_shift_pts[d] = wf_angles[d] * num_wf_shifts;

        if settings.nranks[d] > 1 {
            let min_size = max_halos[d] + wf_shift_pts[d];
            if settings.rank_sizes[d] < min_size {
                return Err(HaloclineError::DomainTooSmall(format!(
                    "rank-domain size {} in dim '{}' is less than the minimum {} \
                     from halos and wavefront extension",
                    settings.rank_sizes[d], dims[d].name, min_size
                )));
            }
        }
        left_wf_exts[d] = if neigh.is_first_rank(d) { 0 } else { wf_shift_pts[d] };
        right_wf_exts[d] = if neigh.is_last_rank(d) { 0 } else { wf_shift_pts[d] };
    }

    // Temporal-block angles, with the depth bounded so the trapezoid top
    // stays at least one fold wide in every shifting dim.
    let mut tb_angles = vec![0; ndims];
    let mut mb_angles = vec![0; ndims];
    let mut tb_steps = tb_req.min(wf_steps);
    for d in 0..ndims {
        let angle = round_up(max_halos[d], dims[d].vlen);
        if settings.block_sizes[d] < settings.region_sizes[d] {
            tb_angles[d] = angle;
        }
        if settings.mini_block_sizes[d] < settings.block_sizes[d] {
            mb_angles[d] = angle;
        }
    }
    if tb_req > 0 {
        for d in 0..ndims {
            if tb_angles[d] > 0 {
                let top_sz = dims[d].vlen;
                let shift_pts = 2 * tb_angles[d] * npacks;
                let nsteps = (settings.block_sizes[d] - top_sz + 2 * tb_angles[d]) / shift_pts;
                tb_steps = tb_steps.min(nsteps);
            }
        }
        tb_steps = tb_steps.max(0);
    } else {
        tb_steps = 0;
    }
    let num_tb_shifts = if tb_steps > 0 { (npacks * tb_steps - 1).max(0) } else { 0 };

    let mut tb_widths = vec![0; ndims];
    let mut tb_tops = vec![0; ndims];
    for d in 0..ndims {
        let blk = settings.block_sizes[d];
        tb_widths[d] = blk;
        tb_tops[d] = blk;
        if num_tb_shifts > 0 && tb_angles[d] > 0 {
            let fold = dims[d].vlen;
            let sa = num_tb_shifts * tb_angles[d];
            let mut width = round_up(ceil_div(blk, 2) + sa, fold);
            width = width.max(fold + 2 * sa);
            tb_widths[d] = width;
            tb_tops[d] = (width - 2 * sa).max(0);
        }
    }

    let domain_begin = Indices::from_slice(&neigh.rank_domain_offset);
    let domain_end = Indices(
        (0..ndims).map(|d| domain_begin[d] + settings.rank_sizes[d]).collect(),
    );
    let ext_begin = Indices((0..ndims).map(|d| domain_begin[d] - left_wf_exts[d]).collect());
    let ext_end = Indices((0..ndims).map(|d| domain_end[d] + right_wf_exts[d]).collect());

    let mut int_begin = domain_begin.clone();
    let mut int_end = domain_end.clone();
    for d in 0..ndims {
        if neigh.has_neighbor_side(d, false) {
            int_begin[d] += max_halos[d] + wf_shift_pts[d];
        }
        if neigh.has_neighbor_side(d, true) {
            int_end[d] -= max_halos[d] + wf_shift_pts[d];
        }
    }
    let interior = if (0..ndims).all(|d| int_end[d] > int_begin[d]) {
        BoundingBox::from_range(int_begin, int_end)
    } else {
        BoundingBox::empty(ndims)
    };

    Ok(Geometry {
        wf_steps,
        num_wf_shifts,
        wf_angles,
        wf_shift_pts,
        left_wf_exts,
        right_wf_exts,
        tb_steps,
        num_tb_shifts,
        tb_angles,
        tb_widths,
        tb_tops,
        mb_angles,
        domain_begin,
        domain_end,
        ext_begin,
        ext_end,
        interior,
    })
}

/// Region boundaries after `shift_num` wavefront shifts of the base
/// `[base_start, base_stop)`, clamped into the wavefront extensions and
/// trimmed to `trim_bb` (a pack's extended bounding box). Returns `None`
/// when the shifted region is empty.
pub fn shift_region(
    geom: &Geometry,
    base_start: &Indices,
    base_stop: &Indices,
    shift_num: Idx,
    trim_bb: Option<&BoundingBox>,
) -> Option<(Indices, Indices)> {
    let ndims = base_start.len();
    let mut begin = Indices::new(ndims, 0);
    let mut end = Indices::new(ndims, 0);
    for d in 0..ndims {
        let angle = geom.wf_angles[d];
        // Regions only shift left, so region loops can sweep upward in
        // any order.
        let mut rstart = base_start[d] - angle * shift_num;
        let mut rstop = base_stop[d] - angle * shift_num;

        if let Some(bb) = trim_bb {
            rstart = rstart.max(bb.begin[d]);
            rstop = rstop.min(bb.end[d]);
        }

        let dbegin = geom.domain_begin[d];
        let dend = geom.domain_end[d];

        // Inside the left extension the boundary advances right by one
        // angle per shift; mirror on the right.
        if rstart < dbegin && geom.left_wf_exts[d] > 0 {
            rstart = rstart.max(dbegin - geom.left_wf_exts[d] + shift_num * angle);
        }
        if rstop > dend && geom.right_wf_exts[d] > 0 {
            rstop = rstop.min(dend + geom.right_wf_exts[d] - shift_num * angle);
        }

        if rstop <= rstart {
            return None;
        }
        begin[d] = rstart;
        end[d] = rstop;
    }
    Some((begin, end))
}

/// All `k`-element subsets of `0..n`, in lexicographic order. Used to
/// pick which dims a bridge phase spans.
pub fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    let mut cur = Vec::with_capacity(k);
    fn rec(out: &mut Vec<Vec<usize>>, cur: &mut Vec<usize>, start: usize, n: usize, k: usize) {
        if cur.len() == k {
            out.push(cur.clone());
            return;
        }
        for i in start..n {
            cur.push(i);
            rec(out, cur, i + 1, n, k);
            cur.pop();
        }
    }
    rec(&mut out, &mut cur, 0, n, k);
    out
}

/// Inputs of [`shift_mini_block`] that identify the containing tiles.
pub struct MbShift<'a> {
    /// Raw region base within the rank scan (no shifts applied).
    pub region_base: (&'a Indices, &'a Indices),
    /// Region bounds at the start of the current temporal-block window;
    /// the bounds the block grid was scanned over.
    pub region_window: (&'a Indices, &'a Indices),
    /// Phase-0 base of this block within the region scan.
    pub block_base: (&'a Indices, &'a Indices),
    /// Adjusted block scan bounds (base extended to cover bridges).
    pub adj_block_base: (&'a Indices, &'a Indices),
    /// This mini-block's box within the adjusted block.
    pub mb_base: (&'a Indices, &'a Indices),
    /// Total wavefront shifts applied to the region base (pack-steps
    /// since the start of the enclosing rank window).
    pub region_shift_num: Idx,
    /// Shifts since the bottom of the current temporal-block window;
    /// drives the trapezoid and mini-block geometry.
    pub tile_shift_num: Idx,
    pub nphases: Idx,
    pub phase: Idx,
    pub dims_to_bridge: &'a [usize],
    /// Pack's extended bounding box to trim to, if one pack is selected.
    pub trim_bb: Option<&'a BoundingBox>,
}

/// Mini-block boundaries for a given tessellation phase and shape after
/// `shift_num` shifts. Returns `None` when the shape is empty here.
///
/// Phase 0 sweeps the shrinking base trapezoid of each block; phase `k`
/// sweeps the widening bridges between adjacent blocks in each chosen
/// combination of `k` dims. Mini-blocks themselves ride a wavefront
/// within the shape.
pub fn shift_mini_block(geom: &Geometry, args: &MbShift<'_>) -> Option<(Indices, Indices)> {
    // Current region bounds for this shift; everything below is clamped
    // into them.
    let (rbegin, rend) = shift_region(
        geom,
        args.region_base.0,
        args.region_base.1,
        args.region_shift_num,
        args.trim_bb,
    )?;

    let ndims = rbegin.len();
    let mut begin = Indices::new(ndims, 0);
    let mut end = Indices::new(ndims, 0);

    for d in 0..ndims {
        let is_first_blk = args.block_base.0[d] <= args.region_window.0[d];
        let is_last_blk = args.block_base.1[d] >= args.region_window.1[d];
        let is_one_blk = is_first_blk && is_last_blk;

        let mut blk_start = args.block_base.0[d];
        let mut blk_stop = args.block_base.1[d];
        let mut next_blk_start = args.block_base.1[d];

        let tb_angle = geom.tb_angles[d];

        // The phase-0 base is narrowed to the trapezoid width so the
        // up and down shapes end up about the same size.
        if args.nphases > 1 && !is_one_blk {
            blk_stop = (blk_start + geom.tb_widths[d]).min(args.block_base.1[d]);
        }

        // Base trapezoid contracts by one angle per shift on both sides;
        // the bridge gap widens correspondingly. First and last blocks
        // clamp to the region edge instead.
        blk_start += tb_angle * args.tile_shift_num;
        if is_first_blk {
            blk_start = rbegin[d];
        }
        blk_stop -= tb_angle * args.tile_shift_num;
        if (args.nphases == 1 || is_one_blk) && is_last_blk {
            blk_stop = rend[d];
        }
        next_blk_start += tb_angle * args.tile_shift_num;
        if is_last_blk {
            next_blk_start = rend[d];
        }

        let mut shape_start = blk_start;
        let mut shape_stop = blk_stop;
        if args.phase > 0 && args.dims_to_bridge.contains(&d) {
            // Bridge from the right edge of this block's trapezoid to
            // the left edge of the next block's.
            shape_start = blk_stop.max(blk_start);
            shape_stop = next_blk_start;
        }
        if shape_stop <= shape_start {
            return None;
        }

        // Mini-blocks ride their own wavefront inside the shape.
        let is_first_mb = args.mb_base.0[d] <= args.adj_block_base.0[d];
        let is_last_mb = args.mb_base.1[d] >= args.adj_block_base.1[d];
        let is_one_mb = is_first_mb && is_last_mb;

        let mut mb_start = args.mb_base.0[d];
        let mut mb_stop = args.mb_base.1[d];
        if !is_one_mb {
            mb_start -= geom.mb_angles[d] * args.tile_shift_num;
            mb_stop -= geom.mb_angles[d] * args.tile_shift_num;
        }
        if is_first_mb {
            mb_start = shape_start;
        }
        if is_last_mb {
            mb_stop = shape_stop;
        }

        mb_start = mb_start.max(rbegin[d]).max(shape_start);
        mb_stop = mb_stop.min(rend[d]).min(shape_stop);
        if mb_stop <= mb_start {
            return None;
        }
        begin[d] = mb_start;
        end[d] = mb_stop;
    }
    Some((begin, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleProcessComm;
    use crate::indices::DimSpec;
    use crate::rank::setup_rank;

    fn dims_2d() -> Vec<DimSpec> {
        vec![DimSpec::domain("x", 1, 1), DimSpec::domain("y", 1, 1)]
    }

    fn geom_for(settings: &mut Settings, max_halos: &[Idx], packs: usize) -> Geometry {
        let dims = dims_2d();
        settings.finalize(&dims).unwrap();
        let neigh = setup_rank(
            &SingleProcessComm,
            &[1, 1],
            None,
            &settings.rank_sizes,
            &[1, 1],
        )
        .unwrap();
        derive(settings, &dims, max_halos, packs, &neigh).unwrap()
    }

    #[test]
    fn test_no_wavefront_no_shift() {
        let mut s = Settings::new(2);
        s.rank_sizes = vec![64, 64];
        let g = geom_for(&mut s, &[1, 1], 1);
        assert_eq!(g.wf_steps, 0);
        assert_eq!(g.num_wf_shifts, 0);
        assert_eq!(g.wf_shift_pts, vec![0, 0]);
        assert_eq!(g.tb_steps, 0);
    }

    #[test]
    fn test_wavefront_angles_and_shifts() {
        let mut s = Settings::new(2);
        s.rank_sizes = vec![64, 64];
        s.region_sizes = vec![16, 64];
        s.region_steps = 4;
        let g = geom_for(&mut s, &[2, 2], 1);
        assert_eq!(g.wf_steps, 4);
        assert_eq!(g.num_wf_shifts, 3);
        // The region covers the whole single-rank domain in y, so only x
        // shifts.
        assert_eq!(g.wf_angles, vec![2, 0]);
        assert_eq!(g.wf_shift_pts, vec![6, 0]);
        // Single rank: no extensions on either side.
        assert_eq!(g.left_wf_exts, vec![0, 0]);
        assert_eq!(g.ext_begin, g.domain_begin);
    }

    #[test]
    fn test_tb_depth_bounded_by_block() {
        let mut s = Settings::new(2);
        s.rank_sizes = vec![64, 64];
        s.region_sizes = vec![64, 64];
        s.block_sizes = vec![8, 64];
        s.block_steps = 100;
        // With block 8 < region 64 in x only, angle 1: depth is
        // (8 - 1 + 2) / 2 = 4.
        let g = geom_for(&mut s, &[1, 1], 1);
        assert_eq!(g.tb_angles, vec![1, 0]);
        assert_eq!(g.tb_steps, 4);
        assert_eq!(g.num_tb_shifts, 3);
        // width = round_up(8/2 + 3, 1) = 7; top = 7 - 6 = 1.
        assert_eq!(g.tb_widths[0], 7);
        assert_eq!(g.tb_tops[0], 1);
        assert_eq!(g.tb_widths[1], 64);
    }

    #[test]
    fn test_shift_region_simple() {
        let mut s = Settings::new(2);
        s.rank_sizes = vec![64, 64];
        s.region_sizes = vec![16, 16];
        s.region_steps = 2;
        let g = geom_for(&mut s, &[1, 1], 1);
        let base_start = Indices::from_slice(&[16, 16]);
        let base_stop = Indices::from_slice(&[32, 32]);
        let (b, e) = shift_region(&g, &base_start, &base_stop, 1, None).unwrap();
        assert_eq!(b, Indices::from_slice(&[15, 15]));
        assert_eq!(e, Indices::from_slice(&[31, 31]));
    }

    #[test]
    fn test_shift_region_empty() {
        let mut s = Settings::new(2);
        s.rank_sizes = vec![64, 64];
        s.region_sizes = vec![16, 16];
        s.region_steps = 2;
        let g = geom_for(&mut s, &[4, 4], 1);
        // A region at the left domain edge shifts entirely out once it
        // is trimmed to the domain box.
        let bb = BoundingBox::from_range(
            Indices::from_slice(&[0, 0]),
            Indices::from_slice(&[64, 64]),
        );
        let base_start = Indices::from_slice(&[0, 0]);
        let base_stop = Indices::from_slice(&[4, 16]);
        assert!(shift_region(&g, &base_start, &base_stop, 1, Some(&bb)).is_none());
    }

    #[test]
    fn test_domain_too_small_for_wavefront() {
        let dims = dims_2d();
        let mut s = Settings::new(2);
        s.rank_sizes = vec![4, 64];
        s.region_sizes = vec![4, 64];
        s.region_steps = 8;
        s.nranks = vec![1, 1];
        s.finalize(&dims).unwrap();
        // Pretend this is a 2-rank layout in x by checking derive's
        // validation directly with a fake neighborhood.
        let neigh = setup_rank(&SingleProcessComm, &[1, 1], None, &s.rank_sizes, &[1, 1]).unwrap();
        let mut s2 = s.clone();
        s2.nranks = vec![2, 1];
        let err = derive(&s2, &dims, &[2, 2], 1, &neigh);
        assert!(matches!(err, Err(HaloclineError::DomainTooSmall(_))));
    }

    #[test]
    fn test_combinations() {
        assert_eq!(combinations(3, 0), vec![Vec::<usize>::new()]);
        assert_eq!(combinations(3, 1), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(combinations(3, 2), vec![vec![0, 1], vec![0, 2], vec![1, 2]]);
        assert_eq!(combinations(2, 2), vec![vec![0, 1]]);
    }

    #[test]
    fn test_mini_block_phase0_and_bridge_cover_block_pair() {
        // 1-D-style check in the x dim: at each shift, the phase-0
        // trapezoids and phase-1 bridges of two adjacent blocks must
        // tile the region without gaps.
        let mut s = Settings::new(2);
        s.rank_sizes = vec![32, 8];
        s.region_sizes = vec![32, 8];
        s.block_sizes = vec![16, 8];
        s.block_steps = 2;
        let g = geom_for(&mut s, &[1, 1], 1);
        assert_eq!(g.tb_steps, 2);

        let region = (Indices::from_slice(&[0, 0]), Indices::from_slice(&[32, 8]));
        let blocks =
            [(Indices::from_slice(&[0, 0]), Indices::from_slice(&[16, 8])),
             (Indices::from_slice(&[16, 0]), Indices::from_slice(&[32, 8]))];

        for shift in 0..g.tb_steps {
            let mut covered = vec![false; 32];
            for (bb, be) in &blocks {
                let mut adj_end = be.clone();
                adj_end[0] += be[0] - bb[0];
                for phase in 0..2 {
                    let shapes: Vec<Vec<usize>> = if phase == 0 {
                        vec![vec![]]
                    } else {
                        vec![vec![0]]
                    };
                    for dims_to_bridge in &shapes {
                        let args = MbShift {
                            region_base: (&region.0, &region.1),
                            region_window: (&region.0, &region.1),
                            block_base: (bb, be),
                            adj_block_base: (bb, &adj_end),
                            mb_base: (bb, &adj_end),
                            region_shift_num: shift,
                            tile_shift_num: shift,
                            nphases: 2,
                            phase,
                            dims_to_bridge,
                            trim_bb: None,
                        };
                        if let Some((mb, me)) = shift_mini_block(&g, &args) {
                            for x in mb[0]..me[0] {
                                assert!(!covered[x as usize], "double cover at {x}");
                                covered[x as usize] = true;
                            }
                        }
                    }
                }
            }
            assert!(covered.iter().all(|&c| c), "gap at shift {shift}");
        }
    }
}
