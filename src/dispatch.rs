//! Bundle dispatch: turning a sub-block box into kernel calls.
//!
//! The optimized path iterates each bundle's full rectangles (the
//! bounding-box hull, or the sub-box list when the valid domain is not
//! rectangular), walking cluster-aligned interiors with the cluster
//! kernel and peeling unaligned edges point-by-point. The reference
//! path sweeps scalar points and consults the sub-domain predicate
//! directly, giving an independent check of the decomposition.

use crate::bbox::{BoundingBox, BundleBB};
use crate::bundle::{EvalVars, SolutionDef};
use crate::indices::{round_up, Indices};
use crate::stats::WorkCounters;
use crate::var::Var;
use crate::Idx;

/// Everything dispatch needs besides the vars themselves.
pub struct DispatchInfo<'a> {
    pub def: &'a SolutionDef,
    pub bbs: &'a [BundleBB],
    pub counters: &'a WorkCounters,
    pub use_cluster: bool,
}

fn for_each_point(begin: &Indices, end: &Indices, mut f: impl FnMut(&Indices)) {
    let ndims = begin.len();
    for d in 0..ndims {
        if end[d] <= begin[d] {
            return;
        }
    }
    let mut pt = begin.clone();
    loop {
        f(&pt);
        let mut d = ndims;
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            pt[d] += 1;
            if pt[d] < end[d] {
                break;
            }
            pt[d] = begin[d];
        }
    }
}

fn for_each_stride(begin: &Indices, end: &Indices, step: &[Idx], mut f: impl FnMut(&Indices)) {
    let ndims = begin.len();
    for d in 0..ndims {
        if end[d] <= begin[d] {
            return;
        }
    }
    let mut pt = begin.clone();
    loop {
        f(&pt);
        let mut d = ndims;
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            pt[d] += step[d];
            if pt[d] < end[d] {
                break;
            }
            pt[d] = begin[d];
        }
    }
}

/// Evaluate one bundle over one sub-block box at step `t` on the
/// optimized path.
pub fn calc_sub_block(
    info: &DispatchInfo<'_>,
    ev: &EvalVars<'_>,
    bundle_idx: usize,
    begin: &Indices,
    end: &Indices,
    t: Idx,
) {
    let b = &info.def.bundles[bundle_idx];
    let sbox = BoundingBox::from_range(begin.clone(), end.clone());
    if sbox.is_empty() {
        return;
    }
    let clens = info.def.clens();

    for rect in info.bbs[bundle_idx].rects_within(&sbox) {
        info.counters.add_points(
            rect.size() as u64,
            b.reads_per_point(),
            b.writes.len() as u64,
            b.fp_ops_per_point,
        );

        let cluster = if info.use_cluster { b.calc_cluster } else { None };
        if let Some(calc_cluster) = cluster {
            // Cluster-aligned core, then a scalar peel over the shell.
            let mut core_b = rect.begin.clone();
            let mut core_e = rect.end.clone();
            for d in 0..rect.ndims() {
                core_b[d] = round_up(rect.begin[d], clens[d]);
                core_e[d] = rect.end[d].div_euclid(clens[d]) * clens[d];
            }
            let has_core = (0..rect.ndims()).all(|d| core_e[d] > core_b[d]);
            if has_core {
                for_each_stride(&core_b, &core_e, &clens, |base| calc_cluster(ev, base, t));
                let core = BoundingBox::from_range(core_b, core_e);
                for_each_point(&rect.begin, &rect.end, |pt| {
                    if !core.contains_point(pt) {
                        (b.calc_scalar)(ev, pt, t);
                    }
                });
                continue;
            }
        }
        for_each_point(&rect.begin, &rect.end, |pt| (b.calc_scalar)(ev, pt, t));
    }
}

/// Evaluate one bundle over a box at step `t` on the reference path:
/// scalar kernel only, sub-domain predicate checked per point.
pub fn calc_ref_sweep(
    info: &DispatchInfo<'_>,
    ev: &EvalVars<'_>,
    bundle_idx: usize,
    begin: &Indices,
    end: &Indices,
    t: Idx,
) {
    let b = &info.def.bundles[bundle_idx];
    let sbox = BoundingBox::from_range(begin.clone(), end.clone());
    let rect = info.bbs[bundle_idx].bb.intersect(&sbox);
    if rect.is_empty() {
        return;
    }
    let mut npts = 0u64;
    for_each_point(&rect.begin, &rect.end, |pt| {
        let valid = b.sub_domain.map(|p| p(pt)).unwrap_or(true);
        if valid {
            (b.calc_scalar)(ev, pt, t);
            npts += 1;
        }
    });
    info.counters.add_points(
        npts,
        b.reads_per_point(),
        b.writes.len() as u64,
        b.fp_ops_per_point,
    );
}

/// Point a thread's scratch vars at a new evaluation origin so one
/// allocation is reused across every tile the thread computes.
pub fn update_scratch_offsets(scratch: &mut [Var], def: &SolutionDef, eval_begin: &Indices) {
    for var in scratch.iter_mut() {
        for vd in var.dims_mut() {
            if let Some(d) = def.domain_dims.iter().position(|s| s.name == vd.spec.name) {
                vd.local_offset = eval_begin[d];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbox::find_bounding_box;
    use crate::bundle::{BundleDef, PackDef, ReadPattern, SolutionDef, VarDefn, WritePattern};
    use crate::indices::DimSpec;
    use crate::var::Var;

    // Kernels count visits by incrementing the cell in place.
    fn bump(ev: &EvalVars<'_>, pt: &Indices, t: Idx) {
        let u = ev.var(0);
        u.write_elem(pt, t, u.read_elem(pt, t) + 1.0);
    }

    fn bump_cluster(ev: &EvalVars<'_>, base: &Indices, t: Idx) {
        // Cluster of 1x4 points in y.
        for dy in 0..4 {
            let pt = base.offset(1, dy);
            bump(ev, &pt, t);
        }
    }

    fn def_2d(cluster_kernel: bool, pred: Option<fn(&Indices) -> bool>) -> SolutionDef {
        SolutionDef {
            name: "t".into(),
            step_dim: DimSpec::step("t"),
            domain_dims: vec![DimSpec::domain("x", 1, 1), DimSpec::domain("y", 1, 4)],
            misc_dims: vec![],
            vars: vec![VarDefn {
                name: "u".into(),
                dims: vec!["x".into(), "y".into()],
                is_scratch: false,
            }],
            bundles: vec![BundleDef {
                name: "bump".into(),
                reads: vec![ReadPattern { var: 0, step_off: 0, offsets: vec![vec![0, 0]] }],
                writes: vec![WritePattern { var: 0, step_off: 0 }],
                sub_domain: pred,
                step_cond: None,
                calc_scalar: bump,
                calc_cluster: if cluster_kernel { Some(bump_cluster) } else { None },
                fp_ops_per_point: 1,
            }],
            packs: vec![PackDef { name: "p".into(), bundles: vec![0] }],
            l1_prefetch_dist: 0,
            l2_prefetch_dist: 0,
        }
    }

    fn make_var(nx: Idx, ny: Idx) -> Var {
        let mut u = Var::new(
            "u",
            &[DimSpec::domain("x", 1, 1), DimSpec::domain("y", 1, 4)],
        )
        .unwrap();
        u.dims_mut()[0].size = nx;
        u.dims_mut()[1].size = ny;
        u.bind_storage();
        u
    }

    fn run_dispatch(
        def: &SolutionDef,
        u: &Var,
        begin: &[Idx],
        end: &[Idx],
        use_cluster: bool,
        scan_end: &[Idx],
    ) -> u64 {
        let pred = def.bundles[0].sub_domain;
        let bbs = vec![find_bounding_box(
            pred.as_ref().map(|p| p as &(dyn Fn(&Indices) -> bool + Sync)),
            &Indices::from_slice(&[0, 0]),
            &Indices::from_slice(scan_end),
            &def.vlens(),
            &def.clens(),
            2,
        )];
        let counters = WorkCounters::default();
        let info = DispatchInfo { def, bbs: &bbs, counters: &counters, use_cluster };
        // EvalVars indexes `u` through a one-element slice.
        let all = [clone_view(u)];
        let map = vec![None];
        let ev = EvalVars::new(&all, &[], &map);
        calc_sub_block(
            &info,
            &ev,
            0,
            &Indices::from_slice(begin),
            &Indices::from_slice(end),
            0,
        );
        counters.points()
    }

    // Share the var's storage in a second handle for the EvalVars slice.
    fn clone_view(u: &Var) -> Var {
        let mut v = Var::new(
            "u",
            &[DimSpec::domain("x", 1, 1), DimSpec::domain("y", 1, 4)],
        )
        .unwrap();
        v.fuse(u).unwrap();
        v
    }

    #[test]
    fn test_scalar_dispatch_each_point_once() {
        let def = def_2d(false, None);
        let u = make_var(6, 8);
        let n = run_dispatch(&def, &u, &[0, 0], &[6, 8], false, &[6, 8]);
        assert_eq!(n, 48);
        for x in 0..6 {
            for y in 0..8 {
                assert_eq!(u.read_elem(&Indices::from_slice(&[x, y]), 0), 1.0);
            }
        }
    }

    #[test]
    fn test_cluster_core_and_peel_each_point_once() {
        let def = def_2d(true, None);
        let u = make_var(6, 16);
        // A box not aligned in y forces both the cluster core and the
        // scalar peel.
        run_dispatch(&def, &u, &[1, 2], &[5, 14], true, &[6, 16]);
        for x in 0..6 {
            for y in 0..16 {
                let inside = x >= 1 && x < 5 && y >= 2 && y < 14;
                let expect = if inside { 1.0 } else { 0.0 };
                assert_eq!(
                    u.read_elem(&Indices::from_slice(&[x, y]), 0),
                    expect,
                    "at ({x},{y})"
                );
            }
        }
    }

    #[test]
    fn test_empty_bb_no_calls() {
        fn never(_: &Indices) -> bool {
            false
        }
        let def = def_2d(false, Some(never));
        let u = make_var(6, 8);
        let n = run_dispatch(&def, &u, &[0, 0], &[6, 8], false, &[6, 8]);
        assert_eq!(n, 0);
        assert_eq!(u.read_elem(&Indices::from_slice(&[3, 3]), 0), 0.0);
    }

    #[test]
    fn test_masked_dispatch_matches_ref_sweep() {
        fn tri(p: &Indices) -> bool {
            p[0] + p[1] < 6
        }
        let def = def_2d(false, Some(tri));
        let u_opt = make_var(8, 8);
        let u_ref = make_var(8, 8);
        run_dispatch(&def, &u_opt, &[0, 0], &[8, 8], false, &[8, 8]);

        // Reference sweep over the same box.
        let bbs = vec![find_bounding_box(
            Some(&tri),
            &Indices::from_slice(&[0, 0]),
            &Indices::from_slice(&[8, 8]),
            &def.vlens(),
            &def.clens(),
            2,
        )];
        let counters = WorkCounters::default();
        let info = DispatchInfo { def: &def, bbs: &bbs, counters: &counters, use_cluster: false };
        let all = [clone_view(&u_ref)];
        let ev = EvalVars::new(&all, &[], &[None]);
        calc_ref_sweep(
            &info,
            &ev,
            0,
            &Indices::from_slice(&[0, 0]),
            &Indices::from_slice(&[8, 8]),
            0,
        );

        for x in 0..8 {
            for y in 0..8 {
                let pt = Indices::from_slice(&[x, y]);
                assert_eq!(u_opt.read_elem(&pt, 0), u_ref.read_elem(&pt, 0));
            }
        }
    }

    #[test]
    fn test_scratch_offset_rewrite() {
        let def = def_2d(false, None);
        let mut s = Var::new(
            "tmp",
            &[DimSpec::domain("x", 1, 1), DimSpec::domain("y", 1, 4)],
        )
        .unwrap();
        s.is_scratch = true;
        s.dims_mut()[0].size = 4;
        s.dims_mut()[1].size = 4;
        s.bind_storage();
        let mut set = [s];
        update_scratch_offsets(&mut set, &def, &Indices::from_slice(&[10, 20]));
        // Points near the new origin now land inside the allocation.
        let pt = Indices::from_slice(&[11, 21]);
        set[0].write_elem(&pt, 0, 5.0);
        assert_eq!(set[0].read_elem(&pt, 0), 5.0);
        // And re-pointing moves the window.
        update_scratch_offsets(&mut set, &def, &Indices::from_slice(&[40, 40]));
        let pt2 = Indices::from_slice(&[41, 41]);
        set[0].write_elem(&pt2, 0, 6.0);
        assert_eq!(set[0].read_elem(&pt2, 0), 6.0);
    }
}
