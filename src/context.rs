//! The solution orchestrator: lifecycle, the rank → region → block →
//! mini-block → sub-block loop drivers, and dirty-flag bookkeeping.
//!
//! [`Solution`] owns everything built from a [`SolutionDef`]: vars,
//! settings, the rank neighborhood, tiling geometry, thread pools, and
//! the halo exchanger. `run_solution` drives the optimized path through
//! the full tile hierarchy; `run_ref` is an intentionally simple
//! scalar sweep used to validate it bit for bit.
//!
//! No global state: every driver call goes through an immutable
//! [`RunCtx`] handle assembled per run.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::bbox::{find_bounding_box, BoundingBox, BundleBB};
use crate::bundle::{EvalVars, SolutionDef};
use crate::comm::CommBackend;
use crate::dispatch::{self, DispatchInfo};
use crate::error::{HaloclineError, Result};
use crate::geometry::{self, combinations, shift_mini_block, shift_region, Geometry, MbShift};
use crate::halo::HaloExchanger;
use crate::indices::{ceil_div, DimKind, IdxTuple, Indices};
use crate::nest::{self, ScanPlan};
use crate::rank::{setup_rank, Neighborhood};
use crate::settings::Settings;
use crate::stats::{PhaseTimer, Stats, WorkCounters};
use crate::threads::{self, TeamPools};
use crate::var::Var;
use crate::Idx;

/// Which blocks a pass computes relative to the MPI interior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    All,
    Exterior,
    Interior,
}

/// One prepared stencil solution on one rank.
pub struct Solution {
    def: SolutionDef,
    pub settings: Settings,
    comm: Arc<dyn CommBackend>,
    vars: Vec<Var>,
    /// Var index -> ordinal within a scratch set, for scratch vars.
    scratch_map: Vec<Option<usize>>,
    /// Var indices of scratch prototypes, in ordinal order.
    scratch_protos: Vec<usize>,
    /// One bound scratch set per outer thread.
    scratch_sets: Vec<Mutex<Vec<Var>>>,
    /// Per-bundle evaluation-box expansion for scratch production.
    margins: Vec<(Indices, Indices)>,
    /// Recorded storage fusions: (target, source) var indices.
    fused: Vec<(usize, usize)>,
    neigh: Option<Neighborhood>,
    geom: Option<Geometry>,
    pools: Option<TeamPools>,
    exchanger: Option<HaloExchanger>,
    bbs: Vec<BundleBB>,
    pack_bbs: Vec<BoundingBox>,
    check_conds: bool,
    pub stats: Stats,
    prepared: bool,
}

/// Immutable context handle threaded through the loop drivers.
struct RunCtx<'a> {
    def: &'a SolutionDef,
    settings: &'a Settings,
    geom: &'a Geometry,
    pools: &'a TeamPools,
    vars: &'a [Var],
    scratch_map: &'a [Option<usize>],
    scratch_sets: &'a [Mutex<Vec<Var>>],
    margins: &'a [(Indices, Indices)],
    bbs: &'a [BundleBB],
    pack_bbs: &'a [BoundingBox],
    comm: &'a dyn CommBackend,
    counters: Arc<WorkCounters>,
    check_conds: bool,
    use_cluster: bool,
}

impl Solution {
    /// Build a solution from its descriptor. Sizes and tuning knobs can
    /// be adjusted through `settings` and the setters until
    /// [`Solution::prepare_solution`] binds storage.
    pub fn new(def: SolutionDef, comm: Arc<dyn CommBackend>) -> Result<Self> {
        def.validate()?;
        let ndims = def.ndims();
        let mut vars = Vec::with_capacity(def.vars.len());
        let mut scratch_map = Vec::with_capacity(def.vars.len());
        let mut scratch_protos = Vec::new();
        for vd in &def.vars {
            let specs: Vec<_> = vd
                .dims
                .iter()
                .map(|n| def.dim_spec(n).cloned())
                .collect::<Result<_>>()?;
            let mut var = Var::new(&vd.name, &specs)?;
            var.is_scratch = vd.is_scratch;
            if vd.is_scratch {
                scratch_map.push(Some(scratch_protos.len()));
                scratch_protos.push(vars.len());
            } else {
                scratch_map.push(None);
            }
            vars.push(var);
        }
        let nbundles = def.bundles.len();
        Ok(Self {
            def,
            settings: Settings::new(ndims),
            comm,
            vars,
            scratch_map,
            scratch_protos,
            scratch_sets: Vec::new(),
            margins: vec![(Indices::new(ndims, 0), Indices::new(ndims, 0)); nbundles],
            fused: Vec::new(),
            neigh: None,
            geom: None,
            pools: None,
            exchanger: None,
            bbs: Vec::new(),
            pack_bbs: Vec::new(),
            check_conds: false,
            stats: Stats::new(),
            prepared: false,
        })
    }

    pub fn def(&self) -> &SolutionDef {
        &self.def
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn neighborhood(&self) -> Option<&Neighborhood> {
        self.neigh.as_ref()
    }

    pub fn geometry(&self) -> Option<&Geometry> {
        self.geom.as_ref()
    }

    /// Read-only access to a var by name.
    pub fn var(&self, name: &str) -> Result<&Var> {
        let vi = self.def.var_index(name)?;
        Ok(&self.vars[vi])
    }

    fn domain_posn(&self, dim: &str) -> Result<usize> {
        self.def
            .domain_dim_posn(dim)
            .ok_or_else(|| HaloclineError::InvalidDim(format!("no domain dim '{dim}'")))
    }

    // ---- solution-level setters ---------------------------------------

    /// Re-run preparation when a size changes on a live solution.
    /// Storage is re-bound, so var contents reset.
    fn resync(&mut self) -> Result<()> {
        self.settings.invalidate();
        if self.prepared {
            self.prepare_solution()?;
        }
        Ok(())
    }

    pub fn set_num_ranks(&mut self, dim: &str, n: Idx) -> Result<()> {
        let d = self.domain_posn(dim)?;
        self.settings.nranks[d] = n;
        self.resync()
    }

    pub fn set_rank_index(&mut self, dim: &str, idx: Idx) -> Result<()> {
        let d = self.domain_posn(dim)?;
        let ndims = self.def.ndims();
        let ri = self.settings.rank_indices.get_or_insert_with(|| vec![0; ndims]);
        ri[d] = idx;
        self.resync()
    }

    pub fn set_rank_domain_size(&mut self, dim: &str, size: Idx) -> Result<()> {
        let d = self.domain_posn(dim)?;
        self.settings.rank_sizes[d] = size;
        self.resync()
    }

    pub fn set_region_size(&mut self, dim: &str, size: Idx) -> Result<()> {
        let d = self.domain_posn(dim)?;
        self.settings.region_sizes[d] = size;
        self.resync()
    }

    pub fn set_block_size(&mut self, dim: &str, size: Idx) -> Result<()> {
        let d = self.domain_posn(dim)?;
        self.settings.block_sizes[d] = size;
        self.resync()
    }

    pub fn set_min_pad_size(&mut self, dim: &str, size: Idx) -> Result<()> {
        let d = self.domain_posn(dim)?;
        self.settings.min_pad_sizes[d] = size;
        self.resync()
    }

    // ---- var-level setters --------------------------------------------

    pub fn set_var_halo(&mut self, var: &str, dim: &str, left: Idx, right: Idx) -> Result<()> {
        let vi = self.def.var_index(var)?;
        let p = self.vars[vi].dim_posn(dim).ok_or_else(|| {
            HaloclineError::InvalidDim(format!("var '{var}' has no dim '{dim}'"))
        })?;
        self.vars[vi].dims_mut()[p].left_halo = left;
        self.vars[vi].dims_mut()[p].right_halo = right;
        self.resync()
    }

    pub fn set_var_min_pad(&mut self, var: &str, dim: &str, pad: Idx) -> Result<()> {
        let vi = self.def.var_index(var)?;
        let p = self.vars[vi].dim_posn(dim).ok_or_else(|| {
            HaloclineError::InvalidDim(format!("var '{var}' has no dim '{dim}'"))
        })?;
        self.vars[vi].dims_mut()[p].min_pad = pad;
        self.resync()
    }

    /// Set a misc dim's index range on a var.
    pub fn set_var_misc_range(&mut self, var: &str, dim: &str, first: Idx, size: Idx) -> Result<()> {
        let vi = self.def.var_index(var)?;
        let p = self.vars[vi].dim_posn(dim).ok_or_else(|| {
            HaloclineError::InvalidDim(format!("var '{var}' has no dim '{dim}'"))
        })?;
        let vd = &mut self.vars[vi].dims_mut()[p];
        if vd.spec.kind != DimKind::Misc {
            return Err(HaloclineError::InvalidDim(format!(
                "dim '{dim}' of var '{var}' is not a misc dim"
            )));
        }
        vd.first_misc = first;
        vd.size = size;
        self.resync()
    }

    /// Fuse `target` onto `source`'s storage. Applied at each
    /// preparation after storage is bound.
    pub fn fuse_vars(&mut self, target: &str, source: &str) -> Result<()> {
        let t = self.def.var_index(target)?;
        let s = self.def.var_index(source)?;
        if t == s {
            return Err(HaloclineError::LayoutMismatch(
                "cannot fuse a var with itself".to_string(),
            ));
        }
        self.fused.push((t, s));
        self.resync()
    }

    // ---- element access -----------------------------------------------

    /// Write one element (global coordinates over the var's non-step
    /// dims). Marks the step slot dirty so the next exchange refreshes
    /// neighbors. Returns whether the point fell inside this rank's
    /// allocation.
    ///
    /// On a multi-rank run, initialize a var on every rank (even with
    /// zeros): the exchange schedule is driven by the dirty flags, and
    /// all ranks must agree on it.
    pub fn set_element(&self, var: &str, pt: &[Idx], t: Idx, v: f64) -> Result<bool> {
        let vi = self.def.var_index(var)?;
        let wrote = self.vars[vi].try_write_elem(&Indices::from_slice(pt), t, v)?;
        if wrote {
            self.vars[vi].set_dirty_step(t, true);
        }
        Ok(wrote)
    }

    pub fn get_element(&self, var: &str, pt: &[Idx], t: Idx) -> Result<Option<f64>> {
        let vi = self.def.var_index(var)?;
        self.vars[vi].try_read_elem(&Indices::from_slice(pt), t)
    }

    /// Resolve a named tuple against a var's dims: the positional point
    /// over its non-step dims plus the step index (0 when unstepped).
    fn named_point(&self, vi: usize, pt: &IdxTuple) -> Result<(Indices, Idx)> {
        let var = &self.vars[vi];
        let mut out = Indices::new(var.num_dims(), 0);
        for (p, vd) in var.dims().iter().enumerate() {
            out[p] = pt.lookup(&vd.spec.name)?;
        }
        let t = match var.step_dim() {
            Some(sd) => pt.lookup(sd)?,
            None => 0,
        };
        Ok((out, t))
    }

    /// Like [`Solution::set_element`], with the point given as a named
    /// tuple (step dim included by name for stepped vars).
    pub fn set_element_named(&self, var: &str, pt: &IdxTuple, v: f64) -> Result<bool> {
        let vi = self.def.var_index(var)?;
        let (ipt, t) = self.named_point(vi, pt)?;
        let wrote = self.vars[vi].try_write_elem(&ipt, t, v)?;
        if wrote {
            self.vars[vi].set_dirty_step(t, true);
        }
        Ok(wrote)
    }

    /// Like [`Solution::get_element`], with the point given as a named
    /// tuple.
    pub fn get_element_named(&self, var: &str, pt: &IdxTuple) -> Result<Option<f64>> {
        let vi = self.def.var_index(var)?;
        let (ipt, t) = self.named_point(vi, pt)?;
        self.vars[vi].try_read_elem(&ipt, t)
    }

    // ---- lifecycle ----------------------------------------------------

    /// Finalize sizes, set up the rank grid, bind storage, build MPI
    /// buffers and bounding boxes, and exchange initial halos.
    pub fn prepare_solution(&mut self) -> Result<()> {
        let _span = tracing::info_span!("prepare_solution", solution = %self.def.name).entered();

        self.margins = compute_margins(&self.def, &self.vars)?;
        self.accumulate_halos();

        let max_halos = self.max_halos();
        self.settings.finalize(&self.def.domain_dims)?;
        self.check_conds = self
            .settings
            .check_step_conds
            .unwrap_or_else(|| self.def.has_step_conds());

        let vlens = self.def.vlens();
        let neigh = setup_rank(
            self.comm.as_ref(),
            &self.settings.nranks,
            self.settings.rank_indices.as_deref(),
            &self.settings.rank_sizes,
            &vlens,
        )?;
        let geom = geometry::derive(
            &self.settings,
            &self.def.domain_dims,
            &max_halos,
            self.def.packs.len(),
            &neigh,
        )?;
        info!(
            rank = neigh.my_rank,
            coords = ?neigh.coords,
            neighbors = neigh.num_neighbors(),
            wf_steps = geom.wf_steps,
            tb_steps = geom.tb_steps,
            "rank established"
        );

        // Size and bind every non-scratch var; scratch prototypes get
        // region-sized extents and are instantiated per outer thread.
        for var in &mut self.vars {
            let scratch = var.is_scratch;
            for vd in var.dims_mut() {
                if vd.spec.kind != DimKind::Domain {
                    continue;
                }
                if let Some(d) = self
                    .def
                    .domain_dims
                    .iter()
                    .position(|s| s.name == vd.spec.name)
                {
                    if scratch {
                        vd.size = self.settings.region_sizes[d];
                        vd.rank_offset = 0;
                        vd.local_offset = 0;
                    } else {
                        vd.size = self.settings.rank_sizes[d];
                        vd.rank_offset = neigh.rank_domain_offset[d];
                        vd.local_offset = 0;
                        vd.left_wf_ext = geom.left_wf_exts[d];
                        vd.right_wf_ext = geom.right_wf_exts[d];
                        vd.min_pad = vd.min_pad.max(self.settings.min_pad_sizes[d]);
                    }
                }
            }
            if !scratch {
                var.bind_storage();
            }
        }
        for &(t, s) in &self.fused.clone() {
            let (tgt, src) = borrow_two(&mut self.vars, t, s);
            tgt.fuse(src)?;
        }

        let (outer, inner) = self.settings.resolved_threads();
        self.pools = Some(threads::build(outer, inner)?);
        self.scratch_sets = (0..outer)
            .map(|_| {
                let set: Vec<Var> = self
                    .scratch_protos
                    .iter()
                    .map(|&vi| {
                        let mut v = self.vars[vi].clone_unbound();
                        v.bind_storage();
                        v
                    })
                    .collect();
                Mutex::new(set)
            })
            .collect();

        // Bounding boxes are found over the wavefront-extended domain so
        // redundant overlap cells are first-class points of each bundle.
        let clens = self.def.clens();
        self.bbs = (0..self.def.bundles.len())
            .map(|bi| {
                let b = &self.def.bundles[bi];
                let (ml, mr) = &self.margins[bi];
                let begin = geom.ext_begin.sub(ml);
                let end = geom.ext_end.add(mr);
                let bb = find_bounding_box(
                    b.sub_domain
                        .as_ref()
                        .map(|p| p as &(dyn Fn(&Indices) -> bool + Sync)),
                    &begin,
                    &end,
                    &vlens,
                    &clens,
                    outer,
                );
                debug!(
                    bundle = %b.name,
                    points = bb.bb.num_points,
                    full = bb.bb.is_full,
                    sub_boxes = bb.sub_bbs.len(),
                    "bounding box"
                );
                bb
            })
            .collect();
        self.pack_bbs = self
            .def
            .packs
            .iter()
            .map(|p| {
                let mut hull = BoundingBox::empty(self.def.ndims());
                for &bi in &p.bundles {
                    let bb = &self.bbs[bi].bb;
                    if bb.is_empty() {
                        continue;
                    }
                    if hull.is_empty() {
                        hull = bb.clone();
                    } else {
                        hull = BoundingBox::from_range(
                            hull.begin.min(&bb.begin),
                            hull.end.max(&bb.end),
                        );
                    }
                }
                hull
            })
            .collect();

        let exchange_idxs = self.exchangeable_vars();
        let mut ex = HaloExchanger::new(
            &self.vars,
            &exchange_idxs,
            &self.def.domain_dims,
            &neigh,
            &geom,
            self.settings.allow_vec_exchange,
        );
        info!(
            halo_buffers = ex.num_bufs(),
            alloc_bytes = self.vars.iter().map(|v| v.num_elems() * 8).sum::<usize>(),
            "storage bound"
        );

        // Whatever the host wrote before (re)preparation travels now.
        ex.exchange(self.comm.as_ref(), &self.vars, None);
        self.exchanger = Some(ex);

        let pack_names: Vec<String> = self.def.packs.iter().map(|p| p.name.clone()).collect();
        self.stats.init_packs(&pack_names);

        self.neigh = Some(neigh);
        self.geom = Some(geom);
        self.comm.barrier();
        self.prepared = true;
        Ok(())
    }

    /// Non-scratch vars written by at least one bundle, in var order.
    fn exchangeable_vars(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for b in &self.def.bundles {
            for w in &b.writes {
                if !self.def.vars[w.var].is_scratch && !out.contains(&w.var) {
                    out.push(w.var);
                }
            }
        }
        out.sort_unstable();
        out
    }

    /// Push every bundle's read pattern into its vars' halo trackers,
    /// widening by the scratch margins where production over-extends.
    fn accumulate_halos(&mut self) {
        for (pi, pack) in self.def.packs.iter().enumerate() {
            for &bi in &pack.bundles {
                let b = &self.def.bundles[bi];
                let (ml, mr) = &self.margins[bi];
                for r in &b.reads {
                    let var = &mut self.vars[r.var];
                    for off in &r.offsets {
                        for corner in [corner_offset(off, ml, true), corner_offset(off, mr, false)]
                        {
                            let mapped = map_offsets_to_var(&self.def, var, &corner);
                            var.update_halo(pi, r.step_off, &mapped);
                        }
                    }
                }
                for w in &b.writes {
                    self.vars[w.var].note_write(pi, w.step_off);
                }
            }
        }
    }

    /// Max halo (either side, any non-scratch var) per domain dim.
    fn max_halos(&self) -> Vec<Idx> {
        let mut out = vec![0; self.def.ndims()];
        for var in &self.vars {
            if var.is_scratch {
                continue;
            }
            for vd in var.dims() {
                if let Some(d) = self
                    .def
                    .domain_dims
                    .iter()
                    .position(|s| s.name == vd.spec.name)
                {
                    out[d] = out[d].max(vd.left_halo).max(vd.right_halo);
                }
            }
        }
        out
    }

    fn run_ctx<'a>(&'a self, use_cluster: bool, counters: Arc<WorkCounters>) -> RunCtx<'a> {
        RunCtx {
            def: &self.def,
            settings: &self.settings,
            geom: self.geom.as_ref().expect("prepared solution has geometry"),
            pools: self.pools.as_ref().expect("prepared solution has pools"),
            vars: &self.vars,
            scratch_map: &self.scratch_map,
            scratch_sets: &self.scratch_sets,
            margins: &self.margins,
            bbs: &self.bbs,
            pack_bbs: &self.pack_bbs,
            comm: self.comm.as_ref(),
            counters,
            check_conds: self.check_conds,
            use_cluster,
        }
    }

    /// Run the optimized path over steps `first..=last` (either
    /// direction).
    pub fn run_solution(&mut self, first_step: Idx, last_step: Idx) -> Result<()> {
        if !self.prepared {
            return Err(HaloclineError::NotPrepared(
                "run_solution() called before prepare_solution()".to_string(),
            ));
        }
        let _span =
            tracing::info_span!("run_solution", first_step, last_step).entered();
        let mut ex = self.exchanger.take().ok_or_else(|| {
            HaloclineError::NotPrepared("halo exchanger missing".to_string())
        })?;
        let mut stats = std::mem::take(&mut self.stats);
        let res = self.run_opt(first_step, last_step, &mut ex, &mut stats);
        self.exchanger = Some(ex);
        self.stats = stats;
        res
    }

    fn run_opt(
        &self,
        first_step: Idx,
        last_step: Idx,
        ex: &mut HaloExchanger,
        stats: &mut Stats,
    ) -> Result<()> {
        let run_timer = PhaseTimer::start();
        let rc = self.run_ctx(self.settings.use_cluster, stats.counters.clone());
        let geom = rc.geom;

        let dir: Idx = if last_step >= first_step { 1 } else { -1 };
        let step_t = geom.wf_steps.max(1) * dir;
        let end_t = last_step + dir;

        let mut overlap = self.settings.overlap_comms
            && self.comm.num_ranks() > 1
            && !geom.interior.is_empty();
        if self.settings.overlap_comms && geom.wf_steps > 0 {
            warn!("exterior/interior overlap requires wf_steps == 0; running without overlap");
            overlap = false;
        }

        // Make sure the first reads see current halos.
        let ht = PhaseTimer::start();
        ex.exchange(self.comm.as_ref(), &self.vars, None);
        ht.stop_into(&mut stats.halo_time);

        let num_t = ceil_div((end_t - first_step).abs(), step_t.abs());
        for index_t in 0..num_t {
            let start_t = first_step + index_t * step_t;
            let stop_t = if dir > 0 {
                (start_t + step_t).min(end_t)
            } else {
                (start_t + step_t).max(end_t)
            };
            trace!(start_t, stop_t, "rank window");

            if geom.wf_steps == 0 {
                for pi in 0..self.def.packs.len() {
                    if rc.check_conds && !self.def.pack_is_in_valid_step(pi, start_t) {
                        continue;
                    }
                    let pack_start = Instant::now();
                    if overlap {
                        let et = PhaseTimer::start();
                        rc.calc_rank(Some(pi), start_t, stop_t, Pass::Exterior);
                        et.stop_into(&mut stats.ext_time);
                        rc.mark_dirty(Some(pi), start_t, stop_t);

                        let mut int_dur = std::time::Duration::ZERO;
                        let ht = PhaseTimer::start();
                        ex.exchange(
                            self.comm.as_ref(),
                            &self.vars,
                            Some(&mut || {
                                let t0 = Instant::now();
                                rc.calc_rank(Some(pi), start_t, stop_t, Pass::Interior);
                                int_dur += t0.elapsed();
                            }),
                        );
                        ht.stop_into(&mut stats.halo_time);
                        stats.int_time += int_dur;
                    } else {
                        rc.calc_rank(Some(pi), start_t, stop_t, Pass::All);
                        rc.mark_dirty(Some(pi), start_t, stop_t);
                        let ht = PhaseTimer::start();
                        ex.exchange(self.comm.as_ref(), &self.vars, None);
                        stats.wait_time += ht.stop_into(&mut stats.halo_time);
                    }
                    stats.packs[pi].time += pack_start.elapsed();
                }
            } else {
                rc.calc_rank(None, start_t, stop_t, Pass::All);
                rc.mark_dirty(None, start_t, stop_t);
                let ht = PhaseTimer::start();
                ex.exchange(self.comm.as_ref(), &self.vars, None);
                stats.wait_time += ht.stop_into(&mut stats.halo_time);
            }

            // Step accounting per pack, honoring step conditions.
            let this_num_t = (stop_t - start_t).abs();
            stats.steps_done += this_num_t;
            for (pi, _) in self.def.packs.iter().enumerate() {
                let n = if !rc.check_conds {
                    this_num_t
                } else {
                    let mut n = 0;
                    let mut t = start_t;
                    while t != stop_t {
                        if self.def.pack_is_in_valid_step(pi, t) {
                            n += 1;
                        }
                        t += dir;
                    }
                    n
                };
                stats.packs[pi].steps_done += n;
            }
        }

        run_timer.stop_into(&mut stats.run_time);
        Ok(())
    }

    /// Run the unblocked scalar reference path over `first..=last`.
    ///
    /// No wavefronts, no temporal blocking, no vectorization: each
    /// bundle sweeps the rank domain point by point with its sub-domain
    /// predicate checked directly. Used to validate the optimized path.
    pub fn run_ref(&mut self, first_step: Idx, last_step: Idx) -> Result<()> {
        if !self.prepared {
            return Err(HaloclineError::NotPrepared(
                "run_ref() called before prepare_solution()".to_string(),
            ));
        }
        let _span = tracing::info_span!("run_ref", first_step, last_step).entered();
        let mut ex = self.exchanger.take().ok_or_else(|| {
            HaloclineError::NotPrepared("halo exchanger missing".to_string())
        })?;
        let mut stats = std::mem::take(&mut self.stats);
        let res = self.run_ref_inner(first_step, last_step, &mut ex, &mut stats);
        self.exchanger = Some(ex);
        self.stats = stats;
        res
    }

    fn run_ref_inner(
        &self,
        first_step: Idx,
        last_step: Idx,
        ex: &mut HaloExchanger,
        stats: &mut Stats,
    ) -> Result<()> {
        let run_timer = PhaseTimer::start();
        let rc = self.run_ctx(false, stats.counters.clone());
        let geom = rc.geom;
        let ndims = self.def.ndims();
        let dir: Idx = if last_step >= first_step { 1 } else { -1 };
        let end_t = last_step + dir;

        // A rank-sized scratch set for the single whole-domain sweep.
        let ref_scratch: Vec<Var> = self
            .scratch_protos
            .iter()
            .map(|&vi| {
                let mut v = self.vars[vi].clone_unbound();
                for vd in v.dims_mut() {
                    if let Some(d) = self
                        .def
                        .domain_dims
                        .iter()
                        .position(|s| s.name == vd.spec.name)
                    {
                        vd.size = self.settings.rank_sizes[d];
                        vd.local_offset = geom.domain_begin[d];
                    }
                }
                v.bind_storage();
                v
            })
            .collect();

        let mut t = first_step;
        while t != end_t {
            for pi in 0..self.def.packs.len() {
                if rc.check_conds && !self.def.pack_is_in_valid_step(pi, t) {
                    continue;
                }
                // Refresh halos written by the previous step or pack.
                let ht = PhaseTimer::start();
                ex.exchange(self.comm.as_ref(), &self.vars, None);
                ht.stop_into(&mut stats.halo_time);

                for &bi in &self.def.packs[pi].bundles {
                    let b = &self.def.bundles[bi];
                    if rc.check_conds && !b.is_in_valid_step(t) {
                        continue;
                    }
                    let (ml, mr) = &rc.margins[bi];
                    let eb = geom.domain_begin.sub(ml);
                    let ee = geom.domain_end.add(mr);
                    let mut row_step = Indices::new(ndims, 1);
                    for d in 1..ndims {
                        row_step[d] = (ee[d] - eb[d]).max(1);
                    }
                    let plan = ScanPlan::new(eb, ee, row_step);
                    let info = rc.dinfo();
                    let ev = EvalVars::new(rc.vars, &ref_scratch, rc.scratch_map);
                    nest::scan_parallel(&rc.pools.outer, &plan, |rs, re| {
                        dispatch::calc_ref_sweep(&info, &ev, bi, rs, re, t);
                    });
                }
                rc.mark_dirty(Some(pi), t, t + dir);
            }
            stats.steps_done += 1;
            t += dir;
        }
        // Leave halos clean for whoever reads the results.
        let ht = PhaseTimer::start();
        ex.exchange(self.comm.as_ref(), &self.vars, None);
        ht.stop_into(&mut stats.halo_time);

        run_timer.stop_into(&mut stats.run_time);
        Ok(())
    }

    /// Compare every non-scratch var of two solutions element-wise over
    /// their domains and all step slots. `tol == 0.0` demands exact
    /// equality. Returns the number of mismatching elements.
    pub fn compare_data(&self, other: &Solution, tol: f64) -> Result<usize> {
        if self.def.vars.len() != other.def.vars.len() {
            return Err(HaloclineError::LayoutMismatch(
                "solutions declare different var counts".to_string(),
            ));
        }
        let mut mismatches = 0;
        for vi in 0..self.vars.len() {
            let a = &self.vars[vi];
            let b = &other.vars[vi];
            if a.is_scratch {
                continue;
            }
            let (first, last) = domain_range(a);
            for slot in 0..a.alloc_step.min(b.alloc_step) {
                let mut pt = first.clone();
                loop {
                    let va = a.read_elem(&pt, slot);
                    let vb = b.read_elem(&pt, slot);
                    let differs = if tol == 0.0 {
                        va.to_bits() != vb.to_bits()
                    } else {
                        (va - vb).abs() > tol
                    };
                    if differs {
                        mismatches += 1;
                    }
                    let mut p = pt.len();
                    let mut done = true;
                    while p > 0 {
                        p -= 1;
                        pt[p] += 1;
                        if pt[p] <= last[p] {
                            done = false;
                            break;
                        }
                        pt[p] = first[p];
                    }
                    if done {
                        break;
                    }
                }
            }
        }
        Ok(mismatches)
    }

    /// Release all storage and communication state. Only a new
    /// `prepare_solution` makes the solution runnable again.
    pub fn end_solution(&mut self) {
        for var in &mut self.vars {
            var.release_storage();
        }
        self.scratch_sets.clear();
        self.exchanger = None;
        self.pools = None;
        self.prepared = false;
    }
}

/// Inclusive domain range of a var (misc dims span their extent).
fn domain_range(var: &Var) -> (Indices, Indices) {
    let n = var.num_dims();
    let mut first = Indices::new(n, 0);
    let mut last = Indices::new(n, 0);
    for (p, vd) in var.dims().iter().enumerate() {
        match vd.spec.kind {
            DimKind::Domain => {
                first[p] = vd.rank_offset;
                last[p] = vd.rank_offset + vd.size - 1;
            }
            _ => {
                first[p] = vd.first_misc;
                last[p] = vd.first_misc + vd.size - 1;
            }
        }
    }
    (first, last)
}

/// Borrow two distinct elements of a slice mutably/immutably.
fn borrow_two(vars: &mut [Var], t: usize, s: usize) -> (&mut Var, &Var) {
    assert_ne!(t, s);
    if t < s {
        let (a, b) = vars.split_at_mut(s);
        (&mut a[t], &b[0])
    } else {
        let (a, b) = vars.split_at_mut(t);
        (&mut b[0], &a[s])
    }
}

/// A read offset widened to one corner of the margin box.
fn corner_offset(off: &[Idx], margin: &Indices, left: bool) -> Vec<Idx> {
    off.iter()
        .enumerate()
        .map(|(d, &o)| if left { o - margin[d] } else { o + margin[d] })
        .collect()
}

/// Map a solution-domain offset vector onto a var's own dims by name;
/// step and misc dims contribute zero.
fn map_offsets_to_var(def: &SolutionDef, var: &Var, off: &[Idx]) -> Vec<Idx> {
    var.dims()
        .iter()
        .map(|vd| {
            def.domain_dim_posn(&vd.spec.name)
                .map(|d| off[d])
                .unwrap_or(0)
        })
        .collect()
}

/// Per-bundle evaluation margins: a bundle that writes scratch vars must
/// over-compute them by as much as later bundles read around each point.
fn compute_margins(def: &SolutionDef, vars: &[Var]) -> Result<Vec<(Indices, Indices)>> {
    let ndims = def.ndims();
    let mut out = vec![(Indices::new(ndims, 0), Indices::new(ndims, 0)); def.bundles.len()];
    for (bi, b) in def.bundles.iter().enumerate() {
        let scratch_outs: Vec<usize> = b
            .writes
            .iter()
            .map(|w| w.var)
            .filter(|&v| vars[v].is_scratch)
            .collect();
        if scratch_outs.is_empty() {
            continue;
        }
        if b.reads.iter().any(|r| vars[r.var].is_scratch) {
            return Err(HaloclineError::Unsupported(format!(
                "bundle '{}' both reads and produces scratch vars",
                b.name
            )));
        }
        let (ml, mr) = &mut out[bi];
        for b2 in &def.bundles {
            for r in &b2.reads {
                if !scratch_outs.contains(&r.var) {
                    continue;
                }
                for off in &r.offsets {
                    for d in 0..ndims {
                        ml[d] = ml[d].max(-off[d]);
                        mr[d] = mr[d].max(off[d]);
                    }
                }
            }
        }
    }
    Ok(out)
}

impl<'a> RunCtx<'a> {
    fn dinfo(&self) -> DispatchInfo<'_> {
        DispatchInfo {
            def: self.def,
            bbs: self.bbs,
            counters: &self.counters,
            use_cluster: self.use_cluster,
        }
    }

    /// Mark the outputs of a pack (or all packs) dirty for each step of
    /// the window. Marking is conservative: every rank marks whether or
    /// not its own predicate let any write through, so all ranks agree
    /// on the exchange schedule.
    fn mark_dirty(&self, sel_pack: Option<usize>, start_t: Idx, stop_t: Idx) {
        let dir: Idx = if stop_t >= start_t { 1 } else { -1 };
        for (pi, pack) in self.def.packs.iter().enumerate() {
            if sel_pack.is_some_and(|s| s != pi) {
                continue;
            }
            let mut t = start_t;
            while t != stop_t {
                for &bi in &pack.bundles {
                    let b = &self.def.bundles[bi];
                    if self.check_conds && !b.is_in_valid_step(t) {
                        continue;
                    }
                    for w in &b.writes {
                        if !self.def.vars[w.var].is_scratch {
                            self.vars[w.var].set_dirty_step(t + w.step_off, true);
                        }
                    }
                }
                t += dir;
            }
        }
    }

    /// Sweep all regions of the rank for one step window.
    fn calc_rank(&self, sel_pack: Option<usize>, start_t: Idx, stop_t: Idx, pass: Pass) {
        let geom = self.geom;
        let ndims = self.def.ndims();
        let begin = geom.ext_begin.clone();
        let mut end = geom.ext_end.clone();
        let mut step = Indices::from_slice(&self.settings.region_sizes);
        if geom.wf_steps > 0 {
            for d in 0..ndims {
                // Regions shift left over the window, so the sweep is
                // extended right where no neighbor supplies the data.
                if geom.right_wf_exts[d] == 0 {
                    end[d] += geom.wf_shift_pts[d];
                }
                if self.settings.region_sizes[d] >= self.settings.rank_sizes[d] {
                    step[d] = (end[d] - begin[d]).max(1);
                }
            }
        }
        let plan = ScanPlan::new(begin, end, step);
        nest::scan(&plan, |rs, re| {
            self.calc_region(sel_pack, (rs, re), start_t, stop_t, pass);
        });
    }

    /// Evaluate one region over its step window, shifting per pack-step
    /// and fanning blocks out over the outer thread pool.
    fn calc_region(
        &self,
        sel_pack: Option<usize>,
        region_base: (&Indices, &Indices),
        start_t: Idx,
        stop_t: Idx,
        pass: Pass,
    ) {
        let geom = self.geom;
        let ndims = self.def.ndims();
        let dir: Idx = if stop_t >= start_t { 1 } else { -1 };
        let step_t = geom.tb_steps.max(1) * dir;
        let num_t = ceil_div((stop_t - start_t).abs(), step_t.abs());
        let nphases = (ndims + 1) as Idx;

        let mut shift_num: Idx = 0;
        for index_t in 0..num_t {
            let wstart = start_t + index_t * step_t;
            let wstop = if dir > 0 {
                (wstart + step_t).min(stop_t)
            } else {
                (wstart + step_t).max(stop_t)
            };

            if geom.tb_steps == 0 {
                for pi in 0..self.def.packs.len() {
                    if sel_pack.is_some_and(|s| s != pi) {
                        continue;
                    }
                    if self.check_conds && !self.def.pack_is_in_valid_step(pi, wstart) {
                        continue;
                    }
                    if let Some((rb, re)) = shift_region(
                        geom,
                        region_base.0,
                        region_base.1,
                        shift_num,
                        Some(&self.pack_bbs[pi]),
                    ) {
                        let bstep = self.level_stride(
                            &self.settings.block_sizes,
                            &self.settings.region_sizes,
                            &rb,
                            &re,
                        );
                        let plan = ScanPlan::new(rb.clone(), re.clone(), bstep)
                            .with_group(Indices::from_slice(&self.settings.block_group_sizes));
                        nest::scan_parallel(&self.pools.outer, &plan, |bs, be| {
                            self.calc_block(
                                Some(pi),
                                0,
                                1,
                                region_base,
                                shift_num,
                                (&rb, &re),
                                (bs, be),
                                (wstart, wstop),
                                pass,
                            );
                        });
                    }
                    shift_num += 1;
                }
            } else {
                // Temporal blocking: every pack and step of this window
                // runs inside the block tessellation. Threads
                // synchronize between phases.
                if let Some((rb, re)) =
                    shift_region(geom, region_base.0, region_base.1, shift_num, None)
                {
                    let bstep = self.level_stride(
                        &self.settings.block_sizes,
                        &self.settings.region_sizes,
                        &rb,
                        &re,
                    );
                    let plan = ScanPlan::new(rb.clone(), re.clone(), bstep)
                        .with_group(Indices::from_slice(&self.settings.block_group_sizes));
                    for phase in 0..nphases {
                        nest::scan_parallel(&self.pools.outer, &plan, |bs, be| {
                            self.calc_block(
                                None,
                                phase,
                                nphases,
                                region_base,
                                shift_num,
                                (&rb, &re),
                                (bs, be),
                                (wstart, wstop),
                                pass,
                            );
                        });
                    }
                }
                // One shift per valid pack per step of the window.
                let mut t = wstart;
                while t != wstop {
                    for pi in 0..self.def.packs.len() {
                        if !self.check_conds || self.def.pack_is_in_valid_step(pi, t) {
                            shift_num += 1;
                        }
                    }
                    t += dir;
                }
            }
        }
    }

    /// Stride for a tiling level: a level at least as large as its
    /// parent covers the whole extent in that dim.
    fn level_stride(
        &self,
        sizes: &[Idx],
        parent_sizes: &[Idx],
        begin: &Indices,
        end: &Indices,
    ) -> Indices {
        Indices(
            (0..begin.len())
                .map(|d| {
                    if sizes[d] >= parent_sizes[d] {
                        (end[d] - begin[d]).max(1)
                    } else {
                        sizes[d]
                    }
                })
                .collect(),
        )
    }

    /// Evaluate one block: classify it against the MPI interior, then
    /// walk its mini-blocks (for the current tessellation phase when
    /// temporal blocking is on).
    #[allow(clippy::too_many_arguments)]
    fn calc_block(
        &self,
        sel_pack: Option<usize>,
        phase: Idx,
        nphases: Idx,
        region_base: (&Indices, &Indices),
        region_shift_base: Idx,
        region_window: (&Indices, &Indices),
        block_box: (&Indices, &Indices),
        window: (Idx, Idx),
        pass: Pass,
    ) {
        let geom = self.geom;
        if pass != Pass::All {
            // A block even partially outside the interior counts as
            // exterior.
            let inside = geom.interior.contains_range(block_box.0, block_box.1);
            match pass {
                Pass::Interior if !inside => return,
                Pass::Exterior if inside => return,
                _ => {}
            }
        }

        let ti = rayon::current_thread_index().unwrap_or(0);
        let mut scratch = self.scratch_sets[ti]
            .lock()
            .expect("scratch set lock poisoned");

        if nphases == 1 {
            let mstep = self.level_stride(
                &self.settings.mini_block_sizes,
                &self.settings.block_sizes,
                block_box.0,
                block_box.1,
            );
            let plan = ScanPlan::new(block_box.0.clone(), block_box.1.clone(), mstep)
                .with_group(Indices::from_slice(&self.settings.mini_block_group_sizes));
            nest::scan(&plan, |ms, me| {
                self.calc_mini_block(
                    &mut scratch,
                    sel_pack,
                    phase,
                    nphases,
                    &[],
                    region_base,
                    region_shift_base,
                    region_window,
                    block_box,
                    block_box,
                    (ms, me),
                    window,
                    pass,
                );
            });
            return;
        }

        // Temporal blocking: shapes extend right up to the width of the
        // block, so the scan range is doubled and each mini-block is
        // trimmed to its active shape per step.
        let mut adj_end = block_box.1.clone();
        for d in 0..adj_end.len() {
            adj_end[d] += block_box.1[d] - block_box.0[d];
        }
        let mstep = self.level_stride(
            &self.settings.mini_block_sizes,
            &self.settings.block_sizes,
            block_box.0,
            &adj_end,
        );
        for dims_to_bridge in combinations(self.def.ndims(), phase as usize) {
            let plan = ScanPlan::new(block_box.0.clone(), adj_end.clone(), mstep.clone())
                .with_group(Indices::from_slice(&self.settings.mini_block_group_sizes));
            nest::scan(&plan, |ms, me| {
                self.calc_mini_block(
                    &mut scratch,
                    sel_pack,
                    phase,
                    nphases,
                    &dims_to_bridge,
                    region_base,
                    region_shift_base,
                    region_window,
                    block_box,
                    (block_box.0, &adj_end),
                    (ms, me),
                    window,
                    pass,
                );
            });
        }
    }

    /// Evaluate one mini-block: loop time and packs, place the shape for
    /// this phase and shift, and fan sub-blocks out over the inner pool.
    #[allow(clippy::too_many_arguments)]
    fn calc_mini_block(
        &self,
        scratch: &mut Vec<Var>,
        sel_pack: Option<usize>,
        phase: Idx,
        nphases: Idx,
        dims_to_bridge: &[usize],
        region_base: (&Indices, &Indices),
        region_shift_base: Idx,
        region_window: (&Indices, &Indices),
        block_base: (&Indices, &Indices),
        adj_block_base: (&Indices, &Indices),
        mb_box: (&Indices, &Indices),
        window: (Idx, Idx),
        pass: Pass,
    ) {
        let geom = self.geom;
        // Keep MPI progressing while only interior blocks compute.
        if pass == Pass::Interior && rayon::current_thread_index() == Some(0) {
            self.comm.test_progress();
        }

        let dir: Idx = if window.1 >= window.0 { 1 } else { -1 };
        let mut rel_shift: Idx = 0;
        let mut t = window.0;
        while t != window.1 {
            for pi in 0..self.def.packs.len() {
                if sel_pack.is_some_and(|s| s != pi) {
                    continue;
                }
                if self.check_conds && !self.def.pack_is_in_valid_step(pi, t) {
                    continue;
                }
                let args = MbShift {
                    region_base,
                    region_window,
                    block_base,
                    adj_block_base,
                    mb_base: mb_box,
                    region_shift_num: region_shift_base + rel_shift,
                    tile_shift_num: rel_shift,
                    nphases,
                    phase,
                    dims_to_bridge,
                    trim_bb: Some(&self.pack_bbs[pi]),
                };
                if let Some((mb, me)) = shift_mini_block(geom, &args) {
                    dispatch::update_scratch_offsets(scratch, self.def, &mb);
                    for &bi in &self.def.packs[pi].bundles {
                        let b = &self.def.bundles[bi];
                        if self.check_conds && !b.is_in_valid_step(t) {
                            continue;
                        }
                        let (ml, mr) = &self.margins[bi];
                        let eb = mb.sub(ml);
                        let ee = me.add(mr);
                        let sstep = self.level_stride(
                            &self.settings.sub_block_sizes,
                            &self.settings.mini_block_sizes,
                            &eb,
                            &ee,
                        );
                        let plan = ScanPlan::new(eb, ee, sstep).with_group(
                            Indices::from_slice(&self.settings.sub_block_group_sizes),
                        );
                        let info = self.dinfo();
                        let ev = EvalVars::new(self.vars, scratch, self.scratch_map);
                        nest::scan_parallel(&self.pools.inner, &plan, |ss, se| {
                            dispatch::calc_sub_block(&info, &ev, bi, ss, se, t);
                        });
                    }
                }
                rel_shift += 1;
            }
            t += dir;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleProcessComm;
    use crate::samples;

    #[test]
    fn test_run_before_prepare_fails() {
        let def = samples::diffusion_1d();
        let mut soln = Solution::new(def, Arc::new(SingleProcessComm)).unwrap();
        assert!(matches!(
            soln.run_solution(0, 1),
            Err(HaloclineError::NotPrepared(_))
        ));
    }

    #[test]
    fn test_prepare_and_element_round_trip() {
        let def = samples::diffusion_1d();
        let mut soln = Solution::new(def, Arc::new(SingleProcessComm)).unwrap();
        soln.settings.rank_sizes = vec![32];
        soln.prepare_solution().unwrap();
        assert!(soln.set_element("u", &[5], 0, 2.5).unwrap());
        assert_eq!(soln.get_element("u", &[5], 0).unwrap(), Some(2.5));
        // Outside the allocation: not written.
        assert!(!soln.set_element("u", &[1000], 0, 1.0).unwrap());
    }

    #[test]
    fn test_end_solution_releases() {
        let def = samples::diffusion_1d();
        let mut soln = Solution::new(def, Arc::new(SingleProcessComm)).unwrap();
        soln.settings.rank_sizes = vec![32];
        soln.prepare_solution().unwrap();
        soln.end_solution();
        assert!(!soln.is_prepared());
        assert!(matches!(
            soln.run_solution(0, 1),
            Err(HaloclineError::NotPrepared(_))
        ));
        assert!(matches!(
            soln.get_element("u", &[5], 0),
            Err(HaloclineError::NoStorage(_))
        ));
    }

    #[test]
    fn test_single_step_diffusion_interior_value() {
        let def = samples::diffusion_1d();
        let mut soln = Solution::new(def, Arc::new(SingleProcessComm)).unwrap();
        soln.settings.rank_sizes = vec![64];
        soln.prepare_solution().unwrap();
        for i in 0..64 {
            soln.set_element("u", &[i], 0, i as f64).unwrap();
        }
        soln.run_solution(0, 0).unwrap();
        // u'[i] = 0.5*u[i] + 0.25*(u[i-1] + u[i+1]) = i on a ramp.
        let v = soln.get_element("u", &[32], 1).unwrap().unwrap();
        assert_eq!(v, 32.0);
        // The edge loses mass to the zero halo cell.
        let v0 = soln.get_element("u", &[0], 1).unwrap().unwrap();
        assert_eq!(v0, 0.25);
    }
}
