//! Built-in sample solutions.
//!
//! These descriptor tables play the role the stencil code generator
//! plays in production: fixed dims, vars, access patterns, and kernel
//! entry points. The CLI runs them; the tests use them to pin the
//! optimized path against the reference path.

use crate::bundle::{
    BundleDef, EvalVars, PackDef, ReadPattern, SolutionDef, VarDefn, WritePattern,
};
use crate::indices::{DimSpec, Indices};
use crate::Idx;

const U: usize = 0;
const TMP: usize = 1;

fn diffusion_scalar(ev: &EvalVars<'_>, pt: &Indices, t: Idx) {
    let u = ev.var(U);
    let c = u.read_elem(pt, t);
    let l = u.read_elem(&pt.offset(0, -1), t);
    let r = u.read_elem(&pt.offset(0, 1), t);
    u.write_elem(pt, t + 1, 0.5 * c + 0.25 * (l + r));
}

/// 1-D three-point diffusion: `u'[i] = 0.5 u[i] + 0.25 (u[i-1] + u[i+1])`.
pub fn diffusion_1d() -> SolutionDef {
    SolutionDef {
        name: "diffusion_1d".to_string(),
        step_dim: DimSpec::step("t"),
        domain_dims: vec![DimSpec::domain("x", 1, 1)],
        misc_dims: vec![],
        vars: vec![VarDefn {
            name: "u".to_string(),
            dims: vec!["t".to_string(), "x".to_string()],
            is_scratch: false,
        }],
        bundles: vec![BundleDef {
            name: "diffuse".to_string(),
            reads: vec![ReadPattern {
                var: U,
                step_off: 0,
                offsets: vec![vec![-1], vec![0], vec![1]],
            }],
            writes: vec![WritePattern { var: U, step_off: 1 }],
            sub_domain: None,
            step_cond: None,
            calc_scalar: diffusion_scalar,
            calc_cluster: None,
            fp_ops_per_point: 4,
        }],
        packs: vec![PackDef { name: "diffuse".to_string(), bundles: vec![0] }],
        l1_prefetch_dist: 0,
        l2_prefetch_dist: 0,
    }
}

fn heat_scalar(ev: &EvalVars<'_>, pt: &Indices, t: Idx) {
    let u = ev.var(U);
    let c = u.read_elem(pt, t);
    let n = u.read_elem(&pt.offset(0, -1), t);
    let s = u.read_elem(&pt.offset(0, 1), t);
    let w = u.read_elem(&pt.offset(1, -1), t);
    let e = u.read_elem(&pt.offset(1, 1), t);
    u.write_elem(pt, t + 1, 0.5 * c + 0.125 * (n + s + w + e));
}

fn heat_cluster(ev: &EvalVars<'_>, base: &Indices, t: Idx) {
    // One cluster is two points along y, evaluated in scalar order so
    // the cluster path stays bit-identical to the scalar path.
    for dy in 0..2 {
        heat_scalar(ev, &base.offset(1, dy), t);
    }
}

/// 2-D five-point smoothing stencil with a 1x2 cluster in `y`:
/// `u' = 0.5 u + 0.125 (u_n + u_s + u_w + u_e)`.
pub fn heat_2d() -> SolutionDef {
    SolutionDef {
        name: "heat_2d".to_string(),
        step_dim: DimSpec::step("t"),
        domain_dims: vec![DimSpec::domain("x", 1, 1), DimSpec::domain("y", 1, 2)],
        misc_dims: vec![],
        vars: vec![VarDefn {
            name: "u".to_string(),
            dims: vec!["t".to_string(), "x".to_string(), "y".to_string()],
            is_scratch: false,
        }],
        bundles: vec![BundleDef {
            name: "heat".to_string(),
            reads: vec![ReadPattern {
                var: U,
                step_off: 0,
                offsets: vec![vec![0, 0], vec![-1, 0], vec![1, 0], vec![0, -1], vec![0, 1]],
            }],
            writes: vec![WritePattern { var: U, step_off: 1 }],
            sub_domain: None,
            step_cond: None,
            calc_scalar: heat_scalar,
            calc_cluster: Some(heat_cluster),
            fp_ops_per_point: 7,
        }],
        packs: vec![PackDef { name: "heat".to_string(), bundles: vec![0] }],
        l1_prefetch_dist: 0,
        l2_prefetch_dist: 0,
    }
}

fn row_mean(ev: &EvalVars<'_>, pt: &Indices, t: Idx) -> f64 {
    let u = ev.var(U);
    let l = u.read_elem(&pt.offset(0, -1), t);
    let c = u.read_elem(pt, t);
    let r = u.read_elem(&pt.offset(0, 1), t);
    (l + c + r) / 3.0
}

fn stage_x(ev: &EvalVars<'_>, pt: &Indices, t: Idx) {
    ev.var(TMP).write_elem(pt, 0, row_mean(ev, pt, t));
}

fn stage_y(ev: &EvalVars<'_>, pt: &Indices, t: Idx) {
    let tmp = ev.var(TMP);
    let a = tmp.read_elem(&pt.offset(1, -1), 0);
    let b = tmp.read_elem(pt, 0);
    let c = tmp.read_elem(&pt.offset(1, 1), 0);
    ev.var(U).write_elem(pt, t + 1, (a + b + c) / 3.0);
}

fn box_mean_direct(ev: &EvalVars<'_>, pt: &Indices, t: Idx) {
    // Same association order as the staged pipeline.
    let a = row_mean(ev, &pt.offset(1, -1), t);
    let b = row_mean(ev, pt, t);
    let c = row_mean(ev, &pt.offset(1, 1), t);
    ev.var(U).write_elem(pt, t + 1, (a + b + c) / 3.0);
}

/// 3x3 box smoothing computed in two separable stages through a
/// thread-private scratch var.
pub fn smooth_2d_staged() -> SolutionDef {
    SolutionDef {
        name: "smooth_2d_staged".to_string(),
        step_dim: DimSpec::step("t"),
        domain_dims: vec![DimSpec::domain("x", 1, 1), DimSpec::domain("y", 1, 1)],
        misc_dims: vec![],
        vars: vec![
            VarDefn {
                name: "u".to_string(),
                dims: vec!["t".to_string(), "x".to_string(), "y".to_string()],
                is_scratch: false,
            },
            VarDefn {
                name: "row_avg".to_string(),
                dims: vec!["x".to_string(), "y".to_string()],
                is_scratch: true,
            },
        ],
        bundles: vec![
            BundleDef {
                name: "avg_x".to_string(),
                reads: vec![ReadPattern {
                    var: U,
                    step_off: 0,
                    offsets: vec![vec![-1, 0], vec![0, 0], vec![1, 0]],
                }],
                writes: vec![WritePattern { var: TMP, step_off: 0 }],
                sub_domain: None,
                step_cond: None,
                calc_scalar: stage_x,
                calc_cluster: None,
                fp_ops_per_point: 3,
            },
            BundleDef {
                name: "avg_y".to_string(),
                reads: vec![ReadPattern {
                    var: TMP,
                    step_off: 0,
                    offsets: vec![vec![0, -1], vec![0, 0], vec![0, 1]],
                }],
                writes: vec![WritePattern { var: U, step_off: 1 }],
                sub_domain: None,
                step_cond: None,
                calc_scalar: stage_y,
                calc_cluster: None,
                fp_ops_per_point: 3,
            },
        ],
        packs: vec![PackDef { name: "smooth".to_string(), bundles: vec![0, 1] }],
        l1_prefetch_dist: 0,
        l2_prefetch_dist: 0,
    }
}

/// The same 3x3 box smoothing fused into one bundle; the staged and
/// direct forms must agree bit for bit.
pub fn smooth_2d_direct() -> SolutionDef {
    SolutionDef {
        name: "smooth_2d_direct".to_string(),
        step_dim: DimSpec::step("t"),
        domain_dims: vec![DimSpec::domain("x", 1, 1), DimSpec::domain("y", 1, 1)],
        misc_dims: vec![],
        vars: vec![VarDefn {
            name: "u".to_string(),
            dims: vec!["t".to_string(), "x".to_string(), "y".to_string()],
            is_scratch: false,
        }],
        bundles: vec![BundleDef {
            name: "smooth".to_string(),
            reads: vec![ReadPattern {
                var: U,
                step_off: 0,
                offsets: vec![
                    vec![-1, -1],
                    vec![0, -1],
                    vec![1, -1],
                    vec![-1, 0],
                    vec![0, 0],
                    vec![1, 0],
                    vec![-1, 1],
                    vec![0, 1],
                    vec![1, 1],
                ],
            }],
            writes: vec![WritePattern { var: U, step_off: 1 }],
            sub_domain: None,
            step_cond: None,
            calc_scalar: box_mean_direct,
            calc_cluster: None,
            fp_ops_per_point: 11,
        }],
        packs: vec![PackDef { name: "smooth".to_string(), bundles: vec![0] }],
        l1_prefetch_dist: 0,
        l2_prefetch_dist: 0,
    }
}
