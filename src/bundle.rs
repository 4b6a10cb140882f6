//! Solution descriptors: the contract between the runtime and the code
//! that supplies stencil kernels.
//!
//! A code generator (or a hand-written sample) emits one
//! [`SolutionDef`]: dimension specs, var declarations, bundle
//! descriptors with their access patterns and entry points, and the
//! pack grouping that fixes evaluation order within a time step. The
//! runtime only ever calls kernels through the plain function pointers
//! in the tables; vars are addressed by dense indices into the var list.

use crate::error::{HaloclineError, Result};
use crate::indices::{DimKind, DimSpec, Indices};
use crate::var::Var;
use crate::Idx;

/// Scalar or cluster entry point: evaluate one output point (or one
/// cluster of points starting at the given base) for step `t`.
pub type KernelFn = fn(&EvalVars<'_>, &Indices, Idx);

/// Valid-domain predicate over global domain coordinates.
pub type DomainPredFn = fn(&Indices) -> bool;

/// Step condition: whether a bundle applies at step `t`.
pub type StepCondFn = fn(Idx) -> bool;

/// One input var of a bundle: the step offset read and the spatial
/// read-offset points (per domain dim, signed) relative to the output
/// point. Halos are accumulated from these during preparation.
#[derive(Debug, Clone)]
pub struct ReadPattern {
    pub var: usize,
    pub step_off: Idx,
    pub offsets: Vec<Vec<Idx>>,
}

/// One output var of a bundle and the step offset it writes.
#[derive(Debug, Clone)]
pub struct WritePattern {
    pub var: usize,
    pub step_off: Idx,
}

/// One evaluable stencil bundle.
pub struct BundleDef {
    pub name: String,
    pub reads: Vec<ReadPattern>,
    pub writes: Vec<WritePattern>,
    pub sub_domain: Option<DomainPredFn>,
    pub step_cond: Option<StepCondFn>,
    pub calc_scalar: KernelFn,
    /// Optional vectorized entry point covering one cluster per call.
    pub calc_cluster: Option<KernelFn>,
    /// Estimated floating-point operations per output point.
    pub fp_ops_per_point: u64,
}

impl BundleDef {
    /// Whether this bundle applies at step `t`.
    pub fn is_in_valid_step(&self, t: Idx) -> bool {
        self.step_cond.map(|c| c(t)).unwrap_or(true)
    }

    /// Element reads issued per output point.
    pub fn reads_per_point(&self) -> u64 {
        self.reads.iter().map(|r| r.offsets.len() as u64).sum()
    }
}

/// An ordered group of bundles evaluated together at each step.
#[derive(Debug, Clone)]
pub struct PackDef {
    pub name: String,
    pub bundles: Vec<usize>,
}

/// A var declaration: which dims it spans (by name) and whether it is a
/// thread-private scratch intermediate.
#[derive(Debug, Clone)]
pub struct VarDefn {
    pub name: String,
    pub dims: Vec<String>,
    pub is_scratch: bool,
}

/// The full compile-time contract for one solution.
pub struct SolutionDef {
    pub name: String,
    pub step_dim: DimSpec,
    pub domain_dims: Vec<DimSpec>,
    pub misc_dims: Vec<DimSpec>,
    pub vars: Vec<VarDefn>,
    pub bundles: Vec<BundleDef>,
    pub packs: Vec<PackDef>,
    /// Prefetch distances from the generator; informational.
    pub l1_prefetch_dist: Idx,
    pub l2_prefetch_dist: Idx,
}

impl SolutionDef {
    pub fn ndims(&self) -> usize {
        self.domain_dims.len()
    }

    pub fn var_index(&self, name: &str) -> Result<usize> {
        self.vars
            .iter()
            .position(|v| v.name == name)
            .ok_or_else(|| HaloclineError::InvalidDim(format!("no var named '{name}'")))
    }

    /// Resolve a declared dim name to its spec.
    pub fn dim_spec(&self, name: &str) -> Result<&DimSpec> {
        if self.step_dim.name == name {
            return Ok(&self.step_dim);
        }
        self.domain_dims
            .iter()
            .chain(self.misc_dims.iter())
            .find(|d| d.name == name)
            .ok_or_else(|| HaloclineError::InvalidDim(format!("no dim named '{name}'")))
    }

    pub fn domain_dim_posn(&self, name: &str) -> Option<usize> {
        self.domain_dims.iter().position(|d| d.name == name)
    }

    pub fn vlens(&self) -> Vec<Idx> {
        self.domain_dims.iter().map(|d| d.vlen).collect()
    }

    pub fn clens(&self) -> Vec<Idx> {
        self.domain_dims.iter().map(|d| d.clen).collect()
    }

    /// A pack applies at `t` when any of its bundles does; the
    /// dispatcher re-checks each bundle precisely.
    pub fn pack_is_in_valid_step(&self, pack: usize, t: Idx) -> bool {
        self.packs[pack]
            .bundles
            .iter()
            .any(|&b| self.bundles[b].is_in_valid_step(t))
    }

    /// Whether any bundle declares a step condition.
    pub fn has_step_conds(&self) -> bool {
        self.bundles.iter().any(|b| b.step_cond.is_some())
    }

    /// Structural checks, run once when a solution is built.
    pub fn validate(&self) -> Result<()> {
        if self.step_dim.kind != DimKind::Step {
            return Err(HaloclineError::InvalidDim(
                "step dim must have kind Step".to_string(),
            ));
        }
        for d in &self.domain_dims {
            if d.kind != DimKind::Domain {
                return Err(HaloclineError::InvalidDim(format!(
                    "dim '{}' listed as domain but is not",
                    d.name
                )));
            }
        }
        for v in &self.vars {
            for dn in &v.dims {
                self.dim_spec(dn)?;
            }
        }
        for b in &self.bundles {
            for r in &b.reads {
                if r.var >= self.vars.len() {
                    return Err(HaloclineError::InvalidDim(format!(
                        "bundle '{}' reads unknown var index {}",
                        b.name, r.var
                    )));
                }
                for o in &r.offsets {
                    if o.len() != self.ndims() {
                        return Err(HaloclineError::InvalidDim(format!(
                            "bundle '{}' read offset has {} dims, expected {}",
                            b.name,
                            o.len(),
                            self.ndims()
                        )));
                    }
                }
            }
            for w in &b.writes {
                if w.var >= self.vars.len() {
                    return Err(HaloclineError::InvalidDim(format!(
                        "bundle '{}' writes unknown var index {}",
                        b.name, w.var
                    )));
                }
            }
            if b.writes.is_empty() {
                return Err(HaloclineError::Unsupported(format!(
                    "bundle '{}' writes nothing",
                    b.name
                )));
            }
        }
        let mut seen = vec![false; self.bundles.len()];
        for p in &self.packs {
            for &b in &p.bundles {
                if b >= self.bundles.len() {
                    return Err(HaloclineError::InvalidDim(format!(
                        "pack '{}' lists unknown bundle index {b}",
                        p.name
                    )));
                }
                if seen[b] {
                    return Err(HaloclineError::Unsupported(format!(
                        "bundle index {b} appears in more than one pack"
                    )));
                }
                seen[b] = true;
            }
        }
        Ok(())
    }
}

/// The var view a kernel evaluates against: the solution's vars with
/// this thread's scratch instances overlaid.
pub struct EvalVars<'a> {
    vars: &'a [Var],
    scratch: &'a [Var],
    scratch_map: &'a [Option<usize>],
}

impl<'a> EvalVars<'a> {
    pub fn new(vars: &'a [Var], scratch: &'a [Var], scratch_map: &'a [Option<usize>]) -> Self {
        Self { vars, scratch, scratch_map }
    }

    /// Var by its dense index in the solution descriptor.
    #[inline]
    pub fn var(&self, idx: usize) -> &Var {
        match self.scratch_map[idx] {
            Some(k) => &self.scratch[k],
            None => &self.vars[idx],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_kernel(_: &EvalVars<'_>, _: &Indices, _: Idx) {}

    fn minimal_def() -> SolutionDef {
        SolutionDef {
            name: "test".to_string(),
            step_dim: DimSpec::step("t"),
            domain_dims: vec![DimSpec::domain("x", 1, 1)],
            misc_dims: vec![],
            vars: vec![VarDefn {
                name: "u".to_string(),
                dims: vec!["t".to_string(), "x".to_string()],
                is_scratch: false,
            }],
            bundles: vec![BundleDef {
                name: "b".to_string(),
                reads: vec![ReadPattern { var: 0, step_off: 0, offsets: vec![vec![0]] }],
                writes: vec![WritePattern { var: 0, step_off: 1 }],
                sub_domain: None,
                step_cond: None,
                calc_scalar: dummy_kernel,
                calc_cluster: None,
                fp_ops_per_point: 1,
            }],
            packs: vec![PackDef { name: "p".to_string(), bundles: vec![0] }],
            l1_prefetch_dist: 0,
            l2_prefetch_dist: 0,
        }
    }

    #[test]
    fn test_validate_ok() {
        minimal_def().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_var_index() {
        let mut def = minimal_def();
        def.bundles[0].reads[0].var = 9;
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_pack_membership() {
        let mut def = minimal_def();
        def.packs.push(PackDef { name: "p2".to_string(), bundles: vec![0] });
        assert!(matches!(
            def.validate(),
            Err(HaloclineError::Unsupported(_))
        ));
    }

    #[test]
    fn test_step_conditions() {
        let mut def = minimal_def();
        assert!(def.pack_is_in_valid_step(0, 0));
        assert!(!def.has_step_conds());
        def.bundles[0].step_cond = Some(|t| t % 2 == 0);
        assert!(def.has_step_conds());
        assert!(def.pack_is_in_valid_step(0, 4));
        assert!(!def.pack_is_in_valid_step(0, 5));
    }
}
