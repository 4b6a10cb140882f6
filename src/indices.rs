//! Named dimensions, ordered index tuples, and dense index vectors.
//!
//! Two representations coexist on purpose. [`IdxTuple`] is an
//! insertion-ordered name→value mapping used at the public API boundary
//! and in diagnostics, where dimension names matter. [`Indices`] is a
//! dense vector indexed by a per-solution dimension ordinal, used on hot
//! paths where a name lookup per point would be prohibitive.

use crate::error::{HaloclineError, Result};
use crate::Idx;

/// What a dimension means to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimKind {
    /// The time-like axis. Exactly one per solution; storage is cyclic.
    Step,
    /// A spatial axis, iterated by the loop hierarchy.
    Domain,
    /// A non-iterated parameter axis (e.g. a component index).
    Misc,
}

/// One named axis with its vector-fold and cluster granularities.
///
/// `vlen` is the SIMD fold length along this axis; `clen` is the cluster
/// length at which domain sizes are aligned. Both are fixed after the
/// solution descriptor is built and only meaningful for `Domain` dims.
#[derive(Debug, Clone)]
pub struct DimSpec {
    pub name: String,
    pub kind: DimKind,
    pub vlen: Idx,
    pub clen: Idx,
}

impl DimSpec {
    pub fn step(name: &str) -> Self {
        Self { name: name.to_string(), kind: DimKind::Step, vlen: 1, clen: 1 }
    }

    pub fn domain(name: &str, vlen: Idx, clen: Idx) -> Self {
        assert!(vlen >= 1 && clen >= vlen && clen % vlen == 0);
        Self { name: name.to_string(), kind: DimKind::Domain, vlen, clen }
    }

    pub fn misc(name: &str) -> Self {
        Self { name: name.to_string(), kind: DimKind::Misc, vlen: 1, clen: 1 }
    }
}

/// Round `v` up to the next multiple of `m`.
#[inline]
pub fn round_up(v: Idx, m: Idx) -> Idx {
    debug_assert!(m > 0);
    v.div_euclid(m) * m + if v.rem_euclid(m) != 0 { m } else { 0 }
}

/// Ceiling division for positive divisors.
#[inline]
pub fn ceil_div(a: Idx, b: Idx) -> Idx {
    debug_assert!(b > 0);
    (a + b - 1).div_euclid(b)
}

/// An ordered mapping from dimension name to a signed value.
///
/// Preserves insertion order; all iteration is deterministic. Lookups are
/// linear, which is fine at the API boundary where tuples have a handful
/// of entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdxTuple {
    entries: Vec<(String, Idx)>,
}

impl IdxTuple {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Build a tuple with the given names, all values zero.
    pub fn with_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self { entries: names.into_iter().map(|n| (n.to_string(), 0)).collect() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a dimension. Panics if the name already exists.
    pub fn add_dim_back(&mut self, name: &str, val: Idx) {
        assert!(
            self.position(name).is_none(),
            "duplicate dimension '{name}'"
        );
        self.entries.push((name.to_string(), val));
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<Idx> {
        self.position(name).map(|i| self.entries[i].1)
    }

    /// Value of the named dimension, or `InvalidDim`.
    pub fn lookup(&self, name: &str) -> Result<Idx> {
        self.get(name)
            .ok_or_else(|| HaloclineError::InvalidDim(format!("no dimension '{name}' in tuple")))
    }

    pub fn set_val(&mut self, name: &str, val: Idx) -> Result<()> {
        match self.position(name) {
            Some(i) => {
                self.entries[i].1 = val;
                Ok(())
            }
            None => Err(HaloclineError::InvalidDim(format!(
                "no dimension '{name}' in tuple"
            ))),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn vals(&self) -> impl Iterator<Item = Idx> + '_ {
        self.entries.iter().map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Idx)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    /// Product of all values.
    pub fn product(&self) -> Idx {
        self.entries.iter().map(|(_, v)| *v).product()
    }

    fn zip_with(&self, other: &IdxTuple, f: impl Fn(Idx, Idx) -> Idx) -> Result<IdxTuple> {
        let mut out = self.clone();
        for (name, v) in &mut out.entries {
            let o = other.lookup(name)?;
            *v = f(*v, o);
        }
        Ok(out)
    }

    pub fn add(&self, other: &IdxTuple) -> Result<IdxTuple> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &IdxTuple) -> Result<IdxTuple> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &IdxTuple) -> Result<IdxTuple> {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn min(&self, other: &IdxTuple) -> Result<IdxTuple> {
        self.zip_with(other, Idx::min)
    }

    pub fn max(&self, other: &IdxTuple) -> Result<IdxTuple> {
        self.zip_with(other, Idx::max)
    }

    /// Round each value up to the matching multiple in `multiples`.
    pub fn round_up(&self, multiples: &IdxTuple) -> Result<IdxTuple> {
        self.zip_with(multiples, round_up)
    }

    /// Visit every point of the space whose per-dim sizes are this
    /// tuple's values, in row-major order (last dim fastest). The
    /// callback returns `false` to stop early.
    pub fn visit_all_points(&self, mut cb: impl FnMut(&IdxTuple) -> bool) {
        if self.entries.iter().any(|(_, v)| *v <= 0) {
            return;
        }
        let mut pt = self.clone();
        for (_, v) in &mut pt.entries {
            *v = 0;
        }
        loop {
            if !cb(&pt) {
                return;
            }
            // Odometer increment, last dim fastest.
            let mut d = self.entries.len();
            loop {
                if d == 0 {
                    return;
                }
                d -= 1;
                pt.entries[d].1 += 1;
                if pt.entries[d].1 < self.entries[d].1 {
                    break;
                }
                pt.entries[d].1 = 0;
            }
        }
    }
}

/// A dense index vector over a solution's domain dims, in ordinal order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indices(pub Vec<Idx>);

impl Indices {
    pub fn new(ndims: usize, val: Idx) -> Self {
        Self(vec![val; ndims])
    }

    pub fn from_slice(vals: &[Idx]) -> Self {
        Self(vals.to_vec())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy with one element displaced.
    pub fn offset(&self, dim: usize, delta: Idx) -> Indices {
        let mut out = self.clone();
        out.0[dim] += delta;
        out
    }

    pub fn product(&self) -> Idx {
        self.0.iter().product()
    }

    fn zip_with(&self, other: &Indices, f: impl Fn(Idx, Idx) -> Idx) -> Indices {
        debug_assert_eq!(self.len(), other.len());
        Indices(self.0.iter().zip(&other.0).map(|(&a, &b)| f(a, b)).collect())
    }

    pub fn add(&self, other: &Indices) -> Indices {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Indices) -> Indices {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn min(&self, other: &Indices) -> Indices {
        self.zip_with(other, Idx::min)
    }

    pub fn max(&self, other: &Indices) -> Indices {
        self.zip_with(other, Idx::max)
    }

    pub fn round_up(&self, multiples: &Indices) -> Indices {
        self.zip_with(multiples, round_up)
    }
}

impl std::ops::Index<usize> for Indices {
    type Output = Idx;
    fn index(&self, i: usize) -> &Idx {
        &self.0[i]
    }
}

impl std::ops::IndexMut<usize> for Indices {
    fn index_mut(&mut self, i: usize) -> &mut Idx {
        &mut self.0[i]
    }
}

/// Row-major layout over a fixed dimension order, with an optional
/// stripe-order permutation.
///
/// `order[0]` is the slowest-varying (outermost) dim ordinal; the last
/// entry is fastest. `layout`/`unlayout` convert between an N-D point and
/// a linear offset within a space of the given sizes.
#[derive(Debug, Clone)]
pub struct Layout {
    sizes: Vec<Idx>,
    order: Vec<usize>,
}

impl Layout {
    /// Standard row-major layout: declared order, last dim fastest.
    pub fn row_major(sizes: &[Idx]) -> Self {
        Self { sizes: sizes.to_vec(), order: (0..sizes.len()).collect() }
    }

    /// Row-major layout over a permuted dim order.
    pub fn permuted(sizes: &[Idx], order: &[usize]) -> Self {
        assert_eq!(sizes.len(), order.len());
        let mut seen = vec![false; order.len()];
        for &d in order {
            assert!(d < order.len() && !seen[d], "bad layout permutation");
            seen[d] = true;
        }
        Self { sizes: sizes.to_vec(), order: order.to_vec() }
    }

    pub fn num_elements(&self) -> Idx {
        self.sizes.iter().product()
    }

    /// N-D point to linear offset.
    pub fn layout(&self, pt: &Indices) -> Idx {
        debug_assert_eq!(pt.len(), self.sizes.len());
        let mut lin = 0;
        for &d in &self.order {
            debug_assert!(pt[d] >= 0 && pt[d] < self.sizes[d]);
            lin = lin * self.sizes[d] + pt[d];
        }
        lin
    }

    /// Linear offset back to an N-D point.
    pub fn unlayout(&self, mut lin: Idx) -> Indices {
        debug_assert!(lin >= 0 && lin < self.num_elements().max(1));
        let mut pt = Indices::new(self.sizes.len(), 0);
        for &d in self.order.iter().rev() {
            pt[d] = lin.rem_euclid(self.sizes[d]);
            lin = lin.div_euclid(self.sizes[d]);
        }
        pt
    }
}
