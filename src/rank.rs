//! Rank-grid setup: coordinates, global domain accumulation, and the
//! 3^D neighbor table.
//!
//! Every rank broadcasts its coordinates and domain sizes; each rank then
//! derives its offset within the overall problem, validates the layout,
//! and records its immediate neighbors for halo exchange.

use tracing::debug;

use crate::comm::CommBackend;
use crate::error::{HaloclineError, Result};
use crate::indices::Layout;
use crate::Idx;

/// One immediate neighbor (all coordinate deltas within ±1).
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub rank: usize,
    /// Coordinate delta per domain dim, each in {-1, 0, +1}.
    pub offset: Vec<Idx>,
    pub man_dist: Idx,
    /// True when every domain size of the neighbor is a multiple of the
    /// matching fold length, which keeps slab boundaries fold-aligned in
    /// this rank's index space.
    pub has_all_vlen_mults: bool,
}

/// This rank's place in the rank grid.
#[derive(Debug)]
pub struct Neighborhood {
    pub my_rank: usize,
    pub num_ranks: usize,
    pub nranks: Vec<Idx>,
    pub coords: Vec<Idx>,
    /// Sum of domain sizes along each line of ranks through this one.
    pub overall_domain: Vec<Idx>,
    /// Position of this rank's domain within the overall problem.
    pub rank_domain_offset: Vec<Idx>,
    /// 3^D table indexed by [`Neighborhood::offset_index`]; the center
    /// entry (all zeros) is `None`.
    neighbors: Vec<Option<Neighbor>>,
}

impl Neighborhood {
    /// Dense index of a neighbor offset: radix-3 over the dims.
    pub fn offset_index(offset: &[Idx]) -> usize {
        let mut i = 0usize;
        for &o in offset {
            debug_assert!((-1..=1).contains(&o));
            i = i * 3 + (o + 1) as usize;
        }
        i
    }

    pub fn neighbor_at(&self, offset: &[Idx]) -> Option<&Neighbor> {
        self.neighbors[Self::offset_index(offset)].as_ref()
    }

    pub fn neighbors(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.iter().filter_map(|n| n.as_ref())
    }

    pub fn num_neighbors(&self) -> usize {
        self.neighbors().count()
    }

    pub fn is_first_rank(&self, dim: usize) -> bool {
        self.coords[dim] == 0
    }

    pub fn is_last_rank(&self, dim: usize) -> bool {
        self.coords[dim] == self.nranks[dim] - 1
    }

    /// Whether a neighbor exists on the given side of the given dim.
    pub fn has_neighbor_side(&self, dim: usize, right: bool) -> bool {
        if right {
            !self.is_last_rank(dim)
        } else {
            !self.is_first_rank(dim)
        }
    }
}

/// Establish this rank's coordinates, global offsets, and neighbor table.
///
/// `nranks` is the requested rank grid (per domain dim); its product must
/// equal the active rank count. `rank_indices`, when absent, is derived
/// from the rank id by unlayout over the rank grid. `my_domain` and
/// `vlens` give this rank's domain sizes and fold lengths per domain dim.
pub fn setup_rank(
    comm: &dyn CommBackend,
    nranks: &[Idx],
    rank_indices: Option<&[Idx]>,
    my_domain: &[Idx],
    vlens: &[Idx],
) -> Result<Neighborhood> {
    let ndims = nranks.len();
    let num_ranks = comm.num_ranks();
    let my_rank = comm.rank();

    let req_ranks: Idx = nranks.iter().product();
    if req_ranks != num_ranks as Idx {
        return Err(HaloclineError::BadRankLayout(format!(
            "{req_ranks} rank(s) requested, but {num_ranks} rank(s) are active"
        )));
    }

    let coords: Vec<Idx> = match rank_indices {
        Some(ri) => {
            for (d, &i) in ri.iter().enumerate() {
                if i < 0 || i >= nranks[d] {
                    return Err(HaloclineError::BadRankLayout(format!(
                        "rank index {i} out of range in dim {d}"
                    )));
                }
            }
            ri.to_vec()
        }
        None => Layout::row_major(nranks).unlayout(my_rank as Idx).0,
    };
    debug!(rank = my_rank, ?coords, "rank coordinates");

    // Everyone shares coordinates and domain sizes.
    let mut row: Vec<i64> = coords.clone();
    row.extend_from_slice(my_domain);
    let table = comm.all_gather_i64(&row);
    assert_eq!(table.len(), num_ranks * 2 * ndims);
    let rank_row = |rn: usize| -> (&[i64], &[i64]) {
        let base = rn * 2 * ndims;
        (&table[base..base + ndims], &table[base + ndims..base + 2 * ndims])
    };

    let mut overall_domain = vec![0; ndims];
    let mut rank_domain_offset = vec![0; ndims];
    let mut neighbors: Vec<Option<Neighbor>> = vec![None; 3usize.pow(ndims as u32)];

    for rn in 0..num_ranks {
        let (rcoords, rsizes) = rank_row(rn);
        let deltas: Vec<Idx> = (0..ndims).map(|d| rcoords[d] - coords[d]).collect();
        let man_dist: Idx = deltas.iter().map(|d| d.abs()).sum();

        if rn == my_rank {
            if man_dist != 0 {
                return Err(HaloclineError::BadRankLayout(format!(
                    "internal error: distance to own rank is {man_dist}"
                )));
            }
        } else if man_dist == 0 {
            return Err(HaloclineError::BadRankLayout(format!(
                "ranks {my_rank} and {rn} at the same coordinates"
            )));
        }

        for d in 0..ndims {
            // Ranks sharing every *other* coordinate form the line along
            // dim d that defines the overall size and my offset in it.
            let in_line = (0..ndims).all(|e| e == d || deltas[e] == 0);
            if in_line {
                overall_domain[d] += rsizes[d];
                if deltas[d] < 0 {
                    rank_domain_offset[d] += rsizes[d];
                }
                // An in-line rank must agree with me on all other sizes,
                // or the rank faces cannot butt together.
                if deltas[d] != 0 {
                    for e in 0..ndims {
                        if e != d && rsizes[e] != my_domain[e] {
                            return Err(HaloclineError::MisalignedRanks(format!(
                                "rank {rn} has domain size {} in dim {e}, \
                                 but rank {my_rank} has {}",
                                rsizes[e], my_domain[e]
                            )));
                        }
                    }
                }
            }
        }

        if rn == my_rank || deltas.iter().any(|d| d.abs() > 1) {
            continue;
        }

        let has_all_vlen_mults = (0..ndims).all(|d| rsizes[d] % vlens[d] == 0);
        let idx = Neighborhood::offset_index(&deltas);
        debug!(rank = my_rank, neighbor = rn, ?deltas, man_dist, "neighbor");
        neighbors[idx] = Some(Neighbor {
            rank: rn,
            offset: deltas,
            man_dist,
            has_all_vlen_mults,
        });
    }

    Ok(Neighborhood {
        my_rank,
        num_ranks,
        nranks: nranks.to_vec(),
        coords,
        overall_domain,
        rank_domain_offset,
        neighbors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalUniverse;
    use crate::comm::SingleProcessComm;
    use std::thread;

    #[test]
    fn test_single_rank() {
        let comm = SingleProcessComm;
        let n = setup_rank(&comm, &[1, 1], None, &[16, 16], &[1, 1]).unwrap();
        assert_eq!(n.overall_domain, vec![16, 16]);
        assert_eq!(n.rank_domain_offset, vec![0, 0]);
        assert_eq!(n.num_neighbors(), 0);
        assert!(n.is_first_rank(0) && n.is_last_rank(0));
    }

    #[test]
    fn test_rank_count_mismatch() {
        let comm = SingleProcessComm;
        let err = setup_rank(&comm, &[2, 1], None, &[16, 16], &[1, 1]).unwrap_err();
        assert!(matches!(err, HaloclineError::BadRankLayout(_)));
    }

    #[test]
    fn test_2x2_grid() {
        let uni = LocalUniverse::new(4);
        let handles: Vec<_> = (0..4)
            .map(|r| {
                let comm = uni.comm(r);
                thread::spawn(move || {
                    setup_rank(&comm, &[2, 2], None, &[8, 8], &[1, 1]).unwrap()
                })
            })
            .collect();
        let hoods: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for (r, n) in hoods.iter().enumerate() {
            assert_eq!(n.overall_domain, vec![16, 16]);
            // Row-major coords: rank 0 -> (0,0), 1 -> (0,1), 2 -> (1,0), 3 -> (1,1).
            let (cx, cy) = (r as Idx / 2, r as Idx % 2);
            assert_eq!(n.coords, vec![cx, cy]);
            assert_eq!(n.rank_domain_offset, vec![cx * 8, cy * 8]);
            // Every rank sees the other three (two faces + one corner).
            assert_eq!(n.num_neighbors(), 3);
        }
        // Rank 0's right-in-y neighbor is rank 1.
        let n0 = &hoods[0];
        assert_eq!(n0.neighbor_at(&[0, 1]).unwrap().rank, 1);
        assert_eq!(n0.neighbor_at(&[1, 1]).unwrap().man_dist, 2);
        assert!(n0.neighbor_at(&[0, -1]).is_none());
    }

    #[test]
    fn test_coordinate_collision() {
        let uni = LocalUniverse::new(2);
        let handles: Vec<_> = (0..2)
            .map(|r| {
                let comm = uni.comm(r);
                thread::spawn(move || {
                    // Both ranks claim coordinate (0, 0).
                    setup_rank(&comm, &[2, 1], Some(&[0, 0]), &[8, 8], &[1, 1])
                })
            })
            .collect();
        for h in handles {
            assert!(matches!(
                h.join().unwrap(),
                Err(HaloclineError::BadRankLayout(_))
            ));
        }
    }

    #[test]
    fn test_misaligned_sizes() {
        let uni = LocalUniverse::new(2);
        let handles: Vec<_> = (0..2)
            .map(|r| {
                let comm = uni.comm(r);
                thread::spawn(move || {
                    // Ranks side by side in x but disagreeing on y size.
                    let dom = if r == 0 { [8, 8] } else { [8, 12] };
                    setup_rank(&comm, &[2, 1], None, &dom, &[1, 1])
                })
            })
            .collect();
        for h in handles {
            assert!(matches!(
                h.join().unwrap(),
                Err(HaloclineError::MisalignedRanks(_))
            ));
        }
    }
}
