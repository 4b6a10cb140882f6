//! Multi-rank end-to-end tests on the in-process mailbox backend: one
//! thread per rank inside the test process, compared bit-for-bit
//! against a single-rank run of the same problem.

use std::sync::Arc;
use std::thread;

use halocline::comm::local::LocalUniverse;
use halocline::comm::SingleProcessComm;
use halocline::samples;
use halocline::Solution;

const N: i64 = 128;
const CENTER: i64 = N / 2;

fn init_field(soln: &Solution, ox: i64, oy: i64, sx: i64, sy: i64) {
    for x in ox..ox + sx {
        for y in oy..oy + sy {
            let v = if x == CENTER && y == CENTER { 1.0 } else { 0.0 };
            assert!(soln.set_element("u", &[x, y], 0, v).unwrap());
        }
    }
}

/// Run `heat_2d` on an `nrx` x `nry` rank grid; return the assembled
/// global field at the final step plus whether every rank's dirty flag
/// ended clear.
fn run_grid(nrx: i64, nry: i64, steps: i64, cfg: fn(&mut Solution), use_ref: bool) -> (Vec<f64>, bool) {
    let ranks = (nrx * nry) as usize;
    let uni = LocalUniverse::new(ranks);
    let handles: Vec<_> = (0..ranks)
        .map(|r| {
            let comm = uni.comm(r);
            thread::spawn(move || {
                let mut soln = Solution::new(samples::heat_2d(), Arc::new(comm)).unwrap();
                soln.settings.rank_sizes = vec![N / nrx, N / nry];
                soln.settings.nranks = vec![nrx, nry];
                // Keep per-rank thread pools small; there are several
                // rank threads in this one process.
                soln.settings.max_threads = 2;
                cfg(&mut soln);
                soln.prepare_solution().unwrap();

                let neigh = soln.neighborhood().unwrap();
                assert_eq!(neigh.overall_domain, vec![N, N]);
                let (ox, oy) = (neigh.rank_domain_offset[0], neigh.rank_domain_offset[1]);
                let (sx, sy) = (N / nrx, N / nry);
                init_field(&soln, ox, oy, sx, sy);

                if use_ref {
                    soln.run_ref(0, steps - 1).unwrap();
                } else {
                    soln.run_solution(0, steps - 1).unwrap();
                }

                let mut data = Vec::with_capacity((sx * sy) as usize);
                for x in ox..ox + sx {
                    for y in oy..oy + sy {
                        data.push(soln.get_element("u", &[x, y], steps).unwrap().unwrap());
                    }
                }
                let u = soln.var("u").unwrap();
                let clean = !u.is_dirty(steps % u.alloc_step);
                (ox, oy, sx, sy, data, clean)
            })
        })
        .collect();

    let mut field = vec![0.0f64; (N * N) as usize];
    let mut all_clean = true;
    for h in handles {
        let (ox, oy, sx, sy, data, clean) = h.join().unwrap();
        all_clean &= clean;
        let mut k = 0;
        for x in ox..ox + sx {
            for y in oy..oy + sy {
                field[(x * N + y) as usize] = data[k];
                k += 1;
            }
        }
    }
    (field, all_clean)
}

fn run_single(steps: i64, cfg: fn(&mut Solution)) -> Vec<f64> {
    let mut soln = Solution::new(samples::heat_2d(), Arc::new(SingleProcessComm)).unwrap();
    soln.settings.rank_sizes = vec![N, N];
    soln.settings.max_threads = 2;
    cfg(&mut soln);
    soln.prepare_solution().unwrap();
    init_field(&soln, 0, 0, N, N);
    soln.run_solution(0, steps - 1).unwrap();
    let mut field = Vec::with_capacity((N * N) as usize);
    for x in 0..N {
        for y in 0..N {
            field.push(soln.get_element("u", &[x, y], steps).unwrap().unwrap());
        }
    }
    field
}

fn assert_bitwise_eq(a: &[f64], b: &[f64]) {
    assert_eq!(a.len(), b.len());
    for i in 0..a.len() {
        assert!(
            a[i].to_bits() == b[i].to_bits(),
            "mismatch at ({}, {}): {} vs {}",
            i as i64 / N,
            i as i64 % N,
            a[i],
            b[i]
        );
    }
}

#[test]
fn test_2x2_impulse_matches_single_rank() {
    let single = run_single(10, |_| {});
    let (multi, clean) = run_grid(2, 2, 10, |_| {}, false);
    assert_bitwise_eq(&multi, &single);
    assert!(clean, "halo exchange left dirty flags set");

    // Non-zero support is exactly the diamond reached in 10 steps.
    for x in 0..N {
        for y in 0..N {
            let inside = (x - CENTER).abs() + (y - CENTER).abs() <= 10;
            let v = multi[(x * N + y) as usize];
            assert_eq!(v != 0.0, inside, "support error at ({x},{y})");
        }
    }
}

#[test]
fn test_2x2_ref_matches_single_rank() {
    let single = run_single(6, |_| {});
    let (multi, _) = run_grid(2, 2, 6, |_| {}, true);
    assert_bitwise_eq(&multi, &single);
}

#[test]
fn test_1x2_split_matches_single_rank() {
    let single = run_single(8, |_| {});
    let (multi, clean) = run_grid(1, 2, 8, |_| {}, false);
    assert_bitwise_eq(&multi, &single);
    assert!(clean);
}

#[test]
fn test_temporal_tiling_across_ranks() {
    // Temporal blocking inside a wavefront window, across a 2x2 rank
    // grid: the widened halo exchange must feed the shifted tiles.
    fn cfg(s: &mut Solution) {
        s.settings.region_steps = 4;
        s.settings.block_sizes = vec![16, 16];
        s.settings.block_steps = 4;
    }
    let single = run_single(12, |_| {});
    let (multi, clean) = run_grid(2, 2, 12, cfg, false);
    assert_bitwise_eq(&multi, &single);
    assert!(clean);
}

#[test]
fn test_wavefront_across_ranks() {
    fn cfg(s: &mut Solution) {
        s.settings.region_steps = 3;
    }
    let single = run_single(9, |_| {});
    let (multi, clean) = run_grid(2, 2, 9, cfg, false);
    assert_bitwise_eq(&multi, &single);
    assert!(clean);
}

#[test]
fn test_overlap_matches_single_rank() {
    fn cfg(s: &mut Solution) {
        s.settings.overlap_comms = true;
        s.settings.block_sizes = vec![16, 16];
    }
    let single = run_single(10, |_| {});
    let (multi, clean) = run_grid(2, 2, 10, cfg, false);
    assert_bitwise_eq(&multi, &single);
    assert!(clean);
}

#[test]
fn test_dirty_clear_after_one_step() {
    let (_, clean) = run_grid(2, 2, 1, |_| {}, false);
    assert!(clean);
}
