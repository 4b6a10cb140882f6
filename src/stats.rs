//! Performance statistics collection for `--stats` output.
//!
//! Phase timers are accumulated serially by the orchestrator; the work
//! counters are atomic because blocks update them from worker threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Atomic work counters updated from inside the loop nest.
#[derive(Debug, Default)]
pub struct WorkCounters {
    pub points_updated: AtomicU64,
    pub elem_reads: AtomicU64,
    pub elem_writes: AtomicU64,
    pub fp_ops: AtomicU64,
}

impl WorkCounters {
    /// Account for `points` output points of one bundle.
    #[inline]
    pub fn add_points(&self, points: u64, reads_per_pt: u64, writes_per_pt: u64, fpops_per_pt: u64) {
        self.points_updated.fetch_add(points, Ordering::Relaxed);
        self.elem_reads.fetch_add(points * reads_per_pt, Ordering::Relaxed);
        self.elem_writes.fetch_add(points * writes_per_pt, Ordering::Relaxed);
        self.fp_ops.fetch_add(points * fpops_per_pt, Ordering::Relaxed);
    }

    pub fn points(&self) -> u64 {
        self.points_updated.load(Ordering::Relaxed)
    }
}

/// Per-pack accumulated time and step count.
#[derive(Debug, Clone, Default)]
pub struct PackStats {
    pub name: String,
    pub time: Duration,
    pub steps_done: i64,
}

/// Collects phase timings and work counters for one solution.
#[derive(Debug, Default)]
pub struct Stats {
    pub run_time: Duration,
    /// Time in rank-exterior compute (overlap mode).
    pub ext_time: Duration,
    /// Time in rank-interior compute (overlap mode).
    pub int_time: Duration,
    pub halo_time: Duration,
    pub wait_time: Duration,
    pub steps_done: i64,
    /// Shared with the loop drivers, which update it from worker
    /// threads while the orchestrator owns the timers.
    pub counters: Arc<WorkCounters>,
    pub packs: Vec<PackStats>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_packs(&mut self, names: &[String]) {
        self.packs = names
            .iter()
            .map(|n| PackStats { name: n.clone(), ..Default::default() })
            .collect();
    }

    pub fn clear_timers(&mut self) {
        self.run_time = Duration::ZERO;
        self.ext_time = Duration::ZERO;
        self.int_time = Duration::ZERO;
        self.halo_time = Duration::ZERO;
        self.wait_time = Duration::ZERO;
        self.steps_done = 0;
        for p in &mut self.packs {
            p.time = Duration::ZERO;
            p.steps_done = 0;
        }
    }

    /// Points updated per second over the accumulated run time.
    pub fn points_per_sec(&self) -> f64 {
        let secs = self.run_time.as_secs_f64();
        if secs > 0.0 {
            self.counters.points() as f64 / secs
        } else {
            0.0
        }
    }

    /// Print the stats table to stderr.
    pub fn display(&self) {
        eprintln!();
        eprintln!("=== Halocline Performance Stats ===");
        eprintln!("  Steps done:             {}", self.steps_done);
        eprintln!("  Run time:               {:>10.3}s", self.run_time.as_secs_f64());
        eprintln!("  Halo exchange:          {:>10.3}s", self.halo_time.as_secs_f64());
        eprintln!("  MPI wait:               {:>10.3}s", self.wait_time.as_secs_f64());
        if self.ext_time > Duration::ZERO || self.int_time > Duration::ZERO {
            eprintln!("  Exterior compute:       {:>10.3}s", self.ext_time.as_secs_f64());
            eprintln!("  Interior compute:       {:>10.3}s", self.int_time.as_secs_f64());
        }
        for p in &self.packs {
            if p.steps_done > 0 {
                eprintln!(
                    "  Pack {:<18} {:>10.3}s  ({} step(s))",
                    p.name,
                    p.time.as_secs_f64(),
                    p.steps_done
                );
            }
        }
        eprintln!("  ─────────────────────────────────");
        eprintln!("  Points updated:         {}", self.counters.points());
        eprintln!(
            "  Element reads/writes:   {} / {}",
            self.counters.elem_reads.load(Ordering::Relaxed),
            self.counters.elem_writes.load(Ordering::Relaxed)
        );
        eprintln!(
            "  Est. FP ops:            {}",
            self.counters.fp_ops.load(Ordering::Relaxed)
        );
        eprintln!("  Points/sec:             {:.3e}", self.points_per_sec());
    }
}

/// Small helper for accumulating a phase duration.
pub struct PhaseTimer(Instant);

impl PhaseTimer {
    pub fn start() -> Self {
        Self(Instant::now())
    }

    /// Stop and add the elapsed time into `acc`, returning the delta.
    pub fn stop_into(self, acc: &mut Duration) -> Duration {
        let d = self.0.elapsed();
        *acc += d;
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let c = WorkCounters::default();
        c.add_points(100, 5, 1, 7);
        c.add_points(50, 5, 1, 7);
        assert_eq!(c.points(), 150);
        assert_eq!(c.elem_reads.load(Ordering::Relaxed), 750);
        assert_eq!(c.fp_ops.load(Ordering::Relaxed), 1050);
    }

    #[test]
    fn test_phase_timer_accumulates() {
        let mut acc = Duration::ZERO;
        let t = PhaseTimer::start();
        std::thread::sleep(Duration::from_millis(1));
        t.stop_into(&mut acc);
        assert!(acc >= Duration::from_millis(1));
    }

    #[test]
    fn test_points_per_sec() {
        let mut s = Stats::new();
        s.counters.add_points(1000, 1, 1, 1);
        s.run_time = Duration::from_secs(2);
        assert_eq!(s.points_per_sec(), 500.0);
    }

    #[test]
    fn test_clear_timers_keeps_pack_names() {
        let mut s = Stats::new();
        s.init_packs(&["a".to_string(), "b".to_string()]);
        s.run_time = Duration::from_secs(1);
        s.packs[1].steps_done = 5;
        s.clear_timers();
        assert_eq!(s.run_time, Duration::ZERO);
        assert_eq!(s.packs[1].steps_done, 0);
        assert_eq!(s.packs[1].name, "b");
    }
}
