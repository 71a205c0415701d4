//! Process-wide FFT plan cache (spec.md §3, §5, REDESIGN FLAGS item 3).
//!
//! `rustfft` only provides complex-to-complex transforms, so a real signal
//! is embedded with a zero imaginary part before transforming; conjugate
//! symmetry of the result is what lets `ModalField` discard the redundant
//! upper half of whichever axis is actually packed (see `field.rs`).

use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PlanKey {
    len: usize,
    forward: bool,
}

/// Keyed registry of `rustfft` plans, double-checked on read, with an
/// explicit `shutdown` rather than relying on process exit to drop state.
/// Plans are not shared across differently-shaped inputs (spec.md §5): the
/// key is exactly the transform length and direction.
pub struct FftPlanCache {
    planner: Mutex<FftPlanner<f64>>,
    plans: Mutex<HashMap<PlanKey, Arc<dyn Fft<f64>>>>,
}

impl FftPlanCache {
    pub fn new() -> Self {
        Self {
            planner: Mutex::new(FftPlanner::new()),
            plans: Mutex::new(HashMap::new()),
        }
    }

    fn plan(&self, len: usize, forward: bool) -> Arc<dyn Fft<f64>> {
        let key = PlanKey { len, forward };
        if let Some(existing) = self.plans.lock().expect("fft plan cache poisoned").get(&key) {
            return existing.clone();
        }
        let mut planner = self.planner.lock().expect("fft planner poisoned");
        let plan = if forward {
            planner.plan_fft_forward(len)
        } else {
            planner.plan_fft_inverse(len)
        };
        self.plans
            .lock()
            .expect("fft plan cache poisoned")
            .insert(key, plan.clone());
        plan
    }

    /// Runs an in-place forward (time -> frequency) transform of length `buf.len()`.
    pub fn forward(&self, buf: &mut [Complex64]) {
        self.plan(buf.len(), true).process(buf);
    }

    /// Runs an in-place, unnormalised inverse transform (matching `rustfft`'s
    /// convention: the caller divides by `N` themselves, exactly as spec.md
    /// §4.2 specifies for `ToModal`).
    pub fn inverse(&self, buf: &mut [Complex64]) {
        self.plan(buf.len(), false).process(buf);
    }

    /// Drops every cached plan. Not required for correctness (plans have no
    /// external resources beyond heap memory) but documents the "explicit
    /// shutdown" half of the keyed-registry contract spec.md §5 calls for.
    pub fn shutdown(&self) {
        self.plans.lock().expect("fft plan cache poisoned").clear();
    }
}

impl Default for FftPlanCache {
    fn default() -> Self {
        Self::new()
    }
}

static PROCESS_CACHE: OnceLock<FftPlanCache> = OnceLock::new();

/// The process-wide, lazily-initialised FFT plan cache. A single instance is
/// shared by every integrator and every field transform in the process.
pub fn process_cache() -> &'static FftPlanCache {
    PROCESS_CACHE.get_or_init(FftPlanCache::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_then_inverse_recovers_input_up_to_scale() {
        let cache = FftPlanCache::new();
        let original: Vec<Complex64> = (0..8)
            .map(|i| Complex64::new(i as f64, 0.0))
            .collect();
        let mut buf = original.clone();
        cache.forward(&mut buf);
        cache.inverse(&mut buf);
        for (a, b) in buf.iter().zip(original.iter()) {
            assert!((a.re / 8.0 - b.re).abs() < 1e-10);
            assert!((a.im / 8.0 - b.im).abs() < 1e-10);
        }
    }

    #[test]
    fn plans_are_reused_for_the_same_length() {
        let cache = FftPlanCache::new();
        let a = cache.plan(16, true);
        let b = cache.plan(16, true);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn shutdown_clears_cache_but_remains_usable() {
        let cache = FftPlanCache::new();
        let mut buf = vec![Complex64::new(1.0, 0.0); 4];
        cache.forward(&mut buf);
        cache.shutdown();
        assert!(cache.plans.lock().unwrap().is_empty());
        let mut buf2 = vec![Complex64::new(1.0, 0.0); 4];
        cache.forward(&mut buf2); // still works after shutdown
    }
}
