//! Flow parameters (Re, Pr, Ri, domain lengths), modelled as an explicit
//! typed record behind a scoped-override guard rather than the original's
//! bare process-wide mutable globals (REDESIGN FLAGS item 2).

use serde::{Deserialize, Serialize};
use std::sync::{RwLock, RwLockReadGuard};

/// Reynolds, Prandtl, Richardson numbers and domain lengths. Read by every
/// integrator stage; mutation must be serialised with respect to any
/// concurrent evolve (spec.md §3, §5).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowParams {
    pub re: f64,
    pub pr: f64,
    pub ri: f64,
    pub l1: f64,
    pub l2: f64,
    pub l3: f64,
}

impl FlowParams {
    pub fn new(re: f64, pr: f64, ri: f64, l1: f64, l2: f64, l3: f64) -> Self {
        Self {
            re,
            pr,
            ri,
            l1,
            l2,
            l3,
        }
    }
}

/// Process-wide flow-parameter block. Single-init-free: constructed
/// explicitly by the caller (typically once, at startup) and shared by
/// reference from then on. A `RwLock` serialises the rare write (continuation
/// predictors and tangent-map evaluations temporarily overriding `ri`)
/// against the many concurrent reads every integrator stage performs.
pub struct FlowParamsCell {
    inner: RwLock<FlowParams>,
}

impl FlowParamsCell {
    pub fn new(params: FlowParams) -> Self {
        Self {
            inner: RwLock::new(params),
        }
    }

    pub fn get(&self) -> FlowParams {
        *self.inner.read().expect("flow params lock poisoned")
    }

    pub fn read(&self) -> RwLockReadGuard<'_, FlowParams> {
        self.inner.read().expect("flow params lock poisoned")
    }

    pub fn set(&self, params: FlowParams) {
        *self.inner.write().expect("flow params lock poisoned") = params;
    }

    /// Temporarily overrides `Ri`, running `body` with it in effect, then
    /// restores the previous value — even if `body` panics. This is the
    /// save/restore-around-the-inner-evolve pattern spec.md §5 requires of
    /// continuation predictors and `ExtendedStateVector`/`CriticalPoint`
    /// tangent-map evaluations.
    pub fn with_ri<T>(&self, ri: f64, body: impl FnOnce() -> T) -> T {
        let previous = self.get();
        {
            let mut guard = self.inner.write().expect("flow params lock poisoned");
            guard.ri = ri;
        }
        struct Restore<'a> {
            cell: &'a FlowParamsCell,
            previous: FlowParams,
        }
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                self.cell.set(self.previous);
            }
        }
        let _restore = Restore {
            cell: self,
            previous,
        };
        body()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_ri_restores_previous_value_even_on_panic() {
        let cell = FlowParamsCell::new(FlowParams::new(500.0, 8.0, 0.16, 1.0, 1.0, 1.0));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cell.with_ri(0.5, || {
                assert!((cell.get().ri - 0.5).abs() < 1e-12);
                panic!("boom");
            })
        }));
        assert!(result.is_err());
        assert!((cell.get().ri - 0.16).abs() < 1e-12);
    }

    #[test]
    fn with_ri_restores_on_normal_return() {
        let cell = FlowParamsCell::new(FlowParams::new(500.0, 8.0, 0.16, 1.0, 1.0, 1.0));
        let seen = cell.with_ri(0.2, || cell.get().ri);
        assert!((seen - 0.2).abs() < 1e-12);
        assert!((cell.get().ri - 0.16).abs() < 1e-12);
    }
}
