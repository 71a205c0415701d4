//! Continuation predictors and concrete Newton-Krylov problems (spec.md
//! §4.6), wiring [`crate::state`]'s phase-space elements to
//! [`crate::newton_krylov`]'s generic solver: equilibrium search over a
//! plain [`StateVector`], Ri-continuation over an [`ExtendedStateVector`],
//! and critical-point search over a [`CriticalPoint`].

use crate::grid::GridParams;
use crate::integrator::Integrator;
use crate::newton_krylov::NewtonKrylovProblem;
use crate::params::FlowParamsCell;
use crate::state::{CriticalPoint, ExtendedStateVector, StateVector};

/// Two-point linear predictor in Ri for seeding plain `StateVector`
/// continuation, `NewtonKrylov.cpp`'s `main`: `guess = x2 + (target_ri -
/// ri2) * (x2 - x1)/(ri2 - ri1)`. Pivots around `x2`, unlike
/// [`predict_critical_point`]'s pivot around `x1` — both are faithful to
/// their respective drivers in `original_source/` rather than unified,
/// since the two original CLI tools genuinely disagree on which saved point
/// the gradient is anchored to (SPEC_FULL.md §D).
pub fn predict_state(x1: StateVector, x2: StateVector, ri1: f64, ri2: f64, target_ri: f64) -> StateVector {
    let mut gradient = x2.clone();
    gradient.sub_assign(&x1);
    gradient.scale(1.0 / (ri2 - ri1));

    let mut guess = x2;
    guess.mul_add(target_ri - ri2, &gradient);
    guess
}

/// Two-point linear predictor in `Pr` for seeding `CriticalPoint`
/// continuation (`FindCriticalPoint.cpp`'s `main`, SPEC_FULL.md §C.5): both
/// seeds have their phase shift and horizontal mean removed before the
/// linear gradient is formed, so the predictor isn't corrupted by an
/// arbitrary relative translation between the two saved points.
pub fn predict_critical_point(
    grid: &GridParams,
    mut x1: CriticalPoint,
    mut x2: CriticalPoint,
    pr1: f64,
    pr2: f64,
    target_pr: f64,
) -> CriticalPoint {
    let shift1 = x1.x.remove_phase_shift(grid);
    x1.x.remove_average();
    x1.v.phase_shift(grid, shift1);
    x1.v.remove_average();

    let shift2 = x2.x.remove_phase_shift(grid);
    x2.x.remove_average();
    x2.v.phase_shift(grid, shift2);
    x2.v.remove_average();

    let mut gradient = x2.clone();
    gradient.sub_assign(&x1);
    gradient.scale(1.0 / (pr2 - pr1));

    let mut guess = x1;
    guess.mul_add(target_pr - pr1, &gradient);
    guess
}

/// Equilibrium / relative-periodic-orbit search over a plain `StateVector`
/// (`BasicNewtonKrylov`, spec.md §4.6): the root of `FullEvolve(T, x) - x`.
pub struct EquilibriumProblem<'a> {
    pub period: f64,
    pub dt: f64,
    pub integrator: &'a mut Integrator,
    pub flow: &'a FlowParamsCell,
}

impl<'a> NewtonKrylovProblem for EquilibriumProblem<'a> {
    type Vector = StateVector;

    fn eval_function(&mut self, at: &StateVector) -> StateVector {
        let mut result = StateVector::zeros(&self.integrator.grid);
        at.full_evolve(self.period, self.dt, &mut result, self.integrator, self.flow);
        result.sub_assign(at);
        result
    }
}

/// Ri-continuation over an `ExtendedStateVector` (`ExtendedStateVector.h` +
/// spec.md §4.6): the root of `FullEvolve(T, x) - x` with `p` pinned to
/// `target_ri` every Newton step rather than solved for (spec.md §4.5: "for
/// ExtendedStateVector continuation, EnforceConstraints fixes p to the
/// prescribed target").
pub struct RiContinuationProblem<'a> {
    pub period: f64,
    pub dt: f64,
    pub target_ri: f64,
    pub integrator: &'a mut Integrator,
    pub flow: &'a FlowParamsCell,
}

impl<'a> NewtonKrylovProblem for RiContinuationProblem<'a> {
    type Vector = ExtendedStateVector;

    fn eval_function(&mut self, at: &ExtendedStateVector) -> ExtendedStateVector {
        let mut result = ExtendedStateVector::zeros(&self.integrator.grid);
        at.full_evolve(self.period, self.dt, &mut result, self.integrator, self.flow);
        result.sub_assign(at);
        result
    }

    fn enforce_constraints(&mut self, at: &mut ExtendedStateVector) {
        at.p = self.target_ri;
    }
}

/// Critical-point search over `(x, v, p)` (`FindCriticalPoint::EvalFunction`,
/// spec.md §4.5/§4.6): `x` closes a fixed point of the time-`T` map, `v`
/// closes an eigenvector of its tangent map (via
/// [`StateVector::linear_evolve`](crate::state::StateVector::linear_evolve),
/// frozen about `at.x` per the scope decision documented there), and `p`
/// closes the scalar neutrality equation `Energy(v) - weight = 0`.
pub struct CriticalPointProblem<'a> {
    pub period: f64,
    pub dt: f64,
    pub weight: f64,
    pub integrator: &'a mut Integrator,
    pub flow: &'a FlowParamsCell,
}

impl<'a> NewtonKrylovProblem for CriticalPointProblem<'a> {
    type Vector = CriticalPoint;

    fn eval_function(&mut self, at: &CriticalPoint) -> CriticalPoint {
        let mut result = CriticalPoint::zeros(&self.integrator.grid);

        let mut params = self.flow.get();
        params.ri = at.p;
        self.flow.set(params);

        at.x.full_evolve(self.period, self.dt, &mut result.x, self.integrator, self.flow);
        at.v.linear_evolve(self.period, self.dt, &at.x, &mut result.v, self.integrator, self.flow);

        result.sub_assign(at);
        result.p = at.v.energy() - self.weight;
        result
    }

    fn enforce_constraints(&mut self, at: &mut CriticalPoint) {
        let grid = self.integrator.grid;
        at.enforce_constraints(&grid, self.flow, self.weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridParams;

    #[test]
    fn predict_state_reproduces_x2_when_target_equals_ri2() {
        let grid = GridParams::new(2, 1, 3, 1.0, 1.0, 1.0);
        let x1 = StateVector::zeros(&grid);
        let mut x2 = StateVector::zeros(&grid);
        x2.u1.field.set(0, 0, 0, num_complex::Complex64::new(2.0, 0.0));
        let guess = predict_state(x1, x2.clone(), 0.15, 0.17, 0.17);
        assert!((guess.norm() - x2.norm()).abs() < 1e-12);
    }

    #[test]
    fn predict_state_extrapolates_linearly_at_the_midpoint() {
        let grid = GridParams::new(2, 1, 3, 1.0, 1.0, 1.0);
        let x1 = StateVector::zeros(&grid);
        let mut x2 = StateVector::zeros(&grid);
        x2.u1.field.set(0, 0, 0, num_complex::Complex64::new(2.0, 0.0));
        let guess = predict_state(x1.clone(), x2.clone(), 0.0, 1.0, 0.5);
        let mut expected = x1;
        expected.mul_add(0.5, &x2);
        // x1 is zero, so the midpoint prediction is exactly half of x2.
        assert!((guess.norm() - expected.norm()).abs() < 1e-12);
    }
}
