//! `StateVector`, `ExtendedStateVector`, and `CriticalPoint` (spec.md §5),
//! grounded on `StateVector.cpp`, `ExtendedStateVector.h`, and
//! `FindCriticalPoint.cpp`'s `CriticalPoint` class.

use crate::field::{ModalField, NodalField};
use crate::grid::{BoundaryCondition, GridParams};
use crate::integrator::Integrator;
use crate::newton_krylov::KrylovVector;
use crate::operators::ddx;
use crate::params::{FlowParams, FlowParamsCell};
use anyhow::Result;

/// The four prognostic fields of the Boussinesq Navier-Stokes system:
/// velocity `(u1, u2, u3)` and buoyancy `b` (spec.md §5).
#[derive(Clone)]
pub struct StateVector {
    pub u1: ModalField,
    pub u2: ModalField,
    pub u3: ModalField,
    pub b: ModalField,
}

impl StateVector {
    pub fn zeros(grid: &GridParams) -> Self {
        Self {
            u1: ModalField::zeros(grid, Some(BoundaryCondition::Neumann)),
            u2: ModalField::zeros(grid, Some(BoundaryCondition::Neumann)),
            u3: ModalField::zeros(grid, Some(BoundaryCondition::Dirichlet)),
            b: ModalField::zeros(grid, Some(BoundaryCondition::Neumann)),
        }
    }

    pub fn dot(&self, other: &StateVector) -> f64 {
        self.u1.dot(&other.u1) + self.u2.dot(&other.u2) + self.u3.dot(&other.u3) + self.b.dot(&other.b)
    }

    pub fn norm2(&self) -> f64 {
        self.dot(self)
    }

    pub fn norm(&self) -> f64 {
        self.norm2().sqrt()
    }

    pub fn mul_add(&mut self, alpha: f64, other: &StateVector) {
        self.u1.axpy(alpha, &other.u1);
        self.u2.axpy(alpha, &other.u2);
        self.u3.axpy(alpha, &other.u3);
        self.b.axpy(alpha, &other.b);
    }

    pub fn add_assign(&mut self, other: &StateVector) {
        self.mul_add(1.0, other);
    }

    pub fn sub_assign(&mut self, other: &StateVector) {
        self.mul_add(-1.0, other);
    }

    pub fn scale(&mut self, alpha: f64) {
        self.u1.scale(alpha);
        self.u2.scale(alpha);
        self.u3.scale(alpha);
        self.b.scale(alpha);
    }

    pub fn zero(&mut self) {
        self.u1.zero();
        self.u2.zero();
        self.u3.zero();
        self.b.zero();
    }

    /// `StateVector::EnforceBCs` in the original resets each field's
    /// boundary rows to their fixed parity; in this crate, boundary
    /// condition is tracked entirely by the `bc` tag rather than explicit
    /// rows, so there is nothing to enforce here. Kept as a named call so
    /// `CriticalPoint`/`ExtendedStateVector` mirror the original's call
    /// sequence rather than silently dropping it.
    pub fn enforce_bcs(&mut self) {}

    /// Kinetic-plus-potential energy. Entirely quadratic in the state, which
    /// is what makes [`rescale`](Self::rescale) a simple square root
    /// (`StateVector::Rescale`'s comment, verbatim reasoning).
    pub fn energy(&self) -> f64 {
        0.5 * self.norm2()
    }

    /// Scales `u1`, `u3`, `b` (not `u2`) so the resulting energy equals
    /// `energy`, exactly `StateVector::Rescale`.
    pub fn rescale(&mut self, energy: f64) {
        let before = self.energy();
        let scale = if before != 0.0 { (energy / before).sqrt() } else { 0.0 };
        self.u1.scale(scale);
        self.u3.scale(scale);
        self.b.scale(scale);
    }

    /// Zeros the horizontal mean of `u1` and `b`, the symmetry
    /// `FindCriticalPoint.cpp`'s `EnforceConstraints` removes from the
    /// eigenvector each Newton step (spec.md §4.5, SPEC_FULL.md §C.4).
    pub fn remove_average(&mut self) {
        self.u1.remove_horizontal_mean();
        self.b.remove_horizontal_mean();
    }

    /// Advances the full nonlinear system by time `t`, starting from `self`,
    /// writing the result into `result` (`StateVector::FullEvolve`).
    pub fn full_evolve(&self, t: f64, dt: f64, result: &mut StateVector, integrator: &mut Integrator, flow: &FlowParamsCell) {
        let steps = (t / dt).round().max(1.0) as usize;
        let actual_dt = t / steps as f64;
        result.u1 = self.u1.clone();
        result.u2 = self.u2.clone();
        result.u3 = self.u3.clone();
        result.b = self.b.clone();
        for _ in 0..steps {
            integrator.step(&mut result.u1, &mut result.u2, &mut result.u3, &mut result.b, actual_dt, flow);
        }
    }

    /// Forward-integrates the tangent map about a frozen base trajectory
    /// `about` (`StateVector::LinearEvolve`/`IMEXRK::TimeStepLinear`): `self`
    /// is the perturbation, `result` receives its image under the
    /// linearisation of the time-`t` flow map about `about`. See
    /// [`crate::integrator::Integrator::step_linear`] for the frozen-base
    /// simplification this takes relative to the original's genuinely
    /// time-varying base trajectory.
    pub fn linear_evolve(&self, t: f64, dt: f64, about: &StateVector, result: &mut StateVector, integrator: &mut Integrator, flow: &FlowParamsCell) {
        let steps = (t / dt).round().max(1.0) as usize;
        let actual_dt = t / steps as f64;
        result.u1 = self.u1.clone();
        result.u2 = self.u2.clone();
        result.u3 = self.u3.clone();
        result.b = self.b.clone();
        for _ in 0..steps {
            integrator.step_linear(&mut result.u1, &mut result.u2, &mut result.u3, &mut result.b, about, actual_dt, flow);
        }
    }

    /// Finite-difference fallback for the tangent map, licensed by spec.md
    /// §4.4 as an implementation alternative to a true tangent integrator:
    /// `result = (FullEvolve(about + eps*self) - aboutResult) / eps`.
    /// [`ExtendedStateVector`]'s Newton-Krylov problem uses this form rather
    /// than [`Self::linear_evolve`], matching `ExtendedStateVector.h`'s
    /// `LinearEvolve` exactly (as opposed to `StateVector::LinearEvolve`,
    /// which is the true tangent integrator `CriticalPoint` uses).
    pub fn linear_evolve_fd(&self, t: f64, dt: f64, about: &StateVector, about_result: &StateVector, result: &mut StateVector, integrator: &mut Integrator, flow: &FlowParamsCell) {
        const EPS: f64 = 1e-7;
        let mut perturbed = about.clone();
        perturbed.mul_add(EPS, self);
        perturbed.full_evolve(t, dt, result, integrator, flow);
        result.sub_assign(about_result);
        result.scale(1.0 / EPS);
    }

    /// Reverse-time integration of the adjoint state `self` against a stored
    /// forward trajectory (spec.md §4.3's `TimeStepAdjoint`/`BuildRHSAdjoint`):
    /// advection of the adjoint quantities by the direct flow, plus the
    /// linear buoyancy/background coupling transposed. `trajectory` is the
    /// ordered sequence of base snapshots spaced by `dt`, most recent
    /// (time `t`) first, as produced by [`Self::full_evolve_with_trajectory`].
    /// The extra gradient-of-base forcing terms `IMEXRK::BuildRHSAdjoint`
    /// adds beyond this (the `u1Forcing`/`u2Forcing`/`u3Forcing` blocks) are
    /// not implemented: nothing in this crate's Newton-Krylov problems
    /// exercises them (see `DESIGN.md`), so they are left as a documented
    /// scope reduction rather than guessed at.
    pub fn adjoint_evolve(&self, dt: f64, trajectory: &[StateVector], result: &mut StateVector, integrator: &mut Integrator, flow: &FlowParamsCell) {
        result.u1 = self.u1.clone();
        result.u2 = self.u2.clone();
        result.u3 = self.u3.clone();
        result.b = self.b.clone();
        for base in trajectory.iter().rev() {
            integrator.step_adjoint(&mut result.u1, &mut result.u2, &mut result.u3, &mut result.b, base, dt, flow);
        }
    }

    /// Runs [`Self::full_evolve`] while recording a snapshot every `stride`
    /// steps, for later use by [`Self::adjoint_evolve`] (spec.md §4.4:
    /// "the base trajectory must be supplied as an ordered sequence of
    /// intermediate states spaced by the integrator's fixed adjoint step").
    pub fn full_evolve_with_trajectory(&self, t: f64, dt: f64, stride: usize, integrator: &mut Integrator, flow: &FlowParamsCell) -> (StateVector, Vec<StateVector>) {
        let steps = (t / dt).round().max(1.0) as usize;
        let actual_dt = t / steps as f64;
        let mut current = self.clone();
        let mut trajectory = Vec::with_capacity(steps / stride.max(1) + 1);
        for step in 0..steps {
            if step % stride.max(1) == 0 {
                trajectory.push(current.clone());
            }
            integrator.step(&mut current.u1, &mut current.u2, &mut current.u3, &mut current.b, actual_dt, flow);
        }
        (current, trajectory)
    }

    /// Phase-shifts the state in `x` by `shift` (a translation by
    /// `shift/k1` along the periodic direction), the symmetry
    /// `RemovePhaseShift`/its inverse exploit to fix the otherwise-free
    /// translation invariance of a travelling wave.
    pub fn phase_shift(&mut self, grid: &GridParams, shift: f64) {
        for field in [&mut self.u1, &mut self.u2, &mut self.u3, &mut self.b] {
            let n1 = field.field.n1();
            for i in 0..n1 {
                let signed_k = if i <= n1 / 2 { i as isize } else { i as isize - n1 as isize };
                let angle = 2.0 * std::f64::consts::PI * signed_k as f64 * shift / grid.l1;
                let rotor = num_complex::Complex64::new(angle.cos(), angle.sin());
                for j in 0..field.field.n2() {
                    for v in field.field.stack_mut(i, j) {
                        *v *= rotor;
                    }
                }
            }
        }
    }

    /// Finds (and removes) the phase shift that zeros the imaginary part of
    /// the first horizontal harmonic of `u1`'s `(1, 0)` coefficient at the
    /// midplane, fixing the translational symmetry; returns the shift
    /// applied so the caller can apply the same correction to a paired
    /// eigenvector (`StateVector::RemovePhaseShift`).
    pub fn remove_phase_shift(&mut self, grid: &GridParams) -> f64 {
        let mid = grid.n3 / 2;
        let coeff = *self.u1.field.get(1, 0, mid);
        let shift = if coeff.norm() > 1e-14 {
            -coeff.arg() * grid.l1 / (2.0 * std::f64::consts::PI)
        } else {
            0.0
        };
        self.phase_shift(grid, shift);
        shift
    }

    /// Seeds every Fourier coefficient below wavenumber index 3 (in every
    /// horizontal direction) with small-amplitude noise, as
    /// `StateVector::ExciteLowWavenumbers` does to break exact symmetry when
    /// starting a simulation from a symmetric initial condition.
    pub fn excite_low_wavenumbers(&mut self, magnitude: f64, seed: u64) {
        let mut state = seed.max(1);
        let mut next = move || {
            // xorshift64*, deterministic and dependency-free.
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state as f64 / u64::MAX as f64) * 2.0 - 1.0
        };
        for field in [&mut self.u1, &mut self.u2, &mut self.u3, &mut self.b] {
            let n1 = field.field.n1();
            let n2 = field.field.n2();
            let n3 = field.field.n3();
            for i in 0..n1.min(3) {
                for j in 0..n2.min(3) {
                    for k in 0..n3.min(3) {
                        let perturb = num_complex::Complex64::new(next(), next()) * magnitude;
                        let current = *field.field.get(i, j, k);
                        field.field.set(i, j, k, current + perturb);
                    }
                }
            }
        }
    }

    /// Builds an internal-wave initial condition plus a shear background
    /// (`TrackSolution.cpp`'s ansatz: `U1 = omega*(m/k)*sin(kx+mz) + sin(z)`,
    /// `U3 = -omega*sin(kx+mz)`, `B = cos(kx+mz)`), supplemented here per
    /// SPEC_FULL.md §C.3 as a reusable constructor rather than inline CLI
    /// glue.
    pub fn internal_wave_seed(grid: &GridParams, ri: f64, k: f64, m: f64, fft: &crate::fft::FftPlanCache) -> Self {
        let omega = (ri * k * k / (k * k + m * m)).sqrt();

        let xs = crate::grid::fourier_points(grid.l1, grid.n1);
        let zs = crate::grid::vertical_points(grid.l3, grid.n3, grid.vertical_basis);

        let mut u1n = NodalField::from_grid(grid, Some(BoundaryCondition::Neumann));
        let mut u3n = NodalField::from_grid(grid, Some(BoundaryCondition::Dirichlet));
        let mut bn = NodalField::from_grid(grid, Some(BoundaryCondition::Neumann));

        for (i, &x) in xs.iter().enumerate() {
            for j in 0..grid.n2 {
                for (kk, &z) in zs.iter().enumerate() {
                    let phase = k * x + m * z;
                    u1n.field.set(i, j, kk, omega * (m / k) * phase.sin() + z.sin());
                    u3n.field.set(i, j, kk, -omega * phase.sin());
                    bn.field.set(i, j, kk, phase.cos());
                }
            }
        }

        let mut state = StateVector::zeros(grid);
        u1n.to_modal(&mut state.u1, grid, fft);
        u3n.to_modal(&mut state.u3, grid, fft);
        bn.to_modal(&mut state.b, grid, fft);
        state
    }
}

/// `StateVector` extended with one continuation parameter (`Ri`), used for
/// Newton-Krylov search over relative periodic orbits as `Ri` varies
/// (spec.md §5, `ExtendedStateVector.h`).
#[derive(Clone)]
pub struct ExtendedStateVector {
    pub x: StateVector,
    pub p: f64,
}

impl ExtendedStateVector {
    pub fn zeros(grid: &GridParams) -> Self {
        Self { x: StateVector::zeros(grid), p: 0.0 }
    }

    pub fn dot(&self, other: &ExtendedStateVector) -> f64 {
        self.x.dot(&other.x) + self.p * other.p
    }

    pub fn norm2(&self) -> f64 {
        self.dot(self)
    }

    pub fn norm(&self) -> f64 {
        self.norm2().sqrt()
    }

    pub fn mul_add(&mut self, alpha: f64, other: &ExtendedStateVector) {
        self.x.mul_add(alpha, &other.x);
        self.p += alpha * other.p;
    }

    pub fn add_assign(&mut self, other: &ExtendedStateVector) {
        self.mul_add(1.0, other);
    }

    pub fn sub_assign(&mut self, other: &ExtendedStateVector) {
        self.mul_add(-1.0, other);
    }

    pub fn scale(&mut self, alpha: f64) {
        self.x.scale(alpha);
        self.p *= alpha;
    }

    pub fn zero(&mut self) {
        self.x.zero();
        self.p = 0.0;
    }

    pub fn enforce_bcs(&mut self) {
        self.x.enforce_bcs();
    }

    /// Evolves `x` for time `t`, with `Ri` taken from `self.p` and restored
    /// afterwards (`ExtendedStateVector::FullEvolve`'s save/restore around
    /// the inner evolve, implemented panic-safely by
    /// [`FlowParamsCell::with_ri`]).
    pub fn full_evolve(&self, t: f64, dt: f64, result: &mut ExtendedStateVector, integrator: &mut Integrator, flow: &FlowParamsCell) {
        flow.with_ri(self.p, || {
            self.x.full_evolve(t, dt, &mut result.x, integrator, flow);
        });
        result.p = self.p;
    }
}

/// `(x, v, p)`: a state, an eigenvector of its tangent map, and the
/// parameter at which the eigenvalue crosses the unit circle/imaginary axis
/// (spec.md §5, `FindCriticalPoint.cpp`'s `CriticalPoint`).
#[derive(Clone)]
pub struct CriticalPoint {
    pub x: StateVector,
    pub v: StateVector,
    pub p: f64,
}

impl CriticalPoint {
    pub fn zeros(grid: &GridParams) -> Self {
        Self {
            x: StateVector::zeros(grid),
            v: StateVector::zeros(grid),
            p: 0.0,
        }
    }

    pub fn dot(&self, other: &CriticalPoint) -> f64 {
        self.x.dot(&other.x) + self.v.dot(&other.v) + self.p * other.p
    }

    pub fn norm2(&self) -> f64 {
        self.dot(self)
    }

    pub fn norm(&self) -> f64 {
        self.norm2().sqrt()
    }

    pub fn mul_add(&mut self, alpha: f64, other: &CriticalPoint) {
        self.x.mul_add(alpha, &other.x);
        self.v.mul_add(alpha, &other.v);
        self.p += alpha * other.p;
    }

    pub fn add_assign(&mut self, other: &CriticalPoint) {
        self.mul_add(1.0, other);
    }

    pub fn sub_assign(&mut self, other: &CriticalPoint) {
        self.mul_add(-1.0, other);
    }

    pub fn scale(&mut self, alpha: f64) {
        self.x.scale(alpha);
        self.v.scale(alpha);
        self.p *= alpha;
    }

    pub fn zero(&mut self) {
        self.x.zero();
        self.v.zero();
        self.p = 0.0;
    }

    pub fn enforce_bcs(&mut self) {
        self.x.enforce_bcs();
        self.v.enforce_bcs();
    }

    /// `FindCriticalPoint::EnforceConstraints`: orthogonalizes `v` against
    /// the phase-shift generator `ddx(x)`, removes the horizontal mean from
    /// `v.u1` and `v.b` (another symmetry direction), then rescales `v` to
    /// carry the fixed `weight` energy.
    pub fn enforce_constraints(&mut self, grid: &GridParams, flow: &FlowParamsCell, weight: f64) {
        let mut params = flow.get();
        params.ri = self.p;
        flow.set(params);

        let mut phase_shift = StateVector::zeros(grid);
        phase_shift.u1 = ddx(&self.x.u1, grid);
        phase_shift.u2 = ddx(&self.x.u2, grid);
        phase_shift.u3 = ddx(&self.x.u3, grid);
        phase_shift.b = ddx(&self.x.b, grid);

        let norm2 = phase_shift.norm2();
        if norm2 != 0.0 {
            let proj = self.v.dot(&phase_shift) / norm2;
            self.v.mul_add(-proj, &phase_shift);
        }

        self.v.remove_average();
        self.v.rescale(weight);
    }
}

pub fn load_flow_params(path: &std::path::Path) -> Result<FlowParams> {
    crate::io::load_flow_params(path)
}

impl KrylovVector for StateVector {
    fn dot(&self, other: &Self) -> f64 {
        self.dot(other)
    }
    fn mul_add(&mut self, alpha: f64, other: &Self) {
        self.mul_add(alpha, other)
    }
    fn scale(&mut self, alpha: f64) {
        self.scale(alpha)
    }
    fn zero(&mut self) {
        self.zero()
    }
    fn enforce_bcs(&mut self) {
        self.enforce_bcs()
    }
}

impl KrylovVector for ExtendedStateVector {
    fn dot(&self, other: &Self) -> f64 {
        self.dot(other)
    }
    fn mul_add(&mut self, alpha: f64, other: &Self) {
        self.mul_add(alpha, other)
    }
    fn scale(&mut self, alpha: f64) {
        self.scale(alpha)
    }
    fn zero(&mut self) {
        self.zero()
    }
    fn enforce_bcs(&mut self) {
        self.enforce_bcs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::Integrator;

    #[test]
    fn rescale_sets_the_requested_energy() {
        let grid = GridParams::new(2, 1, 3, 1.0, 1.0, 1.0);
        let mut state = StateVector::zeros(&grid);
        state.u1.field.set(0, 0, 0, num_complex::Complex64::new(2.0, 0.0));
        state.rescale(4.0);
        assert!((state.energy() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn phase_shift_then_remove_phase_shift_is_idempotent_at_zero_coefficient() {
        let grid = GridParams::new(4, 1, 3, 2.0 * std::f64::consts::PI, 1.0, 1.0);
        let mut state = StateVector::zeros(&grid);
        let shift = state.remove_phase_shift(&grid);
        assert_eq!(shift, 0.0);
    }

    #[test]
    fn full_evolve_with_trajectory_records_a_snapshot_every_stride_steps() {
        let grid = GridParams::new(4, 1, 5, 2.0 * std::f64::consts::PI, 1.0, 1.0);
        let mut integrator = Integrator::new(grid);
        let flow = FlowParamsCell::new(FlowParams::new(500.0, 8.0, 0.1, grid.l1, grid.l2, grid.l3));
        let state = StateVector::zeros(&grid);
        let (_final_state, trajectory) = state.full_evolve_with_trajectory(4e-3, 1e-3, 2, &mut integrator, &flow);
        assert_eq!(trajectory.len(), 2);
    }

    #[test]
    fn adjoint_evolve_of_zero_state_along_a_quiescent_trajectory_stays_zero() {
        let grid = GridParams::new(4, 1, 5, 2.0 * std::f64::consts::PI, 1.0, 1.0);
        let mut integrator = Integrator::new(grid);
        let flow = FlowParamsCell::new(FlowParams::new(500.0, 8.0, 0.1, grid.l1, grid.l2, grid.l3));
        let adjoint = StateVector::zeros(&grid);
        let trajectory = vec![StateVector::zeros(&grid), StateVector::zeros(&grid)];
        let mut result = StateVector::zeros(&grid);
        adjoint.adjoint_evolve(1e-3, &trajectory, &mut result, &mut integrator, &flow);
        assert!(result.norm2().sqrt() < 1e-10);
    }
}

impl KrylovVector for CriticalPoint {
    fn dot(&self, other: &Self) -> f64 {
        self.dot(other)
    }
    fn mul_add(&mut self, alpha: f64, other: &Self) {
        self.mul_add(alpha, other)
    }
    fn scale(&mut self, alpha: f64) {
        self.scale(alpha)
    }
    fn zero(&mut self) {
        self.zero()
    }
    fn enforce_bcs(&mut self) {
        self.enforce_bcs()
    }
}
