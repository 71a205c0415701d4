//! IMEX Runge-Kutta time integrator (spec.md §3), grounded on `IMEXRK.cpp`:
//! an explicit RK treatment of the nonlinear advection and buoyancy terms,
//! Crank-Nicolson for vertical diffusion, and a fractional-step pressure
//! projection enforcing incompressibility each sub-stage.

use crate::fft::FftPlanCache;
use crate::field::{ModalField, NodalField};
use crate::grid::{cached_cheb_second_derivative_matrix, BoundaryCondition, GridParams};
use crate::operators::{d2dz2, ddx, ddy, ddz};
use crate::params::FlowParamsCell;
use nalgebra::{Complex as NaComplex, DMatrix};
use num_complex::Complex64;

/// Third-order low-storage IMEX Runge-Kutta coefficients, exactly the
/// three-stage scheme `IMEXRK.cpp` uses (`s = 3`).
const STAGES: usize = 3;
const BETA: [f64; STAGES] = [4.0 / 15.0, 1.0 / 15.0, 1.0 / 6.0];
const ZETA: [f64; STAGES] = [0.0, -17.0 / 60.0, -5.0 / 12.0];

/// One prognostic field plus its explicit-term accumulator and implicit-RHS
/// scratch buffer: `(u, r, R)` in `IMEXRK.cpp`'s naming.
struct Stage {
    explicit_accum: ModalField,
    implicit_rhs: ModalField,
}

impl Stage {
    fn zeros(grid: &GridParams, bc: BoundaryCondition) -> Self {
        Self {
            explicit_accum: ModalField::zeros(grid, Some(bc)),
            implicit_rhs: ModalField::zeros(grid, Some(bc)),
        }
    }
}

/// Owns every scratch field the time-stepping loop needs so a step never
/// allocates (spec.md §3, "the integrator owns its scratch fields" — the
/// original's file-scope statics of REDESIGN FLAGS item 5, reworked as
/// per-instance fields).
pub struct Integrator {
    pub grid: GridParams,
    stage1: Stage,
    stage2: Stage,
    stage3: Stage,
    stage_b: Stage,
    pressure: ModalField,
    background_u1: NodalField,
    fft: FftPlanCache,
}

impl Integrator {
    pub fn new(grid: GridParams) -> Self {
        Self {
            stage1: Stage::zeros(&grid, BoundaryCondition::Neumann),
            stage2: Stage::zeros(&grid, BoundaryCondition::Neumann),
            stage3: Stage::zeros(&grid, BoundaryCondition::Dirichlet),
            stage_b: Stage::zeros(&grid, BoundaryCondition::Neumann),
            pressure: ModalField::zeros(&grid, Some(BoundaryCondition::Neumann)),
            background_u1: NodalField::from_grid(&grid, None),
            grid,
            fft: FftPlanCache::new(),
        }
    }

    /// Sets the steady background shear `U(z)` added to `u1` for the
    /// nonlinear-term evaluation (`U1_tot` in `IMEXRK.cpp`).
    pub fn set_background_shear(&mut self, profile: impl Fn(f64) -> f64) {
        let zs = crate::grid::vertical_points(self.grid.l3, self.grid.n3, self.grid.vertical_basis);
        for (k, &z) in zs.iter().enumerate() {
            let value = profile(z);
            for i in 0..self.grid.n1 {
                for j in 0..self.grid.n2 {
                    self.background_u1.field.set(i, j, k, value);
                }
            }
        }
    }

    /// Advances `(u1, u2, u3, b, p)` by one full time step of size `dt`,
    /// exactly the `s`-stage sequence in `IMEXRK::TimeStep`: explicit RK
    /// predictor, nonlinear RHS assembly, Crank-Nicolson diffusion solve,
    /// divergence removal, and dealiasing filter, once per stage.
    pub fn step(
        &mut self,
        u1: &mut ModalField,
        u2: &mut ModalField,
        u3: &mut ModalField,
        b: &mut ModalField,
        dt: f64,
        flow: &FlowParamsCell,
    ) {
        for k in 0..STAGES {
            let h = dt * sub_step_fraction(k);
            self.explicit_rk(u1, u2, u3, b, h, k);
            self.build_rhs(u1, u2, u3, b, flow);
            self.finish_rhs(h, k);
            self.crank_nicolson(u1, u2, u3, b, h, flow);
            self.remove_divergence(u1, u2, u3, 1.0 / h);
            self.filter_all(u1, u2, u3, b);
        }
    }

    fn explicit_rk(
        &mut self,
        u1: &ModalField,
        u2: &ModalField,
        u3: &ModalField,
        b: &ModalField,
        h: f64,
        k: usize,
    ) {
        let zeta = ZETA[k];
        let dpdx = ddx(&self.pressure, &self.grid);
        let dpdy = ddy(&self.pressure, &self.grid);
        let dpdz = ddz(&self.pressure, &self.grid);

        self.stage1.implicit_rhs = u1.clone();
        self.stage1.implicit_rhs.axpy(h * zeta, &self.stage1.explicit_accum);
        self.stage1.implicit_rhs.axpy(-h, &dpdx);

        if self.grid.is_three_dimensional() {
            self.stage2.implicit_rhs = u2.clone();
            self.stage2.implicit_rhs.axpy(h * zeta, &self.stage2.explicit_accum);
            self.stage2.implicit_rhs.axpy(-h, &dpdy);
        }

        self.stage3.implicit_rhs = u3.clone();
        self.stage3.implicit_rhs.axpy(h * zeta, &self.stage3.explicit_accum);
        self.stage3.implicit_rhs.axpy(-h, &dpdz);

        self.stage_b.implicit_rhs = b.clone();
        self.stage_b.implicit_rhs.axpy(h * zeta, &self.stage_b.explicit_accum);

        self.stage1.explicit_accum.zero();
        self.stage2.explicit_accum.zero();
        self.stage3.explicit_accum.zero();
        self.stage_b.explicit_accum.zero();
    }

    /// Accumulates the nonlinear advection and buoyancy terms into
    /// `r1`/`r2`/`r3`/`rB` (`IMEXRK::BuildRHS`), by forming products in
    /// nodal space and differentiating the result back in modal space.
    fn build_rhs(&mut self, u1: &ModalField, u2: &ModalField, u3: &ModalField, b: &ModalField, flow: &FlowParamsCell) {
        let ri = flow.get().ri;

        let mut buoyancy_no_mean = b.clone();
        buoyancy_no_mean.remove_horizontal_mean();
        self.stage3.explicit_accum.axpy(ri, &buoyancy_no_mean);

        self.stage_b.explicit_accum.axpy(-1.0, u3);

        let mut u1_tot_nodal = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Neumann));
        u1.to_nodal(&mut u1_tot_nodal, &self.grid, &self.fft);
        add_background(&mut u1_tot_nodal, &self.background_u1);

        let mut u2_nodal = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Neumann));
        u2.to_nodal(&mut u2_nodal, &self.grid, &self.fft);

        let mut u3_nodal = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Dirichlet));
        u3.to_nodal(&mut u3_nodal, &self.grid, &self.fft);

        let mut b_nodal = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Neumann));
        b.to_nodal(&mut b_nodal, &self.grid, &self.fft);

        let mut product = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Neumann));
        let mut modal_product = ModalField::zeros(&self.grid, Some(BoundaryCondition::Neumann));

        nodal_product(&mut product, &u1_tot_nodal, &u1_tot_nodal);
        product.to_modal(&mut modal_product, &self.grid, &self.fft);
        let term = ddx(&modal_product, &self.grid);
        self.stage1.explicit_accum.axpy(-1.0, &term);

        let mut product_dir = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Dirichlet));
        let mut modal_product_dir = ModalField::zeros(&self.grid, Some(BoundaryCondition::Dirichlet));

        nodal_product(&mut product_dir, &u1_tot_nodal, &u3_nodal);
        product_dir.to_modal(&mut modal_product_dir, &self.grid, &self.fft);
        let term = ddz(&modal_product_dir, &self.grid);
        self.stage1.explicit_accum.axpy(-1.0, &term);

        nodal_product(&mut product, &u3_nodal, &u3_nodal);
        product.to_modal(&mut modal_product, &self.grid, &self.fft);
        let term_x = ddx(&modal_product_dir, &self.grid);
        let term_z = ddz(&modal_product, &self.grid);
        self.stage3.explicit_accum.axpy(-1.0, &term_x);
        self.stage3.explicit_accum.axpy(-1.0, &term_z);

        if self.grid.is_three_dimensional() {
            nodal_product(&mut product, &u2_nodal, &u2_nodal);
            product.to_modal(&mut modal_product, &self.grid, &self.fft);
            let term = ddy(&modal_product, &self.grid);
            self.stage2.explicit_accum.axpy(-1.0, &term);

            nodal_product(&mut product, &u2_nodal, &u3_nodal);
            product.to_modal(&mut modal_product, &self.grid, &self.fft);
            let dz_term = ddz(&modal_product, &self.grid);
            let dy_term = ddy(&modal_product, &self.grid);
            self.stage2.explicit_accum.axpy(-1.0, &dz_term);
            self.stage3.explicit_accum.axpy(-1.0, &dy_term);

            nodal_product(&mut product, &u1_tot_nodal, &u2_nodal);
            product.to_modal(&mut modal_product, &self.grid, &self.fft);
            let dy_term = ddy(&modal_product, &self.grid);
            let dx_term = ddx(&modal_product, &self.grid);
            self.stage1.explicit_accum.axpy(-1.0, &dy_term);
            self.stage2.explicit_accum.axpy(-1.0, &dx_term);
        }

        nodal_product(&mut product_dir, &b_nodal, &u3_nodal);
        product_dir.to_modal(&mut modal_product_dir, &self.grid, &self.fft);
        let term = ddz(&modal_product_dir, &self.grid);
        self.stage_b.explicit_accum.axpy(-1.0, &term);

        if self.grid.is_three_dimensional() {
            nodal_product(&mut product, &u2_nodal, &b_nodal);
            product.to_modal(&mut modal_product, &self.grid, &self.fft);
            let term = ddy(&modal_product, &self.grid);
            self.stage_b.explicit_accum.axpy(-1.0, &term);
        }

        nodal_product(&mut product, &u1_tot_nodal, &b_nodal);
        product.to_modal(&mut modal_product, &self.grid, &self.fft);
        let term = ddx(&modal_product, &self.grid);
        self.stage_b.explicit_accum.axpy(-1.0, &term);
    }

    fn finish_rhs(&mut self, h: f64, k: usize) {
        let beta = BETA[k];
        self.stage1.implicit_rhs.axpy(h * beta, &self.stage1.explicit_accum);
        if self.grid.is_three_dimensional() {
            self.stage2.implicit_rhs.axpy(h * beta, &self.stage2.explicit_accum);
        }
        self.stage3.implicit_rhs.axpy(h * beta, &self.stage3.explicit_accum);
        self.stage_b.implicit_rhs.axpy(h * beta, &self.stage_b.explicit_accum);
    }

    /// Crank-Nicolson vertical-diffusion solve: adds the explicit half of
    /// the diffusion operator to the RHS, then inverts `(I - c D^2)` per
    /// horizontal wavenumber against it (`IMEXRK::CrankNicolson`/`CNSolve`).
    fn crank_nicolson(
        &mut self,
        u1: &mut ModalField,
        u2: &mut ModalField,
        u3: &mut ModalField,
        b: &mut ModalField,
        h: f64,
        flow: &FlowParamsCell,
    ) {
        let params = flow.get();
        let diffuse = |field: &ModalField| d2dz2(field, &self.grid);

        let explicit_half = 0.5 * h / params.re;
        let term = diffuse(u1);
        self.stage1.implicit_rhs.axpy(explicit_half, &term);
        cn_solve(&mut self.stage1.implicit_rhs, u1, &self.grid, explicit_half, BoundaryCondition::Neumann);

        if self.grid.is_three_dimensional() {
            let term = diffuse(u2);
            self.stage2.implicit_rhs.axpy(explicit_half, &term);
            cn_solve(&mut self.stage2.implicit_rhs, u2, &self.grid, explicit_half, BoundaryCondition::Neumann);
        }

        let term = diffuse(u3);
        self.stage3.implicit_rhs.axpy(explicit_half, &term);
        cn_solve(&mut self.stage3.implicit_rhs, u3, &self.grid, explicit_half, BoundaryCondition::Dirichlet);

        let buoyancy_half = 0.5 * h / (params.re * params.pr);
        let term = diffuse(b);
        self.stage_b.implicit_rhs.axpy(buoyancy_half, &term);
        cn_solve(&mut self.stage_b.implicit_rhs, b, &self.grid, buoyancy_half, BoundaryCondition::Neumann);
    }

    /// Projects `(u1, u2, u3)` onto a divergence-free field by solving a
    /// Poisson equation for a pressure correction `q` and subtracting its
    /// gradient, folding `q` back into `p` (`IMEXRK::RemoveDivergence`).
    fn remove_divergence(&mut self, u1: &mut ModalField, u2: &mut ModalField, u3: &mut ModalField, pressure_multiplier: f64) {
        let mut divergence = ddx(u1, &self.grid);
        if self.grid.is_three_dimensional() {
            divergence.axpy(1.0, &ddy(u2, &self.grid));
        }
        divergence.axpy(1.0, &ddz(u3, &self.grid));

        let q = solve_poisson(&divergence, &self.grid);

        u1.axpy(-1.0, &ddx(&q, &self.grid));
        if self.grid.is_three_dimensional() {
            u2.axpy(-1.0, &ddy(&q, &self.grid));
        }
        u3.axpy(-1.0, &ddz(&q, &self.grid));

        self.pressure.axpy(pressure_multiplier, &q);
    }

    fn filter_all(&mut self, u1: &mut ModalField, u2: &mut ModalField, u3: &mut ModalField, b: &mut ModalField) {
        u1.dealias(&self.grid);
        u2.dealias(&self.grid);
        u3.dealias(&self.grid);
        b.dealias(&self.grid);
    }

    /// Advances a perturbation `(u1, u2, u3, b)` by one full IMEX step against
    /// a frozen base trajectory, `IMEXRK::TimeStepLinear`/`BuildRHSLinear`: the
    /// same stage sequence as [`Self::step`], but the nonlinear terms are
    /// bilinear in (perturbation, base) rather than quadratic in the
    /// perturbation alone. The base's nodal representation is computed once
    /// per call and held fixed across every sub-stage — `StateVector.cpp`
    /// evolves a true time-varying base trajectory through a second solver
    /// instance; freezing it at the value supplied is the simplification
    /// spec.md §4.3 licenses ("against a frozen base trajectory supplied by
    /// the caller"), recorded as an Open Question decision in `DESIGN.md`.
    pub fn step_linear(
        &mut self,
        u1: &mut ModalField,
        u2: &mut ModalField,
        u3: &mut ModalField,
        b: &mut ModalField,
        base: &crate::state::StateVector,
        dt: f64,
        flow: &FlowParamsCell,
    ) {
        let base_nodal = BaseNodal::compute(base, &self.grid, &self.background_u1, &self.fft);
        for k in 0..STAGES {
            let h = dt * sub_step_fraction(k);
            self.explicit_rk(u1, u2, u3, b, h, k);
            self.build_rhs_linear(u1, u2, u3, b, &base_nodal, flow);
            self.finish_rhs(h, k);
            self.crank_nicolson(u1, u2, u3, b, h, flow);
            self.remove_divergence(u1, u2, u3, 1.0 / h);
            self.filter_all(u1, u2, u3, b);
        }
    }

    /// `BuildRHSLinear`: bilinear nonlinear terms, self-product variants
    /// carrying a factor of 2 (`2*ddx(u1*U1_tot)`), cross-product variants a
    /// factor of 1 (`ddz(u1*U3_tot + U1_tot*u3)`).
    fn build_rhs_linear(
        &mut self,
        u1: &ModalField,
        u2: &ModalField,
        u3: &ModalField,
        b: &ModalField,
        base: &BaseNodal,
        flow: &FlowParamsCell,
    ) {
        let ri = flow.get().ri;

        let mut buoyancy_no_mean = b.clone();
        buoyancy_no_mean.remove_horizontal_mean();
        self.stage3.explicit_accum.axpy(ri, &buoyancy_no_mean);
        self.stage_b.explicit_accum.axpy(-1.0, u3);

        let mut pert_u1_nodal = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Neumann));
        u1.to_nodal(&mut pert_u1_nodal, &self.grid, &self.fft);
        let mut pert_u2_nodal = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Neumann));
        u2.to_nodal(&mut pert_u2_nodal, &self.grid, &self.fft);
        let mut pert_u3_nodal = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Dirichlet));
        u3.to_nodal(&mut pert_u3_nodal, &self.grid, &self.fft);
        let mut pert_b_nodal = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Neumann));
        b.to_nodal(&mut pert_b_nodal, &self.grid, &self.fft);

        let mut product_n = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Neumann));
        let mut product_d = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Dirichlet));
        let mut modal_n = ModalField::zeros(&self.grid, Some(BoundaryCondition::Neumann));
        let mut modal_d = ModalField::zeros(&self.grid, Some(BoundaryCondition::Dirichlet));

        // u1 self/cross terms
        linear_self_product(&mut product_n, &pert_u1_nodal, &base.u1_tot);
        product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
        self.stage1.explicit_accum.axpy(-1.0, &ddx(&modal_n, &self.grid));

        linear_cross_product(&mut product_d, &pert_u1_nodal, &base.u3, &base.u1_tot, &pert_u3_nodal);
        product_d.to_modal(&mut modal_d, &self.grid, &self.fft);
        self.stage1.explicit_accum.axpy(-1.0, &ddz(&modal_d, &self.grid));

        linear_self_product(&mut product_n, &pert_u3_nodal, &base.u3);
        product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
        self.stage3.explicit_accum.axpy(-1.0, &ddz(&modal_n, &self.grid));
        self.stage3.explicit_accum.axpy(-1.0, &ddx(&modal_d, &self.grid));

        if self.grid.is_three_dimensional() {
            linear_self_product(&mut product_n, &pert_u2_nodal, &base.u2);
            product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
            self.stage2.explicit_accum.axpy(-1.0, &ddy(&modal_n, &self.grid));

            linear_cross_product(&mut product_n, &pert_u2_nodal, &base.u3, &base.u2, &pert_u3_nodal);
            product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
            self.stage2.explicit_accum.axpy(-1.0, &ddz(&modal_n, &self.grid));
            self.stage3.explicit_accum.axpy(-1.0, &ddy(&modal_n, &self.grid));

            linear_cross_product(&mut product_n, &pert_u1_nodal, &base.u2, &base.u1_tot, &pert_u2_nodal);
            product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
            self.stage1.explicit_accum.axpy(-1.0, &ddy(&modal_n, &self.grid));
            self.stage2.explicit_accum.axpy(-1.0, &ddx(&modal_n, &self.grid));
        }

        // buoyancy self/cross terms
        linear_cross_product(&mut product_d, &pert_b_nodal, &base.u3, &base.b, &pert_u3_nodal);
        product_d.to_modal(&mut modal_d, &self.grid, &self.fft);
        self.stage_b.explicit_accum.axpy(-1.0, &ddz(&modal_d, &self.grid));

        if self.grid.is_three_dimensional() {
            linear_cross_product(&mut product_n, &pert_b_nodal, &base.u2, &base.b, &pert_u2_nodal);
            product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
            self.stage_b.explicit_accum.axpy(-1.0, &ddy(&modal_n, &self.grid));
        }

        linear_cross_product(&mut product_n, &pert_b_nodal, &base.u1_tot, &base.b, &pert_u1_nodal);
        product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
        self.stage_b.explicit_accum.axpy(-1.0, &ddx(&modal_n, &self.grid));
    }

    /// Advances an adjoint state `(u1, u2, u3, b)` by one full IMEX step
    /// against a frozen base trajectory (`IMEXRK::TimeStepAdjoint`): only the
    /// "advection of adjoint quantities by the direct flow" block of
    /// `BuildRHSAdjoint` plus the linear buoyancy coupling is implemented —
    /// see [`crate::state::StateVector::adjoint_evolve`]'s docs for the
    /// scope reduction (the base-gradient forcing terms are omitted).
    pub fn step_adjoint(
        &mut self,
        u1: &mut ModalField,
        u2: &mut ModalField,
        u3: &mut ModalField,
        b: &mut ModalField,
        base: &crate::state::StateVector,
        dt: f64,
        flow: &FlowParamsCell,
    ) {
        let base_nodal = BaseNodal::compute(base, &self.grid, &self.background_u1, &self.fft);
        for k in 0..STAGES {
            let h = dt * sub_step_fraction(k);
            self.explicit_rk(u1, u2, u3, b, h, k);
            self.build_rhs_adjoint(u1, u2, u3, b, &base_nodal, flow);
            self.finish_rhs(h, k);
            self.crank_nicolson(u1, u2, u3, b, h, flow);
            self.remove_divergence(u1, u2, u3, 1.0 / h);
            self.filter_all(u1, u2, u3, b);
        }
    }

    fn build_rhs_adjoint(
        &mut self,
        u1: &ModalField,
        u2: &ModalField,
        u3: &ModalField,
        b: &ModalField,
        base: &BaseNodal,
        flow: &FlowParamsCell,
    ) {
        let ri = flow.get().ri;
        self.stage_b.explicit_accum.axpy(ri, u3);

        let mut adj_u1 = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Neumann));
        u1.to_nodal(&mut adj_u1, &self.grid, &self.fft);
        let mut adj_u2 = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Neumann));
        u2.to_nodal(&mut adj_u2, &self.grid, &self.fft);
        let mut adj_u3 = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Dirichlet));
        u3.to_nodal(&mut adj_u3, &self.grid, &self.fft);
        let mut adj_b = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Neumann));
        b.to_nodal(&mut adj_b, &self.grid, &self.fft);

        let mut product_n = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Neumann));
        let mut product_d = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Dirichlet));
        let mut modal_n = ModalField::zeros(&self.grid, Some(BoundaryCondition::Neumann));
        let mut modal_d = ModalField::zeros(&self.grid, Some(BoundaryCondition::Dirichlet));

        nodal_product(&mut product_n, &adj_u1, &base.u1_tot);
        product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
        self.stage1.explicit_accum.axpy(1.0, &ddx(&modal_n, &self.grid));

        nodal_product(&mut product_n, &adj_u1, &base.u3);
        product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
        self.stage1.explicit_accum.axpy(1.0, &ddz(&modal_n, &self.grid));

        nodal_product(&mut product_d, &base.u1_tot, &adj_u3);
        product_d.to_modal(&mut modal_d, &self.grid, &self.fft);
        nodal_product(&mut product_n, &adj_u3, &base.u3);
        product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
        self.stage3.explicit_accum.axpy(1.0, &ddx(&modal_d, &self.grid));
        self.stage3.explicit_accum.axpy(1.0, &ddz(&modal_n, &self.grid));

        if self.grid.is_three_dimensional() {
            nodal_product(&mut product_n, &adj_u2, &base.u2);
            product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
            self.stage2.explicit_accum.axpy(1.0, &ddy(&modal_n, &self.grid));

            nodal_product(&mut product_n, &adj_u2, &base.u3);
            product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
            self.stage2.explicit_accum.axpy(1.0, &ddz(&modal_n, &self.grid));

            nodal_product(&mut product_d, &base.u2, &adj_u3);
            product_d.to_modal(&mut modal_d, &self.grid, &self.fft);
            self.stage3.explicit_accum.axpy(1.0, &ddy(&modal_d, &self.grid));

            nodal_product(&mut product_n, &adj_u1, &base.u2);
            product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
            self.stage1.explicit_accum.axpy(1.0, &ddy(&modal_n, &self.grid));

            nodal_product(&mut product_n, &adj_u2, &base.u1_tot);
            product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
            self.stage2.explicit_accum.axpy(1.0, &ddx(&modal_n, &self.grid));
        }

        nodal_product(&mut product_n, &adj_b, &base.u3);
        product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
        self.stage_b.explicit_accum.axpy(1.0, &ddz(&modal_n, &self.grid));

        if self.grid.is_three_dimensional() {
            nodal_product(&mut product_n, &adj_b, &base.u2);
            product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
            self.stage_b.explicit_accum.axpy(1.0, &ddy(&modal_n, &self.grid));
        }

        nodal_product(&mut product_n, &adj_b, &base.u1_tot);
        product_n.to_modal(&mut modal_n, &self.grid, &self.fft);
        self.stage_b.explicit_accum.axpy(1.0, &ddx(&modal_n, &self.grid));
    }

    /// CFL number from the current nodal velocity plus background shear
    /// (`SPEC_FULL.md` §C.2, grounded on `IMEXRK.cpp`'s checkpoint-interval
    /// CFL computation), surfaced for the caller to act on rather than
    /// silently adapting the time step.
    pub fn cfl(&self, u1: &ModalField, u2: &ModalField, u3: &ModalField, dt: f64) -> f64 {
        let mut u1n = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Neumann));
        u1.to_nodal(&mut u1n, &self.grid, &self.fft);
        let mut u2n = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Neumann));
        u2.to_nodal(&mut u2n, &self.grid, &self.fft);
        let mut u3n = NodalField::from_grid(&self.grid, Some(BoundaryCondition::Dirichlet));
        u3.to_nodal(&mut u3n, &self.grid, &self.fft);

        let dx = self.grid.l1 / self.grid.n1 as f64;
        let dy = if self.grid.is_three_dimensional() {
            self.grid.l2 / self.grid.n2 as f64
        } else {
            f64::INFINITY
        };
        let dz = self.grid.l3 / self.grid.n3 as f64;

        let mut max_ratio: f64 = 0.0;
        for i in 0..self.grid.n1 {
            for j in 0..self.grid.n2 {
                for k in 0..self.grid.n3 {
                    let total_u1 = u1n.field.get(i, j, k) + self.background_u1.field.get(i, j, k);
                    let ratio = total_u1.abs() / dx
                        + u2n.field.get(i, j, k).abs() / dy
                        + u3n.field.get(i, j, k).abs() / dz;
                    max_ratio = max_ratio.max(ratio);
                }
            }
        }
        max_ratio * dt
    }
}

/// The per-stage substep `h[k]`, `IMEXRK.cpp`'s `{8/15, 2/15, 5/15}·deltaT`
/// schedule (summing to `deltaT`), against which `BETA`/`ZETA` are defined.
const H_FRACTION: [f64; STAGES] = [8.0 / 15.0, 2.0 / 15.0, 5.0 / 15.0];

fn sub_step_fraction(k: usize) -> f64 {
    H_FRACTION[k]
}

fn add_background(field: &mut NodalField, background: &NodalField) {
    for i in 0..field.field.n1() {
        for j in 0..field.field.n2() {
            for k in 0..field.field.n3() {
                let v = *field.field.get(i, j, k) + background.field.get(i, j, k);
                field.field.set(i, j, k, v);
            }
        }
    }
}

fn nodal_product(out: &mut NodalField, a: &NodalField, b: &NodalField) {
    use crate::field::NodalExpr;
    out.assign(NodalExpr::field(a).mul(NodalExpr::field(b)));
}

/// The base trajectory's nodal fields, frozen once per [`Integrator::step_linear`]
/// call (see that method's docs for the frozen-trajectory simplification).
struct BaseNodal {
    u1_tot: NodalField,
    u2: NodalField,
    u3: NodalField,
    b: NodalField,
}

impl BaseNodal {
    fn compute(
        base: &crate::state::StateVector,
        grid: &GridParams,
        background: &NodalField,
        fft: &FftPlanCache,
    ) -> Self {
        let mut u1_tot = NodalField::from_grid(grid, Some(BoundaryCondition::Neumann));
        base.u1.to_nodal(&mut u1_tot, grid, fft);
        add_background(&mut u1_tot, background);

        let mut u2 = NodalField::from_grid(grid, Some(BoundaryCondition::Neumann));
        base.u2.to_nodal(&mut u2, grid, fft);

        let mut u3 = NodalField::from_grid(grid, Some(BoundaryCondition::Dirichlet));
        base.u3.to_nodal(&mut u3, grid, fft);

        let mut b = NodalField::from_grid(grid, Some(BoundaryCondition::Neumann));
        base.b.to_nodal(&mut b, grid, fft);

        Self { u1_tot, u2, u3, b }
    }
}

/// Self-product tangent term: `out = 2 * pert * base` (product rule applied
/// to the quadratic term `(base + eps*pert)^2`, first order in `eps`).
fn linear_self_product(out: &mut NodalField, pert: &NodalField, base: &NodalField) {
    use crate::field::NodalExpr;
    out.assign(NodalExpr::field(pert).mul(NodalExpr::field(base)).scale(2.0));
}

/// Cross-product tangent term: `out = pert_a*base_b + base_a*pert_b` (product
/// rule applied to `(base_a + eps*pert_a)(base_b + eps*pert_b)`).
fn linear_cross_product(out: &mut NodalField, pert_a: &NodalField, base_b: &NodalField, base_a: &NodalField, pert_b: &NodalField) {
    use crate::field::NodalExpr;
    out.assign(
        NodalExpr::field(pert_a)
            .mul(NodalExpr::field(base_b))
            .add(NodalExpr::field(base_a).mul(NodalExpr::field(pert_b))),
    );
}

/// Solves `(I - c D^2) x = rhs` independently for every horizontal
/// wavenumber stack, `c` the Crank-Nicolson implicit coefficient.
fn cn_solve(rhs: &mut ModalField, out: &mut ModalField, grid: &GridParams, c: f64, bc: BoundaryCondition) {
    let d2 = cached_cheb_second_derivative_matrix(bc, grid.l3, grid.n3);
    let n = d2.nrows();
    let mut system = DMatrix::<f64>::identity(n, n);
    system -= c * &d2;
    let lu = system.lu();

    for i in 0..grid.n1 {
        for j in 0..grid.n2 {
            let stack = rhs.field.stack(i, j);
            let real = nalgebra::DVector::from_iterator(n, stack.iter().map(|c| c.re));
            let imag = nalgebra::DVector::from_iterator(n, stack.iter().map(|c| c.im));
            let sol_re = lu.solve(&real).unwrap_or_else(|| nalgebra::DVector::zeros(n));
            let sol_im = lu.solve(&imag).unwrap_or_else(|| nalgebra::DVector::zeros(n));
            let dst = out.field.stack_mut(i, j);
            for k in 0..n {
                dst[k] = Complex64::new(sol_re[k], sol_im[k]);
            }
        }
    }
}

/// Solves the horizontal-wavenumber-by-wavenumber Poisson equation for the
/// pressure-correction field: a diagonal Helmholtz shift in the periodic
/// directions plus the dense Chebyshev second-derivative matrix in z.
fn solve_poisson(divergence: &ModalField, grid: &GridParams) -> ModalField {
    let d2 = cached_cheb_second_derivative_matrix(BoundaryCondition::Neumann, grid.l3, grid.n3);
    let n = d2.nrows();
    let kx = crate::grid::fourier_derivative_matrix(grid.l1, grid.n1, 2);
    let ky = if grid.is_three_dimensional() {
        crate::grid::fourier_derivative_matrix(grid.l2, grid.n2, 2)
    } else {
        vec![Complex64::new(0.0, 0.0); grid.n2]
    };

    let mut out = ModalField::zeros(grid, Some(BoundaryCondition::Neumann));
    for i in 0..grid.n1 {
        for j in 0..grid.n2 {
            let horizontal_shift = -(kx[i].re + ky[j].re); // -(-kx^2 - ky^2) = kx^2+ky^2
            let mut system = DMatrix::<NaComplex<f64>>::zeros(n, n);
            for r in 0..n {
                for col in 0..n {
                    let mut v = NaComplex::new(d2[(r, col)], 0.0);
                    if r == col {
                        v -= NaComplex::new(horizontal_shift, 0.0);
                    }
                    system[(r, col)] = v;
                }
            }
            let lu = system.lu();
            let stack = divergence.field.stack(i, j);
            let rhs = nalgebra::DVector::from_iterator(
                n,
                stack.iter().map(|c| NaComplex::new(c.re, c.im)),
            );
            let sol = lu
                .solve(&rhs)
                .unwrap_or_else(|| nalgebra::DVector::from_element(n, NaComplex::new(0.0, 0.0)));
            let dst = out.field.stack_mut(i, j);
            for k in 0..n {
                dst[k] = Complex64::new(sol[k].re, sol[k].im);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridParams;
    use crate::params::FlowParams;

    #[test]
    fn step_preserves_field_shape_and_runs_without_panicking() {
        let grid = GridParams::new(4, 1, 5, 2.0 * std::f64::consts::PI, 1.0, 1.0);
        let mut integrator = Integrator::new(grid);
        let flow = FlowParamsCell::new(FlowParams::new(500.0, 8.0, 0.1, grid.l1, grid.l2, grid.l3));
        let mut u1 = ModalField::zeros(&grid, Some(BoundaryCondition::Neumann));
        let mut u2 = ModalField::zeros(&grid, Some(BoundaryCondition::Neumann));
        let mut u3 = ModalField::zeros(&grid, Some(BoundaryCondition::Dirichlet));
        let mut b = ModalField::zeros(&grid, Some(BoundaryCondition::Neumann));
        integrator.step(&mut u1, &mut u2, &mut u3, &mut b, 1e-3, &flow);
        assert_eq!(u1.field.n1(), 4);
    }

    #[test]
    fn cfl_is_zero_for_a_quiescent_field() {
        let grid = GridParams::new(4, 1, 5, 1.0, 1.0, 1.0);
        let integrator = Integrator::new(grid);
        let u1 = ModalField::zeros(&grid, Some(BoundaryCondition::Neumann));
        let u2 = ModalField::zeros(&grid, Some(BoundaryCondition::Neumann));
        let u3 = ModalField::zeros(&grid, Some(BoundaryCondition::Dirichlet));
        assert_eq!(integrator.cfl(&u1, &u2, &u3, 1e-3), 0.0);
    }

    #[test]
    fn step_linear_of_zero_perturbation_about_any_base_stays_zero() {
        let grid = GridParams::new(4, 1, 5, 2.0 * std::f64::consts::PI, 1.0, 1.0);
        let mut integrator = Integrator::new(grid);
        let flow = FlowParamsCell::new(FlowParams::new(500.0, 8.0, 0.1, grid.l1, grid.l2, grid.l3));
        let mut base = crate::state::StateVector::zeros(&grid);
        base.u1.field.set(1, 0, 0, Complex64::new(0.3, 0.0));
        base.b.field.set(0, 0, 1, Complex64::new(0.1, 0.0));

        let mut u1 = ModalField::zeros(&grid, Some(BoundaryCondition::Neumann));
        let mut u2 = ModalField::zeros(&grid, Some(BoundaryCondition::Neumann));
        let mut u3 = ModalField::zeros(&grid, Some(BoundaryCondition::Dirichlet));
        let mut b = ModalField::zeros(&grid, Some(BoundaryCondition::Neumann));
        integrator.step_linear(&mut u1, &mut u2, &mut u3, &mut b, &base, 1e-3, &flow);

        assert!(u1.norm2().sqrt() < 1e-10);
        assert!(b.norm2().sqrt() < 1e-10);
    }

    #[test]
    fn step_adjoint_of_zero_state_about_any_base_stays_zero() {
        let grid = GridParams::new(4, 1, 5, 2.0 * std::f64::consts::PI, 1.0, 1.0);
        let mut integrator = Integrator::new(grid);
        let flow = FlowParamsCell::new(FlowParams::new(500.0, 8.0, 0.1, grid.l1, grid.l2, grid.l3));
        let mut base = crate::state::StateVector::zeros(&grid);
        base.u1.field.set(1, 0, 0, Complex64::new(0.3, 0.0));
        base.b.field.set(0, 0, 1, Complex64::new(0.1, 0.0));

        let mut u1 = ModalField::zeros(&grid, Some(BoundaryCondition::Neumann));
        let mut u2 = ModalField::zeros(&grid, Some(BoundaryCondition::Neumann));
        let mut u3 = ModalField::zeros(&grid, Some(BoundaryCondition::Dirichlet));
        let mut b = ModalField::zeros(&grid, Some(BoundaryCondition::Neumann));
        integrator.step_adjoint(&mut u1, &mut u2, &mut u3, &mut b, &base, 1e-3, &flow);

        assert!(u1.norm2().sqrt() < 1e-10);
        assert!(b.norm2().sqrt() < 1e-10);
    }
}
