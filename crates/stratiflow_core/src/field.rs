//! Field storage and algebra (spec.md §2, §4).
//!
//! A `Field<T>` is a flat, column-major buffer over `(n1, n2, n3)` with `n3`
//! fastest-varying, so a "stack" (all `n3` values at a fixed `(n1, n2)`) is
//! always contiguous. `NodalField` stores real physical-space values;
//! `ModalField` stores the complex horizontal-Fourier / vertical-Chebyshev
//! representation spec.md §2 calls "modal". Expression composition
//! (REDESIGN FLAGS item 1) is a small tagged-variant AST rather than
//! polymorphic dispatch: `NodalExpr` covers the elementwise products and
//! sums `BuildRHS` needs, and is materialized stack-by-stack in parallel via
//! `rayon` at the point of assignment.

use crate::error::StratiflowError;
use crate::fft::FftPlanCache;
use crate::grid::{BoundaryCondition, Dimensionality, GridParams, VerticalBasis};
use anyhow::{bail, Result};
use num_complex::Complex64;
use rayon::prelude::*;

/// Flat storage over `(n1, n2, n3)`, `n3` fastest.
#[derive(Debug, Clone)]
pub struct Field<T> {
    n1: usize,
    n2: usize,
    n3: usize,
    data: Vec<T>,
}

impl<T: Clone + Default + Send + Sync> Field<T> {
    pub fn zeros(n1: usize, n2: usize, n3: usize) -> Self {
        Self {
            n1,
            n2,
            n3,
            data: vec![T::default(); n1 * n2 * n3],
        }
    }

    #[inline]
    fn stack_start(&self, n1: usize, n2: usize) -> usize {
        self.n3 * (n2 + self.n2 * n1)
    }

    /// The contiguous `n3`-length slice of values at a fixed horizontal index.
    pub fn stack(&self, n1: usize, n2: usize) -> &[T] {
        let start = self.stack_start(n1, n2);
        &self.data[start..start + self.n3]
    }

    pub fn stack_mut(&mut self, n1: usize, n2: usize) -> &mut [T] {
        let start = self.stack_start(n1, n2);
        &mut self.data[start..start + self.n3]
    }

    /// A single value at a fixed `n3`, varying `(n1, n2)`: a strided view,
    /// used by the horizontal differentiation/transform passes.
    pub fn vertical_slice(&self, n3: usize) -> Vec<T> {
        (0..self.n1)
            .flat_map(|i| (0..self.n2).map(move |j| (i, j)))
            .map(|(i, j)| self.stack(i, j)[n3].clone())
            .collect()
    }

    pub fn set_vertical_slice(&mut self, n3: usize, values: &[T]) {
        let mut k = 0;
        for i in 0..self.n1 {
            for j in 0..self.n2 {
                self.stack_mut(i, j)[n3] = values[k].clone();
                k += 1;
            }
        }
    }

    pub fn n1(&self) -> usize {
        self.n1
    }
    pub fn n2(&self) -> usize {
        self.n2
    }
    pub fn n3(&self) -> usize {
        self.n3
    }

    pub fn get(&self, n1: usize, n2: usize, n3: usize) -> &T {
        &self.stack(n1, n2)[n3]
    }

    pub fn set(&mut self, n1: usize, n2: usize, n3: usize, value: T) {
        self.stack_mut(n1, n2)[n3] = value;
    }

    /// Parallel iteration over every stack, invoking `f(n1, n2, stack_slice)`.
    pub fn for_each_stack<F>(&self, f: F)
    where
        F: Fn(usize, usize, &[T]) + Sync,
    {
        (0..self.n1).into_par_iter().for_each(|i| {
            for j in 0..self.n2 {
                f(i, j, self.stack(i, j));
            }
        });
    }

    pub fn for_each_stack_mut<F>(&mut self, f: F)
    where
        F: Fn(usize, usize, &mut [T]) + Sync,
    {
        let n2 = self.n2;
        let n3 = self.n3;
        self.data
            .par_chunks_mut(n3)
            .enumerate()
            .for_each(|(idx, chunk)| {
                let i = idx / n2;
                let j = idx % n2;
                f(i, j, chunk);
            });
    }

    pub fn check_bounds(&self, n1: usize, n2: usize, n3: usize) -> Result<()> {
        if n1 >= self.n1 {
            bail!(StratiflowError::Bounds { what: "n1", index: n1, bound: self.n1 });
        }
        if n2 >= self.n2 {
            bail!(StratiflowError::Bounds { what: "n2", index: n2, bound: self.n2 });
        }
        if n3 >= self.n3 {
            bail!(StratiflowError::Bounds { what: "n3", index: n3, bound: self.n3 });
        }
        Ok(())
    }
}

/// Is wavenumber index `index` (of `n` total, canonical FFT order) inside the
/// retained (non-dealiased) 2/3-rule band? `n <= 1` is always retained (the
/// collapsed spanwise direction in the 2-D case never needs dealiasing).
/// This is the single definition referenced by both the in-place filter and
/// the parallel stack-skip logic, so the two can never drift apart
/// (SPEC_FULL.md §D).
pub fn is_retained_periodic_index(index: usize, n: usize) -> bool {
    if n <= 1 {
        return true;
    }
    index < n / 3 || index > n - n / 3
}

/// The equivalent retained-band test for a packed (real-to-complex) last
/// axis, where only non-negative wavenumbers are stored: retained while
/// `index < n_full / 3`.
pub fn is_retained_packed_index(index: usize, n_full: usize) -> bool {
    if n_full <= 1 {
        return true;
    }
    index < n_full / 3
}

/// Whether the stack at horizontal index `(n1, n2)` lies entirely within the
/// 2/3-rule retained band and therefore is worth visiting; stacks outside the
/// band are identically zero after filtering and can be skipped by both the
/// filter itself and any parallel accumulation over stacks.
pub fn is_retained_stack(n1: usize, n2: usize, grid: &GridParams) -> bool {
    is_retained_periodic_index(n1, grid.n1)
        && is_retained_periodic_index(n2, grid.n2)
}

/// Real, physical-space field. Carries the vertical boundary condition of the
/// quantity it holds (`None` for fields, like pressure-correction terms, with
/// no fixed parity).
#[derive(Debug, Clone)]
pub struct NodalField {
    pub field: Field<f64>,
    pub bc: Option<BoundaryCondition>,
}

impl NodalField {
    pub fn zeros(n1: usize, n2: usize, n3: usize, bc: Option<BoundaryCondition>) -> Self {
        Self {
            field: Field::zeros(n1, n2, n3),
            bc,
        }
    }

    pub fn from_grid(grid: &GridParams, bc: Option<BoundaryCondition>) -> Self {
        Self::zeros(grid.n1, grid.n2, grid.n3, bc)
    }

    /// Forward transform into `out`: real-to-complex along the last
    /// transformed axis (n3, only when the vertical basis is periodic) and
    /// full complex-to-complex along n1 (and n2, if 3-D). Divides by the
    /// total transformed length so that `ToModal` followed by `ToNodal`
    /// round-trips exactly, matching spec.md §4.2's normalization convention.
    pub fn to_modal(&self, out: &mut ModalField, grid: &GridParams, ffts: &FftPlanCache) {
        assert_eq!(out.bc, self.bc);
        let n1 = self.field.n1();
        let n2 = self.field.n2();
        let n3 = self.field.n3();
        let actual_n3 = grid.actual_n3();

        // Embed the real stack as complex, transforming n3 when it is itself
        // a periodic (Fourier) axis; otherwise copy through unchanged
        // (Chebyshev collocation values stay nodal in z).
        let mut complex = Field::<Complex64>::zeros(n1, n2, n3);
        for i in 0..n1 {
            for j in 0..n2 {
                let real_stack = self.field.stack(i, j);
                let stack = complex.stack_mut(i, j);
                for k in 0..n3 {
                    stack[k] = Complex64::new(real_stack[k], 0.0);
                }
                if grid.vertical_basis == VerticalBasis::FourierPeriodic {
                    ffts.forward(stack);
                }
            }
        }

        // n1 transform (full complex, every (n2, n3) pair).
        for j in 0..n2 {
            for k in 0..n3 {
                let mut col = complex.vertical_slice_n1(j, k);
                ffts.forward(&mut col);
                complex.set_vertical_slice_n1(j, k, &col);
            }
        }

        // n2 transform, only when 3-D.
        if grid.dimensionality == Dimensionality::ThreeD {
            for i in 0..n1 {
                for k in 0..n3 {
                    let mut col = complex.vertical_slice_n2(i, k);
                    ffts.forward(&mut col);
                    complex.set_vertical_slice_n2(i, k, &col);
                }
            }
        }

        let norm = (n1 as f64)
            * (if grid.dimensionality == Dimensionality::ThreeD { n2 as f64 } else { 1.0 })
            * (if grid.vertical_basis == VerticalBasis::FourierPeriodic { n3 as f64 } else { 1.0 });

        for i in 0..n1 {
            for j in 0..n2 {
                let src = complex.stack(i, j);
                let dst = out.field.stack_mut(i, j);
                for k in 0..actual_n3 {
                    dst[k] = src[k] / norm;
                }
            }
        }
    }

    #[cfg(test)]
    pub fn fill(&mut self, f: impl Fn(usize, usize, usize) -> f64) {
        for i in 0..self.field.n1() {
            for j in 0..self.field.n2() {
                for k in 0..self.field.n3() {
                    let v = f(i, j, k);
                    self.field.set(i, j, k, v);
                }
            }
        }
    }
}

impl Field<Complex64> {
    fn vertical_slice_n1(&self, n2: usize, n3: usize) -> Vec<Complex64> {
        (0..self.n1()).map(|i| *self.get(i, n2, n3)).collect()
    }
    fn set_vertical_slice_n1(&mut self, n2: usize, n3: usize, values: &[Complex64]) {
        for (i, v) in values.iter().enumerate() {
            self.set(i, n2, n3, *v);
        }
    }
    fn vertical_slice_n2(&self, n1: usize, n3: usize) -> Vec<Complex64> {
        (0..self.n2()).map(|j| *self.get(n1, j, n3)).collect()
    }
    fn set_vertical_slice_n2(&mut self, n1: usize, n3: usize, values: &[Complex64]) {
        for (j, v) in values.iter().enumerate() {
            self.set(n1, j, n3, *v);
        }
    }
}

/// Complex, spectral-coefficient field, packed to `(n1, n2, actual_n3)`
/// (spec.md §2's "Modal" representation).
#[derive(Debug, Clone)]
pub struct ModalField {
    pub field: Field<Complex64>,
    pub bc: Option<BoundaryCondition>,
}

impl ModalField {
    pub fn zeros(grid: &GridParams, bc: Option<BoundaryCondition>) -> Self {
        Self {
            field: Field::zeros(grid.n1, grid.n2, grid.actual_n3()),
            bc,
        }
    }

    /// Zeros every coefficient outside the 2/3-rule retained band, skipping
    /// whole stacks that lie entirely inside the dealiased region (the same
    /// [`is_retained_stack`] test used by every parallel reduction over
    /// stacks, per the Open Question resolution in SPEC_FULL.md §D).
    pub fn dealias(&mut self, grid: &GridParams) {
        let n3_full = grid.n3;
        let vertical_basis = grid.vertical_basis;
        let n1 = self.field.n1();
        let n2 = self.field.n2();
        for i in 0..n1 {
            if !is_retained_periodic_index(i, n1) {
                // entire stack lies in the dealiased band: zero it directly
                // rather than visiting each n3 entry individually.
                for j in 0..n2 {
                    for v in self.field.stack_mut(i, j) {
                        *v = Complex64::new(0.0, 0.0);
                    }
                }
                continue;
            }
            for j in 0..n2 {
                if !is_retained_periodic_index(j, n2) {
                    for v in self.field.stack_mut(i, j) {
                        *v = Complex64::new(0.0, 0.0);
                    }
                    continue;
                }
                if vertical_basis == VerticalBasis::FourierPeriodic {
                    let stack = self.field.stack_mut(i, j);
                    for (k, v) in stack.iter_mut().enumerate() {
                        if !is_retained_packed_index(k, n3_full) {
                            *v = Complex64::new(0.0, 0.0);
                        }
                    }
                }
                // Chebyshev vertical: dealiasing n3 would require a full
                // Chebyshev-coefficient transform this crate does not build
                // (derivatives act on nodal values via dense matrices
                // instead); left as a no-op, a deliberate scope reduction
                // rather than a silent gap (SPEC_FULL.md §D).
            }
        }
    }

    /// Inverse of [`NodalField::to_modal`]; unnormalized (matches `rustfft`'s
    /// convention, and the forward transform already divided by `N`).
    pub fn to_nodal(&self, out: &mut NodalField, grid: &GridParams, ffts: &FftPlanCache) {
        assert_eq!(out.bc, self.bc);
        let n1 = grid.n1;
        let n2 = grid.n2;
        let n3 = grid.n3;
        let actual_n3 = grid.actual_n3();

        let mut complex = Field::<Complex64>::zeros(n1, n2, n3);
        for i in 0..n1 {
            for j in 0..n2 {
                let src = self.field.stack(i, j);
                let dst = complex.stack_mut(i, j);
                for k in 0..actual_n3 {
                    dst[k] = src[k];
                }
            }
        }
        if grid.vertical_basis == VerticalBasis::FourierPeriodic {
            // conjugate symmetry of a real signal: X[N1-i, N2-j, N3-k] =
            // conj(X[i, j, k]), not just within a single (i, j) stack.
            for i in 0..n1 {
                let conj_i = (n1 - i) % n1;
                for j in 0..n2 {
                    let conj_j = (n2 - j) % n2;
                    for k in actual_n3..n3 {
                        let value = self.field.get(conj_i, conj_j, n3 - k).conj();
                        complex.set(i, j, k, value);
                    }
                }
            }
        }

        if grid.dimensionality == Dimensionality::ThreeD {
            for i in 0..n1 {
                for k in 0..n3 {
                    let mut col = complex.vertical_slice_n2(i, k);
                    ffts.inverse(&mut col);
                    complex.set_vertical_slice_n2(i, k, &col);
                }
            }
        }

        for j in 0..n2 {
            for k in 0..n3 {
                let mut col = complex.vertical_slice_n1(j, k);
                ffts.inverse(&mut col);
                complex.set_vertical_slice_n1(j, k, &col);
            }
        }

        for i in 0..n1 {
            for j in 0..n2 {
                let stack = complex.stack_mut(i, j);
                if grid.vertical_basis == VerticalBasis::FourierPeriodic {
                    ffts.inverse(stack);
                }
                let dst = out.field.stack_mut(i, j);
                for k in 0..n3 {
                    dst[k] = stack[k].re;
                }
            }
        }
    }

    /// Zeros the horizontal mean (the `(0, 0)` stack) of a field, as
    /// `FindCriticalPoint.cpp`'s `RemoveAverage` does for the eigenvector
    /// components carrying a physically irrelevant additive constant
    /// (spec.md §4.5, SPEC_FULL.md §C.4).
    pub fn remove_horizontal_mean(&mut self) {
        for v in self.field.stack_mut(0, 0) {
            *v = Complex64::new(0.0, 0.0);
        }
    }

    pub fn zero(&mut self) {
        for v in self.field.data.iter_mut() {
            *v = Complex64::new(0.0, 0.0);
        }
    }

    pub fn axpy(&mut self, alpha: f64, other: &ModalField) {
        for (a, b) in self.field.data.iter_mut().zip(other.field.data.iter()) {
            *a += alpha * b;
        }
    }

    pub fn scale(&mut self, alpha: f64) {
        for v in self.field.data.iter_mut() {
            *v *= alpha;
        }
    }

    pub fn dot(&self, other: &ModalField) -> f64 {
        self.field
            .data
            .iter()
            .zip(other.field.data.iter())
            .map(|(a, b)| (a.conj() * b).re)
            .sum()
    }

    pub fn norm2(&self) -> f64 {
        self.dot(self)
    }
}

/// A small tagged-variant AST over [`NodalField`]s (REDESIGN FLAGS item 1),
/// covering the elementwise products and sums the nonlinear-term assembly in
/// `BuildRHS` needs. Borrowed operands are bounded by the lifetime of the
/// enclosing assignment; there is no dynamic dispatch or `Box<dyn Fn>` in the
/// hot evaluation path.
pub enum NodalExpr<'a> {
    Field(&'a NodalField),
    Scalar(f64),
    Add(Box<NodalExpr<'a>>, Box<NodalExpr<'a>>),
    Mul(Box<NodalExpr<'a>>, Box<NodalExpr<'a>>),
    ScalarMul(f64, Box<NodalExpr<'a>>),
}

impl<'a> NodalExpr<'a> {
    pub fn field(f: &'a NodalField) -> Self {
        NodalExpr::Field(f)
    }

    pub fn add(self, other: NodalExpr<'a>) -> Self {
        NodalExpr::Add(Box::new(self), Box::new(other))
    }

    pub fn mul(self, other: NodalExpr<'a>) -> Self {
        NodalExpr::Mul(Box::new(self), Box::new(other))
    }

    pub fn scale(self, alpha: f64) -> Self {
        NodalExpr::ScalarMul(alpha, Box::new(self))
    }

    fn eval_point(&self, i: usize, j: usize, k: usize) -> f64 {
        match self {
            NodalExpr::Field(f) => *f.field.get(i, j, k),
            NodalExpr::Scalar(s) => *s,
            NodalExpr::Add(a, b) => a.eval_point(i, j, k) + b.eval_point(i, j, k),
            NodalExpr::Mul(a, b) => a.eval_point(i, j, k) * b.eval_point(i, j, k),
            NodalExpr::ScalarMul(alpha, a) => alpha * a.eval_point(i, j, k),
        }
    }
}

impl NodalField {
    /// Materializes `expr` into `self`, evaluating every stack independently
    /// in parallel (spec.md §4.2's "materialised per stack in parallel").
    pub fn assign(&mut self, expr: NodalExpr<'_>) {
        let n2 = self.field.n2();
        self.field.for_each_stack_mut(|i, j, stack| {
            for (k, v) in stack.iter_mut().enumerate() {
                *v = expr.eval_point(i, j, k);
            }
            let _ = n2;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridParams;
    use approx::assert_relative_eq;

    #[test]
    fn stack_is_contiguous_and_round_trips_through_get_set() {
        let mut field = Field::<f64>::zeros(3, 2, 4);
        field.set(1, 1, 2, 7.5);
        assert_eq!(*field.get(1, 1, 2), 7.5);
        assert_eq!(field.stack(1, 1)[2], 7.5);
    }

    #[test]
    fn is_retained_periodic_index_keeps_low_and_high_wraparound_band() {
        assert!(is_retained_periodic_index(0, 12));
        assert!(is_retained_periodic_index(3, 12));
        assert!(!is_retained_periodic_index(4, 12));
        assert!(!is_retained_periodic_index(7, 12));
        assert!(is_retained_periodic_index(9, 12));
    }

    #[test]
    fn is_retained_periodic_index_always_true_for_collapsed_dimension() {
        assert!(is_retained_periodic_index(0, 1));
    }

    #[test]
    fn dealias_zeros_stacks_outside_retained_band() {
        let grid = GridParams::new(12, 1, 9, 1.0, 1.0, 1.0);
        let mut modal = ModalField::zeros(&grid, None);
        for v in modal.field.stack_mut(5, 0) {
            *v = Complex64::new(1.0, 1.0);
        }
        modal.dealias(&grid);
        for v in modal.field.stack(5, 0) {
            assert_eq!(*v, Complex64::new(0.0, 0.0));
        }
    }

    #[test]
    fn remove_horizontal_mean_zeros_only_the_dc_stack() {
        let grid = GridParams::new(4, 1, 5, 1.0, 1.0, 1.0);
        let mut modal = ModalField::zeros(&grid, None);
        for v in modal.field.stack_mut(0, 0) {
            *v = Complex64::new(3.0, 0.0);
        }
        for v in modal.field.stack_mut(1, 0) {
            *v = Complex64::new(2.0, 0.0);
        }
        modal.remove_horizontal_mean();
        assert_eq!(modal.field.stack(0, 0)[0], Complex64::new(0.0, 0.0));
        assert_eq!(modal.field.stack(1, 0)[0], Complex64::new(2.0, 0.0));
    }

    #[test]
    fn nodal_expr_multiplies_and_adds_elementwise() {
        let mut a = NodalField::zeros(2, 1, 3, None);
        let mut b = NodalField::zeros(2, 1, 3, None);
        a.fill(|i, _, k| (i + k) as f64);
        b.fill(|_, _, _| 2.0);
        let mut out = NodalField::zeros(2, 1, 3, None);
        out.assign(NodalExpr::field(&a).mul(NodalExpr::field(&b)).add(NodalExpr::Scalar(1.0)));
        for i in 0..2 {
            for k in 0..3 {
                let expected = 2.0 * (i + k) as f64 + 1.0;
                assert!((out.field.get(i, 0, k) - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn modal_to_nodal_to_modal_round_trips_on_a_low_wavenumber_signal() {
        let grid = GridParams::new(8, 1, 1, 2.0 * std::f64::consts::PI, 1.0, 1.0);
        let mut nodal = NodalField::zeros(8, 1, 1, None);
        let xs = crate::grid::fourier_points(grid.l1, grid.n1);
        for (i, &x) in xs.iter().enumerate() {
            nodal.field.set(i, 0, 0, x.cos());
        }
        let ffts = FftPlanCache::new();
        let mut modal = ModalField::zeros(&grid, None);
        nodal.to_modal(&mut modal, &grid, &ffts);
        let mut back = NodalField::zeros(8, 1, 1, None);
        modal.to_nodal(&mut back, &grid, &ffts);
        for i in 0..8 {
            assert_relative_eq!(nodal.field.get(i, 0, 0), back.field.get(i, 0, 0), epsilon = 1e-9);
        }
    }
}
