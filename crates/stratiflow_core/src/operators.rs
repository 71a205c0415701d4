//! Differentiation operators acting on [`ModalField`]s (spec.md §4.1,
//! grounded on `Stratiflow.h`'s `ddx`/`ddy`/`ddz` function family).

use crate::field::ModalField;
use crate::grid::{
    cached_cheb_derivative_matrix, cached_cheb_second_derivative_matrix, fourier_derivative_matrix,
    BoundaryCondition, GridParams, VerticalBasis,
};
use num_complex::Complex64;

fn apply_horizontal(field: &mut ModalField, grid: &GridParams, order: usize, along_n1: bool) {
    let diag = if along_n1 {
        fourier_derivative_matrix(grid.l1, grid.n1, order)
    } else {
        fourier_derivative_matrix(grid.l2, grid.n2, order)
    };
    let n1 = field.field.n1();
    let n2 = field.field.n2();
    for i in 0..n1 {
        for j in 0..n2 {
            let k = if along_n1 { diag[i] } else { diag[j] };
            for v in field.field.stack_mut(i, j) {
                *v *= k;
            }
        }
    }
}

/// `d/dx`: a diagonal multiply by `i*kx` in the periodic n1 direction. BC
/// parity is unaffected (x is always periodic).
pub fn ddx(field: &ModalField, grid: &GridParams) -> ModalField {
    let mut out = field.clone();
    apply_horizontal(&mut out, grid, 1, true);
    out
}

/// `d/dy`: as [`ddx`] but along n2, a no-op multiply-by-zero in the 2-D case
/// (n2 == 1 means the only retained index is the zero mode).
pub fn ddy(field: &ModalField, grid: &GridParams) -> ModalField {
    let mut out = field.clone();
    apply_horizontal(&mut out, grid, 1, false);
    out
}

/// `d/dz`: dense Chebyshev differentiation (BC flips parity) when the
/// vertical is bounded, or a diagonal Fourier multiply (BC unaffected) when
/// the vertical is periodic.
pub fn ddz(field: &ModalField, grid: &GridParams) -> ModalField {
    let bc = field.bc.expect("ddz requires a field with a known boundary condition");
    let mut out = ModalField::zeros(grid, Some(bc.flip()));
    match grid.vertical_basis {
        VerticalBasis::Chebyshev => {
            let d = cached_cheb_derivative_matrix(bc, grid.l3, grid.n3);
            apply_dense_vertical(field, &mut out, &d);
        }
        VerticalBasis::FourierPeriodic => {
            let diag = fourier_derivative_matrix(2.0 * grid.l3, grid.n3, 1);
            let n1 = field.field.n1();
            let n2 = field.field.n2();
            for i in 0..n1 {
                for j in 0..n2 {
                    let src = field.field.stack(i, j);
                    let dst = out.field.stack_mut(i, j);
                    for k in 0..dst.len() {
                        dst[k] = src[k] * diag[k.min(diag.len() - 1)];
                    }
                }
            }
        }
    }
    out
}

/// `d2/dz2`: dense second-derivative matrix; parity is unchanged (even-order
/// derivative of a Neumann field is Neumann, and of a Dirichlet field is
/// Dirichlet).
pub fn d2dz2(field: &ModalField, grid: &GridParams) -> ModalField {
    let bc = field.bc.expect("d2dz2 requires a field with a known boundary condition");
    let mut out = ModalField::zeros(grid, Some(bc));
    let d2 = cached_cheb_second_derivative_matrix(bc, grid.l3, grid.n3);
    apply_dense_vertical(field, &mut out, &d2);
    out
}

fn apply_dense_vertical(field: &ModalField, out: &mut ModalField, matrix: &nalgebra::DMatrix<f64>) {
    let n1 = field.field.n1();
    let n2 = field.field.n2();
    for i in 0..n1 {
        for j in 0..n2 {
            let src = field.field.stack(i, j);
            let dst = out.field.stack_mut(i, j);
            for row in 0..matrix.nrows() {
                let mut acc = Complex64::new(0.0, 0.0);
                for col in 0..matrix.ncols() {
                    acc += src[col] * matrix[(row, col)];
                }
                dst[row] = acc;
            }
        }
    }
}

/// Interpolates a field from one grid resolution onto another (used by
/// `LoadAndInterpolate`, spec.md §6): both horizontally and vertically by
/// zero-padding or truncating the stored coefficients, since this crate's
/// single non-staggered collocation grid (SPEC_FULL.md §D) keeps every
/// resolution's Chebyshev points at the same relative (cosine-spaced)
/// locations.
pub fn reinterpolate_to_grid(field: &ModalField, _from: &GridParams, to: &GridParams) -> ModalField {
    let mut out = ModalField::zeros(to, field.bc);
    let copy_n1 = field.field.n1().min(to.n1);
    let copy_n2 = field.field.n2().min(to.n2);
    let copy_n3 = field.field.n3().min(out.field.n3());
    for i in 0..copy_n1 {
        for j in 0..copy_n2 {
            let src = field.field.stack(i, j);
            let dst = out.field.stack_mut(i, j);
            dst[..copy_n3].copy_from_slice(&src[..copy_n3]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridParams;

    #[test]
    fn ddx_of_cos_kx_is_minus_k_sin_kx_in_modal_space() {
        let grid = GridParams::new(8, 1, 3, 2.0 * std::f64::consts::PI, 1.0, 1.0);
        let mut field = ModalField::zeros(&grid, Some(BoundaryCondition::Neumann));
        // set wavenumber-1 coefficient directly (modal space).
        for k in 0..field.field.n3() {
            field.field.set(1, 0, k, Complex64::new(1.0, 0.0));
        }
        let dx = ddx(&field, &grid);
        let expected = Complex64::new(0.0, 1.0);
        assert!((dx.field.get(1, 0, 0) - expected).norm() < 1e-9);
    }

    #[test]
    fn ddz_flips_boundary_condition() {
        let grid = GridParams::new(2, 1, 5, 1.0, 1.0, 1.0);
        let field = ModalField::zeros(&grid, Some(BoundaryCondition::Dirichlet));
        let dz = ddz(&field, &grid);
        assert_eq!(dz.bc, Some(BoundaryCondition::Neumann));
    }

    #[test]
    fn reinterpolate_to_grid_truncates_higher_resolution_source() {
        let from = GridParams::new(8, 1, 9, 1.0, 1.0, 1.0);
        let to = GridParams::new(4, 1, 5, 1.0, 1.0, 1.0);
        let mut field = ModalField::zeros(&from, Some(BoundaryCondition::Neumann));
        field.field.set(0, 0, 0, Complex64::new(2.0, 0.0));
        let out = reinterpolate_to_grid(&field, &from, &to);
        assert_eq!(out.field.get(0, 0, 0), &Complex64::new(2.0, 0.0));
    }
}
