//! One-dimensional spectral bases, collocation grids, and the dense/diagonal
//! differentiation matrices built from them.
//!
//! Everything here is built once (lazily, and cached process-wide by the
//! parameters that determine it) and then read-only, per spec.md §4.1. This
//! crate uses a single non-staggered vertical collocation grid for every
//! field regardless of boundary condition (SPEC_FULL.md §D) rather than the
//! original's two offset grids, so there is no reinterpolation matrix here —
//! BC parity is tracked purely by the `BoundaryCondition` tag a field
//! carries, consumed by `ddz`/`d2dz2` in `operators.rs`.

use nalgebra::DMatrix;
use num_complex::Complex64;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// Whether the vertical direction resolves a full spanwise dimension or is
/// collapsed to a single spanwise mode. Replaces the pervasive `N2 == 1`
/// branch the original carries with one construction-time flag (REDESIGN
/// FLAGS item 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dimensionality {
    TwoD,
    ThreeD,
}

/// Which basis the vertical direction uses. Chosen once at grid construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerticalBasis {
    /// Chebyshev collocation on a bounded interval of length 2L.
    Chebyshev,
    /// Fourier modes on a periodic vertical of length 2L.
    FourierPeriodic,
}

/// A field's boundary condition in the vertical. Only meaningful when the
/// vertical basis is `Chebyshev`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryCondition {
    Neumann,
    Dirichlet,
}

impl BoundaryCondition {
    /// A first vertical derivative of a Neumann field is Dirichlet and
    /// vice versa (spec.md §4.1).
    pub fn flip(self) -> Self {
        match self {
            BoundaryCondition::Neumann => BoundaryCondition::Dirichlet,
            BoundaryCondition::Dirichlet => BoundaryCondition::Neumann,
        }
    }
}

/// Compile-time-ish grid description: dimension counts and domain lengths.
/// Held by value and passed through the integrator rather than hidden in
/// statics, so changing resolution means constructing a new `GridParams`
/// rather than mutating global constants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GridParams {
    pub n1: usize,
    pub n2: usize,
    pub n3: usize,
    pub l1: f64,
    pub l2: f64,
    pub l3: f64,
    pub dimensionality: Dimensionality,
    pub vertical_basis: VerticalBasis,
}

impl GridParams {
    pub fn new(n1: usize, n2: usize, n3: usize, l1: f64, l2: f64, l3: f64) -> Self {
        let dimensionality = if n2 == 1 {
            Dimensionality::TwoD
        } else {
            Dimensionality::ThreeD
        };
        Self {
            n1,
            n2,
            n3,
            l1,
            l2,
            l3,
            dimensionality,
            vertical_basis: VerticalBasis::Chebyshev,
        }
    }

    /// Packed conjugate-symmetric extent of the n3 axis. Only the
    /// `FourierPeriodic` vertical is ever transformed in n3 (real-to-complex,
    /// `N3/2 + 1` independent coefficients survive); a `Chebyshev` vertical
    /// stays at full nodal extent `N3` in every representation, since
    /// differentiation there is a dense matrix acting directly on collocation
    /// values rather than a diagonal wavenumber multiply.
    pub fn actual_n3(&self) -> usize {
        match self.vertical_basis {
            VerticalBasis::FourierPeriodic => self.n3 / 2 + 1,
            VerticalBasis::Chebyshev => self.n3,
        }
    }

    pub fn is_three_dimensional(&self) -> bool {
        self.dimensionality == Dimensionality::ThreeD
    }
}

/// N evenly spaced points covering `[0, L)`, the standard periodic Fourier
/// collocation grid.
pub fn fourier_points(l: f64, n: usize) -> Vec<f64> {
    (0..n).map(|i| l * i as f64 / n as f64).collect()
}

/// Chebyshev-Gauss-Lobatto points mapped onto an interval of length `2L`
/// centred at zero (`[-L, L]`), or (when `basis` is periodic) Fourier points
/// on a vertical of length `2L`.
pub fn vertical_points(l: f64, n: usize, basis: VerticalBasis) -> Vec<f64> {
    match basis {
        VerticalBasis::Chebyshev => cheb_points(n - 1)
            .into_iter()
            .map(|x| x * l)
            .collect(),
        VerticalBasis::FourierPeriodic => fourier_points(2.0 * l, n)
            .into_iter()
            .map(|x| x - l)
            .collect(),
    }
}

/// Standard Chebyshev-Gauss-Lobatto points on `[-1, 1]`, `n+1` of them,
/// ordered from `1` down to `-1` (Trefethen's `cheb.m` convention).
fn cheb_points(n: usize) -> Vec<f64> {
    if n == 0 {
        return vec![0.0];
    }
    (0..=n)
        .map(|j| (std::f64::consts::PI * j as f64 / n as f64).cos())
        .collect()
}

/// Trefethen's `cheb.m` differentiation matrix on `n+1` Chebyshev points,
/// unscaled (valid on `[-1, 1]`).
fn cheb_derivative_matrix_raw(n: usize) -> DMatrix<f64> {
    if n == 0 {
        return DMatrix::from_element(1, 1, 0.0);
    }
    let x = cheb_points(n);
    let m = n + 1;
    let c: Vec<f64> = (0..m)
        .map(|i| if i == 0 || i == n { 2.0 } else { 1.0 } * if i % 2 == 0 { 1.0 } else { -1.0 })
        .collect();

    let mut d = DMatrix::from_element(m, m, 0.0);
    for i in 0..m {
        for j in 0..m {
            if i == j {
                continue;
            }
            d[(i, j)] = (c[i] / c[j]) / (x[i] - x[j]);
        }
    }
    for i in 0..m {
        let row_sum: f64 = (0..m).filter(|&j| j != i).map(|j| d[(i, j)]).sum();
        d[(i, i)] = -row_sum;
    }
    d
}

/// First-derivative matrix respecting `originalBC` (the boundary condition
/// of the field being differentiated; the result carries the flipped BC,
/// tracked by the caller, not this matrix).
pub fn cheb_derivative_matrix(_original_bc: BoundaryCondition, l: f64, n: usize) -> DMatrix<f64> {
    cheb_derivative_matrix_raw(n - 1) / l
}

/// Second-derivative matrix; BC parity is unchanged by an even-order
/// derivative, so this is simply `D^2`.
pub fn cheb_second_derivative_matrix(bc: BoundaryCondition, l: f64, n: usize) -> DMatrix<f64> {
    let d = cheb_derivative_matrix(bc, l, n) * l; // undo scale, square, rescale
    (&d * &d) / (l * l)
}

/// Diagonal modal wavenumber matrix `i*k` (order 1) or `-k^2` (order 2) for
/// a periodic dimension of length `L` with `N` collocation points, packed in
/// canonical (non-negative-then-negative) FFT order. The Nyquist entry is
/// zeroed for `order == 1` (spec.md §4.1), since its derivative is
/// ambiguous for a real signal.
pub fn fourier_derivative_matrix(l: f64, n: usize, order: usize) -> Vec<Complex64> {
    let mut out = Vec::with_capacity(n);
    for k in 0..n {
        let signed_k = if k <= n / 2 { k as isize } else { k as isize - n as isize };
        let kval = 2.0 * std::f64::consts::PI * signed_k as f64 / l;
        let entry = match order {
            1 => Complex64::new(0.0, kval),
            2 => Complex64::new(-kval * kval, 0.0),
            _ => panic!("fourier_derivative_matrix: unsupported order {order}"),
        };
        out.push(entry);
    }
    if order == 1 && n % 2 == 0 {
        out[n / 2] = Complex64::new(0.0, 0.0);
    }
    out
}

/// Process-wide cache of built operator matrices, keyed by the parameters
/// that determine them (length, point count, boundary condition, kind) so
/// that — unlike the original's unconditional `static` — a changed domain
/// length correctly rebuilds rather than silently reusing a stale matrix
/// (REDESIGN FLAGS item 3; SPEC_FULL.md §C.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum OperatorKey {
    ChebD1(u64, usize, BoundaryConditionKey),
    ChebD2(u64, usize, BoundaryConditionKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BoundaryConditionKey {
    Neumann,
    Dirichlet,
}

impl From<BoundaryCondition> for BoundaryConditionKey {
    fn from(bc: BoundaryCondition) -> Self {
        match bc {
            BoundaryCondition::Neumann => BoundaryConditionKey::Neumann,
            BoundaryCondition::Dirichlet => BoundaryConditionKey::Dirichlet,
        }
    }
}

fn bits(l: f64) -> u64 {
    l.to_bits()
}

static OPERATOR_CACHE: OnceLock<Mutex<HashMap<OperatorKey, DMatrix<f64>>>> = OnceLock::new();

fn cache() -> &'static Mutex<HashMap<OperatorKey, DMatrix<f64>>> {
    OPERATOR_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Cached accessor for [`cheb_derivative_matrix`].
pub fn cached_cheb_derivative_matrix(bc: BoundaryCondition, l: f64, n: usize) -> DMatrix<f64> {
    let key = OperatorKey::ChebD1(bits(l), n, bc.into());
    let mut guard = cache().lock().expect("operator cache poisoned");
    guard
        .entry(key)
        .or_insert_with(|| cheb_derivative_matrix(bc, l, n))
        .clone()
}

/// Cached accessor for [`cheb_second_derivative_matrix`].
pub fn cached_cheb_second_derivative_matrix(
    bc: BoundaryCondition,
    l: f64,
    n: usize,
) -> DMatrix<f64> {
    let key = OperatorKey::ChebD2(bits(l), n, bc.into());
    let mut guard = cache().lock().expect("operator cache poisoned");
    guard
        .entry(key)
        .or_insert_with(|| cheb_second_derivative_matrix(bc, l, n))
        .clone()
}

use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourier_points_span_domain() {
        let pts = fourier_points(2.0 * std::f64::consts::PI, 8);
        assert_eq!(pts.len(), 8);
        assert!(pts[0].abs() < 1e-12);
        assert!(pts[7] < 2.0 * std::f64::consts::PI);
    }

    #[test]
    fn cheb_points_cover_interval_endpoints() {
        let pts = cheb_points(8);
        assert!((pts[0] - 1.0).abs() < 1e-12);
        assert!((pts[8] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn cheb_derivative_matrix_differentiates_linear_function_exactly() {
        let n = 9;
        let d = cheb_derivative_matrix_raw(n - 1);
        let x = cheb_points(n - 1);
        let f: Vec<f64> = x.iter().map(|&xi| 3.0 * xi + 1.0).collect();
        let f = nalgebra::DVector::from_vec(f);
        let df = &d * &f;
        for v in df.iter() {
            assert!((v - 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn fourier_derivative_matrix_zeros_nyquist() {
        let diag = fourier_derivative_matrix(1.0, 8, 1);
        assert_eq!(diag[4], Complex64::new(0.0, 0.0));
    }

    #[test]
    fn fourier_second_derivative_matches_negative_k_squared() {
        let diag = fourier_derivative_matrix(2.0 * std::f64::consts::PI, 8, 2);
        let k1 = 2.0 * std::f64::consts::PI * 1.0 / (2.0 * std::f64::consts::PI);
        assert!((diag[1].re + k1 * k1).abs() < 1e-9);
    }

    #[test]
    fn operator_cache_reuses_and_invalidates_on_length_change() {
        let a = cached_cheb_derivative_matrix(BoundaryCondition::Dirichlet, 1.0, 9);
        let b = cached_cheb_derivative_matrix(BoundaryCondition::Dirichlet, 1.0, 9);
        assert_eq!(a, b);
        let c = cached_cheb_derivative_matrix(BoundaryCondition::Dirichlet, 2.0, 9);
        assert_ne!(a, c);
    }
}
