use thiserror::Error;

/// Structured error taxonomy for the fatal classes in the design's error
/// model: configuration problems and out-of-bounds access. Convergence
/// failures are deliberately not represented here — Newton and GMRES report
/// their best iterate and residual instead of returning an error (see
/// `newton_krylov::NewtonResult`).
#[derive(Debug, Error)]
pub enum StratiflowError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(
        "resolution mismatch: grid is ({n1}, {n2}, {n3}) but snapshot carries ({snap_n1}, {snap_n2}, {snap_n3})"
    )]
    ResolutionMismatch {
        n1: usize,
        n2: usize,
        n3: usize,
        snap_n1: usize,
        snap_n2: usize,
        snap_n3: usize,
    },

    #[error("index out of bounds: {what} index {index} is not within [0, {bound})")]
    Bounds {
        what: &'static str,
        index: usize,
        bound: usize,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
