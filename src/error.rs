// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Error type for all engine-related errors. This should be the *only*
//! error enum that is publicly visible; every module-local error converts
//! into it via `From`.

use thiserror::Error;

use crate::{
    analysis::AnalysisError, cross_section::CrossSectionError, curfit::CurfitError,
    filters::FilterError, kurucz::KuruczError, linear::LinearSystemError,
    numeric::matrix::MatrixError, numeric::spline::SplineError, slit::SlitError,
    spectral_range::SpectralRangeError,
};

/// The *only* publicly visible error from the engine.
///
/// Each variant records whether the originating fault is recoverable per
/// record/window or fatal for the whole run.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Out of memory / allocation failure. Always fatal for the current
    /// record.
    #[error("allocation failed: {0}")]
    Alloc(String),

    /// Numerical failure while decomposing or solving the linear system.
    #[error("linear system error: {0}")]
    LinearSystem(#[from] LinearSystemError),

    /// The nonlinear driver (Curfit) failed to converge or hit a numerical
    /// singularity.
    #[error("curve fitting error: {0}")]
    Curfit(#[from] CurfitError),

    /// Cross-section preparation failed (I₀-correction, convolution,
    /// orthogonalisation, ...).
    #[error("cross-section preparation error: {0}")]
    CrossSection(#[from] CrossSectionError),

    /// Wavelength calibration (Kurucz) failed for a row.
    #[error("Kurucz calibration error: {0}")]
    Kurucz(#[from] KuruczError),

    /// A slit-function configuration or evaluation was invalid.
    #[error("slit function error: {0}")]
    Slit(#[from] SlitError),

    /// A filter (Kaiser/Savitzky-Golay/...) was misconfigured.
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    /// A spectral-range operation failed (essentially alloc-only).
    #[error("spectral range error: {0}")]
    SpectralRange(#[from] SpectralRangeError),

    /// A matrix/table-loading error.
    #[error("matrix error: {0}")]
    Matrix(#[from] MatrixError),

    /// A cubic-spline error.
    #[error("spline error: {0}")]
    Spline(#[from] SplineError),

    /// The per-window analysis driver failed (recalibration, the
    /// nonlinear fit, or spike detection); the affected window is
    /// skipped for this record.
    #[error("analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    /// Reference spectrum unavailable or mismatched in length with the
    /// assigned detector row; the affected window is skipped.
    #[error("reference data unavailable or mismatched: {0}")]
    RefData(String),

    /// Cooperative cancellation requested by the caller.
    #[error("analysis cancelled by user request")]
    UserStop,

    /// Invalid configuration detected at load time; always fatal.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether the driver should recover locally (flag the affected
    /// window/row and write sentinel outputs) rather than abort the whole
    /// run.
    pub fn recoverable(&self) -> bool {
        match self {
            EngineError::Alloc(_) | EngineError::Config(_) | EngineError::UserStop => false,
            EngineError::Analysis(e) => !e.is_user_stop(),
            EngineError::LinearSystem(_)
            | EngineError::Curfit(_)
            | EngineError::CrossSection(_)
            | EngineError::Kurucz(_)
            | EngineError::Slit(_)
            | EngineError::Filter(_)
            | EngineError::SpectralRange(_)
            | EngineError::Matrix(_)
            | EngineError::Spline(_)
            | EngineError::RefData(_) => true,
        }
    }
}
