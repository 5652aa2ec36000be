// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

/*!
Useful constants.

All constants *must* be double precision: the engine should do as many
calculations as possible in double precision before converting to a lower
precision, if that is ever required.
*/

pub use std::f64::consts::PI;

/// Maximum number of outer Marquardt-Levenberg iterations before `Curfit`
/// reports [`crate::curfit::CurfitError::Convergence`].
pub const CURFIT_MAX_ITER: usize = 100;

/// Values of `|Y_i - Yfit_i|` outside `[EPSILON, 1e16]` are excluded from the
/// unweighted chi-square accumulation to avoid floating point noise near
/// zero. Mirrors the original engine's `Fchisq`.
pub const CHISQ_NEGLIGIBLE_RESIDUAL: f64 = 1e-16;
pub const CHISQ_HUGE_RESIDUAL: f64 = 1e16;

/// Singular values smaller than `max(m,n) * w_max * SVD_EPSILON` are treated
/// as zero by the in-house SVD backend.
pub const SVD_EPSILON: f64 = 2.2204e-16;

/// Minimum number of unflagged fit points required before a fit is even
/// attempted.
pub const MIN_FITTED_POINTS: usize = 1;

/// Default spike-detection threshold, in multiples of the fit RMS.
pub const DEFAULT_SPIKE_THRESHOLD: f64 = 5.0;

/// Maximum number of spike-detection passes per record.
pub const DEFAULT_SPIKE_MAX_ITER: usize = 5;
