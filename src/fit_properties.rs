// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Per-window fit bookkeeping: design matrix dimensions, the fitted
//! coefficient and covariance matrices, and the spectral range the window
//! was actually fitted over. Grounded in the original engine's
//! `fit_properties.h`/`fit_properties.c` (`struct fit_properties`,
//! `FIT_PROPERTIES_alloc`/`FIT_PROPERTIES_free`).

use ndarray::Array2;

use crate::spectral_range::SpectralRange;

/// Maximum number of sub-windows a single analysis window may be split
/// into (mirrors the original's `MAX_FEN`).
pub const MAX_SUB_WINDOWS: usize = 50;

/// One `[start, end]` sub-window boundary pair, in pixel coordinates.
pub type SubWindowBounds = (i32, i32);

/// Linear-system dimensions and fitted results for one analysis window.
#[derive(Debug, Clone)]
pub struct FitProperties {
    /// The sub-window boundaries as configured (`LFenetre`).
    pub sub_windows: Vec<SubWindowBounds>,
    /// The window's spectral range after spike removal and gap handling.
    pub specrange: SpectralRange,
    /// Design matrix, `DimL x DimC`.
    pub a: Array2<f64>,
    /// Covariance of the fitted coefficients, `DimC x DimC`.
    pub covar: Array2<f64>,
    /// Per-coefficient variance (diagonal of `covar`, scaled by chi-square).
    pub sigma_sqr: Vec<f64>,
    /// Number of rows actually used in the last fit (`nFit`), which can be
    /// smaller than `DimL` after spike removal.
    pub n_fit: usize,
    /// Row count the design matrix was allocated for.
    pub dim_l: usize,
    /// Column count (number of linear parameters).
    pub dim_c: usize,
    /// Number of nonlinear parameters being fitted concurrently.
    pub dim_p: usize,
}

impl FitProperties {
    /// Allocate a zeroed fit, sized for `dim_l` rows, `dim_c` linear
    /// columns and `dim_p` nonlinear parameters.
    pub fn alloc(
        sub_windows: Vec<SubWindowBounds>,
        specrange: SpectralRange,
        dim_l: usize,
        dim_c: usize,
        dim_p: usize,
    ) -> Self {
        Self {
            sub_windows,
            specrange,
            a: Array2::zeros((dim_l, dim_c)),
            covar: Array2::zeros((dim_c, dim_c)),
            sigma_sqr: vec![0.0; dim_c],
            n_fit: 0,
            dim_l,
            dim_c,
            dim_p,
        }
    }

    /// Number of disjoint sub-windows actually present in `specrange`
    /// (`Z` in the original, after spike-driven interval splitting).
    pub fn num_intervals(&self) -> usize {
        self.specrange.num_windows()
    }

    /// Reset the fitted-results fields ahead of a new fit, keeping the
    /// allocated matrix shapes (mirrors re-using a `fit_properties`
    /// across analysis iterations rather than reallocating).
    pub fn reset_results(&mut self) {
        self.a.fill(0.0);
        self.covar.fill(0.0);
        self.sigma_sqr.iter_mut().for_each(|v| *v = 0.0);
        self.n_fit = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_sizes_matrices_correctly() {
        let mut range = SpectralRange::new();
        range.append(0, 99);
        let fp = FitProperties::alloc(vec![(0, 99)], range, 100, 5, 2);
        assert_eq!(fp.a.dim(), (100, 5));
        assert_eq!(fp.covar.dim(), (5, 5));
        assert_eq!(fp.sigma_sqr.len(), 5);
        assert_eq!(fp.dim_p, 2);
    }

    #[test]
    fn reset_results_clears_but_keeps_shape() {
        let mut range = SpectralRange::new();
        range.append(0, 9);
        let mut fp = FitProperties::alloc(vec![(0, 9)], range, 10, 3, 1);
        fp.a[[0, 0]] = 1.0;
        fp.n_fit = 10;
        fp.reset_results();
        assert_eq!(fp.a[[0, 0]], 0.0);
        assert_eq!(fp.n_fit, 0);
        assert_eq!(fp.a.dim(), (10, 3));
    }
}
