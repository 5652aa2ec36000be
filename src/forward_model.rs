// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! The forward model Curfit's nonlinear driver evaluates at every trial
//! parameter vector, grounded in the original engine's
//! `ANALYSE_Function`.
//!
//! In optical-density-fit mode, cross-section concentrations are solved
//! as a variable-projection inner linear least squares (the original's
//! own split between `A` — shift/stretch/offset/slit/... — and the XS
//! coefficient columns) rather than folded into the outer nonlinear
//! vector, so the Jacobian Curfit needs only ever covers the genuinely
//! nonlinear unknowns. Intensity-fit mode is nonlinear in the
//! concentrations themselves (the absorption term is
//! `reference * exp(-Σ c_k·σ_k)`), so there the concentrations are
//! carried as nonlinear unknowns in `A` alongside shift/stretch/stretch2,
//! and the inner linear solve covers only the offset polynomial.

use ndarray::{s, Array1, Array2};
use thiserror::Error;

use crate::config::{FitMethod, LinearOffsetMode};
use crate::cross_section::CrossResults;
use crate::curfit::{CurfitError, DerivativeMode, NonlinearModel};
use crate::linear::{Backend, LinearSystem, LinearSystemError};
use crate::numeric::spline::{self, SplineMode};

#[derive(Error, Debug)]
pub enum ForwardModelError {
    #[error(transparent)]
    Linear(#[from] LinearSystemError),
    #[error("shift/stretch displaced the fitted grid outside the cross-section domain")]
    DomainError,
}

/// Nonlinear parameter layout: `[shift, stretch, stretch2]`, plus one
/// concentration per cross section in intensity-fit mode.
pub struct ForwardModel<'a> {
    pub lambda: &'a [f64],
    pub measured: &'a Array1<f64>,
    pub reference: &'a Array1<f64>,
    pub cross_sections: &'a [CrossResults],
    pub fit_pixels: &'a [usize],
    pub method: FitMethod,
    pub linear_offset_mode: LinearOffsetMode,
    pub offset_order: usize,
    pub pixel_center: f64,
    /// Box constraints for `[shift, stretch, stretch2]`; `(min, max)` with
    /// `min == max` pins the parameter for the whole fit.
    pub bounds: [(Option<f64>, Option<f64>); 3],
}

/// Outcome of solving the inner linear system at one nonlinear trial.
pub struct LinearSolution {
    pub coefficients: Array1<f64>,
    pub covariance: Array2<f64>,
    pub yfit: Array1<f64>,
}

impl<'a> ForwardModel<'a> {
    /// Number of columns solved by the inner linear system: the full
    /// cross-section + offset design in optical-density mode, offset-only
    /// in intensity-fit mode (where the cross-section coefficients are
    /// nonlinear unknowns instead).
    pub fn num_linear_columns(&self) -> usize {
        match self.method {
            FitMethod::OpticalDensityFit => self.cross_sections.len() + self.offset_order + 1,
            FitMethod::IntensityFit => self.offset_order + 1,
        }
    }

    /// Number of cross-section concentrations carried in the nonlinear
    /// parameter vector `A` (zero in optical-density mode).
    fn num_concentration_params(&self) -> usize {
        match self.method {
            FitMethod::OpticalDensityFit => 0,
            FitMethod::IntensityFit => self.cross_sections.len(),
        }
    }

    /// Total nonlinear dimension: `[shift, stretch, stretch2]` plus, in
    /// intensity-fit mode, one concentration per cross section.
    pub fn nonlinear_dim(&self) -> usize {
        3 + self.num_concentration_params()
    }

    fn displacement(&self, a: &Array1<f64>, pixel: f64) -> f64 {
        let (shift, stretch, stretch2) = (a[0], a[1], a[2]);
        let dp = pixel - self.pixel_center;
        shift + stretch * dp + stretch2 * dp * dp
    }

    fn offset_base(&self, pixel_idx: usize) -> f64 {
        match self.linear_offset_mode {
            LinearOffsetMode::None => 0.0,
            LinearOffsetMode::Radiance => {
                if self.measured[pixel_idx] != 0.0 {
                    1.0 / self.measured[pixel_idx]
                } else {
                    0.0
                }
            }
            LinearOffsetMode::Reference => {
                if self.reference[pixel_idx] != 0.0 {
                    1.0 / self.reference[pixel_idx]
                } else {
                    0.0
                }
            }
        }
    }

    fn cross_section_values(&self, displaced: f64) -> Vec<f64> {
        self.cross_sections
            .iter()
            .map(|xs| {
                spline::vector(
                    self.lambda,
                    xs.vector.as_slice().unwrap(),
                    xs.deriv2.as_slice().unwrap(),
                    &[displaced],
                    SplineMode::Cubic,
                )
                .map(|v| v[0])
                .unwrap_or(0.0)
            })
            .collect()
    }

    /// Resample every cross section onto `lambda + displacement(pixel)`
    /// for each fitted pixel and solve the inner linear system: the full
    /// cross-section + offset design against `log(measured) - log(ref)`
    /// in optical-density mode, or the offset polynomial alone against
    /// `measured - reference*exp(-Σ c_k·σ_k)` in intensity-fit mode
    /// (concentrations `c_k` taken from `a`, since there they are
    /// nonlinear unknowns rather than linear columns).
    pub fn solve_linear(&self, a: &Array1<f64>) -> Result<LinearSolution, ForwardModelError> {
        let n = self.fit_pixels.len();
        let n_cross = self.cross_sections.len();
        let n_linear = self.num_linear_columns();
        let mut design = Array2::<f64>::zeros((n, n_linear));
        let mut rhs = Array1::<f64>::zeros(n);

        for (row, &pixel_idx) in self.fit_pixels.iter().enumerate() {
            let pixel = pixel_idx as f64;
            let displaced = self.lambda[pixel_idx] + self.displacement(a, pixel);
            let xs_values = self.cross_section_values(displaced);
            let offset_base = self.offset_base(pixel_idx);

            match self.method {
                FitMethod::OpticalDensityFit => {
                    for (col, &value) in xs_values.iter().enumerate() {
                        design[[row, col]] = -value;
                    }
                    let mut pow = 1.0;
                    for k in 0..=self.offset_order {
                        design[[row, n_cross + k]] = offset_base * pow;
                        pow *= pixel;
                    }
                    rhs[row] = self.measured[pixel_idx].max(1e-300).ln()
                        - self.reference[pixel_idx].max(1e-300).ln();
                }
                FitMethod::IntensityFit => {
                    let optical_depth: f64 = xs_values
                        .iter()
                        .zip(a.iter().skip(3))
                        .map(|(&v, &c)| c * v)
                        .sum();
                    let absorbed = self.reference[pixel_idx] * (-optical_depth).exp();
                    let mut pow = 1.0;
                    for k in 0..=self.offset_order {
                        design[[row, k]] = offset_base * pow;
                        pow *= pixel;
                    }
                    rhs[row] = self.measured[pixel_idx] - absorbed;
                }
            }
        }

        let mut system = LinearSystem::from_matrix(design, Backend::Svd);
        system.decompose()?;
        let solved = system.solve(&rhs)?;
        let solved_covar = system.covariance()?;

        // Report one coefficient vector indexed the same way regardless
        // of method: cross sections first, then the offset polynomial.
        let full_len = n_cross + self.offset_order + 1;
        let (coefficients, covariance) = match self.method {
            FitMethod::OpticalDensityFit => (solved, solved_covar),
            FitMethod::IntensityFit => {
                let mut coeffs = Array1::<f64>::zeros(full_len);
                coeffs
                    .slice_mut(s![..n_cross])
                    .assign(&a.slice(s![3..3 + n_cross]));
                coeffs.slice_mut(s![n_cross..]).assign(&solved);

                let mut covar = Array2::<f64>::zeros((full_len, full_len));
                covar
                    .slice_mut(s![n_cross.., n_cross..])
                    .assign(&solved_covar);
                (coeffs, covar)
            }
        };
        let yfit = build_yfit(self, a, &coefficients);

        Ok(LinearSolution {
            coefficients,
            covariance,
            yfit,
        })
    }
}

fn build_yfit(model: &ForwardModel, a: &Array1<f64>, coeffs: &Array1<f64>) -> Array1<f64> {
    let n = model.fit_pixels.len();
    let n_cross = model.cross_sections.len();
    let mut yfit = Array1::zeros(n);
    for (row, &pixel_idx) in model.fit_pixels.iter().enumerate() {
        let pixel = pixel_idx as f64;
        let displaced = model.lambda[pixel_idx] + model.displacement(a, pixel);
        let xs_values = model.cross_section_values(displaced);
        let od: f64 = xs_values
            .iter()
            .zip(coeffs.iter())
            .map(|(&value, &c)| c * value)
            .sum();

        let offset_base = model.offset_base(pixel_idx);
        let mut offset = 0.0;
        let mut pow = 1.0;
        for k in 0..=model.offset_order {
            offset += coeffs[n_cross + k] * offset_base * pow;
            pow *= pixel;
        }

        yfit[row] = match model.method {
            FitMethod::OpticalDensityFit => {
                model.reference[pixel_idx].max(1e-300).ln() - od + offset
            }
            FitMethod::IntensityFit => model.reference[pixel_idx] * (-od).exp() + offset,
        };
    }
    yfit
}

/// Adapts [`ForwardModel`] to [`NonlinearModel`] so Curfit can drive
/// `shift`/`stretch`/`stretch2` and, in intensity-fit mode, the
/// cross-section concentrations carried past index 2; every parameter is
/// always a numeric derivative.
impl<'a> NonlinearModel for ForwardModel<'a> {
    fn dim(&self) -> usize {
        self.nonlinear_dim()
    }

    fn derivative_mode(&self, _j: usize) -> DerivativeMode {
        DerivativeMode::Numeric
    }

    fn delta(&self, j: usize) -> f64 {
        match j {
            0 => 1e-4,
            1 => 1e-6,
            2 => 1e-8,
            _ => 1e-6,
        }
    }

    fn bounds(&self, j: usize) -> (Option<f64>, Option<f64>) {
        match j {
            0..=2 => self.bounds[j],
            _ => (None, None),
        }
    }

    fn param_name(&self, j: usize) -> String {
        match j {
            0..=2 => ["shift", "stretch", "stretch2"][j].to_string(),
            _ => format!("conc_{}", j - 3),
        }
    }

    fn evaluate(&self, a: &Array1<f64>) -> Result<Array1<f64>, CurfitError> {
        self.solve_linear(a)
            .map(|sol| sol.yfit)
            .map_err(|e| CurfitError::Model(e.to_string()))
    }

    fn analytic_derivative(
        &self,
        _a: &Array1<f64>,
        _j: usize,
        _yfit: &Array1<f64>,
    ) -> Result<Array1<f64>, CurfitError> {
        unreachable!("every parameter is always numeric in this model")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::curfit::{self, WeightingMode};
    use ndarray::Array1;

    fn flat_cross_result(lambda: &[f64], value_at: impl Fn(f64) -> f64) -> CrossResults {
        let y: Vec<f64> = lambda.iter().map(|&l| value_at(l)).collect();
        let deriv2 = spline::deriv2(lambda, &y).unwrap();
        CrossResults {
            vector: Array1::from(y),
            deriv2: Array1::from(deriv2),
            fact: 1.0,
            ring_backup: None,
        }
    }

    #[test]
    fn optical_density_fit_recovers_known_concentration() {
        let n = 101;
        let lambda: Vec<f64> = (0..n).map(|i| 300.0 + i as f64).collect();
        let xs = flat_cross_result(&lambda, |l| (-((l - 350.0).powi(2)) / 50.0).exp());
        let reference: Array1<f64> = Array1::from(vec![1.0; n]);
        let true_conc = 0.02;
        let measured: Array1<f64> = Array1::from_iter(
            lambda
                .iter()
                .map(|&l| (1.0_f64) * (-true_conc * (-((l - 350.0).powi(2)) / 50.0).exp()).exp()),
        );
        let fit_pixels: Vec<usize> = (0..n).collect();

        let model = ForwardModel {
            lambda: &lambda,
            measured: &measured,
            reference: &reference,
            cross_sections: std::slice::from_ref(&xs),
            fit_pixels: &fit_pixels,
            method: FitMethod::OpticalDensityFit,
            linear_offset_mode: LinearOffsetMode::None,
            offset_order: 0,
            pixel_center: 50.0,
            bounds: [(None, None), (None, None), (None, None)],
        };

        let a = Array1::from(vec![0.0, 0.0, 0.0]);
        let solution = model.solve_linear(&a).unwrap();
        assert_abs_diff_eq!(solution.coefficients[0], true_conc, epsilon = 1e-3);
    }

    /// Intensity-fit mode carries the concentration as a nonlinear unknown
    /// in `A`, so recovering it requires driving the outer Curfit loop
    /// rather than a single inner linear solve.
    #[test]
    fn intensity_fit_recovers_known_concentration_as_nonlinear_unknown() {
        let n = 101;
        let lambda: Vec<f64> = (0..n).map(|i| 300.0 + i as f64).collect();
        let xs = flat_cross_result(&lambda, |l| (-((l - 350.0).powi(2)) / 50.0).exp());
        let reference: Array1<f64> = Array1::from(vec![1.0; n]);
        let true_conc = 0.02;
        let measured: Array1<f64> = Array1::from_iter(
            lambda
                .iter()
                .map(|&l| (-true_conc * (-((l - 350.0).powi(2)) / 50.0).exp()).exp()),
        );
        let fit_pixels: Vec<usize> = (0..n).collect();

        let model = ForwardModel {
            lambda: &lambda,
            measured: &measured,
            reference: &reference,
            cross_sections: std::slice::from_ref(&xs),
            fit_pixels: &fit_pixels,
            method: FitMethod::IntensityFit,
            linear_offset_mode: LinearOffsetMode::None,
            offset_order: 0,
            pixel_center: 50.0,
            bounds: [(None, None), (None, None), (None, None)],
        };

        assert_eq!(model.nonlinear_dim(), 4);
        let a0 = Array1::from(vec![0.0, 0.0, 0.0, 0.0]);
        let n_free = (n as f64 - model.nonlinear_dim() as f64 - model.num_linear_columns() as f64)
            .max(1.0);
        let cancel = crate::cancel::CancellationToken::new();
        let result = curfit::fit(&model, &measured, None, WeightingMode::None, a0, n_free, &cancel)
            .unwrap();

        assert_abs_diff_eq!(result.a[3], true_conc, epsilon = 1e-3);
        assert_abs_diff_eq!(result.a[0], 0.0, epsilon = 1e-6);
    }
}
