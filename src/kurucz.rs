// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Wavelength and slit-width calibration against a high-resolution solar
//! atlas, grounded in the original engine's `kurucz.c`/`kurucz.h`
//! (`_Kurucz`, `_KuruczFeno`). Each detector row is split into `Nb_Win`
//! sub-windows; each sub-window's shift and (optionally) slit width are
//! fitted independently, then combined into a shift-vs-pixel and
//! FWHM-vs-pixel polynomial for the whole row.

use ndarray::{Array1, Array2};
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::curfit::{self, CurfitError, CurfitResult, DerivativeMode, NonlinearModel, WeightingMode};
use crate::linear::{self, Backend, LinearSystem, LinearSystemError};
use crate::numeric::matrix::Matrix;
use crate::slit::{Slit, SlitError};

#[derive(Error, Debug)]
pub enum KuruczError {
    #[error("Kurucz calibration requires at least one sub-window, got {0}")]
    InvalidSubWindowCount(usize),
    #[error(transparent)]
    Slit(#[from] SlitError),
    #[error(transparent)]
    Linear(#[from] LinearSystemError),
    #[error("sub-window {0} failed to fit: {1}")]
    SubWindowFit(usize, CurfitError),
    #[error("Kurucz calibration has not produced a result yet for this row")]
    NotRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KuruczState {
    Unrun,
    Running,
    HaveCalibration,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SubWindowResult {
    pub pixel_center: f64,
    pub shift: f64,
    pub shift_sigma: f64,
    pub fwhm_param: Option<f64>,
    pub fwhm_sigma: Option<f64>,
    pub chi_square: f64,
    pub rms: f64,
    pub n_iter: u32,
}

#[derive(Debug, Clone)]
pub struct KuruczConfig {
    pub num_sub_windows: usize,
    pub shift_degree: usize,
    pub fwhm_degree: usize,
    pub fit_fwhm: bool,
    pub continuum_order: usize,
    pub base_fwhm: f64,
}

#[derive(Debug, Clone)]
pub struct Kurucz {
    pub state: KuruczState,
    pub sub_windows: Vec<SubWindowResult>,
    pub shift_poly: Option<Array1<f64>>,
    pub fwhm_poly: Option<Array1<f64>>,
    pub lambda_k: Option<Array1<f64>>,
}

impl Kurucz {
    pub fn unrun() -> Self {
        Self {
            state: KuruczState::Unrun,
            sub_windows: Vec::new(),
            shift_poly: None,
            fwhm_poly: None,
            lambda_k: None,
        }
    }
}

fn polyval(coeffs: &Array1<f64>, x: f64) -> f64 {
    let mut acc = 0.0;
    let mut pow = 1.0;
    for &c in coeffs.iter() {
        acc += c * pow;
        pow *= x;
    }
    acc
}

/// One sub-window's nonlinear calibration model: `shift` and, optionally,
/// `fwhm` are genuinely nonlinear unknowns; the continuum baseline is
/// solved as an inner variable-projection linear system at every trial,
/// the same split `ForwardModel` uses between its nonlinear `A` and its
/// linear cross-section/offset columns.
struct SubWindowModel<'a> {
    hr_solar: &'a Matrix,
    pixel_lambda: &'a [f64],
    measured_log: &'a Array1<f64>,
    base_fwhm: f64,
    fit_fwhm: bool,
    continuum_order: usize,
}

/// Outcome of the inner continuum solve at one `shift`/`fwhm` trial.
struct SubWindowLinearSolution {
    yfit: Array1<f64>,
}

impl<'a> SubWindowModel<'a> {
    fn convolved_log_solar(&self, a: &Array1<f64>) -> Result<Vec<f64>, CurfitError> {
        let shift = a[0];
        let fwhm = if self.fit_fwhm {
            self.base_fwhm + a[1]
        } else {
            self.base_fwhm
        };
        if fwhm <= 0.0 {
            return Err(CurfitError::SqrtArg("fwhm".into()));
        }
        let slit = Slit::Gaussian { fwhm };
        let shifted: Vec<f64> = self.pixel_lambda.iter().map(|&l| l + shift).collect();
        let conv = slit
            .convolve(self.hr_solar, &shifted)
            .map_err(|e| CurfitError::Model(e.to_string()))?;
        Ok(conv.into_iter().map(|v| v.max(1e-300).ln()).collect())
    }

    /// Solve the continuum polynomial (degree `continuum_order`, in pixel
    /// index) against the residual of `measured_log` over the trial
    /// `log(conv(solar, shifted))`, and fold it back into `yfit`.
    fn solve_linear(&self, a: &Array1<f64>) -> Result<SubWindowLinearSolution, CurfitError> {
        let base = Array1::from(self.convolved_log_solar(a)?);
        let n = base.len();
        let n_cols = self.continuum_order + 1;
        let mut design = Array2::<f64>::zeros((n, n_cols));
        for row in 0..n {
            let x = row as f64;
            let mut pow = 1.0;
            for col in 0..n_cols {
                design[[row, col]] = pow;
                pow *= x;
            }
        }
        let rhs = self.measured_log - &base;

        let mut system = LinearSystem::from_matrix(design, Backend::Svd);
        system
            .decompose()
            .map_err(|e| CurfitError::Model(e.to_string()))?;
        let coeffs = system
            .solve(&rhs)
            .map_err(|e| CurfitError::Model(e.to_string()))?;

        let mut yfit = base;
        for (row, y) in yfit.iter_mut().enumerate() {
            *y += polyval(&coeffs, row as f64);
        }
        Ok(SubWindowLinearSolution { yfit })
    }
}

impl<'a> NonlinearModel for SubWindowModel<'a> {
    fn dim(&self) -> usize {
        if self.fit_fwhm {
            2
        } else {
            1
        }
    }

    fn derivative_mode(&self, _j: usize) -> DerivativeMode {
        DerivativeMode::Numeric
    }

    fn delta(&self, j: usize) -> f64 {
        if j == 0 {
            1e-4
        } else {
            1e-4
        }
    }

    fn bounds(&self, _j: usize) -> (Option<f64>, Option<f64>) {
        (None, None)
    }

    fn param_name(&self, j: usize) -> String {
        if j == 0 {
            "shift".to_string()
        } else {
            "fwhm".to_string()
        }
    }

    fn evaluate(&self, a: &Array1<f64>) -> Result<Array1<f64>, CurfitError> {
        // `y` passed to Curfit is `log(measured)`; the model is
        // `log(solar convolved with the trial slit at the trial shift)`
        // plus a continuum polynomial solved as an inner linear system.
        self.solve_linear(a).map(|sol| sol.yfit)
    }

    fn analytic_derivative(
        &self,
        _a: &Array1<f64>,
        _j: usize,
        _yfit: &Array1<f64>,
    ) -> Result<Array1<f64>, CurfitError> {
        unreachable!("Kurucz sub-window shift/fwhm are always numeric")
    }
}

/// Run the sub-window shift/FWHM calibration for one detector row.
pub fn run(
    hr_solar: &Matrix,
    pixel_lambda: &[f64],
    spectrum: &[f64],
    config: &KuruczConfig,
    cancel: &CancellationToken,
) -> Result<Kurucz, KuruczError> {
    if config.num_sub_windows == 0 {
        return Err(KuruczError::InvalidSubWindowCount(0));
    }
    let n = pixel_lambda.len();
    let win_size = n / config.num_sub_windows;
    if win_size == 0 {
        return Err(KuruczError::InvalidSubWindowCount(config.num_sub_windows));
    }

    let mut sub_windows = Vec::with_capacity(config.num_sub_windows);
    for w in 0..config.num_sub_windows {
        let start = w * win_size;
        let end = if w == config.num_sub_windows - 1 {
            n
        } else {
            start + win_size
        };
        let sub_lambda = &pixel_lambda[start..end];
        let sub_spectrum = &spectrum[start..end];
        let measured_log: Array1<f64> =
            Array1::from_iter(sub_spectrum.iter().map(|&v| v.max(1e-300).ln()));

        let model = SubWindowModel {
            hr_solar,
            pixel_lambda: sub_lambda,
            measured_log: &measured_log,
            base_fwhm: config.base_fwhm,
            fit_fwhm: config.fit_fwhm,
            continuum_order: config.continuum_order,
        };

        let a0 = if config.fit_fwhm {
            Array1::from(vec![0.0, 0.0])
        } else {
            Array1::from(vec![0.0])
        };
        let n_linear = config.continuum_order as f64 + 1.0;
        let n_free = (sub_lambda.len() as f64 - model.dim() as f64 - n_linear).max(1.0);

        let result: CurfitResult = curfit::fit(
            &model,
            &measured_log,
            None,
            WeightingMode::None,
            a0,
            n_free,
            cancel,
        )
        .map_err(|e| KuruczError::SubWindowFit(w, e))?;

        let center = (start as f64 + end as f64 - 1.0) / 2.0;
        sub_windows.push(SubWindowResult {
            pixel_center: center,
            shift: result.a[0],
            shift_sigma: result.sigma_a[0],
            fwhm_param: if config.fit_fwhm { Some(result.a[1]) } else { None },
            fwhm_sigma: if config.fit_fwhm {
                Some(result.sigma_a[1])
            } else {
                None
            },
            chi_square: result.chisq,
            rms: result.chisq.sqrt(),
            n_iter: result.n_iter,
        });
    }

    let centers: Vec<f64> = sub_windows.iter().map(|s| s.pixel_center).collect();
    let shifts: Vec<f64> = sub_windows.iter().map(|s| s.shift).collect();
    let shift_sigma: Vec<f64> = sub_windows
        .iter()
        .map(|s| if s.shift_sigma > 0.0 { s.shift_sigma } else { 1.0 })
        .collect();
    let shift_poly = linear::fit_poly(&centers, &shifts, Some(&shift_sigma), config.shift_degree)?;

    let fwhm_poly = if config.fit_fwhm {
        let fwhms: Vec<f64> = sub_windows
            .iter()
            .map(|s| s.fwhm_param.unwrap_or(0.0))
            .collect();
        let fwhm_sigma: Vec<f64> = sub_windows
            .iter()
            .map(|s| s.fwhm_sigma.filter(|&v| v > 0.0).unwrap_or(1.0))
            .collect();
        Some(linear::fit_poly(
            &centers,
            &fwhms,
            Some(&fwhm_sigma),
            config.fwhm_degree,
        )?)
    } else {
        None
    };

    let lambda_k: Vec<f64> = pixel_lambda
        .iter()
        .enumerate()
        .map(|(i, &l)| l + polyval(&shift_poly, i as f64))
        .collect();

    Ok(Kurucz {
        state: KuruczState::HaveCalibration,
        sub_windows,
        shift_poly: Some(shift_poly),
        fwhm_poly,
        lambda_k: Some(Array1::from(lambda_k)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn gaussian(l: f64, center: f64, fwhm: f64) -> f64 {
        let sigma = fwhm / (2.0 * (2.0_f64).ln().sqrt());
        (-((l - center).powi(2)) / (2.0 * sigma * sigma)).exp()
    }

    #[test]
    fn recovers_a_constant_shift() {
        let n = 2000;
        let hr_x: Vec<f64> = (0..n).map(|i| 300.0 + i as f64 * 0.05).collect();
        let mut hr_y = Array2::zeros((n, 1));
        for (i, &l) in hr_x.iter().enumerate() {
            hr_y[[i, 0]] = 0.5 + gaussian(l, 350.0, 0.3);
        }
        let hr_solar = Matrix {
            x: Array1::from(hr_x),
            y: hr_y,
            deriv2: None,
        };

        let true_shift = 0.08;
        let pixel_lambda: Vec<f64> = (0..400).map(|i| 340.0 + i as f64 * 0.05).collect();
        let slit = Slit::Gaussian { fwhm: 0.6 };
        // The model evaluates `conv(hr, pixel_lambda + shift)` (see
        // `SubWindowModel::convolved_log_solar`), so a spectrum sampled at
        // `pixel_lambda + true_shift` is the one whose fitted shift
        // converges to `true_shift` exactly.
        let spectrum = slit
            .convolve(
                &hr_solar,
                &pixel_lambda.iter().map(|&l| l + true_shift).collect::<Vec<_>>(),
            )
            .unwrap();

        let config = KuruczConfig {
            num_sub_windows: 4,
            shift_degree: 0,
            fwhm_degree: 0,
            fit_fwhm: false,
            continuum_order: 0,
            base_fwhm: 0.6,
        };
        let cancel = CancellationToken::new();
        let result = run(&hr_solar, &pixel_lambda, &spectrum, &config, &cancel).unwrap();
        assert_eq!(result.state, KuruczState::HaveCalibration);
        assert_abs_diff_eq!(result.shift_poly.unwrap()[0], true_shift, epsilon = 0.05);
    }

    /// A linear multiplicative baseline drift across the row (additive in
    /// log space) must be absorbed by the continuum polynomial rather than
    /// biasing the fitted shift.
    #[test]
    fn continuum_polynomial_absorbs_a_linear_baseline_drift() {
        let n = 2000;
        let hr_x: Vec<f64> = (0..n).map(|i| 300.0 + i as f64 * 0.05).collect();
        let mut hr_y = Array2::zeros((n, 1));
        for (i, &l) in hr_x.iter().enumerate() {
            hr_y[[i, 0]] = 0.5 + gaussian(l, 350.0, 0.3);
        }
        let hr_solar = Matrix {
            x: Array1::from(hr_x),
            y: hr_y,
            deriv2: None,
        };

        let true_shift = 0.08;
        let pixel_lambda: Vec<f64> = (0..400).map(|i| 340.0 + i as f64 * 0.05).collect();
        let slit = Slit::Gaussian { fwhm: 0.6 };
        let base_spectrum = slit
            .convolve(
                &hr_solar,
                &pixel_lambda.iter().map(|&l| l + true_shift).collect::<Vec<_>>(),
            )
            .unwrap();
        // A slowly varying multiplicative drift, well within one
        // sub-window's span, that a degree-1 continuum can absorb.
        let spectrum: Vec<f64> = base_spectrum
            .iter()
            .enumerate()
            .map(|(i, &v)| v * (1.0 + 0.01 * (i % 100) as f64))
            .collect();

        let config = KuruczConfig {
            num_sub_windows: 4,
            shift_degree: 0,
            fwhm_degree: 0,
            fit_fwhm: false,
            continuum_order: 1,
            base_fwhm: 0.6,
        };
        let cancel = CancellationToken::new();
        let result = run(&hr_solar, &pixel_lambda, &spectrum, &config, &cancel).unwrap();
        assert_eq!(result.state, KuruczState::HaveCalibration);
        assert_abs_diff_eq!(result.shift_poly.unwrap()[0], true_shift, epsilon = 0.05);
    }
}
