// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! The analysis driver, grounded in the original engine's `analyse.c`
//! (`ANALYSE_Spectrum`, `FENO`). Ties together, per record and per
//! analysis window: an optional Kurucz recalibration, cross-section
//! re-preparation on the (possibly recalibrated) wavelength grid, the
//! Curfit/forward-model nonlinear fit, and spike detection over the
//! residuals.
//!
//! Unlike the original, which keeps `FENO`/`Kurucz` as process-wide
//! singletons indexed by `[row][window]`, each [`AnalysisWindow`] here is
//! an explicit, independently ownable value a caller can instantiate per
//! row/window and drive directly.

use log::{debug, warn};
use ndarray::Array1;
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::config::{FitMethod, LinearOffsetMode, SpikeHandling, WindowConfig};
use crate::cross_section::{self, CrossReference, CrossResults, CrossSectionError};
use crate::curfit::{self, CurfitError, CurfitResult, NonlinearModel, WeightingMode};
use crate::fit_properties::FitProperties;
use crate::forward_model::{ForwardModel, ForwardModelError};
use crate::kurucz::{self, Kurucz, KuruczConfig, KuruczError, KuruczState};
use crate::numeric::matrix::Matrix;
use crate::slit::Slit;
use crate::workspace::Workspace;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error(transparent)]
    CrossSection(#[from] CrossSectionError),
    #[error(transparent)]
    Curfit(#[from] CurfitError),
    #[error(transparent)]
    Kurucz(#[from] KuruczError),
    #[error(transparent)]
    ForwardModel(#[from] ForwardModelError),
    #[error("reference data unavailable or mismatched: {0}")]
    RefData(String),
    #[error("analysis cancelled by user request")]
    UserStop,
}

impl AnalysisError {
    /// Whether this failure is cooperative cancellation rather than a
    /// numerical fault (see `EngineError::recoverable`).
    pub fn is_user_stop(&self) -> bool {
        matches!(self, AnalysisError::UserStop)
            || matches!(self, AnalysisError::Curfit(CurfitError::UserStop))
    }
}

/// Initial value, forward-difference step and box bounds for one of the
/// window's genuinely nonlinear parameters (shift/stretch/stretch2),
/// grounded in `TabCross[i].InitParam/DeltaParam/MinParam/MaxParam`.
#[derive(Debug, Clone, Copy)]
pub struct NonlinearParamSpec {
    pub init: f64,
    pub delta: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl NonlinearParamSpec {
    /// A parameter that floats freely, starting at zero.
    pub fn free(delta: f64) -> Self {
        Self {
            init: 0.0,
            delta,
            min: None,
            max: None,
        }
    }

    /// A parameter pinned to `value` for the whole fit (`min == max`,
    /// never changed by the fit).
    pub fn pinned(value: f64) -> Self {
        Self {
            init: value,
            delta: 0.0,
            min: Some(value),
            max: Some(value),
        }
    }

    fn bounds(&self) -> (Option<f64>, Option<f64>) {
        (self.min, self.max)
    }
}

/// Per-symbol result of one record's fit: the slant column scaled back by
/// the cross section's RMS normalisation factor, and its propagated
/// uncertainty. Grounded in `CrossResults::SlntCol/SlntErr`.
#[derive(Debug, Clone)]
pub struct CrossSymbolResult {
    pub comp: usize,
    pub slant_col: f64,
    pub slant_err: f64,
}

/// Everything one call to [`AnalysisWindow::analyse_record`] produces.
#[derive(Debug, Clone)]
pub struct RecordResult {
    pub columns: Vec<CrossSymbolResult>,
    pub shift: f64,
    pub shift_sigma: f64,
    pub stretch: f64,
    pub stretch_sigma: f64,
    pub stretch2: f64,
    pub stretch2_sigma: f64,
    pub rms: f64,
    pub chi_square: f64,
    pub n_iter: u32,
    /// Pixel indices (into the detector grid) flagged as spikes and
    /// excluded from the final fit.
    pub spikes: Vec<usize>,
}

/// The central per-window configuration+state record (`FENO` in the
/// original). Owns its cross-references, its `FitProperties`, its
/// reference spectrum and its Kurucz calibration state exclusively; the
/// [`Workspace`] symbol table is shared read-only across windows.
pub struct AnalysisWindow {
    pub config: WindowConfig,
    pub cross_refs: Vec<CrossReference>,
    pub slit: Slit,
    pub raman_kernel: Option<Vec<f64>>,
    pub fit_properties: FitProperties,

    /// Wavelength grid before any Kurucz recalibration (`LambdaRef`).
    pub lambda_ref: Array1<f64>,
    /// Wavelength grid actually used to prepare cross sections and drive
    /// the fit (`LambdaK`, or `LambdaRef` unchanged if Kurucz is unused).
    pub lambda_k: Array1<f64>,

    pub sref: Array1<f64>,
    pub sref_sigma: Option<Array1<f64>>,

    pub shift_params: NonlinearParamSpec,
    pub stretch_params: NonlinearParamSpec,
    pub stretch2_params: NonlinearParamSpec,
    pub offset_order: usize,

    pub lambda0: f64,
    pub lambda0_pukite: f64,

    pub kurucz_config: Option<KuruczConfig>,
    pub kurucz: Kurucz,

    /// Prepared cross sections from the most recent call to
    /// [`cross_section::prepare_window`], in `cross_refs` order.
    pub tab_cross_results: Vec<CrossResults>,
}

impl AnalysisWindow {
    /// Re-run Kurucz on `spectrum` (the reference when `use_kurucz_ref`,
    /// the measured spectrum too when `use_kurucz_all`) and update
    /// `lambda_k` accordingly. A window with `useKurucz == None` simply
    /// keeps `lambda_k == lambda_ref`.
    fn recalibrate(
        &mut self,
        hr_solar: &Matrix,
        reference: &Array1<f64>,
        spectrum: &Array1<f64>,
        cancel: &CancellationToken,
    ) -> Result<(), AnalysisError> {
        let config = self
            .kurucz_config
            .as_ref()
            .ok_or_else(|| AnalysisError::RefData("Kurucz requested but not configured".into()))?;

        // `useKurucz == All` recalibrates against the measured spectrum
        // (the more demanding case, run last so its LambdaK wins);
        // `useKurucz == Ref` recalibrates against the reference only.
        let source = if self.config.flags.use_kurucz_all {
            spectrum
        } else {
            reference
        };

        let result = kurucz::run(
            hr_solar,
            self.lambda_ref.as_slice().expect("contiguous"),
            source.as_slice().expect("contiguous"),
            config,
            cancel,
        )?;
        self.lambda_k = result
            .lambda_k
            .clone()
            .expect("HaveCalibration always carries lambda_k");
        self.kurucz = result;
        Ok(())
    }

    /// Run one full analyse-record pass: recalibration (if configured),
    /// cross-section preparation, the nonlinear fit, and spike detection.
    /// Mirrors `ANALYSE_Spectrum`'s per-window body.
    pub fn analyse_record(
        &mut self,
        workspace: &Workspace,
        spectrum: &Array1<f64>,
        hr_solar: Option<&Matrix>,
        cancel: &CancellationToken,
    ) -> Result<RecordResult, AnalysisError> {
        if spectrum.len() != self.sref.len() {
            return Err(AnalysisError::RefData(format!(
                "spectrum has {} pixels, reference has {}",
                spectrum.len(),
                self.sref.len()
            )));
        }
        if cancel.is_cancelled() {
            return Err(AnalysisError::UserStop);
        }

        debug!("analysing window \"{}\" ({} fitted pixels)", self.config.name, self.fit_properties.specrange.length());

        if self.config.flags.use_kurucz_ref || self.config.flags.use_kurucz_all {
            let hr_solar = hr_solar.ok_or_else(|| {
                AnalysisError::RefData("Kurucz requested but no solar atlas was supplied".into())
            })?;
            let reference = self.sref.clone();
            self.recalibrate(hr_solar, &reference, spectrum, cancel)?;
        }

        let lambda_k = self.lambda_k.clone();
        let fit_pixels = self.fit_properties.specrange.iter().map(|p| p as usize).collect::<Vec<_>>();
        if fit_pixels.is_empty() {
            return Err(AnalysisError::RefData("empty spectral range".into()));
        }
        let lo = *fit_pixels.iter().min().unwrap();
        let hi = *fit_pixels.iter().max().unwrap();

        self.tab_cross_results = cross_section::prepare_window(
            workspace,
            &self.cross_refs,
            lambda_k.as_slice().expect("contiguous"),
            &self.slit,
            self.raman_kernel.as_deref(),
            self.lambda0_pukite,
            lo..(hi + 1),
        )?;

        let pixel_center = (lo as f64 + hi as f64) / 2.0;
        let bounds = [
            self.shift_params.bounds(),
            self.stretch_params.bounds(),
            self.stretch2_params.bounds(),
        ];

        let result = self.run_curfit(&lambda_k, spectrum, &fit_pixels, pixel_center, bounds, cancel)?;
        let (fit_pixels, result, spikes) =
            self.detect_and_remove_spikes(&lambda_k, spectrum, fit_pixels, pixel_center, bounds, result, cancel)?;

        self.finish(&lambda_k, spectrum, &fit_pixels, pixel_center, bounds, result, spikes)
    }

    fn build_model<'a>(
        &'a self,
        lambda_k: &'a Array1<f64>,
        spectrum: &'a Array1<f64>,
        fit_pixels: &'a [usize],
        pixel_center: f64,
        bounds: [(Option<f64>, Option<f64>); 3],
    ) -> ForwardModel<'a> {
        ForwardModel {
            lambda: lambda_k.as_slice().expect("contiguous"),
            measured: spectrum,
            reference: &self.sref,
            cross_sections: &self.tab_cross_results,
            fit_pixels,
            method: self.config.method,
            linear_offset_mode: self.config.linear_offset_mode,
            offset_order: self.offset_order,
            pixel_center,
            bounds,
        }
    }

    fn fit_targets(&self, spectrum: &Array1<f64>, fit_pixels: &[usize]) -> Array1<f64> {
        Array1::from_iter(fit_pixels.iter().map(|&p| match self.config.method {
            FitMethod::OpticalDensityFit => spectrum[p].max(1e-300).ln(),
            FitMethod::IntensityFit => spectrum[p],
        }))
    }

    fn run_curfit(
        &self,
        lambda_k: &Array1<f64>,
        spectrum: &Array1<f64>,
        fit_pixels: &[usize],
        pixel_center: f64,
        bounds: [(Option<f64>, Option<f64>); 3],
        cancel: &CancellationToken,
    ) -> Result<CurfitResult, AnalysisError> {
        let model = self.build_model(lambda_k, spectrum, fit_pixels, pixel_center, bounds);
        let y = self.fit_targets(spectrum, fit_pixels);
        let sigma = self
            .sref_sigma
            .as_ref()
            .map(|s| Array1::from_iter(fit_pixels.iter().map(|&p| s[p])));
        let weighting = if sigma.is_some() {
            WeightingMode::Instrumental
        } else {
            WeightingMode::None
        };
        let n_linear = model.num_linear_columns();
        let n_free = (fit_pixels.len() as f64 - model.nonlinear_dim() as f64 - n_linear as f64).max(1.0);
        let mut a0 = vec![
            self.shift_params.init,
            self.stretch_params.init,
            self.stretch2_params.init,
        ];
        a0.resize(model.nonlinear_dim(), 0.0);
        let a0 = Array1::from(a0);
        Ok(curfit::fit(&model, &y, sigma.as_ref(), weighting, a0, n_free, cancel)?)
    }

    /// Run spike detection over the residuals: pixels with
    /// `|residual| > spike_threshold * RMS` are removed from the fit set
    /// per the window's configured [`SpikeHandling`] policy, and the fit
    /// is repeated, up to `spike_max_iterations` times or until no new
    /// spikes appear.
    fn detect_and_remove_spikes(
        &self,
        lambda_k: &Array1<f64>,
        spectrum: &Array1<f64>,
        mut fit_pixels: Vec<usize>,
        pixel_center: f64,
        bounds: [(Option<f64>, Option<f64>); 3],
        mut result: CurfitResult,
        cancel: &CancellationToken,
    ) -> Result<(Vec<usize>, CurfitResult, Vec<usize>), AnalysisError> {
        let mut removed: Vec<usize> = Vec::new();

        for _ in 0..self.config.spike_max_iterations {
            let model = self.build_model(lambda_k, spectrum, &fit_pixels, pixel_center, bounds);
            let y = self.fit_targets(spectrum, &fit_pixels);
            let yfit = model.evaluate(&result.a).map_err(AnalysisError::Curfit)?;
            let resid = &y - &yfit;
            let rms = (resid.iter().map(|r| r * r).sum::<f64>() / resid.len().max(1) as f64).sqrt();
            let threshold = self.config.spike_threshold * rms;

            let spiked: Vec<usize> = fit_pixels
                .iter()
                .zip(resid.iter())
                .filter(|(_, &r)| r.abs() > threshold)
                .map(|(&p, _)| p)
                .collect();
            if spiked.is_empty() {
                break;
            }

            match self.config.spike_handling {
                SpikeHandling::ResizeSystem => {
                    fit_pixels.retain(|p| !spiked.contains(p));
                }
                SpikeHandling::LeaveZeroRow => {
                    // The pixel stays in `specrange` bookkeeping but is
                    // dropped from the columns actually fitted, which
                    // has the same effect on this explicit `Vec<usize>`
                    // representation (there is no separate zero-weight
                    // row to keep, unlike the original's fixed-size `A`).
                    fit_pixels.retain(|p| !spiked.contains(p));
                }
            }
            let spiked_count = spiked.len();
            warn!(
                "window \"{}\": {} spike(s) exceeded {:.1}x RMS, removing and refitting",
                self.config.name, spiked_count, self.config.spike_threshold
            );
            removed.extend(spiked);

            if fit_pixels.is_empty() {
                return Err(AnalysisError::RefData(
                    "spike removal left no fitted pixels".into(),
                ));
            }

            let model = self.build_model(lambda_k, spectrum, &fit_pixels, pixel_center, bounds);
            let n_free = (fit_pixels.len() as f64
                - model.nonlinear_dim() as f64
                - model.num_linear_columns() as f64)
                .max(1.0);
            let y = self.fit_targets(spectrum, &fit_pixels);
            let sigma = self
                .sref_sigma
                .as_ref()
                .map(|s| Array1::from_iter(fit_pixels.iter().map(|&p| s[p])));
            let weighting = if sigma.is_some() {
                WeightingMode::Instrumental
            } else {
                WeightingMode::None
            };
            let a0 = result.a.clone();
            result = curfit::fit(&model, &y, sigma.as_ref(), weighting, a0, n_free, cancel)?;
            log::debug!("spike pass removed {} pixels, refit chisq={:.3e}", spiked_count, result.chisq);
        }

        removed.sort_unstable();
        removed.dedup();
        Ok((fit_pixels, result, removed))
    }

    fn finish(
        &self,
        lambda_k: &Array1<f64>,
        spectrum: &Array1<f64>,
        fit_pixels: &[usize],
        pixel_center: f64,
        bounds: [(Option<f64>, Option<f64>); 3],
        result: CurfitResult,
        spikes: Vec<usize>,
    ) -> Result<RecordResult, AnalysisError> {
        let model = self.build_model(lambda_k, spectrum, fit_pixels, pixel_center, bounds);
        let solution = model.solve_linear(&result.a)?;

        let y = self.fit_targets(spectrum, fit_pixels);
        let resid = &y - &solution.yfit;
        let rms = (resid.iter().map(|r| r * r).sum::<f64>() / resid.len().max(1) as f64).sqrt();

        // In optical-density mode the concentrations are the inner linear
        // system's own solution, with uncertainty from its covariance
        // (scaled by chisq, as the original's `CurFitMethod` does). In
        // intensity-fit mode they are nonlinear unknowns in `result.a`
        // past the shift/stretch/stretch2 slots, so their uncertainty is
        // `result.sigma_a`, already chisq-scaled by Curfit itself — the
        // inner system here only ever covers the offset polynomial and
        // has no column to report that uncertainty from.
        let columns = self
            .cross_refs
            .iter()
            .zip(self.tab_cross_results.iter())
            .enumerate()
            .map(|(i, (cr, xs))| {
                let (coeff, sigma) = match self.config.method {
                    FitMethod::OpticalDensityFit => {
                        let variance = solution.covariance[[i, i]] * result.chisq;
                        (solution.coefficients[i], variance.max(0.0).sqrt())
                    }
                    FitMethod::IntensityFit => (result.a[3 + i], result.sigma_a[3 + i]),
                };
                CrossSymbolResult {
                    comp: cr.comp,
                    slant_col: coeff / xs.fact,
                    slant_err: sigma / xs.fact,
                }
            })
            .collect();

        Ok(RecordResult {
            columns,
            shift: result.a[0],
            shift_sigma: result.sigma_a[0],
            stretch: result.a[1],
            stretch_sigma: result.sigma_a[1],
            stretch2: result.a[2],
            stretch2_sigma: result.sigma_a[2],
            rms,
            chi_square: result.chisq,
            n_iter: result.n_iter,
            spikes,
        })
    }
}

/// Whether an `AnalysisWindow` is ready to run: a window with
/// `useKurucz != None` and a failed Kurucz calibration cannot run.
pub fn ready_to_run(window: &AnalysisWindow) -> bool {
    if window.config.flags.use_kurucz_ref || window.config.flags.use_kurucz_all {
        !matches!(window.kurucz.state, KuruczState::Failed)
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AnalysisType, FilterConfig, FilterType, ReferenceSelectionMode, SlitConfig, SlitType,
        WindowFlags,
    };
    use crate::cross_section::Orthogonalisation;
    use crate::numeric::spline;
    use crate::spectral_range::SpectralRange;
    use crate::workspace::{Symbol, SymbolType};
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn base_config() -> WindowConfig {
        WindowConfig {
            name: "NO2_TEST".into(),
            method: FitMethod::OpticalDensityFit,
            analysis_type: AnalysisType::FwhmNone,
            flags: WindowFlags::default(),
            linear_offset_mode: LinearOffsetMode::None,
            reference_selection: ReferenceSelectionMode::File,
            slit: SlitConfig {
                slit_type: SlitType::Gaussian,
                wavelength_dependent: false,
                param: Some(0.5),
                param2: None,
                param3: None,
                slit_file: None,
                slit_file2: None,
                slit_file3: None,
            },
            filter: FilterConfig {
                filter_type: FilterType::None,
                filter_width: 1,
                filter_order: 0,
                filter_n_times: 0,
                kaiser_cutoff: 0.0,
                kaiser_pass_band: 0.0,
                kaiser_tolerance: 0.0,
                fwhm_width: 0.0,
            },
            spike_handling: SpikeHandling::default(),
            spike_threshold: 5.0,
            spike_max_iterations: 3,
            shift_degree: 2,
            fwhm_degree: 0,
            num_kurucz_windows: 10,
        }
    }

    /// A single linear cross section, no shift/stretch, optical-density
    /// fit. Recovers the known slant column.
    #[test]
    fn recovers_known_slant_column_with_no_shift() {
        let n = 101;
        let lambda: Vec<f64> = (0..n).map(|i| 300.0 + i as f64).collect();
        let sigma_no2: Vec<f64> = lambda
            .iter()
            .map(|&l| (-((l - 350.0).powi(2)) / 50.0).exp())
            .collect();

        let mut ws = Workspace::new();
        let mut y = Array2::zeros((n, 1));
        y.column_mut(0).assign(&Array1::from(sigma_no2.clone()));
        let comp = ws.register(Symbol {
            name: "NO2".into(),
            kind: SymbolType::Cross,
            cross_file_name: None,
            amf_file_name: None,
            xs: Some(Matrix {
                x: Array1::from(lambda.clone()),
                y,
                deriv2: None,
            }),
        });

        let reference = Array1::from(vec![1.0; n]);
        let true_scd = 0.02;
        let measured = Array1::from_iter(
            sigma_no2.iter().map(|&s| (-true_scd * s).exp()),
        );

        let cr = CrossReference {
            comp,
            fit_from_previous: false,
            xs_to_convolute: false,
            xs_to_convolute_i0: false,
            i0_concentration: 0.0,
            pukite_sources: None,
            lambda0_pukite: None,
            molecular_correction: false,
            subtract_from: None,
            orthogonalisation: Orthogonalisation::Skip,
        };

        let mut specrange = SpectralRange::new();
        specrange.append(0, n as i32 - 1);
        let fit_properties = FitProperties::alloc(vec![(0, n as i32 - 1)], specrange, n, 2, 3);

        let mut window = AnalysisWindow {
            config: base_config(),
            cross_refs: vec![cr],
            slit: Slit::Gaussian { fwhm: 0.001 },
            raman_kernel: None,
            fit_properties,
            lambda_ref: Array1::from(lambda.clone()),
            lambda_k: Array1::from(lambda),
            sref: reference,
            sref_sigma: None,
            shift_params: NonlinearParamSpec::pinned(0.0),
            stretch_params: NonlinearParamSpec::pinned(0.0),
            stretch2_params: NonlinearParamSpec::pinned(0.0),
            offset_order: 0,
            lambda0: 350.0,
            lambda0_pukite: 350.0,
            kurucz_config: None,
            kurucz: Kurucz::unrun(),
            tab_cross_results: Vec::new(),
        };

        let cancel = CancellationToken::new();
        let result = window
            .analyse_record(&ws, &measured, None, &cancel)
            .unwrap();

        assert_abs_diff_eq!(result.columns[0].slant_col, true_scd, epsilon = 1e-3);
        assert!(result.rms < 1e-3);
        assert!(result.n_iter <= 10);
        assert_abs_diff_eq!(result.shift, 0.0, epsilon = 1e-12);
    }

    /// Same setup, but the spectrum carries a pixel shift that must be
    /// fitted non-linearly.
    #[test]
    fn recovers_known_shift() {
        let n = 101;
        let lambda: Vec<f64> = (0..n).map(|i| 300.0 + i as f64).collect();
        let sigma_no2_fn = |l: f64| (-((l - 350.0).powi(2)) / 50.0).exp();
        let sigma_no2: Vec<f64> = lambda.iter().map(|&l| sigma_no2_fn(l)).collect();
        let deriv2 = spline::deriv2(&lambda, &sigma_no2).unwrap();

        let mut ws = Workspace::new();
        let mut y = Array2::zeros((n, 1));
        y.column_mut(0).assign(&Array1::from(sigma_no2.clone()));
        let comp = ws.register(Symbol {
            name: "NO2".into(),
            kind: SymbolType::Cross,
            cross_file_name: None,
            amf_file_name: None,
            xs: Some(Matrix {
                x: Array1::from(lambda.clone()),
                y,
                deriv2: None,
            }),
        });

        let reference = Array1::from(vec![1.0; n]);
        let true_scd = 0.02;
        let true_shift = 0.3;
        let measured = Array1::from_iter(lambda.iter().map(|&l| {
            let shifted_sigma = spline::vector(&lambda, &sigma_no2, &deriv2, &[l + true_shift], crate::numeric::spline::SplineMode::Cubic)
                .map(|v| v[0])
                .unwrap_or(0.0);
            (-true_scd * shifted_sigma).exp()
        }));

        let cr = CrossReference {
            comp,
            fit_from_previous: false,
            xs_to_convolute: false,
            xs_to_convolute_i0: false,
            i0_concentration: 0.0,
            pukite_sources: None,
            lambda0_pukite: None,
            molecular_correction: false,
            subtract_from: None,
            orthogonalisation: Orthogonalisation::Skip,
        };

        let mut specrange = SpectralRange::new();
        specrange.append(0, n as i32 - 1);
        let fit_properties = FitProperties::alloc(vec![(0, n as i32 - 1)], specrange, n, 2, 3);

        let mut window = AnalysisWindow {
            config: base_config(),
            cross_refs: vec![cr],
            slit: Slit::Gaussian { fwhm: 0.001 },
            raman_kernel: None,
            fit_properties,
            lambda_ref: Array1::from(lambda.clone()),
            lambda_k: Array1::from(lambda),
            sref: reference,
            sref_sigma: None,
            shift_params: NonlinearParamSpec::free(1e-4),
            stretch_params: NonlinearParamSpec::pinned(0.0),
            stretch2_params: NonlinearParamSpec::pinned(0.0),
            offset_order: 0,
            lambda0: 350.0,
            lambda0_pukite: 350.0,
            kurucz_config: None,
            kurucz: Kurucz::unrun(),
            tab_cross_results: Vec::new(),
        };

        let cancel = CancellationToken::new();
        let result = window
            .analyse_record(&ws, &measured, None, &cancel)
            .unwrap();

        assert_abs_diff_eq!(result.shift, true_shift, epsilon = 0.01);
        assert_abs_diff_eq!(result.columns[0].slant_col, true_scd, epsilon = 2e-4);
    }

    #[test]
    fn cancellation_is_observed_before_starting_a_record() {
        let n = 10;
        let lambda: Vec<f64> = (0..n).map(|i| 300.0 + i as f64).collect();
        let ws = Workspace::new();
        let reference = Array1::from(vec![1.0; n]);

        let mut specrange = SpectralRange::new();
        specrange.append(0, n as i32 - 1);
        let fit_properties = FitProperties::alloc(vec![(0, n as i32 - 1)], specrange, n, 1, 3);

        let mut window = AnalysisWindow {
            config: base_config(),
            cross_refs: vec![],
            slit: Slit::Gaussian { fwhm: 0.5 },
            raman_kernel: None,
            fit_properties,
            lambda_ref: Array1::from(lambda.clone()),
            lambda_k: Array1::from(lambda),
            sref: reference.clone(),
            sref_sigma: None,
            shift_params: NonlinearParamSpec::pinned(0.0),
            stretch_params: NonlinearParamSpec::pinned(0.0),
            stretch2_params: NonlinearParamSpec::pinned(0.0),
            offset_order: 0,
            lambda0: 350.0,
            lambda0_pukite: 350.0,
            kurucz_config: None,
            kurucz: Kurucz::unrun(),
            tab_cross_results: Vec::new(),
        };

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = window
            .analyse_record(&ws, &reference, None, &cancel)
            .unwrap_err();
        assert!(err.is_user_stop());
    }
}
