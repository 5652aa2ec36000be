// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Instrumental slit-function library: sampling a slit kernel and
//! convolving a high-resolution spectrum with it, grounded in the
//! original engine's slit-handling code path reachable from
//! `kurucz.c`/`analyse.c` (the slit bodies themselves were not in the
//! retrieved source; the ten variants and their parameters are taken
//! from the project's documented slit-function list).

use ndarray::Array1;
use thiserror::Error;

use crate::numeric::matrix::Matrix;
use crate::numeric::special::erf;
use crate::numeric::spline::{self, SplineMode};

#[derive(Error, Debug)]
pub enum SlitError {
    #[error("slit variant {0} requires parameter {1}, which was not supplied")]
    SlitConfig(&'static str, &'static str),
    #[error("slit kernel half-width {half_width} exceeds the high-resolution grid span [{lo}, {hi}]")]
    DomainError { half_width: f64, lo: f64, hi: f64 },
}

/// The closed set of slit-function variants the engine supports.
#[derive(Debug, Clone)]
pub enum Slit {
    Gaussian { fwhm: f64 },
    ErrorFunction { fwhm: f64, boxcar_width: f64 },
    InversePolynomial { fwhm: f64, order: u32 },
    AsymGaussian { fwhm: f64, asym: f64 },
    SuperGaussian { fwhm: f64, power: f64, asym: f64 },
    Voigt { gauss_fwhm: f64, lorentz_ratio: f64 },
    Apodisation { resolution: f64, phase: f64 },
    ApodisationNbs { resolution: f64, phase: f64 },
    File { table: Matrix },
    /// Wraps any other variant, re-sampling its parameters from `curves`
    /// (one cubic-spline-interpolated matrix per parameter) at each
    /// output wavelength.
    WvlDep {
        inner: Box<Slit>,
        curves: Vec<Matrix>,
    },
}

impl Slit {
    /// Half-width, in nm, beyond which the kernel is negligible. Used to
    /// validate the kernel fits inside the high-resolution grid.
    fn half_width(&self) -> Result<f64, SlitError> {
        Ok(match self {
            Slit::Gaussian { fwhm } => 2.5 * fwhm,
            Slit::ErrorFunction { fwhm, boxcar_width } => 2.5 * fwhm + boxcar_width / 2.0,
            Slit::InversePolynomial { fwhm, .. } => 3.0 * fwhm,
            Slit::AsymGaussian { fwhm, asym } => 2.5 * fwhm * (1.0 + asym.abs()),
            Slit::SuperGaussian { fwhm, asym, .. } => 2.5 * fwhm * (1.0 + asym.abs()),
            Slit::Voigt { gauss_fwhm, .. } => 3.0 * gauss_fwhm,
            Slit::Apodisation { resolution, .. } | Slit::ApodisationNbs { resolution, .. } => {
                if *resolution <= 0.0 {
                    return Err(SlitError::SlitConfig("Apodisation", "resolution"));
                }
                4.0 / resolution
            }
            Slit::File { table } => {
                let x = &table.x;
                (x[x.len() - 1] - x[0]) / 2.0
            }
            Slit::WvlDep { inner, .. } => inner.half_width()?,
        })
    }

    /// Evaluate the kernel at offsets `delta` (nm from the kernel
    /// centre), normalised to unit area by trapezoidal integration over
    /// `delta`.
    pub fn sample(&self, delta: &[f64]) -> Result<Vec<f64>, SlitError> {
        let mut raw: Vec<f64> = delta.iter().map(|&d| self.shape(d)).collect::<Result<_, _>>()?;
        normalize_area(delta, &mut raw);
        Ok(raw)
    }

    fn shape(&self, d: f64) -> Result<f64, SlitError> {
        Ok(match self {
            Slit::Gaussian { fwhm } => gaussian(d, *fwhm),
            Slit::ErrorFunction { fwhm, boxcar_width } => {
                let sigma = fwhm / (2.0 * (2.0_f64).ln().sqrt());
                let a = (d + boxcar_width / 2.0) / (sigma * std::f64::consts::SQRT_2);
                let b = (d - boxcar_width / 2.0) / (sigma * std::f64::consts::SQRT_2);
                (erf(a) - erf(b)) / (2.0 * boxcar_width)
            }
            Slit::InversePolynomial { fwhm, order } => {
                let half = fwhm / 2.0;
                1.0 / (1.0 + (d / half).powi(*order as i32))
            }
            Slit::AsymGaussian { fwhm, asym } => {
                let eff_fwhm = if d < 0.0 {
                    fwhm * (1.0 - asym)
                } else {
                    fwhm * (1.0 + asym)
                };
                gaussian(d, eff_fwhm)
            }
            Slit::SuperGaussian { fwhm, power, asym } => {
                let eff_fwhm = if d < 0.0 {
                    fwhm * (1.0 - asym)
                } else {
                    fwhm * (1.0 + asym)
                };
                let a = 2.0 * (2.0_f64).ln().powf(1.0 / power);
                (-((d.abs() * a) / eff_fwhm).powf(*power)).exp()
            }
            Slit::Voigt {
                gauss_fwhm,
                lorentz_ratio,
            } => {
                // Pseudo-Voigt: linear mix of Gaussian and Lorentzian of
                // matching FWHM, `lorentz_ratio` in [0,1].
                let eta = lorentz_ratio.clamp(0.0, 1.0);
                let g = gaussian(d, *gauss_fwhm);
                let half = gauss_fwhm / 2.0;
                let l = half * half / (d * d + half * half) / (std::f64::consts::PI * half);
                eta * l + (1.0 - eta) * g
            }
            Slit::Apodisation { resolution, phase } => apodisation(d, *resolution, *phase, false),
            Slit::ApodisationNbs { resolution, phase } => apodisation(d, *resolution, *phase, true),
            Slit::File { table } => sample_file_table(table, d),
            Slit::WvlDep { inner, .. } => inner.shape(d)?,
        })
    }

    /// Convolve a high-resolution `(x, y)` spectrum onto `output_grid`,
    /// re-sampling the slit kernel at every output wavelength.
    pub fn convolve(&self, hr: &Matrix, output_grid: &[f64]) -> Result<Vec<f64>, SlitError> {
        let half_width = self.half_width()?;
        let lo = hr.x[0];
        let hi = hr.x[hr.len() - 1];
        if half_width > (hi - lo) / 2.0 {
            return Err(SlitError::DomainError {
                half_width,
                lo,
                hi,
            });
        }

        let hr_x: Vec<f64> = hr.x.to_vec();
        let hr_y: Vec<f64> = hr.y.column(0).to_vec();
        let deriv2 = hr
            .deriv2
            .as_ref()
            .map(|d| d.column(0).to_vec())
            .unwrap_or_else(|| spline::deriv2(&hr_x, &hr_y).unwrap_or_else(|_| vec![0.0; hr_x.len()]));

        let mut out = Vec::with_capacity(output_grid.len());
        for &lambda0 in output_grid {
            let kernel_at = self.at(lambda0);
            let width = kernel_at.half_width()?;
            let start = lambda0 - width;
            let end = lambda0 + width;

            // Sample the HR spectrum on a uniform sub-grid spanning the
            // kernel support, sized relative to the native HR spacing.
            let native_step = (hr_x[hr_x.len() - 1] - hr_x[0]) / (hr_x.len() as f64 - 1.0);
            let step = native_step.min(width / 50.0).max(1e-6);
            let n = ((end - start) / step).round().max(1.0) as usize;

            let mut deltas = Vec::with_capacity(n + 1);
            let mut xs = Vec::with_capacity(n + 1);
            for k in 0..=n {
                let x = start + (k as f64) * step;
                xs.push(x.clamp(lo, hi));
                deltas.push(x - lambda0);
            }
            let ys = spline::vector(&hr_x, &hr_y, &deriv2, &xs, SplineMode::Cubic)
                .unwrap_or_else(|_| vec![0.0; xs.len()]);
            let kernel = kernel_at.sample(&deltas)?;

            out.push(trapz(&deltas, &kernel.iter().zip(&ys).map(|(k, y)| k * y).collect::<Vec<_>>()));
        }
        Ok(out)
    }

    /// I₀-corrected convolution: `-ln(conv(I0)/conv(I0*exp(-c*sigma))) / c`.
    pub fn convolve_i0(
        &self,
        hr_i0: &Matrix,
        hr_sigma: &[f64],
        concentration: f64,
        output_grid: &[f64],
    ) -> Result<Vec<f64>, SlitError> {
        let attenuated_y: Vec<f64> = hr_i0
            .y
            .column(0)
            .iter()
            .zip(hr_sigma)
            .map(|(&i0, &sigma)| i0 * (-concentration * sigma).exp())
            .collect();
        let mut attenuated = hr_i0.clone();
        attenuated.y.column_mut(0).assign(&Array1::from(attenuated_y));
        attenuated.deriv2 = None;

        let conv_i0 = self.convolve(hr_i0, output_grid)?;
        let conv_att = self.convolve(&attenuated, output_grid)?;

        Ok(conv_i0
            .iter()
            .zip(conv_att.iter())
            .map(|(&n, &d)| -(n / d).ln() / concentration)
            .collect())
    }

    /// Returns the slit variant to use at a specific output wavelength:
    /// for `WvlDep`, re-samples each parameter curve via cubic spline and
    /// rebuilds `inner` with the sampled parameters; otherwise returns a
    /// clone of self.
    fn at(&self, lambda: f64) -> Slit {
        match self {
            Slit::WvlDep { inner, curves } => {
                let sampled: Vec<f64> = curves
                    .iter()
                    .map(|c| {
                        let y2 = c
                            .deriv2
                            .as_ref()
                            .map(|d| d.column(0).to_vec())
                            .unwrap_or_else(|| vec![0.0; c.len()]);
                        spline::vector(
                            &c.x.to_vec(),
                            &c.y.column(0).to_vec(),
                            &y2,
                            &[lambda],
                            SplineMode::Cubic,
                        )
                        .map(|v| v[0])
                        .unwrap_or(0.0)
                    })
                    .collect();
                rebuild_with_params(inner, &sampled)
            }
            other => other.clone(),
        }
    }
}

fn rebuild_with_params(inner: &Slit, params: &[f64]) -> Slit {
    match inner {
        Slit::Gaussian { .. } => Slit::Gaussian {
            fwhm: params.first().copied().unwrap_or(0.0),
        },
        Slit::ErrorFunction { .. } => Slit::ErrorFunction {
            fwhm: params.first().copied().unwrap_or(0.0),
            boxcar_width: params.get(1).copied().unwrap_or(0.0),
        },
        Slit::AsymGaussian { .. } => Slit::AsymGaussian {
            fwhm: params.first().copied().unwrap_or(0.0),
            asym: params.get(1).copied().unwrap_or(0.0),
        },
        Slit::SuperGaussian { .. } => Slit::SuperGaussian {
            fwhm: params.first().copied().unwrap_or(0.0),
            power: params.get(1).copied().unwrap_or(2.0),
            asym: params.get(2).copied().unwrap_or(0.0),
        },
        other => other.clone(),
    }
}

fn gaussian(d: f64, fwhm: f64) -> f64 {
    if fwhm <= 0.0 {
        return if d == 0.0 { 1.0 } else { 0.0 };
    }
    let sigma = fwhm / (2.0 * (2.0_f64).ln().sqrt());
    (-(d * d) / (2.0 * sigma * sigma)).exp()
}

/// Resolution-limited (`sinc`-based) apodisation kernel; the NBS variant
/// applies the Norton-Beer weighting used to suppress sidelobes.
fn apodisation(d: f64, resolution: f64, phase: f64, nbs: bool) -> f64 {
    let x = std::f64::consts::PI * resolution * d;
    let sinc = if x.abs() < 1e-12 { 1.0 } else { x.sin() / x };
    let phased = sinc * phase.cos();
    if nbs {
        const C0: f64 = 0.045;
        const C2: f64 = 0.554;
        const C4: f64 = 0.401;
        let t = (resolution * d).clamp(-1.0, 1.0);
        let weight = C0 + C2 * (1.0 - t * t) + C4 * (1.0 - t * t).powi(2);
        phased * weight
    } else {
        phased
    }
}

fn sample_file_table(table: &Matrix, d: f64) -> f64 {
    let x: Vec<f64> = table.x.to_vec();
    let y: Vec<f64> = table.y.column(0).to_vec();
    crate::numeric::vector::interp_linear(&x, &y, d)
}

fn normalize_area(delta: &[f64], values: &mut [f64]) {
    let area = trapz(delta, values);
    if area.abs() > 0.0 {
        values.iter_mut().for_each(|v| *v /= area);
    }
}

fn trapz(x: &[f64], y: &[f64]) -> f64 {
    if x.len() < 2 {
        return 0.0;
    }
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xw, yw)| 0.5 * (xw[1] - xw[0]) * (yw[0] + yw[1]))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn gaussian_table(fwhm: f64, lo: f64, hi: f64, n: usize, center: f64) -> Matrix {
        let x: Vec<f64> = (0..n).map(|i| lo + (hi - lo) * i as f64 / (n as f64 - 1.0)).collect();
        let mut y = ndarray::Array2::zeros((n, 1));
        for (i, &v) in x.iter().enumerate() {
            y[[i, 0]] = gaussian(v - center, fwhm);
        }
        Matrix {
            x: Array1::from(x),
            y,
            deriv2: None,
        }
    }

    #[test]
    fn gaussian_sample_is_area_normalised() {
        let slit = Slit::Gaussian { fwhm: 0.5 };
        let delta: Vec<f64> = (-100..=100).map(|i| i as f64 * 0.02).collect();
        let kernel = slit.sample(&delta).unwrap();
        let area = trapz(&delta, &kernel);
        assert_abs_diff_eq!(area, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn convolving_narrow_gaussian_with_gaussian_slit_widens_it() {
        let narrow_fwhm = 0.1;
        let slit_fwhm = 0.5;
        let hr = gaussian_table(narrow_fwhm, 340.0, 360.0, 4000, 350.0);
        let slit = Slit::Gaussian { fwhm: slit_fwhm };
        let output_grid: Vec<f64> = (0..101).map(|i| 345.0 + 0.1 * i as f64).collect();
        let convolved = slit.convolve(&hr, &output_grid).unwrap();

        let peak = convolved.iter().cloned().fold(0.0, f64::max);
        let half_max = peak / 2.0;
        let above: Vec<usize> = convolved
            .iter()
            .enumerate()
            .filter(|(_, &v)| v >= half_max)
            .map(|(i, _)| i)
            .collect();
        let observed_fwhm =
            (*above.last().unwrap() as f64 - *above.first().unwrap() as f64) * 0.1;
        let expected_fwhm = (narrow_fwhm * narrow_fwhm + slit_fwhm * slit_fwhm).sqrt();
        assert!((observed_fwhm - expected_fwhm).abs() / expected_fwhm < 0.15);
    }

    #[test]
    fn domain_error_when_kernel_exceeds_grid() {
        let hr = gaussian_table(0.1, 349.9, 350.1, 10, 350.0);
        let slit = Slit::Apodisation {
            resolution: 0.01,
            phase: 0.0,
        };
        let output_grid = vec![350.0];
        assert!(matches!(
            slit.convolve(&hr, &output_grid),
            Err(SlitError::DomainError { .. })
        ));
    }
}
