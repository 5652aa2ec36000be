// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Digital filters applied to spectra before cross-section fitting:
//! Kaiser FIR, Gaussian, boxcar, triangle, Savitzky-Golay and binomial,
//! each built once and then applied as an `N`-iteration convolution with
//! a "reflect" boundary policy. Grounded in the design note calling out
//! Kaiser-via-inverse-FFT and Savitzky-Golay-via-pseudoinverse as the two
//! filters that need a numeric library rather than a closed formula.

use rustfft::{num_complex::Complex64, FftPlanner};
use thiserror::Error;

use crate::linear::{Backend, LinearSystem};

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("filter width must be odd and at least 3, got {0}")]
    InvalidWidth(usize),
    #[error("Savitzky-Golay order {order} is not compatible with window width {width}")]
    InvalidOrder { order: usize, width: usize },
    #[error("Kaiser filter parameters produced a non-finite coefficient")]
    NonFinite,
    #[error(transparent)]
    Linear(#[from] crate::linear::LinearSystemError),
}

/// The closed set of filter kernels the engine can build.
#[derive(Debug, Clone)]
pub enum FilterKind {
    None,
    Kaiser {
        cutoff: f64,
        pass_band: f64,
        tolerance: f64,
    },
    Gaussian {
        fwhm: f64,
        width: usize,
    },
    Boxcar {
        width: usize,
    },
    Triangle {
        width: usize,
    },
    SavitzkyGolay {
        width: usize,
        order: usize,
    },
    Binomial {
        width: usize,
    },
}

/// A built, normalised convolution kernel ready for repeated application.
#[derive(Debug, Clone)]
pub struct Filter {
    kernel: Vec<f64>,
    iterations: u32,
}

impl Filter {
    pub fn build(kind: &FilterKind, iterations: u32) -> Result<Self, FilterError> {
        let kernel = match kind {
            FilterKind::None => vec![1.0],
            FilterKind::Kaiser {
                cutoff,
                pass_band,
                tolerance,
            } => kaiser_kernel(*cutoff, *pass_band, *tolerance)?,
            FilterKind::Gaussian { fwhm, width } => gaussian_kernel(*fwhm, *width)?,
            FilterKind::Boxcar { width } => boxcar_kernel(*width)?,
            FilterKind::Triangle { width } => triangle_kernel(*width)?,
            FilterKind::SavitzkyGolay { width, order } => {
                savitzky_golay_kernel(*width, *order)?
            }
            FilterKind::Binomial { width } => binomial_kernel(*width)?,
        };
        Ok(Self {
            kernel,
            iterations,
        })
    }

    pub fn kernel(&self) -> &[f64] {
        &self.kernel
    }

    /// Apply the filter `self.iterations` times with "reflect" boundary
    /// handling (index `-k` maps to `k`, index `n+k` maps to `n-1-k`).
    pub fn apply(&self, signal: &[f64]) -> Vec<f64> {
        let mut current = signal.to_vec();
        for _ in 0..self.iterations.max(1) {
            current = convolve_reflect(&current, &self.kernel);
        }
        current
    }
}

fn reflect_index(i: isize, n: isize) -> usize {
    let mut i = i;
    if n <= 1 {
        return 0;
    }
    while i < 0 || i >= n {
        if i < 0 {
            i = -i - 1;
        } else if i >= n {
            i = 2 * n - i - 1;
        }
    }
    i as usize
}

fn convolve_reflect(signal: &[f64], kernel: &[f64]) -> Vec<f64> {
    let n = signal.len() as isize;
    let half = (kernel.len() / 2) as isize;
    let mut out = vec![0.0; signal.len()];
    for i in 0..signal.len() as isize {
        let mut acc = 0.0;
        for (k, &w) in kernel.iter().enumerate() {
            let offset = k as isize - half;
            acc += w * signal[reflect_index(i + offset, n)];
        }
        out[i as usize] = acc;
    }
    out
}

fn normalize(mut kernel: Vec<f64>) -> Vec<f64> {
    let sum: f64 = kernel.iter().sum();
    if sum.abs() > 0.0 {
        kernel.iter_mut().for_each(|v| *v /= sum);
    }
    kernel
}

fn check_width(width: usize) -> Result<(), FilterError> {
    if width < 3 || width % 2 == 0 {
        return Err(FilterError::InvalidWidth(width));
    }
    Ok(())
}

fn boxcar_kernel(width: usize) -> Result<Vec<f64>, FilterError> {
    check_width(width)?;
    Ok(vec![1.0 / width as f64; width])
}

fn triangle_kernel(width: usize) -> Result<Vec<f64>, FilterError> {
    check_width(width)?;
    let half = (width / 2) as f64;
    let kernel: Vec<f64> = (0..width)
        .map(|i| half + 1.0 - (i as f64 - half).abs())
        .collect();
    Ok(normalize(kernel))
}

fn gaussian_kernel(fwhm: f64, width: usize) -> Result<Vec<f64>, FilterError> {
    check_width(width)?;
    let sigma = fwhm / (2.0 * (2.0_f64).ln().sqrt());
    let half = (width / 2) as f64;
    let kernel: Vec<f64> = (0..width)
        .map(|i| {
            let d = i as f64 - half;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    Ok(normalize(kernel))
}

fn binomial_kernel(width: usize) -> Result<Vec<f64>, FilterError> {
    check_width(width)?;
    // Row `width-1` of Pascal's triangle.
    let n = width - 1;
    let mut row = vec![1.0_f64; width];
    for i in 0..width {
        row[i] = binomial_coeff(n, i);
    }
    Ok(normalize(row))
}

fn binomial_coeff(n: usize, k: usize) -> f64 {
    let mut result = 1.0_f64;
    for i in 0..k.min(n - k) {
        result = result * (n - i) as f64 / (i + 1) as f64;
    }
    result
}

/// Savitzky-Golay smoothing kernel: the first row of the pseudoinverse of
/// the polynomial Vandermonde matrix built over the window, so that
/// `kernel . signal` reproduces the fitted polynomial's value at the
/// window centre.
fn savitzky_golay_kernel(width: usize, order: usize) -> Result<Vec<f64>, FilterError> {
    check_width(width)?;
    if order >= width {
        return Err(FilterError::InvalidOrder { order, width });
    }
    let half = (width / 2) as f64;
    let mut vandermonde = ndarray::Array2::<f64>::ones((width, order + 1));
    for i in 0..width {
        let t = i as f64 - half;
        for j in 1..=order {
            vandermonde[[i, j]] = vandermonde[[i, j - 1]] * t;
        }
    }

    let mut system = LinearSystem::from_matrix(vandermonde, Backend::Svd);
    system.decompose()?;
    let pinv = system.pinv()?;

    // Row 0 of pinv gives the coefficients that reproduce the polynomial
    // value at t=0 (the window centre) from the raw samples.
    let kernel: Vec<f64> = (0..width).map(|j| pinv[[0, j]]).collect();
    if kernel.iter().any(|v| !v.is_finite()) {
        return Err(FilterError::NonFinite);
    }
    Ok(kernel)
}

/// Kaiser-windowed FIR low-pass filter, built by inverse-FFT of a
/// frequency-domain mask shaped with a Bessel-I₀ window.
fn kaiser_kernel(cutoff: f64, pass_band: f64, tolerance: f64) -> Result<Vec<f64>, FilterError> {
    // Kaiser beta from the stopband ripple, per the standard design rule.
    let attenuation = -20.0 * tolerance.max(1e-12).log10();
    let beta = if attenuation > 50.0 {
        0.1102 * (attenuation - 8.7)
    } else if attenuation >= 21.0 {
        0.5842 * (attenuation - 21.0).powf(0.4) + 0.07886 * (attenuation - 21.0)
    } else {
        0.0
    };

    let transition = pass_band.max(1e-6);
    let n = ((attenuation - 8.0) / (2.285 * transition)).ceil().max(4.0) as usize;
    let len = if n % 2 == 0 { n + 1 } else { n };

    let fft_len = (len * 8).next_power_of_two();
    let mut spectrum = vec![Complex64::new(0.0, 0.0); fft_len];
    let cutoff_bin = ((cutoff * fft_len as f64).round() as usize).min(fft_len / 2);
    for bin in 0..=cutoff_bin {
        spectrum[bin] = Complex64::new(1.0, 0.0);
        if bin > 0 {
            spectrum[fft_len - bin] = Complex64::new(1.0, 0.0);
        }
    }

    let mut planner = FftPlanner::new();
    let ifft = planner.plan_fft_inverse(fft_len);
    ifft.process(&mut spectrum);

    let half = (len / 2) as isize;
    let mut kernel = Vec::with_capacity(len);
    for i in 0..len {
        let offset = i as isize - half;
        let idx = offset.rem_euclid(fft_len as isize) as usize;
        let window = bessel_i0(beta * (1.0 - (offset as f64 / half as f64).powi(2)).max(0.0).sqrt())
            / bessel_i0(beta);
        kernel.push(spectrum[idx].re / fft_len as f64 * window);
    }

    let kernel = normalize(kernel);
    if kernel.iter().any(|v| !v.is_finite()) {
        return Err(FilterError::NonFinite);
    }
    Ok(kernel)
}

/// Modified Bessel function of the first kind, order 0, via its power
/// series (used only for the Kaiser window, where `beta` stays small).
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let half_x_sq = (x / 2.0).powi(2);
    for k in 1..=30 {
        term *= half_x_sq / (k as f64 * k as f64);
        sum += term;
        if term < 1e-16 * sum {
            break;
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn boxcar_kernel_is_normalised() {
        let f = Filter::build(&FilterKind::Boxcar { width: 5 }, 1).unwrap();
        let sum: f64 = f.kernel().iter().sum();
        assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn boxcar_smooths_a_spike() {
        let f = Filter::build(&FilterKind::Boxcar { width: 3 }, 1).unwrap();
        let mut signal = vec![0.0; 11];
        signal[5] = 3.0;
        let out = f.apply(&signal);
        assert_abs_diff_eq!(out[5], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[4], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn reflect_boundary_does_not_zero_pad() {
        let f = Filter::build(&FilterKind::Boxcar { width: 3 }, 1).unwrap();
        let signal = vec![1.0, 1.0, 1.0, 1.0];
        let out = f.apply(&signal);
        // A constant signal convolved with a normalised kernel under
        // reflect boundaries must stay constant everywhere, including
        // the edges.
        for v in out {
            assert_abs_diff_eq!(v, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn savitzky_golay_reproduces_a_line_exactly() {
        let f = Filter::build(
            &FilterKind::SavitzkyGolay {
                width: 5,
                order: 2,
            },
            1,
        )
        .unwrap();
        let signal: Vec<f64> = (0..20).map(|i| 2.0 * i as f64 + 1.0).collect();
        let out = f.apply(&signal);
        for i in 2..18 {
            assert_abs_diff_eq!(out[i], signal[i], epsilon = 1e-6);
        }
    }

    #[test]
    fn binomial_kernel_matches_pascal_row() {
        let kernel = binomial_kernel(5).unwrap();
        // Row 4 of Pascal's triangle is 1,4,6,4,1 -> sums to 16.
        assert_abs_diff_eq!(kernel[0], 1.0 / 16.0, epsilon = 1e-12);
        assert_abs_diff_eq!(kernel[2], 6.0 / 16.0, epsilon = 1e-12);
    }

    #[test]
    fn invalid_even_width_is_rejected() {
        assert!(matches!(
            Filter::build(&FilterKind::Boxcar { width: 4 }, 1),
            Err(FilterError::InvalidWidth(4))
        ));
    }
}
