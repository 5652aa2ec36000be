// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Special functions the slit-function library needs and that are not in
//! `std`: the error function, used by the Gaussian-convolved-with-box
//! ("error-function") slit and by the Voigt pseudo-profile.

/// Abramowitz & Stegun 7.1.26 rational approximation, accurate to about
/// `1.5e-7`, which is ample for slit-function kernels.
pub fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn erf_matches_known_values() {
        assert_abs_diff_eq!(erf(0.0), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(erf(1.0), 0.8427007929, epsilon = 1e-6);
        assert_abs_diff_eq!(erf(-1.0), -0.8427007929, epsilon = 1e-6);
    }
}
