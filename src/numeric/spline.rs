// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Natural cubic spline: `SPLINE_Deriv2` (tridiagonal elimination for the
//! second derivatives) and `SPLINE_Vector` (linear or cubic evaluation),
//! grounded in the original engine's `spline.c`/`spline.h`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SplineError {
    #[error("spline requires at least two knots, got {0}")]
    TooFewKnots(usize),
    #[error("x and y knot vectors have mismatched lengths ({0} vs {1})")]
    LengthMismatch(usize, usize),
    #[error("knot abscissae must be strictly increasing (violated at index {0})")]
    NotStrictlyIncreasing(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplineMode {
    Linear,
    Cubic,
}

/// Compute the natural cubic spline second derivatives of `y(x)` (zero
/// second derivative at both boundaries).
pub fn deriv2(x: &[f64], y: &[f64]) -> Result<Vec<f64>, SplineError> {
    let n = x.len();
    if x.len() != y.len() {
        return Err(SplineError::LengthMismatch(x.len(), y.len()));
    }
    if n < 2 {
        return Err(SplineError::TooFewKnots(n));
    }
    for i in 1..n {
        if x[i] <= x[i - 1] {
            return Err(SplineError::NotStrictlyIncreasing(i));
        }
    }

    let mut y2 = vec![0.0; n];
    if n == 2 {
        // A straight line has identically zero curvature.
        return Ok(y2);
    }

    // Standard tridiagonal elimination for natural boundary conditions
    // (Numerical Recipes `spline`/`Press et al.`, matching the original
    // engine's `SPLINE_Deriv2`).
    let mut u = vec![0.0; n];
    y2[0] = 0.0;
    u[0] = 0.0;

    for i in 1..n - 1 {
        let sig = (x[i] - x[i - 1]) / (x[i + 1] - x[i - 1]);
        let p = sig * y2[i - 1] + 2.0;
        y2[i] = (sig - 1.0) / p;
        let mut temp = (y[i + 1] - y[i]) / (x[i + 1] - x[i]) - (y[i] - y[i - 1]) / (x[i] - x[i - 1]);
        temp = (6.0 * temp / (x[i + 1] - x[i - 1]) - sig * u[i - 1]) / p;
        u[i] = temp;
    }

    y2[n - 1] = 0.0;
    for k in (0..n - 1).rev() {
        y2[k] = y2[k] * y2[k + 1] + u[k];
    }

    Ok(y2)
}

/// Evaluate the spline defined by `(xa, ya, y2a)` at each point of `xb`.
pub fn vector(
    xa: &[f64],
    ya: &[f64],
    y2a: &[f64],
    xb: &[f64],
    mode: SplineMode,
) -> Result<Vec<f64>, SplineError> {
    let n = xa.len();
    if ya.len() != n || y2a.len() != n {
        return Err(SplineError::LengthMismatch(xa.len(), ya.len()));
    }
    if n < 2 {
        return Err(SplineError::TooFewKnots(n));
    }

    let mut out = Vec::with_capacity(xb.len());
    for &x in xb {
        out.push(eval_one(xa, ya, y2a, x, mode));
    }
    Ok(out)
}

fn eval_one(xa: &[f64], ya: &[f64], y2a: &[f64], x: f64, mode: SplineMode) -> f64 {
    let n = xa.len();
    // Locate the bracketing interval via bisection; clamp outside the
    // domain to the boundary interval (the engine never extrapolates
    // beyond the first/last segment).
    let mut klo = 0usize;
    let mut khi = n - 1;
    while khi - klo > 1 {
        let k = (khi + klo) / 2;
        if xa[k] > x {
            khi = k;
        } else {
            klo = k;
        }
    }

    let h = xa[khi] - xa[klo];
    match mode {
        SplineMode::Linear => {
            let t = (x - xa[klo]) / h;
            ya[klo] + t * (ya[khi] - ya[klo])
        }
        SplineMode::Cubic => {
            let a = (xa[khi] - x) / h;
            let b = (x - xa[klo]) / h;
            a * ya[klo]
                + b * ya[khi]
                + ((a.powi(3) - a) * y2a[klo] + (b.powi(3) - b) * y2a[khi]) * (h * h) / 6.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn cubic_spline_reproduces_knots() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|&v| v * v - 2.0 * v + 1.0).collect();
        let y2 = deriv2(&x, &y).unwrap();
        let interp = vector(&x, &y, &y2, &x, SplineMode::Cubic).unwrap();
        for (&expected, &got) in y.iter().zip(interp.iter()) {
            assert_abs_diff_eq!(expected, got, epsilon = 1e-12);
        }
    }

    #[test]
    fn linear_mode_is_piecewise_linear() {
        let x = vec![0.0, 1.0, 2.0];
        let y = vec![0.0, 1.0, 0.0];
        let y2 = vec![0.0; 3];
        let got = vector(&x, &y, &y2, &[0.5, 1.5], SplineMode::Linear).unwrap();
        assert_abs_diff_eq!(got[0], 0.5);
        assert_abs_diff_eq!(got[1], 0.5);
    }

    #[test]
    fn rejects_non_monotonic_knots() {
        let x = vec![0.0, 1.0, 0.5];
        let y = vec![0.0, 1.0, 2.0];
        assert!(deriv2(&x, &y).is_err());
    }
}
