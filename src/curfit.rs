// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Marquardt-Levenberg nonlinear least-squares driver, grounded line for
//! line in the original engine's `curfit.c` (`Curfit`, `Fchisq`,
//! `CurfitMatinv`, `CurfitNumDeriv`, `CurfitDerivFunc`).
//!
//! Unlike the original, which special-cases which `TabCross` fields get
//! an analytic derivative by switching on several flags inline, this
//! driver asks the model once per parameter, up front
//! ([`NonlinearModel::derivative_mode`]) — an explicit per-parameter
//! declaration rather than scattered flag checks.

use ndarray::{Array1, Array2};
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::constants::{CHISQ_HUGE_RESIDUAL, CURFIT_MAX_ITER};

#[derive(Error, Debug)]
pub enum CurfitError {
    #[error("division by zero computing the numeric derivative of parameter `{0}`")]
    DivisionByZero(String),
    #[error("non-positive argument to sqrt while scaling parameter `{0}` (degenerate fit)")]
    SqrtArg(String),
    #[error("matrix inversion failed during pivoting")]
    MatrixInv,
    #[error("fit did not converge within {0} iterations")]
    Convergence(u32),
    #[error("fit cancelled by user request")]
    UserStop,
    #[error("forward model evaluation failed: {0}")]
    Model(String),
    #[error("instrumental weighting requested but no sigma was provided")]
    MissingSigma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivativeMode {
    Analytic,
    Numeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightingMode {
    #[default]
    None,
    Instrumental,
    /// First-class (not aliased to `None`): `w_i = 1/|Y_i|`, falling
    /// back to `1` where `Y_i == 0`.
    Statistical,
}

/// Anything Curfit can fit: evaluates the model at a parameter vector
/// and declares, per parameter, whether its derivative is computed
/// analytically or by forward difference.
pub trait NonlinearModel {
    fn dim(&self) -> usize;
    fn derivative_mode(&self, j: usize) -> DerivativeMode;
    /// Forward-difference step for parameter `j`; `0.0` means the
    /// parameter is pinned (no numeric derivative requested).
    fn delta(&self, j: usize) -> f64;
    /// `(min, max)`; `None` on either side means unbounded.
    fn bounds(&self, j: usize) -> (Option<f64>, Option<f64>);
    fn param_name(&self, j: usize) -> String;

    /// Evaluate `Yfit(a)` over the fitted pixels.
    fn evaluate(&self, a: &Array1<f64>) -> Result<Array1<f64>, CurfitError>;

    /// Analytic `∂Yfit/∂A_j`, only called when
    /// `derivative_mode(j) == Analytic`.
    fn analytic_derivative(
        &self,
        a: &Array1<f64>,
        j: usize,
        yfit: &Array1<f64>,
    ) -> Result<Array1<f64>, CurfitError>;
}

#[derive(Debug, Clone)]
pub struct CurfitResult {
    pub a: Array1<f64>,
    pub sigma_a: Array1<f64>,
    pub covar: Array2<f64>,
    pub chisq: f64,
    pub n_iter: u32,
}

pub(crate) fn weights(
    y: &Array1<f64>,
    sigma: Option<&Array1<f64>>,
    mode: WeightingMode,
) -> Result<Array1<f64>, CurfitError> {
    let n = y.len();
    match mode {
        WeightingMode::None => Ok(Array1::ones(n)),
        WeightingMode::Instrumental => {
            let sigma = sigma.ok_or(CurfitError::MissingSigma)?;
            Ok(sigma.mapv(|s| if s != 0.0 { 1.0 / (s * s) } else { 0.0 }))
        }
        WeightingMode::Statistical => Ok(y.mapv(|v| if v != 0.0 { 1.0 / v.abs() } else { 1.0 })),
    }
}

pub(crate) fn chisq(y: &Array1<f64>, yfit: &Array1<f64>, w: &Array1<f64>, n_free: f64) -> f64 {
    let sum: f64 = y
        .iter()
        .zip(yfit.iter())
        .zip(w.iter())
        .map(|((&yi, &fi), &wi)| wi * (yi - fi).powi(2))
        .sum();
    if n_free > 0.0 {
        sum / n_free
    } else {
        sum
    }
}

/// Gauss-Jordan elimination with full pivoting, grounded in
/// `CurfitMatinv`. Inverts `m` in place; returns an error if a pivot is
/// (numerically) zero.
fn matinv(m: &mut Array2<f64>) -> Result<(), CurfitError> {
    let n = m.nrows();
    let mut ik = vec![0usize; n];
    let mut jk = vec![0usize; n];

    for k in 0..n {
        let mut amax = 0.0_f64;
        let (mut pivot_i, mut pivot_j) = (k, k);
        for i in k..n {
            for j in k..n {
                if m[[i, j]].abs() >= amax {
                    amax = m[[i, j]].abs();
                    pivot_i = i;
                    pivot_j = j;
                }
            }
        }
        if amax == 0.0 {
            return Err(CurfitError::MatrixInv);
        }
        ik[k] = pivot_i;
        jk[k] = pivot_j;

        if pivot_i != k {
            for j in 0..n {
                m.swap((k, j), (pivot_i, j));
            }
        }
        if pivot_j != k {
            for i in 0..n {
                m.swap((i, k), (i, pivot_j));
            }
        }

        let pivot = m[[k, k]];
        for j in 0..n {
            if j != k {
                m[[k, j]] /= -pivot;
            }
        }
        for i in 0..n {
            if i != k {
                let factor = m[[i, k]];
                for j in 0..n {
                    if j != k {
                        m[[i, j]] += factor * m[[k, j]];
                    }
                }
            }
        }
        for i in 0..n {
            if i != k {
                m[[i, k]] /= pivot;
            }
        }
        m[[k, k]] = 1.0 / pivot;
    }

    for k in (0..n).rev() {
        if jk[k] != k {
            for i in 0..n {
                m.swap((i, k), (i, jk[k]));
            }
        }
        if ik[k] != k {
            for j in 0..n {
                m.swap((k, j), (ik[k], j));
            }
        }
    }
    Ok(())
}

/// Run the Marquardt-Levenberg loop to convergence, starting from `a0`.
pub fn fit<M: NonlinearModel>(
    model: &M,
    y: &Array1<f64>,
    sigma: Option<&Array1<f64>>,
    weighting: WeightingMode,
    a0: Array1<f64>,
    n_free: f64,
    cancel: &CancellationToken,
) -> Result<CurfitResult, CurfitError> {
    let dim = model.dim();
    let w = weights(y, sigma, weighting)?;

    let mut a = a0;
    let mut yfit = model.evaluate(&a)?;
    let mut current_chisq = chisq(y, &yfit, &w, n_free);
    let mut lambda = 0.001_f64;

    for iter in 1..=CURFIT_MAX_ITER {
        if cancel.is_cancelled() {
            return Err(CurfitError::UserStop);
        }

        let mut design = Array2::<f64>::zeros((y.len(), dim));
        for j in 0..dim {
            let deriv = match model.derivative_mode(j) {
                DerivativeMode::Analytic => model.analytic_derivative(&a, j, &yfit)?,
                DerivativeMode::Numeric => {
                    let dj = model.delta(j);
                    if dj == 0.0 {
                        return Err(CurfitError::DivisionByZero(model.param_name(j)));
                    }
                    let mut a_pert = a.clone();
                    a_pert[j] += dj;
                    let yfit_pert = model.evaluate(&a_pert)?;
                    (&yfit_pert - &yfit) / dj
                }
            };
            design.column_mut(j).assign(&deriv);
        }

        let mut alpha = Array2::<f64>::zeros((dim, dim));
        let mut beta = Array1::<f64>::zeros(dim);
        let resid = y - &yfit;
        for j in 0..dim {
            let dj = design.column(j);
            beta[j] = (&resid * &w * &dj).sum();
            for k in 0..dim {
                let dk = design.column(k);
                alpha[[j, k]] = (&w * &dj * &dk).sum();
            }
        }

        let mut scaled = Array2::<f64>::zeros((dim, dim));
        for j in 0..dim {
            for k in 0..dim {
                let denom = (alpha[[j, j]] * alpha[[k, k]]).sqrt();
                if j == k {
                    scaled[[j, k]] = 1.0 + lambda;
                } else if denom > 0.0 {
                    scaled[[j, k]] = alpha[[j, k]] / denom;
                } else {
                    return Err(CurfitError::SqrtArg(model.param_name(j)));
                }
            }
        }

        let mut inv = scaled.clone();
        matinv(&mut inv)?;

        let mut step = Array1::<f64>::zeros(dim);
        for j in 0..dim {
            let mut s = 0.0;
            for k in 0..dim {
                let denom = (alpha[[j, j]] * alpha[[k, k]]).sqrt();
                if denom > 0.0 {
                    s += inv[[j, k]] * beta[k] / denom;
                }
            }
            step[j] = s;
        }

        let mut trial = &a + &step;
        let mut clamped = false;
        for j in 0..dim {
            let (lo, hi) = model.bounds(j);
            if let (Some(lo), Some(hi)) = (lo, hi) {
                if lo == hi {
                    // Pinned: this parameter never moves.
                    if trial[j] != lo {
                        trial[j] = lo;
                        clamped = true;
                    }
                } else if trial[j] < lo {
                    trial[j] = lo;
                    clamped = true;
                } else if trial[j] > hi {
                    trial[j] = hi;
                    clamped = true;
                }
            }
        }

        let mut trial_yfit = model.evaluate(&trial)?;
        let mut trial_chisq = chisq(y, &trial_yfit, &w, n_free);
        if clamped {
            trial_yfit = model.evaluate(&trial)?;
            trial_chisq = chisq(y, &trial_yfit, &w, n_free);
        }

        if !trial_chisq.is_finite() || trial_chisq >= current_chisq.min(CHISQ_HUGE_RESIDUAL) {
            lambda *= 10.0;
            continue;
        }
        lambda *= 0.1;

        a = trial;
        yfit = trial_yfit;
        current_chisq = trial_chisq;

        if (step.iter().map(|v| v.abs()).fold(0.0, f64::max)) < 1e-10 {
            let covar = final_covariance(&alpha, dim)?;
            let mut sigma_a = diag_sigma(&covar, &alpha, current_chisq, model)?;
            for j in 0..dim {
                if let (Some(lo), Some(hi)) = model.bounds(j) {
                    if lo == hi {
                        sigma_a[j] = 0.0;
                    }
                }
            }
            return Ok(CurfitResult {
                a,
                sigma_a,
                covar,
                chisq: current_chisq,
                n_iter: iter,
            });
        }
    }

    Err(CurfitError::Convergence(CURFIT_MAX_ITER))
}

fn final_covariance(alpha: &Array2<f64>, dim: usize) -> Result<Array2<f64>, CurfitError> {
    let mut m = alpha.clone();
    matinv(&mut m)?;
    let mut covar = Array2::zeros((dim, dim));
    for j in 0..dim {
        for k in 0..dim {
            let denom = (alpha[[j, j]] * alpha[[k, k]]).sqrt();
            if denom > 0.0 {
                covar[[j, k]] = m[[j, k]] / denom;
            }
        }
    }
    Ok(covar)
}

fn diag_sigma<M: NonlinearModel>(
    covar: &Array2<f64>,
    alpha: &Array2<f64>,
    chisq_final: f64,
    model: &M,
) -> Result<Array1<f64>, CurfitError> {
    let dim = covar.nrows();
    let mut sigma_a = Array1::zeros(dim);
    for j in 0..dim {
        if alpha[[j, j]] <= 0.0 {
            continue;
        }
        let arg = covar[[j, j]] / alpha[[j, j]] * chisq_final;
        if arg < 0.0 {
            return Err(CurfitError::SqrtArg(model.param_name(j)));
        }
        sigma_a[j] = arg.sqrt();
    }
    Ok(sigma_a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// `y = a0 + a1 * x`, fitted with both derivatives numeric.
    struct LineModel {
        x: Array1<f64>,
    }

    impl NonlinearModel for LineModel {
        fn dim(&self) -> usize {
            2
        }
        fn derivative_mode(&self, _j: usize) -> DerivativeMode {
            DerivativeMode::Numeric
        }
        fn delta(&self, _j: usize) -> f64 {
            1e-6
        }
        fn bounds(&self, _j: usize) -> (Option<f64>, Option<f64>) {
            (None, None)
        }
        fn param_name(&self, j: usize) -> String {
            format!("a{j}")
        }
        fn evaluate(&self, a: &Array1<f64>) -> Result<Array1<f64>, CurfitError> {
            Ok(self.x.mapv(|xi| a[0] + a[1] * xi))
        }
        fn analytic_derivative(
            &self,
            _a: &Array1<f64>,
            _j: usize,
            _yfit: &Array1<f64>,
        ) -> Result<Array1<f64>, CurfitError> {
            unreachable!()
        }
    }

    #[test]
    fn recovers_a_linear_fit() {
        let x = Array1::from((0..20).map(|i| i as f64).collect::<Vec<_>>());
        let y = x.mapv(|xi| 1.5 + 2.0 * xi);
        let model = LineModel { x };
        let cancel = CancellationToken::new();
        let result = fit(
            &model,
            &y,
            None,
            WeightingMode::None,
            Array1::from(vec![0.0, 0.0]),
            18.0,
            &cancel,
        )
        .unwrap();
        assert_abs_diff_eq!(result.a[0], 1.5, epsilon = 1e-4);
        assert_abs_diff_eq!(result.a[1], 2.0, epsilon = 1e-4);
    }

    #[test]
    fn cancellation_token_aborts_the_fit() {
        let x = Array1::from((0..20).map(|i| i as f64).collect::<Vec<_>>());
        let y = x.mapv(|xi| 1.5 + 2.0 * xi);
        let model = LineModel { x };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fit(
            &model,
            &y,
            None,
            WeightingMode::None,
            Array1::from(vec![0.0, 0.0]),
            18.0,
            &cancel,
        );
        assert!(matches!(result, Err(CurfitError::UserStop)));
    }
}
