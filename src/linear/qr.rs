// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! QR-decomposition backends. `nalgebra` stands in for the original
//! engine's template-matrix (Eigen) backend; the optional `lapack` feature
//! (`ndarray-linalg`) stands in for its external-numerical-library (GSL)
//! backend. Grounded in `linear_system.cpp`'s `DECOMP_QR`/`DECOMP_QR_GSL`
//! paths.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};

use super::LinearSystemError;

#[derive(Debug, Clone)]
pub struct QrDecomposition {
    /// Covariance matrix `(A^T A)^-1`.
    pub covar: Array2<f64>,
    a_rows: usize,
    a_cols: usize,
    qr: nalgebra::linalg::QR<f64, nalgebra::Dyn, nalgebra::Dyn>,
}

fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    let (m, n) = a.dim();
    DMatrix::from_fn(m, n, |i, j| a[[i, j]])
}

/// Decompose `a` (`m x n`, `m >= n`) using `nalgebra`'s Householder QR.
pub fn decompose(a: &Array2<f64>) -> Result<QrDecomposition, LinearSystemError> {
    let (m, n) = a.dim();
    if m < n {
        return Err(LinearSystemError::IllConditioned(
            "QR requires at least as many rows as columns".into(),
        ));
    }
    let mat = to_dmatrix(a);
    let qr = mat.clone().qr();

    let r = qr.r();
    // (A^T A)^-1 = (R^T R)^-1 = R^-1 (R^-1)^T via Cholesky-free triangular
    // solves against the identity, matching the original's `R'R` covariance.
    let r_inv = r
        .clone()
        .try_inverse()
        .ok_or_else(|| LinearSystemError::IllConditioned("R is singular in QR solve".into()))?;
    let covar_mat = &r_inv * r_inv.transpose();
    let mut covar = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            covar[[i, j]] = covar_mat[(i, j)];
        }
    }

    Ok(QrDecomposition {
        covar,
        a_rows: m,
        a_cols: n,
        qr,
    })
}

pub fn solve(decomp: &QrDecomposition, b: &Array1<f64>) -> Result<Array1<f64>, LinearSystemError> {
    let rhs = DVector::from_fn(decomp.a_rows, |i, _| b[i]);
    let x = decomp
        .qr
        .solve(&rhs)
        .ok_or_else(|| LinearSystemError::IllConditioned("QR solve failed".into()))?;
    let mut out = Array1::zeros(decomp.a_cols);
    for i in 0..decomp.a_cols {
        out[i] = x[i];
    }
    Ok(out)
}

#[cfg(feature = "lapack")]
pub mod lapack_backend {
    use super::*;
    use ndarray_linalg::{Inverse, QR};

    #[derive(Debug, Clone)]
    pub struct LapackQrDecomposition {
        pub covar: Array2<f64>,
        a: Array2<f64>,
    }

    pub fn decompose(a: &Array2<f64>) -> Result<LapackQrDecomposition, LinearSystemError> {
        let (_q, r) = a
            .qr()
            .map_err(|e| LinearSystemError::IllConditioned(format!("lapack QR failed: {e}")))?;
        let rtr = r.t().dot(&r);
        let covar = rtr
            .inv()
            .map_err(|e| LinearSystemError::IllConditioned(format!("R'R singular: {e}")))?;
        Ok(LapackQrDecomposition { covar, a: a.clone() })
    }

    pub fn solve(
        decomp: &LapackQrDecomposition,
        b: &Array1<f64>,
    ) -> Result<Array1<f64>, LinearSystemError> {
        let (q, r) = decomp
            .a
            .qr()
            .map_err(|e| LinearSystemError::IllConditioned(format!("lapack QR failed: {e}")))?;
        let qtb = q.t().dot(b);
        back_substitute(&r, &qtb)
    }

    fn back_substitute(r: &Array2<f64>, qtb: &Array1<f64>) -> Result<Array1<f64>, LinearSystemError> {
        let n = r.ncols();
        let mut x = Array1::zeros(n);
        for i in (0..n).rev() {
            let mut s = qtb[i];
            for j in (i + 1)..n {
                s -= r[[i, j]] * x[j];
            }
            if r[[i, i]].abs() < 1e-300 {
                return Err(LinearSystemError::MatrixInv);
            }
            x[i] = s / r[[i, i]];
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn solves_overdetermined_line_fit() {
        let a = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0], [1.0, 3.0]];
        let b = array![1.0, 3.0, 5.0, 7.0];
        let decomp = decompose(&a).unwrap();
        let x = solve(&decomp, &b).unwrap();
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(x[1], 2.0, epsilon = 1e-8);
    }
}
