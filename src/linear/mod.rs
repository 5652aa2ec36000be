// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Linear least-squares solver over one of three interchangeable backends,
//! grounded in the original engine's `struct linear_system` tagged union
//! (`linear_system.cpp`): an in-house SVD, a `nalgebra`-based QR (standing
//! in for the original's Eigen `ColPivHouseholderQR` backend) and an
//! optional LAPACK-based QR behind the `lapack` feature (standing in for
//! the original's GSL backend).

mod qr;
mod svd;

use ndarray::{Array1, Array2};
use thiserror::Error;

pub use svd::SvdDecomposition;

#[derive(Error, Debug)]
pub enum LinearSystemError {
    #[error("linear system is ill-conditioned: {0}")]
    IllConditioned(String),
    #[error("matrix inversion failed")]
    MatrixInv,
    #[error("weight vector length {0} does not match row count {1}")]
    WeightLengthMismatch(usize, usize),
    #[error("column index {0} is out of range (have {1} columns)")]
    ColumnOutOfRange(usize, usize),
    #[error("pseudoinverse is only defined for the SVD backend")]
    PinvRequiresSvd,
    #[error("system has not been decomposed yet")]
    NotDecomposed,
}

/// Selects which of the three backends [`LinearSystem::decompose`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Svd,
    QrNalgebra,
    #[cfg(feature = "lapack")]
    QrLapack,
}

enum Decomposed {
    Svd(SvdDecomposition),
    QrNalgebra(qr::QrDecomposition),
    #[cfg(feature = "lapack")]
    QrLapack(qr::lapack_backend::LapackQrDecomposition),
}

/// A dense `m x n` design matrix (`m` equations, `n` unknowns) together
/// with per-row weights, matching `LINEAR_alloc`/`LINEAR_from_matrix`.
pub struct LinearSystem {
    a: Array2<f64>,
    weight: Option<Array1<f64>>,
    norms: Array1<f64>,
    backend: Backend,
    decomposed: Option<Decomposed>,
}

impl LinearSystem {
    pub fn alloc(num_rows: usize, num_cols: usize, backend: Backend) -> Self {
        Self {
            a: Array2::zeros((num_rows, num_cols)),
            weight: None,
            norms: Array1::ones(num_cols),
            backend,
            decomposed: None,
        }
    }

    pub fn from_matrix(a: Array2<f64>, backend: Backend) -> Self {
        let num_cols = a.ncols();
        Self {
            a,
            weight: None,
            norms: Array1::ones(num_cols),
            backend,
            decomposed: None,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.a.nrows()
    }

    pub fn num_cols(&self) -> usize {
        self.a.ncols()
    }

    /// Overwrite column `j`.
    pub fn set_column(&mut self, j: usize, values: &[f64]) -> Result<(), LinearSystemError> {
        if j >= self.a.ncols() {
            return Err(LinearSystemError::ColumnOutOfRange(j, self.a.ncols()));
        }
        for (i, &v) in values.iter().enumerate() {
            self.a[[i, j]] = v;
        }
        self.decomposed = None;
        Ok(())
    }

    /// Set per-row weights `sigma`; each row `i` of `A` (and of `b` at
    /// solve time) is divided by `sigma[i]`.
    pub fn set_weight(&mut self, sigma: &[f64]) -> Result<(), LinearSystemError> {
        if sigma.len() != self.a.nrows() {
            return Err(LinearSystemError::WeightLengthMismatch(
                sigma.len(),
                self.a.nrows(),
            ));
        }
        for (i, &s) in sigma.iter().enumerate() {
            for j in 0..self.a.ncols() {
                self.a[[i, j]] /= s;
            }
        }
        self.weight = Some(Array1::from(sigma.to_vec()));
        self.decomposed = None;
        Ok(())
    }

    /// Normalise every column to unit Euclidean norm (storing the norms
    /// for later rescaling) and run the selected backend's decomposition.
    pub fn decompose(&mut self) -> Result<(), LinearSystemError> {
        let n = self.a.ncols();
        let mut norms = Array1::ones(n);
        for j in 0..n {
            let mut col = self.a.column_mut(j);
            let norm = crate::numeric::vector::norm(col.view());
            if norm > 0.0 {
                col.mapv_inplace(|x| x / norm);
            }
            norms[j] = norm;
        }
        self.norms = norms;

        self.decomposed = Some(match self.backend {
            Backend::Svd => Decomposed::Svd(svd::decompose(self.a.clone())?),
            Backend::QrNalgebra => Decomposed::QrNalgebra(qr::decompose(&self.a)?),
            #[cfg(feature = "lapack")]
            Backend::QrLapack => {
                Decomposed::QrLapack(qr::lapack_backend::decompose(&self.a)?)
            }
        });
        Ok(())
    }

    /// Solve `A x = b` (`b` already assumed weighted the same way `A` was
    /// via [`Self::set_weight`]), rescaling the solution by the stored
    /// column norms.
    pub fn solve(&self, b: &Array1<f64>) -> Result<Array1<f64>, LinearSystemError> {
        let decomposed = self.decomposed.as_ref().ok_or(LinearSystemError::NotDecomposed)?;
        let mut x = match decomposed {
            Decomposed::Svd(d) => svd::solve(d, b),
            Decomposed::QrNalgebra(d) => qr::solve(d, b)?,
            #[cfg(feature = "lapack")]
            Decomposed::QrLapack(d) => qr::lapack_backend::solve(d, b)?,
        };
        for j in 0..x.len() {
            if self.norms[j] != 0.0 {
                x[j] /= self.norms[j];
            }
        }
        Ok(x)
    }

    /// Covariance matrix of the fitted coefficients, rescaled by the
    /// column norms (`covar[i][j] /= norms[i] * norms[j]`).
    pub fn covariance(&self) -> Result<Array2<f64>, LinearSystemError> {
        let decomposed = self.decomposed.as_ref().ok_or(LinearSystemError::NotDecomposed)?;
        let mut covar = match decomposed {
            Decomposed::Svd(d) => svd::covariance(d),
            Decomposed::QrNalgebra(d) => d.covar.clone(),
            #[cfg(feature = "lapack")]
            Decomposed::QrLapack(d) => d.covar.clone(),
        };
        let n = covar.nrows();
        for i in 0..n {
            for j in 0..n {
                let ni = self.norms[i];
                let nj = self.norms[j];
                if ni != 0.0 && nj != 0.0 {
                    covar[[i, j]] /= ni * nj;
                }
            }
        }
        Ok(covar)
    }

    /// Moore-Penrose pseudoinverse; only defined for the SVD backend.
    pub fn pinv(&self) -> Result<Array2<f64>, LinearSystemError> {
        match self.decomposed.as_ref().ok_or(LinearSystemError::NotDecomposed)? {
            Decomposed::Svd(d) => Ok(svd::pinv(d)),
            _ => Err(LinearSystemError::PinvRequiresSvd),
        }
    }
}

/// Fit a degree-`order` polynomial `b(a) = x[0] + x[1]*a + ... +
/// x[order]*a^order` by weighted least squares, grounded in
/// `LINEAR_fit_poly`.
pub fn fit_poly(
    a: &[f64],
    b: &[f64],
    sigma: Option<&[f64]>,
    order: usize,
) -> Result<Array1<f64>, LinearSystemError> {
    let m = a.len();
    if b.len() != m {
        return Err(LinearSystemError::WeightLengthMismatch(b.len(), m));
    }
    let n = order + 1;
    let mut design = Array2::<f64>::ones((m, n));
    for i in 0..m {
        for j in 1..n {
            design[[i, j]] = design[[i, j - 1]] * a[i];
        }
    }
    let mut rhs = Array1::from(b.to_vec());

    let mut system = LinearSystem::from_matrix(design, Backend::Svd);
    if let Some(sigma) = sigma {
        system.set_weight(sigma)?;
        for i in 0..m {
            rhs[i] /= sigma[i];
        }
    }
    system.decompose()?;
    system.solve(&rhs)
}
