// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! In-house singular value decomposition backend, grounded in the original
//! engine's `svd.c` (`SVD_Dcmp`/`SVD_Bksb`), itself the classic
//! Householder-bidiagonalisation-plus-QR algorithm (Golub-Reinsch).

use ndarray::{Array1, Array2};

use crate::constants::SVD_EPSILON;

use super::LinearSystemError;

/// `A = U * diag(W) * V^T`, with `U` overwriting the original `m x n`
/// matrix in place (Golub-Reinsch "thin" SVD: `U` is `m x n`, `V` is
/// `n x n`).
#[derive(Debug, Clone)]
pub struct SvdDecomposition {
    pub u: Array2<f64>,
    pub v: Array2<f64>,
    pub w: Array1<f64>,
}

fn pythag(a: f64, b: f64) -> f64 {
    let (a, b) = (a.abs(), b.abs());
    if a > b {
        a * (1.0 + (b / a).powi(2)).sqrt()
    } else if b == 0.0 {
        0.0
    } else {
        b * (1.0 + (a / b).powi(2)).sqrt()
    }
}

fn sign(a: f64, b: f64) -> f64 {
    if b >= 0.0 {
        a.abs()
    } else {
        -a.abs()
    }
}

/// Decompose `a` (`m x n`, `m >= n`) in place. Returns `U` (overwriting
/// `a`), `V`, and the singular values `W`.
pub fn decompose(mut a: Array2<f64>) -> Result<SvdDecomposition, LinearSystemError> {
    let (m, n) = a.dim();
    if m < n {
        return Err(LinearSystemError::IllConditioned(
            "SVD requires at least as many rows as columns".into(),
        ));
    }

    let mut w = Array1::<f64>::zeros(n);
    let mut v = Array2::<f64>::zeros((n, n));
    let mut rv1 = Array1::<f64>::zeros(n);

    let mut g = 0.0_f64;
    let mut scale = 0.0_f64;
    let mut anorm = 0.0_f64;
    let mut l = 0usize;

    // Householder reduction to bidiagonal form.
    for i in 0..n {
        l = i + 1;
        rv1[i] = scale * g;
        g = 0.0;
        let mut s = 0.0;
        scale = 0.0;
        if i < m {
            for k in i..m {
                scale += a[[k, i]].abs();
            }
            if scale != 0.0 {
                for k in i..m {
                    a[[k, i]] /= scale;
                    s += a[[k, i]] * a[[k, i]];
                }
                let f = a[[i, i]];
                g = -sign(s.sqrt(), f);
                let h = f * g - s;
                a[[i, i]] = f - g;
                for j in l..n {
                    let mut s = 0.0;
                    for k in i..m {
                        s += a[[k, i]] * a[[k, j]];
                    }
                    let fac = s / h;
                    for k in i..m {
                        a[[k, j]] += fac * a[[k, i]];
                    }
                }
                for k in i..m {
                    a[[k, i]] *= scale;
                }
            }
        }
        w[i] = scale * g;

        g = 0.0;
        s = 0.0;
        scale = 0.0;
        if i < m && i != n - 1 {
            for k in l..n {
                scale += a[[i, k]].abs();
            }
            if scale != 0.0 {
                for k in l..n {
                    a[[i, k]] /= scale;
                    s += a[[i, k]] * a[[i, k]];
                }
                let f = a[[i, l]];
                g = -sign(s.sqrt(), f);
                let h = f * g - s;
                a[[i, l]] = f - g;
                for k in l..n {
                    rv1[k] = a[[i, k]] / h;
                }
                for j in l..m {
                    let mut s = 0.0;
                    for k in l..n {
                        s += a[[j, k]] * a[[i, k]];
                    }
                    for k in l..n {
                        a[[j, k]] += s * rv1[k];
                    }
                }
                for k in l..n {
                    a[[i, k]] *= scale;
                }
            }
        }
        anorm = anorm.max(w[i].abs() + rv1[i].abs());
    }

    // Accumulate right-hand transformations (V).
    for i in (0..n).rev() {
        if i < n - 1 {
            if g != 0.0 {
                for j in l..n {
                    v[[j, i]] = (a[[i, j]] / a[[i, l]]) / g;
                }
                for j in l..n {
                    let mut s = 0.0;
                    for k in l..n {
                        s += a[[i, k]] * v[[k, j]];
                    }
                    for k in l..n {
                        v[[k, j]] += s * v[[k, i]];
                    }
                }
            }
            for j in l..n {
                v[[i, j]] = 0.0;
                v[[j, i]] = 0.0;
            }
        }
        v[[i, i]] = 1.0;
        g = rv1[i];
        l = i;
    }

    // Accumulate left-hand transformations (U, overwriting a).
    for i in (0..n.min(m)).rev() {
        let l = i + 1;
        g = w[i];
        for j in l..n {
            a[[i, j]] = 0.0;
        }
        if g != 0.0 {
            g = 1.0 / g;
            for j in l..n {
                let mut s = 0.0;
                for k in l..m {
                    s += a[[k, i]] * a[[k, j]];
                }
                let fac = (s / a[[i, i]]) * g;
                for k in i..m {
                    a[[k, j]] += fac * a[[k, i]];
                }
            }
            for j in i..m {
                a[[j, i]] *= g;
            }
        } else {
            for j in i..m {
                a[[j, i]] = 0.0;
            }
        }
        a[[i, i]] += 1.0;
    }

    // Diagonalisation of the bidiagonal form: implicit QR algorithm.
    for k in (0..n).rev() {
        for _iteration in 0..30 {
            let mut flag = true;
            let mut nm = 0usize;
            let mut l_found = 0usize;
            let mut broke = false;
            for ll in (0..=k).rev() {
                l_found = ll;
                if ll == 0 || rv1[ll].abs() + anorm == anorm {
                    flag = false;
                    broke = true;
                    break;
                }
                nm = ll - 1;
                if w[nm].abs() + anorm == anorm {
                    broke = true;
                    break;
                }
            }
            if !broke {
                l_found = 0;
            }
            if flag {
                // Cancellation of rv1[l] if l > 0.
                let mut c = 0.0;
                let mut s = 1.0;
                for i in l_found..=k {
                    let f = s * rv1[i];
                    rv1[i] = c * rv1[i];
                    if f.abs() + anorm == anorm {
                        break;
                    }
                    g = w[i];
                    let h = pythag(f, g);
                    w[i] = h;
                    let h_inv = 1.0 / h;
                    c = g * h_inv;
                    s = -f * h_inv;
                    for j in 0..m {
                        let y = a[[j, nm]];
                        let z = a[[j, i]];
                        a[[j, nm]] = y * c + z * s;
                        a[[j, i]] = z * c - y * s;
                    }
                }
            }
            let z = w[k];
            if l_found == k {
                if z < 0.0 {
                    w[k] = -z;
                    for j in 0..n {
                        v[[j, k]] = -v[[j, k]];
                    }
                }
                break;
            }
            if _iteration == 29 {
                return Err(LinearSystemError::IllConditioned(
                    "SVD failed to converge after 30 iterations".into(),
                ));
            }

            let x = w[l_found];
            let nm2 = k - 1;
            let y = w[nm2];
            g = rv1[nm2];
            let h = rv1[k];
            let mut f = ((y - z) * (y + z) + (g - h) * (g + h)) / (2.0 * h * y);
            g = pythag(f, 1.0);
            f = ((x - z) * (x + z) + h * ((y / (f + sign(g, f))) - h)) / x;

            let mut c = 1.0;
            let mut s = 1.0;
            for j in l_found..=nm2 {
                let i = j + 1;
                let mut g_ = rv1[i];
                let y_ = w[i];
                let h_ = s * g_;
                g_ = c * g_;
                let z_ = pythag(f, h_);
                rv1[j] = z_;
                c = f / z_;
                s = h_ / z_;
                f = x * c + g_ * s;
                g_ = g_ * c - x * s;
                let h2 = y_ * s;
                let y2 = y_ * c;
                for jj in 0..n {
                    let xx = v[[jj, j]];
                    let zz = v[[jj, i]];
                    v[[jj, j]] = xx * c + zz * s;
                    v[[jj, i]] = zz * c - xx * s;
                }
                let z2 = pythag(f, h2);
                w[j] = z2;
                if z2 != 0.0 {
                    let z2_inv = 1.0 / z2;
                    c = f * z2_inv;
                    s = h2 * z2_inv;
                }
                f = c * g_ + s * y2;
                let x2 = c * y2 - s * g_;
                for jj in 0..m {
                    let yy = a[[jj, j]];
                    let zz = a[[jj, i]];
                    a[[jj, j]] = yy * c + zz * s;
                    a[[jj, i]] = zz * c - yy * s;
                }
                rv1[l_found] = 0.0;
                rv1[k] = f;
                w[k] = x2;
            }
        }
    }

    Ok(SvdDecomposition { u: a, v, w })
}

/// Back-substitute `A x = b` given the decomposition, zeroing singular
/// values below `max(m,n) * w_max * EPS`.
pub fn solve(decomp: &SvdDecomposition, b: &Array1<f64>) -> Array1<f64> {
    let (m, n) = decomp.u.dim();
    let w_max = decomp.w.iter().cloned().fold(0.0, f64::max);
    let tol = (m.max(n) as f64) * w_max * SVD_EPSILON;

    let mut tmp = Array1::<f64>::zeros(n);
    for j in 0..n {
        if decomp.w[j] > tol {
            let mut s = 0.0;
            for i in 0..m {
                s += decomp.u[[i, j]] * b[i];
            }
            tmp[j] = s / decomp.w[j];
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for j in 0..n {
        let mut s = 0.0;
        for k in 0..n {
            s += decomp.v[[j, k]] * tmp[k];
        }
        x[j] = s;
    }
    x
}

/// Moore-Penrose pseudoinverse `pinv(A) = V * W^{-1} * U^T`.
pub fn pinv(decomp: &SvdDecomposition) -> Array2<f64> {
    let (m, n) = decomp.u.dim();
    let w_max = decomp.w.iter().cloned().fold(0.0, f64::max);
    let tol = (m.max(n) as f64) * w_max * SVD_EPSILON;

    let mut result = Array2::<f64>::zeros((n, m));
    for i in 0..n {
        for j in 0..m {
            let mut s = 0.0;
            for k in 0..n {
                if decomp.w[k] > tol {
                    s += decomp.v[[i, k]] * decomp.u[[j, k]] / decomp.w[k];
                }
            }
            result[[i, j]] = s;
        }
    }
    result
}

/// Diagonal of `(A^T A)^-1 = V diag(1/w^2) V^T`, used for the covariance
/// and per-column variance that `LINEAR_decompose` reports.
pub fn covariance(decomp: &SvdDecomposition) -> Array2<f64> {
    let n = decomp.v.ncols();
    let w_max = decomp.w.iter().cloned().fold(0.0, f64::max);
    let tol = (decomp.u.nrows().max(n) as f64) * w_max * SVD_EPSILON;
    let mut covar = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            let mut s = 0.0;
            for k in 0..n {
                if decomp.w[k] > tol {
                    s += decomp.v[[i, k]] * decomp.v[[j, k]] / (decomp.w[k] * decomp.w[k]);
                }
            }
            covar[[i, j]] = s;
        }
    }
    covar
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn recovers_identity_like_system() {
        let a = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let b = array![1.0, 2.0, 3.0];
        let decomp = decompose(a.clone()).unwrap();
        let x = solve(&decomp, &b);
        // Least-squares solution for this exactly-consistent system.
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(x[1], 2.0, epsilon = 1e-8);
    }
}
