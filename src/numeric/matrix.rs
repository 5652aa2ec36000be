// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Rectangular double matrices with an optional precomputed second
//! derivative buffer, loaded from an ASCII table. Grounded in the original
//! engine's `matrix.c`.

use std::io::{BufRead, BufReader, Read};

use ndarray::{Array1, Array2, Axis};
use thiserror::Error;

use super::spline::{self, SplineError};

#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("failed to read matrix table: {0}")]
    Io(#[from] std::io::Error),
    #[error("matrix table has no data rows")]
    Empty,
    #[error("row {0} has {1} columns, expected {2} (columns must be uniform)")]
    RaggedRow(usize, usize, usize),
    #[error("could not parse a numeric field on row {0}: {1:?}")]
    Parse(usize, String),
    #[error(transparent)]
    Spline(#[from] SplineError),
}

/// A loaded table: the first column is the abscissa (`x`, typically
/// wavelength in nm), the remaining columns are one or more dependent
/// series. `deriv2` holds natural cubic second derivatives per dependent
/// column when requested at load time, for later use by
/// [`crate::numeric::spline`].
#[derive(Debug, Clone)]
pub struct Matrix {
    pub x: Array1<f64>,
    pub y: Array2<f64>,
    pub deriv2: Option<Array2<f64>>,
}

impl Matrix {
    /// Number of rows (samples).
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Number of dependent (`y`) columns.
    pub fn num_columns(&self) -> usize {
        self.y.ncols()
    }

    /// Copy this matrix, optionally (re)computing second derivatives.
    pub fn copy(&self, with_deriv2: bool) -> Result<Matrix, MatrixError> {
        let deriv2 = if with_deriv2 {
            Some(compute_deriv2(&self.x, &self.y)?)
        } else {
            self.deriv2.clone()
        };
        Ok(Matrix {
            x: self.x.clone(),
            y: self.y.clone(),
            deriv2,
        })
    }
}

/// Options controlling how an ASCII table is loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Restrict rows to `x` in `[xmin, xmax]`, if given.
    pub xmin: Option<f64>,
    pub xmax: Option<f64>,
    /// Reverse row order after loading (for descending-wavelength sources).
    pub reverse: bool,
    /// Precompute natural cubic second derivatives for every dependent
    /// column.
    pub precompute_deriv2: bool,
}

/// Load an ASCII table: comment lines start with `*`, `;` or `#`; the
/// column count is autodetected from the first data row and every
/// subsequent row must match it.
pub fn load_ascii<R: Read>(reader: R, opts: LoadOptions) -> Result<Matrix, MatrixError> {
    let reader = BufReader::new(reader);
    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut expected_cols: Option<usize> = None;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(['*', ';', '#']) {
            continue;
        }
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let cols = *expected_cols.get_or_insert(fields.len());
        if fields.len() != cols {
            return Err(MatrixError::RaggedRow(lineno, fields.len(), cols));
        }
        let mut row = Vec::with_capacity(cols);
        for f in fields {
            row.push(
                f.parse::<f64>()
                    .map_err(|_| MatrixError::Parse(lineno, f.to_string()))?,
            );
        }
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(MatrixError::Empty);
    }

    if opts.xmin.is_some() || opts.xmax.is_some() {
        let lo = opts.xmin.unwrap_or(f64::NEG_INFINITY);
        let hi = opts.xmax.unwrap_or(f64::INFINITY);
        rows.retain(|r| r[0] >= lo && r[0] <= hi);
        if rows.is_empty() {
            return Err(MatrixError::Empty);
        }
    }

    if opts.reverse {
        rows.reverse();
    }

    let ncols = rows[0].len();
    let nrows = rows.len();
    let mut x = Array1::zeros(nrows);
    let mut y = Array2::zeros((nrows, ncols - 1));
    for (i, row) in rows.iter().enumerate() {
        x[i] = row[0];
        for (j, &v) in row[1..].iter().enumerate() {
            y[[i, j]] = v;
        }
    }

    let deriv2 = if opts.precompute_deriv2 {
        Some(compute_deriv2(&x, &y)?)
    } else {
        None
    };

    Ok(Matrix { x, y, deriv2 })
}

fn compute_deriv2(x: &Array1<f64>, y: &Array2<f64>) -> Result<Array2<f64>, MatrixError> {
    let mut deriv2 = Array2::zeros(y.raw_dim());
    let xs = x.as_slice().expect("contiguous");
    for (col, mut out_col) in y.axis_iter(Axis(1)).zip(deriv2.axis_iter_mut(Axis(1))) {
        let ys = col.to_vec();
        let d2 = spline::deriv2(xs, &ys)?;
        for (o, v) in out_col.iter_mut().zip(d2) {
            *o = v;
        }
    }
    Ok(deriv2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Cursor;

    #[test]
    fn loads_comments_and_autodetects_columns() {
        let text = "\
* comment line
; another comment
# yet another
300.0 1.0 2.0
301.0 1.1 2.2
302.0 1.2 2.4
";
        let m = load_ascii(Cursor::new(text), LoadOptions::default()).unwrap();
        assert_eq!(m.len(), 3);
        assert_eq!(m.num_columns(), 2);
        assert_abs_diff_eq!(m.x[1], 301.0);
        assert_abs_diff_eq!(m.y[[2, 1]], 2.4);
    }

    #[test]
    fn rejects_ragged_rows() {
        let text = "300.0 1.0\n301.0 1.0 2.0\n";
        let err = load_ascii(Cursor::new(text), LoadOptions::default()).unwrap_err();
        assert!(matches!(err, MatrixError::RaggedRow(..)));
    }

    #[test]
    fn restricts_to_xrange_and_reverses() {
        let text = "300.0 1.0\n301.0 2.0\n302.0 3.0\n303.0 4.0\n";
        let opts = LoadOptions {
            xmin: Some(301.0),
            xmax: Some(302.0),
            reverse: true,
            ..Default::default()
        };
        let m = load_ascii(Cursor::new(text), opts).unwrap();
        assert_eq!(m.len(), 2);
        assert_abs_diff_eq!(m.x[0], 302.0);
        assert_abs_diff_eq!(m.x[1], 301.0);
    }

    #[test]
    fn precomputes_second_derivatives() {
        let text = "0 0\n1 1\n2 4\n3 9\n4 16\n";
        let opts = LoadOptions {
            precompute_deriv2: true,
            ..Default::default()
        };
        let m = load_ascii(Cursor::new(text), opts).unwrap();
        assert!(m.deriv2.is_some());
    }
}
