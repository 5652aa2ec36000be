// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Numeric primitives: vector helpers, natural cubic splines and the
//! matrix/table loader used throughout the engine.

pub mod matrix;
pub mod special;
pub mod spline;
pub mod vector;

pub use matrix::Matrix;
pub use spline::SplineMode;
