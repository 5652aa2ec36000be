// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Numerical core of a Differential Optical Absorption Spectroscopy (DOAS)
//! retrieval engine.
//!
//! Given one measured spectrum, a reference spectrum, a configured set of
//! absorption cross sections and a wavelength-calibration context, this
//! crate solves the DOAS equation for the slant column densities of each
//! absorber together with nuisance parameters (wavelength shift/stretch,
//! instrumental offset, spectral resolution drift, undersampling,
//! Raman/Ring). Instrument readers, output writers, CLI and project
//! configuration loading live outside this crate.

pub mod analysis;
pub mod cancel;
pub mod config;
pub mod constants;
pub mod cross_section;
pub mod curfit;
pub mod error;
pub mod filters;
pub mod fit_properties;
pub mod forward_model;
pub mod kurucz;
pub mod linear;
pub mod logging;
pub mod numeric;
pub mod slit;
pub mod spectral_range;
pub mod workspace;

pub use error::EngineError;
