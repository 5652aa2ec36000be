// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Data-only, `serde`-deserialisable configuration structures: slit and
//! filter configuration, per-window configuration and flags. File I/O,
//! CLI parsing and project-file layout live outside this crate; this
//! module only describes the shape once a project loader has produced
//! it, keeping the `*Params` structs serde-derived but file-access-free.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitMethod {
    OpticalDensityFit,
    IntensityFit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisType {
    FwhmNone,
    FwhmCorrection,
    FwhmKurucz,
    FwhmNlFit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinearOffsetMode {
    None,
    /// Offset polynomial normalised by `1/I` (radiance).
    Radiance,
    /// Offset polynomial normalised by `1/I0` (reference).
    Reference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceSelectionMode {
    File,
    AutomaticBySza,
    AutomaticByLatLon,
    ScanBefore,
    ScanAfter,
    ScanInterpolate,
    ScanAverage,
}

/// Decides what happens when spike detection flags a pixel that also
/// belongs to a user-configured sub-window boundary: an explicit,
/// first-class configuration knob rather than an implicit behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpikeHandling {
    /// Leave the row in place with zeroed design-matrix entries.
    LeaveZeroRow,
    /// Shrink the linear system to exclude the spiked pixel entirely.
    ResizeSystem,
}

impl Default for SpikeHandling {
    fn default() -> Self {
        SpikeHandling::LeaveZeroRow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlitType {
    None,
    File,
    Gaussian,
    ErrorFunction,
    InversePolynomial,
    AsymGaussian,
    SuperGaussian,
    Voigt,
    Apodisation,
    ApodisationNbs,
}

/// An enumerated slit-function configuration as it arrives from project
/// configuration, before being resolved into a [`crate::slit::Slit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlitConfig {
    pub slit_type: SlitType,
    pub wavelength_dependent: bool,
    pub param: Option<f64>,
    pub param2: Option<f64>,
    pub param3: Option<f64>,
    pub slit_file: Option<String>,
    pub slit_file2: Option<String>,
    pub slit_file3: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterType {
    None,
    Kaiser,
    Gaussian,
    Boxcar,
    Triangle,
    SavitzkyGolay,
    Binomial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub filter_type: FilterType,
    pub filter_width: usize,
    pub filter_order: usize,
    pub filter_n_times: u32,
    pub kaiser_cutoff: f64,
    pub kaiser_pass_band: f64,
    pub kaiser_tolerance: f64,
    pub fwhm_width: f64,
}

/// Boolean feature flags for one analysis window (`useKurucz`, `useUsamp`,
/// ... in the original `FENO`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WindowFlags {
    pub use_kurucz_ref: bool,
    pub use_kurucz_all: bool,
    pub use_undersampling: bool,
    pub amf_flag: bool,
    pub molecular_correction: bool,
}

/// Static, per-window configuration: everything known before any record
/// is processed. Runtime state (references, fitted results, ...) lives in
/// [`crate::analysis::AnalysisWindow`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    pub name: String,
    pub method: FitMethod,
    pub analysis_type: AnalysisType,
    pub flags: WindowFlags,
    pub linear_offset_mode: LinearOffsetMode,
    pub reference_selection: ReferenceSelectionMode,
    pub slit: SlitConfig,
    pub filter: FilterConfig,
    pub spike_handling: SpikeHandling,
    pub spike_threshold: f64,
    pub spike_max_iterations: u32,
    pub shift_degree: usize,
    pub fwhm_degree: usize,
    pub num_kurucz_windows: usize,
}
